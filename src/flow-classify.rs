use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};

use flowclass::{
    alert::{AttackLabels, LogAlerter, WebhookAlerter},
    capture::{FileFormat, FileSource, PacketSource, PcapSource},
    classify::HttpClassifier,
    cli::{init_logging, parse_secs, ExtractArgs},
    cycle::{CaptureCycle, CycleConfig},
    metrics::{serve_metrics, Counters},
    tshark::TsharkSource,
};

#[derive(Parser)]
#[clap(
    name = "flow-classify",
    version,
    about = "Capture traffic in windows, extract flow features and classify them"
)]
struct Opts {
    #[clap(subcommand)]
    source: SourceCmd,
    #[clap(flatten)]
    extract: ExtractArgs,
    /// Length of one capture window, in seconds
    #[clap(long, default_value = "10", parse(try_from_str = parse_secs))]
    window: Duration,
    /// Pause between windows, in seconds
    #[clap(long, default_value = "10", parse(try_from_str = parse_secs))]
    delay: Duration,
    /// Extra seconds a capture may overrun its window before it is killed
    #[clap(long, default_value = "15", parse(try_from_str = parse_secs))]
    capture_timeout: Duration,
    #[clap(long, default_value = "http://localhost:5000/predict")]
    classifier_url: String,
    /// Request timeout for the classifier and alert webhook, in seconds
    #[clap(long, default_value = "30", parse(try_from_str = parse_secs))]
    classifier_timeout: Duration,
    /// Label that raises an alert; repeat for several. Defaults to
    /// DoS, Web Attack, Brute Force and U2R
    #[clap(long = "attack-label")]
    attack_labels: Vec<String>,
    /// POST alerts as JSON to this URL, in addition to logging them
    #[clap(long)]
    alert_webhook: Option<String>,
    /// Stop after this many windows
    #[clap(long)]
    max_cycles: Option<u64>,
    /// Serve Prometheus counters on http://<addr>/metrics
    #[clap(long)]
    metrics_addr: Option<SocketAddr>,
    /// Directory for temporary capture and feature files
    #[clap(long)]
    work_dir: Option<PathBuf>,
    #[clap(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum SourceCmd {
    /// Capture with tshark
    Tshark {
        #[clap(short, long)]
        interface: String,
        #[clap(long, default_value = "tshark")]
        tshark_bin: PathBuf,
    },
    /// Capture with libpcap
    Pcap {
        #[clap(short, long)]
        device: String,
    },
    /// Push a saved capture (tshark JSON or pcap) through as a single window
    Replay { file: PathBuf },
}

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    init_logging(opts.verbose);

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))
            .context("not able to set ctrl-c handler")?;
    }

    let work_dir = opts.work_dir.clone().unwrap_or_else(std::env::temp_dir);
    let source: Box<dyn PacketSource> = match &opts.source {
        SourceCmd::Tshark {
            interface,
            tshark_bin,
        } => Box::new(
            TsharkSource::new(tshark_bin, interface, &work_dir, opts.capture_timeout)
                .context("cannot start tshark capture")?,
        ),
        SourceCmd::Pcap { device } => {
            Box::new(PcapSource::new(device).context("cannot open capture device")?)
        }
        SourceCmd::Replay { file } => Box::new(
            FileSource::new(file, FileFormat::guess(file)).context("cannot open capture file")?,
        ),
    };

    let classifier = HttpClassifier::new(&opts.classifier_url, opts.classifier_timeout, &work_dir)
        .context("cannot build classifier client")?;
    let attack = if opts.attack_labels.is_empty() {
        AttackLabels::default()
    } else {
        AttackLabels::new(opts.attack_labels.iter().cloned())
    };
    let counters = Arc::new(
        Counters::with_known_labels(attack.iter()).context("cannot register metrics")?,
    );
    let _metrics_server = match opts.metrics_addr {
        Some(addr) => Some(
            serve_metrics(addr, counters.registry().clone())
                .context("cannot start metrics endpoint")?,
        ),
        None => None,
    };

    let config = CycleConfig {
        window: opts.window,
        delay: opts.delay,
        extract: opts.extract.extract_config(),
        schema: opts.extract.schema(),
        require_tcp: opts.extract.require_tcp(),
        max_cycles: opts.max_cycles,
    };
    info!(
        classifier = classifier.url(),
        direction = ?config.extract.direction,
        window = ?config.window,
        "starting continuous capture and classification"
    );

    let mut cycle = CaptureCycle::new(source, classifier, counters.clone(), config)
        .with_attack_labels(attack)
        .with_alerter(Box::new(LogAlerter));
    if let Some(url) = &opts.alert_webhook {
        let webhook = WebhookAlerter::new(url, opts.classifier_timeout)
            .context("cannot build alert webhook client")?;
        cycle = cycle.with_alerter(Box::new(webhook));
    }

    let cycles = cycle.run(&stop);
    info!(
        cycles,
        predictions = counters.predictions(),
        errors = counters.errors(),
        "stopped"
    );
    match counters.render() {
        Ok(text) => debug!("final counters:\n{text}"),
        Err(e) => warn!(error = %e, "failed to render final counters"),
    }
    Ok(())
}
