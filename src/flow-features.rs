use std::{io, path::PathBuf};

use anyhow::Context;
use clap::{ArgEnum, Parser};
use tracing::info;

use flowclass::{
    capture::{FileFormat, FileSource},
    cli::{init_logging, ExtractArgs},
    cycle::extract_window,
    key::Keyer,
};

#[derive(Debug, Clone, Copy, ArgEnum)]
enum FormatArg {
    Pcap,
    Json,
}

#[derive(Parser)]
#[clap(
    name = "flow-features",
    version,
    about = "Turn a saved capture into a flow feature table"
)]
struct Opts {
    /// tshark `-T json` output or a pcap file
    input: PathBuf,
    /// Write the table here instead of stdout
    #[clap(short, long)]
    output: Option<PathBuf>,
    /// Input format; guessed from the extension when omitted
    #[clap(long, arg_enum)]
    format: Option<FormatArg>,
    #[clap(flatten)]
    extract: ExtractArgs,
    #[clap(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    init_logging(opts.verbose);

    let format = match opts.format {
        Some(FormatArg::Pcap) => FileFormat::Pcap,
        Some(FormatArg::Json) => FileFormat::TsharkJson,
        None => FileFormat::guess(&opts.input),
    };
    let source = FileSource::new(&opts.input, format).context("cannot open capture file")?;
    let packets = source
        .read()
        .with_context(|| format!("failed to read {}", opts.input.display()))?;

    let keyer = Keyer::new(opts.extract.direction_mode.into(), opts.extract.require_tcp());
    let features = extract_window(
        packets,
        keyer,
        &opts.extract.extract_config(),
        opts.extract.schema(),
    );
    info!(
        packets = features.packets,
        rejected = features.rejected.total(),
        flows = features.batch.len(),
        dropped = features.dropped.len(),
        "extracted features"
    );

    match &opts.output {
        Some(path) => features
            .batch
            .save(path)
            .with_context(|| format!("failed to write {}", path.display()))?,
        None => features
            .batch
            .write_csv(io::stdout().lock())
            .context("failed to write to stdout")?,
    }
    Ok(())
}
