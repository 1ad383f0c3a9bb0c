//! The capture-classify loop.
//!
//! Each iteration is self-contained: acquire one window, assemble and
//! extract, submit, alert, then throw everything away and wait. Nothing that
//! goes wrong inside an iteration stops the loop; only the stop flag or an
//! exhausted source does, and both are checked between iterations.

use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, error, info, info_span, warn};

use crate::{
    alert::{Alert, AlertSink, AttackLabels},
    assemble::{assemble, DropReason},
    batch::FeatureBatch,
    capture::{CaptureError, PacketSource},
    classify::Classifier,
    features::{extract, ExtractConfig, Schema},
    key::{FlowKey, Keyer, RejectCounts},
    metrics::MetricsSink,
    record::PacketRecord,
};

/// Granularity at which the inter-cycle delay notices a stop request.
const STOP_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct CycleConfig {
    pub window: Duration,
    pub delay: Duration,
    pub extract: ExtractConfig,
    pub schema: Schema,
    pub require_tcp: bool,
    pub max_cycles: Option<u64>,
}

/// Features for one window, plus what was left out and why.
#[derive(Debug, Clone)]
pub struct WindowFeatures {
    pub batch: FeatureBatch,
    pub packets: usize,
    pub rejected: RejectCounts,
    pub dropped: Vec<(FlowKey, DropReason)>,
}

/// Runs keying, assembly and extraction over one window's packets.
pub fn extract_window(
    packets: Vec<PacketRecord>,
    keyer: Keyer,
    config: &ExtractConfig,
    schema: Schema,
) -> WindowFeatures {
    let total = packets.len();
    let assembly = assemble(keyer, packets);
    let mut batch = FeatureBatch::new(schema);
    batch.rows = assembly.flows.iter().map(|flow| extract(flow, config)).collect();
    for (key, reason) in &assembly.dropped {
        debug!(flow = %key, %reason, "flow dropped");
    }
    WindowFeatures {
        batch,
        packets: total,
        rejected: assembly.rejected,
        dropped: assembly.dropped,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Submitted,
    EmptyBatch,
    CaptureFailed(String),
    SubmissionFailed(String),
    SourceExhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub window: u64,
    pub packets: usize,
    pub rejected: RejectCounts,
    pub flows: usize,
    pub dropped: usize,
    pub predictions: usize,
    pub triggered: BTreeSet<String>,
    pub outcome: CycleOutcome,
}

impl CycleReport {
    fn new(window: u64, outcome: CycleOutcome) -> Self {
        Self {
            window,
            packets: 0,
            rejected: RejectCounts::default(),
            flows: 0,
            dropped: 0,
            predictions: 0,
            triggered: BTreeSet::new(),
            outcome,
        }
    }
}

pub struct CaptureCycle<S, C> {
    source: S,
    classifier: C,
    alerters: Vec<Box<dyn AlertSink>>,
    attack: AttackLabels,
    metrics: Arc<dyn MetricsSink + Send + Sync>,
    config: CycleConfig,
    keyer: Keyer,
    seq: u64,
}

impl<S: PacketSource, C: Classifier> CaptureCycle<S, C> {
    pub fn new(
        source: S,
        classifier: C,
        metrics: Arc<dyn MetricsSink + Send + Sync>,
        config: CycleConfig,
    ) -> Self {
        Self {
            source,
            classifier,
            alerters: Vec::new(),
            attack: AttackLabels::default(),
            metrics,
            keyer: Keyer::new(config.extract.direction, config.require_tcp),
            config,
            seq: 0,
        }
    }

    pub fn with_attack_labels(mut self, attack: AttackLabels) -> Self {
        self.attack = attack;
        self
    }

    pub fn with_alerter(mut self, alerter: Box<dyn AlertSink>) -> Self {
        self.alerters.push(alerter);
        self
    }

    /// Processes one capture window end to end.
    pub fn run_once(&mut self) -> CycleReport {
        self.seq += 1;
        let seq = self.seq;
        let span = info_span!("window", seq);
        let _enter = span.enter();

        info!(source = %self.source.describe(), "capturing {:?} of traffic", self.config.window);
        let packets = match self.source.acquire(self.config.window) {
            Ok(packets) => packets,
            Err(CaptureError::Exhausted) => {
                info!("packet source exhausted");
                return CycleReport::new(seq, CycleOutcome::SourceExhausted);
            }
            Err(e) => {
                warn!(error = %e, "capture failed, skipping window");
                self.metrics.record_window(0, 0);
                return CycleReport::new(seq, CycleOutcome::CaptureFailed(e.to_string()));
            }
        };

        let features = extract_window(packets, self.keyer, &self.config.extract, self.config.schema);
        self.metrics
            .record_window(features.rejected.total(), features.dropped.len());
        info!(
            packets = features.packets,
            rejected = features.rejected.total(),
            flows = features.batch.len(),
            dropped = features.dropped.len(),
            "window assembled"
        );

        let mut report = CycleReport {
            packets: features.packets,
            rejected: features.rejected,
            flows: features.batch.len(),
            dropped: features.dropped.len(),
            ..CycleReport::new(seq, CycleOutcome::EmptyBatch)
        };
        if features.batch.is_empty() {
            info!("no complete flows, nothing to classify");
            return report;
        }

        self.metrics.record_submission();
        let predictions = match self.classifier.classify(&features.batch) {
            Ok(predictions) => predictions,
            Err(e) => {
                self.metrics.record_error();
                error!(error = %e, "submission failed");
                report.outcome = CycleOutcome::SubmissionFailed(e.to_string());
                return report;
            }
        };
        self.metrics.record_success();
        self.metrics.record_labels(&predictions);
        report.predictions = predictions.len();
        report.outcome = CycleOutcome::Submitted;

        let (triggered, rows) = self.attack.triggered(&predictions);
        if !triggered.is_empty() {
            let alert = Alert::new(triggered.clone(), rows, seq);
            for alerter in &self.alerters {
                if let Err(e) = alerter.alert(&alert) {
                    error!(error = %e, "failed to deliver alert");
                }
            }
        }
        report.triggered = triggered;
        report
    }

    /// Loops until `stop` is set, the source runs dry, or `max_cycles` is
    /// reached. Returns the number of windows processed.
    pub fn run(&mut self, stop: &AtomicBool) -> u64 {
        let mut cycles = 0;
        while !stop.load(Ordering::SeqCst) {
            let report = self.run_once();
            if report.outcome == CycleOutcome::SourceExhausted {
                break;
            }
            cycles += 1;
            if self.config.max_cycles.map_or(false, |max| cycles >= max) {
                break;
            }
            self.pause(stop);
        }
        cycles
    }

    fn pause(&self, stop: &AtomicBool) {
        let deadline = Instant::now() + self.config.delay;
        loop {
            let now = Instant::now();
            if now >= deadline || stop.load(Ordering::SeqCst) {
                return;
            }
            thread::sleep(STOP_POLL.min(deadline - now));
        }
    }
}
