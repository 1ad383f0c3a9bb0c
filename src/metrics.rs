//! Process-wide counters on a Prometheus registry, and the `/metrics`
//! endpoint that serves them.

use std::{
    io,
    net::{SocketAddr, TcpListener},
    thread::{self, JoinHandle},
};

use axum::{extract::State, http::StatusCode, routing::get, Router};
use prometheus::{IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::classify::Prediction;

const NAMESPACE: &str = "flowclass";

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus: {0}")]
    Prometheus(#[from] prometheus::Error),
    #[error("cannot bind metrics endpoint {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

pub trait MetricsSink {
    /// A batch was handed to the classifier.
    fn record_submission(&self);
    fn record_success(&self);
    fn record_error(&self);
    fn record_labels(&self, predictions: &[Prediction]);
    /// A capture window was processed, successfully or not.
    fn record_window(&self, rejected_packets: usize, dropped_flows: usize);
}

/// Created once at startup and shared by reference; never reset.
pub struct Counters {
    registry: Registry,
    predictions: IntCounter,
    successes: IntCounter,
    errors: IntCounter,
    windows: IntCounter,
    packets_rejected: IntCounter,
    flows_dropped: IntCounter,
    labels: IntCounterVec,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, MetricsError> {
    let counter = IntCounter::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl Counters {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();
        let labels = IntCounterVec::new(
            Opts::new("prediction_label_total", "Total predictions per label").namespace(NAMESPACE),
            &["label"],
        )?;
        registry.register(Box::new(labels.clone()))?;

        Ok(Self {
            predictions: counter(&registry, "predictions_total", "Total prediction requests")?,
            successes: counter(&registry, "success_total", "Successful predictions")?,
            errors: counter(&registry, "errors_total", "Failed predictions")?,
            windows: counter(&registry, "windows_total", "Capture windows processed")?,
            packets_rejected: counter(
                &registry,
                "packets_rejected_total",
                "Packets rejected at ingestion",
            )?,
            flows_dropped: counter(
                &registry,
                "flows_dropped_total",
                "Flows dropped for having too few packets",
            )?,
            labels,
            registry,
        })
    }

    /// Registers labels at zero so they show up before the first hit.
    pub fn with_known_labels<I, S>(labels: I) -> Result<Self, MetricsError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let counters = Self::new()?;
        for label in labels {
            counters.labels.with_label_values(&[label.as_ref()]);
        }
        Ok(counters)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn predictions(&self) -> u64 {
        self.predictions.get()
    }

    pub fn successes(&self) -> u64 {
        self.successes.get()
    }

    pub fn errors(&self) -> u64 {
        self.errors.get()
    }

    pub fn windows(&self) -> u64 {
        self.windows.get()
    }

    pub fn label(&self, label: &str) -> u64 {
        self.labels.with_label_values(&[label]).get()
    }

    pub fn render(&self) -> Result<String, MetricsError> {
        Ok(TextEncoder::new().encode_to_string(&self.registry.gather())?)
    }
}

impl MetricsSink for Counters {
    fn record_submission(&self) {
        self.predictions.inc();
    }

    fn record_success(&self) {
        self.successes.inc();
    }

    fn record_error(&self) {
        self.errors.inc();
    }

    fn record_labels(&self, predictions: &[Prediction]) {
        for prediction in predictions {
            self.labels
                .with_label_values(&[prediction.label.as_str()])
                .inc();
        }
    }

    fn record_window(&self, rejected_packets: usize, dropped_flows: usize) {
        self.windows.inc();
        self.packets_rejected.inc_by(rejected_packets as u64);
        self.flows_dropped.inc_by(dropped_flows as u64);
    }
}

/// An HTTP server running on its own thread with a single-threaded runtime.
/// Lives until the process exits.
pub struct HttpServer {
    addr: SocketAddr,
    _thread: JoinHandle<()>,
}

impl HttpServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

/// Serves `app` on an already bound listener from a background thread.
pub(crate) fn spawn_server(
    listener: TcpListener,
    app: Router,
    name: &str,
) -> Result<HttpServer, MetricsError> {
    let addr = listener.local_addr()?;
    listener.set_nonblocking(true)?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let thread = thread::Builder::new().name(name.to_string()).spawn(move || {
        let served = runtime.block_on(async move {
            let listener = tokio::net::TcpListener::from_std(listener)?;
            axum::serve(listener, app).await
        });
        if let Err(e) = served {
            error!(error = %e, "http server stopped");
        }
    })?;
    Ok(HttpServer {
        addr,
        _thread: thread,
    })
}

async fn metrics_handler(State(registry): State<Registry>) -> (StatusCode, String) {
    match TextEncoder::new().encode_to_string(&registry.gather()) {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to encode metrics: {e}"),
            )
        }
    }
}

/// Exposes `registry` in the Prometheus text format at `http://<addr>/metrics`.
pub fn serve_metrics(addr: SocketAddr, registry: Registry) -> Result<HttpServer, MetricsError> {
    let listener = TcpListener::bind(addr).map_err(|source| MetricsError::Bind { addr, source })?;
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(registry)
        .layer(TraceLayer::new_for_http());
    let server = spawn_server(listener, app, "metrics")?;
    info!(addr = %server.local_addr(), "serving metrics on /metrics");
    Ok(server)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn predicted(label: &str) -> Prediction {
        Prediction {
            prediction: 0,
            label: label.to_string(),
        }
    }

    #[test]
    fn counts_labels() {
        let counters = Counters::with_known_labels(["BENIGN", "DoS"]).unwrap();
        counters.record_labels(&[predicted("DoS"), predicted("DoS"), predicted("U2R")]);
        assert_eq!(counters.label("DoS"), 2);
        assert_eq!(counters.label("U2R"), 1);
        assert_eq!(counters.label("BENIGN"), 0);
        assert_eq!(counters.label("never"), 0);
    }

    #[test]
    fn renders_exposition() {
        let counters = Counters::with_known_labels(["BENIGN"]).unwrap();
        counters.record_submission();
        counters.record_success();
        counters.record_window(3, 1);
        counters.record_labels(&[predicted("Web \"Attack\"")]);

        let text = counters.render().unwrap();
        assert!(text.contains("# TYPE flowclass_predictions_total counter\n"));
        assert!(text.contains("flowclass_predictions_total 1\n"));
        assert!(text.contains("flowclass_errors_total 0\n"));
        assert!(text.contains("flowclass_packets_rejected_total 3\n"));
        assert!(text.contains("flowclass_flows_dropped_total 1\n"));
        assert!(text.contains("flowclass_prediction_label_total{label=\"BENIGN\"} 0\n"));
        assert!(text.contains("flowclass_prediction_label_total{label=\"Web \\\"Attack\\\"\"} 1\n"));
    }

    #[test]
    fn shared_across_threads() {
        let counters = std::sync::Arc::new(Counters::new().unwrap());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counters = counters.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        counters.record_error();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counters.errors(), 400);
    }

    #[test]
    fn endpoint_serves_registry() {
        let counters = Counters::with_known_labels(["DoS"]).unwrap();
        counters.record_submission();
        counters.record_labels(&[predicted("DoS")]);

        let server = serve_metrics("127.0.0.1:0".parse().unwrap(), counters.registry().clone())
            .unwrap();
        let base = format!("http://{}", server.local_addr());

        let response = reqwest::blocking::get(format!("{base}/metrics")).unwrap();
        assert_eq!(response.status().as_u16(), 200);
        let body = response.text().unwrap();
        assert!(body.contains("flowclass_predictions_total 1\n"));
        assert!(body.contains("flowclass_prediction_label_total{label=\"DoS\"} 1\n"));

        // later increments show up on the next scrape
        counters.record_submission();
        let body = reqwest::blocking::get(format!("{base}/metrics"))
            .unwrap()
            .text()
            .unwrap();
        assert!(body.contains("flowclass_predictions_total 2\n"));

        let missing = reqwest::blocking::get(format!("{base}/other")).unwrap();
        assert_eq!(missing.status().as_u16(), 404);
    }

    #[test]
    fn bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();
        let registry = Counters::new().unwrap().registry().clone();
        assert!(matches!(
            serve_metrics(addr, registry),
            Err(MetricsError::Bind { .. })
        ));
    }
}
