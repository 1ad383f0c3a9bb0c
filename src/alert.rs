//! Alerting when the classifier reports attack traffic.

use std::{collections::BTreeSet, time::Duration};

use reqwest::blocking::Client;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::classify::Prediction;

pub const DEFAULT_ATTACK_LABELS: [&str; 4] = ["DoS", "Web Attack", "Brute Force", "U2R"];

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("alert delivery failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("alert endpoint answered {0}")]
    Status(u16),
}

/// Labels that count as an attack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttackLabels(BTreeSet<String>);

impl Default for AttackLabels {
    fn default() -> Self {
        Self::new(DEFAULT_ATTACK_LABELS)
    }
}

impl AttackLabels {
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(labels.into_iter().map(Into::into).collect())
    }

    pub fn contains(&self, label: &str) -> bool {
        self.0.contains(label)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Distinct attack labels among `predictions`, and how many rows had one.
    pub fn triggered(&self, predictions: &[Prediction]) -> (BTreeSet<String>, usize) {
        let mut labels = BTreeSet::new();
        let mut rows = 0;
        for p in predictions.iter().filter(|p| self.contains(&p.label)) {
            rows += 1;
            labels.insert(p.label.clone());
        }
        (labels, rows)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alert {
    pub title: String,
    pub labels: BTreeSet<String>,
    /// Rows classified as an attack.
    pub flows: usize,
    /// Capture window sequence number.
    pub window: u64,
}

impl Alert {
    pub fn new(labels: BTreeSet<String>, flows: usize, window: u64) -> Self {
        Self {
            title: "Intrusion alert".to_string(),
            labels,
            flows,
            window,
        }
    }

    pub fn summary(&self) -> String {
        let labels: Vec<&str> = self.labels.iter().map(String::as_str).collect();
        format!(
            "Suspicious activity detected in window {}: {} flow(s), attack types: {}",
            self.window,
            self.flows,
            labels.join(", ")
        )
    }
}

pub trait AlertSink {
    fn alert(&self, alert: &Alert) -> Result<(), AlertError>;
}

impl<A: AlertSink + ?Sized> AlertSink for Box<A> {
    fn alert(&self, alert: &Alert) -> Result<(), AlertError> {
        (**self).alert(alert)
    }
}

/// Writes the alert to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlerter;

impl AlertSink for LogAlerter {
    fn alert(&self, alert: &Alert) -> Result<(), AlertError> {
        warn!(window = alert.window, flows = alert.flows, "{}", alert.summary());
        Ok(())
    }
}

/// POSTs the alert as JSON.
pub struct WebhookAlerter {
    client: Client,
    url: String,
}

impl WebhookAlerter {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, AlertError> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            url: url.into(),
        })
    }
}

impl AlertSink for WebhookAlerter {
    fn alert(&self, alert: &Alert) -> Result<(), AlertError> {
        let response = self.client.post(&self.url).json(alert).send()?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(AlertError::Status(response.status().as_u16()))
        }
    }
}
