//! Client for the external classification service.
//!
//! The service takes the feature table as a multipart file upload (field
//! `file`) and answers with `{"results": [{"prediction", "label"}], "status"}`
//! or `{"error": ".."}`. A 400 means the table was refused (usually missing
//! feature columns), anything else non-2xx is a server-side failure.

use std::{io, path::PathBuf, time::Duration};

use reqwest::{
    blocking::{multipart::Form, Client},
    StatusCode,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::batch::{BatchError, FeatureBatch};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prediction {
    pub prediction: i64,
    pub label: String,
}

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("classifier unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("classifier rejected the batch: {0}")]
    Rejected(String),
    #[error("classifier failed with status {status}: {message}")]
    Server { status: u16, message: String },
    #[error("unreadable classifier response: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

pub trait Classifier {
    fn classify(&self, batch: &FeatureBatch) -> Result<Vec<Prediction>, ClassifyError>;
}

impl<C: Classifier + ?Sized> Classifier for Box<C> {
    fn classify(&self, batch: &FeatureBatch) -> Result<Vec<Prediction>, ClassifyError> {
        (**self).classify(batch)
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Envelope {
    Success {
        results: Vec<Prediction>,
        #[serde(default)]
        status: Option<String>,
    },
    Failure {
        error: String,
    },
}

/// Interprets a classifier reply.
pub fn parse_response(status: u16, body: &str) -> Result<Vec<Prediction>, ClassifyError> {
    let envelope = serde_json::from_str::<Envelope>(body);
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    if status.is_success() {
        return match envelope? {
            Envelope::Success {
                results,
                status: reported,
            } => {
                if let Some(reported) = reported.filter(|s| s != "success") {
                    debug!(status = %reported, "unexpected classifier status field");
                }
                Ok(results)
            }
            Envelope::Failure { error } => Err(ClassifyError::Server {
                status: status.as_u16(),
                message: error,
            }),
        };
    }

    let message = match envelope {
        Ok(Envelope::Failure { error }) => error,
        _ => body.trim().chars().take(200).collect(),
    };
    if status == StatusCode::BAD_REQUEST {
        Err(ClassifyError::Rejected(message))
    } else {
        Err(ClassifyError::Server {
            status: status.as_u16(),
            message,
        })
    }
}

/// Uploads the batch over HTTP.
pub struct HttpClassifier {
    client: Client,
    url: String,
    work_dir: PathBuf,
}

impl HttpClassifier {
    pub fn new(
        url: impl Into<String>,
        timeout: Duration,
        work_dir: impl Into<PathBuf>,
    ) -> Result<Self, ClassifyError> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            url: url.into(),
            work_dir: work_dir.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Classifier for HttpClassifier {
    fn classify(&self, batch: &FeatureBatch) -> Result<Vec<Prediction>, ClassifyError> {
        // deleted when `table` goes out of scope, whether or not the upload
        // worked
        let table = batch.to_temp_file(&self.work_dir)?;
        let form = Form::new().file("file", table.path())?;

        let response = self.client.post(&self.url).multipart(form).send()?;
        let status = response.status();
        let body = response.text()?;

        let predictions = parse_response(status.as_u16(), &body)?;
        if predictions.len() != batch.len() {
            warn!(
                rows = batch.len(),
                predictions = predictions.len(),
                "classifier returned a different number of predictions than rows"
            );
        }
        Ok(predictions)
    }
}
