//! Devices that accept committed configuration documents.

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;

use xconnect_types::{CommitOp, ConfigDocument};

/// Errors raised by a device while applying a transaction.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("device rejected transaction with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("{0}")]
    Other(String),
}

/// The dataplane agent that receives one document per traversal.
#[async_trait]
pub trait Device: Send + Sync {
    async fn commit(&self, op: CommitOp, document: &ConfigDocument) -> Result<(), DeviceError>;
}

// ---------------------------------------------------------------------------
// HttpDevice
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct Transaction<'a> {
    op: CommitOp,
    config: &'a ConfigDocument,
}

/// Posts transactions as JSON to `<base_url>/v1/transactions`.
pub struct HttpDevice {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDevice {
    /// No request timeout is set; callers bound the whole traversal instead.
    pub fn new(base_url: impl Into<String>) -> Result<Self, DeviceError> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    pub fn endpoint(&self) -> String {
        format!("{}/v1/transactions", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl Device for HttpDevice {
    async fn commit(&self, op: CommitOp, document: &ConfigDocument) -> Result<(), DeviceError> {
        let url = self.endpoint();
        tracing::debug!(%url, %op, "Posting transaction");

        let response = self
            .client
            .post(&url)
            .json(&Transaction {
                op,
                config: document,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeviceError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RecordingDevice
// ---------------------------------------------------------------------------

/// Keeps every transaction in memory instead of applying it. Used for dry runs.
#[derive(Debug, Default)]
pub struct RecordingDevice {
    transactions: Mutex<Vec<(CommitOp, ConfigDocument)>>,
}

impl RecordingDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn transactions(&self) -> Vec<(CommitOp, ConfigDocument)> {
        self.transactions.lock().await.clone()
    }

    pub async fn last(&self) -> Option<(CommitOp, ConfigDocument)> {
        self.transactions.lock().await.last().cloned()
    }
}

#[async_trait]
impl Device for RecordingDevice {
    async fn commit(&self, op: CommitOp, document: &ConfigDocument) -> Result<(), DeviceError> {
        self.transactions.lock().await.push((op, document.clone()));
        Ok(())
    }
}
