//! Catch-up reconciliation.
//!
//! At startup a downstream service asks the owning service for every item
//! changed since its watermark, upserts them into the search index and moves
//! the watermark forward. The upstream may not be up yet, so retryable
//! failures are retried at a fixed interval until they succeed or shutdown is
//! signalled. Applying the same items twice changes nothing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::consumers::SearchIndex;
use crate::event::ItemPayload;
use crate::shutdown::ShutdownSignal;
use crate::storage::StorageError;

mod http;
mod watermark;

pub use http::HttpItemSource;
pub use watermark::WatermarkStore;

/// Why a fetch failed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FetchError {
    #[error("Retryable fetch failure: {0}")]
    Retryable(String),

    #[error("Fatal fetch failure: {0}")]
    Fatal(String),
}

/// Errors that end a reconciliation run.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("Upstream rejected the request: {0}")]
    Fatal(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
}

/// Where reconciliation reads items from.
#[async_trait]
pub trait ItemSource: Send + Sync {
    /// Items changed strictly after `since`; all items when `None`.
    async fn items_since(&self, since: Option<DateTime<Utc>>)
        -> Result<Vec<ItemPayload>, FetchError>;
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    Applied {
        /// Items received from the upstream.
        count: usize,
        /// Watermark after the run.
        watermark: Option<DateTime<Utc>>,
    },
    Cancelled,
}

/// Pulls missed items into the search index.
pub struct Reconciler {
    name: String,
    source: Arc<dyn ItemSource>,
    index: SearchIndex,
    watermarks: WatermarkStore,
    retry_interval: Duration,
}

impl Reconciler {
    /// `name` keys the watermark row.
    pub fn new(
        name: impl Into<String>,
        source: Arc<dyn ItemSource>,
        index: SearchIndex,
        watermarks: WatermarkStore,
        retry_interval: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            index,
            watermarks,
            retry_interval,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fetch and apply until it succeeds, fails fatally or shutdown fires.
    ///
    /// Retryable fetch failures and transient local storage errors (a busy
    /// or unreachable database) are retried at the fixed interval.
    pub async fn run(&self, mut shutdown: ShutdownSignal) -> Result<ReconcileOutcome, ReconcileError> {
        let mut attempt = 0u32;

        loop {
            if shutdown.is_shutdown() {
                info!(reconciler = %self.name, attempt, "Reconciliation cancelled");
                return Ok(ReconcileOutcome::Cancelled);
            }
            attempt += 1;

            match self.attempt().await {
                Ok(outcome) => return Ok(outcome),
                Err(AttemptError::Retryable(message)) => {
                    warn!(
                        reconciler = %self.name,
                        attempt,
                        error = %message,
                        retry_in_ms = self.retry_interval.as_millis() as u64,
                        "Reconciliation attempt failed, retrying"
                    );
                }
                Err(AttemptError::Fatal(e)) => {
                    error!(reconciler = %self.name, attempt, error = %e, "Reconciliation failed");
                    return Err(e);
                }
            }

            if !shutdown.sleep(self.retry_interval).await {
                info!(reconciler = %self.name, attempt, "Reconciliation cancelled");
                return Ok(ReconcileOutcome::Cancelled);
            }
        }
    }

    async fn attempt(&self) -> Result<ReconcileOutcome, AttemptError> {
        let since = self.watermarks.get(&self.name).await?;
        let items = self.source.items_since(since).await?;
        let changed = self.index.upsert_many(&items).await?;

        let mut watermark = since;
        if let Some(newest) = items.iter().map(|item| item.updated_at).max() {
            self.watermarks.advance(&self.name, newest).await?;
            watermark = self.watermarks.get(&self.name).await?;
        }

        info!(
            reconciler = %self.name,
            received = items.len(),
            changed,
            "Reconciliation applied"
        );
        Ok(ReconcileOutcome::Applied {
            count: items.len(),
            watermark,
        })
    }
}

/// How one attempt failed.
enum AttemptError {
    Retryable(String),
    Fatal(ReconcileError),
}

impl From<FetchError> for AttemptError {
    fn from(e: FetchError) -> Self {
        match e {
            FetchError::Retryable(message) => AttemptError::Retryable(message),
            FetchError::Fatal(message) => AttemptError::Fatal(ReconcileError::Fatal(message)),
        }
    }
}

impl From<StorageError> for AttemptError {
    fn from(e: StorageError) -> Self {
        if e.is_retryable() {
            AttemptError::Retryable(e.to_string())
        } else {
            AttemptError::Fatal(e.into())
        }
    }
}

/// Run reconciliation in the background.
///
/// Startup does not wait for it; the outcome is only logged.
pub fn spawn(reconciler: Arc<Reconciler>, shutdown: ShutdownSignal) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = reconciler.run(shutdown).await {
            error!(reconciler = %reconciler.name(), error = %e, "Reconciliation task ended with error");
        }
    })
}

#[cfg(test)]
mod tests;
