//! HTTP client for the owning service's item query.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use tracing::debug;

use super::{FetchError, ItemSource, ReconcileError};
use crate::config::ReconciliationConfig;
use crate::event::ItemPayload;
use crate::storage::format_timestamp;

/// Fetches items with `GET <base>/items?since=<rfc3339>`.
pub struct HttpItemSource {
    client: reqwest::Client,
    items_url: String,
}

impl HttpItemSource {
    pub fn new(base_url: &str, timeout: std::time::Duration) -> Result<Self, ReconcileError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            items_url: format!("{}/items", base_url.trim_end_matches('/')),
        })
    }

    pub fn from_config(config: &ReconciliationConfig) -> Result<Self, ReconcileError> {
        Self::new(&config.upstream_url, config.request_timeout())
    }
}

/// Statuses worth retrying: the upstream is missing, slow or failing.
pub(crate) fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::NOT_FOUND
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

#[async_trait]
impl ItemSource for HttpItemSource {
    async fn items_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ItemPayload>, FetchError> {
        let mut request = self.client.get(&self.items_url);
        if let Some(since) = since {
            request = request.query(&[("since", format_timestamp(&since))]);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_builder() {
                FetchError::Fatal(e.to_string())
            } else {
                FetchError::Retryable(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let message = format!("upstream returned {}", status);
            return Err(if is_retryable_status(status) {
                FetchError::Retryable(message)
            } else {
                FetchError::Fatal(message)
            });
        }

        let items: Vec<ItemPayload> = response.json().await.map_err(|e| {
            if e.is_decode() {
                FetchError::Fatal(format!("invalid item list: {}", e))
            } else {
                FetchError::Retryable(e.to_string())
            }
        })?;
        debug!(count = items.len(), "Fetched items from upstream");
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(is_retryable_status(StatusCode::NOT_FOUND));
        assert!(is_retryable_status(StatusCode::REQUEST_TIMEOUT));
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(!is_retryable_status(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn test_items_url_trims_trailing_slash() {
        let source =
            HttpItemSource::new("http://localhost:7001/", std::time::Duration::from_secs(1)).unwrap();
        assert_eq!(source.items_url, "http://localhost:7001/items");
    }
}
