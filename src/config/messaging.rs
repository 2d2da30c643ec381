//! Messaging, delivery and retry configuration types.

use std::time::Duration;

use serde::Deserialize;

/// Broker topology and consumer settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Prefix for event topics: `<prefix>.created`, `<prefix>.updated`, ...
    pub topic_prefix: String,
    /// Concurrent deliveries per consumer group.
    pub concurrency: usize,
    /// Delay before a nacked message is redelivered, in milliseconds.
    pub redelivery_delay_ms: u64,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            topic_prefix: "items".to_string(),
            concurrency: 4,
            redelivery_delay_ms: 1_000,
        }
    }
}

impl MessagingConfig {
    pub fn redelivery_delay(&self) -> Duration {
        Duration::from_millis(self.redelivery_delay_ms)
    }
}

/// Outbox relay configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Interval between relay polls, in milliseconds. Default: 10s.
    pub poll_interval_ms: u64,
    /// Maximum records claimed per poll. Default: 100.
    pub batch_size: u32,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10_000,
            batch_size: 100,
        }
    }
}

impl OutboxConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// In-process retry policy for consumer deliveries.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first failed attempt before faulting. Default: 5.
    pub retry_limit: u32,
    /// Fixed spacing between retries, in milliseconds. Default: 5s.
    pub interval_ms: u64,
    /// Spacing between retries while the target store is unavailable. Default: 5s.
    pub unavailable_interval_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_limit: 5,
            interval_ms: 5_000,
            unavailable_interval_ms: 5_000,
        }
    }
}

/// Catch-up reconciliation configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    /// Run reconciliation at service start.
    pub enabled: bool,
    /// Base URL of the owning service (`<base>/items?since=...`).
    pub upstream_url: String,
    /// Fixed wait between attempts, in milliseconds. Default: 3s.
    pub retry_interval_ms: u64,
    /// Per-request timeout, in milliseconds. Default: 30s.
    pub request_timeout_ms: u64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            upstream_url: "http://localhost:7001".to_string(),
            retry_interval_ms: 3_000,
            request_timeout_ms: 30_000,
        }
    }
}

impl ReconciliationConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Fault remediation configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemediationConfig {
    /// Consumer groups whose fault topics the remediator watches.
    pub groups: Vec<String>,
    /// Model value rejected by downstream validation.
    pub rejected_model: String,
    /// Placeholder written in place of the rejected model.
    pub replacement_model: String,
}

impl Default for RemediationConfig {
    fn default() -> Self {
        Self {
            groups: vec!["search-item-created".to_string()],
            rejected_model: "Foo".to_string(),
            replacement_model: "FooBar".to_string(),
        }
    }
}
