//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables. The struct is
//! passed explicitly to component constructors; nothing reads it globally.

mod messaging;
mod storage;

pub use messaging::{
    MessagingConfig, OutboxConfig, ReconciliationConfig, RemediationConfig, RetryConfig,
};
pub use storage::StorageConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "relaybox.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "RELAYBOX_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "RELAYBOX";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "RELAYBOX_LOG";

use serde::Deserialize;

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Identity of the running service.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Service name. Prefixes consumer groups so services sharing a broker
    /// never collide.
    pub name: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "search".to_string(),
        }
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub storage: StorageConfig,
    pub messaging: MessagingConfig,
    pub outbox: OutboxConfig,
    pub retry: RetryConfig,
    pub reconciliation: ReconciliationConfig,
    pub remediation: RemediationConfig,
    pub log_format: LogFormat,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `relaybox.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no component can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service.name.trim().is_empty() {
            return Err(ConfigError::Invalid("service.name must not be empty".into()));
        }
        if self.outbox.batch_size == 0 {
            return Err(ConfigError::Invalid("outbox.batch_size must be positive".into()));
        }
        if self.messaging.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "messaging.concurrency must be positive".into(),
            ));
        }
        if self.reconciliation.enabled && self.reconciliation.upstream_url.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "reconciliation.upstream_url is required when reconciliation is enabled".into(),
            ));
        }
        Ok(())
    }

    /// Create config for testing: in-memory storage and short intervals.
    pub fn for_test() -> Self {
        Self {
            storage: StorageConfig {
                path: ":memory:".to_string(),
                ..Default::default()
            },
            messaging: MessagingConfig {
                redelivery_delay_ms: 20,
                ..Default::default()
            },
            outbox: OutboxConfig {
                poll_interval_ms: 20,
                ..Default::default()
            },
            retry: RetryConfig {
                retry_limit: 5,
                interval_ms: 5,
                unavailable_interval_ms: 5,
            },
            reconciliation: ReconciliationConfig {
                retry_interval_ms: 20,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.service.name, "search");
        assert_eq!(config.outbox.poll_interval_ms, 10_000);
        assert_eq!(config.retry.retry_limit, 5);
        assert_eq!(config.retry.interval_ms, 5_000);
        assert_eq!(config.reconciliation.retry_interval_ms, 3_000);
        assert_eq!(config.log_format, LogFormat::Text);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_for_test_is_valid() {
        let config = Config::for_test();
        assert_eq!(config.storage.path, ":memory:");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let mut config = Config::default();
        config.outbox.batch_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    #[serial]
    fn test_load_from_file_and_env() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "service:\n  name: notifications\noutbox:\n  batch_size: 7\nlog_format: json"
        )
        .unwrap();

        std::env::set_var("RELAYBOX__RETRY__RETRY_LIMIT", "2");
        let config = Config::load(Some(file.path().to_str().unwrap()));
        std::env::remove_var("RELAYBOX__RETRY__RETRY_LIMIT");

        let config = config.unwrap();
        assert_eq!(config.service.name, "notifications");
        assert_eq!(config.outbox.batch_size, 7);
        assert_eq!(config.retry.retry_limit, 2);
        assert_eq!(config.log_format, LogFormat::Json);
        // Untouched sections keep their defaults.
        assert_eq!(config.messaging.topic_prefix, "items");
    }

    #[test]
    #[serial]
    fn test_load_missing_explicit_file_fails() {
        let result = Config::load(Some("/nonexistent/relaybox.yaml"));
        assert!(result.is_err());
    }
}
