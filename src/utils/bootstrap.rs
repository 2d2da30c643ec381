//! Bootstrap utilities for the relaybox binary.

use std::future::Future;

use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use super::retry;
use crate::config::{LogFormat, LOG_ENV_VAR};

/// Initialize tracing with the RELAYBOX_LOG environment variable.
///
/// Defaults to "info" level if RELAYBOX_LOG is not set. Safe to call more
/// than once; later calls are ignored.
pub fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    let _ = match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
    };
}

/// Run `connect` until it succeeds, backing off between attempts.
///
/// # Arguments
/// * `resource` - Human-readable name for logging (e.g., "storage")
/// * `connect` - Async function that attempts to establish the connection
///
/// # Returns
/// The connection on success, or the last error once the backoff is exhausted.
pub async fn connect_with_retry<T, E, F, Fut>(resource: &str, connect: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut delays = retry::delays(retry::startup_backoff());
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match connect().await {
            Ok(connection) => {
                info!(resource = %resource, attempt, "Connected");
                return Ok(connection);
            }
            Err(e) => match delays.next() {
                Some(delay) => {
                    warn!(
                        resource = %resource,
                        attempt,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Connection failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    error!(resource = %resource, attempt, error = %e, "Connection failed, giving up");
                    return Err(e);
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_connect_with_retry_recovers() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = connect_with_retry("test", || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 1 {
                Err("not yet".to_string())
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_init_tracing_twice_does_not_panic() {
        init_tracing(LogFormat::Text);
        init_tracing(LogFormat::Json);
    }
}
