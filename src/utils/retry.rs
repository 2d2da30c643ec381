//! Retry utilities: backoff builders shared by the delivery pipeline and startup.
//!
//! Uses `backon` builders as plain delay iterators; callers own the loop so they
//! can interleave shutdown checks between attempts.

use std::time::Duration;

use backon::{BackoffBuilder, ConstantBuilder, ExponentialBuilder};

/// Fixed spacing between attempts, at most `max_times` retries.
pub fn fixed_backoff(interval: Duration, max_times: u32) -> ConstantBuilder {
    ConstantBuilder::default()
        .with_delay(interval)
        .with_max_times(max_times as usize)
}

/// Backoff for opening storage at startup.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 30
/// - Jitter enabled
pub fn startup_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30)
        .with_jitter()
}

/// Delays produced by a builder, as an iterator.
pub fn delays<B: BackoffBuilder>(builder: B) -> B::Backoff {
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_backoff_is_bounded_and_constant() {
        let delays: Vec<Duration> = delays(fixed_backoff(Duration::from_millis(5), 3)).collect();
        assert_eq!(delays, vec![Duration::from_millis(5); 3]);
    }

    #[test]
    fn test_fixed_backoff_zero_retries() {
        assert_eq!(delays(fixed_backoff(Duration::from_millis(5), 0)).count(), 0);
    }

    #[test]
    fn test_startup_backoff_is_bounded() {
        let delays: Vec<Duration> = delays(startup_backoff()).collect();
        assert_eq!(delays.len(), 30);
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(10)));
    }
}
