//! Fixed-interval condition polling
//!
//! Provides the primitive used to wait for the API server to converge:
//! deletions finishing, CRD types showing up in discovery.

use std::future::Future;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::trace;

use crate::Error;

/// Default interval between checks
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default bound on how long to keep probing
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// Check immediately, then every `interval`, until the condition is satisfied.
///
/// * `Ok(true)` from the condition ends polling successfully.
/// * `Ok(false)` means "not yet"; the next check runs at the next tick.
/// * `Err` is returned immediately. Conditions that want to ride out transient
///   errors must absorb them themselves (e.g. via [`crate::retry::retry`]).
///
/// If `timeout` elapses first, including while a check is still running,
/// [`Error::Timeout`] naming `description` is returned. A zero `interval` is
/// rejected before the first check.
pub async fn poll_immediate<F, Fut>(
    description: &str,
    interval: Duration,
    timeout: Duration,
    mut condition: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    if interval.is_zero() {
        return Err(Error::validation_for_field(
            "pollInterval",
            format!("poll interval for {description} must be greater than zero"),
        ));
    }

    let polling = async {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // The first tick completes immediately
            ticker.tick().await;
            if condition().await? {
                return Ok::<(), Error>(());
            }
            trace!(condition = %description, "condition not yet met");
        }
    };

    match tokio::time::timeout(timeout, polling).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout {
            operation: description.to_string(),
            timeout,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_first_check_runs_immediately() {
        let start = tokio::time::Instant::now();
        let result = poll_immediate(
            "ready",
            Duration::from_secs(5),
            Duration::from_secs(60),
            || async { Ok(true) },
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_until_condition_met() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result = poll_immediate(
            "third time lucky",
            DEFAULT_POLL_INTERVAL,
            DEFAULT_POLL_TIMEOUT,
            move || {
                let c = c.clone();
                async move { Ok(c.fetch_add(1, Ordering::SeqCst) >= 2) }
            },
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_condition_error_is_not_retried() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result = poll_immediate("broken", DEFAULT_POLL_INTERVAL, DEFAULT_POLL_TIMEOUT, move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::validation("condition exploded"))
            }
        })
        .await;

        assert!(matches!(result, Err(Error::Validation { .. })));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_with_description() {
        let result = poll_immediate(
            "never",
            DEFAULT_POLL_INTERVAL,
            Duration::from_secs(1),
            || async { Ok(false) },
        )
        .await;

        let err = result.expect_err("condition never holds");
        assert!(err.is_deadline_exceeded());
        assert!(err.to_string().contains("never"));
    }

    #[tokio::test]
    async fn test_zero_interval_rejected() {
        let checked = Arc::new(AtomicU32::new(0));
        let p = checked.clone();

        let result = poll_immediate(
            "busy loop",
            Duration::ZERO,
            Duration::from_millis(50),
            move || {
                let p = p.clone();
                async move {
                    p.fetch_add(1, Ordering::SeqCst);
                    Ok(true)
                }
            },
        )
        .await;

        assert!(matches!(result, Err(Error::Validation { .. })));
        assert_eq!(checked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_check_is_bounded_by_timeout() {
        let result = poll_immediate(
            "hang",
            DEFAULT_POLL_INTERVAL,
            Duration::from_secs(2),
            || async {
                std::future::pending::<()>().await;
                Ok(true)
            },
        )
        .await;

        assert!(matches!(result, Err(Error::Timeout { .. })));
    }
}
