use serde::Deserialize;
use std::future::Future;
use tokio::time::Duration;

/// Bounded retry with a fixed delay between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// Submitting the reduce-only close order
    pub const CLOSE_POSITION: RetryPolicy = RetryPolicy::new(30, Duration::from_secs(2));
    /// Waiting for the close order to show fills
    pub const CONFIRM_FILL: RetryPolicy = RetryPolicy::new(30, Duration::from_secs(2));
    pub const CANCEL_STOP_LOSS: RetryPolicy = RetryPolicy::new(20, Duration::from_secs(2));
}

/// Config form of a [`RetryPolicy`]
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub interval_secs: u64,
}

impl From<RetrySettings> for RetryPolicy {
    fn from(settings: RetrySettings) -> Self {
        RetryPolicy::new(
            settings.max_attempts.max(1),
            Duration::from_secs(settings.interval_secs),
        )
    }
}

/// Run `op` until it succeeds, fails with an error `retryable` rejects, or
/// `policy.max_attempts` attempts have been made. Returns the last error.
pub async fn retry<T, E, F, Fut, P>(label: &str, policy: RetryPolicy, retryable: P, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts && retryable(&e) => {
                tracing::warn!(
                    "{} failed: {}, retrying in {:?} (attempt {}/{})",
                    label,
                    e,
                    policy.interval,
                    attempt,
                    max_attempts
                );
                tokio::time::sleep(policy.interval).await;
                attempt += 1;
            }
            Err(e) => {
                if attempt > 1 {
                    tracing::warn!("{} gave up after {} attempts: {}", label, attempt, e);
                }
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    const FAST: RetryPolicy = RetryPolicy::new(5, Duration::ZERO);

    fn always(_: &String) -> bool {
        true
    }

    #[tokio::test]
    async fn test_stops_at_first_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<u32, String> = retry("op", FAST, always, || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(format!("fail {}", n))
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), String> = retry("op", FAST, always, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("still down".to_string())
        })
        .await;

        assert_eq!(result, Err("still down".to_string()));
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_terminal_error_is_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), String> = retry(
            "op",
            FAST,
            |e: &String| e != "terminal",
            || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("terminal".to_string())
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_settings_conversion() {
        let policy: RetryPolicy = RetrySettings {
            max_attempts: 0,
            interval_secs: 3,
        }
        .into();
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.interval, Duration::from_secs(3));
        assert_eq!(RetryPolicy::CANCEL_STOP_LOSS.max_attempts, 20);
    }
}
