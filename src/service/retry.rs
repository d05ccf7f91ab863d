// service/retry.rs
use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use tokio::time::{sleep, Duration};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, base_delay: Duration) -> Self {
        RetryPolicy {
            max_attempts,
            base_delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::new(3, Duration::from_millis(1000))
    }
}

/// Exponential backoff for a given attempt (1-based), capped at 60s.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let delay = policy.base_delay.saturating_mul(2u32.saturating_pow(exp));
    delay.min(Duration::from_secs(60))
}

fn jitter(delay: Duration) -> Duration {
    let millis = delay.as_millis() as u64;
    if millis == 0 {
        return delay;
    }
    let spread = (millis / 4).max(1);
    let offset = rand::rng().random_range(0..spread);
    Duration::from_millis(millis + offset)
}

/// Run `op` up to `policy.max_attempts` times with exponential backoff and
/// jitter between attempts. The closure receives the 1-based attempt number.
pub async fn with_retries<T, E, F, Fut>(policy: RetryPolicy, label: &str, op: F) -> Result<T, E>
where
    E: Display,
    F: Fn(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut last_error = None;

    for attempt in 1..=policy.max_attempts.max(1) {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt < policy.max_attempts {
                    let delay = jitter(backoff_delay(&policy, attempt));
                    tracing::warn!(
                        "{}: attempt {}/{} failed: {}. Retrying in {:?}",
                        label,
                        attempt,
                        policy.max_attempts,
                        e,
                        delay
                    );
                    sleep(delay).await;
                }
                last_error = Some(e);
            }
        }
    }

    Err(last_error.expect("at least one attempt was made"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1000));
        assert_eq!(backoff_delay(&policy, 1), Duration::from_millis(1000));
        assert_eq!(backoff_delay(&policy, 2), Duration::from_millis(2000));
        assert_eq!(backoff_delay(&policy, 3), Duration::from_millis(4000));
        assert_eq!(backoff_delay(&policy, 10), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(1));

        let result: Result<u32, String> = with_retries(policy, "test", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err("not yet".to_string())
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(2, Duration::from_millis(1));

        let result: Result<(), String> = with_retries(policy, "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("always".to_string()) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
