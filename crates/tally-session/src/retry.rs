//! Retry policy for transport failures.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Exponential backoff applied when a frame cannot be handed to the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    /// Upper bound on any single delay (the maximum retry interval).
    #[serde(with = "millis")]
    pub max_delay: Duration,
    /// Backoff multiplier.
    pub multiplier: f64,
    /// Whether to add jitter to delays.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy.
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            ..Default::default()
        }
    }

    /// Calculate delay for a given attempt number.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_delay_ms * self.multiplier.powi(attempt as i32 - 1);
        let capped_delay =
            Duration::from_millis(delay_ms.min(self.max_delay.as_millis() as f64) as u64);

        if self.jitter {
            // Up to 25% jitter, never above the cap.
            let jitter_factor = 1.0 + (rand::random::<f64>() * 0.25);
            let jittered =
                Duration::from_millis((capped_delay.as_millis() as f64 * jitter_factor) as u64);
            jittered.min(self.max_delay)
        } else {
            capped_delay
        }
    }

    /// Execute an operation with retry.
    ///
    /// Returns the last error and the number of attempts made once the
    /// attempts are exhausted.
    pub async fn execute<F, Fut, T, E>(&self, mut operation: F) -> Result<T, (E, u32)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Debug,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;

            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    if attempt >= self.max_attempts.max(1) {
                        tracing::warn!(
                            attempt = attempt,
                            max_attempts = self.max_attempts,
                            error = ?e,
                            "Retry exhausted"
                        );
                        return Err((e, attempt));
                    }

                    let delay = self.delay_for_attempt(attempt);
                    tracing::debug!(
                        attempt = attempt,
                        delay_ms = delay.as_millis(),
                        error = ?e,
                        "Retrying after delay"
                    );

                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Tuning of the session layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a flow waits for a counterparty message before failing
    /// with `CounterpartyUnresponsive`.
    #[serde(with = "millis")]
    pub receive_timeout: Duration,
    /// Backoff for transport failures.
    pub retry: RetryPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            receive_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(800),
            multiplier: 2.0,
            jitter: false,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(9), Duration::from_millis(800));
    }

    #[test]
    fn test_jitter_respects_cap() {
        let policy = RetryPolicy {
            max_delay: Duration::from_millis(200),
            ..Default::default()
        };
        for attempt in 1..20 {
            assert!(policy.delay_for_attempt(attempt) <= Duration::from_millis(200));
        }
    }

    #[tokio::test]
    async fn test_execute_retries_until_success() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let policy = RetryPolicy::new(5, Duration::from_millis(10));
        let result: Result<u32, (&str, u32)> = policy
            .execute(move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err("down")
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn test_execute_gives_up() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        let result: Result<(), (&str, u32)> = policy.execute(|| async { Err("down") }).await;
        assert_eq!(result, Err(("down", 3)));
    }

    #[test]
    fn test_config_from_yaml_style_json() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"receive_timeout": 1500, "retry": {"max_attempts": 2}}"#)
                .unwrap();
        assert_eq!(config.receive_timeout, Duration::from_millis(1500));
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.max_delay, Duration::from_secs(5));
    }
}
