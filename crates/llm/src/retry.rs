//! Bounded exponential back-off driven by [`RetryPolicy`].

use std::future::Future;
use std::time::Duration;

use pipeline::llm::LlmError;
use pipeline::RetryPolicy;
use serde::{Deserialize, Serialize};

/// Retry schedule for model calls.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Backoff {
    /// Retries after the first attempt.
    pub max_retries: u32,
    #[serde(with = "millis")]
    pub base_delay: Duration,
    #[serde(with = "millis")]
    pub max_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl Backoff {
    /// No waiting between attempts.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (0-based).
    ///
    /// A server-provided `after` wins over the schedule but is still capped.
    pub fn delay(&self, attempt: u32, after: Option<Duration>) -> Duration {
        let scheduled = self.base_delay.saturating_mul(1u32 << attempt.min(16));
        after.unwrap_or(scheduled).min(self.max_delay.max(self.base_delay))
    }

    /// Runs `op` until it succeeds, fails non-retryably, or retries run out.
    pub async fn run<F, Fut, T>(&self, mut op: F) -> Result<T, LlmError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let RetryPolicy::Retryable { after } = e.retry_policy() else {
                        return Err(e);
                    };
                    if attempt >= self.max_retries {
                        tracing::warn!(attempts = attempt + 1, error = %e, "model call retries exhausted");
                        return Err(e);
                    }
                    let delay = self.delay(attempt, after);
                    tracing::info!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, error = %e, "retrying model call");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn delay_doubles_and_caps() {
        let backoff = Backoff {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(backoff.delay(0, None), Duration::from_millis(100));
        assert_eq!(backoff.delay(1, None), Duration::from_millis(200));
        assert_eq!(backoff.delay(2, None), Duration::from_millis(350));
        assert_eq!(backoff.delay(0, Some(Duration::from_secs(10))), Duration::from_millis(350));
        assert_eq!(backoff.delay(0, Some(Duration::from_millis(5))), Duration::from_millis(5));
    }

    #[tokio::test]
    async fn non_retryable_errors_return_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = Backoff::immediate(3)
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(LlmError::Authentication) }
            })
            .await;
        assert_eq!(result, Err(LlmError::Authentication));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retryable_errors_stop_after_the_bound() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = Backoff::immediate(2)
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(LlmError::Overloaded { retry_after: None }) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
