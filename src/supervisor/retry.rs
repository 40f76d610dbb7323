use std::time::Duration;
use tokio::time::sleep;

/// Bounded attempts with a fixed pause between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(3),
        }
    }
}

#[derive(Debug)]
pub struct FixedBackoff {
    delay: Duration,
    max_retries: u32,
    current_attempt: u32,
}

#[derive(Debug)]
pub struct MaxRetriesExceeded;

impl std::fmt::Display for MaxRetriesExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Maximum retry attempts exceeded")
    }
}

impl std::error::Error for MaxRetriesExceeded {}

impl FixedBackoff {
    /// Backoff allowing `policy.max_attempts` attempts in total, so one fewer retry.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            delay: policy.delay,
            max_retries: policy.max_attempts.saturating_sub(1),
            current_attempt: 0,
        }
    }

    pub async fn sleep(&mut self) -> Result<(), MaxRetriesExceeded> {
        if self.current_attempt >= self.max_retries {
            return Err(MaxRetriesExceeded);
        }

        log::warn!(
            "⏳ Retry attempt {} of {} in {}ms",
            self.current_attempt + 1,
            self.max_retries,
            self.delay.as_millis()
        );

        sleep(self.delay).await;
        self.current_attempt += 1;
        Ok(())
    }

    pub fn retries(&self) -> u32 {
        self.current_attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_backoff_exhausts_after_max_retries() {
        let mut backoff = FixedBackoff::new(RetryPolicy {
            max_attempts: 3,
            delay: Duration::from_secs(2),
        });

        let start = tokio::time::Instant::now();
        assert!(backoff.sleep().await.is_ok());
        assert!(backoff.sleep().await.is_ok());
        assert!(backoff.sleep().await.is_err());
        assert_eq!(backoff.retries(), 2);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(4) && elapsed < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_single_attempt_never_sleeps() {
        let mut backoff = FixedBackoff::new(RetryPolicy {
            max_attempts: 1,
            delay: Duration::from_secs(60),
        });
        assert!(backoff.sleep().await.is_err());
    }
}
