use rand::Rng;
use std::time::Duration;

use dsync_core::DropboxError;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self { base, max, jitter }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let shift = attempt.min(16);
        let exp = base_ms.saturating_mul(1u64 << shift).min(max_ms);
        let delay_ms = if self.jitter {
            rng.gen_range(0..=exp)
        } else {
            exp
        };
        Duration::from_millis(delay_ms)
    }

    /// Delay before retrying `err`, or `None` when the error is not retryable or
    /// `attempt` (zero-based) used up the budget. A server `Retry-After` wins over the curve.
    pub fn retry_delay(&self, err: &DropboxError, attempt: u32, max_attempts: u32) -> Option<Duration> {
        if !err.is_retryable() || attempt + 1 >= max_attempts {
            return None;
        }
        Some(match err.retry_after_secs() {
            Some(secs) => Duration::from_secs(secs),
            None => self.delay(attempt),
        })
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(60), true)
    }
}
