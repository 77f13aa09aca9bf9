use rand::Rng;
use std::time::Duration;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BASE: Duration = Duration::from_millis(2000);

/// Linear backoff for throttled calls: retry `n` waits `base * n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base: Duration,
    max_retries: u32,
    jitter: bool,
}

impl RetryPolicy {
    pub fn new(base: Duration, max_retries: u32, jitter: bool) -> Self {
        Self {
            base,
            max_retries,
            jitter,
        }
    }

    /// Remote calls a request may make before giving up.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Whether a request that has already made `attempts` calls may try again.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts <= self.max_retries
    }

    pub fn delay(&self, retry: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(retry, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, retry: u32, rng: &mut R) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let linear = base_ms.saturating_mul(u64::from(retry));
        let delay_ms = if self.jitter {
            rng.gen_range(0..=linear)
        } else {
            linear
        };
        Duration::from_millis(delay_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_BASE, DEFAULT_MAX_RETRIES, false)
    }
}
