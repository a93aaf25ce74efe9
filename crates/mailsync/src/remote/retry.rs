//! Retry policy with exponential backoff for remote calls

use std::time::Duration;

/// How often and how patiently a transient failure is retried
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt (so `max_retries + 1` attempts total)
    pub max_retries: u32,
    /// Delay before the first retry; doubled for every further retry
    pub base_delay: Duration,
    /// Cap on the computed delay
    pub max_delay: Duration,
    /// Add 0-100ms of random jitter to each delay
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that retries without sleeping (useful for tests)
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Backoff before the given retry (1-based), without jitter
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Delay before the given retry, honouring a server-requested
    /// `Retry-After` up to `max_delay`
    pub fn wait_for(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        match retry_after {
            Some(requested) => requested.min(self.max_delay),
            None => self.delay_for(retry),
        }
    }

    /// Sleep before the given retry
    pub fn pause(&self, retry: u32, retry_after: Option<Duration>) {
        let mut delay = self.wait_for(retry, retry_after);
        if self.jitter {
            delay += Duration::from_millis(rand_jitter());
        }
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }
}

/// Generate a random jitter value (0-100ms)
fn rand_jitter() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let hasher = RandomState::new().build_hasher();
    hasher.finish() % 100
}
