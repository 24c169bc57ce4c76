//! Exponential backoff shared by the connect path, the command queue and
//! the notification poller.

use crate::config::Config;
use rand::Rng;
use std::time::Duration;

/// Upper bound (exclusive) of the random jitter added when jitter is enabled.
const MAX_JITTER_MS: u64 = 1000;

/// Capped exponential backoff: `min(base * 2^attempt, cap)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    cap: Duration,
    jitter: bool,
}

impl BackoffPolicy {
    /// Create a policy without jitter.
    #[must_use]
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            jitter: false,
        }
    }

    /// Enable or disable jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Build the policy described by a client configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.backoff_base, config.backoff_cap).with_jitter(config.backoff_jitter)
    }

    /// Delay before retry number `attempt` (0 = first retry).
    ///
    /// Saturates at `cap` for exponents that would overflow.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponential = 2u32
            .checked_pow(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .unwrap_or(self.cap)
            .min(self.cap);

        if self.jitter {
            let jitter_ms = rand::thread_rng().gen_range(0..MAX_JITTER_MS);
            (exponential + Duration::from_millis(jitter_ms)).min(self.cap)
        } else {
            exponential
        }
    }

    /// The configured ceiling.
    #[must_use]
    pub fn cap(&self) -> Duration {
        self.cap
    }
}

/// Whole milliseconds of `duration` for log fields, saturating at `u64::MAX`.
pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
