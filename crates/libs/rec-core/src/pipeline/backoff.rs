//! Delay strategy for consecutive poll failures.

use std::time::Duration;

use rec_common::config::BackoffKind;

/// Ceiling for exponential delays.
const MAX_DELAY: Duration = Duration::from_secs(60);

/// Tracks consecutive failures and yields the delay before the next try.
///
/// `fixed` always waits the base delay; `exponential` doubles per failure up
/// to [`MAX_DELAY`]. The caller resets on success.
#[derive(Debug)]
pub struct Backoff {
    kind: BackoffKind,
    base: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(kind: BackoffKind, base: Duration) -> Self {
        Self {
            kind,
            base,
            failures: 0,
        }
    }

    /// Consecutive failures since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Record a failure and return how long to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        match self.kind {
            BackoffKind::Fixed => self.base,
            BackoffKind::Exponential => {
                let factor = 2u32.saturating_pow(self.failures.saturating_sub(1).min(16));
                self.base.saturating_mul(factor).min(MAX_DELAY)
            }
        }
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}
