//! Injectable time source and bounded polling.
//!
//! Every wait in this crate (compute state transitions, worker readiness,
//! watchdog grace periods) goes through [`Clock`] and [`RetryPolicy`] so that
//! tests can drive them with a fake clock instead of wall-time sleeps.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::BfResult;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    fn sleep(&self, duration: Duration);
}

/// Wall-clock implementation used by the binary.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Bounded poll-and-sleep loop: at most `max_attempts` probes, sleeping
/// `interval` between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// Upper bound on how long this policy can keep a caller waiting.
    #[must_use]
    pub fn max_wait(&self) -> Duration {
        self.interval * self.max_attempts
    }

    /// Poll `probe` until it yields a value or the attempt budget runs out.
    ///
    /// `Ok(Some(v))` stops the loop; `Ok(None)` sleeps and retries. A probe
    /// error is retried like `Ok(None)` unless it occurs on the final
    /// attempt, in which case it propagates — transient describe failures
    /// mid-wait should not abort a bounded wait early.
    ///
    /// Returns `Ok(None)` when the budget is exhausted without a value;
    /// callers decide whether that is fatal.
    pub fn poll_until<T>(
        &self,
        clock: &dyn Clock,
        mut probe: impl FnMut() -> BfResult<Option<T>>,
    ) -> BfResult<Option<T>> {
        for attempt in 1..=self.max_attempts {
            match probe() {
                Ok(Some(value)) => return Ok(Some(value)),
                Ok(None) => {}
                Err(error) if attempt == self.max_attempts => return Err(error),
                Err(error) => {
                    tracing::debug!(attempt, %error, "poll probe failed; retrying");
                }
            }
            if attempt < self.max_attempts {
                clock.sleep(self.interval);
            }
        }
        Ok(None)
    }
}
