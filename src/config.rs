//! Run configuration shared by the orchestrator and the watchdog.
//!
//! Validation runs before any compute call is issued: a bad configuration
//! must never leave a billed resource in an unknown state.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::RetryPolicy;
use crate::error::{BfError, BfResult};

/// Default advisory-lock TTL: a producer lock older than this is stale.
pub const DEFAULT_LOCK_TTL_SECS: u64 = 30 * 60;
/// Default runtime ceiling enforced by the watchdog. Deliberately below the
/// orchestrator's two-hour scheduling interval.
pub const DEFAULT_RUNTIME_CEILING_SECS: u64 = 110 * 60;
/// Default wait between graceful terminate and forceful kill.
pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 10;
/// Default retry embargo after a forced termination.
pub const DEFAULT_BACKOFF_SECS: u64 = 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Root of the session artifact store.
    pub storage_root: PathBuf,
    /// Directory holding coordination markers and the report log.
    pub state_dir: PathBuf,
    /// Provider identifier of the billed GPU worker (e.g. an instance id).
    pub resource_id: String,
    /// SSH destination of the worker's control channel (user@host).
    pub worker_host: String,
    /// Billed price of the worker, USD per hour.
    pub hourly_rate_usd: f64,
    pub lock_ttl_secs: u64,
    pub runtime_ceiling_secs: u64,
    pub grace_period_secs: u64,
    pub backoff_secs: u64,
}

impl BatchConfig {
    /// Fatal-before-resource gate: every field a run depends on is checked
    /// here, so a misconfigured run exits without touching the resource.
    pub fn validate(&self) -> BfResult<()> {
        if self.storage_root.as_os_str().is_empty() {
            return Err(BfError::Config("storage_root must be set".to_owned()));
        }
        if self.state_dir.as_os_str().is_empty() {
            return Err(BfError::Config("state_dir must be set".to_owned()));
        }
        if self.resource_id.trim().is_empty() {
            return Err(BfError::Config("resource_id must be set".to_owned()));
        }
        if self.worker_host.trim().is_empty() {
            return Err(BfError::Config("worker_host must be set".to_owned()));
        }
        if !self.hourly_rate_usd.is_finite() || self.hourly_rate_usd < 0.0 {
            return Err(BfError::Config(format!(
                "hourly_rate_usd must be a non-negative number, got {}",
                self.hourly_rate_usd
            )));
        }
        if self.lock_ttl_secs == 0 {
            return Err(BfError::Config("lock_ttl_secs must be positive".to_owned()));
        }
        if self.runtime_ceiling_secs <= self.grace_period_secs {
            return Err(BfError::Config(
                "runtime_ceiling_secs must exceed grace_period_secs".to_owned(),
            ));
        }
        Ok(())
    }

    /// Bounded wait for the resource to reach `running` after a start call.
    #[must_use]
    pub fn start_poll(&self) -> RetryPolicy {
        RetryPolicy::new(60, Duration::from_secs(5))
    }

    /// Bounded wait for the resource to reach `stopped` after a stop call.
    #[must_use]
    pub fn stop_poll(&self) -> RetryPolicy {
        RetryPolicy::new(60, Duration::from_secs(5))
    }

    /// Bounded probe of the worker control channel before declaring ready.
    /// 18 × 5s ≈ 90 seconds.
    #[must_use]
    pub fn ready_probe(&self) -> RetryPolicy {
        RetryPolicy::new(18, Duration::from_secs(5))
    }

    #[must_use]
    pub fn lock_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lock_ttl_secs as i64)
    }

    #[must_use]
    pub fn runtime_ceiling(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.runtime_ceiling_secs as i64)
    }

    #[must_use]
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    #[must_use]
    pub fn backoff_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.backoff_secs as i64)
    }
}
