//! Command-line surface and cooperative shutdown handling.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::{Args, Parser, Subcommand};

use crate::config::{
    BatchConfig, DEFAULT_BACKOFF_SECS, DEFAULT_GRACE_PERIOD_SECS, DEFAULT_LOCK_TTL_SECS,
    DEFAULT_RUNTIME_CEILING_SECS,
};
use crate::error::{BfError, BfResult};

static SHUTDOWN_FLAG: AtomicBool = AtomicBool::new(false);

/// Global cooperative-shutdown flag, set by SIGINT/SIGTERM. The orchestrator
/// polls it between chunks; the watchdog's graceful-terminate signal lands
/// here, which is what lets the scope-guarded release run before exit.
pub struct ShutdownController;

impl ShutdownController {
    /// Install the signal handler. Errors are non-fatal (signal handling is
    /// best-effort), so callers may choose to log and continue.
    pub fn install() -> BfResult<()> {
        ctrlc::set_handler(|| {
            SHUTDOWN_FLAG.store(true, Ordering::SeqCst);
            tracing::info!("shutdown signal received");
        })
        .map_err(|e| BfError::Io(std::io::Error::other(format!("signal handler: {e}"))))
    }

    #[must_use]
    pub fn is_shutting_down() -> bool {
        SHUTDOWN_FLAG.load(Ordering::SeqCst)
    }

    /// Programmatically trigger the shutdown flag (internal cancel paths
    /// and tests).
    pub fn trigger_shutdown() {
        SHUTDOWN_FLAG.store(true, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub fn reset() {
        SHUTDOWN_FLAG.store(false, Ordering::SeqCst);
    }

    /// Exit code for signal-terminated runs. Convention: 128 + SIGINT(2).
    #[must_use]
    pub const fn signal_exit_code() -> i32 {
        130
    }
}

#[derive(Debug, Parser)]
#[command(name = "whisper-backfill")]
#[command(about = "Batch backfill of missing whisper transcriptions on an on-demand GPU worker")]
pub struct Cli {
    #[command(flatten)]
    pub config: ConfigArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Execute one orchestrator pass: lock check, scan, transcribe, report.
    Run,
    /// Execute one watchdog pass against the shared coordination state.
    Watchdog,
    /// Scan storage and print the pending-work listing as JSON.
    Scan,
    /// Print the interpreted recording-lock status as JSON.
    LockStatus,
    /// Print recent batch reports from the append-only log.
    Reports(ReportsArgs),
}

#[derive(Debug, Args)]
pub struct ReportsArgs {
    /// How many recent reports to print.
    #[arg(long, default_value_t = 10)]
    pub limit: usize,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    /// Root directory of the session artifact store.
    #[arg(long, env = "BACKFILL_STORAGE_ROOT")]
    pub storage_root: PathBuf,

    /// Directory for coordination markers, scratch space and the report log.
    #[arg(long, env = "BACKFILL_STATE_DIR")]
    pub state_dir: PathBuf,

    /// Instance id of the billed GPU worker.
    #[arg(long, env = "BACKFILL_INSTANCE_ID")]
    pub instance_id: String,

    /// SSH destination of the worker (user@host).
    #[arg(long, env = "BACKFILL_WORKER_HOST")]
    pub worker_host: String,

    /// Billed price of the worker, USD per hour.
    #[arg(long, env = "BACKFILL_HOURLY_RATE", default_value_t = 0.526)]
    pub hourly_rate: f64,

    #[arg(long, default_value_t = DEFAULT_LOCK_TTL_SECS)]
    pub lock_ttl_secs: u64,

    #[arg(long, default_value_t = DEFAULT_RUNTIME_CEILING_SECS)]
    pub runtime_ceiling_secs: u64,

    #[arg(long, default_value_t = DEFAULT_GRACE_PERIOD_SECS)]
    pub grace_period_secs: u64,

    #[arg(long, default_value_t = DEFAULT_BACKOFF_SECS)]
    pub backoff_secs: u64,
}

impl ConfigArgs {
    /// Build and validate the run configuration. Validation failures abort
    /// before any resource is touched.
    pub fn to_config(&self) -> BfResult<BatchConfig> {
        let config = BatchConfig {
            storage_root: self.storage_root.clone(),
            state_dir: self.state_dir.clone(),
            resource_id: self.instance_id.clone(),
            worker_host: self.worker_host.clone(),
            hourly_rate_usd: self.hourly_rate,
            lock_ttl_secs: self.lock_ttl_secs,
            runtime_ceiling_secs: self.runtime_ceiling_secs,
            grace_period_secs: self.grace_period_secs,
            backoff_secs: self.backoff_secs,
        };
        config.validate()?;
        Ok(config)
    }
}
