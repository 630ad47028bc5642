use std::path::PathBuf;

use thiserror::Error;

pub type BfResult<T> = Result<T, BfError>;

#[derive(Debug, Error)]
pub enum BfError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("json failure: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("missing command `{command}` on PATH")]
    CommandMissing { command: String },

    #[error("command failed: `{command}` (status: {status}){stderr_suffix}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr_suffix: String,
    },

    #[error("command timed out after {timeout_ms}ms: `{command}`{stderr_suffix}")]
    CommandTimedOut {
        command: String,
        timeout_ms: u64,
        stderr_suffix: String,
    },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("scan could not complete: {0}")]
    ScanFailed(String),

    #[error("marker store error for key `{key}`: {reason}")]
    Marker { key: String, reason: String },

    #[error("missing expected artifact at `{0}`")]
    MissingArtifact(PathBuf),

    #[error("compute resource `{resource_id}` not ready: {reason}")]
    ComputeNotReady { resource_id: String, reason: String },

    #[error(
        "compute resource `{resource_id}` could not be stopped; manual intervention required: {reason}"
    )]
    ManualIntervention { resource_id: String, reason: String },

    #[error("transcription worker error: {0}")]
    Worker(String),

    #[error("run refused: backoff active until {until_rfc3339}")]
    BackoffActive { until_rfc3339: String },

    #[error("run cancelled: {0}")]
    Cancelled(String),
}

impl BfError {
    #[must_use]
    pub fn from_command_failure(command: String, status: i32, stderr: String) -> Self {
        let trimmed = stderr.trim();
        let stderr_suffix = if trimmed.is_empty() {
            String::new()
        } else {
            format!("; stderr: {trimmed}")
        };
        Self::CommandFailed {
            command,
            status,
            stderr_suffix,
        }
    }

    #[must_use]
    pub fn from_command_timeout(command: String, timeout_ms: u64, stderr: String) -> Self {
        let trimmed = stderr.trim();
        let stderr_suffix = if trimmed.is_empty() {
            String::new()
        } else {
            format!("; stderr: {trimmed}")
        };
        Self::CommandTimedOut {
            command,
            timeout_ms,
            stderr_suffix,
        }
    }

    /// Stable, machine-readable error code for every variant. Persisted into
    /// reports and alert records, so codes must never be renamed casually.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Io(_) => "BF-IO",
            Self::Json(_) => "BF-JSON",
            Self::Config(_) => "BF-CONFIG",
            Self::CommandMissing { .. } => "BF-CMD-MISSING",
            Self::CommandFailed { .. } => "BF-CMD-FAILED",
            Self::CommandTimedOut { .. } => "BF-CMD-TIMEOUT",
            Self::Storage(_) => "BF-STORAGE",
            Self::ScanFailed(_) => "BF-SCAN",
            Self::Marker { .. } => "BF-MARKER",
            Self::MissingArtifact(_) => "BF-ARTIFACT-MISSING",
            Self::ComputeNotReady { .. } => "BF-COMPUTE-NOT-READY",
            Self::ManualIntervention { .. } => "BF-MANUAL-INTERVENTION",
            Self::Worker(_) => "BF-WORKER",
            Self::BackoffActive { .. } => "BF-BACKOFF",
            Self::Cancelled(_) => "BF-CANCELLED",
        }
    }

    /// True for the one error class that represents ongoing billable exposure
    /// and must surface as a loud alert rather than ordinary failure logging.
    #[must_use]
    pub const fn requires_manual_intervention(&self) -> bool {
        matches!(self, Self::ManualIntervention { .. })
    }
}
