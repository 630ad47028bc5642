use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Scan output
// ---------------------------------------------------------------------------

/// One work unit (recording session) with transcription outputs missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSession {
    /// Storage prefix of the session, relative to the storage root.
    pub session_path: String,
    pub session_id: String,
    /// Chunk indices with no output artifact, ascending.
    pub missing_chunks: Vec<u32>,
    pub missing_count: usize,
}

/// Ephemeral result of one scan. Recomputed every pass; never authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingJob {
    pub timestamp: String,
    pub scan_duration_seconds: f64,
    pub sessions_scanned: usize,
    pub sessions_with_missing_chunks: usize,
    pub total_missing_chunks: usize,
    pub sessions: Vec<PendingSession>,
}

impl PendingJob {
    #[must_use]
    pub fn has_work(&self) -> bool {
        self.total_missing_chunks > 0
    }

    #[must_use]
    pub fn stats(&self) -> ScanStats {
        ScanStats {
            scan_duration_seconds: self.scan_duration_seconds,
            sessions_scanned: self.sessions_scanned,
            sessions_with_missing_chunks: self.sessions_with_missing_chunks,
            total_missing_chunks: self.total_missing_chunks,
        }
    }
}

/// Aggregate scan figures embedded in the batch report.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanStats {
    pub scan_duration_seconds: f64,
    pub sessions_scanned: usize,
    pub sessions_with_missing_chunks: usize,
    pub total_missing_chunks: usize,
}

// ---------------------------------------------------------------------------
// Lock
// ---------------------------------------------------------------------------

/// Raw lock record as written by the recording frontend. Read-only here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    pub locked: bool,
    pub holder: String,
    pub session_id: Option<String>,
    /// RFC3339 creation time of the lock.
    pub timestamp: String,
}

/// Interpreted lock state after TTL policy is applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockStatus {
    pub locked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub holder: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_seconds: Option<i64>,
    /// Lock record existed but exceeded the TTL and was overridden.
    pub stale: bool,
    /// The status check itself failed; `locked` is the fail-safe default,
    /// not an observation.
    pub degraded: bool,
}

impl LockStatus {
    #[must_use]
    pub const fn unlocked() -> Self {
        Self {
            locked: false,
            holder: None,
            age_seconds: None,
            stale: false,
            degraded: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Compute resource
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl ComputeState {
    /// Map a provider state string onto the four-state model. EC2 reports
    /// `pending` for starting and `shutting-down`/`stopping` for stopping.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "stopped" => Some(Self::Stopped),
            "pending" | "starting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "stopping" | "shutting-down" => Some(Self::Stopping),
            _ => None,
        }
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }
}

impl std::fmt::Display for ComputeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Resource usage section of the batch report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuUsage {
    pub was_running: bool,
    pub we_started_it: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_time: Option<String>,
    pub runtime_seconds: f64,
    #[serde(rename = "costUSD")]
    pub cost_usd: f64,
}

impl GpuUsage {
    /// Usage record for a run that never touched the resource.
    #[must_use]
    pub const fn untouched() -> Self {
        Self {
            was_running: false,
            we_started_it: false,
            start_time: None,
            stop_time: None,
            runtime_seconds: 0.0,
            cost_usd: 0.0,
        }
    }
}

/// `cost = runtimeSeconds / 3600 × hourlyRate`. Zero runtime is zero cost.
#[must_use]
pub fn compute_cost_usd(runtime_seconds: f64, hourly_rate_usd: f64) -> f64 {
    (runtime_seconds.max(0.0) / 3600.0) * hourly_rate_usd
}

// ---------------------------------------------------------------------------
// Batch report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Work processed (possibly with counted per-chunk failures).
    Success,
    /// Nothing to do: lock held, backoff active, or no pending work.
    Skipped,
    /// The run aborted before completing its work.
    Failed,
    /// The run was terminated by a cooperative cancellation signal.
    Cancelled,
}

impl RunStatus {
    /// Exit code contract: skipped and partially-failed runs are success.
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Success | Self::Skipped => 0,
            Self::Failed => 1,
            Self::Cancelled => 130,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionStats {
    pub chunks_transcribed: usize,
    pub chunks_failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Performance {
    pub total_duration_seconds: f64,
}

/// Immutable summary of one orchestrator run, appended to the report log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub run_id: String,
    pub timestamp: String,
    pub timestamp_end: String,
    pub status: RunStatus,
    pub lock_status: LockStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan: Option<ScanStats>,
    pub gpu: GpuUsage,
    pub transcription: TranscriptionStats,
    pub performance: Performance,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

// ---------------------------------------------------------------------------
// Coordination markers (shared with the watchdog)
// ---------------------------------------------------------------------------

/// Written by the orchestrator on entry, removed on clean exit. The watchdog
/// is the only consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LivenessMarker {
    pub process_id: u32,
    /// RFC3339 start time of the orchestrator run.
    pub start_time: String,
}

impl LivenessMarker {
    /// Age of the run, or `None` if the recorded start time does not parse.
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        let start = DateTime::parse_from_rfc3339(&self.start_time).ok()?;
        Some(now.signed_duration_since(start.with_timezone(&Utc)))
    }
}

/// Written by the watchdog after a forced termination; read by the
/// orchestrator before starting a new run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffMarker {
    /// RFC3339 instant before which no new run may start.
    #[serde(rename = "retryNotBeforeTimestamp")]
    pub retry_not_before: String,
}

impl BackoffMarker {
    /// True while the backoff window is still open. An unparseable
    /// timestamp counts as active; a corrupt marker must not unlock runs.
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        match DateTime::parse_from_rfc3339(&self.retry_not_before) {
            Ok(until) => now < until.with_timezone(&Utc),
            Err(_) => true,
        }
    }
}

/// Durable record of an unreclaimed billed resource. Written alongside the
/// loud alert log event so the condition survives log loss.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRecord {
    pub raised_at: String,
    pub resource_id: String,
    pub code: String,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Transcription output artifacts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WordTiming {
    pub word: String,
    pub start_sec: f64,
    pub end_sec: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionSegment {
    pub start_sec: f64,
    pub end_sec: f64,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub words: Vec<WordTiming>,
}

/// Content of one `transcription-chunk-{N}.json` output artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionOutput {
    pub chunk_index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub transcript: String,
    pub segments: Vec<TranscriptionSegment>,
}
