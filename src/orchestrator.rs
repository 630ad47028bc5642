//! Batch controller.
//!
//! One run walks `CheckingLock → Scanning → AcquiringCompute → Transcribing
//! → ReleasingCompute → Reporting`, short-circuiting to a skipped report
//! when the backoff window is open, the producer lock is held, or the scan
//! finds nothing pending. The compute resource is only touched when work
//! exists, and its release is scope-guarded so every exit path — success,
//! error, or cooperative cancellation — stops a resource this run started.
//!
//! The runtime ceiling is deliberately NOT enforced here: the watchdog owns
//! it from outside, so a hang in this process cannot defeat it.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::clock::Clock;
use crate::compute::{raise_manual_intervention_alert, ComputeApi, ComputeGuard, ComputeLifecycle};
use crate::config::BatchConfig;
use crate::error::{BfError, BfResult};
use crate::lock::LockClient;
use crate::markers::{read_marker, write_marker, MarkerStore, BACKOFF_KEY, LIVENESS_KEY};
use crate::model::{
    compute_cost_usd, BackoffMarker, BatchReport, GpuUsage, LivenessMarker, LockStatus,
    Performance, RunStatus, ScanStats, TranscriptionStats,
};
use crate::pipeline::{ChunkPipeline, TranscriptionWorker};
use crate::scanner;
use crate::storage::{ArtifactStore, ReportLog};

/// Mutable report state accumulated as the run advances, so a failure at any
/// stage still yields a report describing everything that happened first.
#[derive(Debug)]
struct RunDraft {
    lock_status: LockStatus,
    scan: Option<ScanStats>,
    gpu: GpuUsage,
    transcription: TranscriptionStats,
}

impl RunDraft {
    fn new() -> Self {
        Self {
            lock_status: LockStatus::unlocked(),
            scan: None,
            gpu: GpuUsage::untouched(),
            transcription: TranscriptionStats::default(),
        }
    }
}

pub struct Orchestrator<'a> {
    config: &'a BatchConfig,
    markers: &'a dyn MarkerStore,
    storage: &'a dyn ArtifactStore,
    compute: &'a dyn ComputeApi,
    worker: &'a dyn TranscriptionWorker,
    clock: &'a dyn Clock,
}

impl<'a> Orchestrator<'a> {
    #[must_use]
    pub fn new(
        config: &'a BatchConfig,
        markers: &'a dyn MarkerStore,
        storage: &'a dyn ArtifactStore,
        compute: &'a dyn ComputeApi,
        worker: &'a dyn TranscriptionWorker,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            config,
            markers,
            storage,
            compute,
            worker,
            clock,
        }
    }

    /// Execute one batch run end to end and append its report to the log.
    ///
    /// `cancelled` is the cooperative cancellation probe (signal flag),
    /// polled between chunks. Configuration errors return `Err` before any
    /// marker or resource is touched; every later failure is folded into the
    /// returned report instead.
    pub fn run(&self, cancelled: &dyn Fn() -> bool) -> BfResult<BatchReport> {
        self.config.validate()?;

        let started_at = self.clock.now();
        let run_id = Uuid::new_v4().to_string();
        tracing::info!(%run_id, "batch run starting");

        if let Some(report) = self.backoff_gate(&run_id, started_at)? {
            return Ok(report);
        }

        write_marker(
            self.markers,
            LIVENESS_KEY,
            &LivenessMarker {
                process_id: std::process::id(),
                start_time: started_at.to_rfc3339(),
            },
        )?;

        let mut draft = RunDraft::new();
        let outcome = self.run_stages(&mut draft, cancelled);

        // Liveness removal happens on every exit path; a failure to remove
        // it is survivable (the watchdog discards markers of dead pids).
        if let Err(error) = self.markers.delete(LIVENESS_KEY) {
            tracing::warn!(%error, "liveness marker could not be removed");
        }

        let (status, error) = match outcome {
            Ok(status) => (status, None),
            Err(BfError::Cancelled(reason)) => {
                tracing::warn!(%reason, "run cancelled");
                (
                    RunStatus::Cancelled,
                    Some((reason, "BF-CANCELLED".to_owned())),
                )
            }
            Err(error) => {
                tracing::error!(code = error.error_code(), %error, "run failed");
                (
                    RunStatus::Failed,
                    Some((error.to_string(), error.error_code().to_owned())),
                )
            }
        };

        let finished_at = self.clock.now();
        let report = BatchReport {
            run_id,
            timestamp: started_at.to_rfc3339(),
            timestamp_end: finished_at.to_rfc3339(),
            status,
            lock_status: draft.lock_status,
            scan: draft.scan,
            gpu: draft.gpu,
            transcription: draft.transcription,
            performance: Performance {
                total_duration_seconds: finished_at
                    .signed_duration_since(started_at)
                    .num_milliseconds() as f64
                    / 1000.0,
            },
            error: error.as_ref().map(|(message, _)| message.clone()),
            error_code: error.map(|(_, code)| code),
        };

        self.append_report(&report);
        tracing::info!(
            run_id = %report.run_id,
            status = ?report.status,
            chunks_transcribed = report.transcription.chunks_transcribed,
            chunks_failed = report.transcription.chunks_failed,
            cost_usd = report.gpu.cost_usd,
            "batch run finished"
        );
        Ok(report)
    }

    /// Refuse to start while the watchdog's backoff window is open.
    fn backoff_gate(
        &self,
        run_id: &str,
        started_at: DateTime<Utc>,
    ) -> BfResult<Option<BatchReport>> {
        let marker: Option<BackoffMarker> = match read_marker(self.markers, BACKOFF_KEY) {
            Ok(marker) => marker,
            Err(error) => {
                // An unreadable backoff record blocks the run: it only
                // exists after a forced recovery.
                tracing::warn!(%error, "backoff marker unreadable; refusing to start");
                return Ok(Some(self.skip_report(
                    run_id,
                    started_at,
                    "backoff marker unreadable".to_owned(),
                )));
            }
        };

        match marker {
            Some(marker) if marker.is_active(started_at) => {
                tracing::warn!(
                    retry_not_before = %marker.retry_not_before,
                    "backoff window open; refusing to start"
                );
                Ok(Some(self.skip_report(
                    run_id,
                    started_at,
                    format!("backoff active until {}", marker.retry_not_before),
                )))
            }
            Some(_) => {
                // Window expired; clear it so later runs skip the read.
                let _ = self.markers.delete(BACKOFF_KEY);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn skip_report(&self, run_id: &str, started_at: DateTime<Utc>, reason: String) -> BatchReport {
        let finished_at = self.clock.now();
        let report = BatchReport {
            run_id: run_id.to_owned(),
            timestamp: started_at.to_rfc3339(),
            timestamp_end: finished_at.to_rfc3339(),
            status: RunStatus::Skipped,
            lock_status: LockStatus::unlocked(),
            scan: None,
            gpu: GpuUsage::untouched(),
            transcription: TranscriptionStats::default(),
            performance: Performance {
                total_duration_seconds: finished_at
                    .signed_duration_since(started_at)
                    .num_milliseconds() as f64
                    / 1000.0,
            },
            error: Some(reason),
            error_code: Some("BF-BACKOFF".to_owned()),
        };
        self.append_report(&report);
        report
    }

    fn run_stages(
        &self,
        draft: &mut RunDraft,
        cancelled: &dyn Fn() -> bool,
    ) -> BfResult<RunStatus> {
        // CheckingLock
        let lock = LockClient::new(self.markers, self.config.lock_ttl());
        draft.lock_status = lock.status(self.clock);
        if draft.lock_status.locked {
            tracing::info!(
                holder = draft.lock_status.holder.as_deref().unwrap_or("unknown"),
                degraded = draft.lock_status.degraded,
                "recording lock held; skipping run"
            );
            return Ok(RunStatus::Skipped);
        }

        // Scanning
        let job = scanner::scan(self.storage, self.clock)?;
        draft.scan = Some(job.stats());
        if !job.has_work() {
            tracing::info!("no pending work; skipping compute entirely");
            return Ok(RunStatus::Skipped);
        }

        if cancelled() {
            return Err(BfError::Cancelled("terminate before acquisition".to_owned()));
        }

        // AcquiringCompute
        let lifecycle = ComputeLifecycle::new(
            self.compute,
            self.clock,
            self.config.start_poll(),
            self.config.stop_poll(),
        );
        let outcome = lifecycle.ensure_running(self.config.ready_probe(), &|| self.worker.probe())?;
        draft.gpu.was_running = outcome.was_running;
        draft.gpu.we_started_it = outcome.started;
        let compute_acquired_at = self.clock.now();
        if outcome.started {
            draft.gpu.start_time = Some(compute_acquired_at.to_rfc3339());
        }

        let guard = ComputeGuard::new(&lifecycle, outcome.started);

        // Transcribing
        let work_dir = self.config.state_dir.join("work");
        let pipeline = ChunkPipeline::new(self.storage, self.worker, work_dir);
        let mut interruption: Option<BfError> = None;
        for session in &job.sessions {
            match pipeline.process_session(session, cancelled) {
                Ok(stats) => {
                    draft.transcription.chunks_transcribed += stats.chunks_transcribed;
                    draft.transcription.chunks_failed += stats.chunks_failed;
                }
                Err(error @ BfError::Cancelled(_)) => {
                    interruption = Some(error);
                    break;
                }
                Err(error) => {
                    // Session-level failure (e.g. its listing broke): count
                    // its chunks as failed and keep going.
                    tracing::warn!(
                        session = %session.session_id,
                        %error,
                        "session aborted; counting chunks as failed"
                    );
                    draft.transcription.chunks_failed += session.missing_count;
                }
            }
        }

        // ReleasingCompute: explicit release on the normal path; the guard's
        // Drop covers panics between acquisition and here.
        let release_result = guard.release();
        let stop_time = match release_result {
            Ok(stop_time) => stop_time,
            Err(error) => {
                if let BfError::ManualIntervention {
                    ref resource_id,
                    ref reason,
                } = error
                {
                    raise_manual_intervention_alert(self.markers, self.clock, resource_id, reason);
                }
                return Err(error);
            }
        };

        if let Some(stopped_at) = stop_time {
            draft.gpu.stop_time = Some(stopped_at.to_rfc3339());
            let runtime = stopped_at
                .signed_duration_since(compute_acquired_at)
                .num_milliseconds() as f64
                / 1000.0;
            draft.gpu.runtime_seconds = runtime;
            draft.gpu.cost_usd = compute_cost_usd(runtime, self.config.hourly_rate_usd);
        }

        if let Some(error) = interruption {
            return Err(error);
        }

        // Per-chunk failures are counted, not fatal: the run still succeeds.
        Ok(RunStatus::Success)
    }

    fn append_report(&self, report: &BatchReport) {
        let log = ReportLog::new(&self.config.state_dir);
        if let Err(error) = log.append(report) {
            tracing::warn!(%error, "batch report could not be appended to the log");
        }
    }
}
