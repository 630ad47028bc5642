//! Per-chunk transcription pipeline.
//!
//! For each missing chunk: fetch the input artifact from storage, ship it to
//! the remote worker, invoke the transcription function (a black box behind
//! [`TranscriptionWorker`]), retrieve the result, persist the output
//! artifact. A stage failure marks the chunk failed and the pipeline moves
//! on — failures are counted, never retried, and never abort the run.
//! Transient artifacts (local and remote) are removed whatever the outcome.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{BfError, BfResult};
use crate::model::{
    PendingSession, TranscriptionOutput, TranscriptionSegment, TranscriptionStats,
};
use crate::process::run_command_with_timeout;
use crate::storage::{input_chunk_index, output_name, ArtifactStore, COMPLETION_MARKER};

/// Transcription payload as returned by the worker, before the pipeline
/// stamps the chunk index onto it.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTranscription {
    #[serde(default)]
    pub language: Option<String>,
    pub transcript: String,
    #[serde(default)]
    pub segments: Vec<TranscriptionSegment>,
}

/// Remote worker surface. `probe` is the control-channel readiness check the
/// lifecycle manager polls before the run begins.
pub trait TranscriptionWorker: Send + Sync {
    fn probe(&self) -> BfResult<()>;
    /// Upload a local artifact; returns the remote reference.
    fn ship(&self, local: &Path, remote_name: &str) -> BfResult<String>;
    /// Run the transcription function on a shipped artifact; returns the
    /// remote reference of the result.
    fn invoke(&self, remote_input: &str) -> BfResult<String>;
    /// Fetch a result back from the worker.
    fn retrieve(&self, remote_output: &str) -> BfResult<RawTranscription>;
    /// Best-effort removal of remote temp artifacts.
    fn cleanup(&self, remote_refs: &[String]) -> BfResult<()>;
}

// ---------------------------------------------------------------------------
// SSH worker adapter
// ---------------------------------------------------------------------------

const SSH_OPTS: [&str; 2] = ["-oBatchMode=yes", "-oConnectTimeout=5"];
const PROBE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15);
const TRANSFER_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);
const INVOKE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(600);

/// Worker reachable over ssh/scp, running the transcription CLI remotely.
#[derive(Debug)]
pub struct SshWorker {
    host: String,
    remote_dir: String,
    transcribe_command: String,
}

impl SshWorker {
    #[must_use]
    pub fn new(host: String) -> Self {
        Self {
            host,
            remote_dir: "/tmp/whisper-backfill".to_owned(),
            transcribe_command: "whisper-transcribe".to_owned(),
        }
    }

    fn ssh(&self, remote_command: &str, timeout: std::time::Duration) -> BfResult<std::process::Output> {
        let mut args: Vec<String> = SSH_OPTS.iter().map(|s| (*s).to_owned()).collect();
        args.push(self.host.clone());
        args.push(remote_command.to_owned());
        run_command_with_timeout("ssh", &args, None, Some(timeout))
    }
}

impl TranscriptionWorker for SshWorker {
    fn probe(&self) -> BfResult<()> {
        self.ssh(
            &format!("mkdir -p {} && true", self.remote_dir),
            PROBE_TIMEOUT,
        )?;
        Ok(())
    }

    fn ship(&self, local: &Path, remote_name: &str) -> BfResult<String> {
        let remote_path = format!("{}/{remote_name}", self.remote_dir);
        let mut args: Vec<String> = SSH_OPTS.iter().map(|s| (*s).to_owned()).collect();
        args.push("-q".to_owned());
        args.push(local.display().to_string());
        args.push(format!("{}:{remote_path}", self.host));
        run_command_with_timeout("scp", &args, None, Some(TRANSFER_TIMEOUT))?;
        Ok(remote_path)
    }

    fn invoke(&self, remote_input: &str) -> BfResult<String> {
        let remote_output = format!("{remote_input}.transcription.json");
        self.ssh(
            &format!(
                "{} --input {remote_input} --output {remote_output}",
                self.transcribe_command
            ),
            INVOKE_TIMEOUT,
        )
        .map_err(|error| BfError::Worker(format!("transcription invocation failed: {error}")))?;
        Ok(remote_output)
    }

    fn retrieve(&self, remote_output: &str) -> BfResult<RawTranscription> {
        let output = self.ssh(&format!("cat {remote_output}"), TRANSFER_TIMEOUT)?;
        serde_json::from_slice(&output.stdout)
            .map_err(|error| BfError::Worker(format!("unparseable transcription result: {error}")))
    }

    fn cleanup(&self, remote_refs: &[String]) -> BfResult<()> {
        if remote_refs.is_empty() {
            return Ok(());
        }
        self.ssh(&format!("rm -f {}", remote_refs.join(" ")), PROBE_TIMEOUT)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct ChunkPipeline<'a> {
    storage: &'a dyn ArtifactStore,
    worker: &'a dyn TranscriptionWorker,
    /// Local scratch directory for fetched inputs.
    work_dir: PathBuf,
}

impl<'a> ChunkPipeline<'a> {
    #[must_use]
    pub fn new(
        storage: &'a dyn ArtifactStore,
        worker: &'a dyn TranscriptionWorker,
        work_dir: PathBuf,
    ) -> Self {
        Self {
            storage,
            worker,
            work_dir,
        }
    }

    /// Process every missing chunk of one session in ascending index order.
    /// `cancelled` is polled between chunks; a pending cancellation stops the
    /// session with `Err(Cancelled)` so the caller can still release and
    /// report.
    pub fn process_session(
        &self,
        session: &PendingSession,
        cancelled: &dyn Fn() -> bool,
    ) -> BfResult<TranscriptionStats> {
        let inputs = self.input_index(&session.session_path)?;
        let mut stats = TranscriptionStats::default();

        for &index in &session.missing_chunks {
            if cancelled() {
                return Err(BfError::Cancelled(format!(
                    "terminate requested while processing `{}`",
                    session.session_id
                )));
            }

            match self.process_chunk(session, index, &inputs) {
                Ok(()) => {
                    stats.chunks_transcribed += 1;
                    tracing::info!(
                        session = %session.session_id,
                        chunk = index,
                        "chunk transcribed"
                    );
                }
                Err(error) => {
                    stats.chunks_failed += 1;
                    tracing::warn!(
                        session = %session.session_id,
                        chunk = index,
                        code = error.error_code(),
                        %error,
                        "chunk failed; continuing with next"
                    );
                }
            }
        }

        // Every missing chunk landed: memoize completion so future scans
        // skip this session without listing it chunk by chunk.
        if stats.chunks_failed == 0 && stats.chunks_transcribed == session.missing_count {
            self.write_completion_marker(session, &stats)?;
        }

        Ok(stats)
    }

    fn input_index(&self, unit: &str) -> BfResult<HashMap<u32, String>> {
        let mut by_index = HashMap::new();
        for name in self.storage.list_objects(unit)? {
            if let Some(index) = input_chunk_index(&name) {
                by_index.insert(index, name);
            }
        }
        Ok(by_index)
    }

    fn process_chunk(
        &self,
        session: &PendingSession,
        index: u32,
        inputs: &HashMap<u32, String>,
    ) -> BfResult<()> {
        let input_name = inputs.get(&index).ok_or_else(|| {
            BfError::MissingArtifact(
                PathBuf::from(&session.session_path).join(format!("chunk-{index}.*")),
            )
        })?;

        fs::create_dir_all(&self.work_dir)?;
        let local = self
            .work_dir
            .join(format!("{}-{input_name}", session.session_id));

        let mut remote_refs: Vec<String> = Vec::new();
        let result = self.run_stages(session, index, input_name, &local, &mut remote_refs);

        // Transient artifacts go regardless of the stage outcome.
        if local.exists() {
            let _ = fs::remove_file(&local);
        }
        if let Err(error) = self.worker.cleanup(&remote_refs) {
            tracing::warn!(%error, "remote temp cleanup failed");
        }

        result
    }

    fn run_stages(
        &self,
        session: &PendingSession,
        index: u32,
        input_name: &str,
        local: &Path,
        remote_refs: &mut Vec<String>,
    ) -> BfResult<()> {
        // fetch
        let audio = self.storage.read(&session.session_path, input_name)?;
        fs::write(local, audio)?;

        // ship
        let remote_input = self.worker.ship(local, input_name)?;
        remote_refs.push(remote_input.clone());

        // invoke
        let remote_output = self.worker.invoke(&remote_input)?;
        remote_refs.push(remote_output.clone());

        // retrieve
        let raw = self.worker.retrieve(&remote_output)?;

        // persist
        let output = TranscriptionOutput {
            chunk_index: index,
            language: raw.language,
            transcript: raw.transcript,
            segments: raw.segments,
        };
        self.storage.write(
            &session.session_path,
            &output_name(index),
            &serde_json::to_vec_pretty(&output)?,
        )
    }

    fn write_completion_marker(
        &self,
        session: &PendingSession,
        stats: &TranscriptionStats,
    ) -> BfResult<()> {
        let marker = serde_json::json!({
            "completedAt": chrono::Utc::now().to_rfc3339(),
            "chunksTranscribed": stats.chunks_transcribed,
        });
        self.storage.write(
            &session.session_path,
            COMPLETION_MARKER,
            &serde_json::to_vec_pretty(&marker)?,
        )
    }
}
