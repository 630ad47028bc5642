#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use whisper_backfill::clock::Clock;
use whisper_backfill::compute::ComputeApi;
use whisper_backfill::config::BatchConfig;
use whisper_backfill::error::{BfError, BfResult};
use whisper_backfill::model::{ComputeState, TranscriptionSegment};
use whisper_backfill::pipeline::{RawTranscription, TranscriptionWorker};
use whisper_backfill::process::ProcessController;
use whisper_backfill::storage::output_name;

/// Deterministic clock: `sleep` advances simulated time instead of blocking.
pub struct FakeClock {
    now: Mutex<DateTime<Utc>>,
}

impl FakeClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn default_start() -> Self {
        Self::at(Utc.with_ymd_and_hms(2026, 8, 29, 12, 0, 0).unwrap())
    }

    pub fn advance(&self, duration: chrono::Duration) {
        let mut now = self.now.lock().unwrap();
        *now += duration;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(chrono::Duration::from_std(duration).unwrap_or_default());
    }
}

/// Compute API with immediate state transitions and call counters.
pub struct FakeComputeApi {
    pub state: Mutex<ComputeState>,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub force_stops: AtomicUsize,
    /// Graceful stop leaves the resource running (stuck shutdown).
    pub stuck_on_stop: AtomicBool,
    /// Forced stop fails too (manual-intervention territory).
    pub fail_force_stop: AtomicBool,
}

impl FakeComputeApi {
    pub fn in_state(state: ComputeState) -> Self {
        Self {
            state: Mutex::new(state),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            force_stops: AtomicUsize::new(0),
            stuck_on_stop: AtomicBool::new(false),
            fail_force_stop: AtomicBool::new(false),
        }
    }

    pub fn current_state(&self) -> ComputeState {
        *self.state.lock().unwrap()
    }
}

impl ComputeApi for FakeComputeApi {
    fn resource_id(&self) -> &str {
        "i-fake"
    }

    fn describe(&self) -> BfResult<ComputeState> {
        Ok(self.current_state())
    }

    fn start(&self) -> BfResult<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        *self.state.lock().unwrap() = ComputeState::Running;
        Ok(())
    }

    fn stop(&self) -> BfResult<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if !self.stuck_on_stop.load(Ordering::SeqCst) {
            *self.state.lock().unwrap() = ComputeState::Stopped;
        }
        Ok(())
    }

    fn force_stop(&self) -> BfResult<()> {
        self.force_stops.fetch_add(1, Ordering::SeqCst);
        if self.fail_force_stop.load(Ordering::SeqCst) {
            return Err(BfError::Storage("force-stop rejected".to_owned()));
        }
        *self.state.lock().unwrap() = ComputeState::Stopped;
        Ok(())
    }
}

/// Worker fake: transcribes everything unless the input name matches a
/// configured failure, and records stage traffic.
pub struct FakeWorker {
    pub fail_probe: AtomicBool,
    pub fail_inputs: Vec<String>,
    pub shipped: Mutex<Vec<String>>,
    pub cleaned: Mutex<Vec<String>>,
}

impl FakeWorker {
    pub fn reliable() -> Self {
        Self {
            fail_probe: AtomicBool::new(false),
            fail_inputs: Vec::new(),
            shipped: Mutex::new(Vec::new()),
            cleaned: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_on(inputs: &[&str]) -> Self {
        Self {
            fail_inputs: inputs.iter().map(|s| (*s).to_owned()).collect(),
            ..Self::reliable()
        }
    }
}

impl TranscriptionWorker for FakeWorker {
    fn probe(&self) -> BfResult<()> {
        if self.fail_probe.load(Ordering::SeqCst) {
            return Err(BfError::Worker("connection refused".to_owned()));
        }
        Ok(())
    }

    fn ship(&self, _local: &Path, remote_name: &str) -> BfResult<String> {
        self.shipped.lock().unwrap().push(remote_name.to_owned());
        Ok(format!("/remote/{remote_name}"))
    }

    fn invoke(&self, remote_input: &str) -> BfResult<String> {
        if self
            .fail_inputs
            .iter()
            .any(|f| remote_input.contains(f.as_str()))
        {
            return Err(BfError::Worker("transcription crashed".to_owned()));
        }
        Ok(format!("{remote_input}.transcription.json"))
    }

    fn retrieve(&self, _remote_output: &str) -> BfResult<RawTranscription> {
        Ok(RawTranscription {
            language: Some("en".to_owned()),
            transcript: "fixture transcript".to_owned(),
            segments: vec![TranscriptionSegment {
                start_sec: 0.0,
                end_sec: 2.0,
                text: "fixture transcript".to_owned(),
                words: vec![],
            }],
        })
    }

    fn cleanup(&self, remote_refs: &[String]) -> BfResult<()> {
        self.cleaned
            .lock()
            .unwrap()
            .extend(remote_refs.iter().cloned());
        Ok(())
    }
}

/// Process table fake for watchdog escalation tests.
pub struct FakeProcessController {
    pub alive: AtomicBool,
    /// Whether the target honors the graceful terminate.
    pub dies_on_terminate: bool,
    pub terminates: AtomicUsize,
    pub kills: AtomicUsize,
}

impl FakeProcessController {
    pub fn alive_process(dies_on_terminate: bool) -> Self {
        Self {
            alive: AtomicBool::new(true),
            dies_on_terminate,
            terminates: AtomicUsize::new(0),
            kills: AtomicUsize::new(0),
        }
    }

    pub fn dead_process() -> Self {
        Self {
            alive: AtomicBool::new(false),
            dies_on_terminate: true,
            terminates: AtomicUsize::new(0),
            kills: AtomicUsize::new(0),
        }
    }
}

impl ProcessController for FakeProcessController {
    fn is_alive(&self, _pid: u32) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn terminate(&self, _pid: u32) -> bool {
        self.terminates.fetch_add(1, Ordering::SeqCst);
        if self.dies_on_terminate {
            self.alive.store(false, Ordering::SeqCst);
        }
        true
    }

    fn kill(&self, _pid: u32) -> bool {
        self.kills.fetch_add(1, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
        true
    }
}

/// Test configuration rooted at two tempdirs.
pub fn test_config(storage_root: &Path, state_dir: &Path) -> BatchConfig {
    BatchConfig {
        storage_root: storage_root.to_path_buf(),
        state_dir: state_dir.to_path_buf(),
        resource_id: "i-fake".to_owned(),
        worker_host: "ubuntu@gpu-test".to_owned(),
        hourly_rate_usd: 0.526,
        lock_ttl_secs: 30 * 60,
        runtime_ceiling_secs: 110 * 60,
        grace_period_secs: 10,
        backoff_secs: 3600,
    }
}

/// Seed a session directory with input chunks and (optionally) outputs.
pub fn seed_session(storage_root: &Path, unit: &str, inputs: &[u32], outputs: &[u32]) {
    let dir = storage_root.join(unit);
    std::fs::create_dir_all(&dir).expect("create session dir");
    for index in inputs {
        std::fs::write(dir.join(format!("chunk-{index}.opus")), b"fake audio")
            .expect("write chunk");
    }
    for index in outputs {
        std::fs::write(dir.join(output_name(*index)), b"{}").expect("write output");
    }
}
