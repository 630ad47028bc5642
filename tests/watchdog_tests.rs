//! Watchdog passes against in-memory coordination state, with a fake
//! process table and compute API.

mod helpers;

use std::sync::atomic::Ordering;

use chrono::{DateTime, Utc};
use tempfile::tempdir;

use helpers::{
    seed_session, test_config, FakeClock, FakeComputeApi, FakeProcessController, FakeWorker,
};
use whisper_backfill::clock::Clock;
use whisper_backfill::markers::{
    read_marker, write_marker, MarkerStore, MemoryMarkerStore, ALERT_KEY, BACKOFF_KEY,
    LIVENESS_KEY,
};
use whisper_backfill::model::{
    AlertRecord, BackoffMarker, ComputeState, LivenessMarker, RunStatus,
};
use whisper_backfill::storage::FsArtifactStore;
use whisper_backfill::{Orchestrator, Watchdog, WatchdogVerdict};

const WATCHED_PID: u32 = 4242;

struct Fixture {
    state_dir: tempfile::TempDir,
    markers: MemoryMarkerStore,
    compute: FakeComputeApi,
    processes: FakeProcessController,
    clock: FakeClock,
}

impl Fixture {
    fn new(compute: FakeComputeApi, processes: FakeProcessController) -> Self {
        Self {
            state_dir: tempdir().expect("state dir"),
            markers: MemoryMarkerStore::new(),
            compute,
            processes,
            clock: FakeClock::default_start(),
        }
    }

    /// Record the orchestrator as running since `age` ago.
    fn mark_running_for(&self, age: chrono::Duration) {
        write_marker(
            &self.markers,
            LIVENESS_KEY,
            &LivenessMarker {
                process_id: WATCHED_PID,
                start_time: (self.clock.now() - age).to_rfc3339(),
            },
        )
        .expect("write liveness marker");
    }

    fn check(&self) -> WatchdogVerdict {
        let config = test_config(self.state_dir.path(), self.state_dir.path());
        let watchdog = Watchdog::new(
            &config,
            &self.markers,
            &self.compute,
            &self.processes,
            &self.clock,
        );
        watchdog.check().expect("watchdog pass")
    }

    fn backoff_marker(&self) -> Option<BackoffMarker> {
        read_marker(&self.markers, BACKOFF_KEY).expect("readable backoff marker")
    }
}

fn parse(rfc3339: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(rfc3339)
        .expect("rfc3339")
        .with_timezone(&Utc)
}

#[test]
fn idle_when_no_liveness_marker() {
    let fixture = Fixture::new(
        FakeComputeApi::in_state(ComputeState::Stopped),
        FakeProcessController::dead_process(),
    );

    assert_eq!(fixture.check(), WatchdogVerdict::Idle);
    assert_eq!(fixture.processes.terminates.load(Ordering::SeqCst), 0);
    assert!(fixture.backoff_marker().is_none());
}

#[test]
fn marker_for_dead_pid_is_discarded() {
    let fixture = Fixture::new(
        FakeComputeApi::in_state(ComputeState::Stopped),
        FakeProcessController::dead_process(),
    );
    fixture.mark_running_for(chrono::Duration::minutes(200));

    assert_eq!(fixture.check(), WatchdogVerdict::StaleMarkerRemoved);
    assert!(fixture.markers.get(LIVENESS_KEY).unwrap().is_none());
    // A crashed run gets no embargo and no signals.
    assert!(fixture.backoff_marker().is_none());
    assert_eq!(fixture.processes.terminates.load(Ordering::SeqCst), 0);
    assert_eq!(fixture.compute.force_stops.load(Ordering::SeqCst), 0);
}

#[test]
fn run_under_the_ceiling_is_left_alone() {
    let fixture = Fixture::new(
        FakeComputeApi::in_state(ComputeState::Running),
        FakeProcessController::alive_process(true),
    );
    fixture.mark_running_for(chrono::Duration::minutes(45));

    assert_eq!(fixture.check(), WatchdogVerdict::WithinCeiling);
    assert_eq!(fixture.processes.terminates.load(Ordering::SeqCst), 0);
    assert_eq!(fixture.compute.force_stops.load(Ordering::SeqCst), 0);
    assert!(fixture.markers.get(LIVENESS_KEY).unwrap().is_some());
    assert!(fixture.backoff_marker().is_none());
}

#[test]
fn over_ceiling_run_is_terminated_gracefully_and_compute_reclaimed() {
    let fixture = Fixture::new(
        FakeComputeApi::in_state(ComputeState::Running),
        FakeProcessController::alive_process(true),
    );
    let started = fixture.clock.now();
    // 115 minutes against a 110 minute ceiling.
    fixture.mark_running_for(chrono::Duration::minutes(115));

    let verdict = fixture.check();
    assert_eq!(
        verdict,
        WatchdogVerdict::Terminated {
            forced: false,
            compute_force_stopped: true,
        }
    );
    assert_eq!(fixture.processes.terminates.load(Ordering::SeqCst), 1);
    assert_eq!(fixture.processes.kills.load(Ordering::SeqCst), 0);

    // The kill path bypasses the orchestrator's release, so the watchdog
    // reclaims the resource itself.
    assert_eq!(fixture.compute.force_stops.load(Ordering::SeqCst), 1);
    assert_eq!(fixture.compute.current_state(), ComputeState::Stopped);

    assert!(fixture.markers.get(LIVENESS_KEY).unwrap().is_none());
    let backoff = fixture.backoff_marker().expect("embargo written");
    assert!(parse(&backoff.retry_not_before) >= started + chrono::Duration::seconds(3600));
}

#[test]
fn run_surviving_the_grace_period_is_killed() {
    let fixture = Fixture::new(
        FakeComputeApi::in_state(ComputeState::Running),
        FakeProcessController::alive_process(false),
    );
    fixture.mark_running_for(chrono::Duration::minutes(115));

    let verdict = fixture.check();
    assert_eq!(
        verdict,
        WatchdogVerdict::Terminated {
            forced: true,
            compute_force_stopped: true,
        }
    );
    assert_eq!(fixture.processes.terminates.load(Ordering::SeqCst), 1);
    assert_eq!(fixture.processes.kills.load(Ordering::SeqCst), 1);
    assert_eq!(fixture.compute.current_state(), ComputeState::Stopped);
}

#[test]
fn reclaim_leaves_an_already_stopped_resource_alone() {
    let fixture = Fixture::new(
        FakeComputeApi::in_state(ComputeState::Stopped),
        FakeProcessController::alive_process(true),
    );
    fixture.mark_running_for(chrono::Duration::minutes(115));

    let verdict = fixture.check();
    assert_eq!(
        verdict,
        WatchdogVerdict::Terminated {
            forced: false,
            compute_force_stopped: false,
        }
    );
    assert_eq!(fixture.compute.force_stops.load(Ordering::SeqCst), 0);
    // The embargo is written regardless of compute state.
    assert!(fixture.backoff_marker().is_some());
}

#[test]
fn unparseable_start_time_counts_as_over_ceiling() {
    let fixture = Fixture::new(
        FakeComputeApi::in_state(ComputeState::Running),
        FakeProcessController::alive_process(true),
    );
    write_marker(
        &fixture.markers,
        LIVENESS_KEY,
        &LivenessMarker {
            process_id: WATCHED_PID,
            start_time: "not-a-timestamp".to_owned(),
        },
    )
    .unwrap();

    assert!(matches!(
        fixture.check(),
        WatchdogVerdict::Terminated { .. }
    ));
    assert_eq!(fixture.processes.terminates.load(Ordering::SeqCst), 1);
}

#[test]
fn failed_force_stop_raises_a_durable_alert() {
    let fixture = Fixture::new(
        FakeComputeApi::in_state(ComputeState::Running),
        FakeProcessController::alive_process(true),
    );
    fixture.compute.fail_force_stop.store(true, Ordering::SeqCst);
    fixture.mark_running_for(chrono::Duration::minutes(115));

    let verdict = fixture.check();
    assert_eq!(
        verdict,
        WatchdogVerdict::Terminated {
            forced: false,
            compute_force_stopped: false,
        }
    );

    let alert: AlertRecord = read_marker(&fixture.markers, ALERT_KEY)
        .expect("readable alert")
        .expect("alert recorded");
    assert_eq!(alert.resource_id, "i-fake");
    assert_eq!(alert.code, "BF-MANUAL-INTERVENTION");
    assert!(alert.reason.contains("force-stop failed"));
}

#[test]
fn embargo_written_by_the_watchdog_blocks_the_next_run() {
    let fixture = Fixture::new(
        FakeComputeApi::in_state(ComputeState::Running),
        FakeProcessController::alive_process(true),
    );
    fixture.mark_running_for(chrono::Duration::minutes(115));
    assert!(matches!(
        fixture.check(),
        WatchdogVerdict::Terminated { .. }
    ));

    // A run scheduled right after the forced recovery refuses to start.
    let storage_dir = tempdir().expect("storage dir");
    seed_session(storage_dir.path(), "s1", &[0], &[]);
    let config = test_config(storage_dir.path(), fixture.state_dir.path());
    let storage = FsArtifactStore::new(storage_dir.path().to_path_buf());
    let worker = FakeWorker::reliable();
    let orchestrator = Orchestrator::new(
        &config,
        &fixture.markers,
        &storage,
        &fixture.compute,
        &worker,
        &fixture.clock,
    );

    let report = orchestrator.run(&|| false).expect("run returns a report");
    assert_eq!(report.status, RunStatus::Skipped);
    assert_eq!(report.error_code.as_deref(), Some("BF-BACKOFF"));

    // Once the window passes, the same orchestrator may run again.
    fixture.clock.advance(chrono::Duration::seconds(3700));
    let report = orchestrator.run(&|| false).expect("run returns a report");
    assert_eq!(report.status, RunStatus::Success);
    assert!(fixture.backoff_marker().is_none());
}
