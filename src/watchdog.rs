//! Independent safety monitor.
//!
//! Runs on its own schedule, in its own process, and observes the
//! orchestrator only through the marker store and the compute API — never
//! through in-process state. It is the cost circuit-breaker: it bounds
//! worst-case spend even when the orchestrator itself is wedged, which is
//! why the runtime ceiling lives here and not in the orchestrator.

use crate::clock::Clock;
use crate::compute::{raise_manual_intervention_alert, ComputeApi};
use crate::config::BatchConfig;
use crate::error::BfResult;
use crate::markers::{read_marker, write_marker, MarkerStore, BACKOFF_KEY, LIVENESS_KEY};
use crate::model::{BackoffMarker, ComputeState, LivenessMarker};
use crate::process::ProcessController;

/// What one watchdog pass observed and did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogVerdict {
    /// No liveness marker: no orchestrator running.
    Idle,
    /// Marker pointed at a dead pid; it was discarded.
    StaleMarkerRemoved,
    /// Orchestrator alive and under the runtime ceiling.
    WithinCeiling,
    /// Runtime ceiling exceeded; the orchestrator was terminated.
    Terminated {
        /// The graceful signal was not enough and a kill was sent.
        forced: bool,
        /// The compute resource needed a watchdog-issued force stop.
        compute_force_stopped: bool,
    },
}

pub struct Watchdog<'a> {
    config: &'a BatchConfig,
    markers: &'a dyn MarkerStore,
    compute: &'a dyn ComputeApi,
    processes: &'a dyn ProcessController,
    clock: &'a dyn Clock,
}

impl<'a> Watchdog<'a> {
    #[must_use]
    pub fn new(
        config: &'a BatchConfig,
        markers: &'a dyn MarkerStore,
        compute: &'a dyn ComputeApi,
        processes: &'a dyn ProcessController,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            config,
            markers,
            compute,
            processes,
            clock,
        }
    }

    /// One monitoring pass.
    pub fn check(&self) -> BfResult<WatchdogVerdict> {
        let marker: Option<LivenessMarker> = read_marker(self.markers, LIVENESS_KEY)?;
        let Some(marker) = marker else {
            tracing::debug!("no liveness marker; nothing to watch");
            return Ok(WatchdogVerdict::Idle);
        };

        if !self.processes.is_alive(marker.process_id) {
            tracing::info!(
                pid = marker.process_id,
                "liveness marker refers to a dead process; removing"
            );
            self.markers.delete(LIVENESS_KEY)?;
            return Ok(WatchdogVerdict::StaleMarkerRemoved);
        }

        let now = self.clock.now();
        let over_ceiling = match marker.age(now) {
            Some(age) => age > self.config.runtime_ceiling(),
            None => {
                // Unparseable start time means the runtime cannot be
                // bounded; that is exactly the situation the ceiling exists
                // for.
                tracing::warn!(
                    start_time = %marker.start_time,
                    "liveness marker has unparseable start time; treating as over ceiling"
                );
                true
            }
        };

        if !over_ceiling {
            tracing::debug!(pid = marker.process_id, "orchestrator within runtime ceiling");
            return Ok(WatchdogVerdict::WithinCeiling);
        }

        let forced = self.escalate(marker.process_id);
        self.markers.delete(LIVENESS_KEY)?;

        let compute_force_stopped = self.reclaim_compute();

        // Embargo the next scheduled run: whatever needed forced recovery
        // should not be retried immediately.
        let retry_not_before = self.clock.now() + self.config.backoff_window();
        write_marker(
            self.markers,
            BACKOFF_KEY,
            &BackoffMarker {
                retry_not_before: retry_not_before.to_rfc3339(),
            },
        )?;

        Ok(WatchdogVerdict::Terminated {
            forced,
            compute_force_stopped,
        })
    }

    /// Cooperative terminate, grace wait, then kill if still alive.
    fn escalate(&self, pid: u32) -> bool {
        tracing::warn!(pid, "runtime ceiling exceeded; sending terminate");
        if !self.processes.terminate(pid) {
            tracing::warn!(pid, "terminate signal could not be delivered");
        }

        self.clock.sleep(self.config.grace_period());

        if !self.processes.is_alive(pid) {
            tracing::info!(pid, "orchestrator exited after graceful terminate");
            return false;
        }

        tracing::warn!(pid, "orchestrator survived the grace period; sending kill");
        if !self.processes.kill(pid) {
            tracing::error!(pid, "kill signal could not be delivered");
        }
        true
    }

    /// Independently verify the resource reached `stopped`, force-stopping
    /// it if necessary. A kill bypasses the orchestrator's own release, so
    /// the watchdog never trusts that cleanup ran.
    fn reclaim_compute(&self) -> bool {
        let resource_id = self.compute.resource_id().to_owned();

        let state = match self.compute.describe() {
            Ok(state) => state,
            Err(error) => {
                raise_manual_intervention_alert(
                    self.markers,
                    self.clock,
                    &resource_id,
                    &format!("compute state could not be verified after termination: {error}"),
                );
                return false;
            }
        };

        if matches!(state, ComputeState::Stopped | ComputeState::Stopping) {
            tracing::info!(%resource_id, %state, "compute resource already winding down");
            return false;
        }

        tracing::warn!(%resource_id, %state, "compute resource still up after termination; force-stopping");
        match self.compute.force_stop() {
            Ok(()) => {
                let landed = self.config.stop_poll().poll_until(self.clock, || {
                    let state = self.compute.describe()?;
                    Ok((state == ComputeState::Stopped).then_some(()))
                });
                match landed {
                    Ok(Some(())) => true,
                    _ => {
                        raise_manual_intervention_alert(
                            self.markers,
                            self.clock,
                            &resource_id,
                            "force-stop issued but resource never reached stopped",
                        );
                        true
                    }
                }
            }
            Err(error) => {
                raise_manual_intervention_alert(
                    self.markers,
                    self.clock,
                    &resource_id,
                    &format!("force-stop failed: {error}"),
                );
                false
            }
        }
    }
}
