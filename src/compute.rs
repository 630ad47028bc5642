//! Billed compute resource lifecycle.
//!
//! State machine: `stopped --start--> starting --poll--> running --stop-->
//! stopping --poll--> stopped`. State is always polled, never assumed.
//! Shutdown ownership is scoped to a single run: only the run whose
//! `ensure_running` actually transitioned the resource from stopped may stop
//! it, and that run must stop it on every exit path. [`ComputeGuard`] makes
//! the release un-skippable.

use chrono::{DateTime, Utc};

use crate::clock::{Clock, RetryPolicy};
use crate::error::{BfError, BfResult};
use crate::logging::ALERT_TARGET;
use crate::markers::{write_marker, MarkerStore, ALERT_KEY};
use crate::model::{AlertRecord, ComputeState};
use crate::process::{run_command_with_timeout, stdout_text};

pub trait ComputeApi: Send + Sync {
    fn resource_id(&self) -> &str;
    fn describe(&self) -> BfResult<ComputeState>;
    fn start(&self) -> BfResult<()>;
    fn stop(&self) -> BfResult<()>;
    /// Forced stop; the escalation tier after a graceful stop stalls.
    fn force_stop(&self) -> BfResult<()>;
}

// ---------------------------------------------------------------------------
// EC2 CLI adapter
// ---------------------------------------------------------------------------

/// Adapter shelling out to the `aws` CLI, the same control channel the
/// original deployment used.
#[derive(Debug)]
pub struct Ec2CliApi {
    instance_id: String,
    call_timeout: std::time::Duration,
}

impl Ec2CliApi {
    #[must_use]
    pub fn new(instance_id: String) -> Self {
        Self {
            instance_id,
            call_timeout: std::time::Duration::from_secs(30),
        }
    }

    fn run(&self, args: &[String]) -> BfResult<std::process::Output> {
        run_command_with_timeout("aws", args, None, Some(self.call_timeout))
    }
}

impl ComputeApi for Ec2CliApi {
    fn resource_id(&self) -> &str {
        &self.instance_id
    }

    fn describe(&self) -> BfResult<ComputeState> {
        let output = self.run(&[
            "ec2".to_owned(),
            "describe-instances".to_owned(),
            "--instance-ids".to_owned(),
            self.instance_id.clone(),
            "--query".to_owned(),
            "Reservations[0].Instances[0].State.Name".to_owned(),
            "--output".to_owned(),
            "text".to_owned(),
        ])?;
        let raw = stdout_text(&output);
        ComputeState::parse(&raw).ok_or_else(|| BfError::ComputeNotReady {
            resource_id: self.instance_id.clone(),
            reason: format!("unrecognized instance state `{raw}`"),
        })
    }

    fn start(&self) -> BfResult<()> {
        self.run(&[
            "ec2".to_owned(),
            "start-instances".to_owned(),
            "--instance-ids".to_owned(),
            self.instance_id.clone(),
        ])?;
        Ok(())
    }

    fn stop(&self) -> BfResult<()> {
        self.run(&[
            "ec2".to_owned(),
            "stop-instances".to_owned(),
            "--instance-ids".to_owned(),
            self.instance_id.clone(),
        ])?;
        Ok(())
    }

    fn force_stop(&self) -> BfResult<()> {
        self.run(&[
            "ec2".to_owned(),
            "stop-instances".to_owned(),
            "--instance-ids".to_owned(),
            self.instance_id.clone(),
            "--force".to_owned(),
        ])?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Lifecycle manager
// ---------------------------------------------------------------------------

/// Result of [`ComputeLifecycle::ensure_running`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartOutcome {
    /// The resource was already running when we looked.
    pub was_running: bool,
    /// This run issued the start call and therefore owns the shutdown.
    pub started: bool,
}

pub struct ComputeLifecycle<'a> {
    api: &'a dyn ComputeApi,
    clock: &'a dyn Clock,
    start_poll: RetryPolicy,
    stop_poll: RetryPolicy,
}

impl<'a> ComputeLifecycle<'a> {
    #[must_use]
    pub fn new(
        api: &'a dyn ComputeApi,
        clock: &'a dyn Clock,
        start_poll: RetryPolicy,
        stop_poll: RetryPolicy,
    ) -> Self {
        Self {
            api,
            clock,
            start_poll,
            stop_poll,
        }
    }

    #[must_use]
    pub fn resource_id(&self) -> &str {
        self.api.resource_id()
    }

    /// Bring the resource to `running` and verify the worker control channel
    /// answers, with bounded waits at each step. Idempotent: an
    /// already-running resource is left alone and `started` stays false.
    ///
    /// `probe_ready` is the worker-channel readiness check; `ready_probe`
    /// bounds how long it may keep failing before the run is declared dead.
    pub fn ensure_running(
        &self,
        ready_probe: RetryPolicy,
        probe_ready: &dyn Fn() -> BfResult<()>,
    ) -> BfResult<StartOutcome> {
        let resource_id = self.api.resource_id();
        let mut state = self.api.describe()?;
        tracing::info!(%resource_id, %state, "compute state observed");

        let was_running = state == ComputeState::Running;
        let mut started = false;

        if state == ComputeState::Stopping {
            // A previous shutdown is still draining; wait for it to land
            // before starting, otherwise the start call is rejected.
            state = self.await_state(ComputeState::Stopped, self.stop_poll)?;
        }

        let readiness = (|| {
            match state {
                ComputeState::Running => {}
                ComputeState::Stopped => {
                    tracing::info!(%resource_id, "starting compute resource");
                    self.api.start()?;
                    started = true;
                    self.await_state(ComputeState::Running, self.start_poll)?;
                }
                ComputeState::Starting => {
                    // Someone else issued the start; wait but do not claim
                    // shutdown ownership.
                    self.await_state(ComputeState::Running, self.start_poll)?;
                }
                ComputeState::Stopping => unreachable!("stopping resolved above"),
            }

            let ready = ready_probe.poll_until(self.clock, || match probe_ready() {
                Ok(()) => Ok(Some(())),
                Err(error) => {
                    tracing::debug!(%error, "worker control channel not answering yet");
                    Ok(None)
                }
            })?;
            if ready.is_none() {
                return Err(BfError::ComputeNotReady {
                    resource_id: resource_id.to_owned(),
                    reason: format!(
                        "worker control channel did not answer within {:?}",
                        ready_probe.max_wait()
                    ),
                });
            }
            Ok(())
        })();

        if let Err(error) = readiness {
            // A start we issued must not leave the resource billing after a
            // failed acquisition; stop it before surfacing the error.
            if started {
                tracing::warn!(%resource_id, %error, "acquisition failed after start; releasing");
                if let Err(release_error) = self.release(true) {
                    tracing::error!(
                        target: ALERT_TARGET,
                        %resource_id,
                        code = release_error.error_code(),
                        %release_error,
                        "release after failed acquisition also failed"
                    );
                }
            }
            return Err(error);
        }

        tracing::info!(%resource_id, started, was_running, "compute resource ready");
        Ok(StartOutcome {
            was_running,
            started,
        })
    }

    /// Stop the resource if and only if this run started it, escalating
    /// graceful → forced → manual-intervention error. Returns the stop time
    /// when a stop was performed.
    pub fn release(&self, started: bool) -> BfResult<Option<DateTime<Utc>>> {
        let resource_id = self.api.resource_id();
        if !started {
            tracing::info!(%resource_id, "release skipped: this run does not own shutdown");
            return Ok(None);
        }

        tracing::info!(%resource_id, "stopping compute resource");
        let graceful = self.api.stop().and_then(|()| {
            self.await_state(ComputeState::Stopped, self.stop_poll)
                .map(|_| ())
        });

        if let Err(error) = graceful {
            tracing::warn!(%resource_id, %error, "graceful stop failed; escalating to forced stop");
            self.api.force_stop().map_err(|force_error| {
                BfError::ManualIntervention {
                    resource_id: resource_id.to_owned(),
                    reason: format!(
                        "graceful stop failed ({error}); forced stop also failed ({force_error})"
                    ),
                }
            })?;
            self.await_state(ComputeState::Stopped, self.stop_poll)
                .map_err(|poll_error| BfError::ManualIntervention {
                    resource_id: resource_id.to_owned(),
                    reason: format!(
                        "forced stop issued but resource never reached stopped: {poll_error}"
                    ),
                })?;
        }

        let stopped_at = self.clock.now();
        tracing::info!(%resource_id, "compute resource stopped");
        Ok(Some(stopped_at))
    }

    fn await_state(
        &self,
        wanted: ComputeState,
        policy: RetryPolicy,
    ) -> BfResult<ComputeState> {
        let reached = policy.poll_until(self.clock, || {
            let state = self.api.describe()?;
            Ok(if state == wanted { Some(state) } else { None })
        })?;
        reached.ok_or_else(|| BfError::ComputeNotReady {
            resource_id: self.api.resource_id().to_owned(),
            reason: format!(
                "resource did not reach `{wanted}` within {:?}",
                policy.max_wait()
            ),
        })
    }
}

// ---------------------------------------------------------------------------
// Scope guard
// ---------------------------------------------------------------------------

/// Guarantees release on every exit path of the owning scope. The normal
/// path calls [`ComputeGuard::release`] explicitly and gets the result; the
/// `Drop` backstop covers panics and early returns, where the only option
/// left is to force-stop and shout.
pub struct ComputeGuard<'a> {
    lifecycle: &'a ComputeLifecycle<'a>,
    started: bool,
    released: bool,
}

impl<'a> ComputeGuard<'a> {
    #[must_use]
    pub fn new(lifecycle: &'a ComputeLifecycle<'a>, started: bool) -> Self {
        Self {
            lifecycle,
            started,
            released: false,
        }
    }

    pub fn release(mut self) -> BfResult<Option<DateTime<Utc>>> {
        self.released = true;
        self.lifecycle.release(self.started)
    }
}

impl Drop for ComputeGuard<'_> {
    fn drop(&mut self) {
        if self.released || !self.started {
            return;
        }
        tracing::warn!(
            resource_id = %self.lifecycle.resource_id(),
            "compute guard dropped without explicit release; attempting recovery stop"
        );
        if let Err(error) = self.lifecycle.release(true) {
            tracing::error!(
                target: ALERT_TARGET,
                resource_id = %self.lifecycle.resource_id(),
                code = error.error_code(),
                %error,
                "backstop release failed; billed resource may still be running"
            );
        }
    }
}

/// Emit the loud, distinct manual-intervention alert: a dedicated tracing
/// target plus a durable marker record, so the condition survives log loss.
pub fn raise_manual_intervention_alert(
    store: &dyn MarkerStore,
    clock: &dyn Clock,
    resource_id: &str,
    reason: &str,
) {
    tracing::error!(
        target: ALERT_TARGET,
        %resource_id,
        reason,
        "MANUAL INTERVENTION REQUIRED: billed compute resource could not be stopped"
    );
    let record = AlertRecord {
        raised_at: clock.now().to_rfc3339(),
        resource_id: resource_id.to_owned(),
        code: "BF-MANUAL-INTERVENTION".to_owned(),
        reason: reason.to_owned(),
    };
    if let Err(error) = write_marker(store, ALERT_KEY, &record) {
        tracing::error!(
            target: ALERT_TARGET,
            %error,
            "alert record could not be persisted; log line above is the only trace"
        );
    }
}
