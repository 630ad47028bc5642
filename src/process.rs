//! Subprocess plumbing for the external CLIs (aws, ssh, scp) and the
//! cross-process signal surface used by the watchdog.

use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use sysinfo::{Pid, Signal, System};

use crate::error::{BfError, BfResult};

#[must_use]
pub fn command_exists(program: &str) -> bool {
    which::which(program).is_ok()
}

pub fn run_command(program: &str, args: &[String], cwd: Option<&Path>) -> BfResult<Output> {
    run_command_with_timeout(program, args, cwd, None)
}

pub fn run_command_with_timeout(
    program: &str,
    args: &[String],
    cwd: Option<&Path>,
    timeout: Option<Duration>,
) -> BfResult<Output> {
    if !command_exists(program) {
        return Err(BfError::CommandMissing {
            command: program.to_owned(),
        });
    }

    let rendered = format!("{} {}", program, args.join(" "));
    let mut command = Command::new(program);
    command.args(args);
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    let Some(limit) = timeout else {
        let output = command.output()?;
        return validate_output(&rendered, output);
    };

    let mut child = command.spawn()?;
    let started_at = Instant::now();

    let stdout_rx = drain_pipe(child.stdout.take().expect("stdout piped"));
    let stderr_rx = drain_pipe(child.stderr.take().expect("stderr piped"));

    loop {
        if let Some(status) = child.try_wait()? {
            let stdout = stdout_rx
                .recv_timeout(Duration::from_millis(100))
                .unwrap_or_default();
            let stderr = stderr_rx
                .recv_timeout(Duration::from_millis(100))
                .unwrap_or_default();
            return validate_output(
                &rendered,
                Output {
                    status,
                    stdout,
                    stderr,
                },
            );
        }

        if started_at.elapsed() >= limit {
            let _ = child.kill();
            let _ = child.wait();
            let stderr = stderr_rx
                .recv_timeout(Duration::from_millis(100))
                .unwrap_or_default();
            return Err(BfError::from_command_timeout(
                rendered,
                limit.as_millis().try_into().unwrap_or(u64::MAX),
                String::from_utf8_lossy(&stderr).into_owned(),
            ));
        }

        thread::sleep(Duration::from_millis(20));
    }
}

fn drain_pipe<R: std::io::Read + Send + 'static>(mut pipe: R) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        let _ = tx.send(buf);
    });
    rx
}

fn validate_output(rendered: &str, output: Output) -> BfResult<Output> {
    if output.status.success() {
        return Ok(output);
    }

    let status = output.status.code().unwrap_or(-1);
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    Err(BfError::from_command_failure(
        rendered.to_owned(),
        status,
        stderr,
    ))
}

/// Parsed stdout of a successful command.
pub fn stdout_text(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).trim().to_owned()
}

// ---------------------------------------------------------------------------
// Cross-process signal surface
// ---------------------------------------------------------------------------

/// Liveness probing and signal delivery against an arbitrary pid. The
/// watchdog escalates through `terminate` (cooperative, lets the target's
/// cleanup run) and `kill` (forceful, bypasses cleanup).
pub trait ProcessController: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
    /// Send the graceful-terminate signal. Returns false if delivery failed.
    fn terminate(&self, pid: u32) -> bool;
    /// Send the forceful-kill signal. Returns false if delivery failed.
    fn kill(&self, pid: u32) -> bool;
}

/// Real controller backed by the process table.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessController;

impl SystemProcessController {
    fn signal(&self, pid: u32, signal: Signal) -> bool {
        let mut system = System::new();
        let target = Pid::from_u32(pid);
        if !system.refresh_process(target) {
            return false;
        }
        system
            .process(target)
            .and_then(|process| process.kill_with(signal))
            .unwrap_or(false)
    }
}

impl ProcessController for SystemProcessController {
    fn is_alive(&self, pid: u32) -> bool {
        let mut system = System::new();
        system.refresh_process(Pid::from_u32(pid))
    }

    fn terminate(&self, pid: u32) -> bool {
        self.signal(pid, Signal::Term)
    }

    fn kill(&self, pid: u32) -> bool {
        self.signal(pid, Signal::Kill)
    }
}
