//! Supervision of the `perf record` child process.
//!
//! [`start`] spawns the sampler in its own process group and verifies it came
//! up: it must survive a short delay and then have created its output file.
//! The controller only ever observes the child's liveness and output file.

use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitid, Id, WaitPidFlag};
use nix::unistd::Pid;

use crate::cores::CoreSet;
use crate::error::StartError;

/// The `perf record` invocation for a run.
#[derive(Debug, Clone)]
pub struct SamplerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub output: PathBuf,
}

impl SamplerCommand {
    pub fn perf_record(
        perf: &Path,
        events: &str,
        extra: &[String],
        cores: &CoreSet,
        output: &Path,
    ) -> Self {
        let mut args = vec!["record".to_string(), "-e".to_string(), events.to_string()];
        args.extend(extra.iter().cloned());
        args.extend(cores.perf_args());
        args.push("-o".to_string());
        args.push(output.display().to_string());

        SamplerCommand {
            program: perf.to_path_buf(),
            args,
            output: output.to_path_buf(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        // Own process group: a terminal Ctrl-C reaches the controller only,
        // which then stops the sampler itself.
        cmd.process_group(0);
        cmd
    }
}

impl std::fmt::Display for SamplerCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.program.display(), self.args.join(" "))
    }
}

/// Delays used to verify the sampler came up.
#[derive(Debug, Clone, Copy)]
pub struct StartTiming {
    /// Wait before the first liveness check.
    pub liveness_delay: Duration,
    /// Further wait before checking for the output file.
    pub output_delay: Duration,
}

impl Default for StartTiming {
    fn default() -> Self {
        StartTiming {
            liveness_delay: Duration::from_secs(1),
            output_delay: Duration::from_secs(1),
        }
    }
}

/// Lifecycle of the supervised child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    /// Exited after we asked it to stop.
    Stopped(ExitStatus),
    /// Exited without being asked.
    Crashed(ExitStatus),
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessState::Running => f.write_str("still running"),
            ProcessState::Stopped(status) => write!(f, "stopped on request ({status})"),
            ProcessState::Crashed(status) => write!(f, "exited on its own ({status})"),
        }
    }
}

/// A running sampler owned by the lifecycle controller.
///
/// The child is reaped exactly once. Dropping a process that is still
/// running kills and reaps it.
pub struct SupervisedProcess {
    pid: Pid,
    child: Mutex<Child>,
    status: Mutex<Option<ExitStatus>>,
    stop_sent: AtomicBool,
}

/// Spawn the sampler and verify it is running and writing its output file.
pub fn start(cmd: &SamplerCommand, timing: StartTiming) -> Result<SupervisedProcess, StartError> {
    tracing::debug!("Spawning: {cmd}");
    let child = cmd.command().spawn().map_err(|source| StartError::Spawn {
        program: cmd.program.display().to_string(),
        source,
    })?;
    let process = SupervisedProcess::new(child);
    tracing::info!("Sampler started (PID {})", process.pid());

    thread::sleep(timing.liveness_delay);
    if !process.is_alive() {
        return Err(StartError::ImmediateExit {
            status: process.exit_status(),
        });
    }

    thread::sleep(timing.output_delay);
    if !cmd.output.exists() {
        tracing::warn!(
            "Sampler (PID {}) has not created {}, stopping it",
            process.pid(),
            cmd.output.display()
        );
        process.stop();
        return Err(StartError::NoOutputFile {
            path: cmd.output.clone(),
        });
    }

    Ok(process)
}

impl SupervisedProcess {
    fn new(child: Child) -> Self {
        SupervisedProcess {
            pid: Pid::from_raw(child.id() as i32),
            child: Mutex::new(child),
            status: Mutex::new(None),
            stop_sent: AtomicBool::new(false),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// Non-blocking exit check, reaping the child if it has exited.
    fn poll(&self) -> io::Result<Option<ExitStatus>> {
        let mut status = self.status.lock().unwrap();
        if status.is_some() {
            return Ok(*status);
        }
        let mut child = self.child.lock().unwrap();
        if let Some(exited) = child.try_wait()? {
            *status = Some(exited);
        }
        Ok(*status)
    }

    pub fn is_alive(&self) -> bool {
        match self.poll() {
            Ok(status) => status.is_none(),
            Err(e) => {
                tracing::warn!("Could not query sampler (PID {}): {e}", self.pid);
                false
            }
        }
    }

    /// Exit status, if the child has been reaped.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.poll().ok().flatten()
    }

    pub fn state(&self) -> ProcessState {
        match self.exit_status() {
            None => ProcessState::Running,
            Some(status) if self.stop_sent.load(Ordering::Acquire) => {
                ProcessState::Stopped(status)
            }
            Some(status) => ProcessState::Crashed(status),
        }
    }

    /// Block until the child exits, then reap it.
    ///
    /// Waits without reaping so the status is still collected through
    /// [`Child`]; does not hold any lock while blocked.
    pub fn wait(&self) -> Option<ExitStatus> {
        if let Some(status) = self.exit_status() {
            return Some(status);
        }
        loop {
            match waitid(Id::Pid(self.pid), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
                Ok(_) | Err(Errno::ECHILD) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    tracing::warn!("waitid on sampler (PID {}) failed: {e}", self.pid);
                    break;
                }
            }
        }
        let mut status = self.status.lock().unwrap();
        let mut child = self.child.lock().unwrap();
        if status.is_none() {
            match child.wait() {
                Ok(exited) => *status = Some(exited),
                Err(e) => tracing::warn!("Could not reap sampler (PID {}): {e}", self.pid),
            }
        }
        *status
    }

    /// Ask the sampler to stop with SIGINT and wait for it to exit.
    ///
    /// A child that is already gone counts as stopped.
    pub fn stop(&self) -> Option<ExitStatus> {
        if let Some(status) = self.exit_status() {
            return Some(status);
        }
        self.stop_sent.store(true, Ordering::Release);
        match kill(self.pid, Signal::SIGINT) {
            Ok(()) => tracing::info!(
                "Sent SIGINT to sampler (PID {}), waiting for it to exit",
                self.pid
            ),
            Err(Errno::ESRCH) => tracing::debug!("Sampler (PID {}) already gone", self.pid),
            Err(e) => tracing::warn!("Failed to signal sampler (PID {}): {e}", self.pid),
        }
        self.wait()
    }
}

impl Drop for SupervisedProcess {
    fn drop(&mut self) {
        let Ok(child) = self.child.get_mut() else {
            return;
        };
        let Ok(status) = self.status.get_mut() else {
            return;
        };
        if status.is_none() && matches!(child.try_wait(), Ok(None)) {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> StartTiming {
        StartTiming {
            liveness_delay: Duration::from_millis(200),
            output_delay: Duration::from_millis(200),
        }
    }

    fn sh(script: &str, output: &Path) -> SamplerCommand {
        SamplerCommand {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            output: output.to_path_buf(),
        }
    }

    #[test]
    fn test_perf_record_args() {
        let cmd = SamplerCommand::perf_record(
            Path::new("/usr/bin/perf"),
            "cycles",
            &["-F".to_string(), "99".to_string()],
            &CoreSet::List("1-3".to_string()),
            Path::new("/out/x.data"),
        );
        assert_eq!(
            cmd.args,
            vec!["record", "-e", "cycles", "-F", "99", "-C", "1-3", "-o", "/out/x.data"]
        );

        let cmd = SamplerCommand::perf_record(
            Path::new("perf"),
            "cycles",
            &[],
            &CoreSet::All,
            Path::new("x.data"),
        );
        assert_eq!(cmd.args, vec!["record", "-e", "cycles", "-a", "-o", "x.data"]);
    }

    #[test]
    fn test_start_and_stop() {
        let dir = tempfile::TempDir::new().unwrap();
        let out = dir.path().join("out.data");
        let script = format!(
            "trap 'exit 0' INT; touch {}; while true; do sleep 0.1; done",
            out.display()
        );
        let process = start(&sh(&script, &out), fast()).unwrap();
        assert!(process.is_alive());
        assert_eq!(process.state(), ProcessState::Running);

        let status = process.stop().unwrap();
        assert!(status.success());
        assert!(!process.is_alive());
        assert!(matches!(process.state(), ProcessState::Stopped(_)));
        assert!(process.state().to_string().starts_with("stopped on request"));

        // stopping again is harmless
        assert_eq!(process.stop(), Some(status));
    }

    #[test]
    fn test_immediate_exit() {
        let dir = tempfile::TempDir::new().unwrap();
        let out = dir.path().join("out.data");
        let err = start(&sh("exit 3", &out), fast()).err().unwrap();
        match err {
            StartError::ImmediateExit { status } => assert_eq!(status.unwrap().code(), Some(3)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_no_output_file_stops_child() {
        let dir = tempfile::TempDir::new().unwrap();
        let out = dir.path().join("never.data");
        let marker = dir.path().join("got-int");
        let script = format!(
            "trap 'touch {}; exit 0' INT; while true; do sleep 0.1; done",
            marker.display()
        );
        let err = start(&sh(&script, &out), fast()).err().unwrap();
        assert!(matches!(err, StartError::NoOutputFile { .. }));
        assert!(marker.exists(), "sampler should have received SIGINT");
    }

    #[test]
    fn test_spawn_failure() {
        let cmd = SamplerCommand {
            program: PathBuf::from("/nonexistent/perf"),
            args: Vec::new(),
            output: PathBuf::from("/nonexistent/out"),
        };
        assert!(matches!(start(&cmd, fast()), Err(StartError::Spawn { .. })));
    }

    #[test]
    fn test_crash_is_observed() {
        let dir = tempfile::TempDir::new().unwrap();
        let out = dir.path().join("out.data");
        let script = format!("touch {}; sleep 0.6; exit 2", out.display());
        let process = start(&sh(&script, &out), fast()).unwrap();
        let status = process.wait().unwrap();
        assert_eq!(status.code(), Some(2));
        assert!(matches!(process.state(), ProcessState::Crashed(_)));
        assert!(process.state().to_string().starts_with("exited on its own"));
    }
}
