//! Platform process and process-group control
//!
//! Orchestration code talks to a [`ProcessController`]; the concrete
//! implementation is picked at compile time by [`default_controller`].
//! Unix signals the process (group) and can shut down gracefully. Windows
//! has no graceful signal and tree-kills directly.

use crate::error::{Error, Result};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Result of delivering a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    /// The signal was delivered
    Delivered,
    /// No such process; it had already exited
    NotRunning,
}

/// Platform strategy for signalling processes
pub trait ProcessController: Send + Sync + fmt::Debug {
    /// Whether a process with `pid` currently exists
    fn is_alive(&self, pid: u32) -> bool;

    /// Ask a single process to exit
    fn terminate(&self, pid: u32) -> Result<SignalOutcome>;

    /// Force a single process to exit
    fn kill(&self, pid: u32) -> Result<SignalOutcome>;

    /// Ask every process in group `pgid` to exit
    fn terminate_group(&self, pgid: u32) -> Result<SignalOutcome>;

    /// Force every process in group `pgid` to exit
    fn kill_group(&self, pgid: u32) -> Result<SignalOutcome>;

    /// Whether [`ProcessController::terminate`] gives the target a chance to clean up
    fn supports_graceful(&self) -> bool;
}

/// The controller for the platform this binary was built for
pub fn default_controller() -> Arc<dyn ProcessController> {
    #[cfg(unix)]
    {
        Arc::new(UnixProcessController)
    }
    #[cfg(not(unix))]
    {
        Arc::new(WindowsProcessController)
    }
}

/// Signal-based controller for Unix
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixProcessController;

#[cfg(unix)]
impl UnixProcessController {
    fn to_pid(pid: u32) -> Result<nix::unistd::Pid> {
        let raw = i32::try_from(pid).map_err(|_| Error::process(format!("invalid pid {pid}")))?;
        if raw <= 0 {
            return Err(Error::process(format!("invalid pid {pid}")));
        }
        Ok(nix::unistd::Pid::from_raw(raw))
    }

    fn deliver(
        pid: u32,
        group: bool,
        signal: nix::sys::signal::Signal,
    ) -> Result<SignalOutcome> {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, killpg};

        let target = Self::to_pid(pid)?;
        let result = if group {
            killpg(target, signal)
        } else {
            kill(target, signal)
        };
        match result {
            Ok(()) => Ok(SignalOutcome::Delivered),
            Err(Errno::ESRCH) => Ok(SignalOutcome::NotRunning),
            Err(errno) => Err(Error::process(format!(
                "failed to send {signal} to {}{pid}: {errno}",
                if group { "group " } else { "" }
            ))),
        }
    }
}

#[cfg(unix)]
impl ProcessController for UnixProcessController {
    fn is_alive(&self, pid: u32) -> bool {
        use nix::errno::Errno;
        let Ok(target) = Self::to_pid(pid) else {
            return false;
        };
        match nix::sys::signal::kill(target, None) {
            Ok(()) | Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    fn terminate(&self, pid: u32) -> Result<SignalOutcome> {
        Self::deliver(pid, false, nix::sys::signal::Signal::SIGTERM)
    }

    fn kill(&self, pid: u32) -> Result<SignalOutcome> {
        Self::deliver(pid, false, nix::sys::signal::Signal::SIGKILL)
    }

    fn terminate_group(&self, pgid: u32) -> Result<SignalOutcome> {
        Self::deliver(pgid, true, nix::sys::signal::Signal::SIGTERM)
    }

    fn kill_group(&self, pgid: u32) -> Result<SignalOutcome> {
        Self::deliver(pgid, true, nix::sys::signal::Signal::SIGKILL)
    }

    fn supports_graceful(&self) -> bool {
        true
    }
}

/// `taskkill`/`tasklist` based controller for Windows
#[cfg(not(unix))]
#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsProcessController;

#[cfg(not(unix))]
impl WindowsProcessController {
    fn taskkill(pid: u32, tree: bool) -> Result<SignalOutcome> {
        let mut cmd = std::process::Command::new("taskkill");
        if tree {
            cmd.arg("/T");
        }
        let output = cmd
            .args(["/F", "/PID", &pid.to_string()])
            .output()
            .map_err(|e| Error::process(format!("failed to run taskkill: {e}")))?;
        if output.status.success() {
            return Ok(SignalOutcome::Delivered);
        }
        // exit code 128: process not found
        if output.status.code() == Some(128) {
            return Ok(SignalOutcome::NotRunning);
        }
        Err(Error::process(format!(
            "taskkill {pid} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

#[cfg(not(unix))]
impl ProcessController for WindowsProcessController {
    fn is_alive(&self, pid: u32) -> bool {
        if pid == 0 {
            return false;
        }
        std::process::Command::new("tasklist")
            .args(["/FI", &format!("PID eq {pid}"), "/NH", "/FO", "CSV"])
            .output()
            .map(|out| String::from_utf8_lossy(&out.stdout).contains(&format!("\"{pid}\"")))
            .unwrap_or(false)
    }

    fn terminate(&self, pid: u32) -> Result<SignalOutcome> {
        Self::taskkill(pid, false)
    }

    fn kill(&self, pid: u32) -> Result<SignalOutcome> {
        Self::taskkill(pid, false)
    }

    fn terminate_group(&self, pgid: u32) -> Result<SignalOutcome> {
        Self::taskkill(pgid, true)
    }

    fn kill_group(&self, pgid: u32) -> Result<SignalOutcome> {
        Self::taskkill(pgid, true)
    }

    fn supports_graceful(&self) -> bool {
        false
    }
}

/// Two-phase shutdown of a spawned child.
///
/// Sends a graceful terminate (to the whole process group when `group` is
/// set and the child was spawned as a group leader), waits up to `grace`,
/// force-kills if the child is still alive, then waits at most
/// `final_wait` for it to be reaped.
pub async fn shutdown_child(
    controller: &dyn ProcessController,
    child: &mut Child,
    group: bool,
    grace: Duration,
    final_wait: Duration,
) -> Result<()> {
    let Some(pid) = child.id() else {
        return Ok(());
    };

    if controller.supports_graceful() {
        let outcome = if group {
            controller.terminate_group(pid)
        } else {
            controller.terminate(pid)
        };
        match outcome {
            Ok(SignalOutcome::NotRunning) => {
                let _ = timeout(final_wait, child.wait()).await;
                return Ok(());
            }
            Ok(SignalOutcome::Delivered) => {
                if let Ok(Ok(status)) = timeout(grace, child.wait()).await {
                    debug!(pid, %status, "Process exited after terminate");
                    return Ok(());
                }
            }
            Err(e) => warn!(pid, error = %e, "Graceful terminate failed, forcing kill"),
        }
    }

    let outcome = if group {
        controller.kill_group(pid)
    } else {
        controller.kill(pid)
    };
    if let Err(e) = outcome {
        warn!(pid, error = %e, "Force kill failed");
        // Fall back to the handle-based kill of the direct child
        let _ = child.start_kill();
    }

    match timeout(final_wait, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(pid, %status, "Process exited after kill");
            Ok(())
        }
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(Error::timeout(format!(
            "process {pid} did not exit within {final_wait:?}"
        ))),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::process::Command;

    #[test]
    fn test_is_alive() {
        let controller = UnixProcessController;
        assert!(controller.is_alive(std::process::id()));
        assert!(!controller.is_alive(0));
    }

    #[test]
    fn test_signal_missing_process() {
        let controller = UnixProcessController;
        // pid_max on Linux is at most 2^22
        let outcome = controller.kill(4_194_304 + 17).unwrap();
        assert_eq!(outcome, SignalOutcome::NotRunning);
    }

    #[tokio::test]
    async fn test_shutdown_child_group() {
        let mut child = Command::new("sh")
            .args(["-c", "sleep 30 & wait"])
            .process_group(0)
            .spawn()
            .unwrap();
        let controller = UnixProcessController;
        shutdown_child(
            &controller,
            &mut child,
            true,
            Duration::from_millis(500),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert!(child.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_shutdown_already_exited_child() {
        let mut child = Command::new("true").spawn().unwrap();
        child.wait().await.unwrap();

        shutdown_child(
            &UnixProcessController,
            &mut child,
            false,
            Duration::from_millis(100),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    }
}
