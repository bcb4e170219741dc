use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::time::sleep;

/// Failure to spawn a child process.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    /// The underlying `exec`/`fork` call failed.
    #[error("failed to spawn {command}: {source}")]
    Io {
        /// The command that failed to spawn, for diagnostics.
        command: String,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },
}

/// Spawns `command` and returns the running child.
///
/// # Errors
/// Returns [`SpawnError::Io`] if the process could not be started.
pub fn spawn_tracked(mut command: Command) -> Result<Child, SpawnError> {
    let label = format!("{command:?}");
    command.kill_on_drop(true);
    command.spawn().map_err(|source| SpawnError::Io {
        command: label,
        source,
    })
}

/// Owns a running child and makes sure it's reaped.
///
/// `ChildGuard` does not itself kill the process on drop beyond what
/// `kill_on_drop` on the underlying [`Command`] already arranges; it exists
/// to give callers a named place to hang the pid and task handles.
#[derive(Debug)]
pub struct ChildGuard {
    child: Child,
}

impl ChildGuard {
    /// Wraps an already-spawned child.
    pub fn new(child: Child) -> Self {
        Self { child }
    }

    /// The OS process id, if the child hasn't already exited.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Gives back the wrapped child for awaiting/killing directly.
    pub fn into_inner(self) -> Child {
        self.child
    }
}

/// Sends an arbitrary POSIX signal number to a running pid, ignoring the
/// case where the process has already exited.
///
/// Used by protocol handlers relaying a `signal helper command` notify
/// message to a long-lived helper process they don't otherwise manage.
///
/// # Errors
/// Returns an error if `signal` isn't a valid signal number or the kill
/// syscall fails for a reason other than the process already being gone.
pub fn send_signal(pid: u32, signal: i32) -> std::io::Result<()> {
    let Ok(sig) = Signal::try_from(signal) else {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("unknown signal {signal}")));
    };
    match signal::kill(Pid::from_raw(pid as i32), sig) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(err) => Err(std::io::Error::from_raw_os_error(err as i32)),
    }
}

/// Terminates a running child: sends `SIGTERM`, waits up to `grace` for it
/// to exit, then sends `SIGKILL` if it's still running.
///
/// This mirrors the escalation a protocol handler performs when tearing
/// down a setup script that hasn't finished: ask nicely first, then force
/// it.
///
/// # Errors
/// Returns an error if the pid cannot be signalled (e.g. it is no longer a
/// valid process). A child that exits on its own during the grace period
/// is not an error.
pub async fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<()> {
    let Some(pid) = child.id() else {
        return Ok(());
    };
    let nix_pid = Pid::from_raw(pid as i32);

    let _ = signal::kill(nix_pid, Signal::SIGTERM);

    let waited = tokio::select! {
        status = child.wait() => Some(status),
        () = sleep(grace) => None,
    };

    if waited.is_none() {
        let _ = signal::kill(nix_pid, Signal::SIGKILL);
        let _ = child.wait().await;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn terminate_reaps_a_process_that_exits_on_sigterm() {
        let mut command = Command::new("sh");
        command.arg("-c").arg("trap 'exit 0' TERM; sleep 5");
        let mut child = spawn_tracked(command).expect("spawn");

        terminate(&mut child, Duration::from_secs(2))
            .await
            .expect("terminate");

        assert!(child.try_wait().expect("try_wait").is_some());
    }

    #[tokio::test]
    async fn terminate_escalates_to_sigkill_when_ignored() {
        let mut command = Command::new("sh");
        command.arg("-c").arg("trap '' TERM; sleep 5");
        let mut child = spawn_tracked(command).expect("spawn");

        terminate(&mut child, Duration::from_millis(200))
            .await
            .expect("terminate");

        assert!(child.try_wait().expect("try_wait").is_some());
    }
}
