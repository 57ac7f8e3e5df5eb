use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

/// SIGKILL the runtime so the orchestrator sees it exit and restarts the container.
///
/// Returns whether the signal was delivered. A process that is already gone counts
/// as a failure here but is harmless.
pub fn terminate(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), Signal::SIGKILL) {
        Ok(()) => {
            tracing::info!(pid, "sent SIGKILL to runtime");
            true
        }
        Err(errno) => {
            tracing::warn!(pid, error = %errno, "could not signal runtime");
            false
        }
    }
}
