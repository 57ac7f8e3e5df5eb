use anyhow::{anyhow, Context, Result};
use std::fmt;
use std::path::Path;
use std::process::{Command, ExitStatus};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub fn read_to_string(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))
}

/// Returned (inside `anyhow::Error`) when a child outlives its deadline.
///
/// The child has already been killed and reaped when this is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedOut {
    pub after: Duration,
}

impl fmt::Display for TimedOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timed out after {}s", self.after.as_secs_f64())
    }
}

impl std::error::Error for TimedOut {}

/// Spawn `cmd` and wait at most `timeout` for it to exit.
///
/// Stdio is whatever the caller configured on `cmd`. Callers that pipe output must
/// point it at a file, since nothing drains pipes while we poll.
pub fn run_with_timeout(cmd: &mut Command, timeout: Duration) -> Result<ExitStatus> {
    let mut child = cmd.spawn().with_context(|| format!("spawn {:?}", cmd))?;
    let deadline = Instant::now() + timeout;

    loop {
        if let Some(status) = child.try_wait().with_context(|| format!("wait {:?}", cmd))? {
            return Ok(status);
        }

        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(anyhow::Error::new(TimedOut { after: timeout }))
                .with_context(|| format!("{:?}", cmd));
        }

        std::thread::sleep(POLL_INTERVAL);
    }
}

pub fn run_ok_with_timeout(cmd: &mut Command, timeout: Duration) -> Result<()> {
    let status = run_with_timeout(cmd, timeout)?;
    if status.success() {
        Ok(())
    } else {
        Err(anyhow!("command failed: {:?}\nstatus: {}", cmd, status))
    }
}

pub fn is_timeout(err: &anyhow::Error) -> bool {
    err.downcast_ref::<TimedOut>().is_some()
}

/// Host identifier used to scope artifact names.
///
/// Inside a pod this is the pod name. Path separators are replaced so the value is
/// always usable as a file name component.
pub fn host_id() -> String {
    let raw = nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown-host".to_string());

    raw.replace(['/', '\\'], "_")
}
