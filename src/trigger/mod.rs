use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

/// One user-command invocation handed to the spawner.
#[derive(Debug, Clone)]
pub struct TriggerRequest {
    pub path: PathBuf,
    /// Positional arguments after the command path.
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Block until the child exits; otherwise the child is reaped in the
    /// background.
    pub sync: bool,
    /// Reporter tag for logging (e.g. "page", "page-error-counter").
    pub kind: &'static str,
}

/// Process spawner seam. The accounting core hands invocations here and
/// never bases control decisions on a trigger's exit status.
pub trait TriggerSpawner: Send {
    fn run(&self, req: TriggerRequest) -> Result<()>;
}

/// Spawns trigger commands as real child processes.
///
/// Synchronous runs block the caller until the child exits or, when a
/// timeout is configured, until the child is killed at the deadline.
pub struct ProcessSpawner {
    sync_timeout: Option<Duration>,
}

impl ProcessSpawner {
    pub fn new(sync_timeout: Option<Duration>) -> Self {
        Self { sync_timeout }
    }

    fn wait_with_timeout(&self, child: &mut Child, req: &TriggerRequest) -> Result<ExitStatus> {
        let Some(timeout) = self.sync_timeout else {
            return child
                .wait()
                .with_context(|| format!("waiting for {} trigger", req.kind));
        };
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = child
                .try_wait()
                .with_context(|| format!("waiting for {} trigger", req.kind))?
            {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                warn!(kind = req.kind, path = %req.path.display(),
                    timeout = ?timeout, "trigger exceeded timeout, killing");
                let _ = child.kill();
                return child
                    .wait()
                    .with_context(|| format!("reaping killed {} trigger", req.kind));
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

impl TriggerSpawner for ProcessSpawner {
    fn run(&self, req: TriggerRequest) -> Result<()> {
        let mut cmd = Command::new(&req.path);
        cmd.args(&req.argv).envs(req.env.iter().cloned());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning {} trigger {}", req.kind, req.path.display()))?;

        if req.sync {
            let status = self.wait_with_timeout(&mut child, &req)?;
            if !status.success() {
                warn!(kind = req.kind, path = %req.path.display(), %status,
                    "trigger exited unsuccessfully");
            }
        } else {
            // Reap off the accounting path so async triggers never block it.
            std::thread::spawn(move || {
                let _ = child.wait();
            });
        }

        debug!(kind = req.kind, path = %req.path.display(), sync = req.sync, "trigger dispatched");
        Ok(())
    }
}

/// Inputs for the threshold environment block.
#[derive(Debug, Clone, Copy)]
pub struct ThresholdEnv<'a> {
    /// Bucket summary string.
    pub threshold: &'a str,
    pub total_count: u64,
    /// Unix time of the event; omitted from the block when zero.
    pub last_event: i64,
    pub agetime_secs: u64,
    pub message: &'a str,
    pub threshold_count: u64,
    /// DIMM location string, when the event could be attributed.
    pub location: Option<&'a str>,
}

/// Build the environment block every threshold trigger receives. Order is
/// not significant.
pub fn env_block(e: &ThresholdEnv<'_>) -> Vec<(String, String)> {
    let mut env = Vec::with_capacity(8);
    env.push(("THRESHOLD".to_string(), e.threshold.to_string()));
    env.push(("TOTALCOUNT".to_string(), e.total_count.to_string()));
    if e.last_event != 0 {
        env.push(("LASTEVENT".to_string(), e.last_event.to_string()));
    }
    env.push(("AGETIME".to_string(), e.agetime_secs.to_string()));
    env.push(("MESSAGE".to_string(), e.message.to_string()));
    env.push(("THRESHOLD_COUNT".to_string(), e.threshold_count.to_string()));
    if let Some(loc) = e.location {
        env.push(("LOCATION".to_string(), loc.to_string()));
    }
    env
}

/// Verify a configured trigger path points at an executable file.
pub fn check_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let meta = std::fs::metadata(path)
        .with_context(|| format!("cannot access trigger `{}`", path.display()))?;
    if !meta.is_file() {
        bail!("trigger `{}` is not a regular file", path.display());
    }
    if meta.permissions().mode() & 0o111 == 0 {
        bail!("trigger `{}` is not executable", path.display());
    }
    Ok(())
}
