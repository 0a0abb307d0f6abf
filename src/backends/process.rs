//! Child process supervision for locally hosted engines
//!
//! `kroko-server` and `llama-server` can be started by the backend that uses
//! them. The child is killed when the backend shuts down, and on drop as a
//! last resort.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::base::{BackendError, BackendResult};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolve a binary name or path on the blocking pool.
pub async fn resolve_binary(program: &str) -> BackendResult<PathBuf> {
    let program = program.to_string();
    tokio::task::spawn_blocking(move || {
        which::which(&program)
            .map_err(|e| BackendError::Process(format!("binary '{program}' not found: {e}")))
    })
    .await
    .map_err(|e| BackendError::Process(format!("binary lookup task failed: {e}")))?
}

/// Whether `program` resolves on PATH (or as a path).
pub fn binary_available(program: &str) -> bool {
    which::which(program).is_ok()
}

/// A supervised child process
pub struct ManagedProcess {
    label: String,
    pid: Option<u32>,
    child: Mutex<Option<Child>>,
}

impl ManagedProcess {
    /// Spawn `program` with `args`, forwarding its stderr to the log.
    pub async fn spawn(label: &str, program: &str, args: &[String]) -> BackendResult<Self> {
        let path = resolve_binary(program).await?;

        let mut child = Command::new(&path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BackendError::Process(format!("failed to start {label}: {e}")))?;

        let pid = child.id();
        info!(process = %label, pid = ?pid, binary = %path.display(), "Started child process");

        if let Some(stderr) = child.stderr.take() {
            let label = label.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(process = %label, "{}", line);
                }
            });
        }

        Ok(Self {
            label: label.to_string(),
            pid,
            child: Mutex::new(Some(child)),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether the child is still alive.
    pub async fn is_running(&self) -> bool {
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Kill the child and reap it. Idempotent.
    pub async fn stop(&self) -> BackendResult<()> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };

        if let Err(e) = child.start_kill() {
            // Already exited
            debug!(process = %self.label, error = %e, "Kill signal not delivered");
        }

        match timeout(STOP_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => {
                info!(process = %self.label, %status, "Child process stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(BackendError::Process(format!(
                "failed to reap {}: {e}",
                self.label
            ))),
            Err(_) => {
                warn!(process = %self.label, "Child process did not exit in time");
                Err(BackendError::Process(format!(
                    "{} did not exit within {}s",
                    self.label,
                    STOP_TIMEOUT.as_secs()
                )))
            }
        }
    }
}
