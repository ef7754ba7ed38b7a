//! youki invocations.

use crate::error::RuntimeError;
use crate::runtime::TaskStatus;
use log::{debug, error};
use nix::errno::Errno;
use serde::Deserialize;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// The youki binary and the root directory it keeps container state in.
#[derive(Debug, Clone)]
pub struct Youki {
    path: PathBuf,
    root: Option<PathBuf>,
}

/// Output of `youki state`.
#[derive(Debug, Clone, Deserialize)]
pub struct YoukiState {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub pid: Option<i32>,
    #[serde(default)]
    pub bundle: Option<PathBuf>,
}

impl YoukiState {
    pub fn task_status(&self) -> TaskStatus {
        match self.status.as_str() {
            "creating" => TaskStatus::Creating,
            "created" => TaskStatus::Created,
            "running" => TaskStatus::Running,
            "paused" => TaskStatus::Paused,
            "stopped" => TaskStatus::Stopped,
            _ => TaskStatus::Unknown,
        }
    }
}

impl Youki {
    pub fn new(path: PathBuf, root: Option<PathBuf>) -> Self {
        Self { path, root }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.path);
        if let Some(root) = &self.root {
            cmd.arg("--root").arg(root);
        }
        cmd
    }

    /// Run a short-lived youki command and return its stdout.
    pub async fn run(&self, args: &[&str]) -> Result<String, RuntimeError> {
        debug!("Executing youki {} {}", self.path.display(), args.join(" "));

        let output = self
            .command()
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| spawn_error(&self.path, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let err = classify_failure(args.first().copied().unwrap_or(""), &stderr);
            debug!("youki {} failed: {}", args.join(" "), err);
            return Err(err);
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Check that the binary can be executed at all.
    pub async fn probe(&self) -> Result<(), RuntimeError> {
        self.run(&["--version"]).await.map(|_| ())
    }

    pub async fn state(&self, id: &str) -> Result<YoukiState, RuntimeError> {
        let stdout = self.run(&["state", id]).await?;
        serde_json::from_str(&stdout)
            .map_err(|e| RuntimeError::Command(format!("invalid youki state for {id}: {e}")))
    }

    /// `youki create`, returning the pid of the container init process.
    ///
    /// With `inherit_stdio` the container process gets this process' stdio.
    pub async fn create(
        &self,
        id: &str,
        bundle: &Path,
        inherit_stdio: bool,
    ) -> Result<i32, RuntimeError> {
        let pid_file = bundle.join("container.pid");
        let _ = tokio::fs::remove_file(&pid_file).await;

        let stdio = || {
            if inherit_stdio {
                Stdio::inherit()
            } else {
                Stdio::null()
            }
        };

        // The container init process keeps whatever stdio youki create had.
        let status = self
            .command()
            .arg("create")
            .arg("--bundle")
            .arg(bundle)
            .arg("--pid-file")
            .arg(&pid_file)
            .arg(id)
            .stdin(stdio())
            .stdout(stdio())
            .stderr(stdio())
            .status()
            .await
            .map_err(|e| spawn_error(&self.path, e))?;
        if !status.success() {
            error!("youki create {} exited with {}", id, status);
            return Err(RuntimeError::Command(format!(
                "youki create exited with non-zero: {status}"
            )));
        }

        let pid_str = tokio::fs::read_to_string(&pid_file)
            .await
            .map_err(|e| RuntimeError::Command(format!("Could not read pid file: {e}")))?;
        let pid = pid_str
            .trim()
            .parse::<i32>()
            .map_err(|e| RuntimeError::Command(format!("Failed to parse PID: {e}")))?;
        let _ = tokio::fs::remove_file(&pid_file).await;
        Ok(pid)
    }
}

/// Failing to spawn youki at all means the runtime is not reachable right
/// now, e.g. the binary is missing or being replaced.
fn spawn_error(path: &Path, e: io::Error) -> RuntimeError {
    let transient = e.kind() == io::ErrorKind::NotFound
        || e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == Some(Errno::ETXTBSY as i32)
        || e.raw_os_error() == Some(Errno::EAGAIN as i32);
    if transient {
        RuntimeError::Unavailable(format!("cannot execute {}: {e}", path.display()))
    } else {
        RuntimeError::Command(format!("Failed to execute youki: {e}"))
    }
}

/// Map the stderr of a failed youki command to an error kind.
fn classify_failure(subcommand: &str, stderr: &str) -> RuntimeError {
    let lower = stderr.to_lowercase();
    let msg = format!("youki {subcommand}: {}", stderr.trim());
    if lower.contains("does not exist") || lower.contains("not found") {
        RuntimeError::NotFound(msg)
    } else if lower.contains("already exists") {
        RuntimeError::AlreadyExists(msg)
    } else {
        RuntimeError::Command(msg)
    }
}
