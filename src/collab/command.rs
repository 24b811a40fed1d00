//! Capture by running an external executable.
//!
//! The platform screenshot tool is wrapped in a small script that writes a PNG
//! to the path it is given, e.g. `grim "$SNAPQ_OUTPUT"` or
//! `screencapture -x "$1"`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Capture, CaptureError};
use crate::model::work::ArtifactRef;

pub const DEFAULT_CAPTURE_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs `command <output-path>` with `SNAPQ_OUTPUT` set to the same path.
///
/// The child gets a null stdin and is killed if it outlives `timeout` or the
/// capture future is dropped.
#[derive(Debug, Clone)]
pub struct CommandCapture {
    command: PathBuf,
    output_dir: PathBuf,
    timeout: Duration,
}

impl CommandCapture {
    pub fn new(command: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            output_dir: output_dir.into(),
            timeout: DEFAULT_CAPTURE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Next artifact path: `ss-<utc timestamp>-<short uuid>.png`.
    pub fn next_artifact_path(&self) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%d-%H%M%S-%6f");
        let suffix = &Uuid::new_v4().simple().to_string()[..8];
        self.output_dir.join(format!("ss-{stamp}-{suffix}.png"))
    }

    fn resolve_command(&self) -> Result<PathBuf, CaptureError> {
        // Relative commands resolve against the process CWD, not the output dir.
        if self.command.is_relative() && self.command.components().count() > 1 {
            let cwd = std::env::current_dir()
                .map_err(|e| CaptureError(format!("cannot resolve working directory: {e}")))?;
            Ok(cwd.join(&self.command))
        } else {
            Ok(self.command.clone())
        }
    }
}

#[async_trait]
impl Capture for CommandCapture {
    async fn capture(&self) -> Result<ArtifactRef, CaptureError> {
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| {
                CaptureError(format!(
                    "cannot create artifact dir {}: {e}",
                    self.output_dir.display()
                ))
            })?;

        let output = self.next_artifact_path();
        let command = self.resolve_command()?;

        debug!(
            command = %command.display(),
            output = %output.display(),
            "running capture command"
        );

        let mut child = Command::new(&command)
            .arg(&output)
            .env("SNAPQ_OUTPUT", &output)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CaptureError(format!("cannot run {}: {e}", command.display())))?;

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => status.map_err(|e| {
                CaptureError(format!("cannot wait for {}: {e}", command.display()))
            })?,
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!("cannot kill capture command: {e}");
                }
                let _ = tokio::fs::remove_file(&output).await;
                return Err(CaptureError(format!(
                    "capture command timed out after {:?}",
                    self.timeout
                )));
            }
        };

        if !status.success() {
            // Don't leave a partial file behind.
            let _ = tokio::fs::remove_file(&output).await;
            return Err(CaptureError(format!(
                "capture command exited with status {}",
                status.code().unwrap_or(-1)
            )));
        }

        ensure_non_empty(&output).await?;
        Ok(ArtifactRef::from_path(&output))
    }
}

async fn ensure_non_empty(path: &Path) -> Result<(), CaptureError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.len() > 0 => Ok(()),
        Ok(_) => {
            let _ = tokio::fs::remove_file(path).await;
            Err(CaptureError(format!(
                "capture produced an empty file: {}",
                path.display()
            )))
        }
        Err(e) => Err(CaptureError(format!(
            "capture produced no file at {}: {e}",
            path.display()
        ))),
    }
}
