use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

use super::pipeline::PipelineDescription;
use crate::config::RecordingConfig;
use crate::error::{Result, SfuError};

/// How long an interrupted pipeline gets to finalise its output file.
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Starts external media pipelines.
#[async_trait]
pub trait RecorderLauncher: Send + Sync {
    async fn launch(&self, pipeline: &PipelineDescription) -> Result<Box<dyn RecorderProcess>>;
}

/// A running pipeline.
#[async_trait]
pub trait RecorderProcess: Send {
    fn id(&self) -> Option<u32>;

    /// Interrupts the pipeline and waits for it to exit. Calling it again
    /// after the process is gone does nothing.
    async fn stop(&mut self);
}

/// Runs pipelines through `gst-launch-1.0`.
pub struct GstLauncher {
    binary: String,
    cwd: PathBuf,
}

impl GstLauncher {
    pub fn new(binary: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            cwd: cwd.into(),
        }
    }

    pub fn from_config(config: &RecordingConfig) -> Self {
        Self::new(config.gst_launch_bin.clone(), config.gstreamer_cwd.clone())
    }
}

#[async_trait]
impl RecorderLauncher for GstLauncher {
    async fn launch(&self, pipeline: &PipelineDescription) -> Result<Box<dyn RecorderProcess>> {
        let mut command = Command::new(&self.binary);
        command
            .arg("-v")
            .args(pipeline.args())
            .current_dir(&self.cwd)
            .env("GST_DEBUG", "3")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| SfuError::recorder(format!("failed to spawn {}: {}", self.binary, e)))?;

        let pid = child.id();
        tracing::info!(pid = ?pid, pipeline = %pipeline, "Started media pipeline");

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(pid = ?pid, "{}", line);
                }
            });
        }

        Ok(Box::new(GstProcess { child: Some(child) }))
    }
}

struct GstProcess {
    child: Option<Child>,
}

#[async_trait]
impl RecorderProcess for GstProcess {
    fn id(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    async fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        let pid = child.id();

        // SIGINT lets `-e` push EOS through the muxer before exiting.
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Some(raw) = pid {
                if let Err(e) = kill(Pid::from_raw(raw as i32), Signal::SIGINT) {
                    tracing::warn!(pid = raw, error = %e, "Failed to interrupt media pipeline");
                }
            }
        }
        #[cfg(not(unix))]
        {
            if let Err(e) = child.start_kill() {
                tracing::warn!(pid = ?pid, error = %e, "Failed to kill media pipeline");
            }
        }

        match tokio::time::timeout(STOP_GRACE_PERIOD, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(pid = ?pid, %status, "Media pipeline exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(pid = ?pid, error = %e, "Failed to wait for media pipeline");
            }
            Err(_) => {
                tracing::warn!(pid = ?pid, "Media pipeline ignored interrupt, killing it");
                if let Err(e) = child.kill().await {
                    tracing::error!(pid = ?pid, error = %e, "Failed to kill media pipeline");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_binary_is_a_recorder_error() {
        let launcher = GstLauncher::new("/nonexistent/gst-launch-1.0", ".");
        let result = launcher.launch(&PipelineDescription::default()).await;
        assert!(matches!(result, Err(SfuError::Recorder(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_interrupts_and_is_idempotent() {
        // `sh -v -c ..` accepts the leading -v every pipeline gets.
        let launcher = GstLauncher::new("sh", ".");
        let description: PipelineDescription = ["-c", "exec sleep 30"].into_iter().collect();

        let mut process = launcher.launch(&description).await.unwrap();
        assert!(process.id().is_some());

        process.stop().await;
        assert!(process.id().is_none());
        process.stop().await;
    }
}
