//! Deploying a (rewritten) manifest into a named project. The production
//! implementation shells out to the compose CLI; restore pipelines only
//! ever see the [`ComposeDeployer`] trait.

use crate::error::CoreError;
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployMode {
    /// `up -d`: create and start everything.
    Up,
    /// `up -d --no-start`: create containers but leave them stopped, so
    /// volumes can be injected offline first.
    CreateOnly,
}

#[async_trait]
pub trait ComposeDeployer: Send + Sync {
    async fn deploy(
        &self,
        project: &str,
        manifest: &Path,
        env_file: Option<&Path>,
        mode: DeployMode,
    ) -> Result<(), CoreError>;
}

pub struct ComposeCli;

#[async_trait]
impl ComposeDeployer for ComposeCli {
    async fn deploy(
        &self,
        project: &str,
        manifest: &Path,
        env_file: Option<&Path>,
        mode: DeployMode,
    ) -> Result<(), CoreError> {
        let mut cmd = Command::new("docker");
        cmd.arg("compose")
            .arg("-p")
            .arg(project)
            .arg("-f")
            .arg(manifest);
        if let Some(env_file) = env_file {
            cmd.arg("--env-file").arg(env_file);
        }
        cmd.arg("up").arg("-d");
        if mode == DeployMode::CreateOnly {
            cmd.arg("--no-start");
        }
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        tracing::info!(project, ?mode, "running compose deploy");
        let output = cmd
            .output()
            .await
            .map_err(|e| CoreError::DeployFailed(format!("compose CLI not runnable: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CoreError::DeployFailed(format!(
                "compose exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}
