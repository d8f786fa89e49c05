//! Container engine access. The core talks to the engine exclusively
//! through [`EngineClient`]; the production implementation wraps a bollard
//! connection to the local daemon.

pub mod ports;
#[cfg(test)]
pub(crate) mod testing;

use crate::error::CoreError;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, ListContainersOptions,
    LogOutput, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
    UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerInspectResponse, ContainerSummary};
use bollard::network::{CreateNetworkOptions, ListNetworksOptions};
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";
pub const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";

/// Buffered exec output is capped; dumps go through `stdout_file` instead.
const EXEC_BUF_CAP: usize = 64 * 1024;

#[derive(Debug, Default, Clone)]
pub struct ExecRequest {
    pub cmd: Vec<String>,
    /// Stream this file into the exec's stdin, then close it.
    pub stdin_file: Option<PathBuf>,
    /// Write stdout here instead of buffering it.
    pub stdout_file: Option<PathBuf>,
}

impl ExecRequest {
    pub fn shell(script: impl Into<String>) -> Self {
        Self {
            cmd: vec!["sh".into(), "-c".into(), script.into()],
            ..Default::default()
        }
    }
}

#[derive(Debug, Default)]
pub struct ExecOutput {
    pub exit_code: Option<i64>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Total stdout length, counted even when redirected to a file.
    pub stdout_bytes: u64,
}

impl ExecOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

#[async_trait]
pub trait EngineClient: Send + Sync {
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, CoreError>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspectResponse, CoreError>;

    async fn exec(&self, container_id: &str, req: ExecRequest) -> Result<ExecOutput, CoreError>;

    /// Stream a tar of `path` inside the container to `dest` on disk.
    /// Returns the byte count written.
    async fn get_archive(
        &self,
        container_id: &str,
        path: &str,
        dest: &Path,
    ) -> Result<u64, CoreError>;

    /// Extract a tar into `path` inside the container. Works on stopped
    /// containers, which is what offline volume injection relies on.
    async fn put_archive(
        &self,
        container_id: &str,
        path: &str,
        tar: Vec<u8>,
    ) -> Result<(), CoreError>;

    async fn create_container(
        &self,
        name: &str,
        config: Config<String>,
    ) -> Result<String, CoreError>;

    async fn start_container(&self, id: &str) -> Result<(), CoreError>;

    async fn stop_container(&self, id: &str) -> Result<(), CoreError>;

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), CoreError>;

    async fn image_present(&self, image: &str) -> Result<bool, CoreError>;

    async fn pull_image(&self, image: &str) -> Result<(), CoreError>;

    async fn list_networks(&self) -> Result<Vec<String>, CoreError>;

    async fn create_network(&self, name: &str) -> Result<(), CoreError>;

    /// Host ports currently published by any container.
    async fn published_ports(&self) -> Result<HashSet<u16>, CoreError> {
        let summaries = self.list_containers(true).await?;
        Ok(ports::collect_published(&summaries))
    }
}

/// Display name of a container, without the engine's leading slash.
pub fn container_name(summary: &ContainerSummary) -> String {
    summary
        .names
        .as_ref()
        .and_then(|names| names.first())
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_else(|| summary.id.clone().unwrap_or_default())
}

pub fn label<'a>(summary: &'a ContainerSummary, key: &str) -> Option<&'a str> {
    summary.labels.as_ref()?.get(key).map(String::as_str)
}

pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect with local defaults; honors `DOCKER_HOST`.
    pub fn connect() -> Result<Self, CoreError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| CoreError::EngineUnavailable(e.to_string()))?;
        Ok(Self { docker })
    }

    pub async fn ping(&self) -> Result<(), CoreError> {
        self.docker.ping().await.map_err(CoreError::engine)?;
        Ok(())
    }
}

#[async_trait]
impl EngineClient for DockerEngine {
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, CoreError> {
        self.docker
            .list_containers(Some(ListContainersOptions::<String> {
                all,
                ..Default::default()
            }))
            .await
            .map_err(CoreError::engine)
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspectResponse, CoreError> {
        self.docker
            .inspect_container(id, None)
            .await
            .map_err(CoreError::engine)
    }

    async fn exec(&self, container_id: &str, req: ExecRequest) -> Result<ExecOutput, CoreError> {
        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions::<String> {
                    cmd: Some(req.cmd.clone()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    attach_stdin: Some(req.stdin_file.is_some()),
                    ..Default::default()
                },
            )
            .await
            .map_err(CoreError::engine)?;

        let started = self
            .docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    ..Default::default()
                }),
            )
            .await
            .map_err(CoreError::engine)?;

        let StartExecResults::Attached {
            mut output,
            mut input,
        } = started
        else {
            return Ok(ExecOutput::default());
        };

        let stdin_task = req.stdin_file.clone().map(|src| {
            tokio::spawn(async move {
                let mut file = tokio::fs::File::open(&src).await?;
                tokio::io::copy(&mut file, &mut input).await?;
                input.shutdown().await?;
                Ok::<_, std::io::Error>(())
            })
        });

        let mut stdout_sink = match &req.stdout_file {
            Some(path) => Some(tokio::fs::File::create(path).await?),
            None => None,
        };
        let mut out = ExecOutput::default();
        while let Some(chunk) = output.next().await {
            match chunk.map_err(CoreError::engine)? {
                LogOutput::StdOut { message } | LogOutput::Console { message } => {
                    out.stdout_bytes += message.len() as u64;
                    match stdout_sink.as_mut() {
                        Some(file) => file.write_all(&message).await?,
                        None if out.stdout.len() < EXEC_BUF_CAP => {
                            out.stdout.extend_from_slice(&message)
                        }
                        None => {}
                    }
                }
                LogOutput::StdErr { message } => {
                    if out.stderr.len() < EXEC_BUF_CAP {
                        out.stderr.extend_from_slice(&message);
                    }
                }
                _ => {}
            }
        }
        if let Some(file) = stdout_sink.as_mut() {
            file.flush().await?;
        }
        if let Some(task) = stdin_task {
            // A closed stdin pipe is reported through the exit code instead.
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(container_id, error = %e, "exec stdin write failed"),
                Err(e) => tracing::warn!(container_id, error = %e, "exec stdin task panicked"),
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(CoreError::engine)?;
        out.exit_code = inspect.exit_code;
        Ok(out)
    }

    async fn get_archive(
        &self,
        container_id: &str,
        path: &str,
        dest: &Path,
    ) -> Result<u64, CoreError> {
        let mut stream = self.docker.download_from_container(
            container_id,
            Some(DownloadFromContainerOptions {
                path: path.to_string(),
            }),
        );
        let mut file = tokio::fs::File::create(dest).await?;
        let mut bytes = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(CoreError::engine)?;
            bytes += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(bytes)
    }

    async fn put_archive(
        &self,
        container_id: &str,
        path: &str,
        tar: Vec<u8>,
    ) -> Result<(), CoreError> {
        self.docker
            .upload_to_container(
                container_id,
                Some(UploadToContainerOptions::<String> {
                    path: path.to_string(),
                    ..Default::default()
                }),
                tar.into(),
            )
            .await
            .map_err(CoreError::engine)
    }

    async fn create_container(
        &self,
        name: &str,
        config: Config<String>,
    ) -> Result<String, CoreError> {
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.to_string(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(CoreError::engine)?;
        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), CoreError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(CoreError::engine)
    }

    async fn stop_container(&self, id: &str) -> Result<(), CoreError> {
        self.docker
            .stop_container(id, Some(StopContainerOptions { t: 10 }))
            .await
            .map_err(CoreError::engine)
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), CoreError> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
            .map_err(CoreError::engine)
    }

    async fn image_present(&self, image: &str) -> Result<bool, CoreError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(CoreError::engine(e)),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<(), CoreError> {
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions::<String> {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = stream.next().await {
            progress.map_err(CoreError::engine)?;
        }
        Ok(())
    }

    async fn list_networks(&self) -> Result<Vec<String>, CoreError> {
        let networks = self
            .docker
            .list_networks(None::<ListNetworksOptions<String>>)
            .await
            .map_err(CoreError::engine)?;
        Ok(networks.into_iter().filter_map(|n| n.name).collect())
    }

    async fn create_network(&self, name: &str) -> Result<(), CoreError> {
        self.docker
            .create_network(CreateNetworkOptions::<String> {
                name: name.to_string(),
                driver: "bridge".to_string(),
                ..Default::default()
            })
            .await
            .map_err(CoreError::engine)?;
        Ok(())
    }
}
