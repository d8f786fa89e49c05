//! In-memory engine for exercising backup and restore flows without a
//! daemon. Containers, networks, and archives are plain maps; exec output
//! is scripted by command substring.

use super::{EngineClient, ExecOutput, ExecRequest};
use crate::error::CoreError;
use async_trait::async_trait;
use bollard::container::Config;
use bollard::models::{ContainerInspectResponse, ContainerSummary};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

/// A minimal tar stream holding one file, shaped like the engine's
/// get-archive output.
pub fn tar_with_file(name: &str, contents: &[u8]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, contents).unwrap();
    builder.into_inner().unwrap()
}

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub summary: ContainerSummary,
    pub inspect: ContainerInspectResponse,
}

#[derive(Debug, Clone, Default)]
pub struct ScriptedExec {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i64,
}

#[derive(Debug, Clone)]
pub struct ExecCall {
    pub container_id: String,
    pub script: String,
    pub stdin: Option<Vec<u8>>,
}

#[derive(Default)]
pub struct FakeEngine {
    pub containers: Mutex<HashMap<String, FakeContainer>>,
    pub networks: Mutex<HashSet<String>>,
    pub images: Mutex<HashSet<String>>,
    /// (command substring → scripted response); first match wins.
    pub exec_scripts: Mutex<Vec<(String, ScriptedExec)>>,
    /// (container id, path) → tar bytes served by get_archive.
    pub archives: Mutex<HashMap<(String, String), Vec<u8>>>,

    pub exec_calls: Mutex<Vec<ExecCall>>,
    /// (container id, destination path, tar bytes) per put_archive.
    pub injected: Mutex<Vec<(String, String, Vec<u8>)>>,
    /// (name, config) per create_container.
    pub created: Mutex<Vec<(String, Config<String>)>>,
    pub started: Mutex<Vec<String>>,
    pub stopped: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<String>>,
    pub pulled: Mutex<Vec<String>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        let engine = Self::default();
        engine.networks.lock().unwrap().insert("bridge".into());
        engine
    }

    pub fn add_container(&self, id: &str, name: &str, image: &str, labels: &[(&str, &str)]) {
        let labels: HashMap<String, String> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let container = FakeContainer {
            summary: ContainerSummary {
                id: Some(id.to_string()),
                names: Some(vec![format!("/{name}")]),
                image: Some(image.to_string()),
                state: Some("running".to_string()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            inspect: ContainerInspectResponse {
                id: Some(id.to_string()),
                name: Some(format!("/{name}")),
                config: Some(bollard::models::ContainerConfig {
                    image: Some(image.to_string()),
                    labels: Some(labels),
                    ..Default::default()
                }),
                ..Default::default()
            },
        };
        self.containers.lock().unwrap().insert(id.to_string(), container);
    }

    pub fn set_env(&self, id: &str, env: &[&str]) {
        let mut containers = self.containers.lock().unwrap();
        let config = containers
            .get_mut(id)
            .expect("unknown fake container")
            .inspect
            .config
            .get_or_insert_with(Default::default);
        config.env = Some(env.iter().map(|s| s.to_string()).collect());
    }

    pub fn script_exec(&self, pattern: &str, exec: ScriptedExec) {
        self.exec_scripts
            .lock()
            .unwrap()
            .push((pattern.to_string(), exec));
    }

    pub fn serve_archive(&self, id: &str, path: &str, tar: Vec<u8>) {
        self.archives
            .lock()
            .unwrap()
            .insert((id.to_string(), path.to_string()), tar);
    }

    pub fn exec_scripts_run(&self) -> Vec<String> {
        self.exec_calls
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.script.clone())
            .collect()
    }
}

#[async_trait]
impl EngineClient for FakeEngine {
    async fn list_containers(&self, _all: bool) -> Result<Vec<ContainerSummary>, CoreError> {
        Ok(self
            .containers
            .lock()
            .unwrap()
            .values()
            .map(|c| c.summary.clone())
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspectResponse, CoreError> {
        self.containers
            .lock()
            .unwrap()
            .get(id)
            .map(|c| c.inspect.clone())
            .ok_or_else(|| CoreError::NotFound(format!("container {id}")))
    }

    async fn exec(&self, container_id: &str, req: ExecRequest) -> Result<ExecOutput, CoreError> {
        let script = req.cmd.join(" ");
        let stdin = match &req.stdin_file {
            Some(path) => Some(tokio::fs::read(path).await?),
            None => None,
        };
        self.exec_calls.lock().unwrap().push(ExecCall {
            container_id: container_id.to_string(),
            script: script.clone(),
            stdin,
        });

        let scripted = self
            .exec_scripts
            .lock()
            .unwrap()
            .iter()
            .find(|(pattern, _)| script.contains(pattern.as_str()))
            .map(|(_, exec)| exec.clone())
            .unwrap_or_default();

        let mut out = ExecOutput {
            exit_code: Some(scripted.exit_code),
            stderr: scripted.stderr.clone(),
            stdout_bytes: scripted.stdout.len() as u64,
            ..Default::default()
        };
        match &req.stdout_file {
            Some(path) => tokio::fs::write(path, &scripted.stdout).await?,
            None => out.stdout = scripted.stdout.clone(),
        }
        Ok(out)
    }

    async fn get_archive(
        &self,
        container_id: &str,
        path: &str,
        dest: &Path,
    ) -> Result<u64, CoreError> {
        let tar = self
            .archives
            .lock()
            .unwrap()
            .get(&(container_id.to_string(), path.to_string()))
            .cloned()
            .ok_or_else(|| CoreError::CaptureFailed(format!("no archive for {path}")))?;
        tokio::fs::write(dest, &tar).await?;
        Ok(tar.len() as u64)
    }

    async fn put_archive(
        &self,
        container_id: &str,
        path: &str,
        tar: Vec<u8>,
    ) -> Result<(), CoreError> {
        self.injected
            .lock()
            .unwrap()
            .push((container_id.to_string(), path.to_string(), tar));
        Ok(())
    }

    async fn create_container(
        &self,
        name: &str,
        config: Config<String>,
    ) -> Result<String, CoreError> {
        let id = format!("created-{name}");
        self.created
            .lock()
            .unwrap()
            .push((name.to_string(), config.clone()));
        self.add_container(
            &id,
            name,
            config.image.as_deref().unwrap_or_default(),
            &[],
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), CoreError> {
        self.started.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<(), CoreError> {
        self.stopped.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn remove_container(&self, id: &str, _force: bool) -> Result<(), CoreError> {
        self.containers.lock().unwrap().remove(id);
        self.removed.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn image_present(&self, image: &str) -> Result<bool, CoreError> {
        Ok(self.images.lock().unwrap().contains(image))
    }

    async fn pull_image(&self, image: &str) -> Result<(), CoreError> {
        self.images.lock().unwrap().insert(image.to_string());
        self.pulled.lock().unwrap().push(image.to_string());
        Ok(())
    }

    async fn list_networks(&self) -> Result<Vec<String>, CoreError> {
        Ok(self.networks.lock().unwrap().iter().cloned().collect())
    }

    async fn create_network(&self, name: &str) -> Result<(), CoreError> {
        self.networks.lock().unwrap().insert(name.to_string());
        Ok(())
    }
}
