//! Artifact archives. A backup produces a single zip (deflate level 9)
//! whose first entry is the metadata document; captured filesystem paths
//! ride along as raw engine tar streams named by the escape rule below.

use crate::error::CoreError;
use crate::services::app_detect::AppType;
use bollard::models::{ContainerInspectResponse, EndpointSettings, HostConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use zip::write::FileOptions;

pub const CONFIG_ENTRY: &str = "config.json";
pub const STACK_METADATA_ENTRY: &str = "stack_metadata.json";
pub const DUMP_ENTRY: &str = "dump.sql";
pub const MANIFEST_ENTRY: &str = "docker-compose.yml";
pub const ENV_ENTRY: &str = ".env";

// ── path escape ──
//
// `/a/b/c` ↔ `a_b_c.tar`. Decoding turns every underscore back into a
// slash, which is lossy for paths that legitimately contain `_`; accepted
// for the targeted filesystems and kept stable so old archives restore.

pub fn escape_path(path: &str) -> String {
    path.trim_start_matches('/').replace('/', "_")
}

pub fn tar_entry_name(path: &str) -> String {
    format!("{}.tar", escape_path(path))
}

pub fn decode_tar_entry(name: &str) -> Option<String> {
    let stem = name.strip_suffix(".tar")?;
    Some(format!("/{}", stem.replace('_', "/")))
}

// ── metadata documents ──

/// `config.json`: the sole source of truth a restore works from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerMetadata {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub ports: HashMap<String, HashMap<(), ()>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_config: Option<HostConfig>,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_settings: Option<NetworkSettingsMeta>,
    pub app_type: AppType,
    #[serde(default)]
    pub backup_paths: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compose_project: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compose_service: Option<String>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkSettingsMeta {
    #[serde(rename = "Networks", default)]
    pub networks: HashMap<String, EndpointSettings>,
}

impl ContainerMetadata {
    pub fn from_inspect(
        inspect: &ContainerInspectResponse,
        app_type: AppType,
        backup_paths: Vec<String>,
    ) -> Self {
        let config = inspect.config.clone().unwrap_or_default();
        let labels = config.labels.clone().unwrap_or_default();
        Self {
            name: inspect
                .name
                .clone()
                .unwrap_or_default()
                .trim_start_matches('/')
                .to_string(),
            image: config.image.clone().unwrap_or_default(),
            env: config.env.clone().unwrap_or_default(),
            ports: config.exposed_ports.clone().unwrap_or_default(),
            host_config: inspect.host_config.clone(),
            cmd: config.cmd.clone().unwrap_or_default(),
            network_settings: inspect.network_settings.as_ref().map(|ns| {
                NetworkSettingsMeta {
                    networks: ns.networks.clone().unwrap_or_default(),
                }
            }),
            app_type,
            backup_paths,
            compose_project: labels.get("com.docker.compose.project").cloned(),
            compose_service: labels.get("com.docker.compose.service").cloned(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Value of `key` in the recorded `K=V` environment.
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find_map(|kv| kv.split_once('=').filter(|(k, _)| *k == key))
            .map(|(_, v)| v)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackMetadata {
    pub stack_name: String,
    pub timestamp: String,
    pub containers: Vec<StackMember>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackMember {
    pub id: String,
    pub name: String,
    pub service: String,
}

// ── writer ──

fn entry_options() -> FileOptions {
    FileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .compression_level(Some(9))
        .large_file(true)
}

/// Append-only, single-pass zip writer. Blocking zip work runs on the
/// blocking pool; the writer shuttles in and out of each call.
pub struct ArtifactWriter {
    path: PathBuf,
    inner: Option<zip::ZipWriter<std::fs::File>>,
}

impl ArtifactWriter {
    pub fn create(path: &Path) -> Result<Self, CoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::File::create(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            inner: Some(zip::ZipWriter::new(file)),
        })
    }

    pub async fn append_bytes(&mut self, name: &str, bytes: Vec<u8>) -> Result<(), CoreError> {
        let name = name.to_string();
        self.run_blocking(move |zip| {
            zip.start_file(name.as_str(), entry_options())?;
            zip.write_all(&bytes)?;
            Ok(())
        })
        .await
    }

    /// Stream a staged file (dump or captured tar) into the archive.
    pub async fn append_file(&mut self, name: &str, src: &Path) -> Result<(), CoreError> {
        let name = name.to_string();
        let src = src.to_path_buf();
        self.run_blocking(move |zip| {
            let mut reader = std::fs::File::open(&src)?;
            zip.start_file(name.as_str(), entry_options())?;
            std::io::copy(&mut reader, zip)?;
            Ok(())
        })
        .await
    }

    /// Flush the central directory. Guarded by a wall-clock timeout; on
    /// timeout or error the partial output is deleted.
    pub async fn finalize(mut self, timeout: Duration) -> Result<PathBuf, CoreError> {
        let Some(mut zip) = self.inner.take() else {
            return Err(CoreError::CaptureFailed("archive already finalized".into()));
        };
        let finish = tokio::task::spawn_blocking(move || -> Result<(), CoreError> {
            zip.finish()?;
            Ok(())
        });
        match tokio::time::timeout(timeout, finish).await {
            Ok(Ok(Ok(()))) => Ok(self.path),
            Ok(Ok(Err(e))) => {
                let _ = tokio::fs::remove_file(&self.path).await;
                Err(e)
            }
            Ok(Err(join)) => {
                let _ = tokio::fs::remove_file(&self.path).await;
                Err(CoreError::CaptureFailed(format!("archive task failed: {join}")))
            }
            Err(_) => {
                let _ = tokio::fs::remove_file(&self.path).await;
                Err(CoreError::Timeout(format!(
                    "archive finalize exceeded {}s",
                    timeout.as_secs()
                )))
            }
        }
    }

    /// Drop the partial output after a failed backup.
    pub async fn abort(mut self) {
        self.inner.take();
        let _ = tokio::fs::remove_file(&self.path).await;
    }

    async fn run_blocking<F>(&mut self, op: F) -> Result<(), CoreError>
    where
        F: FnOnce(&mut zip::ZipWriter<std::fs::File>) -> Result<(), CoreError> + Send + 'static,
    {
        let mut zip = self
            .inner
            .take()
            .ok_or_else(|| CoreError::CaptureFailed("archive already finalized".into()))?;
        let (zip, result) = tokio::task::spawn_blocking(move || {
            let result = op(&mut zip);
            (zip, result)
        })
        .await
        .map_err(|e| CoreError::CaptureFailed(format!("archive task failed: {e}")))?;
        self.inner = Some(zip);
        result
    }
}

// ── reader ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    SingleContainer,
    UnifiedStack,
    /// Pre-unified format: a zip of per-container zips. Deprecated but
    /// still restorable.
    LegacyNested,
    Unknown,
}

/// Read side of the artifact format. Each operation opens the archive on
/// the blocking pool; artifacts are read a handful of times per job.
pub struct ArtifactReader {
    path: PathBuf,
}

impl ArtifactReader {
    pub fn open(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub async fn entry_names(&self) -> Result<Vec<String>, CoreError> {
        self.with_archive(|zip| {
            let mut names = Vec::with_capacity(zip.len());
            for i in 0..zip.len() {
                names.push(zip.by_index(i)?.name().to_string());
            }
            Ok(names)
        })
        .await
    }

    /// Root-entry routing: `config.json` and `stack_metadata.json` are
    /// mutually exclusive by construction.
    pub async fn kind(&self) -> Result<ArtifactKind, CoreError> {
        let names = self.entry_names().await?;
        if names.iter().any(|n| n == CONFIG_ENTRY) {
            return Ok(ArtifactKind::SingleContainer);
        }
        if names.iter().any(|n| n == STACK_METADATA_ENTRY) {
            return Ok(ArtifactKind::UnifiedStack);
        }
        if names
            .iter()
            .any(|n| !n.contains('/') && n.ends_with(".zip"))
        {
            return Ok(ArtifactKind::LegacyNested);
        }
        Ok(ArtifactKind::Unknown)
    }

    pub async fn read_bytes(&self, name: &str) -> Result<Vec<u8>, CoreError> {
        let name = name.to_string();
        self.with_archive(move |zip| {
            let mut entry = zip
                .by_name(&name)
                .map_err(|_| CoreError::NotFound(format!("archive entry {name}")))?;
            let mut buf = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut buf)?;
            Ok(buf)
        })
        .await
    }

    pub async fn read_to_file(&self, name: &str, dest: &Path) -> Result<u64, CoreError> {
        let name = name.to_string();
        let dest = dest.to_path_buf();
        self.with_archive(move |zip| {
            let mut entry = zip
                .by_name(&name)
                .map_err(|_| CoreError::NotFound(format!("archive entry {name}")))?;
            let mut out = std::fs::File::create(&dest)?;
            let bytes = std::io::copy(&mut entry, &mut out)?;
            out.flush()?;
            Ok(bytes)
        })
        .await
    }

    async fn with_archive<T, F>(&self, op: F) -> Result<T, CoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut zip::ZipArchive<std::fs::File>) -> Result<T, CoreError> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let file = std::fs::File::open(&path)?;
            let mut zip = zip::ZipArchive::new(file)?;
            op(&mut zip)
        })
        .await
        .map_err(|e| CoreError::CaptureFailed(format!("archive task failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_round_trip() {
        for path in ["/usr/share/nginx/html", "/data", "/var/lib/postgresql/data"] {
            let entry = tar_entry_name(path);
            assert!(!entry.starts_with('_'));
            assert_eq!(decode_tar_entry(&entry).unwrap(), path);
        }
        assert_eq!(tar_entry_name("/usr/share/nginx/html"), "usr_share_nginx_html.tar");
    }

    #[test]
    fn test_decode_rejects_non_tar() {
        assert!(decode_tar_entry("config.json").is_none());
    }

    #[test]
    fn test_escape_is_lossy_for_underscores() {
        // Documented limitation: underscores decode as slashes.
        let entry = tar_entry_name("/var/lib/my_app");
        assert_eq!(decode_tar_entry(&entry).unwrap(), "/var/lib/my/app");
    }

    #[tokio::test]
    async fn test_writer_reader_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.zip");

        let mut writer = ArtifactWriter::create(&path).unwrap();
        writer
            .append_bytes(CONFIG_ENTRY, b"{\"name\":\"x\"}".to_vec())
            .await
            .unwrap();
        writer
            .append_bytes("usr_share_nginx_html.tar", vec![0u8; 2048])
            .await
            .unwrap();
        let path = writer.finalize(Duration::from_secs(30)).await.unwrap();

        let reader = ArtifactReader::open(&path);
        let names = reader.entry_names().await.unwrap();
        assert_eq!(names[0], CONFIG_ENTRY);
        assert_eq!(reader.kind().await.unwrap(), ArtifactKind::SingleContainer);
        assert_eq!(reader.read_bytes(CONFIG_ENTRY).await.unwrap(), b"{\"name\":\"x\"}");
    }

    #[tokio::test]
    async fn test_stack_kind_detection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stack.zip");
        let mut writer = ArtifactWriter::create(&path).unwrap();
        writer
            .append_bytes(STACK_METADATA_ENTRY, b"{}".to_vec())
            .await
            .unwrap();
        writer
            .append_bytes("services/db/config.json", b"{}".to_vec())
            .await
            .unwrap();
        let path = writer.finalize(Duration::from_secs(30)).await.unwrap();

        let reader = ArtifactReader::open(&path);
        // Nested config.json must not shadow the root stack marker.
        assert_eq!(reader.kind().await.unwrap(), ArtifactKind::UnifiedStack);
    }

    #[tokio::test]
    async fn test_missing_entry_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.zip");
        let mut writer = ArtifactWriter::create(&path).unwrap();
        writer.append_bytes(CONFIG_ENTRY, b"{}".to_vec()).await.unwrap();
        let path = writer.finalize(Duration::from_secs(30)).await.unwrap();

        let reader = ArtifactReader::open(&path);
        assert!(matches!(
            reader.read_bytes("dump.sql").await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_abort_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.zip");
        let mut writer = ArtifactWriter::create(&path).unwrap();
        writer.append_bytes(CONFIG_ENTRY, b"{}".to_vec()).await.unwrap();
        writer.abort().await;
        assert!(!path.exists());
    }
}
