//! Clone restore: recreate a container from its artifact next to whatever
//! is already running, resolving name, port, path, and network conflicts
//! as it goes. Failures leave the new container stopped for diagnosis.

use crate::engine::ports::{next_free_port, HostProber};
use crate::engine::EngineClient;
use crate::error::CoreError;
use crate::services::artifact::{
    decode_tar_entry, ArtifactKind, ArtifactReader, ContainerMetadata, CONFIG_ENTRY,
};
use crate::services::queue::Progress;
use crate::services::timeouts;
use bollard::container::Config;
use bollard::models::{
    EndpointSettings, HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum,
};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Default)]
pub struct RestoreOutcome {
    pub subject: String,
    /// Names of containers brought up by this restore.
    pub restored: Vec<String>,
    /// Port and bind-path remappings, human readable.
    pub remappings: Vec<String>,
    pub warnings: Vec<String>,
    /// Per-child failures in a legacy stack archive. Non-empty fails the job.
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
enum RestoreStage {
    Init,
    Pulled,
    Created,
    Started,
    VolumesInjected,
    Done,
}

impl std::fmt::Display for RestoreStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RestoreStage::Init => "init",
            RestoreStage::Pulled => "pulled",
            RestoreStage::Created => "created",
            RestoreStage::Started => "started",
            RestoreStage::VolumesInjected => "volumes-injected",
            RestoreStage::Done => "done",
        })
    }
}

pub async fn restore_artifact(
    engine: &dyn EngineClient,
    artifact_path: &Path,
    network_override: Option<String>,
    progress: &Progress,
) -> Result<RestoreOutcome, CoreError> {
    let reader = ArtifactReader::open(artifact_path);
    let subject = artifact_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    match reader.kind().await? {
        ArtifactKind::SingleContainer => {
            let mut outcome = RestoreOutcome {
                subject,
                ..Default::default()
            };
            restore_single(engine, &reader, network_override, progress, &mut outcome).await?;
            Ok(outcome)
        }
        ArtifactKind::LegacyNested => {
            restore_legacy_stack(engine, &reader, subject, progress).await
        }
        ArtifactKind::UnifiedStack => Err(CoreError::Parse(
            "unified stack archive; restore it through the stack pipeline".into(),
        )),
        ArtifactKind::Unknown => Err(CoreError::Parse(
            "archive carries neither config.json nor stack_metadata.json".into(),
        )),
    }
}

/// Deprecated zip-of-zips form: unpack children, databases first, and
/// clone each one onto a fresh bridge network.
async fn restore_legacy_stack(
    engine: &dyn EngineClient,
    reader: &ArtifactReader,
    subject: String,
    progress: &Progress,
) -> Result<RestoreOutcome, CoreError> {
    let epoch = chrono::Utc::now().timestamp();
    let network = format!("stack_restore_{epoch}");
    engine.create_network(&network).await?;
    tracing::info!(%network, "created restore network for legacy stack archive");

    let mut children: Vec<String> = reader
        .entry_names()
        .await?
        .into_iter()
        .filter(|n| !n.contains('/') && n.ends_with(".zip"))
        .collect();
    children.sort_by_key(|name| !looks_like_database(name));

    let staging = tempfile::tempdir()?;
    let mut outcome = RestoreOutcome {
        subject,
        ..Default::default()
    };
    for child in children {
        let staged = staging.path().join(&child);
        reader.read_to_file(&child, &staged).await?;
        let child_reader = ArtifactReader::open(&staged);
        if child_reader.kind().await? != ArtifactKind::SingleContainer {
            outcome
                .errors
                .push(format!("{child}: not a single-container archive"));
            continue;
        }
        if let Err(e) = restore_single(
            engine,
            &child_reader,
            Some(network.clone()),
            progress,
            &mut outcome,
        )
        .await
        {
            tracing::error!(child = %child, error = %e, "nested restore failed");
            outcome.errors.push(format!("{child}: {e}"));
        }
    }
    Ok(outcome)
}

fn looks_like_database(name: &str) -> bool {
    let lowered = name.to_lowercase();
    ["postgres", "mysql", "mariadb", "redis", "db"]
        .iter()
        .any(|p| lowered.contains(p))
}

async fn restore_single(
    engine: &dyn EngineClient,
    reader: &ArtifactReader,
    network_override: Option<String>,
    progress: &Progress,
    outcome: &mut RestoreOutcome,
) -> Result<(), CoreError> {
    let metadata: ContainerMetadata =
        serde_json::from_slice(&reader.read_bytes(CONFIG_ENTRY).await?)?;
    let mut stage = RestoreStage::Init;
    progress.update(format!("{}: {stage}", metadata.name));

    if !engine.image_present(&metadata.image).await? {
        progress.update(format!("{}: pulling {}", metadata.name, metadata.image));
        tokio::time::timeout(timeouts::IMAGE_PULL, engine.pull_image(&metadata.image))
            .await
            .map_err(|_| {
                CoreError::Timeout(format!(
                    "pull of {} exceeded {}s",
                    metadata.image,
                    timeouts::IMAGE_PULL.as_secs()
                ))
            })??;
    }
    stage = RestoreStage::Pulled;
    progress.update(format!("{}: {stage}", metadata.name));

    let epoch = chrono::Utc::now().timestamp();
    let new_name = format!("{}_restored_{epoch}", metadata.name);

    let networking = resolve_network(engine, &metadata, network_override).await?;
    let published = engine.published_ports().await.unwrap_or_default();
    let mut prober = HostProber::new(published);
    let port_bindings = rebind_ports(&metadata, &mut prober, &mut outcome.remappings);
    let binds = rebind_host_paths(&metadata, epoch, &mut outcome.remappings).await?;

    let host_config = HostConfig {
        binds: if binds.is_empty() { None } else { Some(binds) },
        port_bindings: if port_bindings.is_empty() {
            None
        } else {
            Some(port_bindings)
        },
        restart_policy: Some(RestartPolicy {
            name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
            maximum_retry_count: None,
        }),
        ..Default::default()
    };

    let config = Config::<String> {
        image: Some(metadata.image.clone()),
        env: Some(metadata.env.clone()),
        cmd: if metadata.cmd.is_empty() {
            None
        } else {
            Some(metadata.cmd.clone())
        },
        exposed_ports: if metadata.ports.is_empty() {
            None
        } else {
            Some(metadata.ports.clone())
        },
        host_config: Some(host_config),
        networking_config: Some(networking),
        ..Default::default()
    };

    let id = engine.create_container(&new_name, config).await?;
    stage = RestoreStage::Created;
    progress.update(format!("{new_name}: {stage}"));

    // From here on a failure leaves the container stopped, not removed.
    let result = async {
        engine.start_container(&id).await?;
        progress.update(format!("{new_name}: {}", RestoreStage::Started));

        inject_root_volumes(engine, reader, &id, &mut outcome.warnings).await?;
        progress.update(format!("{new_name}: {}", RestoreStage::VolumesInjected));
        Ok::<_, CoreError>(())
    }
    .await;

    if let Err(e) = result {
        let _ = engine.stop_container(&id).await;
        tracing::error!(container = %new_name, error = %e, "restore failed, container left stopped");
        return Err(e);
    }

    stage = RestoreStage::Done;
    progress.update(format!("{new_name}: {stage}"));
    outcome.restored.push(new_name);
    Ok(())
}

/// With an override, attach only to it under stable aliases. Otherwise
/// try the first original network and fall back to the default bridge.
async fn resolve_network(
    engine: &dyn EngineClient,
    metadata: &ContainerMetadata,
    network_override: Option<String>,
) -> Result<bollard::container::NetworkingConfig<String>, CoreError> {
    let mut endpoints: HashMap<String, EndpointSettings> = HashMap::new();
    match network_override {
        Some(network) => {
            let mut aliases: Vec<String> = Vec::new();
            if let Some(service) = &metadata.compose_service {
                aliases.push(service.clone());
            }
            aliases.push(metadata.name.clone());
            endpoints.insert(
                network,
                EndpointSettings {
                    aliases: Some(aliases),
                    ..Default::default()
                },
            );
        }
        None => {
            let original = metadata
                .network_settings
                .as_ref()
                .and_then(|ns| ns.networks.keys().next().cloned());
            let network = match original {
                Some(net) => {
                    let existing = engine.list_networks().await?;
                    if existing.contains(&net) {
                        net
                    } else {
                        tracing::warn!(network = %net, "original network is gone, using bridge");
                        "bridge".to_string()
                    }
                }
                None => "bridge".to_string(),
            };
            endpoints.insert(network, EndpointSettings::default());
        }
    }
    Ok(bollard::container::NetworkingConfig {
        endpoints_config: endpoints,
    })
}

/// Re-point each published port at the first free host port at or above
/// the original.
fn rebind_ports(
    metadata: &ContainerMetadata,
    prober: &mut HostProber,
    remappings: &mut Vec<String>,
) -> HashMap<String, Option<Vec<PortBinding>>> {
    let mut out: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
    let Some(bindings) = metadata
        .host_config
        .as_ref()
        .and_then(|hc| hc.port_bindings.as_ref())
    else {
        return out;
    };

    for (container_port, binding) in bindings {
        let rebound = binding.as_ref().map(|list| {
            list.iter()
                .map(|b| {
                    let Some(original) = b.host_port.as_deref().and_then(|p| p.parse::<u16>().ok())
                    else {
                        return b.clone();
                    };
                    match next_free_port(prober, original) {
                        Some(port) => {
                            prober.reserve(port);
                            if port != original {
                                remappings
                                    .push(format!("{}: {original} → {port}", metadata.name));
                            }
                            PortBinding {
                                host_ip: b.host_ip.clone(),
                                host_port: Some(port.to_string()),
                            }
                        }
                        None => {
                            tracing::warn!(container_port = %container_port, original, "no free host port, keeping original");
                            b.clone()
                        }
                    }
                })
                .collect()
        });
        out.insert(container_port.clone(), rebound);
    }
    out
}

/// Bind mounts whose host path already exists get retargeted so the clone
/// cannot write into the original's data.
async fn rebind_host_paths(
    metadata: &ContainerMetadata,
    epoch: i64,
    remappings: &mut Vec<String>,
) -> Result<Vec<String>, CoreError> {
    let Some(binds) = metadata
        .host_config
        .as_ref()
        .and_then(|hc| hc.binds.as_ref())
    else {
        return Ok(Vec::new());
    };

    let mut out = Vec::with_capacity(binds.len());
    for bind in binds {
        let mut parts = bind.splitn(2, ':');
        let (Some(host), Some(rest)) = (parts.next(), parts.next()) else {
            out.push(bind.clone());
            continue;
        };
        if Path::new(host).exists() {
            let retargeted = format!("{host}_restored_{epoch}");
            if let Some(parent) = Path::new(&retargeted).parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            remappings.push(format!("{}: {host} → {retargeted}", metadata.name));
            out.push(format!("{retargeted}:{rest}"));
        } else {
            out.push(bind.clone());
        }
    }
    Ok(out)
}

/// Stream every root-level tar back into the container, extracting each
/// into the captured path's parent directory.
async fn inject_root_volumes(
    engine: &dyn EngineClient,
    reader: &ArtifactReader,
    container_id: &str,
    warnings: &mut Vec<String>,
) -> Result<(), CoreError> {
    for entry in reader.entry_names().await? {
        if entry.contains('/') || !entry.ends_with(".tar") {
            continue;
        }
        let Some(original) = decode_tar_entry(&entry) else {
            warnings.push(format!("{entry}: undecodable entry name"));
            continue;
        };
        let parent = Path::new(&original)
            .parent()
            .and_then(|p| p.to_str())
            .filter(|p| !p.is_empty())
            .unwrap_or("/")
            .to_string();
        let tar = reader.read_bytes(&entry).await?;
        engine.put_archive(container_id, &parent, tar).await?;
        tracing::debug!(container_id, path = %original, "volume injected");
    }
    Ok(())
}
