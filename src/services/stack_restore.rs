//! Restore a unified stack archive into place. Phases run as barriers:
//! plan, rewrite, infrastructure-only deploy, offline volume injection,
//! database cohort boot, SQL replay, credential resync, application boot.

use crate::compose::deployer::{ComposeDeployer, DeployMode};
use crate::compose::interpolate::{interpolate, parse_env_lines};
use crate::compose::rewriter::apply_conflict_rewrite;
use crate::engine::{self, EngineClient, ExecRequest};
use crate::error::CoreError;
use crate::services::app_detect::AppType;
use crate::services::artifact::{
    decode_tar_entry, ArtifactKind, ArtifactReader, ContainerMetadata, StackMetadata, CONFIG_ENTRY,
    DUMP_ENTRY, ENV_ENTRY, MANIFEST_ENTRY, STACK_METADATA_ENTRY,
};
use crate::services::queue::Progress;
use crate::services::quote::{shell_single_quote, sql_quote_ident, sql_quote_literal};
use crate::services::timeouts;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Dumps below this are suspicious but accepted.
const DUMP_SANITY_BYTES: u64 = 100;

#[derive(Debug, Default)]
pub struct StackRestoreOutcome {
    pub stack_name: String,
    pub services: Vec<String>,
    pub remappings: Vec<String>,
    pub warnings: Vec<String>,
}

struct MemberPlan {
    name: String,
    service: String,
    metadata: ContainerMetadata,
    has_dump: bool,
    volume_entries: Vec<String>,
}

pub async fn restore_stack(
    engine: &dyn EngineClient,
    deployer: &dyn ComposeDeployer,
    artifact_path: &Path,
    progress: &Progress,
) -> Result<StackRestoreOutcome, CoreError> {
    let reader = ArtifactReader::open(artifact_path);

    // ── phase 0: plan ──
    // Everything that can fail with ParseError happens before the engine
    // is touched.
    progress.update("phase 0/7: reading archive");
    if reader.kind().await? != ArtifactKind::UnifiedStack {
        return Err(CoreError::Parse(format!(
            "{} is not a unified stack archive",
            artifact_path.display()
        )));
    }
    let metadata: StackMetadata =
        serde_json::from_slice(&reader.read_bytes(STACK_METADATA_ENTRY).await?)?;
    let stack_name = metadata.stack_name.clone();

    let entries = reader.entry_names().await?;
    if !entries.iter().any(|e| e == MANIFEST_ENTRY) {
        return Err(CoreError::Parse(format!(
            "stack archive for {stack_name} has no {MANIFEST_ENTRY}"
        )));
    }
    let manifest_text = String::from_utf8_lossy(&reader.read_bytes(MANIFEST_ENTRY).await?)
        .into_owned();
    let env_text = if entries.iter().any(|e| e == ENV_ENTRY) {
        Some(String::from_utf8_lossy(&reader.read_bytes(ENV_ENTRY).await?).into_owned())
    } else {
        None
    };
    let env_map = env_text
        .as_deref()
        .map(parse_env_lines)
        .unwrap_or_default();

    let members = plan_members(&reader, &metadata, &entries).await?;

    let mut outcome = StackRestoreOutcome {
        stack_name: stack_name.clone(),
        ..Default::default()
    };

    remove_existing_stack(engine, &stack_name, progress).await?;

    let staging = tempfile::tempdir()?;
    let env_path = match &env_text {
        Some(text) => {
            let path = staging.path().join(".env");
            tokio::fs::write(&path, text).await?;
            Some(path)
        }
        None => None,
    };

    // ── phase 1: rewrite ──
    progress.update("phase 1/7: rewriting manifest");
    let rewrite = apply_conflict_rewrite(engine, &manifest_text).await?;
    outcome.remappings = rewrite.remappings.clone();
    for remap in &rewrite.remappings {
        tracing::info!(stack = %stack_name, remap, "conflict remapped");
    }
    let manifest_path = staging.path().join("docker-compose.yml");
    tokio::fs::write(&manifest_path, &rewrite.manifest).await?;

    // ── phase 2: infrastructure-only deploy ──
    progress.update("phase 2/7: creating containers");
    deployer
        .deploy(
            &stack_name,
            &manifest_path,
            env_path.as_deref(),
            DeployMode::CreateOnly,
        )
        .await?;

    let containers = service_container_map(engine, &stack_name).await?;

    // ── phase 3: offline volume injection ──
    progress.update("phase 3/7: injecting volumes");
    for member in &members {
        let Some(container_id) = containers.get(&member.service) else {
            if !member.volume_entries.is_empty() {
                outcome
                    .warnings
                    .push(format!("{}: no deployed container, volumes skipped", member.name));
            }
            continue;
        };
        for entry in &member.volume_entries {
            if let Err(e) = inject_volume(engine, &reader, container_id, entry).await {
                tracing::warn!(service = %member.service, entry, error = %e, "volume injection failed");
                outcome.warnings.push(format!("{entry}: {e}"));
            }
        }
    }

    // ── phase 4: database cohort boot ──
    progress.update("phase 4/7: starting databases");
    let databases: Vec<&MemberPlan> = members
        .iter()
        .filter(|m| m.metadata.app_type.is_database())
        .collect();

    for member in &databases {
        if let Some(id) = containers.get(&member.service) {
            engine.start_container(id).await?;
        }
    }
    // Probes may run in parallel across the cohort; each opens its own
    // short-lived exec sessions.
    let env_ref = &env_map;
    let probes = databases.iter().map(|member| {
        let container_id = containers.get(&member.service).cloned();
        async move {
            let Some(id) = container_id else { return Ok(()) };
            wait_for_readiness(engine, &id, member, env_ref).await
        }
    });
    for result in join_all(probes).await {
        if let Err(e) = result {
            // Not fatal; the service may still come up under load.
            tracing::warn!(stack = %stack_name, error = %e, "database readiness");
            outcome.warnings.push(e.to_string());
        }
    }

    // ── phase 5: SQL replay ──
    progress.update("phase 5/7: replaying dumps");
    for member in &databases {
        if !member.has_dump {
            continue;
        }
        let Some(id) = containers.get(&member.service) else {
            outcome
                .warnings
                .push(format!("{}: dump present but container missing", member.name));
            continue;
        };
        if let Err(e) = replay_dump(engine, &reader, id, member, &env_map).await {
            tracing::warn!(service = %member.service, error = %e, "dump replay failed");
            outcome.warnings.push(format!("{}: {e}", member.name));
        }
    }

    // ── phase 6: credential resync (postgres only) ──
    progress.update("phase 6/7: resyncing credentials");
    for member in &databases {
        if member.metadata.app_type != AppType::Postgres {
            continue;
        }
        let Some(id) = containers.get(&member.service) else { continue };
        if let Err(e) = resync_postgres_role(engine, id, &member.metadata, &env_map).await {
            tracing::warn!(service = %member.service, error = %e, "credential resync failed");
            outcome.warnings.push(format!("{}: {e}", member.name));
        }
    }

    // ── phase 7: application boot ──
    progress.update("phase 7/7: starting applications");
    deployer
        .deploy(&stack_name, &manifest_path, env_path.as_deref(), DeployMode::Up)
        .await?;

    outcome.services = members.iter().map(|m| m.service.clone()).collect();
    tracing::info!(
        stack = %stack_name,
        services = outcome.services.len(),
        warnings = outcome.warnings.len(),
        "stack restore finished"
    );
    Ok(outcome)
}

async fn plan_members(
    reader: &ArtifactReader,
    metadata: &StackMetadata,
    entries: &[String],
) -> Result<Vec<MemberPlan>, CoreError> {
    let mut members = Vec::with_capacity(metadata.containers.len());
    for member in &metadata.containers {
        let prefix = format!("services/{}/", member.name);
        let config_entry = format!("{prefix}{CONFIG_ENTRY}");
        if !entries.iter().any(|e| e == &config_entry) {
            return Err(CoreError::Parse(format!(
                "stack archive is missing {config_entry}"
            )));
        }
        let container_meta: ContainerMetadata =
            serde_json::from_slice(&reader.read_bytes(&config_entry).await?)?;
        let volume_prefix = format!("{prefix}volumes/");
        members.push(MemberPlan {
            name: member.name.clone(),
            service: if member.service.is_empty() {
                container_meta
                    .compose_service
                    .clone()
                    .unwrap_or_else(|| member.name.clone())
            } else {
                member.service.clone()
            },
            has_dump: entries.iter().any(|e| e == &format!("{prefix}{DUMP_ENTRY}")),
            volume_entries: entries
                .iter()
                .filter(|e| e.starts_with(&volume_prefix) && e.ends_with(".tar"))
                .cloned()
                .collect(),
            metadata: container_meta,
        });
    }
    Ok(members)
}

/// Stop and remove the previous generation of the stack. Host volumes are
/// preserved; only the container objects go away.
async fn remove_existing_stack(
    engine: &dyn EngineClient,
    stack_name: &str,
    progress: &Progress,
) -> Result<(), CoreError> {
    let existing: Vec<_> = engine
        .list_containers(true)
        .await?
        .into_iter()
        .filter(|c| engine::label(c, engine::COMPOSE_PROJECT_LABEL) == Some(stack_name))
        .collect();
    if existing.is_empty() {
        return Ok(());
    }
    progress.update(format!(
        "phase 0/7: removing {} existing containers",
        existing.len()
    ));
    for container in existing {
        let Some(id) = container.id else { continue };
        if let Err(e) = engine.stop_container(&id).await {
            tracing::debug!(container = %id, error = %e, "stop before removal failed");
        }
        engine.remove_container(&id, true).await?;
    }
    Ok(())
}

async fn service_container_map(
    engine: &dyn EngineClient,
    stack_name: &str,
) -> Result<HashMap<String, String>, CoreError> {
    let mut map = HashMap::new();
    for container in engine.list_containers(true).await? {
        if engine::label(&container, engine::COMPOSE_PROJECT_LABEL) != Some(stack_name) {
            continue;
        }
        if let (Some(service), Some(id)) = (
            engine::label(&container, engine::COMPOSE_SERVICE_LABEL),
            container.id.clone(),
        ) {
            map.insert(service.to_string(), id);
        }
    }
    Ok(map)
}

async fn inject_volume(
    engine: &dyn EngineClient,
    reader: &ArtifactReader,
    container_id: &str,
    entry: &str,
) -> Result<(), CoreError> {
    let file_name = entry.rsplit('/').next().unwrap_or(entry);
    let original = decode_tar_entry(file_name)
        .ok_or_else(|| CoreError::Parse(format!("undecodable volume entry {entry}")))?;
    let parent = Path::new(&original)
        .parent()
        .and_then(|p| p.to_str())
        .filter(|p| !p.is_empty())
        .unwrap_or("/")
        .to_string();
    let tar = reader.read_bytes(entry).await?;
    engine.put_archive(container_id, &parent, tar).await?;
    tracing::debug!(container_id, path = %original, "offline volume injected");
    Ok(())
}

/// Poll the engine-side readiness command once a second, up to the
/// attempt budget.
async fn wait_for_readiness(
    engine: &dyn EngineClient,
    container_id: &str,
    member: &MemberPlan,
    env_map: &HashMap<String, String>,
) -> Result<(), CoreError> {
    let Some(script) = readiness_script(&member.metadata, env_map) else {
        return Ok(());
    };
    for attempt in 1..=timeouts::READINESS_ATTEMPTS {
        match engine
            .exec(container_id, ExecRequest::shell(script.clone()))
            .await
        {
            Ok(output) => {
                let combined =
                    format!("{} {}", output.stdout_text(), output.stderr_text()).to_lowercase();
                if ["accepting", "alive", "pong"]
                    .iter()
                    .any(|marker| combined.contains(marker))
                {
                    tracing::info!(service = %member.service, attempt, "database ready");
                    return Ok(());
                }
            }
            Err(e) => {
                tracing::debug!(service = %member.service, attempt, error = %e, "readiness probe errored");
            }
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    Err(CoreError::ReadinessTimeout(format!(
        "{} after {} attempts",
        member.name,
        timeouts::READINESS_ATTEMPTS
    )))
}

fn readiness_script(
    metadata: &ContainerMetadata,
    env_map: &HashMap<String, String>,
) -> Option<String> {
    match metadata.app_type {
        AppType::Postgres => {
            let user = resolved_env(metadata, "POSTGRES_USER", env_map)
                .unwrap_or_else(|| "postgres".into());
            Some(format!("pg_isready -U {}", shell_single_quote(&user)))
        }
        AppType::Mysql => Some("mysqladmin ping".into()),
        AppType::Redis => Some("redis-cli ping".into()),
        _ => None,
    }
}

/// Pipe the dump into a client bound to the maintenance database, with
/// explicit credentials. EOF plus a short grace period ends the replay.
async fn replay_dump(
    engine: &dyn EngineClient,
    reader: &ArtifactReader,
    container_id: &str,
    member: &MemberPlan,
    env_map: &HashMap<String, String>,
) -> Result<(), CoreError> {
    let entry = format!("services/{}/{DUMP_ENTRY}", member.name);
    let staged = tempfile::NamedTempFile::new()?;
    let bytes = reader.read_to_file(&entry, staged.path()).await?;
    if bytes < DUMP_SANITY_BYTES {
        tracing::warn!(service = %member.service, bytes, "dump is suspiciously small");
    }

    let Some(script) = replay_script(&member.metadata, env_map) else {
        return Ok(());
    };
    let mut req = ExecRequest::shell(script);
    req.stdin_file = Some(staged.path().to_path_buf());

    let output = tokio::time::timeout(timeouts::SQL_REPLAY, engine.exec(container_id, req))
        .await
        .map_err(|_| {
            CoreError::Timeout(format!(
                "SQL replay exceeded {}s",
                timeouts::SQL_REPLAY.as_secs()
            ))
        })??;
    // Client EOF grace: let the server settle before dependents connect.
    tokio::time::sleep(Duration::from_secs(2)).await;

    if output.exit_code.unwrap_or(0) != 0 {
        return Err(CoreError::ReplayFailed(format!(
            "client exited with {}: {}",
            output.exit_code.unwrap_or(-1),
            output.stderr_text().trim()
        )));
    }
    tracing::info!(service = %member.service, bytes, "dump replayed");
    Ok(())
}

fn replay_script(
    metadata: &ContainerMetadata,
    env_map: &HashMap<String, String>,
) -> Option<String> {
    match metadata.app_type {
        AppType::Postgres => {
            let user = resolved_env(metadata, "POSTGRES_USER", env_map)
                .unwrap_or_else(|| "postgres".into());
            let password = resolved_env(metadata, "POSTGRES_PASSWORD", env_map)
                .or_else(|| resolved_env(metadata, "POSTGRES_PASS", env_map));
            Some(match password {
                Some(pwd) => format!(
                    "PGPASSWORD={} psql -U {} -d postgres",
                    shell_single_quote(&pwd),
                    shell_single_quote(&user)
                ),
                None => format!("psql -U {} -d postgres", shell_single_quote(&user)),
            })
        }
        AppType::Mysql => {
            let password = resolved_env(metadata, "MYSQL_ROOT_PASSWORD", env_map);
            Some(match password {
                Some(pwd) => format!("mysql -u root -p{}", shell_single_quote(&pwd)),
                None => "mysql -u root".to_string(),
            })
        }
        _ => None,
    }
}

/// A restored dump may have renamed or re-passworded the role; the
/// env-declared password stays authoritative so dependents can reconnect.
async fn resync_postgres_role(
    engine: &dyn EngineClient,
    container_id: &str,
    metadata: &ContainerMetadata,
    env_map: &HashMap<String, String>,
) -> Result<(), CoreError> {
    let user =
        resolved_env(metadata, "POSTGRES_USER", env_map).unwrap_or_else(|| "postgres".into());
    let password = resolved_env(metadata, "POSTGRES_PASSWORD", env_map)
        .or_else(|| resolved_env(metadata, "POSTGRES_PASS", env_map));
    let Some(password) = password else {
        return Ok(());
    };

    let sql = resync_sql(&user, &password);
    let script = format!(
        "PGPASSWORD={} psql -U {} -d postgres -c {}",
        shell_single_quote(&password),
        shell_single_quote(&user),
        shell_single_quote(&sql)
    );
    let output = engine
        .exec(container_id, ExecRequest::shell(script))
        .await?;
    if output.exit_code.unwrap_or(0) != 0 {
        return Err(CoreError::ReplayFailed(format!(
            "role resync exited with {}: {}",
            output.exit_code.unwrap_or(-1),
            output.stderr_text().trim()
        )));
    }
    tracing::info!(container_id, user = %user, "postgres role resynced");
    Ok(())
}

/// Idempotent create-or-update of the env-declared role.
fn resync_sql(user: &str, password: &str) -> String {
    let ident = sql_quote_ident(user);
    let user_lit = sql_quote_literal(user);
    let pwd_lit = sql_quote_literal(password);
    format!(
        "DO $$ BEGIN IF NOT EXISTS (SELECT FROM pg_catalog.pg_roles WHERE rolname={user_lit}) \
         THEN CREATE ROLE {ident} WITH LOGIN PASSWORD {pwd_lit}; END IF; END $$; \
         ALTER ROLE {ident} WITH PASSWORD {pwd_lit}; ALTER ROLE {ident} SUPERUSER;"
    )
}

/// Environment lookup with `${VAR}` resolution applied to the stored value.
fn resolved_env(
    metadata: &ContainerMetadata,
    key: &str,
    env_map: &HashMap<String, String>,
) -> Option<String> {
    metadata
        .env_value(key)
        .map(|raw| interpolate(raw, env_map))
        .filter(|v| !v.is_empty())
}
