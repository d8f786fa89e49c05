//! Unified stack backup: one archive carrying the manifest, env, and a
//! per-service subtree for every member container, archived sequentially.

use crate::engine::{self, EngineClient};
use crate::error::CoreError;
use crate::models::stack::StackDefinition;
use crate::services::app_detect::AppType;
use crate::services::artifact::{
    ArtifactWriter, ContainerMetadata, StackMember, StackMetadata, ENV_ENTRY, MANIFEST_ENTRY,
    STACK_METADATA_ENTRY,
};
use crate::services::container_backup::{
    resolve_backup_paths, write_dump_subtree, write_volume_subtree, BackupOutcome,
};
use crate::services::queue::Progress;
use crate::services::timeouts;
use crate::store::Store;
use bollard::models::ContainerSummary;
use std::path::Path;

pub async fn backup_stack(
    engine: &dyn EngineClient,
    store: &Store,
    backups_dir: &Path,
    stack_name: &str,
    progress: &Progress,
) -> Result<BackupOutcome, CoreError> {
    let definition = store.get_stack(stack_name).await;
    let summaries = engine.list_containers(true).await?;
    let members = enumerate_members(&summaries, stack_name, definition.as_ref());
    if members.is_empty() {
        return Err(CoreError::NotFound(format!(
            "no containers belong to stack {stack_name}"
        )));
    }

    let timestamp = chrono::Utc::now().format("%Y-%m-%d_%H-%M-%S");
    let artifact_path = backups_dir.join(format!("{stack_name}_stack_{timestamp}.zip"));
    tracing::info!(stack = stack_name, members = members.len(), "starting stack backup");
    let mut writer = ArtifactWriter::create(&artifact_path)?;

    let result = write_stack_archive(
        engine,
        store,
        &mut writer,
        stack_name,
        &members,
        definition.as_ref(),
        progress,
    )
    .await;

    let (warnings, errors) = match result {
        Ok(parts) => parts,
        Err(e) => {
            writer.abort().await;
            return Err(e);
        }
    };

    let artifact_path = writer.finalize(timeouts::STACK_JOB).await?;
    let size_bytes = tokio::fs::metadata(&artifact_path).await?.len();
    tracing::info!(
        stack = stack_name,
        path = %artifact_path.display(),
        size_bytes,
        failed_services = errors.len(),
        "stack backup finished"
    );
    Ok(BackupOutcome {
        subject: stack_name.to_string(),
        artifact_path,
        size_bytes,
        warnings,
        errors,
    })
}

/// Member selection: the compose project label is authoritative; without
/// it, fall back to containers whose service label names a service in the
/// imported definition.
pub(crate) fn enumerate_members(
    summaries: &[ContainerSummary],
    stack_name: &str,
    definition: Option<&StackDefinition>,
) -> Vec<StackMember> {
    let mut members: Vec<StackMember> = summaries
        .iter()
        .filter(|c| engine::label(c, engine::COMPOSE_PROJECT_LABEL) == Some(stack_name))
        .map(|c| to_member(c))
        .collect();

    if members.is_empty() {
        if let Some(def) = definition {
            members = summaries
                .iter()
                .filter(|c| {
                    engine::label(c, engine::COMPOSE_SERVICE_LABEL)
                        .is_some_and(|s| def.services.contains_key(s))
                })
                .map(|c| to_member(c))
                .collect();
        }
    }
    members
}

fn to_member(summary: &ContainerSummary) -> StackMember {
    StackMember {
        id: summary.id.clone().unwrap_or_default(),
        name: engine::container_name(summary),
        service: engine::label(summary, engine::COMPOSE_SERVICE_LABEL)
            .unwrap_or_default()
            .to_string(),
    }
}

async fn write_stack_archive(
    engine: &dyn EngineClient,
    store: &Store,
    writer: &mut ArtifactWriter,
    stack_name: &str,
    members: &[StackMember],
    definition: Option<&StackDefinition>,
    progress: &Progress,
) -> Result<(Vec<String>, Vec<String>), CoreError> {
    let metadata = StackMetadata {
        stack_name: stack_name.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        containers: members.to_vec(),
    };
    writer
        .append_bytes(STACK_METADATA_ENTRY, serde_json::to_vec_pretty(&metadata)?)
        .await?;

    if let Some(def) = definition {
        writer
            .append_bytes(MANIFEST_ENTRY, def.compose_text.clone().into_bytes())
            .await?;
        if let Some(env) = render_env(def).await {
            writer.append_bytes(ENV_ENTRY, env.into_bytes()).await?;
        }
    }

    let mut warnings = Vec::new();
    let mut errors = Vec::new();
    let total = members.len();
    for (i, member) in members.iter().enumerate() {
        progress.update(format!("[{}/{}] archiving {}", i + 1, total, member.name));
        if let Err(e) = archive_member(engine, store, writer, member, progress, &mut warnings).await
        {
            // Record and keep going; the job's terminal status reflects it.
            tracing::error!(stack = stack_name, container = %member.name, error = %e, "service backup failed");
            errors.push(format!("{}: {e}", member.name));
        }
    }
    Ok((warnings, errors))
}

/// `.env` content: explicit vars win, then the referenced env file.
async fn render_env(def: &StackDefinition) -> Option<String> {
    if !def.env_vars.is_empty() {
        let mut pairs: Vec<_> = def.env_vars.iter().collect();
        pairs.sort();
        let mut out = String::new();
        for (k, v) in pairs {
            out.push_str(&format!("{k}={v}\n"));
        }
        return Some(out);
    }
    if let Some(path) = &def.env_file {
        if let Ok(contents) = tokio::fs::read_to_string(path).await {
            return Some(contents);
        }
    }
    None
}

async fn archive_member(
    engine: &dyn EngineClient,
    store: &Store,
    writer: &mut ArtifactWriter,
    member: &StackMember,
    progress: &Progress,
    warnings: &mut Vec<String>,
) -> Result<(), CoreError> {
    let inspect = engine.inspect_container(&member.id).await?;
    let config = inspect.config.clone().unwrap_or_default();
    let image = config.image.clone().unwrap_or_default();
    let labels = config.labels.clone().unwrap_or_default();
    let app = AppType::detect(&image, &labels);
    let meta_prefix = format!("services/{}/", member.name);

    if app.has_dump_strategy() {
        let metadata = ContainerMetadata::from_inspect(&inspect, app, Vec::new());
        warnings.extend(
            write_dump_subtree(engine, writer, &member.id, &metadata, &meta_prefix, progress)
                .await?,
        );
    } else {
        // Unified path: only declared destinations, no hint fallback.
        let paths = resolve_backup_paths(store, &inspect, &labels, app, &[], false).await;
        let metadata = ContainerMetadata::from_inspect(&inspect, app, paths.clone());
        let data_prefix = format!("{meta_prefix}volumes/");
        warnings.extend(
            write_volume_subtree(
                engine,
                writer,
                &member.id,
                &metadata,
                &paths,
                &meta_prefix,
                &data_prefix,
                progress,
            )
            .await?,
        );
    }
    Ok(())
}
