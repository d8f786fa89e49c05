//! Per-container artifact building. Databases get a logical dump; anything
//! else gets tar captures of its declared paths. The metadata document is
//! always the first entry in the archive.

use crate::engine::{EngineClient, ExecRequest};
use crate::error::CoreError;
use crate::services::app_detect::AppType;
use crate::services::artifact::{
    tar_entry_name, ArtifactWriter, ContainerMetadata, CONFIG_ENTRY, DUMP_ENTRY,
};
use crate::services::queue::Progress;
use crate::services::quote::shell_single_quote;
use crate::services::timeouts;
use crate::store::Store;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

#[derive(Debug)]
pub struct BackupOutcome {
    /// What was backed up, for history records.
    pub subject: String,
    pub artifact_path: PathBuf,
    pub size_bytes: u64,
    /// Downgraded per-path problems; never fail the job.
    pub warnings: Vec<String>,
    /// Fatal-kind errors recorded while the job kept going (unified
    /// backups record these per service). Non-empty fails the job.
    pub errors: Vec<String>,
}

/// Build one artifact for `container_id` under `backups_dir`.
pub async fn backup_container(
    engine: &dyn EngineClient,
    store: &Store,
    backups_dir: &Path,
    container_id: &str,
    custom_paths: &[String],
    progress: &Progress,
) -> Result<BackupOutcome, CoreError> {
    let inspect = engine.inspect_container(container_id).await?;
    let config = inspect.config.clone().unwrap_or_default();
    let image = config.image.clone().unwrap_or_default();
    let labels = config.labels.clone().unwrap_or_default();
    let app = AppType::detect(&image, &labels);

    let name = inspect
        .name
        .clone()
        .unwrap_or_else(|| container_id.to_string())
        .trim_start_matches('/')
        .to_string();
    let timestamp = chrono::Utc::now().format("%Y-%m-%d_%H-%M-%S");
    let artifact_path = backups_dir.join(format!("{name}_{timestamp}.zip"));

    tracing::info!(container = %name, %app, "starting container backup");
    let mut writer = ArtifactWriter::create(&artifact_path)?;

    let result = if app.has_dump_strategy() {
        let metadata = ContainerMetadata::from_inspect(&inspect, app, Vec::new());
        write_dump_subtree(engine, &mut writer, container_id, &metadata, "", progress).await
    } else {
        let paths = resolve_backup_paths(store, &inspect, &labels, app, custom_paths, true).await;
        let metadata = ContainerMetadata::from_inspect(&inspect, app, paths.clone());
        write_volume_subtree(
            engine,
            &mut writer,
            container_id,
            &metadata,
            &paths,
            "",
            "",
            progress,
        )
        .await
    };

    let warnings = match result {
        Ok(warnings) => warnings,
        Err(e) => {
            writer.abort().await;
            return Err(e);
        }
    };

    let artifact_path = writer.finalize(timeouts::CONTAINER_STAGE).await?;
    let size_bytes = tokio::fs::metadata(&artifact_path).await?.len();
    tracing::info!(container = %name, path = %artifact_path.display(), size_bytes, "backup finished");
    Ok(BackupOutcome {
        subject: name,
        artifact_path,
        size_bytes,
        warnings,
        errors: Vec::new(),
    })
}

/// Dump branch: metadata first, then `dump.sql`. Database volumes are
/// intentionally not tarred; the logical dump is the source of truth.
pub(crate) async fn write_dump_subtree(
    engine: &dyn EngineClient,
    writer: &mut ArtifactWriter,
    container_id: &str,
    metadata: &ContainerMetadata,
    prefix: &str,
    progress: &Progress,
) -> Result<Vec<String>, CoreError> {
    writer
        .append_bytes(
            &format!("{prefix}{CONFIG_ENTRY}"),
            serde_json::to_vec_pretty(metadata)?,
        )
        .await?;

    progress.update(format!("dumping database in {}", metadata.name));
    let mut warnings = Vec::new();
    let dump = capture_dump(engine, container_id, metadata, &mut warnings).await?;
    writer
        .append_file(&format!("{prefix}{DUMP_ENTRY}"), dump.path())
        .await?;
    Ok(warnings)
}

/// Volume branch: metadata first, then one tar entry per captured path.
/// Per-path failures become `ERROR_*` entries instead of failing the job.
/// `meta_prefix` and `data_prefix` differ only in the unified layout,
/// where tars nest under `volumes/`.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn write_volume_subtree(
    engine: &dyn EngineClient,
    writer: &mut ArtifactWriter,
    container_id: &str,
    metadata: &ContainerMetadata,
    paths: &[String],
    meta_prefix: &str,
    data_prefix: &str,
    progress: &Progress,
) -> Result<Vec<String>, CoreError> {
    writer
        .append_bytes(
            &format!("{meta_prefix}{CONFIG_ENTRY}"),
            serde_json::to_vec_pretty(metadata)?,
        )
        .await?;

    let mut warnings = Vec::new();
    if paths.is_empty() {
        warnings.push(format!("{}: no volumes defined", metadata.name));
        return Ok(warnings);
    }

    let total = paths.len();
    for (i, path) in paths.iter().enumerate() {
        progress.update(format!(
            "[{}/{}] capturing {} from {}",
            i + 1,
            total,
            path,
            metadata.name
        ));
        match capture_path(engine, container_id, path).await {
            Ok(staged) => {
                writer
                    .append_file(
                        &format!("{data_prefix}{}", tar_entry_name(path)),
                        staged.path(),
                    )
                    .await?;
            }
            Err(e) => {
                tracing::warn!(container_id, path, error = %e, "path capture failed");
                warnings.push(format!("{path}: {e}"));
                writer
                    .append_bytes(
                        &format!(
                            "{data_prefix}ERROR_{}.txt",
                            super::artifact::escape_path(path)
                        ),
                        e.to_string().into_bytes(),
                    )
                    .await?;
            }
        }
    }
    Ok(warnings)
}

/// The path set for the volume branch: stack-declared destinations for
/// this service, plus user-supplied custom paths. The unified path stops
/// there; the legacy single-container path (`allow_fallback`) also tries
/// the app hint table and finally the working directory.
pub(crate) async fn resolve_backup_paths(
    store: &Store,
    inspect: &bollard::models::ContainerInspectResponse,
    labels: &std::collections::HashMap<String, String>,
    app: AppType,
    custom_paths: &[String],
    allow_fallback: bool,
) -> Vec<String> {
    let mut paths: Vec<String> = Vec::new();

    if let (Some(project), Some(service)) = (
        labels.get(crate::engine::COMPOSE_PROJECT_LABEL),
        labels.get(crate::engine::COMPOSE_SERVICE_LABEL),
    ) {
        if let Some(stack) = store.get_stack(project).await {
            if let Some(svc) = stack.services.get(service) {
                paths.extend(svc.volume_destinations.iter().cloned());
            }
        }
    }

    for custom in custom_paths {
        if !paths.contains(custom) {
            paths.push(custom.clone());
        }
    }

    if paths.is_empty() && allow_fallback {
        paths.extend(app.default_data_paths().iter().map(|p| p.to_string()));
        if paths.is_empty() {
            let working_dir = inspect
                .config
                .as_ref()
                .and_then(|c| c.working_dir.clone())
                .filter(|w| !w.is_empty());
            paths.push(working_dir.unwrap_or_else(|| "/app".to_string()));
        }
    }

    paths
}

/// Run the app-specific dump client inside the container, staging stdout
/// to a temp file. Zero bytes out is a hard failure with stderr attached.
pub(crate) async fn capture_dump(
    engine: &dyn EngineClient,
    container_id: &str,
    metadata: &ContainerMetadata,
    warnings: &mut Vec<String>,
) -> Result<NamedTempFile, CoreError> {
    let staged = NamedTempFile::new()?;
    let script = dump_script(metadata)?;
    let mut req = ExecRequest::shell(script);
    req.stdout_file = Some(staged.path().to_path_buf());

    let output = tokio::time::timeout(
        timeouts::CONTAINER_STAGE,
        engine.exec(container_id, req),
    )
    .await
    .map_err(|_| {
        CoreError::Timeout(format!(
            "database dump exceeded {}s",
            timeouts::CONTAINER_STAGE.as_secs()
        ))
    })??;

    if output.stdout_bytes == 0 {
        return Err(CoreError::CaptureEmpty(format!(
            "dump produced no output: {}",
            output.stderr_text().trim()
        )));
    }
    if output.exit_code.unwrap_or(0) != 0 {
        warnings.push(format!(
            "dump client exited with {}: {}",
            output.exit_code.unwrap_or(-1),
            output.stderr_text().trim()
        ));
    }
    Ok(staged)
}

fn dump_script(metadata: &ContainerMetadata) -> Result<String, CoreError> {
    match metadata.app_type {
        AppType::Postgres => {
            let user = metadata.env_value("POSTGRES_USER").unwrap_or("postgres");
            let password = metadata
                .env_value("POSTGRES_PASSWORD")
                .or_else(|| metadata.env_value("POSTGRES_PASS"));
            Ok(match password {
                Some(pwd) => format!(
                    "PGPASSWORD={} pg_dumpall -U {} -w --clean --if-exists",
                    shell_single_quote(pwd),
                    shell_single_quote(user)
                ),
                None => format!(
                    "pg_dumpall -U {} -w --clean --if-exists",
                    shell_single_quote(user)
                ),
            })
        }
        AppType::Mysql => {
            let password = metadata.env_value("MYSQL_ROOT_PASSWORD");
            Ok(match password {
                Some(pwd) => format!(
                    "mysqldump -u root -p{} --all-databases",
                    shell_single_quote(pwd)
                ),
                None => "mysqldump -u root --skip-lock-tables --all-databases".to_string(),
            })
        }
        other => Err(CoreError::CaptureFailed(format!(
            "no dump strategy for app type {other}"
        ))),
    }
}

/// Tar-stream one container path to a temp file via the engine.
pub(crate) async fn capture_path(
    engine: &dyn EngineClient,
    container_id: &str,
    path: &str,
) -> Result<NamedTempFile, CoreError> {
    let staged = NamedTempFile::new()?;
    let bytes = tokio::time::timeout(
        timeouts::CONTAINER_STAGE,
        engine.get_archive(container_id, path, staged.path()),
    )
    .await
    .map_err(|_| {
        CoreError::Timeout(format!(
            "capture of {path} exceeded {}s",
            timeouts::CONTAINER_STAGE.as_secs()
        ))
    })?
    .map_err(|e| CoreError::CaptureFailed(format!("{path}: {e}")))?;
    if bytes == 0 {
        return Err(CoreError::CaptureFailed(format!(
            "{path}: engine returned an empty stream"
        )));
    }
    Ok(staged)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(app: AppType, env: &[&str]) -> ContainerMetadata {
        ContainerMetadata {
            name: "db".into(),
            image: "postgres:16".into(),
            env: env.iter().map(|s| s.to_string()).collect(),
            ports: Default::default(),
            host_config: None,
            cmd: Vec::new(),
            network_settings: None,
            app_type: app,
            backup_paths: Vec::new(),
            compose_project: None,
            compose_service: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    #[test]
    fn test_postgres_dump_script() {
        let m = metadata(
            AppType::Postgres,
            &["POSTGRES_USER=app", "POSTGRES_PASSWORD=s3cret"],
        );
        assert_eq!(
            dump_script(&m).unwrap(),
            "PGPASSWORD='s3cret' pg_dumpall -U 'app' -w --clean --if-exists"
        );
    }

    #[test]
    fn test_postgres_defaults_and_password_omission() {
        let m = metadata(AppType::Postgres, &[]);
        assert_eq!(
            dump_script(&m).unwrap(),
            "pg_dumpall -U 'postgres' -w --clean --if-exists"
        );
        let m = metadata(AppType::Postgres, &["POSTGRES_PASS=alt"]);
        assert!(dump_script(&m).unwrap().starts_with("PGPASSWORD='alt'"));
    }

    #[test]
    fn test_mysql_dump_script() {
        let m = metadata(AppType::Mysql, &["MYSQL_ROOT_PASSWORD=root"]);
        assert_eq!(
            dump_script(&m).unwrap(),
            "mysqldump -u root -p'root' --all-databases"
        );
        let m = metadata(AppType::Mysql, &[]);
        assert_eq!(
            dump_script(&m).unwrap(),
            "mysqldump -u root --skip-lock-tables --all-databases"
        );
    }

    #[test]
    fn test_generic_has_no_dump() {
        let m = metadata(AppType::Generic, &[]);
        assert!(dump_script(&m).is_err());
    }

    mod flows {
        use super::*;
        use crate::engine::testing::{tar_with_file, FakeEngine, ScriptedExec};
        use crate::services::artifact::ArtifactReader;

        async fn fixture() -> (tempfile::TempDir, Store, std::path::PathBuf) {
            let dir = tempfile::tempdir().unwrap();
            let store = Store::open(&dir.path().join("data")).await.unwrap();
            let backups = dir.path().join("backups");
            (dir, store, backups)
        }

        #[tokio::test]
        async fn test_generic_backup_layout() {
            let engine = FakeEngine::new();
            engine.add_container("c1", "nginx-1", "nginx:alpine", &[]);
            engine.serve_archive(
                "c1",
                "/usr/share/nginx/html",
                tar_with_file("html/index.html", b"<h1>hi</h1>"),
            );
            let (_dir, store, backups) = fixture().await;

            let outcome =
                backup_container(&engine, &store, &backups, "c1", &[], &Progress::noop())
                    .await
                    .unwrap();

            let reader = ArtifactReader::open(&outcome.artifact_path);
            let names = reader.entry_names().await.unwrap();
            assert_eq!(names[0], CONFIG_ENTRY);
            assert!(names.contains(&"usr_share_nginx_html.tar".to_string()));
            assert!(!names.iter().any(|n| n.ends_with(".sql")));

            let meta: ContainerMetadata =
                serde_json::from_slice(&reader.read_bytes(CONFIG_ENTRY).await.unwrap()).unwrap();
            assert_eq!(meta.backup_paths, vec!["/usr/share/nginx/html"]);
            assert_eq!(meta.app_type, AppType::Nginx);
            assert_eq!(outcome.subject, "nginx-1");
            assert!(outcome.warnings.is_empty());
        }

        #[tokio::test]
        async fn test_postgres_backup_dumps_no_tars() {
            let engine = FakeEngine::new();
            engine.add_container("db1", "blog-db", "postgres:16", &[]);
            engine.set_env("db1", &["POSTGRES_USER=app", "POSTGRES_PASSWORD=s3cret"]);
            let dump = b"CREATE ROLE \"app\";\nINSERT INTO t VALUES (1,'x');\n".to_vec();
            engine.script_exec(
                "pg_dumpall",
                ScriptedExec {
                    stdout: dump.clone(),
                    ..Default::default()
                },
            );
            let (_dir, store, backups) = fixture().await;

            let outcome =
                backup_container(&engine, &store, &backups, "db1", &[], &Progress::noop())
                    .await
                    .unwrap();

            let reader = ArtifactReader::open(&outcome.artifact_path);
            let names = reader.entry_names().await.unwrap();
            assert_eq!(names, vec![CONFIG_ENTRY.to_string(), DUMP_ENTRY.to_string()]);
            assert_eq!(reader.read_bytes(DUMP_ENTRY).await.unwrap(), dump);

            let scripts = engine.exec_scripts_run();
            assert!(scripts[0].contains("PGPASSWORD='s3cret' pg_dumpall -U 'app'"));
        }

        #[tokio::test]
        async fn test_zero_byte_dump_fails_with_stderr() {
            let engine = FakeEngine::new();
            engine.add_container("db1", "blog-db", "postgres:16", &[]);
            engine.script_exec(
                "pg_dumpall",
                ScriptedExec {
                    stderr: b"role \"postgres\" does not exist".to_vec(),
                    exit_code: 1,
                    ..Default::default()
                },
            );
            let (_dir, store, backups) = fixture().await;

            let err = backup_container(&engine, &store, &backups, "db1", &[], &Progress::noop())
                .await
                .unwrap_err();
            match err {
                CoreError::CaptureEmpty(msg) => assert!(msg.contains("does not exist")),
                other => panic!("expected CaptureEmpty, got {other}"),
            }
            // Partial artifact must be gone.
            let mut entries = tokio::fs::read_dir(&backups).await.unwrap();
            assert!(entries.next_entry().await.unwrap().is_none());
        }

        #[tokio::test]
        async fn test_failed_path_becomes_error_entry() {
            let engine = FakeEngine::new();
            engine.add_container("c1", "app-1", "custom/tool:1", &[]);
            engine.serve_archive("c1", "/srv/good", tar_with_file("good/a", b"a"));
            let (_dir, store, backups) = fixture().await;

            let outcome = backup_container(
                &engine,
                &store,
                &backups,
                "c1",
                &["/srv/good".into(), "/srv/missing".into()],
                &Progress::noop(),
            )
            .await
            .unwrap();

            let reader = ArtifactReader::open(&outcome.artifact_path);
            let names = reader.entry_names().await.unwrap();
            assert!(names.contains(&"srv_good.tar".to_string()));
            assert!(names.contains(&"ERROR_srv_missing.txt".to_string()));
            assert_eq!(outcome.warnings.len(), 1);
        }

        #[tokio::test]
        async fn test_unknown_container_is_not_found() {
            let engine = FakeEngine::new();
            let (_dir, store, backups) = fixture().await;
            let err = backup_container(&engine, &store, &backups, "ghost", &[], &Progress::noop())
                .await
                .unwrap_err();
            assert!(matches!(err, CoreError::NotFound(_)));
        }
    }
}
