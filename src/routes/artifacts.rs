use crate::error::AppError;
use crate::models::job::{Job, JobKind};
use crate::services::artifact::{ArtifactKind, ArtifactReader};
use crate::services::queue::JobRequest;
use crate::state::AppState;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new().route("/", get(list_artifacts))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ArtifactView {
    name: String,
    size_bytes: u64,
    modified: Option<String>,
}

async fn list_artifacts(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ArtifactView>>, AppError> {
    let mut views = Vec::new();
    let mut dir = match tokio::fs::read_dir(&state.config.backups_dir).await {
        Ok(dir) => dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Json(views)),
        Err(e) => return Err(AppError::Internal(e.into())),
    };
    while let Some(entry) = dir.next_entry().await.map_err(|e| anyhow::anyhow!(e))? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.ends_with(".zip") {
            continue;
        }
        let meta = entry.metadata().await.map_err(|e| anyhow::anyhow!(e))?;
        views.push(ArtifactView {
            name,
            size_bytes: meta.len(),
            modified: meta
                .modified()
                .ok()
                .map(|t| chrono::DateTime::<chrono::Utc>::from(t).to_rfc3339()),
        });
    }
    views.sort_by(|a, b| b.modified.cmp(&a.modified));
    Ok(Json(views))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestoreMode {
    /// Recreate next to the original with conflicts rewritten.
    Clone,
    /// Full unified-stack pipeline into place.
    Stack,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreRequest {
    pub artifact: String,
    pub mode: RestoreMode,
    pub network_override: Option<String>,
}

pub async fn restore(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RestoreRequest>,
) -> Result<(axum::http::StatusCode, Json<Job>), AppError> {
    if body.artifact.contains('/') || body.artifact.contains("..") {
        return Err(AppError::BadRequest("artifact must be a bare file name".into()));
    }
    let path = state.config.backups_dir.join(&body.artifact);
    if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
        return Err(AppError::NotFound("Artifact not found".into()));
    }
    let kind = ArtifactReader::open(&path).kind().await?;

    let job = match body.mode {
        RestoreMode::Stack => {
            if kind != ArtifactKind::UnifiedStack {
                return Err(AppError::BadRequest(
                    "artifact is not a unified stack archive".into(),
                ));
            }
            state.jobs.enqueue(
                JobKind::RestoreStackIntoPlace,
                &body.artifact,
                JobRequest::RestoreStack {
                    artifact: body.artifact.clone(),
                },
            )
        }
        RestoreMode::Clone => {
            let job_kind = match kind {
                ArtifactKind::SingleContainer => JobKind::RestoreContainer,
                ArtifactKind::LegacyNested => JobKind::RestoreClone,
                ArtifactKind::UnifiedStack => {
                    return Err(AppError::BadRequest(
                        "unified stack archives restore with mode=stack".into(),
                    ))
                }
                ArtifactKind::Unknown => {
                    return Err(AppError::BadRequest("unrecognized archive layout".into()))
                }
            };
            state.jobs.enqueue(
                job_kind,
                &body.artifact,
                JobRequest::RestoreClone {
                    artifact: body.artifact.clone(),
                    network_override: body.network_override,
                },
            )
        }
    };
    Ok((axum::http::StatusCode::ACCEPTED, Json(job)))
}
