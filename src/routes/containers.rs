use crate::engine;
use crate::error::AppError;
use crate::models::job::{Job, JobKind};
use crate::services::app_detect::AppType;
use crate::services::queue::JobRequest;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_containers))
        .route("/{id}/backup", post(backup_container))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ContainerView {
    id: String,
    name: String,
    image: String,
    state: String,
    app_type: AppType,
    compose_project: Option<String>,
}

async fn list_containers(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ContainerView>>, AppError> {
    let summaries = state.engine.list_containers(true).await?;
    let views = summaries
        .iter()
        .map(|c| ContainerView {
            id: c.id.clone().unwrap_or_default(),
            name: engine::container_name(c),
            image: c.image.clone().unwrap_or_default(),
            state: c.state.clone().unwrap_or_default(),
            app_type: AppType::detect(
                c.image.as_deref().unwrap_or_default(),
                &c.labels.clone().unwrap_or_default(),
            ),
            compose_project: engine::label(c, engine::COMPOSE_PROJECT_LABEL).map(String::from),
        })
        .collect();
    Ok(Json(views))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRequest {
    #[serde(default)]
    pub paths: Vec<String>,
}

async fn backup_container(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<BackupRequest>>,
) -> Result<(axum::http::StatusCode, Json<Job>), AppError> {
    let paths = body.map(|Json(b)| b.paths).unwrap_or_default();
    if paths.iter().any(|p| !p.starts_with('/')) {
        return Err(AppError::BadRequest("custom paths must be absolute".into()));
    }
    // Fail fast on unknown containers instead of queueing a doomed job.
    state.engine.inspect_container(&id).await?;

    let job = state.jobs.enqueue(
        JobKind::BackupContainer,
        &id,
        JobRequest::BackupContainer {
            container_id: id.clone(),
            custom_paths: paths,
        },
    );
    Ok((axum::http::StatusCode::ACCEPTED, Json(job)))
}
