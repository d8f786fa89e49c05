use crate::compose::parser;
use crate::error::AppError;
use crate::models::job::{Job, JobKind};
use crate::models::stack::{ServiceSpec, StackDefinition};
use crate::services::queue::JobRequest;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_stacks))
        .route("/import", post(import_stack))
        .route("/{name}", axum::routing::delete(delete_stack))
        .route("/{name}/backup", post(backup_stack))
}

async fn list_stacks(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<StackDefinition>>, AppError> {
    Ok(Json(state.store.list_stacks().await))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRequest {
    pub stack_name: Option<String>,
    pub compose_text: String,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
    pub env_file: Option<String>,
}

/// Import or re-import a stack definition, deriving the per-service view
/// the backup side consumes.
async fn import_stack(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ImportRequest>,
) -> Result<(axum::http::StatusCode, Json<StackDefinition>), AppError> {
    let parsed = parser::parse(&body.compose_text).map_err(AppError::from)?;
    let stack_name = body
        .stack_name
        .or(parsed.name)
        .ok_or_else(|| AppError::BadRequest("stackName missing and manifest has no name".into()))?;
    if parsed.services.is_empty() {
        return Err(AppError::BadRequest("manifest declares no services".into()));
    }

    let services = parsed
        .services
        .into_iter()
        .map(|(name, svc)| {
            (
                name,
                ServiceSpec {
                    image: svc.image,
                    volume_destinations: svc.volumes,
                    env_overrides: svc.env,
                },
            )
        })
        .collect();

    let definition = StackDefinition {
        stack_name: stack_name.clone(),
        compose_text: body.compose_text,
        env_vars: body.env_vars,
        env_file: body.env_file,
        services,
        updated_at: chrono::Utc::now().to_rfc3339(),
    };
    state
        .store
        .put_stack(definition.clone())
        .await
        .map_err(AppError::from)?;
    tracing::info!(stack = %stack_name, services = definition.services.len(), "stack imported");
    Ok((axum::http::StatusCode::CREATED, Json(definition)))
}

async fn delete_stack(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<axum::http::StatusCode, AppError> {
    if state.store.delete_stack(&name).await.map_err(AppError::from)? {
        Ok(axum::http::StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound("Stack not found".into()))
    }
}

async fn backup_stack(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<(axum::http::StatusCode, Json<Job>), AppError> {
    let job = state.jobs.enqueue(
        JobKind::BackupStack,
        &name,
        JobRequest::BackupStack { stack_name: name.clone() },
    );
    Ok((axum::http::StatusCode::ACCEPTED, Json(job)))
}
