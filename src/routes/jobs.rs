use crate::error::AppError;
use crate::models::job::Job;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_jobs))
        .route("/{id}", get(get_job))
}

async fn list_jobs(State(state): State<Arc<AppState>>) -> Json<Vec<Job>> {
    Json(state.jobs.jobs())
}

async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Job>, AppError> {
    match state.jobs.job(&id) {
        Some(job) => Ok(Json(job)),
        None => Err(AppError::NotFound("Job not found".into())),
    }
}
