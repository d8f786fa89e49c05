use crate::error::AppError;
use crate::models::stack::Schedule;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new().route("/", get(list_schedules)).route(
        "/{key}",
        axum::routing::put(put_schedule).delete(delete_schedule),
    )
}

async fn list_schedules(
    State(state): State<Arc<AppState>>,
) -> Json<HashMap<String, Schedule>> {
    Json(state.store.schedules().await)
}

/// Store the schedule and swap the live cron trigger in one step.
async fn put_schedule(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(schedule): Json<Schedule>,
) -> Result<Json<serde_json::Value>, AppError> {
    if schedule.to_cron().is_none() && schedule.frequency != crate::models::stack::Frequency::Manual
    {
        return Err(AppError::BadRequest(
            "schedule time or day of week is invalid".into(),
        ));
    }
    state
        .store
        .put_schedule(&key, schedule.clone())
        .await
        .map_err(AppError::from)?;
    let registered = state
        .scheduler
        .apply(&state, &key, &schedule)
        .await
        .map_err(AppError::Internal)?;
    Ok(Json(json!({ "key": key, "registered": registered })))
}

async fn delete_schedule(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<axum::http::StatusCode, AppError> {
    let removed = state
        .store
        .delete_schedule(&key)
        .await
        .map_err(AppError::from)?;
    state
        .scheduler
        .remove_key(&key)
        .await
        .map_err(AppError::Internal)?;
    if removed {
        Ok(axum::http::StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound("Schedule not found".into()))
    }
}
