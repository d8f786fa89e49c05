pub mod artifacts;
pub mod containers;
pub mod history;
pub mod jobs;
pub mod schedules;
pub mod stacks;

use crate::state::AppState;
use axum::routing::post;
use axum::Router;
use std::sync::Arc;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api/containers", containers::router(state.clone()))
        .nest("/api/stacks", stacks::router(state.clone()))
        .nest("/api/jobs", jobs::router(state.clone()))
        .nest("/api/history", history::router(state.clone()))
        .nest("/api/schedules", schedules::router(state.clone()))
        .nest("/api/artifacts", artifacts::router(state.clone()))
        .route("/api/restore", post(artifacts::restore))
        .with_state(state)
}
