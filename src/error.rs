use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Failure kinds for backup/restore work. Fatality depends on the job kind:
/// per-path capture failures inside a volume backup are downgraded to
/// warnings by the caller; everything else terminates the job it occurs in.
#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    #[error("engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("capture failed: {0}")]
    CaptureFailed(String),

    #[error("empty capture: {0}")]
    CaptureEmpty(String),

    #[error("rewrite failed: {0}")]
    RewriteFailed(String),

    #[error("deploy failed: {0}")]
    DeployFailed(String),

    #[error("database not ready: {0}")]
    ReadinessTimeout(String),

    #[error("replay failed: {0}")]
    ReplayFailed(String),

    #[error("upload failed: {0}")]
    UploadFailed(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Map an engine error: API responses keep their message, anything
    /// transport-shaped becomes `EngineUnavailable`.
    pub fn engine(err: bollard::errors::Error) -> Self {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => CoreError::NotFound(message),
            bollard::errors::Error::DockerResponseServerError {
                status_code,
                message,
            } => CoreError::CaptureFailed(format!("engine returned {status_code}: {message}")),
            other => CoreError::EngineUnavailable(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Parse(err.to_string())
    }
}

impl From<serde_yaml::Error> for CoreError {
    fn from(err: serde_yaml::Error) -> Self {
        CoreError::Parse(err.to_string())
    }
}

impl From<zip::result::ZipError> for CoreError {
    fn from(err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(e) => CoreError::Io(e),
            other => CoreError::Parse(other.to_string()),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    ServiceUnavailable(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, msg) = match &self {
            AppError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            AppError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            AppError::Conflict(m) => (StatusCode::CONFLICT, m.clone()),
            AppError::ServiceUnavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m.clone()),
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".into())
            }
        };
        (status, Json(json!({ "error": msg }))).into_response()
    }
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NotFound(m) => AppError::NotFound(format!("{m} not found")),
            CoreError::EngineUnavailable(m) => AppError::ServiceUnavailable(m),
            CoreError::Parse(m) => AppError::BadRequest(m),
            other => AppError::Internal(anyhow::anyhow!(other)),
        }
    }
}
