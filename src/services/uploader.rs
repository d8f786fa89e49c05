//! Shipping finalized artifacts to the configured chat endpoint. The
//! caller decides what happens to the local file afterwards.

use crate::config::AppConfig;
use crate::error::CoreError;
use std::path::Path;
use std::time::Duration;
use tokio_util::io::ReaderStream;

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// POST the artifact as a document to `<root>/bot<token>/sendDocument`.
pub async fn send_to_telegram(config: &AppConfig, artifact: &Path) -> Result<(), CoreError> {
    let (token, chat_id) = config
        .telegram_target()
        .ok_or_else(|| CoreError::UploadFailed("telegram is not configured".into()))?;

    let file_name = artifact
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact.zip".into());
    let file = tokio::fs::File::open(artifact).await?;
    let length = file.metadata().await?.len();

    let part = reqwest::multipart::Part::stream_with_length(
        reqwest::Body::wrap_stream(ReaderStream::new(file)),
        length,
    )
    .file_name(file_name.clone())
    .mime_str("application/zip")
    .map_err(|e| CoreError::UploadFailed(e.to_string()))?;
    let form = reqwest::multipart::Form::new()
        .text("chat_id", chat_id.to_string())
        .part("document", part);

    let url = format!(
        "{}/bot{}/sendDocument",
        config.telegram_api_root.trim_end_matches('/'),
        token
    );
    let client = reqwest::Client::builder()
        .timeout(UPLOAD_TIMEOUT)
        .build()
        .map_err(|e| CoreError::UploadFailed(e.to_string()))?;

    tracing::info!(file = %file_name, length, "uploading artifact");
    let response = client
        .post(&url)
        .multipart(form)
        .send()
        .await
        .map_err(|e| CoreError::UploadFailed(e.to_string()))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(CoreError::UploadFailed(format!(
            "endpoint returned {status}: {}",
            body.chars().take(200).collect::<String>()
        )));
    }
    tracing::info!(file = %file_name, "artifact uploaded");
    Ok(())
}
