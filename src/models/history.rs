use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// History is bounded; the store evicts the oldest entries past this.
pub const HISTORY_LIMIT: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
    Local,
    Telegram,
    Cloud,
}

/// One terminal job outcome. Append-only; every job writes exactly one of
/// these when it reaches completed or failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: String,
    pub timestamp: String,
    pub subject: String,
    pub status: HistoryStatus,
    pub destination: Destination,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<String>,
}

impl HistoryEntry {
    pub fn new(
        subject: impl Into<String>,
        status: HistoryStatus,
        destination: Destination,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            subject: subject.into(),
            status,
            destination,
            message: message.into(),
            size_bytes: None,
            artifact_path: None,
        }
    }

    pub fn with_artifact(mut self, path: impl Into<String>, size: u64) -> Self {
        self.artifact_path = Some(path.into());
        self.size_bytes = Some(size);
        self
    }
}
