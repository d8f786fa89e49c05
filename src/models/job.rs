use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    BackupContainer,
    BackupStack,
    RestoreContainer,
    RestoreStackIntoPlace,
    RestoreClone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Uploading,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Position in the pending → processing → uploading → terminal chain.
    /// Transitions must be strictly increasing; failed is final.
    pub fn rank(self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Processing => 1,
            JobStatus::Uploading => 2,
            JobStatus::Completed | JobStatus::Failed => 3,
        }
    }
}

/// One queued unit of work. The record is replaced atomically on every
/// transition, so observers always see a consistent snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    /// Container id, stack name, or artifact file name depending on kind.
    pub target: String,
    pub status: JobStatus,
    pub message: String,
    pub last_updated: String,
}

impl Job {
    pub fn new(kind: JobKind, target: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            target: target.into(),
            status: JobStatus::Pending,
            message: "queued".into(),
            last_updated: chrono::Utc::now().to_rfc3339(),
        }
    }
}
