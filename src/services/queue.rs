//! Single-consumer FIFO job queue. Enqueues are visible immediately;
//! exactly one job is processing at any time; status records are replaced
//! atomically so UI reads see stale-but-consistent snapshots.

use crate::models::history::{Destination, HistoryEntry, HistoryStatus};
use crate::models::job::{Job, JobKind, JobStatus};
use crate::services::container_backup::BackupOutcome;
use crate::state::AppState;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub enum JobRequest {
    BackupContainer {
        container_id: String,
        custom_paths: Vec<String>,
    },
    BackupStack {
        stack_name: String,
    },
    RestoreClone {
        artifact: String,
        network_override: Option<String>,
    },
    RestoreStack {
        artifact: String,
    },
}

#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::UnboundedSender<(String, JobRequest)>,
    registry: Arc<DashMap<String, Job>>,
}

pub struct JobWorker {
    rx: mpsc::UnboundedReceiver<(String, JobRequest)>,
}

impl JobQueue {
    pub fn new() -> (Self, JobWorker) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                registry: Arc::new(DashMap::new()),
            },
            JobWorker { rx },
        )
    }

    /// Register and queue a job. The record is observable before the
    /// worker ever sees it.
    pub fn enqueue(&self, kind: JobKind, target: &str, request: JobRequest) -> Job {
        let job = Job::new(kind, target);
        self.registry.insert(job.id.clone(), job.clone());
        if self.tx.send((job.id.clone(), request)).is_err() {
            tracing::error!(job_id = %job.id, "worker is gone, job will never run");
        }
        job
    }

    pub fn job(&self, id: &str) -> Option<Job> {
        self.registry.get(id).map(|j| j.clone())
    }

    pub fn jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.registry.iter().map(|j| j.clone()).collect();
        jobs.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
        jobs
    }

    pub fn progress(&self, job_id: &str) -> Progress {
        Progress {
            registry: Some(self.registry.clone()),
            job_id: job_id.to_string(),
        }
    }

    /// Move a job forward. Transitions are monotonic; terminal states are
    /// final, and anything out of order is dropped.
    fn transition(&self, id: &str, status: JobStatus, message: impl Into<String>) {
        if let Some(mut job) = self.registry.get_mut(id) {
            if job.status.is_terminal() || status.rank() <= job.status.rank() {
                return;
            }
            job.status = status;
            job.message = message.into();
            job.last_updated = chrono::Utc::now().to_rfc3339();
        }
    }
}

/// Handle for in-flight progress text. Messages replace, never accumulate.
#[derive(Clone)]
pub struct Progress {
    registry: Option<Arc<DashMap<String, Job>>>,
    job_id: String,
}

impl Progress {
    /// Detached handle for direct service calls and tests.
    pub fn noop() -> Self {
        Self {
            registry: None,
            job_id: String::new(),
        }
    }

    pub fn update(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(job_id = %self.job_id, %message, "progress");
        if let Some(registry) = &self.registry {
            if let Some(mut job) = registry.get_mut(&self.job_id) {
                if job.status.is_terminal() {
                    return;
                }
                job.message = message;
                job.last_updated = chrono::Utc::now().to_rfc3339();
            }
        }
    }
}

impl JobWorker {
    /// Run the single consumer until the queue side is dropped.
    pub fn spawn(mut self, state: Arc<AppState>) {
        tokio::spawn(async move {
            tracing::info!("job worker started");
            while let Some((job_id, request)) = self.rx.recv().await {
                run_job(&state, &job_id, request).await;
            }
            tracing::info!("job worker stopped");
        });
    }
}

async fn run_job(state: &Arc<AppState>, job_id: &str, request: JobRequest) {
    state
        .jobs
        .transition(job_id, JobStatus::Processing, "processing");
    let progress = state.jobs.progress(job_id);

    match request {
        JobRequest::BackupContainer {
            container_id,
            custom_paths,
        } => {
            let result = super::container_backup::backup_container(
                state.engine.as_ref(),
                &state.store,
                &state.config.backups_dir,
                &container_id,
                &custom_paths,
                &progress,
            )
            .await;
            match result {
                Ok(outcome) => finish_backup(state, job_id, outcome).await,
                Err(e) => fail_job(state, job_id, &container_id, &e.to_string()).await,
            }
        }
        JobRequest::BackupStack { stack_name } => {
            let result = super::stack_backup::backup_stack(
                state.engine.as_ref(),
                &state.store,
                &state.config.backups_dir,
                &stack_name,
                &progress,
            )
            .await;
            match result {
                Ok(outcome) => finish_backup(state, job_id, outcome).await,
                Err(e) => fail_job(state, job_id, &stack_name, &e.to_string()).await,
            }
        }
        JobRequest::RestoreClone {
            artifact,
            network_override,
        } => {
            let path = state.config.backups_dir.join(&artifact);
            let result = super::container_restore::restore_artifact(
                state.engine.as_ref(),
                &path,
                network_override,
                &progress,
            )
            .await;
            match result {
                Ok(outcome) if outcome.errors.is_empty() => {
                    let message = if outcome.restored.is_empty() {
                        "nothing to restore".to_string()
                    } else {
                        format!("restored {}", outcome.restored.join(", "))
                    };
                    complete_job(state, job_id, &artifact, &message, None).await;
                }
                Ok(outcome) => {
                    fail_job(state, job_id, &artifact, &outcome.errors.join("; ")).await;
                }
                Err(e) => fail_job(state, job_id, &artifact, &e.to_string()).await,
            }
        }
        JobRequest::RestoreStack { artifact } => {
            let path = state.config.backups_dir.join(&artifact);
            let result = super::stack_restore::restore_stack(
                state.engine.as_ref(),
                state.deployer.as_ref(),
                &path,
                &progress,
            )
            .await;
            match result {
                Ok(outcome) => {
                    let message = if outcome.warnings.is_empty() {
                        format!(
                            "stack {} restored ({} services)",
                            outcome.stack_name,
                            outcome.services.len()
                        )
                    } else {
                        format!(
                            "stack {} restored ({} services, {} warnings)",
                            outcome.stack_name,
                            outcome.services.len(),
                            outcome.warnings.len()
                        )
                    };
                    complete_job(state, job_id, &artifact, &message, None).await;
                }
                Err(e) => fail_job(state, job_id, &artifact, &e.to_string()).await,
            }
        }
    }
}

/// Terminal handling for a finished backup: optional upload, then exactly
/// one history entry.
async fn finish_backup(state: &Arc<AppState>, job_id: &str, outcome: BackupOutcome) {
    let artifact_name = outcome
        .artifact_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    if !outcome.errors.is_empty() {
        let message = format!(
            "{} service(s) failed: {}",
            outcome.errors.len(),
            outcome.errors.join("; ")
        );
        state
            .jobs
            .transition(job_id, JobStatus::Failed, message.clone());
        record_history(
            state,
            HistoryEntry::new(
                &outcome.subject,
                HistoryStatus::Failed,
                Destination::Local,
                message,
            )
            .with_artifact(&artifact_name, outcome.size_bytes),
        )
        .await;
        return;
    }

    if state.config.telegram_target().is_some() {
        state
            .jobs
            .transition(job_id, JobStatus::Uploading, "uploading artifact");
        match super::uploader::send_to_telegram(&state.config, &outcome.artifact_path).await {
            Ok(()) => {
                if let Err(e) = tokio::fs::remove_file(&outcome.artifact_path).await {
                    tracing::warn!(error = %e, "uploaded artifact could not be deleted locally");
                }
                let message = success_message("uploaded to telegram", &outcome.warnings);
                state
                    .jobs
                    .transition(job_id, JobStatus::Completed, message.clone());
                record_history(
                    state,
                    {
                        let mut entry = HistoryEntry::new(
                            &outcome.subject,
                            HistoryStatus::Success,
                            Destination::Telegram,
                            message,
                        );
                        entry.size_bytes = Some(outcome.size_bytes);
                        entry
                    },
                )
                .await;
            }
            Err(e) => {
                let message = format!("upload failed, artifact kept locally: {e}");
                state
                    .jobs
                    .transition(job_id, JobStatus::Failed, message.clone());
                record_history(
                    state,
                    HistoryEntry::new(
                        &outcome.subject,
                        HistoryStatus::Failed,
                        Destination::Local,
                        message,
                    )
                    .with_artifact(&artifact_name, outcome.size_bytes),
                )
                .await;
            }
        }
        return;
    }

    let message = success_message("stored locally", &outcome.warnings);
    state
        .jobs
        .transition(job_id, JobStatus::Completed, message.clone());
    record_history(
        state,
        HistoryEntry::new(
            &outcome.subject,
            HistoryStatus::Success,
            Destination::Local,
            message,
        )
        .with_artifact(&artifact_name, outcome.size_bytes),
    )
    .await;
}

fn success_message(base: &str, warnings: &[String]) -> String {
    if warnings.is_empty() {
        base.to_string()
    } else {
        format!("{base} ({} warnings)", warnings.len())
    }
}

async fn complete_job(
    state: &Arc<AppState>,
    job_id: &str,
    subject: &str,
    message: &str,
    size: Option<u64>,
) {
    state
        .jobs
        .transition(job_id, JobStatus::Completed, message.to_string());
    let mut entry = HistoryEntry::new(
        subject,
        HistoryStatus::Success,
        Destination::Local,
        message.to_string(),
    );
    entry.size_bytes = size;
    record_history(state, entry).await;
}

/// Every failure surfaces as a history entry, whatever path it took.
async fn fail_job(state: &Arc<AppState>, job_id: &str, subject: &str, message: &str) {
    tracing::error!(job_id, subject, message, "job failed");
    state
        .jobs
        .transition(job_id, JobStatus::Failed, message.to_string());
    record_history(
        state,
        HistoryEntry::new(
            subject,
            HistoryStatus::Failed,
            Destination::Local,
            message.to_string(),
        ),
    )
    .await;
}

async fn record_history(state: &Arc<AppState>, entry: HistoryEntry) {
    if let Err(e) = state.store.append_history(entry).await {
        tracing::warn!(error = %e, "history entry could not be persisted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_is_immediately_visible() {
        let (queue, _worker) = JobQueue::new();
        let job = queue.enqueue(
            JobKind::BackupContainer,
            "abc",
            JobRequest::BackupContainer {
                container_id: "abc".into(),
                custom_paths: Vec::new(),
            },
        );
        let seen = queue.job(&job.id).unwrap();
        assert_eq!(seen.status, JobStatus::Pending);
        assert_eq!(seen.target, "abc");
    }

    #[test]
    fn test_transitions_are_monotonic() {
        let (queue, _worker) = JobQueue::new();
        let job = queue.enqueue(
            JobKind::BackupStack,
            "blog",
            JobRequest::BackupStack {
                stack_name: "blog".into(),
            },
        );
        queue.transition(&job.id, JobStatus::Processing, "working");
        queue.transition(&job.id, JobStatus::Pending, "rewind attempt");
        assert_eq!(queue.job(&job.id).unwrap().status, JobStatus::Processing);

        queue.transition(&job.id, JobStatus::Failed, "boom");
        queue.transition(&job.id, JobStatus::Completed, "too late");
        let terminal = queue.job(&job.id).unwrap();
        assert_eq!(terminal.status, JobStatus::Failed);
        assert_eq!(terminal.message, "boom");
    }

    #[test]
    fn test_progress_replaces_message() {
        let (queue, _worker) = JobQueue::new();
        let job = queue.enqueue(
            JobKind::BackupStack,
            "blog",
            JobRequest::BackupStack {
                stack_name: "blog".into(),
            },
        );
        let progress = queue.progress(&job.id);
        progress.update("[1/3] archiving db");
        progress.update("[2/3] archiving web");
        assert_eq!(queue.job(&job.id).unwrap().message, "[2/3] archiving web");
    }

    #[test]
    fn test_noop_progress_does_not_panic() {
        Progress::noop().update("ignored");
    }
}
