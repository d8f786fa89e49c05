//! Cron-backed schedule triggers. Each non-manual schedule registers one
//! async trigger whose body only enqueues; the queue serializes the work.

use crate::models::job::JobKind;
use crate::models::stack::{Schedule, ScheduleTarget};
use crate::services::queue::JobRequest;
use crate::state::AppState;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

pub struct BackupScheduler {
    scheduler: Mutex<JobScheduler>,
    triggers: Mutex<HashMap<String, Uuid>>,
}

impl BackupScheduler {
    pub async fn new() -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            triggers: Mutex::new(HashMap::new()),
        })
    }

    /// Register every stored schedule. Returns the number of triggers.
    pub async fn init_schedules(&self, state: &Arc<AppState>) -> anyhow::Result<usize> {
        let mut count = 0;
        for (key, schedule) in state.store.schedules().await {
            match self.apply(state, &key, &schedule).await {
                Ok(true) => count += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(key = %key, error = %e, "failed to register schedule");
                }
            }
        }
        tracing::info!(count, "cron schedules initialized");
        Ok(count)
    }

    /// Replace the trigger for `key`. Manual frequency removes it and
    /// registers nothing.
    pub async fn apply(
        &self,
        state: &Arc<AppState>,
        key: &str,
        schedule: &Schedule,
    ) -> anyhow::Result<bool> {
        self.remove_key(key).await?;
        let Some(cron) = schedule.to_cron() else {
            return Ok(false);
        };

        let state = state.clone();
        let target = schedule.target;
        let key_owned = key.to_string();
        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let state = state.clone();
            let key = key_owned.clone();
            Box::pin(async move {
                tracing::info!(key = %key, "schedule fired, enqueueing backup");
                match target {
                    ScheduleTarget::Container => {
                        state.jobs.enqueue(
                            JobKind::BackupContainer,
                            &key,
                            JobRequest::BackupContainer {
                                container_id: key.clone(),
                                custom_paths: Vec::new(),
                            },
                        );
                    }
                    ScheduleTarget::Stack => {
                        state.jobs.enqueue(
                            JobKind::BackupStack,
                            &key,
                            JobRequest::BackupStack {
                                stack_name: key.clone(),
                            },
                        );
                    }
                }
            })
        })?;

        let id = self.scheduler.lock().await.add(job).await?;
        self.triggers.lock().await.insert(key.to_string(), id);
        tracing::info!(key, cron = %cron, "schedule registered");
        Ok(true)
    }

    pub async fn remove_key(&self, key: &str) -> anyhow::Result<bool> {
        let existing = self.triggers.lock().await.remove(key);
        if let Some(id) = existing {
            self.scheduler.lock().await.remove(&id).await?;
            return Ok(true);
        }
        Ok(false)
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.start().await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.shutdown().await?;
        Ok(())
    }
}
