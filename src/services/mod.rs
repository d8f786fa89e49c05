pub mod app_detect;
pub mod artifact;
pub mod container_backup;
pub mod container_restore;
pub mod queue;
pub mod quote;
pub mod scheduler;
pub mod stack_backup;
pub mod stack_restore;
pub mod uploader;

/// Stage timeouts (§ concurrency model). All are fatal for their stage.
pub mod timeouts {
    use std::time::Duration;

    pub const CONTAINER_STAGE: Duration = Duration::from_secs(300);
    pub const STACK_JOB: Duration = Duration::from_secs(600);
    pub const IMAGE_PULL: Duration = Duration::from_secs(300);
    pub const SQL_REPLAY: Duration = Duration::from_secs(300);
    pub const READINESS_ATTEMPTS: u32 = 30;
}
