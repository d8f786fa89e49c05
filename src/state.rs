use crate::compose::deployer::ComposeDeployer;
use crate::config::AppConfig;
use crate::engine::EngineClient;
use crate::services::queue::JobQueue;
use crate::services::scheduler::BackupScheduler;
use crate::store::Store;
use std::sync::Arc;

pub struct AppState {
    pub config: AppConfig,
    pub engine: Arc<dyn EngineClient>,
    pub deployer: Arc<dyn ComposeDeployer>,
    pub store: Store,
    pub jobs: JobQueue,
    pub scheduler: Arc<BackupScheduler>,
}
