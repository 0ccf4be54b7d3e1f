use std::sync::Arc;

use tracing::info;

use crate::app::adb::client::AdbClient;
use crate::app::adb::locator::AdbProgram;
use crate::app::config::AppConfig;
use crate::app::error::AppError;
use crate::app::registry::{DeviceRegistry, JsonFileStore};
use crate::app::scheduler::TaskScheduler;

/// Everything a caller needs to issue operations. The adb path is resolved
/// once here and shared by reference afterwards.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub client: Arc<AdbClient>,
    pub registry: Arc<DeviceRegistry>,
    pub scheduler: Arc<TaskScheduler>,
}

impl AppState {
    pub fn initialize(config: AppConfig, trace_id: &str) -> Result<Self, AppError> {
        let program = AdbProgram::resolve(&config.adb.command_path, trace_id)?;
        info!(trace_id = %trace_id, adb = %program.as_str(), "adb resolved");

        let registry_path = config.registry_path();
        let registry = DeviceRegistry::open(
            Box::new(JsonFileStore::new(registry_path)),
            config.registry.max_devices,
        )?;
        let client = AdbClient::new(program, &config);
        Ok(Self::from_parts(config, client, registry))
    }

    pub fn from_parts(config: AppConfig, client: AdbClient, registry: DeviceRegistry) -> Self {
        let scheduler = TaskScheduler::new(
            config.scheduler.max_parallel_tasks,
            config.scheduler.serialize_per_address,
        );
        Self {
            config: Arc::new(config),
            client: Arc::new(client),
            registry: Arc::new(registry),
            scheduler: Arc::new(scheduler),
        }
    }
}
