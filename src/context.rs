use std::sync::Arc;

use crate::archive::{ArchiveCache, RangeSource};
use crate::bridge::HostCapabilities;
use crate::config::AppConfig;
use crate::core::JobRegistry;
use crate::core::build::BuildService;
use crate::core::device::DfuBackend;

/// Shared state handed to the orchestrator and the RPC surface.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub jobs: JobRegistry,
    pub archives: Arc<ArchiveCache>,
    pub devices: Arc<dyn DfuBackend>,
    pub host: Arc<dyn HostCapabilities>,
    pub builds: Arc<dyn BuildService>,
}

impl AppContext {
    pub fn new(
        config: AppConfig,
        devices: Arc<dyn DfuBackend>,
        host: Arc<dyn HostCapabilities>,
        source: Arc<dyn RangeSource>,
        builds: Arc<dyn BuildService>,
    ) -> Self {
        let archives = ArchiveCache::new(
            source,
            config.metadata_entry.clone(),
            config.archive_cache_capacity,
        );
        Self {
            config: Arc::new(config),
            jobs: JobRegistry::new(),
            archives: Arc::new(archives),
            devices,
            host,
            builds,
        }
    }
}
