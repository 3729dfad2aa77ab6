use std::sync::Arc;

use crate::adapters;
use crate::config::AppConfig;
use crate::core::{
    CommandRunner, CreationOptions, DependencyService, DeviceService, ImageService, Orchestrator,
    SplitService, TransferService,
};

/// Every service, constructed once and shared.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub devices: Arc<DeviceService>,
    pub images: Arc<ImageService>,
    pub splitter: Arc<SplitService>,
    pub transfers: Arc<TransferService>,
    pub dependencies: Arc<DependencyService>,
    pub orchestrator: Arc<Orchestrator>,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Self {
        let runner = adapters::get_runner(&config);
        Self::with_runner(config, runner)
    }

    /// Wire the services around a specific runner.
    pub fn with_runner(config: AppConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let tools = &config.tools;

        let devices = Arc::new(DeviceService::new(runner.clone(), &tools.diskutil));
        let images = Arc::new(ImageService::new(
            runner.clone(),
            &tools.hdiutil,
            config.volumes_root.clone(),
        ));
        let splitter = Arc::new(SplitService::new(runner.clone(), &tools.wimlib));
        let transfers = Arc::new(TransferService::new(runner.clone(), &tools.rsync));
        let dependencies = Arc::new(DependencyService::new(runner, tools.clone()));

        let orchestrator = Arc::new(Orchestrator::new(
            devices.clone(),
            images.clone(),
            splitter.clone(),
            transfers.clone(),
            CreationOptions::from(&config),
        ));

        Self {
            config: Arc::new(config),
            devices,
            images,
            splitter,
            transfers,
            dependencies,
            orchestrator,
        }
    }
}
