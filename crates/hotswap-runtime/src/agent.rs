//! Agent facade
//!
//! Wires the pipeline from a [`HotSwapConfig`]: logging, the command
//! scheduler worker, the coordinator registry, the redefinition
//! front-end with the configured interests and, when roots are
//! configured, the filesystem watcher.

use error_stack::{Report, ResultExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use hotswap_kernel::config::{ConfigError, HotSwapConfig};
use hotswap_kernel::{
    ContainerAdapter, ContainerId, HotSwapError, HotSwapResult, IntoHotSwapReport, LoaderId,
    ReloadEvent,
};

use crate::commands::{FileChangeRouter, schedule_reload};
use crate::coordinator::ReloadCoordinator;
use crate::frontend::{Interest, RedefinitionFrontEnd};
use crate::logging::init_logging;
use crate::registry::CoordinatorRegistry;
use crate::scheduler::{CommandScheduler, SubmitOutcome};
use crate::watcher::ChangeWatcher;

/// Installed hot-swap agent.
pub struct HotSwapAgent {
    config: HotSwapConfig,
    registry: Arc<CoordinatorRegistry>,
    scheduler: Arc<CommandScheduler>,
    frontend: Arc<RedefinitionFrontEnd>,
    watcher: tokio::sync::Mutex<Option<ChangeWatcher>>,
    router: Mutex<Option<JoinHandle<()>>>,
}

impl HotSwapAgent {
    /// Install from an in-memory configuration. Must run inside a tokio
    /// runtime; the scheduler worker and watcher tasks are spawned on it.
    pub fn install(config: HotSwapConfig) -> HotSwapResult<Self> {
        let config = config.normalized();
        config
            .validate()
            .into_report()
            .attach("validating agent configuration")?;
        init_logging(&config.logging);

        let registry = Arc::new(CoordinatorRegistry::new(config.coordinator.clone()));
        let scheduler = CommandScheduler::start(config.scheduler.clone(), registry.events().clone());
        let frontend = Arc::new(RedefinitionFrontEnd::new(registry.clone(), &scheduler));

        for (i, interest) in config.interests.iter().enumerate() {
            let interest = Interest::from_config(interest)
                .map_err(|e| ConfigError::Invalid {
                    field: format!("interests[{i}].pattern"),
                    reason: e.to_string(),
                })
                .into_report()?;
            frontend.register_interest(interest);
        }

        let mut watcher = None;
        let mut router = None;
        if !config.watch.roots.is_empty() {
            let mut change_watcher = ChangeWatcher::new(&config.watch);
            let changes = change_watcher.take_event_receiver();
            change_watcher
                .start()
                .map_err(Report::new)
                .change_context(HotSwapError::Runtime(
                    "filesystem watcher failed to start".to_string(),
                ))
                .attach(format!("{} watch roots", config.watch.roots.len()))?;

            if let Some(changes) = changes {
                let file_router =
                    FileChangeRouter::new(frontend.clone(), registry.clone(), scheduler.clone());
                router = Some(tokio::spawn(file_router.run(changes)));
            }
            watcher = Some(change_watcher);
        }

        info!(
            roots = config.watch.roots.len(),
            interests = frontend.interest_count(),
            delay_ms = config.scheduler.reload_delay().as_millis() as u64,
            "HotSwap agent installed"
        );

        Ok(Self {
            config,
            registry,
            scheduler,
            frontend,
            watcher: tokio::sync::Mutex::new(watcher),
            router: Mutex::new(router),
        })
    }

    /// Load configuration (with `HOTSWAP_` environment overrides) and
    /// install.
    pub fn install_from_file(path: &str) -> HotSwapResult<Self> {
        let config = HotSwapConfig::load(path)
            .into_report()
            .attach(format!("loading {path}"))?;
        Self::install(config)
    }

    pub fn config(&self) -> &HotSwapConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<CoordinatorRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &Arc<CommandScheduler> {
        &self.scheduler
    }

    pub fn frontend(&self) -> &Arc<RedefinitionFrontEnd> {
        &self.frontend
    }

    /// Bind a container to a coordinator (created on first call).
    pub fn register_container(&self, adapter: Arc<dyn ContainerAdapter>) -> Arc<ReloadCoordinator> {
        self.registry.coordinator_for(adapter)
    }

    /// Container-destroyed notification. Returns whether it was known.
    pub fn container_destroyed(&self, container: ContainerId) -> bool {
        self.registry.remove(container).is_some()
    }

    pub fn register_interest(&self, interest: Interest) {
        self.frontend.register_interest(interest);
    }

    /// Class-file transformation callback; see
    /// [`RedefinitionFrontEnd::transform`].
    pub fn on_class_file_transform(
        &self,
        loader: &LoaderId,
        type_name: &str,
        redefining: bool,
        bytecode: &[u8],
    ) -> Option<Vec<u8>> {
        self.frontend.transform(loader, type_name, redefining, bytecode)
    }

    /// Schedule a reload of `container` through the debounce window.
    pub fn request_reload(&self, container: ContainerId) -> HotSwapResult<SubmitOutcome> {
        let coordinator = self.registry.get(container).ok_or_else(|| {
            Report::new(HotSwapError::Runtime(format!("unknown container {container}")))
        })?;
        schedule_reload(&self.scheduler, &self.registry, &coordinator)
            .into_result()
            .map_err(|e| HotSwapError::Runtime(e.to_string()))
            .into_report()
            .attach(format!("requesting reload of {container}"))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReloadEvent> {
        self.registry.subscribe()
    }

    /// Stop the watcher and the scheduler. A reload in flight completes;
    /// pending units are discarded.
    pub async fn shutdown(&self) {
        if let Some(mut watcher) = self.watcher.lock().await.take() {
            watcher.stop().await;
        }
        self.scheduler.shutdown().await;
        if let Some(router) = self.router.lock().take() {
            router.abort();
        }
        debug!("HotSwap agent shut down");
    }
}
