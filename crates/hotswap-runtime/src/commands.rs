//! Schedulable commands
//!
//! Every unit the scheduler runs: container reloads, candidate scans of
//! newly defined types, and the file-change commands produced by the
//! watcher.

use async_trait::async_trait;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use hotswap_kernel::{ContainerId, TypeName};

use crate::coordinator::ReloadCoordinator;
use crate::frontend::RedefinitionFrontEnd;
use crate::registry::CoordinatorRegistry;
use crate::scheduler::{Command, CommandKey, CommandScheduler, MergedCommands, SubmitOutcome};
use crate::watcher::{FileChange, FileEventKind, ResourceClass};

fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Reload one container once its debounce window elapses.
///
/// Pending reloads of the container's ancestors run first, even when
/// their own windows end later.
#[derive(Debug)]
pub struct ReloadCommand {
    container: ContainerId,
    ancestors: Vec<ContainerId>,
    coordinator: Weak<ReloadCoordinator>,
}

impl ReloadCommand {
    pub fn new(coordinator: &Arc<ReloadCoordinator>, ancestors: Vec<ContainerId>) -> Self {
        Self {
            container: coordinator.id(),
            ancestors,
            coordinator: Arc::downgrade(coordinator),
        }
    }
}

#[async_trait]
impl Command for ReloadCommand {
    fn key(&self) -> CommandKey {
        CommandKey::Reload(self.container)
    }

    fn container(&self) -> Option<ContainerId> {
        Some(self.container)
    }

    fn prerequisites(&self) -> Vec<CommandKey> {
        self.ancestors.iter().copied().map(CommandKey::Reload).collect()
    }

    async fn execute(&self, merged: &MergedCommands) {
        let Some(coordinator) = self.coordinator.upgrade() else {
            debug!(container = %self.container, "Container destroyed before reload");
            return;
        };
        trace!(container = %self.container, merged = merged.len(), "Reload requested");

        match coordinator.reload(now_millis()).await {
            Ok(Some(report)) if !report.is_clean() => warn!(
                container = %self.container,
                failures = report.failures.len(),
                deferred = report.deferred.len(),
                "Reload completed with failures"
            ),
            Ok(_) => {}
            // Ledger untouched; the next change retries.
            Err(e) => warn!(container = %self.container, "{}", e),
        }
    }
}

/// Submit a reload of `coordinator`'s container, ordered after any
/// pending reload of its registered ancestors.
pub fn schedule_reload(
    scheduler: &CommandScheduler,
    registry: &CoordinatorRegistry,
    coordinator: &Arc<ReloadCoordinator>,
) -> SubmitOutcome {
    let ancestors = registry.ancestors(coordinator.id());
    scheduler.submit(Arc::new(ReloadCommand::new(coordinator, ancestors)))
}

/// Ask one container's scanner whether a newly defined type is a
/// managed-object candidate.
#[derive(Debug)]
pub struct ScanCommand {
    container: ContainerId,
    coordinator: Weak<ReloadCoordinator>,
    type_name: TypeName,
    bytecode: Vec<u8>,
    registry: Weak<CoordinatorRegistry>,
    scheduler: Weak<CommandScheduler>,
}

impl ScanCommand {
    pub fn new(
        coordinator: &Arc<ReloadCoordinator>,
        type_name: TypeName,
        bytecode: Vec<u8>,
        registry: &Arc<CoordinatorRegistry>,
        scheduler: &Arc<CommandScheduler>,
    ) -> Self {
        Self {
            container: coordinator.id(),
            coordinator: Arc::downgrade(coordinator),
            type_name,
            bytecode,
            registry: Arc::downgrade(registry),
            scheduler: Arc::downgrade(scheduler),
        }
    }
}

#[async_trait]
impl Command for ScanCommand {
    fn key(&self) -> CommandKey {
        CommandKey::Scan {
            container: self.container,
            type_name: self.type_name.clone(),
        }
    }

    async fn execute(&self, _merged: &MergedCommands) {
        let (Some(coordinator), Some(registry), Some(scheduler)) = (
            self.coordinator.upgrade(),
            self.registry.upgrade(),
            self.scheduler.upgrade(),
        ) else {
            return;
        };

        let adapter = coordinator.adapter();
        let candidate = match adapter.scan_candidate(&self.type_name, &self.bytecode).await {
            Ok(Some(candidate)) => candidate,
            Ok(None) => {
                trace!(container = %self.container, type_name = %self.type_name, "Not a candidate");
                return;
            }
            Err(e) if e.is_unsupported() => {
                debug!(container = %self.container, "Candidate scan not available: {}", e);
                return;
            }
            Err(e) => {
                warn!(container = %self.container, type_name = %self.type_name, "Candidate scan failed: {}", e);
                return;
            }
        };

        if adapter.get_definition(&candidate.name).await.is_ok() {
            coordinator.add_changed_type(self.type_name.clone());
        } else {
            info!(
                container = %self.container,
                name = %candidate.name,
                type_name = %self.type_name,
                "Discovered new managed object"
            );
            coordinator.add_new_definition(candidate);
        }
        schedule_reload(&scheduler, &registry, &coordinator);
    }
}

/// A `.class` file changed on disk.
#[derive(Debug)]
pub struct ClassFileCommand {
    change: FileChange,
    type_name: TypeName,
    frontend: Weak<RedefinitionFrontEnd>,
}

impl ClassFileCommand {
    pub fn new(change: FileChange, type_name: TypeName, frontend: &Arc<RedefinitionFrontEnd>) -> Self {
        Self {
            change,
            type_name,
            frontend: Arc::downgrade(frontend),
        }
    }
}

#[async_trait]
impl Command for ClassFileCommand {
    fn key(&self) -> CommandKey {
        CommandKey::Resource {
            loader: self.change.loader.clone(),
            uri: self.change.resource().uri().to_string(),
        }
    }

    fn file_event(&self) -> Option<FileEventKind> {
        Some(self.change.kind)
    }

    async fn execute(&self, merged: &MergedCommands) {
        if merged.is_pure_delete() {
            debug!(type_name = %self.type_name, "Class file deleted, removal is not redefinable");
            return;
        }
        let Some(frontend) = self.frontend.upgrade() else {
            return;
        };
        let bytecode = match tokio::fs::read(&self.change.path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path = ?self.change.path, "Failed to read class file: {}", e);
                return;
            }
        };

        // A burst that starts with a create introduces the type.
        let redefining = merged.first_event() != Some(FileEventKind::Create);
        frontend.transform(
            &self.change.loader,
            self.type_name.as_str(),
            redefining,
            &bytecode,
        );
    }
}

/// A configuration or structural resource changed on disk.
#[derive(Debug)]
pub struct ResourceCommand {
    change: FileChange,
    registry: Weak<CoordinatorRegistry>,
    scheduler: Weak<CommandScheduler>,
}

impl ResourceCommand {
    pub fn new(
        change: FileChange,
        registry: &Arc<CoordinatorRegistry>,
        scheduler: &Arc<CommandScheduler>,
    ) -> Self {
        Self {
            change,
            registry: Arc::downgrade(registry),
            scheduler: Arc::downgrade(scheduler),
        }
    }
}

#[async_trait]
impl Command for ResourceCommand {
    fn key(&self) -> CommandKey {
        CommandKey::Resource {
            loader: self.change.loader.clone(),
            uri: self.change.resource().uri().to_string(),
        }
    }

    fn file_event(&self) -> Option<FileEventKind> {
        Some(self.change.kind)
    }

    async fn execute(&self, merged: &MergedCommands) {
        let resource = self.change.resource();
        if merged.is_pure_delete() {
            debug!(resource = %resource, "Resource deleted, keeping last applied state");
            return;
        }
        let (Some(registry), Some(scheduler)) = (self.registry.upgrade(), self.scheduler.upgrade())
        else {
            return;
        };

        for coordinator in registry.for_loader(&self.change.loader) {
            let recorded = match &self.change.class {
                ResourceClass::Config => coordinator.add_changed_config(resource.clone()),
                ResourceClass::Structural => {
                    // Only containers built from this resource re-parse it.
                    if !coordinator.tracks_structural(&resource).await {
                        continue;
                    }
                    coordinator.add_changed_structural(resource.clone())
                }
                ResourceClass::Class(_) => continue,
            };
            trace!(container = %coordinator.id(), resource = %resource, recorded, "Resource change recorded");
            schedule_reload(&scheduler, &registry, &coordinator);
        }
    }
}

/// Turns watcher output into scheduled commands.
pub struct FileChangeRouter {
    frontend: Arc<RedefinitionFrontEnd>,
    registry: Arc<CoordinatorRegistry>,
    scheduler: Arc<CommandScheduler>,
}

impl FileChangeRouter {
    pub fn new(
        frontend: Arc<RedefinitionFrontEnd>,
        registry: Arc<CoordinatorRegistry>,
        scheduler: Arc<CommandScheduler>,
    ) -> Self {
        Self {
            frontend,
            registry,
            scheduler,
        }
    }

    pub fn command_for(&self, change: FileChange) -> Arc<dyn Command> {
        match change.class.clone() {
            ResourceClass::Class(type_name) => {
                Arc::new(ClassFileCommand::new(change, type_name, &self.frontend))
            }
            ResourceClass::Config | ResourceClass::Structural => {
                Arc::new(ResourceCommand::new(change, &self.registry, &self.scheduler))
            }
        }
    }

    pub fn route(&self, change: FileChange) -> SubmitOutcome {
        self.scheduler.submit(self.command_for(change))
    }

    /// Route changes until the watcher closes or the scheduler stops.
    pub async fn run(self, mut changes: mpsc::Receiver<FileChange>) {
        while let Some(change) = changes.recv().await {
            if self.route(change) == SubmitOutcome::Rejected {
                debug!("Scheduler stopped, file change routing ends");
                return;
            }
        }
    }
}
