//! Reload coordinator
//!
//! One coordinator per managed container. It owns the container's
//! [`ChangeLedger`] and runs the reload state machine
//! (`Idle -> Draining -> Reconciling -> Finalizing -> Idle`) under a
//! per-container lock acquired with a timeout.

mod assistant;
mod report;
mod run;

pub use assistant::ContainerAssistant;
pub use report::{FailureStage, ObjectFailure, ReloadReport};

use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard, broadcast};
use tracing::{debug, info, trace};

use hotswap_kernel::config::CoordinatorConfig;
use hotswap_kernel::{
    CacheResettable, ChangeLedger, ContainerAdapter, ContainerId, LoaderId,
    ManagedObjectDefinition, MappingRefresher, ReloadEvent, ReloadPhase, ResourceRef, TypeName,
};

use run::{ReloadRun, RunContext, publish_phase};

/// Reload coordinator errors
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReloadError {
    #[error("Reload lock for {container} not acquired after {attempts} attempts")]
    LockTimeout {
        container: ContainerId,
        attempts: u32,
    },
}

/// Drives reloads of one container.
pub struct ReloadCoordinator {
    adapter: Arc<dyn ContainerAdapter>,
    ledger: Arc<ChangeLedger>,
    assistant: ContainerAssistant,
    config: CoordinatorConfig,
    reload_lock: Mutex<()>,
    phase: AtomicU8,
    collaborators: RwLock<Vec<Arc<dyn CacheResettable>>>,
    refreshers: RwLock<Vec<Arc<dyn MappingRefresher>>>,
    events: broadcast::Sender<ReloadEvent>,
}

impl ReloadCoordinator {
    pub fn new(
        adapter: Arc<dyn ContainerAdapter>,
        config: CoordinatorConfig,
        events: broadcast::Sender<ReloadEvent>,
    ) -> Self {
        Self {
            adapter,
            ledger: Arc::new(ChangeLedger::new()),
            assistant: ContainerAssistant::new(),
            config,
            reload_lock: Mutex::new(()),
            phase: AtomicU8::new(ReloadPhase::Idle.as_u8()),
            collaborators: RwLock::new(Vec::new()),
            refreshers: RwLock::new(Vec::new()),
            events,
        }
    }

    pub fn id(&self) -> ContainerId {
        self.adapter.id()
    }

    pub fn parent(&self) -> Option<ContainerId> {
        self.adapter.parent()
    }

    pub fn loader(&self) -> LoaderId {
        self.adapter.loader()
    }

    pub fn adapter(&self) -> &Arc<dyn ContainerAdapter> {
        &self.adapter
    }

    /// Shared so container callbacks can report changes mid-run.
    pub fn ledger(&self) -> &Arc<ChangeLedger> {
        &self.ledger
    }

    pub fn assistant(&self) -> &ContainerAssistant {
        &self.assistant
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn phase(&self) -> ReloadPhase {
        ReloadPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn reload_count(&self) -> u64 {
        self.assistant.reload_count()
    }

    pub fn add_changed_type(&self, type_name: TypeName) -> bool {
        self.ledger.add_changed_type(type_name)
    }

    pub fn add_changed_config(&self, resource: ResourceRef) -> bool {
        self.ledger.add_changed_config(resource)
    }

    pub fn add_changed_structural(&self, resource: ResourceRef) -> bool {
        self.ledger.add_changed_structural(resource)
    }

    pub fn add_new_definition(&self, definition: ManagedObjectDefinition) -> bool {
        self.ledger.add_new_definition(definition)
    }

    pub fn has_pending_changes(&self) -> bool {
        self.ledger.has_pending_changes()
    }

    pub fn add_cache_collaborator(&self, collaborator: Arc<dyn CacheResettable>) {
        self.collaborators.write().push(collaborator);
    }

    pub fn add_mapping_refresher(&self, refresher: Arc<dyn MappingRefresher>) {
        self.refreshers.write().push(refresher);
    }

    /// Seed the name to structural resource map from `definitions`.
    pub fn track_structural(&self, definitions: &[ManagedObjectDefinition]) {
        for definition in definitions {
            if let Some(resource) = definition.structural_resource() {
                self.assistant
                    .record_structural(definition.name.clone(), resource.clone());
            }
        }
    }

    /// Record every registered definition that a structural resource
    /// declares. Returns the number of names tracked afterwards.
    pub async fn sync_structural(&self) -> usize {
        let mut declared = Vec::new();
        for name in self.adapter.list_definition_names().await {
            match self.adapter.get_definition(&name).await {
                Ok(definition) if definition.structural_resource().is_some() => {
                    declared.push(definition)
                }
                _ => {}
            }
        }
        self.track_structural(&declared);
        let tracked = self.assistant.structural_names();
        trace!(container = %self.id(), tracked, "Structural origins synced");
        tracked
    }

    /// Whether this container was built from `resource`, consulting the
    /// container's definitions when the resource is not yet known.
    pub async fn tracks_structural(&self, resource: &ResourceRef) -> bool {
        if self.assistant.structural_resources().contains(resource) {
            return true;
        }
        self.sync_structural().await;
        self.assistant.structural_resources().contains(resource)
    }

    /// Run the state machine once if the ledger has pending changes.
    ///
    /// Returns `Ok(None)` when there was nothing to do. Per-object
    /// failures are reported in the returned [`ReloadReport`], never as
    /// an error.
    pub async fn reload(&self, timestamp: u64) -> Result<Option<ReloadReport>, ReloadError> {
        let _lock = self.acquire_reload_lock().await?;

        if !self.ledger.has_pending_changes() {
            debug!(container = %self.id(), "Nothing to reload");
            return Ok(None);
        }

        let container = self.id();
        let started = Instant::now();
        let _in_progress = self.assistant.begin_reload();
        self.sync_structural().await;
        info!(container = %container, timestamp, "Reload started");
        let _ = self
            .events
            .send(ReloadEvent::RunStarted { container, timestamp });

        let cx = RunContext {
            adapter: self.adapter.as_ref(),
            ledger: &self.ledger,
            assistant: &self.assistant,
            config: &self.config,
            collaborators: self.collaborators.read().clone(),
            refreshers: self.refreshers.read().clone(),
            events: &self.events,
            phase: &self.phase,
        };
        let mut report = ReloadRun::new(cx, timestamp).execute().await;

        report.duration = started.elapsed();
        let reload_count = self.assistant.record_completed(timestamp, report.duration);
        publish_phase(&self.phase, &self.events, container, ReloadPhase::Idle);
        info!(
            container = %container,
            reload_count,
            passes = report.passes,
            destroyed = report.destroyed.len(),
            failures = report.failures.len(),
            duration_ms = report.duration.as_millis() as u64,
            "Reload completed"
        );
        let _ = self.events.send(ReloadEvent::RunCompleted {
            container,
            reload_count,
            duration: report.duration,
        });
        Ok(Some(report))
    }

    async fn acquire_reload_lock(&self) -> Result<MutexGuard<'_, ()>, ReloadError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match tokio::time::timeout(self.config.lock_timeout(), self.reload_lock.lock()).await {
                Ok(guard) => return Ok(guard),
                Err(_) if attempts < self.config.max_lock_attempts => {
                    debug!(container = %self.id(), attempts, "Reload lock busy, retrying");
                    tokio::time::sleep(self.config.lock_retry()).await;
                }
                Err(_) => {
                    return Err(ReloadError::LockTimeout {
                        container: self.id(),
                        attempts,
                    });
                }
            }
        }
    }
}
