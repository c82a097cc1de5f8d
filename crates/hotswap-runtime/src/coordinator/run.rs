//! One invocation of the reload state machine
//!
//! A run drains the ledger and reconciles the container in passes until
//! a pass leaves the ledger empty, then finalizes once: lifecycle
//! bootstrap, get-or-create of every singleton, and mapping refresh.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};

use hotswap_kernel::config::{CoordinatorConfig, ReparsePolicy};
use hotswap_kernel::{
    CacheResettable, ChangeKind, ChangeLedger, ContainerAdapter, ContainerError, ContainerId,
    DrainedChanges, ManagedObjectDefinition, MappingRefresher, ReloadEvent, ReloadPhase,
    ResourceRef, TypeName,
};

use super::assistant::ContainerAssistant;
use super::report::{FailureStage, ObjectFailure, ReloadReport};

/// Store `phase` and announce it.
pub(crate) fn publish_phase(
    slot: &AtomicU8,
    events: &broadcast::Sender<ReloadEvent>,
    container: ContainerId,
    phase: ReloadPhase,
) {
    slot.store(phase.as_u8(), Ordering::Release);
    trace!(container = %container, %phase, "Reload phase changed");
    let _ = events.send(ReloadEvent::PhaseChanged { container, phase });
}

/// Everything a run borrows from its coordinator.
pub(crate) struct RunContext<'a> {
    pub adapter: &'a dyn ContainerAdapter,
    pub ledger: &'a ChangeLedger,
    pub assistant: &'a ContainerAssistant,
    pub config: &'a CoordinatorConfig,
    pub collaborators: Vec<Arc<dyn CacheResettable>>,
    pub refreshers: Vec<Arc<dyn MappingRefresher>>,
    pub events: &'a broadcast::Sender<ReloadEvent>,
    pub phase: &'a AtomicU8,
}

pub(crate) struct ReloadRun<'a> {
    cx: RunContext<'a>,
    container: ContainerId,
    /// Destroy (and later recreate) without other changes
    to_reprocess: BTreeSet<String>,
    /// Worklist for transitive destruction
    to_destroy: VecDeque<String>,
    to_register_as_new: BTreeMap<String, ManagedObjectDefinition>,
    /// Dropped from their structural resource
    to_remove: BTreeSet<String>,
    /// Every name whose destruction was attempted in this run
    processed: BTreeSet<String>,
    destroyed_types: BTreeSet<TypeName>,
    deferred: BTreeSet<ResourceRef>,
    report: ReloadReport,
}

impl<'a> ReloadRun<'a> {
    pub(crate) fn new(cx: RunContext<'a>, timestamp: u64) -> Self {
        let container = cx.adapter.id();
        Self {
            cx,
            container,
            to_reprocess: BTreeSet::new(),
            to_destroy: VecDeque::new(),
            to_register_as_new: BTreeMap::new(),
            to_remove: BTreeSet::new(),
            processed: BTreeSet::new(),
            destroyed_types: BTreeSet::new(),
            deferred: BTreeSet::new(),
            report: ReloadReport::new(container, timestamp),
        }
    }

    pub(crate) async fn execute(mut self) -> ReloadReport {
        self.set_phase(ReloadPhase::Draining);
        let mut changes = self.cx.ledger.drain_all();

        loop {
            self.report.passes += 1;
            self.set_phase(ReloadPhase::Reconciling);
            debug!(
                container = %self.container,
                pass = self.report.passes,
                changes = changes.len(),
                "Reconciling"
            );
            self.pass(changes).await;

            if !self.cx.ledger.has_pending_changes() {
                break;
            }
            if self.report.passes >= self.cx.config.max_passes {
                warn!(
                    container = %self.container,
                    passes = self.report.passes,
                    pending = self.cx.ledger.pending_count(),
                    "No fixed point reached, leaving changes for the next reload"
                );
                break;
            }
            self.set_phase(ReloadPhase::Draining);
            changes = self.cx.ledger.drain_all();
        }

        for resource in &self.deferred {
            self.cx.ledger.add_changed_structural(resource.clone());
        }

        self.set_phase(ReloadPhase::Finalizing);
        self.finalize().await;
        self.report
    }

    async fn pass(&mut self, changes: DrainedChanges) {
        let mut types = BTreeSet::new();
        let mut config = BTreeSet::new();
        let mut structural = BTreeSet::new();
        for change in changes.into_changes() {
            match change {
                ChangeKind::Type(type_name) => {
                    types.insert(type_name);
                }
                ChangeKind::Config(resource) => {
                    config.insert(resource);
                }
                ChangeKind::Structural(resource) => {
                    structural.insert(resource);
                }
                ChangeKind::NewDefinition(definition) => {
                    self.to_register_as_new
                        .insert(definition.name.clone(), definition);
                }
            }
        }

        let snapshot = self.definitions().await;
        let types = self.relevant_types(types, &snapshot);

        self.reset_caches().await;

        let reparse = self.reload_config(&config, &snapshot).await;
        structural.extend(reparse);
        for resource in &structural {
            self.reload_structural(resource).await;
        }

        self.mark_changed_types(&types, &snapshot);
        self.register_new().await;
        self.destroy_marked().await;
        self.remove_dropped().await;
    }

    /// Registered definitions, skipping names that vanish mid-listing.
    async fn definitions(&self) -> Vec<ManagedObjectDefinition> {
        let mut definitions = Vec::new();
        for name in self.cx.adapter.list_definition_names().await {
            match self.cx.adapter.get_definition(&name).await {
                Ok(definition) => definitions.push(definition),
                Err(e) => trace!(container = %self.container, name, "Skipping definition: {}", e),
            }
        }
        definitions
    }

    /// Types bound to a definition or used as a factory type here.
    fn relevant_types(
        &self,
        types: BTreeSet<TypeName>,
        snapshot: &[ManagedObjectDefinition],
    ) -> BTreeSet<TypeName> {
        types
            .into_iter()
            .filter(|type_name| {
                let relevant = snapshot.iter().any(|def| {
                    &def.type_name == type_name || def.factory_type() == Some(type_name)
                });
                if !relevant {
                    trace!(
                        container = %self.container,
                        type_name = %type_name,
                        "Type not managed by this container"
                    );
                }
                relevant
            })
            .collect()
    }

    async fn reset_caches(&self) {
        let mut collaborators = self.cx.adapter.cache_collaborators();
        collaborators.extend(self.cx.collaborators.iter().cloned());

        for collaborator in collaborators {
            match collaborator.reset_caches().await {
                Ok(()) => trace!(
                    container = %self.container,
                    collaborator = collaborator.name(),
                    "Caches reset"
                ),
                Err(e) if e.is_unsupported() => debug!(
                    container = %self.container,
                    collaborator = collaborator.name(),
                    "Cache reset not available: {}", e
                ),
                Err(e) => warn!(
                    container = %self.container,
                    collaborator = collaborator.name(),
                    "Cache reset failed: {}", e
                ),
            }
        }
    }

    /// Reload changed property sources and mark objects whose
    /// placeholders moved. Returns the structural resources to re-parse.
    async fn reload_config(
        &mut self,
        config: &BTreeSet<ResourceRef>,
        snapshot: &[ManagedObjectDefinition],
    ) -> BTreeSet<ResourceRef> {
        if config.is_empty() {
            return BTreeSet::new();
        }

        let mut changed_keys = BTreeSet::new();
        for resource in config {
            match self.cx.adapter.reload_config(resource).await {
                Ok(keys) => {
                    debug!(
                        container = %self.container,
                        resource = %resource,
                        changed = keys.len(),
                        "Configuration reloaded"
                    );
                    changed_keys.extend(keys);
                }
                Err(e) if e.is_unsupported() => debug!(
                    container = %self.container,
                    resource = %resource,
                    "Configuration reload not available: {}", e
                ),
                Err(e) => warn!(
                    container = %self.container,
                    resource = %resource,
                    "Failed to reload configuration: {}", e
                ),
            }
        }

        let affected: BTreeSet<String> = snapshot
            .iter()
            .filter(|def| !def.placeholders.is_disjoint(&changed_keys))
            .map(|def| def.name.clone())
            .collect();
        self.to_reprocess.extend(affected.iter().cloned());

        match self.cx.config.reparse_policy {
            ReparsePolicy::All => self.cx.assistant.structural_resources(),
            ReparsePolicy::Affected => affected
                .iter()
                .filter_map(|name| self.cx.assistant.resource_of(name))
                .collect(),
        }
    }

    async fn reload_structural(&mut self, resource: &ResourceRef) {
        let declared = match self.cx.adapter.reload_structural(resource).await {
            Ok(declared) => {
                if self.deferred.remove(resource) {
                    self.report.deferred.retain(|r| r != resource);
                }
                declared
            }
            Err(e) => {
                self.defer(resource, e);
                return;
            }
        };

        let previous = self.cx.assistant.names_from(resource);
        let mut current = BTreeSet::new();
        for definition in declared {
            let name = definition.name.clone();
            current.insert(name.clone());

            let existing = self.cx.adapter.get_definition(&name).await.ok();
            if existing.as_ref() == Some(&definition) {
                self.cx.assistant.record_structural(&name, resource.clone());
                continue;
            }
            match self.cx.adapter.register_definition(&name, definition).await {
                Ok(()) => {
                    if existing.is_some() {
                        self.to_reprocess.insert(name.clone());
                    } else {
                        self.report.registered.push(name.clone());
                    }
                    self.cx.assistant.record_structural(name, resource.clone());
                }
                Err(e) => self.fail(&name, FailureStage::Register, &e),
            }
        }

        for name in previous.difference(&current) {
            self.to_reprocess.insert(name.clone());
            self.to_remove.insert(name.clone());
        }
        debug!(
            container = %self.container,
            resource = %resource,
            declared = current.len(),
            "Structural resource re-parsed"
        );
    }

    fn defer(&mut self, resource: &ResourceRef, error: ContainerError) {
        if error.is_unsupported() {
            debug!(
                container = %self.container,
                resource = %resource,
                "Structural reload not available: {}", error
            );
            return;
        }
        warn!(
            container = %self.container,
            resource = %resource,
            "Structural resource not applied, retrying on next reload: {}", error
        );
        let _ = self.cx.events.send(ReloadEvent::ResourceDeferred {
            container: self.container,
            resource: resource.clone(),
            error: error.to_string(),
        });
        if self.deferred.insert(resource.clone()) {
            self.report.deferred.push(resource.clone());
        }
    }

    fn mark_changed_types(
        &mut self,
        types: &BTreeSet<TypeName>,
        snapshot: &[ManagedObjectDefinition],
    ) {
        for type_name in types {
            let bound: BTreeSet<&str> = snapshot
                .iter()
                .filter(|def| &def.type_name == type_name)
                .map(|def| def.name.as_str())
                .collect();

            // A changed factory invalidates everything it produces.
            let products = snapshot.iter().filter(|def| {
                def.factory_type() == Some(type_name)
                    || def.factory_name().is_some_and(|f| bound.contains(f))
            });

            self.to_reprocess
                .extend(bound.iter().map(|name| name.to_string()));
            self.to_reprocess
                .extend(products.map(|def| def.name.clone()));
        }
    }

    async fn register_new(&mut self) {
        for (name, definition) in std::mem::take(&mut self.to_register_as_new) {
            let known = self.cx.adapter.get_definition(&name).await.is_ok();
            match self.cx.adapter.register_definition(&name, definition).await {
                Ok(()) if known => {
                    self.to_reprocess.insert(name);
                }
                Ok(()) => {
                    info!(container = %self.container, name, "Registered new definition");
                    self.report.registered.push(name);
                }
                Err(e) => self.fail(&name, FailureStage::Register, &e),
            }
        }
    }

    async fn destroy_marked(&mut self) {
        self.to_destroy
            .extend(std::mem::take(&mut self.to_reprocess));

        loop {
            self.drain_destroy_queue().await;

            // Products of a destroyed factory would close over a dead object.
            let products: Vec<String> = self
                .definitions()
                .await
                .into_iter()
                .filter(|def| !self.processed.contains(&def.name))
                .filter(|def| {
                    def.factory_name().is_some_and(|f| self.processed.contains(f))
                        || def
                            .factory_type()
                            .is_some_and(|t| self.destroyed_types.contains(t))
                })
                .map(|def| def.name)
                .collect();
            if products.is_empty() {
                break;
            }
            debug!(
                container = %self.container,
                count = products.len(),
                "Destroying products of destroyed factories"
            );
            self.to_destroy.extend(products);
        }
    }

    async fn drain_destroy_queue(&mut self) {
        while let Some(name) = self.to_destroy.pop_front() {
            if !self.processed.insert(name.clone()) {
                continue;
            }

            let dependents = self.cx.adapter.dependent_names(&name).await;
            let type_name = self
                .cx
                .adapter
                .get_definition(&name)
                .await
                .ok()
                .map(|def| def.type_name);

            match self.cx.adapter.destroy(&name).await {
                Ok(()) => {
                    debug!(container = %self.container, name, "Destroyed managed object");
                    let _ = self.cx.events.send(ReloadEvent::ObjectDestroyed {
                        container: self.container,
                        name: name.clone(),
                    });
                    self.report.destroyed.push(name.clone());
                    if let Some(type_name) = type_name {
                        self.destroyed_types.insert(type_name);
                    }
                }
                Err(ContainerError::NotFound(_)) => {
                    trace!(container = %self.container, name, "Already gone");
                }
                Err(e) => self.fail(&name, FailureStage::Destroy, &e),
            }

            self.to_destroy.extend(
                dependents
                    .into_iter()
                    .filter(|dependent| !self.processed.contains(dependent)),
            );
        }
    }

    async fn remove_dropped(&mut self) {
        for name in std::mem::take(&mut self.to_remove) {
            match self.cx.adapter.remove_definition(&name).await {
                Ok(()) => {
                    info!(container = %self.container, name, "Removed definition");
                    self.cx.assistant.forget(&name);
                    self.report.removed.push(name);
                }
                Err(ContainerError::NotFound(_)) => {
                    self.cx.assistant.forget(&name);
                }
                Err(e) => self.fail(&name, FailureStage::Remove, &e),
            }
        }
    }

    async fn finalize(&mut self) {
        match self.cx.adapter.refresh_lifecycle().await {
            Ok(()) => {}
            Err(e) if e.is_unsupported() => debug!(
                container = %self.container,
                "Lifecycle refresh not available: {}", e
            ),
            Err(e) => warn!(container = %self.container, "Lifecycle refresh failed: {}", e),
        }

        for name in self.cx.adapter.list_definition_names().await {
            let singleton = self
                .cx
                .adapter
                .get_definition(&name)
                .await
                .is_ok_and(|def| def.is_singleton());
            if !singleton {
                continue;
            }
            match self.cx.adapter.trigger_get_or_create(&name).await {
                Ok(_) => {
                    if self.report.was_destroyed(&name) {
                        self.report.recreated.push(name);
                    }
                }
                Err(e) => self.fail(&name, FailureStage::Recreate, &e),
            }
        }

        if self.processed.is_empty() && self.report.registered.is_empty() {
            return;
        }
        let mut reloaded = self.processed.clone();
        reloaded.extend(self.report.registered.iter().cloned());
        for refresher in &self.cx.refreshers {
            match refresher.refresh_mappings(self.cx.adapter, &reloaded).await {
                Ok(()) => trace!(
                    container = %self.container,
                    refresher = refresher.name(),
                    "Mappings refreshed"
                ),
                Err(e) if e.is_unsupported() => debug!(
                    container = %self.container,
                    refresher = refresher.name(),
                    "Mapping refresh not available: {}", e
                ),
                Err(e) => warn!(
                    container = %self.container,
                    refresher = refresher.name(),
                    "Mapping refresh failed: {}", e
                ),
            }
        }
    }

    fn fail(&mut self, name: &str, stage: FailureStage, error: &ContainerError) {
        if error.is_unsupported() {
            debug!(container = %self.container, name, %stage, "Not available: {}", error);
            return;
        }
        error!(
            container = %self.container,
            name,
            %stage,
            "Failed to {} managed object: {}", stage, error
        );
        let _ = self.cx.events.send(ReloadEvent::ObjectFailed {
            container: self.container,
            name: name.to_string(),
            error: error.to_string(),
        });
        self.report.failures.push(ObjectFailure {
            name: name.to_string(),
            stage,
            message: error.to_string(),
        });
    }

    fn set_phase(&self, phase: ReloadPhase) {
        publish_phase(self.cx.phase, self.cx.events, self.container, phase);
    }
}
