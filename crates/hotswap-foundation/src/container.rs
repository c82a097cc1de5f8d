//! In-memory container
//!
//! A small, framework-neutral dependency-injection container that
//! implements [`ContainerAdapter`]. It backs the agent's own integration
//! tests and serves as the reference for writing adapters against real
//! frameworks.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use hotswap_kernel::{
    CacheResettable, ContainerAdapter, ContainerError, ContainerId, ContainerResult, Instance,
    LoaderId, ManagedObjectDefinition, ResourceRef, TypeName,
};

use crate::resources::{PropertySource, StructuralDocument};

/// Object produced by [`InMemoryContainer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedInstance {
    pub name: String,
    pub type_name: TypeName,
    /// Container-wide construction counter at creation time
    pub generation: u64,
    /// Placeholder values resolved at construction
    pub resolved: BTreeMap<String, String>,
}

/// Reflection-cache stand-in that counts resets.
#[derive(Debug, Default)]
pub struct MetadataCache {
    resets: AtomicU64,
}

impl MetadataCache {
    pub fn resets(&self) -> u64 {
        self.resets.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl CacheResettable for MetadataCache {
    fn name(&self) -> &str {
        "metadata-cache"
    }

    async fn reset_caches(&self) -> ContainerResult<()> {
        self.resets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

type DestroyHook = Box<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct State {
    order: Vec<String>,
    definitions: HashMap<String, ManagedObjectDefinition>,
    singletons: HashMap<String, Arc<ManagedInstance>>,
    properties: HashMap<ResourceRef, PropertySource>,
    staged_config: HashMap<ResourceRef, PropertySource>,
    staged_structural: HashMap<ResourceRef, Result<Vec<ManagedObjectDefinition>, String>>,
    candidates: HashMap<TypeName, ManagedObjectDefinition>,
    failing_destroy: HashSet<String>,
    failing_create: HashSet<String>,
    destroyed: Vec<String>,
}

impl State {
    fn property(&self, key: &str) -> Option<String> {
        self.properties
            .values()
            .find_map(|source| source.get(key).map(str::to_string))
    }

    fn dependents_of(&self, name: &str) -> BTreeSet<String> {
        self.definitions
            .values()
            .filter(|def| def.depends_on.contains(name) || def.factory_name() == Some(name))
            .map(|def| def.name.clone())
            .collect()
    }
}

/// Reference [`ContainerAdapter`] implementation.
pub struct InMemoryContainer {
    id: ContainerId,
    parent: Option<ContainerId>,
    loader: LoaderId,
    state: RwLock<State>,
    generation: AtomicU64,
    lifecycle_refreshes: AtomicU64,
    metadata_cache: Arc<MetadataCache>,
    destroy_hooks: Mutex<Vec<DestroyHook>>,
}

impl InMemoryContainer {
    pub fn new(loader: LoaderId) -> Self {
        Self {
            id: ContainerId::allocate(),
            parent: None,
            loader,
            state: RwLock::new(State::default()),
            generation: AtomicU64::new(0),
            lifecycle_refreshes: AtomicU64::new(0),
            metadata_cache: Arc::new(MetadataCache::default()),
            destroy_hooks: Mutex::new(Vec::new()),
        }
    }

    /// Create a child of `parent` sharing its class-loader context.
    pub fn child_of(parent: &InMemoryContainer) -> Self {
        Self {
            parent: Some(parent.id),
            ..Self::new(parent.loader.clone())
        }
    }

    /// Register a definition during bootstrap.
    pub fn define(&self, definition: ManagedObjectDefinition) {
        let mut state = self.state.write();
        if !state.definitions.contains_key(&definition.name) {
            state.order.push(definition.name.clone());
        }
        state.definitions.insert(definition.name.clone(), definition);
    }

    /// Bind a configuration resource during bootstrap.
    pub fn bind_config(&self, resource: ResourceRef, source: PropertySource) {
        self.state.write().properties.insert(resource, source);
    }

    /// Construct every singleton, as a container refresh would.
    pub fn preinstantiate_singletons(&self) -> ContainerResult<()> {
        let mut state = self.state.write();
        let names: Vec<String> = state.order.clone();
        for name in names {
            let singleton = state
                .definitions
                .get(&name)
                .is_some_and(ManagedObjectDefinition::is_singleton);
            if singleton {
                self.get_or_create(&mut state, &name, &mut HashSet::new())?;
            }
        }
        Ok(())
    }

    /// Content returned by the next `reload_config` of `resource`
    /// instead of reading the file.
    pub fn stage_config(&self, resource: ResourceRef, source: PropertySource) {
        self.state.write().staged_config.insert(resource, source);
    }

    /// Definitions (or a parse failure) returned by the next
    /// `reload_structural` of `resource` instead of reading the file.
    pub fn stage_structural(
        &self,
        resource: ResourceRef,
        parsed: Result<Vec<ManagedObjectDefinition>, String>,
    ) {
        self.state.write().staged_structural.insert(resource, parsed);
    }

    /// Make `scan_candidate` recognise `definition.type_name`.
    pub fn add_scan_candidate(&self, definition: ManagedObjectDefinition) {
        self.state
            .write()
            .candidates
            .insert(definition.type_name.clone(), definition);
    }

    pub fn fail_destroy_of(&self, name: &str) {
        self.state.write().failing_destroy.insert(name.to_string());
    }

    pub fn fail_creation_of(&self, name: &str) {
        self.state.write().failing_create.insert(name.to_string());
    }

    /// Callback run after every successful destruction, outside locks.
    pub fn on_destroy(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        self.destroy_hooks.lock().push(Box::new(hook));
    }

    pub fn instance(&self, name: &str) -> Option<Arc<ManagedInstance>> {
        self.state.read().singletons.get(name).cloned()
    }

    pub fn is_live(&self, name: &str) -> bool {
        self.state.read().singletons.contains_key(name)
    }

    /// Names destroyed so far, in destruction order.
    pub fn destroyed(&self) -> Vec<String> {
        self.state.read().destroyed.clone()
    }

    pub fn lifecycle_refreshes(&self) -> u64 {
        self.lifecycle_refreshes.load(Ordering::Relaxed)
    }

    pub fn metadata_cache(&self) -> Arc<MetadataCache> {
        self.metadata_cache.clone()
    }

    fn get_or_create(
        &self,
        state: &mut State,
        name: &str,
        visiting: &mut HashSet<String>,
    ) -> ContainerResult<Arc<ManagedInstance>> {
        if let Some(live) = state.singletons.get(name) {
            return Ok(live.clone());
        }
        let definition = state
            .definitions
            .get(name)
            .cloned()
            .ok_or_else(|| ContainerError::NotFound(name.to_string()))?;

        // Dependency cycles are resolved by whichever side is reached first.
        if !visiting.insert(name.to_string()) {
            return Err(ContainerError::lifecycle(name, "circular reference"));
        }

        let mut prerequisites: Vec<String> = definition.depends_on.iter().cloned().collect();
        if let Some(factory) = definition.factory_name() {
            prerequisites.push(factory.to_string());
        }
        for dependency in prerequisites {
            if visiting.contains(&dependency) {
                continue;
            }
            self.get_or_create(state, &dependency, visiting)?;
        }
        visiting.remove(name);

        if state.failing_create.contains(name) {
            return Err(ContainerError::lifecycle(name, "constructor threw"));
        }

        let resolved = definition
            .placeholders
            .iter()
            .map(|key| (key.clone(), state.property(key).unwrap_or_default()))
            .collect();

        let instance = Arc::new(ManagedInstance {
            name: name.to_string(),
            type_name: definition.type_name.clone(),
            generation: self.generation.fetch_add(1, Ordering::Relaxed) + 1,
            resolved,
        });
        if definition.is_singleton() {
            state.singletons.insert(name.to_string(), instance.clone());
        }
        debug!(container = %self.id, name, "created managed object");
        Ok(instance)
    }
}

#[async_trait]
impl ContainerAdapter for InMemoryContainer {
    fn id(&self) -> ContainerId {
        self.id
    }

    fn parent(&self) -> Option<ContainerId> {
        self.parent
    }

    fn loader(&self) -> LoaderId {
        self.loader.clone()
    }

    async fn list_definition_names(&self) -> Vec<String> {
        self.state.read().order.clone()
    }

    async fn get_definition(&self, name: &str) -> ContainerResult<ManagedObjectDefinition> {
        self.state
            .read()
            .definitions
            .get(name)
            .cloned()
            .ok_or_else(|| ContainerError::NotFound(name.to_string()))
    }

    async fn get_live_instance(&self, name: &str) -> Option<Instance> {
        self.instance(name).map(|i| i as Instance)
    }

    async fn destroy(&self, name: &str) -> ContainerResult<()> {
        {
            let mut state = self.state.write();
            if state.failing_destroy.contains(name) {
                return Err(ContainerError::lifecycle(name, "destroy callback threw"));
            }
            if state.singletons.remove(name).is_none() {
                return Ok(());
            }
            state.destroyed.push(name.to_string());
        }
        for hook in self.destroy_hooks.lock().iter() {
            hook(name);
        }
        Ok(())
    }

    async fn dependent_names(&self, name: &str) -> BTreeSet<String> {
        self.state.read().dependents_of(name)
    }

    async fn register_definition(
        &self,
        name: &str,
        definition: ManagedObjectDefinition,
    ) -> ContainerResult<()> {
        let mut state = self.state.write();
        if !state.definitions.contains_key(name) {
            state.order.push(name.to_string());
        }
        state.definitions.insert(name.to_string(), definition);
        Ok(())
    }

    async fn remove_definition(&self, name: &str) -> ContainerResult<()> {
        let mut state = self.state.write();
        if state.definitions.remove(name).is_none() {
            return Err(ContainerError::NotFound(name.to_string()));
        }
        state.order.retain(|n| n != name);
        state.singletons.remove(name);
        Ok(())
    }

    async fn trigger_get_or_create(&self, name: &str) -> ContainerResult<Instance> {
        let mut state = self.state.write();
        let instance = self.get_or_create(&mut state, name, &mut HashSet::new())?;
        Ok(instance as Instance)
    }

    async fn reload_config(&self, resource: &ResourceRef) -> ContainerResult<BTreeSet<String>> {
        let staged = self.state.write().staged_config.remove(resource);
        let fresh = match staged {
            Some(source) => source,
            None => PropertySource::load(resource)?,
        };
        let mut state = self.state.write();
        let previous = state.properties.get(resource).cloned().unwrap_or_default();
        let changed = previous.changed_keys(&fresh);
        state.properties.insert(resource.clone(), fresh);
        Ok(changed)
    }

    async fn reload_structural(
        &self,
        resource: &ResourceRef,
    ) -> ContainerResult<Vec<ManagedObjectDefinition>> {
        let staged = self.state.write().staged_structural.remove(resource);
        match staged {
            Some(Ok(definitions)) => Ok(definitions),
            Some(Err(message)) => Err(ContainerError::Parse {
                resource: resource.clone(),
                message,
            }),
            None => StructuralDocument::load(resource),
        }
    }

    async fn scan_candidate(
        &self,
        type_name: &TypeName,
        _bytecode: &[u8],
    ) -> ContainerResult<Option<ManagedObjectDefinition>> {
        Ok(self.state.read().candidates.get(type_name).cloned())
    }

    async fn refresh_lifecycle(&self) -> ContainerResult<()> {
        self.lifecycle_refreshes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn cache_collaborators(&self) -> Vec<Arc<dyn CacheResettable>> {
        vec![self.metadata_cache.clone() as Arc<dyn CacheResettable>]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container() -> InMemoryContainer {
        let c = InMemoryContainer::new(LoaderId::new("app"));
        c.define(ManagedObjectDefinition::scanned("repo", "com.example.Repo"));
        c.define(
            ManagedObjectDefinition::scanned("service", "com.example.Service").with_dependency("repo"),
        );
        c
    }

    #[tokio::test]
    async fn creates_dependencies_first() {
        let c = container();
        c.trigger_get_or_create("service").await.unwrap();
        let repo = c.instance("repo").unwrap();
        let service = c.instance("service").unwrap();
        assert!(repo.generation < service.generation);
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent_for_live_singletons() {
        let c = container();
        c.preinstantiate_singletons().unwrap();
        let before = c.instance("service").unwrap().generation;
        c.trigger_get_or_create("service").await.unwrap();
        assert_eq!(c.instance("service").unwrap().generation, before);
    }

    #[tokio::test]
    async fn destroy_tolerates_absent_objects_and_runs_hooks() {
        let c = container();
        c.preinstantiate_singletons().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        c.on_destroy(move |name| sink.lock().push(name.to_string()));

        c.destroy("repo").await.unwrap();
        c.destroy("repo").await.unwrap();
        assert_eq!(*seen.lock(), vec!["repo".to_string()]);
        assert!(!c.is_live("repo"));
    }

    #[tokio::test]
    async fn dependents_include_factory_products() {
        let c = container();
        c.define(ManagedObjectDefinition::factory_method(
            "client",
            "com.example.Client",
            "repo",
            "com.example.Repo",
            "client",
        ));
        let dependents = c.dependent_names("repo").await;
        assert!(dependents.contains("service"));
        assert!(dependents.contains("client"));
    }

    #[tokio::test]
    async fn reload_config_reports_changed_keys_and_resolves_placeholders() {
        let c = InMemoryContainer::new(LoaderId::new("app"));
        let resource = ResourceRef::new("file:///app.properties");
        c.bind_config(resource.clone(), PropertySource::parse_properties("mail.host=a"));
        c.define(
            ManagedObjectDefinition::scanned("mailer", "com.example.Mailer")
                .with_placeholder("mail.host"),
        );
        c.preinstantiate_singletons().unwrap();
        assert_eq!(c.instance("mailer").unwrap().resolved["mail.host"], "a");

        c.stage_config(resource.clone(), PropertySource::parse_properties("mail.host=b"));
        let changed = c.reload_config(&resource).await.unwrap();
        assert!(changed.contains("mail.host"));

        c.destroy("mailer").await.unwrap();
        c.trigger_get_or_create("mailer").await.unwrap();
        assert_eq!(c.instance("mailer").unwrap().resolved["mail.host"], "b");
    }

    #[tokio::test]
    async fn failing_destroy_surfaces_lifecycle_error() {
        let c = container();
        c.preinstantiate_singletons().unwrap();
        c.fail_destroy_of("repo");
        let err = c.destroy("repo").await.unwrap_err();
        assert!(matches!(err, ContainerError::Lifecycle { .. }));
        assert!(c.is_live("repo"));
    }
}
