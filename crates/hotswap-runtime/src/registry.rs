//! Coordinator registry
//!
//! Process-wide map from container identity to its reload coordinator.
//! A coordinator is created on first reference to a container and
//! removed on an explicit container-destroyed notification.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use hotswap_kernel::config::CoordinatorConfig;
use hotswap_kernel::{ContainerAdapter, ContainerId, LoaderId, ReloadEvent};

use crate::coordinator::ReloadCoordinator;

const EVENT_CAPACITY: usize = 256;

/// Registry of [`ReloadCoordinator`]s keyed by [`ContainerId`].
pub struct CoordinatorRegistry {
    coordinators: DashMap<ContainerId, Arc<ReloadCoordinator>>,
    config: CoordinatorConfig,
    events: broadcast::Sender<ReloadEvent>,
}

impl CoordinatorRegistry {
    pub fn new(config: CoordinatorConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            coordinators: DashMap::new(),
            config,
            events,
        }
    }

    /// Coordinator for `adapter`'s container, created on first use.
    pub fn coordinator_for(&self, adapter: Arc<dyn ContainerAdapter>) -> Arc<ReloadCoordinator> {
        let id = adapter.id();
        self.coordinators
            .entry(id)
            .or_insert_with(|| {
                info!(container = %id, parent = ?adapter.parent(), loader = %adapter.loader(), "Registered container");
                Arc::new(ReloadCoordinator::new(
                    adapter,
                    self.config.clone(),
                    self.events.clone(),
                ))
            })
            .clone()
    }

    pub fn get(&self, id: ContainerId) -> Option<Arc<ReloadCoordinator>> {
        self.coordinators.get(&id).map(|entry| entry.value().clone())
    }

    /// Forget a destroyed container.
    pub fn remove(&self, id: ContainerId) -> Option<Arc<ReloadCoordinator>> {
        let removed = self.coordinators.remove(&id).map(|(_, coordinator)| coordinator);
        if removed.is_some() {
            debug!(container = %id, "Unregistered container");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.coordinators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coordinators.is_empty()
    }

    /// Registered ancestors of `id`, nearest first. The walk stops at
    /// the first parent without a coordinator.
    pub fn ancestors(&self, id: ContainerId) -> Vec<ContainerId> {
        let mut ancestors = Vec::new();
        let mut current = self.get(id).and_then(|c| c.parent());
        while let Some(parent) = current {
            if parent == id || ancestors.contains(&parent) {
                break;
            }
            let Some(coordinator) = self.get(parent) else {
                break;
            };
            ancestors.push(parent);
            current = coordinator.parent();
        }
        ancestors
    }

    /// Coordinators of containers in `loader`'s context, parents first.
    pub fn for_loader(&self, loader: &LoaderId) -> Vec<Arc<ReloadCoordinator>> {
        self.sorted(|coordinator| &coordinator.loader() == loader)
    }

    /// Every coordinator, parents first.
    pub fn all(&self) -> Vec<Arc<ReloadCoordinator>> {
        self.sorted(|_| true)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReloadEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &broadcast::Sender<ReloadEvent> {
        &self.events
    }

    /// Order by ancestor-chain length, ties broken by container creation
    /// order. Parents outside the registry end the chain.
    fn sorted(&self, filter: impl Fn(&ReloadCoordinator) -> bool) -> Vec<Arc<ReloadCoordinator>> {
        let snapshot: Vec<Arc<ReloadCoordinator>> = self
            .coordinators
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let parents: HashMap<ContainerId, Option<ContainerId>> =
            snapshot.iter().map(|c| (c.id(), c.parent())).collect();

        let depth = |id: ContainerId| {
            let mut depth = 0usize;
            let mut current = parents.get(&id).copied().flatten();
            while let Some(parent) = current {
                if depth > parents.len() || !parents.contains_key(&parent) {
                    break;
                }
                depth += 1;
                current = parents.get(&parent).copied().flatten();
            }
            depth
        };

        let mut selected: Vec<(usize, Arc<ReloadCoordinator>)> = snapshot
            .into_iter()
            .filter(|c| filter(c))
            .map(|c| (depth(c.id()), c))
            .collect();
        selected.sort_by_key(|(depth, c)| (*depth, c.id()));
        selected.into_iter().map(|(_, c)| c).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hotswap_foundation::InMemoryContainer;

    #[test]
    fn coordinator_is_created_once_per_container() {
        let registry = CoordinatorRegistry::new(CoordinatorConfig::default());
        let container = Arc::new(InMemoryContainer::new(LoaderId::new("app")));

        let first = registry.coordinator_for(container.clone());
        let second = registry.coordinator_for(container.clone());
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);

        assert!(registry.remove(container.id()).is_some());
        assert!(registry.get(container.id()).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn for_loader_orders_parents_first() {
        let registry = CoordinatorRegistry::new(CoordinatorConfig::default());
        let root = Arc::new(InMemoryContainer::new(LoaderId::new("app")));
        let child = Arc::new(InMemoryContainer::child_of(&root));
        let grandchild = Arc::new(InMemoryContainer::child_of(&child));
        let other = Arc::new(InMemoryContainer::new(LoaderId::new("plugin")));

        // Register deepest first so insertion order cannot explain the result.
        registry.coordinator_for(grandchild.clone());
        registry.coordinator_for(child.clone());
        registry.coordinator_for(other.clone());
        registry.coordinator_for(root.clone());

        let ids: Vec<ContainerId> = registry
            .for_loader(&LoaderId::new("app"))
            .iter()
            .map(|c| c.id())
            .collect();
        assert_eq!(ids, vec![root.id(), child.id(), grandchild.id()]);
        assert_eq!(registry.all().len(), 4);
    }

    #[test]
    fn ancestors_are_listed_nearest_first() {
        let registry = CoordinatorRegistry::new(CoordinatorConfig::default());
        let root = Arc::new(InMemoryContainer::new(LoaderId::new("app")));
        let child = Arc::new(InMemoryContainer::child_of(&root));
        let grandchild = Arc::new(InMemoryContainer::child_of(&child));

        registry.coordinator_for(grandchild.clone());
        assert!(registry.ancestors(grandchild.id()).is_empty());

        registry.coordinator_for(child.clone());
        registry.coordinator_for(root.clone());
        assert_eq!(registry.ancestors(grandchild.id()), vec![child.id(), root.id()]);
        assert!(registry.ancestors(root.id()).is_empty());
    }

    #[test]
    fn equal_depth_ties_break_by_creation_order() {
        let registry = CoordinatorRegistry::new(CoordinatorConfig::default());
        let older = Arc::new(InMemoryContainer::new(LoaderId::new("app")));
        let newer = Arc::new(InMemoryContainer::new(LoaderId::new("app")));

        registry.coordinator_for(newer.clone());
        registry.coordinator_for(older.clone());

        let ids: Vec<ContainerId> = registry.all().iter().map(|c| c.id()).collect();
        assert_eq!(ids, vec![older.id(), newer.id()]);
    }
}
