//! Per-container state that outlives a single reload run

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use hotswap_kernel::ResourceRef;

/// Reload counters, the in-progress flag and the name to structural
/// resource map for one container.
#[derive(Debug, Default)]
pub struct ContainerAssistant {
    reload_count: AtomicU64,
    last_reload_timestamp: AtomicU64,
    last_duration: Mutex<Option<Duration>>,
    in_progress: AtomicBool,
    structural_origin: RwLock<HashMap<String, ResourceRef>>,
}

impl ContainerAssistant {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reload_count(&self) -> u64 {
        self.reload_count.load(Ordering::Acquire)
    }

    /// Timestamp passed to the most recent completed reload, 0 if none.
    pub fn last_reload_timestamp(&self) -> u64 {
        self.last_reload_timestamp.load(Ordering::Acquire)
    }

    pub fn last_duration(&self) -> Option<Duration> {
        *self.last_duration.lock()
    }

    /// True while a run is executing. Dependency-resolution code uses
    /// this to tolerate objects that were destroyed and are not yet
    /// recreated.
    pub fn is_reload_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Mark a run as started; the flag clears when the guard drops.
    pub(crate) fn begin_reload(&self) -> InProgressGuard<'_> {
        self.in_progress.store(true, Ordering::Release);
        InProgressGuard { assistant: self }
    }

    pub(crate) fn record_completed(&self, timestamp: u64, duration: Duration) -> u64 {
        self.last_reload_timestamp.store(timestamp, Ordering::Release);
        *self.last_duration.lock() = Some(duration);
        self.reload_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Remember that `name` was declared by `resource`.
    pub fn record_structural(&self, name: impl Into<String>, resource: ResourceRef) {
        self.structural_origin.write().insert(name.into(), resource);
    }

    pub fn forget(&self, name: &str) -> Option<ResourceRef> {
        self.structural_origin.write().remove(name)
    }

    pub fn resource_of(&self, name: &str) -> Option<ResourceRef> {
        self.structural_origin.read().get(name).cloned()
    }

    /// Names last seen declared by `resource`.
    pub fn names_from(&self, resource: &ResourceRef) -> BTreeSet<String> {
        self.structural_origin
            .read()
            .iter()
            .filter(|(_, origin)| *origin == resource)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Number of names with a known structural origin.
    pub fn structural_names(&self) -> usize {
        self.structural_origin.read().len()
    }

    /// Every structural resource the container was built from.
    pub fn structural_resources(&self) -> BTreeSet<ResourceRef> {
        self.structural_origin.read().values().cloned().collect()
    }
}

pub(crate) struct InProgressGuard<'a> {
    assistant: &'a ContainerAssistant,
}

impl Drop for InProgressGuard<'_> {
    fn drop(&mut self) {
        self.assistant.in_progress.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_progress_flag_follows_guard() {
        let assistant = ContainerAssistant::new();
        assert!(!assistant.is_reload_in_progress());
        {
            let _guard = assistant.begin_reload();
            assert!(assistant.is_reload_in_progress());
        }
        assert!(!assistant.is_reload_in_progress());
    }

    #[test]
    fn record_completed_bumps_counter() {
        let assistant = ContainerAssistant::new();
        assert_eq!(assistant.record_completed(42, Duration::from_millis(5)), 1);
        assert_eq!(assistant.record_completed(43, Duration::from_millis(7)), 2);
        assert_eq!(assistant.reload_count(), 2);
        assert_eq!(assistant.last_reload_timestamp(), 43);
        assert_eq!(assistant.last_duration(), Some(Duration::from_millis(7)));
    }

    #[test]
    fn structural_origin_lookup() {
        let assistant = ContainerAssistant::new();
        let beans = ResourceRef::new("file:///beans.toml");
        let other = ResourceRef::new("file:///other.beans.toml");
        assistant.record_structural("mailer", beans.clone());
        assistant.record_structural("dataSource", beans.clone());
        assistant.record_structural("cache", other.clone());

        assert_eq!(assistant.resource_of("mailer"), Some(beans.clone()));
        assert_eq!(assistant.names_from(&beans).len(), 2);
        assert_eq!(assistant.structural_resources().len(), 2);
        assert_eq!(assistant.structural_names(), 3);

        assert_eq!(assistant.forget("cache"), Some(other.clone()));
        assert!(assistant.names_from(&other).is_empty());
    }
}
