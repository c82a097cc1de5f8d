//! Change ledger
//!
//! Per-container record of everything that changed since the last reload.
//! Producers on arbitrary threads append; the reload worker drains.

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::definition::ManagedObjectDefinition;
use crate::types::{ResourceRef, TypeName};

/// One pending change, tagged by what changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    /// Bytecode of a type was redefined
    Type(TypeName),
    /// A property-like resource changed
    Config(ResourceRef),
    /// A structural definition resource changed
    Structural(ResourceRef),
    /// A definition discovered by a live re-scan, not yet registered
    NewDefinition(ManagedObjectDefinition),
}

#[derive(Debug, Default)]
struct LedgerSets {
    types: BTreeSet<TypeName>,
    config: BTreeSet<ResourceRef>,
    structural: BTreeSet<ResourceRef>,
    definitions: BTreeMap<String, ManagedObjectDefinition>,
}

/// Snapshot returned by [`ChangeLedger::drain_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainedChanges {
    pub types: BTreeSet<TypeName>,
    pub config: BTreeSet<ResourceRef>,
    pub structural: BTreeSet<ResourceRef>,
    pub definitions: BTreeMap<String, ManagedObjectDefinition>,
}

impl DrainedChanges {
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
            && self.config.is_empty()
            && self.structural.is_empty()
            && self.definitions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.types.len() + self.config.len() + self.structural.len() + self.definitions.len()
    }

    /// Flatten the snapshot into tagged changes.
    pub fn into_changes(self) -> Vec<ChangeKind> {
        let mut changes = Vec::with_capacity(self.len());
        changes.extend(self.config.into_iter().map(ChangeKind::Config));
        changes.extend(self.structural.into_iter().map(ChangeKind::Structural));
        changes.extend(self.types.into_iter().map(ChangeKind::Type));
        changes.extend(self.definitions.into_values().map(ChangeKind::NewDefinition));
        changes
    }
}

/// Thread-safe, append-only (between drains) set of pending changes.
///
/// All inserts are idempotent on membership. `drain_all` takes the same
/// mutex as the inserts, so a concurrent insert lands either in the
/// returned snapshot or in the next one.
#[derive(Debug, Default)]
pub struct ChangeLedger {
    sets: Mutex<LedgerSets>,
    pending: AtomicUsize,
}

impl ChangeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a change. Returns `false` if it was already pending.
    pub fn add(&self, change: ChangeKind) -> bool {
        let mut sets = self.sets.lock();
        let inserted = match change {
            ChangeKind::Type(t) => sets.types.insert(t),
            ChangeKind::Config(r) => sets.config.insert(r),
            ChangeKind::Structural(r) => sets.structural.insert(r),
            ChangeKind::NewDefinition(d) => {
                if sets.definitions.contains_key(&d.name) {
                    false
                } else {
                    sets.definitions.insert(d.name.clone(), d);
                    true
                }
            }
        };
        if inserted {
            self.pending.fetch_add(1, Ordering::Release);
        }
        inserted
    }

    pub fn add_changed_type(&self, type_name: TypeName) -> bool {
        self.add(ChangeKind::Type(type_name))
    }

    pub fn add_changed_config(&self, resource: ResourceRef) -> bool {
        self.add(ChangeKind::Config(resource))
    }

    pub fn add_changed_structural(&self, resource: ResourceRef) -> bool {
        self.add(ChangeKind::Structural(resource))
    }

    pub fn add_new_definition(&self, definition: ManagedObjectDefinition) -> bool {
        self.add(ChangeKind::NewDefinition(definition))
    }

    /// Fast check across all four sets; never takes the mutex.
    pub fn has_pending_changes(&self) -> bool {
        self.pending.load(Ordering::Acquire) > 0
    }

    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn contains_type(&self, type_name: &TypeName) -> bool {
        self.sets.lock().types.contains(type_name)
    }

    /// Atomically take and clear every set.
    pub fn drain_all(&self) -> DrainedChanges {
        let mut sets = self.sets.lock();
        let taken = std::mem::take(&mut *sets);
        self.pending.store(0, Ordering::Release);
        DrainedChanges {
            types: taken.types,
            config: taken.config,
            structural: taken.structural,
            definitions: taken.definitions,
        }
    }
}
