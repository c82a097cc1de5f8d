use std::fmt;
use std::time::Duration;

use hotswap_kernel::{ContainerId, ResourceRef};

/// Step of a run in which one object failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    Destroy,
    Recreate,
    Register,
    Remove,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Destroy => "destroy",
            Self::Recreate => "recreate",
            Self::Register => "register",
            Self::Remove => "remove",
        };
        f.write_str(label)
    }
}

/// One per-object failure. The run continued past it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectFailure {
    pub name: String,
    pub stage: FailureStage,
    pub message: String,
}

/// Outcome of one reload run.
#[derive(Debug, Clone)]
pub struct ReloadReport {
    pub container: ContainerId,
    pub timestamp: u64,
    /// Fixed-point passes executed
    pub passes: u32,
    /// Names destroyed, in destruction order
    pub destroyed: Vec<String>,
    /// Destroyed names live again after finalizing
    pub recreated: Vec<String>,
    /// Definitions registered for the first time
    pub registered: Vec<String>,
    /// Definitions removed because their structural resource dropped them
    pub removed: Vec<String>,
    pub failures: Vec<ObjectFailure>,
    /// Structural resources left pending for the next reload
    pub deferred: Vec<ResourceRef>,
    pub duration: Duration,
}

impl ReloadReport {
    pub fn new(container: ContainerId, timestamp: u64) -> Self {
        Self {
            container,
            timestamp,
            passes: 0,
            destroyed: Vec::new(),
            recreated: Vec::new(),
            registered: Vec::new(),
            removed: Vec::new(),
            failures: Vec::new(),
            deferred: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    pub fn was_destroyed(&self, name: &str) -> bool {
        self.destroyed.iter().any(|n| n == name)
    }

    pub fn failure_of(&self, name: &str) -> Option<&ObjectFailure> {
        self.failures.iter().find(|f| f.name == name)
    }

    /// No object failed and no resource was deferred.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.deferred.is_empty()
    }
}
