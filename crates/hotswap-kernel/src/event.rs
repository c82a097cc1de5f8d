//! Reload lifecycle events

use std::fmt;
use std::time::Duration;

use crate::types::{ContainerId, ResourceRef};

/// State of one container's reload state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReloadPhase {
    #[default]
    Idle,
    Draining,
    Reconciling,
    Finalizing,
}

impl ReloadPhase {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Draining => 1,
            Self::Reconciling => 2,
            Self::Finalizing => 3,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Draining,
            2 => Self::Reconciling,
            3 => Self::Finalizing,
            _ => Self::Idle,
        }
    }
}

impl fmt::Display for ReloadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Draining => "draining",
            Self::Reconciling => "reconciling",
            Self::Finalizing => "finalizing",
        };
        f.write_str(label)
    }
}

/// Broadcast notification about reload progress.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum ReloadEvent {
    /// Reload lock acquired, run begins
    RunStarted {
        container: ContainerId,
        timestamp: u64,
    },
    PhaseChanged {
        container: ContainerId,
        phase: ReloadPhase,
    },
    ObjectDestroyed {
        container: ContainerId,
        name: String,
    },
    /// One object failed; the run continues
    ObjectFailed {
        container: ContainerId,
        name: String,
        error: String,
    },
    /// Structural resource left pending for the next reload
    ResourceDeferred {
        container: ContainerId,
        resource: ResourceRef,
        error: String,
    },
    RunCompleted {
        container: ContainerId,
        reload_count: u64,
        duration: Duration,
    },
    /// Scheduler refused a request because too many were outstanding
    RequestDropped { container: ContainerId },
}

impl ReloadEvent {
    pub fn container(&self) -> ContainerId {
        match self {
            Self::RunStarted { container, .. }
            | Self::PhaseChanged { container, .. }
            | Self::ObjectDestroyed { container, .. }
            | Self::ObjectFailed { container, .. }
            | Self::ResourceDeferred { container, .. }
            | Self::RunCompleted { container, .. }
            | Self::RequestDropped { container } => *container,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_round_trips_through_u8() {
        for phase in [
            ReloadPhase::Idle,
            ReloadPhase::Draining,
            ReloadPhase::Reconciling,
            ReloadPhase::Finalizing,
        ] {
            assert_eq!(ReloadPhase::from_u8(phase.as_u8()), phase);
        }
    }
}
