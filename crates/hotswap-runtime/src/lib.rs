//! HotSwap runtime
//!
//! The moving parts of the reload pipeline:
//!
//! - [`CommandScheduler`]: merges units by [`CommandKey`], debounces, and
//!   executes them on a single worker with per-container backpressure.
//! - [`ReloadCoordinator`]: one per container; drains its ledger and runs
//!   the reload state machine to a fixed point.
//! - [`CoordinatorRegistry`]: container identity to coordinator, with
//!   parent-first ordering.
//! - [`RedefinitionFrontEnd`]: interest-filtered class definition events.
//! - [`ChangeWatcher`]: classified filesystem changes under classpath roots.
//! - [`HotSwapAgent`]: wires everything from a `HotSwapConfig`.

pub mod agent;
pub mod commands;
pub mod coordinator;
pub mod frontend;
pub mod logging;
pub mod registry;
pub mod scheduler;
pub mod watcher;

pub use agent::HotSwapAgent;
pub use commands::{
    ClassFileCommand, FileChangeRouter, ReloadCommand, ResourceCommand, ScanCommand,
    schedule_reload,
};
pub use coordinator::{
    ContainerAssistant, FailureStage, ObjectFailure, ReloadCoordinator, ReloadError, ReloadReport,
};
pub use frontend::{ClassTransformer, Interest, RedefinitionFrontEnd, TransformContext, TransformError};
pub use logging::init_logging;
pub use registry::CoordinatorRegistry;
pub use scheduler::{
    Command, CommandKey, CommandScheduler, MergedCommands, SchedulerError, SubmitOutcome,
};
pub use watcher::{
    ChangeWatcher, FileChange, FileEventKind, ResourceClass, ResourceClassifier, WatchError,
};
