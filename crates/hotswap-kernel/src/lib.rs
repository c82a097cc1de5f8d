//! HotSwap kernel
//!
//! Data model and contracts for the change-detection-to-reload pipeline:
//! the per-container [`ChangeLedger`], managed-object definitions, the
//! [`ContainerAdapter`] boundary to the external dependency-injection
//! container, reload events and configuration.

pub mod config;
pub mod container;
pub mod definition;
pub mod error;
pub mod event;
pub mod ledger;
pub mod types;

pub use container::{
    CacheResettable, ContainerAdapter, ContainerError, ContainerResult, MappingRefresher,
};
pub use definition::{ManagedObjectDefinition, Provenance, Scope};
pub use error::{HotSwapError, HotSwapResult, IntoHotSwapReport};
pub use event::{ReloadEvent, ReloadPhase};
pub use ledger::{ChangeKind, ChangeLedger, DrainedChanges};
pub use types::{ContainerId, Instance, LoaderId, ResourceRef, TypeName};
