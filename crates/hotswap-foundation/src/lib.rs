//! HotSwap foundation
//!
//! Concrete implementations of kernel contracts: a reference in-memory
//! container and the resource readers it re-parses on change.

pub mod container;
pub mod resources;

pub use container::{InMemoryContainer, ManagedInstance, MetadataCache};
pub use resources::{PropertySource, StructuralDocument};
