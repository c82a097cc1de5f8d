//! Container adapter contract
//!
//! The narrow surface the reload coordinator uses to interrogate and
//! mutate an externally owned dependency-injection container. Every
//! framework integration implements [`ContainerAdapter`]; nothing in the
//! reload pipeline touches framework internals directly.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;

use crate::definition::ManagedObjectDefinition;
use crate::types::{ContainerId, Instance, LoaderId, ResourceRef, TypeName};

/// Errors raised by container adapters.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ContainerError {
    /// No definition registered under this name.
    #[error("Managed object not found: {0}")]
    NotFound(String),

    /// The framework version lacks the field/method this operation needs.
    #[error("Operation not supported by this container: {0}")]
    Unsupported(String),

    /// Construction, injection or destruction of one object failed.
    #[error("Lifecycle failure for '{name}': {message}")]
    Lifecycle { name: String, message: String },

    /// A structural or configuration resource could not be parsed.
    #[error("Failed to parse {resource}: {message}")]
    Parse {
        resource: ResourceRef,
        message: String,
    },

    #[error("Container I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ContainerError {
    pub fn lifecycle(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Lifecycle {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Version-mismatch failures are expected and never fatal.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported(_))
    }
}

pub type ContainerResult<T> = Result<T, ContainerError>;

/// Collaborator holding framework metadata caches that would mask a
/// changed type if left stale.
#[async_trait]
pub trait CacheResettable: Send + Sync {
    /// Short label used in logs.
    fn name(&self) -> &str;

    async fn reset_caches(&self) -> ContainerResult<()>;
}

/// External index keyed by managed-object identity (request routes,
/// handler mappings) that must be rebuilt after a reload.
#[async_trait]
pub trait MappingRefresher: Send + Sync {
    fn name(&self) -> &str;

    /// `reloaded` holds every name destroyed during the run.
    async fn refresh_mappings(
        &self,
        container: &dyn ContainerAdapter,
        reloaded: &BTreeSet<String>,
    ) -> ContainerResult<()>;
}

/// Accessor contract for one dependency-injection container.
#[async_trait]
pub trait ContainerAdapter: Send + Sync {
    /// Identity of the underlying container.
    fn id(&self) -> ContainerId;

    /// Parent container, if this container is part of a hierarchy.
    fn parent(&self) -> Option<ContainerId> {
        None
    }

    /// Class-loader context the container's types are loaded by.
    fn loader(&self) -> LoaderId;

    /// Registered definition names, in registration order.
    async fn list_definition_names(&self) -> Vec<String>;

    /// Fails with [`ContainerError::NotFound`] when absent.
    async fn get_definition(&self, name: &str) -> ContainerResult<ManagedObjectDefinition>;

    /// `None` means not yet constructed, which is not an error.
    async fn get_live_instance(&self, name: &str) -> Option<Instance>;

    /// Destroy the live instance. Tolerates already-destroyed objects.
    async fn destroy(&self, name: &str) -> ContainerResult<()>;

    /// Reverse dependency edges maintained by the container.
    async fn dependent_names(&self, name: &str) -> BTreeSet<String>;

    async fn register_definition(
        &self,
        name: &str,
        definition: ManagedObjectDefinition,
    ) -> ContainerResult<()>;

    async fn remove_definition(&self, name: &str) -> ContainerResult<()>;

    /// Construct and inject if absent, no-op if already live.
    async fn trigger_get_or_create(&self, name: &str) -> ContainerResult<Instance>;

    /// Re-read a property-like resource. Returns the keys whose values
    /// changed, appeared or disappeared.
    async fn reload_config(&self, resource: &ResourceRef) -> ContainerResult<BTreeSet<String>> {
        Err(ContainerError::Unsupported(format!(
            "config reload of {resource}"
        )))
    }

    /// Re-parse a structural resource and return the definitions it now
    /// declares. Registration is left to the caller.
    async fn reload_structural(
        &self,
        resource: &ResourceRef,
    ) -> ContainerResult<Vec<ManagedObjectDefinition>> {
        Err(ContainerError::Unsupported(format!(
            "structural reload of {resource}"
        )))
    }

    /// Inspect freshly compiled bytecode and return a definition if the
    /// type is a managed-object candidate.
    async fn scan_candidate(
        &self,
        _type_name: &TypeName,
        _bytecode: &[u8],
    ) -> ContainerResult<Option<ManagedObjectDefinition>> {
        Ok(None)
    }

    /// Re-run bootstrap lifecycle: factory post-processors, interceptors.
    async fn refresh_lifecycle(&self) -> ContainerResult<()> {
        Ok(())
    }

    /// Metadata caches owned by the framework's post-processors.
    fn cache_collaborators(&self) -> Vec<Arc<dyn CacheResettable>> {
        Vec::new()
    }
}
