//! Managed-object definitions
//!
//! Metadata the container keeps for every object whose lifecycle it owns.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::types::{ResourceRef, TypeName};

/// Lifecycle scope of a managed object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// One shared instance per container
    #[default]
    Singleton,
    /// A new instance per lookup
    Prototype,
    /// Any framework-specific scope (request, session, ...)
    Other(String),
}

/// Where a definition came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Provenance {
    /// Declared in an externalised structural resource
    Structural { resource: ResourceRef },
    /// Discovered by scanning the classpath
    Scanned,
    /// Produced by a factory method on another managed object
    FactoryMethod {
        factory: String,
        factory_type: TypeName,
        method: String,
        /// Structural resource the factory entry was declared in
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resource: Option<ResourceRef>,
    },
}

/// Metadata describing one container-managed object.
///
/// `name` is unique within a container. `type_name` is the
/// implementation type, or the factory method's return type for
/// factory-produced objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedObjectDefinition {
    pub name: String,
    pub type_name: TypeName,
    #[serde(default)]
    pub scope: Scope,
    pub provenance: Provenance,
    /// Names this object declares as dependencies
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    /// Placeholder keys (`${key}`) referenced by this definition
    #[serde(default)]
    pub placeholders: BTreeSet<String>,
}

impl ManagedObjectDefinition {
    /// Definition found by classpath scanning.
    pub fn scanned(name: impl Into<String>, type_name: impl Into<TypeName>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            scope: Scope::Singleton,
            provenance: Provenance::Scanned,
            depends_on: BTreeSet::new(),
            placeholders: BTreeSet::new(),
        }
    }

    /// Definition declared in a structural resource.
    pub fn structural(
        name: impl Into<String>,
        type_name: impl Into<TypeName>,
        resource: ResourceRef,
    ) -> Self {
        Self {
            provenance: Provenance::Structural { resource },
            ..Self::scanned(name, type_name)
        }
    }

    /// Definition produced by `factory.method()`.
    pub fn factory_method(
        name: impl Into<String>,
        return_type: impl Into<TypeName>,
        factory: impl Into<String>,
        factory_type: impl Into<TypeName>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            provenance: Provenance::FactoryMethod {
                factory: factory.into(),
                factory_type: factory_type.into(),
                method: method.into(),
                resource: None,
            },
            ..Self::scanned(name, return_type)
        }
    }

    /// Mark the definition as declared by `resource`. Factory-produced
    /// definitions keep their factory and record the resource alongside.
    pub fn declared_in(mut self, resource: ResourceRef) -> Self {
        match &mut self.provenance {
            Provenance::FactoryMethod { resource: origin, .. } => *origin = Some(resource),
            provenance => *provenance = Provenance::Structural { resource },
        }
        self
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_dependency(mut self, name: impl Into<String>) -> Self {
        self.depends_on.insert(name.into());
        self
    }

    pub fn with_placeholder(mut self, key: impl Into<String>) -> Self {
        self.placeholders.insert(key.into());
        self
    }

    pub fn is_singleton(&self) -> bool {
        self.scope == Scope::Singleton
    }

    /// The factory object name, for factory-produced definitions.
    pub fn factory_name(&self) -> Option<&str> {
        match &self.provenance {
            Provenance::FactoryMethod { factory, .. } => Some(factory),
            _ => None,
        }
    }

    /// The factory type, for factory-produced definitions.
    pub fn factory_type(&self) -> Option<&TypeName> {
        match &self.provenance {
            Provenance::FactoryMethod { factory_type, .. } => Some(factory_type),
            _ => None,
        }
    }

    /// The structural resource this definition was declared in.
    pub fn structural_resource(&self) -> Option<&ResourceRef> {
        match &self.provenance {
            Provenance::Structural { resource } => Some(resource),
            Provenance::FactoryMethod { resource, .. } => resource.as_ref(),
            Provenance::Scanned => None,
        }
    }
}
