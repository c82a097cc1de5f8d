//! Identity and naming primitives shared by every layer.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CONTAINER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one dependency-injection container instance.
///
/// Ids are allocated from a process-wide counter, so comparing two ids
/// also compares container creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerId(u64);

impl ContainerId {
    /// Allocate a fresh id for a newly created container.
    pub fn allocate() -> Self {
        Self(NEXT_CONTAINER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "container#{}", self.0)
    }
}

/// Class-loader context a container and its types belong to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LoaderId(String);

impl LoaderId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LoaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Binary name of a type, e.g. `com.example.UserService`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeName(String);

impl TypeName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Derive the binary name from a class file path relative to its
    /// classpath root (`com/example/Foo.class` -> `com.example.Foo`).
    ///
    /// Returns `None` for paths that do not end in `.class`.
    pub fn from_class_path(relative: &Path) -> Option<Self> {
        if relative.extension().and_then(|e| e.to_str()) != Some("class") {
            return None;
        }
        let stem = relative.with_extension("");
        let parts: Vec<&str> = stem
            .components()
            .filter_map(|c| c.as_os_str().to_str())
            .collect();
        if parts.is_empty() {
            return None;
        }
        Some(Self(parts.join(".")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name without the package prefix.
    pub fn simple_name(&self) -> &str {
        self.0.rsplit('.').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TypeName {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Reference to a configuration or structural resource, keyed by URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceRef(String);

impl ResourceRef {
    const FILE_SCHEME: &'static str = "file://";

    pub fn new(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }

    pub fn from_path(path: &Path) -> Self {
        Self(format!("{}{}", Self::FILE_SCHEME, path.display()))
    }

    pub fn uri(&self) -> &str {
        &self.0
    }

    /// Filesystem path for `file://` URIs.
    pub fn to_path(&self) -> Option<PathBuf> {
        self.0.strip_prefix(Self::FILE_SCHEME).map(PathBuf::from)
    }

    /// Final path segment of the URI.
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceRef {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A live managed object owned by the external container.
pub type Instance = Arc<dyn Any + Send + Sync>;
