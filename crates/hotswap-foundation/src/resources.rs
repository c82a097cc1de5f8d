//! Resource readers
//!
//! Property-like resources are flattened into dotted keys; structural
//! resources declare managed-object definitions in TOML, YAML or JSON.

use config::FileFormat;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use hotswap_kernel::config::{detect_format, from_str};
use hotswap_kernel::{ContainerError, ContainerResult, ManagedObjectDefinition, ResourceRef, Scope};

/// Flattened key/value view of one configuration resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertySource {
    values: BTreeMap<String, String>,
}

impl PropertySource {
    pub fn new(values: BTreeMap<String, String>) -> Self {
        Self { values }
    }

    /// Read the file behind a `file://` resource.
    pub fn load(resource: &ResourceRef) -> ContainerResult<Self> {
        let path = resource_path(resource)?;
        let content = std::fs::read_to_string(&path)?;
        Self::parse(resource, &path, &content)
    }

    pub fn parse(resource: &ResourceRef, path: &Path, content: &str) -> ContainerResult<Self> {
        if path.extension().and_then(|e| e.to_str()) == Some("properties") {
            return Ok(Self::parse_properties(content));
        }

        let format = format_of(resource, path)?;
        let value: serde_json::Value = from_str(content, format).map_err(|e| ContainerError::Parse {
            resource: resource.clone(),
            message: e.to_string(),
        })?;
        let mut values = BTreeMap::new();
        flatten("", &value, &mut values);
        Ok(Self { values })
    }

    /// `key=value` / `key: value` lines; `#` and `!` start comments.
    pub fn parse_properties(content: &str) -> Self {
        let values = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('!'))
            .filter_map(|line| {
                let split = line.find(['=', ':'])?;
                let (key, value) = line.split_at(split);
                Some((key.trim().to_string(), value[1..].trim().to_string()))
            })
            .collect();
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    /// Keys that differ between `self` (old) and `other` (new).
    pub fn changed_keys(&self, other: &PropertySource) -> BTreeSet<String> {
        let mut keys: BTreeSet<String> = BTreeSet::new();
        for (key, value) in &self.values {
            if other.values.get(key) != Some(value) {
                keys.insert(key.clone());
            }
        }
        for key in other.values.keys() {
            if !self.values.contains_key(key) {
                keys.insert(key.clone());
            }
        }
        keys
    }
}

fn flatten(prefix: &str, value: &serde_json::Value, out: &mut BTreeMap<String, String>) {
    let join = |key: &str| {
        if prefix.is_empty() {
            key.to_string()
        } else {
            format!("{prefix}.{key}")
        }
    };
    match value {
        serde_json::Value::Object(map) => {
            for (key, nested) in map {
                flatten(&join(key), nested, out);
            }
        }
        serde_json::Value::Array(items) => {
            for (i, nested) in items.iter().enumerate() {
                flatten(&format!("{prefix}[{i}]"), nested, out);
            }
        }
        serde_json::Value::String(s) => {
            out.insert(prefix.to_string(), s.clone());
        }
        serde_json::Value::Null => {
            out.insert(prefix.to_string(), String::new());
        }
        other => {
            out.insert(prefix.to_string(), other.to_string());
        }
    }
}

/// Factory reference inside a structural document.
#[derive(Debug, Clone, Deserialize)]
struct FactoryEntry {
    bean: String,
    #[serde(rename = "type")]
    type_name: String,
    method: String,
}

#[derive(Debug, Clone, Deserialize)]
struct DefinitionEntry {
    name: String,
    #[serde(rename = "type")]
    type_name: String,
    #[serde(default)]
    scope: Scope,
    #[serde(default)]
    depends_on: BTreeSet<String>,
    #[serde(default)]
    placeholders: BTreeSet<String>,
    #[serde(default)]
    factory: Option<FactoryEntry>,
}

/// Externalised definitions file.
///
/// ```toml
/// [[definitions]]
/// name = "mailer"
/// type = "com.example.Mailer"
/// depends_on = ["userService"]
/// placeholders = ["mail.host"]
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct StructuralDocument {
    #[serde(default)]
    definitions: Vec<DefinitionEntry>,
}

impl StructuralDocument {
    pub fn load(resource: &ResourceRef) -> ContainerResult<Vec<ManagedObjectDefinition>> {
        let path = resource_path(resource)?;
        let content = std::fs::read_to_string(&path)?;
        Self::parse(resource, &path, &content)
    }

    pub fn parse(
        resource: &ResourceRef,
        path: &Path,
        content: &str,
    ) -> ContainerResult<Vec<ManagedObjectDefinition>> {
        let format = format_of(resource, path)?;
        let document: StructuralDocument =
            from_str(content, format).map_err(|e| ContainerError::Parse {
                resource: resource.clone(),
                message: e.to_string(),
            })?;
        Ok(document.into_definitions(resource))
    }

    fn into_definitions(self, resource: &ResourceRef) -> Vec<ManagedObjectDefinition> {
        self.definitions
            .into_iter()
            .map(|entry| {
                let mut def = match entry.factory {
                    Some(factory) => ManagedObjectDefinition::factory_method(
                        entry.name,
                        entry.type_name.as_str(),
                        factory.bean,
                        factory.type_name.as_str(),
                        factory.method,
                    )
                    .declared_in(resource.clone()),
                    None => ManagedObjectDefinition::structural(
                        entry.name,
                        entry.type_name.as_str(),
                        resource.clone(),
                    ),
                };
                def.scope = entry.scope;
                def.depends_on = entry.depends_on;
                def.placeholders = entry.placeholders;
                def
            })
            .collect()
    }
}

fn resource_path(resource: &ResourceRef) -> ContainerResult<std::path::PathBuf> {
    resource
        .to_path()
        .ok_or_else(|| ContainerError::Unsupported(format!("non-file resource {resource}")))
}

fn format_of(resource: &ResourceRef, path: &Path) -> ContainerResult<FileFormat> {
    let path = path.to_string_lossy();
    detect_format(&path).map_err(|e| ContainerError::Parse {
        resource: resource.clone(),
        message: e.to_string(),
    })
}
