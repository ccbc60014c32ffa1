//! Resource type registry
//!
//! Maps a resource type name to the container image and port used for its
//! workload. Built-in entries can be extended or overridden from a YAML file:
//!
//! ```yaml
//! types:
//!   mongodb:
//!     image: mongo:7
//!     port: 27017
//!     dataPath: /data/db
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeDefinition {
    pub image: String,
    pub port: i32,
    /// Where the data volume is mounted when the resource requests storage
    #[serde(default)]
    pub data_path: Option<String>,
    /// Container environment applied before the resource's own env
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl TypeDefinition {
    pub fn new(image: &str, port: i32, data_path: &str) -> Self {
        Self {
            image: image.to_string(),
            port,
            data_path: Some(data_path.to_string()),
            env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    types: BTreeMap<String, TypeDefinition>,
}

#[derive(Clone, Debug)]
pub struct TypeRegistry {
    types: BTreeMap<String, TypeDefinition>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl TypeRegistry {
    /// postgresql, mariadb and redis
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(
            "postgresql",
            TypeDefinition::new("postgres:16-alpine", 5432, "/var/lib/postgresql/data"),
        );
        registry.register(
            "mariadb",
            TypeDefinition::new("mariadb:11", 3306, "/var/lib/mysql"),
        );
        registry.register("redis", TypeDefinition::new("redis:7-alpine", 6379, "/data"));
        registry
    }

    pub fn empty() -> Self {
        Self {
            types: BTreeMap::new(),
        }
    }

    /// Built-in types, overlaid with the entries of `path` when given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut registry = Self::builtin();
        if let Some(path) = path {
            let contents = std::fs::read_to_string(path).map_err(|e| {
                Error::ConfigError(format!(
                    "failed to read resource types file {}: {e}",
                    path.display()
                ))
            })?;
            let added = registry.extend_from_yaml(&contents)?;
            info!(
                "Loaded {} resource type definition(s) from {}",
                added,
                path.display()
            );
        }
        Ok(registry)
    }

    /// Merge definitions from YAML, returning how many were read
    pub fn extend_from_yaml(&mut self, yaml: &str) -> Result<usize> {
        let file: RegistryFile = serde_yaml::from_str(yaml)?;
        for (name, definition) in &file.types {
            if definition.image.trim().is_empty() {
                return Err(Error::ConfigError(format!(
                    "resource type '{name}' has an empty image"
                )));
            }
            if !(1..=65535).contains(&definition.port) {
                return Err(Error::ConfigError(format!(
                    "resource type '{name}' has invalid port {}",
                    definition.port
                )));
            }
        }
        let count = file.types.len();
        for (name, definition) in file.types {
            self.register(&name, definition);
        }
        Ok(count)
    }

    pub fn register(&mut self, name: &str, definition: TypeDefinition) {
        self.types.insert(name.to_lowercase(), definition);
    }

    pub fn get(&self, name: &str) -> Option<&TypeDefinition> {
        self.types.get(&name.to_lowercase())
    }

    /// Like [`TypeRegistry::get`] but unknown names are an error
    pub fn resolve(&self, name: &str) -> Result<&TypeDefinition> {
        self.get(name)
            .ok_or_else(|| Error::UnsupportedResourceType(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }
}
