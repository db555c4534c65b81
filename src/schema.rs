//! Schema registry.
//!
//! Schemas are opaque JSON Schema documents the pipeline forwards to
//! providers. The registry scans the schema directory once at startup and
//! produces an immutable name-to-descriptor map; unknown names fail fast
//! at command time rather than mid-run.
//!
//! A schema file is either a bare JSON Schema (named after the file stem)
//! or a wrapper object `{"name": ..., "schema": {...}}` when the stable
//! name differs from the filename.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::error::{Result, SchemaError};
use crate::io;

/// A named structured-output specification.
#[derive(Debug, Clone)]
pub struct SchemaDescriptor {
    /// Stable name, unique within a run.
    pub name: String,
    /// The JSON Schema forwarded to providers. Opaque to the pipeline.
    pub root: Value,
    /// File the schema was loaded from.
    pub path: PathBuf,
}

/// Immutable mapping from schema name to descriptor.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: BTreeMap<String, SchemaDescriptor>,
}

impl SchemaRegistry {
    /// Scans `dir` for `*.json` schema files.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::DirectoryMissing`] when `dir` does not
    /// exist, [`SchemaError::Invalid`] for unparseable files, and
    /// [`SchemaError::Duplicate`] when two files declare the same name.
    pub fn load(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(SchemaError::DirectoryMissing {
                path: dir.to_string_lossy().to_string(),
            }
            .into());
        }

        let mut schemas: BTreeMap<String, SchemaDescriptor> = BTreeMap::new();
        let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(|e| SchemaError::Invalid {
                path: dir.to_string_lossy().to_string(),
                reason: e.to_string(),
            })?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.is_file() && path.extension().is_some_and(|ext| ext == "json")
            })
            .collect();
        entries.sort();

        for path in entries {
            let descriptor = load_descriptor(&path)?;
            if let Some(existing) = schemas.get(&descriptor.name) {
                return Err(SchemaError::Duplicate {
                    name: descriptor.name.clone(),
                    first: existing.path.to_string_lossy().to_string(),
                    second: path.to_string_lossy().to_string(),
                }
                .into());
            }
            debug!(name = %descriptor.name, path = %path.display(), "schema registered");
            schemas.insert(descriptor.name.clone(), descriptor);
        }

        Ok(Self { schemas })
    }

    /// Looks a schema up by name.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::Unknown`] listing the available names.
    pub fn get(&self, name: &str) -> Result<&SchemaDescriptor> {
        self.schemas.get(name).ok_or_else(|| {
            SchemaError::Unknown {
                name: name.to_string(),
                available: self.names().join(", "),
            }
            .into()
        })
    }

    /// All registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.schemas.keys().map(String::as_str).collect()
    }

    /// Number of registered schemas.
    #[must_use]
    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

fn load_descriptor(path: &Path) -> Result<SchemaDescriptor> {
    let raw = io::read_file(path)?;
    let value: Value = serde_json::from_str(&raw).map_err(|e| SchemaError::Invalid {
        path: path.to_string_lossy().to_string(),
        reason: e.to_string(),
    })?;

    let Some(object) = value.as_object() else {
        return Err(SchemaError::Invalid {
            path: path.to_string_lossy().to_string(),
            reason: "top level must be an object".to_string(),
        }
        .into());
    };

    let stem = path
        .file_stem()
        .map_or_else(String::new, |s| s.to_string_lossy().to_string());

    // Wrapper form: {"name": ..., "schema": {...}}
    let (name, root) = match (object.get("name").and_then(Value::as_str), object.get("schema")) {
        (Some(name), Some(schema)) if schema.is_object() => {
            (name.to_string(), schema.clone())
        }
        _ => (stem, value.clone()),
    };

    if name.trim().is_empty() {
        return Err(SchemaError::Invalid {
            path: path.to_string_lossy().to_string(),
            reason: "schema name is empty".to_string(),
        }
        .into());
    }

    Ok(SchemaDescriptor {
        name,
        root,
        path: path.to_path_buf(),
    })
}
