//! Layered plugin configuration.
//!
//! Three layers are merged, later ones winning key by key:
//!
//! 1. defaults shipped with the plugin
//! 2. the plugin's global configuration (persisted per plugin)
//! 3. overrides for the active project
//!
//! Merging never mutates a layer; the merged view is computed on first access
//! and cached until the global layer changes.

use kiln_runtime::{Permission, PermissionSet, RuntimeResult};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

use crate::runner::ProjectRootResolver;

pub type ConfigMap = Map<String, Value>;

/// Where the global and project layers come from.
pub trait ConfigStore: Send + Sync {
    fn global(&self, plugin_id: &str) -> RuntimeResult<ConfigMap>;

    /// Project overrides; empty when no project is active.
    fn project(&self, plugin_id: &str) -> RuntimeResult<ConfigMap>;

    fn save_global(&self, plugin_id: &str, config: &ConfigMap) -> RuntimeResult<()>;
}

/// TOML files on disk.
///
/// - global: `<config_dir>/plugins/<plugin_id>.toml`
/// - project: `<project_root>/.kiln/plugins/<plugin_id>.toml`
pub struct FileConfigStore {
    config_dir: PathBuf,
    project_root: Arc<dyn ProjectRootResolver>,
}

impl FileConfigStore {
    pub fn new(config_dir: impl Into<PathBuf>, project_root: Arc<dyn ProjectRootResolver>) -> Self {
        Self {
            config_dir: config_dir.into(),
            project_root,
        }
    }

    pub fn global_path(&self, plugin_id: &str) -> PathBuf {
        self.config_dir
            .join("plugins")
            .join(format!("{}.toml", plugin_id))
    }

    pub fn project_path(&self, plugin_id: &str) -> Option<PathBuf> {
        self.project_root.project_root().map(|root| {
            root.join(".kiln")
                .join("plugins")
                .join(format!("{}.toml", plugin_id))
        })
    }

    fn read_table(path: &Path) -> RuntimeResult<ConfigMap> {
        if !path.exists() {
            return Ok(ConfigMap::new());
        }
        let content = std::fs::read_to_string(path)?;
        let table: toml::Table = toml::from_str(&content)?;
        match serde_json::to_value(table)? {
            Value::Object(map) => Ok(map),
            _ => Ok(ConfigMap::new()),
        }
    }
}

impl ConfigStore for FileConfigStore {
    fn global(&self, plugin_id: &str) -> RuntimeResult<ConfigMap> {
        Self::read_table(&self.global_path(plugin_id))
    }

    fn project(&self, plugin_id: &str) -> RuntimeResult<ConfigMap> {
        match self.project_path(plugin_id) {
            Some(path) => Self::read_table(&path),
            None => Ok(ConfigMap::new()),
        }
    }

    fn save_global(&self, plugin_id: &str, config: &ConfigMap) -> RuntimeResult<()> {
        let path = self.global_path(plugin_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(config)?;
        std::fs::write(&path, content)?;
        debug!(plugin = %plugin_id, path = %path.display(), "Saved plugin config");
        Ok(())
    }
}

/// In-memory layers, for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    global: RwLock<HashMap<String, ConfigMap>>,
    project: RwLock<HashMap<String, ConfigMap>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_global(self, plugin_id: &str, config: ConfigMap) -> Self {
        self.global
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(plugin_id.to_string(), config);
        self
    }

    pub fn with_project(self, plugin_id: &str, config: ConfigMap) -> Self {
        self.project
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(plugin_id.to_string(), config);
        self
    }
}

impl ConfigStore for MemoryConfigStore {
    fn global(&self, plugin_id: &str) -> RuntimeResult<ConfigMap> {
        Ok(self
            .global
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(plugin_id)
            .cloned()
            .unwrap_or_default())
    }

    fn project(&self, plugin_id: &str) -> RuntimeResult<ConfigMap> {
        Ok(self
            .project
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(plugin_id)
            .cloned()
            .unwrap_or_default())
    }

    fn save_global(&self, plugin_id: &str, config: &ConfigMap) -> RuntimeResult<()> {
        self.global
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(plugin_id.to_string(), config.clone());
        Ok(())
    }
}

/// Recursively merge `overlay` into `base`. Nested tables merge; any other
/// value replaces.
pub fn deep_merge(base: &mut ConfigMap, overlay: &ConfigMap) {
    for (key, value) in overlay {
        match (base.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_merge(existing, incoming);
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

fn lookup<'a>(map: &'a ConfigMap, key: &str) -> Option<&'a Value> {
    let mut parts = key.split('.');
    let mut current = map.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn insert_path(map: &mut ConfigMap, key: &str, value: Value) {
    match key.split_once('.') {
        None => {
            map.insert(key.to_string(), value);
        }
        Some((head, rest)) => {
            let child = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(ConfigMap::new()));
            if !child.is_object() {
                *child = Value::Object(ConfigMap::new());
            }
            if let Value::Object(child) = child {
                insert_path(child, rest, value);
            }
        }
    }
}

/// Merged configuration view for one plugin.
pub struct ConfigProxy {
    plugin_id: String,
    permissions: PermissionSet,
    defaults: ConfigMap,
    store: Arc<dyn ConfigStore>,
    merged: RwLock<MergeCache>,
}

/// Cached merge plus the reload generation it belongs to.
#[derive(Default)]
struct MergeCache {
    generation: u64,
    merged: Option<Arc<ConfigMap>>,
}

impl ConfigProxy {
    pub fn new(
        plugin_id: impl Into<String>,
        permissions: PermissionSet,
        defaults: ConfigMap,
        store: Arc<dyn ConfigStore>,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            permissions,
            defaults,
            store,
            merged: RwLock::new(MergeCache::default()),
        }
    }

    fn layer(&self, name: &str, loaded: RuntimeResult<ConfigMap>) -> ConfigMap {
        loaded.unwrap_or_else(|e| {
            warn!(plugin = %self.plugin_id, layer = name, "Ignoring unreadable config layer: {}", e);
            ConfigMap::new()
        })
    }

    fn merged(&self) -> Arc<ConfigMap> {
        let generation = {
            let cache = self.merged.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(merged) = &cache.merged {
                return Arc::clone(merged);
            }
            cache.generation
        };

        let mut merged = self.defaults.clone();
        deep_merge(&mut merged, &self.layer("global", self.store.global(&self.plugin_id)));
        deep_merge(&mut merged, &self.layer("project", self.store.project(&self.plugin_id)));
        let merged = Arc::new(merged);

        // A reload during the merge invalidates what was just read.
        let mut cache = self.merged.write().unwrap_or_else(PoisonError::into_inner);
        if cache.generation == generation {
            cache.merged = Some(Arc::clone(&merged));
        } else {
            debug!(plugin = %self.plugin_id, "Config reloaded during merge; not caching");
        }
        merged
    }

    /// Look up a dot-separated key such as `"lint.rules.max_line"`.
    pub fn get(&self, key: &str) -> Option<Value> {
        lookup(&self.merged(), key).cloned()
    }

    /// Look up and deserialize a key. `Ok(None)` when the key is absent.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> RuntimeResult<Option<T>> {
        match self.get(key) {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// The full merged configuration.
    pub fn all(&self) -> Value {
        Value::Object(self.merged().as_ref().clone())
    }

    /// Persist `value` under `key` in the global layer.
    ///
    /// Requires `write_config`. Defaults and project overrides are untouched.
    pub fn set_global(&self, key: &str, value: Value) -> RuntimeResult<()> {
        self.permissions
            .require(&self.plugin_id, Permission::WriteConfig)?;

        let mut global = self.store.global(&self.plugin_id)?;
        insert_path(&mut global, key, value);
        self.store.save_global(&self.plugin_id, &global)?;
        self.reload();

        info!(plugin = %self.plugin_id, key = %key, "Updated global plugin config");
        Ok(())
    }

    /// Drop the cached merge so the next read sees the stores again.
    pub fn reload(&self) {
        let mut cache = self.merged.write().unwrap_or_else(PoisonError::into_inner);
        cache.generation += 1;
        cache.merged = None;
    }
}
