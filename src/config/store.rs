//! Layered configuration store.
//!
//! Default values are resolved, lowest precedence first, from:
//! hard-coded value → system `config.json` → user `config.json` →
//! environment (`rpc-max-workers` → `RPC_MAX_WORKERS`) → CLI overrides.
//! Values modified at runtime are persisted in the workspace `config.json`
//! and win over the resolved defaults on the next load.
//!
//! Mutations are serialized by one mutex; reads go through an immutable
//! snapshot swapped atomically after each mutation.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::item::{parse_bool, parse_float, parse_int, ConfigItem, Mutability};
use crate::folders::{read_json, write_json, Folders};
use crate::types::api::ConfigItemView;
use crate::types::{Error, Result};

/// Config file name, in each folder scope.
pub const CONFIG_FILE: &str = "config.json";

/// Resolved value of one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigValue {
    pub name: String,
    pub value: String,
    pub default_value: String,
    pub mutability: Mutability,
}

impl ConfigValue {
    pub fn str_val(&self) -> &str {
        &self.value
    }

    pub fn int_val(&self) -> Result<i64> {
        parse_int(&self.name, &self.value)
    }

    pub fn float_val(&self) -> Result<f64> {
        parse_float(&self.name, &self.value)
    }

    pub fn bool_val(&self) -> Result<bool> {
        parse_bool(&self.name, &self.value)
    }

    /// Value read as a number of seconds.
    pub fn secs_val(&self) -> Result<Duration> {
        let secs = self.float_val()?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            Error::config_validation(format!("invalid duration for config item {}: {}", self.name, self.value))
        })
    }

    pub fn is_default(&self) -> bool {
        self.value == self.default_value
    }
}

/// Immutable view of every item value.
#[derive(Debug, Clone, Default)]
pub struct ConfigSnapshot {
    values: BTreeMap<String, ConfigValue>,
}

impl ConfigSnapshot {
    pub fn get(&self, name: &str) -> Result<&ConfigValue> {
        self.values
            .get(name)
            .ok_or_else(|| Error::not_found(format!("unknown config item: {name}")))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConfigValue> {
        self.values.values()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug)]
struct Entry {
    item: ConfigItem,
    default_value: String,
    value: String,
}

impl Entry {
    fn to_value(&self) -> ConfigValue {
        ConfigValue {
            name: self.item.name.clone(),
            value: self.value.clone(),
            default_value: self.default_value.clone(),
            mutability: self.item.mutability,
        }
    }

    fn to_view(&self) -> ConfigItemView {
        ConfigItemView {
            name: self.item.name.clone(),
            description: self.item.description.clone(),
            value: self.value.clone(),
            default_value: self.default_value.clone(),
            validator: self.item.validator.name().to_string(),
        }
    }
}

/// Configuration store shared by the server and its managers.
#[derive(Debug)]
pub struct ConfigStore {
    folders: Folders,
    cli_config: BTreeMap<String, String>,
    entries: Mutex<BTreeMap<String, Entry>>,
    snapshot: ArcSwap<ConfigSnapshot>,
}

impl ConfigStore {
    pub fn new(folders: Folders, cli_config: BTreeMap<String, String>) -> Self {
        Self {
            folders,
            cli_config,
            entries: Mutex::new(BTreeMap::new()),
            snapshot: ArcSwap::from_pointee(ConfigSnapshot::default()),
        }
    }

    /// Register item definitions. Values are only resolved by [`ConfigStore::load`].
    pub fn register(&self, items: Vec<ConfigItem>) -> Result<()> {
        let mut entries = self.entries.lock();
        for item in items {
            item.check_name()?;
            if let Some(existing) = entries.get(&item.name) {
                let msg = if existing.item.mutability != item.mutability {
                    format!("config item {} defined as both static and user one", item.name)
                } else {
                    format!("config item {} registered twice", item.name)
                };
                return Err(Error::validation(msg));
            }
            let hard_coded = item.hard_coded.clone();
            entries.insert(
                item.name.clone(),
                Entry {
                    item,
                    default_value: hard_coded.clone(),
                    value: hard_coded,
                },
            );
        }
        self.publish(&entries);
        Ok(())
    }

    /// Resolve default values through every layer, then apply persisted
    /// user values. An invalid default is fatal; an invalid persisted value
    /// is ignored.
    pub fn load(&self) -> Result<()> {
        let mut entries = self.entries.lock();
        let defaults = self.resolve_defaults(&entries)?;
        let persisted = self.read_scope_file(Some(self.folders.workspace.clone()))?;

        for (name, entry) in entries.iter_mut() {
            let default_value = defaults.get(name).cloned().unwrap_or_else(|| entry.item.hard_coded.clone());
            entry.item.validate(&default_value)?;
            entry.default_value = default_value.clone();
            entry.value = default_value;

            if entry.item.mutability != Mutability::User {
                continue;
            }
            if let Some(current) = persisted.get(name) {
                match entry.item.validate(current) {
                    Ok(()) => entry.value = current.clone(),
                    Err(e) => tracing::warn!(
                        item = %name,
                        "Can't load invalid persisted value {:?}, using default: {}",
                        current,
                        e
                    ),
                }
            }
        }

        for entry in entries.values() {
            tracing::debug!(
                "[{}] {}: {} (default: {})",
                entry.item.mutability,
                entry.item.name,
                entry.value,
                entry.default_value
            );
        }
        self.publish(&entries);
        Ok(())
    }

    fn resolve_defaults(&self, entries: &BTreeMap<String, Entry>) -> Result<BTreeMap<String, String>> {
        let mut defaults: BTreeMap<String, String> = entries
            .iter()
            .map(|(name, entry)| (name.clone(), entry.item.hard_coded.clone()))
            .collect();

        let mut layer = |source: &str, values: BTreeMap<String, String>| {
            for (name, value) in values {
                if value.is_empty() {
                    continue;
                }
                if let Some(slot) = defaults.get_mut(&name) {
                    tracing::trace!(item = %name, "default from {}: {}", source, value);
                    *slot = value;
                }
            }
        };

        layer("system", self.read_scope_file(self.folders.system.clone())?);
        layer("user", self.read_scope_file(self.folders.user.clone())?);
        let env = entries
            .keys()
            .filter_map(|name| std::env::var(env_name(name)).ok().map(|v| (name.clone(), v)))
            .collect();
        layer("environment", env);
        layer("cli", self.cli_config.clone());

        Ok(defaults)
    }

    fn read_scope_file(&self, folder: Option<PathBuf>) -> Result<BTreeMap<String, String>> {
        match folder {
            Some(folder) => Ok(read_json(&folder.join(CONFIG_FILE))?.unwrap_or_default()),
            None => Ok(BTreeMap::new()),
        }
    }

    /// Lock-free snapshot of every value.
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.snapshot.load_full()
    }

    pub fn get(&self, name: &str) -> Result<ConfigValue> {
        self.snapshot.load().get(name).cloned()
    }

    /// Update one user item; the prior value is kept if validation fails.
    pub fn set(&self, name: &str, value: &str) -> Result<ConfigValue> {
        self.set_many(&[(name.to_string(), value.to_string())])?;
        self.get(name)
    }

    /// Update several user items at once: every value is validated before
    /// any is applied.
    pub fn set_many(&self, updates: &[(String, String)]) -> Result<()> {
        let mut entries = self.entries.lock();
        for (name, value) in updates {
            user_entry(&entries, name)?.item.validate(value)?;
        }
        self.commit_locked(&mut entries, updates.to_vec())
    }

    /// Reset user items to their default value.
    pub fn reset(&self, names: &[String]) -> Result<()> {
        let mut entries = self.entries.lock();
        for name in names {
            user_entry(&entries, name)?;
        }
        let defaults = names
            .iter()
            .filter_map(|name| entries.get(name).map(|e| (name.clone(), e.default_value.clone())))
            .collect();
        self.commit_locked(&mut entries, defaults)
    }

    /// Apply validated values, persist them, then publish. A failed write
    /// restores the previous values.
    fn commit_locked(&self, entries: &mut BTreeMap<String, Entry>, values: Vec<(String, String)>) -> Result<()> {
        let mut previous = Vec::with_capacity(values.len());
        for (name, value) in values {
            if let Some(entry) = entries.get_mut(&name) {
                previous.push((name, std::mem::replace(&mut entry.value, value)));
            }
        }
        if let Err(e) = self.persist_locked(entries) {
            for (name, value) in previous.into_iter().rev() {
                if let Some(entry) = entries.get_mut(&name) {
                    entry.value = value;
                }
            }
            return Err(e);
        }
        self.publish(entries);
        Ok(())
    }

    /// Write user values differing from their default to the workspace.
    pub fn persist(&self) -> Result<()> {
        let entries = self.entries.lock();
        self.persist_locked(&entries)
    }

    fn persist_locked(&self, entries: &BTreeMap<String, Entry>) -> Result<()> {
        let modified: BTreeMap<&str, &str> = entries
            .values()
            .filter(|e| e.item.mutability == Mutability::User && e.value != e.default_value)
            .map(|e| (e.item.name.as_str(), e.value.as_str()))
            .collect();
        write_json(&self.folders.workspace.join(CONFIG_FILE), &modified)
    }

    /// Views of the items with the given mutability, sorted by name.
    pub fn views(&self, mutability: Mutability) -> Vec<ConfigItemView> {
        self.entries
            .lock()
            .values()
            .filter(|e| e.item.mutability == mutability)
            .map(Entry::to_view)
            .collect()
    }

    /// Validate a value against a user item without applying it.
    pub fn validate_user(&self, name: &str, value: &str) -> Result<()> {
        let entries = self.entries.lock();
        user_entry(&entries, name)?.item.validate(value)
    }

    fn publish(&self, entries: &BTreeMap<String, Entry>) {
        let values = entries
            .iter()
            .map(|(name, entry)| (name.clone(), entry.to_value()))
            .collect();
        self.snapshot.store(Arc::new(ConfigSnapshot { values }));
    }
}

fn user_entry<'a>(entries: &'a BTreeMap<String, Entry>, name: &str) -> Result<&'a Entry> {
    let entry = entries
        .get(name)
        .ok_or_else(|| Error::not_found(format!("unknown config item: {name}")))?;
    if entry.item.mutability != Mutability::User {
        return Err(Error::validation(format!("config item {name} is static")));
    }
    Ok(entry)
}

/// Environment variable overriding an item.
pub fn env_name(item: &str) -> String {
    item.to_uppercase().replace('-', "_")
}
