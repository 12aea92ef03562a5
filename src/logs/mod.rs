//! `log` service: runtime logger levels.
//!
//! A logger is a `tracing` target (`rpcmux::server`, `myapp`...); the empty
//! name is the root logger. Settings come from `loggers.json` in the system,
//! user and workspace folders (later scopes win), mapping a logger to a
//! level (`"debug"`) or to `false` to disable it. Runtime updates are
//! persisted in the workspace file and applied as `EnvFilter` directives.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::folders::{read_json, write_json, Folders, Scope};
use crate::manager::{LifecycleHooks, ManagerContext};
use crate::observability;
use crate::server::dispatch::{MethodTable, ServiceHandler};
use crate::types::api::{Filter, LoggerConfig, LoggerLevel, LoggerStatus, LoggerUpdate};
use crate::types::{Error, Result};

/// Logger settings file name, in each folder scope.
pub const LOGGERS_FILE: &str = "loggers.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
enum LoggerSetting {
    Enabled(bool),
    Level(String),
}

type Settings = BTreeMap<String, LoggerSetting>;

#[derive(Debug, Default)]
struct Layers {
    /// System then user settings.
    inherited: Settings,
    workspace: Settings,
}

impl Layers {
    fn merged(&self) -> Settings {
        let mut merged = self.inherited.clone();
        merged.extend(self.workspace.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }
}

#[derive(Debug)]
pub struct LogsManager {
    folders: Folders,
    layers: Mutex<Layers>,
}

impl LogsManager {
    pub fn new(folders: Folders) -> Self {
        Self {
            folders,
            layers: Mutex::new(Layers::default()),
        }
    }

    fn reload_layers(&self) -> Result<()> {
        let mut layers = Layers::default();
        for (scope, folder) in self.folders.scopes() {
            let settings: Settings = read_json(&folder.join(LOGGERS_FILE))?.unwrap_or_default();
            if scope == Scope::Workspace {
                layers.workspace = settings;
            } else {
                layers.inherited.extend(settings);
            }
        }
        let mut current = self.layers.lock();
        *current = layers;
        self.apply(&current)
    }

    fn apply(&self, layers: &Layers) -> Result<()> {
        let directives = directives(&layers.merged());
        if observability::reload_filter(&directives)? {
            tracing::debug!("Log filter: {}", directives);
        }
        Ok(())
    }

    /// Persist the new workspace layer, then swap it in and apply it.
    fn commit(&self, layers: &mut Layers, workspace: Settings) -> Result<()> {
        write_json(&self.folders.workspace.join(LOGGERS_FILE), &workspace)?;
        layers.workspace = workspace;
        self.apply(layers)
    }

    fn status(&self, names: &[String]) -> LoggerStatus {
        let merged = self.layers.lock().merged();
        let items = if names.is_empty() {
            let mut all: Vec<&str> = merged.keys().map(String::as_str).collect();
            if !merged.contains_key("") {
                all.insert(0, "");
            }
            all.into_iter().map(|n| config_of(n, merged.get(n))).collect()
        } else {
            names.iter().map(|n| config_of(n, merged.get(n))).collect()
        };
        LoggerStatus { items }
    }

    fn get(&self, filter: Filter) -> Result<LoggerStatus> {
        for name in &filter.names {
            check_logger_name(name)?;
        }
        Ok(self.status(&filter.names))
    }

    fn set(&self, update: LoggerUpdate) -> Result<LoggerStatus> {
        if update.items.is_empty() {
            return Err(Error::validation("empty logger list"));
        }
        for item in &update.items {
            check_logger_name(&item.name)?;
        }
        {
            let mut layers = self.layers.lock();
            let mut workspace = layers.workspace.clone();
            for item in &update.items {
                let setting = match (item.enabled, item.level.directive()) {
                    (false, _) => LoggerSetting::Enabled(false),
                    (true, Some(level)) => LoggerSetting::Level(level.to_string()),
                    (true, None) => LoggerSetting::Enabled(true),
                };
                workspace.insert(item.name.clone(), setting);
            }
            self.commit(&mut layers, workspace)?;
        }
        let names: Vec<String> = update.items.into_iter().map(|i| i.name).collect();
        tracing::info!("Loggers updated: {:?}", names);
        Ok(self.status(&names))
    }

    fn reset(&self, filter: Filter) -> Result<LoggerStatus> {
        if filter.names.is_empty() {
            return Err(Error::validation("empty logger list"));
        }
        for name in &filter.names {
            check_logger_name(name)?;
        }
        {
            let mut layers = self.layers.lock();
            let mut workspace = layers.workspace.clone();
            for name in &filter.names {
                workspace.remove(name);
            }
            self.commit(&mut layers, workspace)?;
        }
        tracing::info!("Loggers reset: {:?}", filter.names);
        Ok(self.status(&filter.names))
    }
}

fn check_logger_name(name: &str) -> Result<()> {
    if name.chars().any(|c| c.is_whitespace() || c == ',' || c == '=') {
        return Err(Error::validation(format!("invalid logger name: {name:?}")));
    }
    Ok(())
}

fn config_of(name: &str, setting: Option<&LoggerSetting>) -> LoggerConfig {
    let (enabled, level) = match setting {
        Some(LoggerSetting::Enabled(enabled)) => (*enabled, LoggerLevel::Unknown),
        Some(LoggerSetting::Level(level)) => (true, LoggerLevel::parse(level).unwrap_or_default()),
        None if name.is_empty() => (
            true,
            LoggerLevel::parse(observability::default_directive()).unwrap_or_default(),
        ),
        None => (true, LoggerLevel::Unknown),
    };
    LoggerConfig {
        name: name.to_string(),
        enabled,
        level,
    }
}

/// `EnvFilter` directives: the root level first, then one per configured
/// logger.
fn directives(settings: &Settings) -> String {
    let root = match settings.get("") {
        Some(LoggerSetting::Enabled(false)) => "off".to_string(),
        Some(LoggerSetting::Level(level)) => level.to_lowercase(),
        _ => observability::default_directive().to_string(),
    };
    let mut out = vec![root];
    for (name, setting) in settings.iter().filter(|(name, _)| !name.is_empty()) {
        match setting {
            LoggerSetting::Enabled(false) => out.push(format!("{name}=off")),
            LoggerSetting::Level(level) => out.push(format!("{name}={}", level.to_lowercase())),
            LoggerSetting::Enabled(true) => {}
        }
    }
    out.join(",")
}

impl ServiceHandler for LogsManager {
    fn methods(self: Arc<Self>) -> MethodTable {
        let get = self.clone();
        let set = self.clone();
        let reset = self;
        MethodTable::new()
            .unary("get", move |req: Filter, _ctx| {
                let result = get.get(req);
                async move { result }
            })
            .unary("set", move |req: LoggerUpdate, _ctx| {
                let result = set.set(req);
                async move { result }
            })
            .unary("reset", move |req: Filter, _ctx| {
                let result = reset.reset(req);
                async move { result }
            })
    }
}

#[async_trait]
impl LifecycleHooks for LogsManager {
    fn name(&self) -> &str {
        "log"
    }

    async fn load(&self, _ctx: &ManagerContext) -> Result<()> {
        self.reload_layers()
    }
}
