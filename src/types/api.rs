//! Messages and API declarations of the built-in services.
//!
//! Every message uses `#[serde(default)]` so an empty body is a valid
//! request.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Declared method of a service API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodSpec {
    pub name: &'static str,
    pub streaming: bool,
}

impl MethodSpec {
    pub const fn unary(name: &'static str) -> Self {
        Self {
            name,
            streaming: false,
        }
    }

    pub const fn streaming(name: &'static str) -> Self {
        Self {
            name,
            streaming: true,
        }
    }
}

/// Version range and method list of a service API.
#[derive(Debug, Clone, Copy)]
pub struct ApiDecl {
    pub service: &'static str,
    pub min_version: u32,
    pub current_version: u32,
    pub methods: &'static [MethodSpec],
}

pub const SRV_API: ApiDecl = ApiDecl {
    service: "srv",
    min_version: 1,
    current_version: 1,
    methods: &[
        MethodSpec::unary("info"),
        MethodSpec::unary("shutdown"),
        MethodSpec::unary("proxy_register"),
        MethodSpec::unary("proxy_forget"),
    ],
};

pub const CONFIG_API: ApiDecl = ApiDecl {
    service: "config",
    min_version: 1,
    current_version: 1,
    methods: &[
        MethodSpec::unary("get"),
        MethodSpec::unary("set"),
        MethodSpec::unary("reset"),
    ],
};

pub const LOGGER_API: ApiDecl = ApiDecl {
    service: "log",
    min_version: 1,
    current_version: 1,
    methods: &[
        MethodSpec::unary("get"),
        MethodSpec::unary("set"),
        MethodSpec::unary("reset"),
    ],
};

pub const EVENT_API: ApiDecl = ApiDecl {
    service: "events",
    min_version: 1,
    current_version: 1,
    methods: &[
        MethodSpec::streaming("listen"),
        MethodSpec::unary("interrupt"),
        MethodSpec::unary("send"),
        MethodSpec::unary("inspect"),
    ],
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

/// Name filter shared by several services.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Filter {
    pub names: Vec<String>,
    pub ignore_unknown: bool,
}

impl Filter {
    pub fn names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
            ignore_unknown: false,
        }
    }
}

// =============================================================================
// srv
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceInfo {
    pub name: String,
    pub version: String,
    pub current_api_version: u32,
    pub supported_api_version: u32,
    pub is_proxy: bool,
    pub proxy_host: String,
    pub proxy_port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiServiceInfo {
    pub items: Vec<ServiceInfo>,
}

/// Remote shutdown request.
///
/// `timeout` (seconds) is the extra wait before the response returns:
/// negative for none, 0 for the configured `rpc-shutdown-timeout`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownRequest {
    pub timeout: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyRegisterRequest {
    pub names: Vec<String>,
    pub version: String,
    pub host: String,
    pub port: u16,
}

// =============================================================================
// config
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigItemView {
    pub name: String,
    pub description: String,
    pub value: String,
    pub default_value: String,
    pub validator: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigStatus {
    pub items: Vec<ConfigItemView>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigSetItem {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigUpdate {
    pub items: Vec<ConfigSetItem>,
    pub ignore_unknown: bool,
}

// =============================================================================
// log
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum LoggerLevel {
    #[default]
    Unknown,
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LoggerLevel {
    /// Directive form understood by `EnvFilter`; `None` for `Unknown`.
    pub fn directive(&self) -> Option<&'static str> {
        match self {
            LoggerLevel::Unknown => None,
            LoggerLevel::Trace => Some("trace"),
            LoggerLevel::Debug => Some("debug"),
            LoggerLevel::Info => Some("info"),
            LoggerLevel::Warn => Some("warn"),
            LoggerLevel::Error => Some("error"),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "TRACE" => Some(LoggerLevel::Trace),
            "DEBUG" => Some(LoggerLevel::Debug),
            "INFO" => Some(LoggerLevel::Info),
            "WARN" | "WARNING" => Some(LoggerLevel::Warn),
            "ERROR" | "CRITICAL" => Some(LoggerLevel::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    pub name: String,
    pub enabled: bool,
    pub level: LoggerLevel,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerUpdate {
    pub items: Vec<LoggerConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerStatus {
    pub items: Vec<LoggerConfig>,
}

// =============================================================================
// events
// =============================================================================

/// Event distributed by the event bus. An empty name is a keepalive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Event {
    pub name: String,
    pub properties: BTreeMap<String, String>,
    pub timestamp_ms: i64,
}

impl Event {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: BTreeMap::new(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn is_keepalive(&self) -> bool {
        self.name.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventFilter {
    pub client_id: Option<u32>,
    pub names: Vec<String>,
}

/// One chunk of a `listen` stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventStatus {
    pub client_id: u32,
    pub event: Option<Event>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventInterrupt {
    pub client_id: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventClients {
    pub client_ids: Vec<u32>,
}
