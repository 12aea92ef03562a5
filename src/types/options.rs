//! Server construction options.
//!
//! Runtime tunables (worker count, shutdown timings, event retention...) are
//! config items resolved by the config store; this module only carries what
//! must be known before the store exists.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::ConfigItem;
use crate::folders::Folders;

/// Options consumed by `RpcServer::start`.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Listening port; 0 picks an ephemeral one.
    pub port: u16,

    /// Bind host.
    pub bind_host: String,

    /// System/user/workspace folders.
    pub folders: Folders,

    /// Structured `NAME=VALUE` overrides (highest precedence layer).
    pub cli_config: BTreeMap<String, String>,

    /// Application static items, registered next to the built-in ones.
    pub static_items: Vec<ConfigItem>,

    /// Application user items.
    pub user_items: Vec<ConfigItem>,

    /// Serve the `events` service.
    pub with_events: bool,

    /// Install the SIGUSR2 debug dump handler.
    pub with_debug_signal: bool,

    /// Version label reported by `srv.info` for built-in services.
    pub version_label: String,

    /// Transport limits.
    pub ipc: IpcConfig,
}

impl ServerOptions {
    pub fn new(folders: Folders) -> Self {
        Self {
            port: 0,
            bind_host: "0.0.0.0".to_string(),
            folders,
            cli_config: BTreeMap::new(),
            static_items: Vec::new(),
            user_items: Vec::new(),
            with_events: true,
            with_debug_signal: false,
            version_label: format!("rpcmux:{}", env!("CARGO_PKG_VERSION")),
            ipc: IpcConfig::default(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_bind_host(mut self, host: impl Into<String>) -> Self {
        self.bind_host = host.into();
        self
    }

    pub fn with_cli_value(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cli_config.insert(name.into(), value.into());
        self
    }

    pub fn with_static_items(mut self, items: Vec<ConfigItem>) -> Self {
        self.static_items.extend(items);
        self
    }

    pub fn with_user_items(mut self, items: Vec<ConfigItem>) -> Self {
        self.user_items.extend(items);
        self
    }

    pub fn with_events(mut self, enabled: bool) -> Self {
        self.with_events = enabled;
        self
    }

    pub fn with_debug_signal(mut self, enabled: bool) -> Self {
        self.with_debug_signal = enabled;
        self
    }

    pub fn with_ipc(mut self, ipc: IpcConfig) -> Self {
        self.ipc = ipc;
        self
    }
}

/// IPC transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    /// Maximum frame payload size in bytes.
    pub max_frame_bytes: u32,

    /// Bounded channel capacity for streaming responses.
    pub stream_channel_capacity: usize,

    /// Maximum concurrent TCP connections. Connections beyond this limit
    /// are dropped on accept.
    pub max_connections: usize,

    /// Idle time allowed between two request frames of a connection.
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,

    /// Slow consumers that cannot accept a frame within this window are
    /// dropped.
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 5 * 1024 * 1024,
            stream_channel_capacity: 64,
            max_connections: 1000,
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipc_config_reads_humantime_durations() {
        let cfg: IpcConfig =
            serde_json::from_value(serde_json::json!({"read_timeout": "2m", "write_timeout": "500ms"}))
                .unwrap();
        assert_eq!(cfg.read_timeout, Duration::from_secs(120));
        assert_eq!(cfg.write_timeout, Duration::from_millis(500));
        assert_eq!(cfg.max_connections, 1000);
    }

    #[test]
    fn test_options_builder() {
        let opts = ServerOptions::new(Folders::new("/tmp/ws"))
            .with_port(1234)
            .with_cli_value("rpc-max-workers", "4")
            .with_events(false);
        assert_eq!(opts.port, 1234);
        assert_eq!(opts.cli_config.get("rpc-max-workers").map(String::as_str), Some("4"));
        assert!(!opts.with_events);
        assert!(opts.version_label.starts_with("rpcmux:"));
    }
}
