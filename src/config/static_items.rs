//! Built-in static items tuning the server itself.

use std::time::Duration;

use super::item::{ConfigItem, Mutability, Validator};
use super::store::ConfigSnapshot;
use crate::types::{Error, Result};

pub const MAX_WORKERS: &str = "rpc-max-workers";
pub const SHUTDOWN_GRACE: &str = "rpc-shutdown-grace";
pub const SHUTDOWN_TIMEOUT: &str = "rpc-shutdown-timeout";
pub const CLIENT_TIMEOUT: &str = "rpc-client-timeout";
pub const MAIN_HOST: &str = "rpc-main-host";
pub const MAIN_PORT: &str = "rpc-main-port";
pub const LOGS_FOLDER: &str = "rpc-logs-folder";
pub const EVENT_QUEUE_SIZE: &str = "rpc-event-queue-size";
pub const EVENT_RETENTION: &str = "rpc-event-retention";
pub const EVENT_KEEPALIVE: &str = "rpc-event-keepalive";

fn validate_port(name: &str, value: &str) -> Result<()> {
    match value.trim().parse::<u16>() {
        Ok(port) if port > 0 => Ok(()),
        _ => Err(Error::config_validation(format!("invalid port for config item {name}: {value}"))),
    }
}

fn item(name: &str, default: &str, validator: Validator, description: &str) -> ConfigItem {
    ConfigItem::new(name, default)
        .with_validator(validator)
        .with_description(description)
        .with_mutability(Mutability::Static)
}

/// Static items registered by every server.
pub fn static_items() -> Vec<ConfigItem> {
    vec![
        item(MAX_WORKERS, "30", Validator::PosInt, "Maximum parallel RPC workers"),
        item(
            SHUTDOWN_GRACE,
            "30",
            Validator::PosFloat,
            "Grace period for pending calls to terminate on shutdown (seconds)",
        ),
        item(
            SHUTDOWN_TIMEOUT,
            "60",
            Validator::PosFloat,
            "Wait before a remote shutdown call returns (seconds)",
        ),
        item(
            CLIENT_TIMEOUT,
            "60",
            Validator::PosFloat,
            "Default client call timeout, also bounds waits for proxy registration (seconds)",
        ),
        item(MAIN_HOST, "localhost", Validator::String, "Host of the main server proxying this one"),
        item(
            MAIN_PORT,
            "54321",
            Validator::custom(validate_port),
            "Port of the main server proxying this one",
        ),
        item(LOGS_FOLDER, "logs", Validator::String, "Workspace relative folder for logs and debug dumps"),
        item(EVENT_QUEUE_SIZE, "1024", Validator::PosInt, "Maximum queued events per listener"),
        item(
            EVENT_RETENTION,
            "60",
            Validator::PosFloat,
            "How long a disconnected listener queue is kept (seconds)",
        ),
        item(EVENT_KEEPALIVE, "5", Validator::PosFloat, "Keepalive period of idle event streams (seconds)"),
    ]
}

/// Typed view of the built-in static items.
#[derive(Debug, Clone)]
pub struct RpcTunables {
    pub max_workers: usize,
    pub shutdown_grace: Duration,
    pub shutdown_timeout: Duration,
    pub client_timeout: Duration,
    pub main_host: String,
    pub main_port: u16,
    pub logs_folder: String,
    pub event_queue_size: usize,
    pub event_retention: Duration,
    pub event_keepalive: Duration,
}

impl RpcTunables {
    pub fn from_snapshot(snapshot: &ConfigSnapshot) -> Result<Self> {
        let count = |name: &str| -> Result<usize> {
            let v = snapshot.get(name)?.int_val()?;
            usize::try_from(v).map_err(|_| Error::config_validation(format!("{name} out of range: {v}")))
        };
        let main_port = snapshot.get(MAIN_PORT)?.int_val()?;
        Ok(Self {
            max_workers: count(MAX_WORKERS)?,
            shutdown_grace: snapshot.get(SHUTDOWN_GRACE)?.secs_val()?,
            shutdown_timeout: snapshot.get(SHUTDOWN_TIMEOUT)?.secs_val()?,
            client_timeout: snapshot.get(CLIENT_TIMEOUT)?.secs_val()?,
            main_host: snapshot.get(MAIN_HOST)?.value.clone(),
            main_port: u16::try_from(main_port)
                .map_err(|_| Error::config_validation(format!("{MAIN_PORT} out of range: {main_port}")))?,
            logs_folder: snapshot.get(LOGS_FOLDER)?.value.clone(),
            event_queue_size: count(EVENT_QUEUE_SIZE)?,
            event_retention: snapshot.get(EVENT_RETENTION)?.secs_val()?,
            event_keepalive: snapshot.get(EVENT_KEEPALIVE)?.secs_val()?,
        })
    }
}
