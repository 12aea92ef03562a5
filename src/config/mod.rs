//! Configuration items, the layered store resolving their values, and the
//! `config` service exposing user items over RPC.

mod item;
mod service;
pub mod static_items;
mod store;

pub use item::{ConfigItem, Mutability, Validator};
pub use service::ConfigManager;
pub use store::{env_name, ConfigSnapshot, ConfigStore, ConfigValue, CONFIG_FILE};
