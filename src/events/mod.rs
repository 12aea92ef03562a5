//! Event distribution.
//!
//! - **Bus**: per-listener queues with retention and keepalives
//! - **Service**: the `events` RPC service over the bus
//! - **Listener**: client side, resuming its stream after errors

mod bus;
mod listener;
mod service;

pub use bus::{validate_event_name, BusStats, EventBus, EventBusConfig};
pub use listener::{EventHandler, EventListener};
pub use service::EventsManager;
