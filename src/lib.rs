//! # rpcmux - multi-service RPC server
//!
//! One listening endpoint multiplexing several versioned services:
//! - API version negotiation per call (client too old / server too old)
//! - Services served in-process or proxied to another server registered at runtime
//! - Layered configuration (hard-coded, system, user, environment, CLI, workspace)
//! - Built-in `srv`, `config`, `log` and `events` services
//! - Bounded worker pool and graceful lifecycle with manager hooks
//!
//! ## Architecture
//!
//! ```text
//!                    ┌───────────────────────────────────┐
//!   msgpack frames → │            RpcServer              │
//!                    │  ┌──────────┐ ┌──────────────┐    │
//!                    │  │ Service  │ │   Version    │    │
//!                    │  │ Registry │ │  Negotiation │    │
//!                    │  └──────────┘ └──────────────┘    │
//!                    │  ┌──────────┐ ┌──────────────┐    │
//!                    │  │  Worker  │ │    Proxy     │ ─────→ proxied server
//!                    │  │   Pool   │ │    Router    │    │
//!                    │  └──────────┘ └──────────────┘    │
//!                    └───────────────────────────────────┘
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

#[cfg(feature = "cli")]
pub mod cli;
pub mod client;
pub mod config;
pub mod events;
pub mod folders;
pub mod ipc;
pub mod logs;
pub mod manager;
pub mod server;
pub mod types;

// Internal utilities
pub mod observability;

pub use client::{AutoClient, RpcClient};
pub use folders::Folders;
pub use manager::{LifecycleHooks, ManagerContext, ProxiedManager};
pub use server::registry::ServiceDescriptor;
pub use server::RpcServer;
pub use types::{Error, Result, ResultCode, ServerOptions};
