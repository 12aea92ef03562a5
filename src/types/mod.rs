//! Core types shared across the crate.
//!
//! - **Errors**: error enum, result codes and response status
//! - **Api**: messages and API declarations of the built-in services
//! - **Meta**: caller metadata attached to each request
//! - **Options**: server construction options and transport limits

pub mod api;
mod errors;
mod meta;
mod options;

pub use api::{ApiDecl, MethodSpec};
pub use errors::{Error, Result, ResultCode, RpcStatus};
pub use meta::{current_ip, RpcMetadata};
pub use options::{IpcConfig, ServerOptions};
