//! TCP+msgpack IPC transport layer.
//!
//! Length-prefixed msgpack framing shared by the server accept loop and the
//! client transport.

pub mod codec;
pub mod server;

pub use server::{DispatchResponse, Dispatcher, IpcServer};
