//! Application error types and RPC result codes.
//!
//! All errors use `thiserror` for automatic Error trait derivation. Every
//! error maps onto a [`ResultCode`], which is what travels back to callers in
//! each response.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Result code carried by every RPC response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultCode {
    #[default]
    Ok,
    ErrorApiClientTooOld,
    ErrorApiServerTooOld,
    ErrorProxyUnregistered,
    ErrorNotFound,
    ErrorValidation,
    ErrorNotImplemented,
    ErrorUnreachable,
    ErrorTimeout,
    ErrorShutdown,
    ErrorConflict,
    ErrorInternal,
}

impl ResultCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultCode::Ok => "OK",
            ResultCode::ErrorApiClientTooOld => "ERROR_API_CLIENT_TOO_OLD",
            ResultCode::ErrorApiServerTooOld => "ERROR_API_SERVER_TOO_OLD",
            ResultCode::ErrorProxyUnregistered => "ERROR_PROXY_UNREGISTERED",
            ResultCode::ErrorNotFound => "ERROR_NOT_FOUND",
            ResultCode::ErrorValidation => "ERROR_VALIDATION",
            ResultCode::ErrorNotImplemented => "ERROR_NOT_IMPLEMENTED",
            ResultCode::ErrorUnreachable => "ERROR_UNREACHABLE",
            ResultCode::ErrorTimeout => "ERROR_TIMEOUT",
            ResultCode::ErrorShutdown => "ERROR_SHUTDOWN",
            ResultCode::ErrorConflict => "ERROR_CONFLICT",
            ResultCode::ErrorInternal => "ERROR_INTERNAL",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status attached to every response (code + human readable message).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RpcStatus {
    pub code: ResultCode,
    #[serde(default)]
    pub msg: String,
}

impl RpcStatus {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn new(code: ResultCode, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == ResultCode::Ok
    }
}

impl fmt::Display for RpcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.msg.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.msg)
        }
    }
}

/// Main error enum.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad request parameters or model (ERROR_VALIDATION).
    #[error("validation error: {0}")]
    Validation(String),

    /// A config value rejected by its validator (ERROR_VALIDATION).
    #[error("config validation error: {0}")]
    ConfigValidation(String),

    /// Unknown service, method, item or listener (ERROR_NOT_FOUND).
    #[error("not found: {0}")]
    NotFound(String),

    /// Declared API method without an implementation (ERROR_NOT_IMPLEMENTED).
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Client declared an API version below the supported one.
    #[error("client API version {client} is too old (server supports {min}..={current})")]
    ClientTooOld { client: u32, min: u32, current: u32 },

    /// Client declared an API version above the current one.
    #[error("server API version {current} is too old for client API version {client}")]
    ServerTooOld { client: u32, current: u32 },

    /// Proxied service without a live registration.
    #[error("proxy unregistered: {0}")]
    ProxyUnregistered(String),

    /// A manager load hook failed; aborts startup.
    #[error("startup hook failed for {manager}: {reason}")]
    StartupHook { manager: String, reason: String },

    /// Invalid lifecycle transition.
    #[error("state transition error: {0}")]
    StateTransition(String),

    /// Remote endpoint could not be reached (or dropped the connection).
    #[error("unreachable: {0}")]
    Unreachable(String),

    /// Call budget expired.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Server is shutting down.
    #[error("shutting down: {0}")]
    ShuttingDown(String),

    /// Merged values disagree between servers.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),

    /// Non-OK status returned by a remote call.
    #[error("rpc returned {0}")]
    Status(RpcStatus),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Result code reported to callers for this error.
    pub fn code(&self) -> ResultCode {
        match self {
            Error::Validation(_) | Error::ConfigValidation(_) => ResultCode::ErrorValidation,
            Error::NotFound(_) => ResultCode::ErrorNotFound,
            Error::NotImplemented(_) => ResultCode::ErrorNotImplemented,
            Error::ClientTooOld { .. } => ResultCode::ErrorApiClientTooOld,
            Error::ServerTooOld { .. } => ResultCode::ErrorApiServerTooOld,
            Error::ProxyUnregistered(_) => ResultCode::ErrorProxyUnregistered,
            Error::Unreachable(_) => ResultCode::ErrorUnreachable,
            Error::Timeout(_) => ResultCode::ErrorTimeout,
            Error::ShuttingDown(_) => ResultCode::ErrorShutdown,
            Error::Conflict(_) => ResultCode::ErrorConflict,
            Error::Status(status) => status.code,
            Error::StartupHook { .. }
            | Error::StateTransition(_)
            | Error::Internal(_)
            | Error::Serialization(_)
            | Error::Io(_) => ResultCode::ErrorInternal,
        }
    }

    /// Convert to the status written in a response frame.
    ///
    /// Remote statuses are forwarded untouched so that proxied errors reach
    /// the final caller verbatim.
    pub fn to_status(&self) -> RpcStatus {
        match self {
            Error::Status(status) => status.clone(),
            other => RpcStatus::new(other.code(), other.to_string()),
        }
    }
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config_validation(msg: impl Into<String>) -> Self {
        Self::ConfigValidation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn not_implemented(msg: impl Into<String>) -> Self {
        Self::NotImplemented(msg.into())
    }

    pub fn proxy_unregistered(msg: impl Into<String>) -> Self {
        Self::ProxyUnregistered(msg.into())
    }

    pub fn state_transition(msg: impl Into<String>) -> Self {
        Self::StateTransition(msg.into())
    }

    pub fn unreachable(msg: impl Into<String>) -> Self {
        Self::Unreachable(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn shutting_down(msg: impl Into<String>) -> Self {
        Self::ShuttingDown(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<RpcStatus> for Error {
    fn from(status: RpcStatus) -> Self {
        Error::Status(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_serialize_in_wire_form() {
        let json = serde_json::to_string(&ResultCode::ErrorApiClientTooOld).unwrap();
        assert_eq!(json, "\"ERROR_API_CLIENT_TOO_OLD\"");
        let back: ResultCode = serde_json::from_str("\"ERROR_PROXY_UNREGISTERED\"").unwrap();
        assert_eq!(back, ResultCode::ErrorProxyUnregistered);
        assert_eq!(ResultCode::ErrorShutdown.to_string(), "ERROR_SHUTDOWN");
    }

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(Error::validation("x").code(), ResultCode::ErrorValidation);
        assert_eq!(Error::config_validation("x").code(), ResultCode::ErrorValidation);
        assert_eq!(
            Error::ClientTooOld { client: 1, min: 2, current: 3 }.code(),
            ResultCode::ErrorApiClientTooOld
        );
        assert_eq!(
            Error::StartupHook { manager: "m".into(), reason: "r".into() }.code(),
            ResultCode::ErrorInternal
        );
        assert_eq!(Error::unreachable("x").code(), ResultCode::ErrorUnreachable);
    }

    #[test]
    fn test_remote_status_is_forwarded_verbatim() {
        let remote = RpcStatus::new(ResultCode::ErrorConflict, "values differ");
        let err = Error::from(remote.clone());
        assert_eq!(err.code(), ResultCode::ErrorConflict);
        assert_eq!(err.to_status(), remote);
    }

    #[test]
    fn test_status_defaults_to_ok() {
        let status: RpcStatus = serde_json::from_str("{\"code\":\"OK\"}").unwrap();
        assert!(status.is_ok());
        assert_eq!(status.to_string(), "OK");
    }
}
