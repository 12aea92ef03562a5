//! RPC client: one stub per configured service, each call tagged with the
//! declared API version and caller metadata.

mod auto;
mod stubs;
mod transport;

pub use auto::AutoClient;
pub use stubs::{ConfigStub, EventsStub, LoggerStub, SrvStub};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::ipc::codec::WireRequest;
use crate::types::{current_ip, Error, IpcConfig, Result, RpcMetadata, RpcStatus};

/// Default client-level timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// What to do with non-OK result codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorMode {
    /// Turn them into `Err(Error::Status)`.
    #[default]
    Raise,
    /// Return them in [`Reply::status`].
    Return,
}

/// Builds the error raised for a non-OK status returned by the server.
#[derive(Clone)]
pub struct ErrorMapper(Arc<dyn Fn(RpcStatus) -> Error + Send + Sync>);

impl ErrorMapper {
    pub fn new(f: impl Fn(RpcStatus) -> Error + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    fn map(&self, error: Error) -> Error {
        match error {
            Error::Status(status) => (self.0)(status),
            other => other,
        }
    }
}

impl fmt::Debug for ErrorMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ErrorMapper")
    }
}

/// Per-call timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallTimeout {
    /// Client-level timeout.
    #[default]
    Default,
    /// No timeout at all.
    Unlimited,
    After(Duration),
}

impl From<Duration> for CallTimeout {
    fn from(d: Duration) -> Self {
        CallTimeout::After(d)
    }
}

/// Reply of a call honoring the client [`ErrorMode`]. A non-OK status is
/// only returned in [`ErrorMode::Return`] mode.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply<T> {
    pub status: RpcStatus,
    /// Only set when `status` is OK.
    pub body: Option<T>,
}

impl<T> Reply<T> {
    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }

    pub fn into_result(self) -> Result<T> {
        match self.body {
            Some(body) if self.status.is_ok() => Ok(body),
            _ => Err(Error::Status(self.status)),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Reply<U> {
        Reply {
            status: self.status,
            body: self.body.map(f),
        }
    }
}

/// Typed stream of replies.
#[derive(Debug)]
pub struct ReplyStream<T> {
    rx: mpsc::Receiver<Result<Value>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> ReplyStream<T> {
    /// Next item; `None` once the server ended the stream. An error item is
    /// always the last one.
    pub async fn next(&mut self) -> Option<Result<T>> {
        let item = self.rx.recv().await?;
        Some(item.and_then(|v| serde_json::from_value(v).map_err(Error::from)))
    }
}

#[derive(Debug)]
struct ClientInner {
    host: String,
    port: u16,
    timeout: Option<Duration>,
    error_mode: ErrorMode,
    error_mapper: Option<ErrorMapper>,
    versions: HashMap<String, u32>,
    meta: RpcMetadata,
    max_frame_bytes: u32,
}

/// Client bound to one server endpoint. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
pub struct RpcClientBuilder {
    host: String,
    port: u16,
    name: String,
    timeout: Option<Duration>,
    error_mode: ErrorMode,
    error_mapper: Option<ErrorMapper>,
    versions: HashMap<String, u32>,
    max_frame_bytes: u32,
}

impl RpcClientBuilder {
    /// Client name reported in call metadata.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Client-level timeout; `None` disables it.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn error_mode(mut self, mode: ErrorMode) -> Self {
        self.error_mode = mode;
        self
    }

    /// Custom error for non-OK statuses raised in [`ErrorMode::Raise`] mode.
    pub fn error_mapper(mut self, f: impl Fn(RpcStatus) -> Error + Send + Sync + 'static) -> Self {
        self.error_mapper = Some(ErrorMapper::new(f));
        self
    }

    /// Declare the API version this client uses for a service.
    pub fn stub(mut self, service: impl Into<String>, version: u32) -> Self {
        self.versions.insert(service.into(), version);
        self
    }

    pub fn max_frame_bytes(mut self, max: u32) -> Self {
        self.max_frame_bytes = max;
        self
    }

    pub fn build(self) -> RpcClient {
        let mut meta = RpcMetadata::local(self.name);
        meta.ip = current_ip(Some(&self.host));
        RpcClient {
            inner: Arc::new(ClientInner {
                host: self.host,
                port: self.port,
                timeout: self.timeout,
                error_mode: self.error_mode,
                error_mapper: self.error_mapper,
                versions: self.versions,
                meta,
                max_frame_bytes: self.max_frame_bytes,
            }),
        }
    }
}

impl RpcClient {
    pub fn builder(host: impl Into<String>, port: u16) -> RpcClientBuilder {
        RpcClientBuilder {
            host: host.into(),
            port,
            name: "rpcmux".to_string(),
            timeout: Some(DEFAULT_TIMEOUT),
            error_mode: ErrorMode::Raise,
            error_mapper: None,
            versions: HashMap::new(),
            max_frame_bytes: IpcConfig::default().max_frame_bytes,
        }
    }

    pub fn host(&self) -> &str {
        &self.inner.host
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// `host:port` of the target server.
    pub fn target(&self) -> String {
        format!("{}:{}", self.inner.host, self.inner.port)
    }

    pub fn error_mode(&self) -> ErrorMode {
        self.inner.error_mode
    }

    fn raise(&self, error: Error) -> Error {
        match &self.inner.error_mapper {
            Some(mapper) => mapper.map(error),
            None => error,
        }
    }

    /// Stub of a configured service.
    pub fn stub(&self, service: &str) -> Result<Stub> {
        let version = self
            .inner
            .versions
            .get(service)
            .copied()
            .ok_or_else(|| Error::not_found(format!("no stub configured for service {service}")))?;
        Ok(self.stub_with_version(service, version))
    }

    /// Stub calling `service` with an explicit API version.
    pub fn stub_with_version(&self, service: &str, version: u32) -> Stub {
        Stub {
            client: self.clone(),
            service: service.to_string(),
            version,
        }
    }

    pub(crate) fn version_of(&self, service: &str, fallback: u32) -> u32 {
        self.inner.versions.get(service).copied().unwrap_or(fallback)
    }

    fn resolve_timeout(&self, timeout: CallTimeout) -> Option<Duration> {
        match timeout {
            CallTimeout::Default => self.inner.timeout,
            CallTimeout::Unlimited => None,
            CallTimeout::After(d) => Some(d),
        }
    }

    fn request(&self, service: &str, method: &str, body: Value, meta: RpcMetadata) -> WireRequest {
        WireRequest {
            id: Uuid::new_v4().to_string(),
            service: service.to_string(),
            method: method.to_string(),
            meta,
            body,
        }
    }

    fn metadata(&self, version: u32, timeout: Option<Duration>) -> RpcMetadata {
        let mut meta = self.inner.meta.clone();
        meta.api_version = version;
        meta.timeout_ms = timeout.map(duration_ms);
        meta
    }

    /// Unary call with explicit metadata. Always raises.
    pub(crate) async fn call_raw(
        &self,
        service: &str,
        method: &str,
        body: Value,
        mut meta: RpcMetadata,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        meta.timeout_ms = timeout.map(duration_ms);
        let request = self.request(service, method, body, meta);
        tracing::trace!(target_addr = %self.target(), "[RPC] >>> {}.{}", service, method);
        transport::call_unary(&self.target(), &request, timeout, self.inner.max_frame_bytes).await
    }

    /// Streaming call with explicit metadata. Always raises.
    pub(crate) async fn stream_raw(
        &self,
        service: &str,
        method: &str,
        body: Value,
        mut meta: RpcMetadata,
        timeout: Option<Duration>,
    ) -> Result<mpsc::Receiver<Result<Value>>> {
        meta.timeout_ms = timeout.map(duration_ms);
        let request = self.request(service, method, body, meta);
        tracing::trace!(target_addr = %self.target(), "[RPC] >>> {}.{} (stream)", service, method);
        transport::call_stream(&self.target(), &request, timeout, self.inner.max_frame_bytes).await
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Untyped-service stub carrying the declared API version.
#[derive(Debug, Clone)]
pub struct Stub {
    client: RpcClient,
    service: String,
    version: u32,
}

impl Stub {
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Call honoring the client [`ErrorMode`].
    pub async fn call<Req, Resp>(&self, method: &str, request: &Req, timeout: CallTimeout) -> Result<Reply<Resp>>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        match self.raw(method, request, timeout).await {
            Ok(body) => Ok(Reply {
                status: RpcStatus::ok(),
                body: Some(serde_json::from_value(body)?),
            }),
            Err(e) if self.client.error_mode() == ErrorMode::Return => Ok(Reply {
                status: e.to_status(),
                body: None,
            }),
            Err(e) => Err(self.client.raise(e)),
        }
    }

    /// Call with the default timeout, raising on non-OK codes whatever the
    /// client mode.
    pub async fn invoke<Req, Resp>(&self, method: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let body = self
            .raw(method, request, CallTimeout::Default)
            .await
            .map_err(|e| self.client.raise(e))?;
        Ok(serde_json::from_value(body)?)
    }

    /// Server-streaming call. The timeout covers the first reply only.
    pub async fn stream<Req, Resp>(
        &self,
        method: &str,
        request: &Req,
        timeout: CallTimeout,
    ) -> Result<ReplyStream<Resp>>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let timeout = self.client.resolve_timeout(timeout);
        let meta = self.client.metadata(self.version, timeout);
        let body = serde_json::to_value(request)?;
        let rx = self
            .client
            .stream_raw(&self.service, method, body, meta, timeout)
            .await
            .map_err(|e| self.client.raise(e))?;
        Ok(ReplyStream {
            rx,
            _marker: PhantomData,
        })
    }

    async fn raw<Req>(&self, method: &str, request: &Req, timeout: CallTimeout) -> Result<Value>
    where
        Req: Serialize + ?Sized,
    {
        let timeout = self.client.resolve_timeout(timeout);
        let meta = self.client.metadata(self.version, timeout);
        let body = serde_json::to_value(request)?;
        self.client
            .call_raw(&self.service, method, body, meta, timeout)
            .await
    }
}

impl fmt::Display for Stub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} (api:{})", self.service, self.client.target(), self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResultCode;

    #[test]
    fn test_timeout_resolution() {
        let client = RpcClient::builder("localhost", 1).timeout(Some(Duration::from_secs(3))).build();
        assert_eq!(client.resolve_timeout(CallTimeout::Default), Some(Duration::from_secs(3)));
        assert_eq!(client.resolve_timeout(CallTimeout::Unlimited), None);
        assert_eq!(
            client.resolve_timeout(Duration::from_millis(5).into()),
            Some(Duration::from_millis(5))
        );
    }

    #[test]
    fn test_unknown_stub() {
        let client = RpcClient::builder("localhost", 1).stub("sample", 2).build();
        assert_eq!(client.stub("sample").unwrap().version(), 2);
        assert_eq!(client.stub("other").unwrap_err().code(), ResultCode::ErrorNotFound);
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = RpcClient::builder("127.0.0.1", port).stub("sample", 1).build();
        let stub = client.stub("sample").unwrap();
        let err = stub
            .invoke::<_, serde_json::Value>("ping", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ResultCode::ErrorUnreachable);

        let client = RpcClient::builder("127.0.0.1", port)
            .stub("sample", 1)
            .error_mode(ErrorMode::Return)
            .build();
        let reply: Reply<serde_json::Value> = client
            .stub("sample")
            .unwrap()
            .call("ping", &serde_json::json!({}), CallTimeout::Default)
            .await
            .unwrap();
        assert_eq!(reply.status.code, ResultCode::ErrorUnreachable);
        assert!(reply.body.is_none());
    }
}
