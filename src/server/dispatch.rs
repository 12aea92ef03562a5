//! Method tables: typed handlers registered by name, resolved against the
//! declared API of their service.
//!
//! A method missing from the declared API is unknown (`ERROR_NOT_FOUND`);
//! a declared method without a handler answers `ERROR_NOT_IMPLEMENTED`.

use futures::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::calls::CallContext;
use crate::types::{ApiDecl, Error, MethodSpec, Result};

/// Capacity of the channel re-encoding typed stream items.
const STREAM_BUFFER: usize = 16;

type UnaryFn = Arc<dyn Fn(Value, CallContext) -> BoxFuture<'static, Result<Value>> + Send + Sync>;
type StreamFn = Arc<
    dyn Fn(Value, CallContext) -> BoxFuture<'static, Result<mpsc::Receiver<Result<Value>>>>
        + Send
        + Sync,
>;

/// Output of an invoked method.
#[derive(Debug)]
pub enum CallOutput {
    Unary(Value),
    Stream(mpsc::Receiver<Result<Value>>),
}

#[derive(Clone)]
pub enum MethodHandler {
    Unary(UnaryFn),
    Streaming(StreamFn),
}

impl fmt::Debug for MethodHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodHandler::Unary(_) => f.write_str("Unary"),
            MethodHandler::Streaming(_) => f.write_str("Streaming"),
        }
    }
}

impl MethodHandler {
    fn is_streaming(&self) -> bool {
        matches!(self, MethodHandler::Streaming(_))
    }

    pub fn invoke(&self, body: Value, ctx: CallContext) -> BoxFuture<'static, Result<CallOutput>> {
        match self {
            MethodHandler::Unary(f) => {
                let fut = f(body, ctx);
                async move { fut.await.map(CallOutput::Unary) }.boxed()
            }
            MethodHandler::Streaming(f) => {
                let fut = f(body, ctx);
                async move { fut.await.map(CallOutput::Stream) }.boxed()
            }
        }
    }
}

/// Decode a request body; an absent body is an empty object.
pub fn parse_body<T: DeserializeOwned>(body: Value) -> Result<T> {
    let body = if body.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        body
    };
    serde_json::from_value(body).map_err(|e| Error::validation(format!("invalid request body: {e}")))
}

/// Handlers implemented by a service, keyed by method name.
#[derive(Debug, Default)]
pub struct MethodTable {
    handlers: HashMap<&'static str, MethodHandler>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a unary method.
    pub fn unary<Req, Resp, F, Fut>(mut self, name: &'static str, f: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
    {
        let handler: UnaryFn = Arc::new(move |body: Value, ctx: CallContext| match parse_body::<Req>(body) {
            Ok(req) => {
                let fut = f(req, ctx);
                async move {
                    let resp = fut.await?;
                    Ok::<Value, Error>(serde_json::to_value(resp)?)
                }
                .boxed()
            }
            Err(e) => futures::future::ready(Err(e)).boxed(),
        });
        self.handlers.insert(name, MethodHandler::Unary(handler));
        self
    }

    /// Register a server-streaming method. Items are re-encoded by a relay
    /// task that stops as soon as the consumer goes away.
    pub fn streaming<Req, Resp, F, Fut>(mut self, name: &'static str, f: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<mpsc::Receiver<Result<Resp>>>> + Send + 'static,
    {
        let handler: StreamFn = Arc::new(move |body: Value, ctx: CallContext| match parse_body::<Req>(body) {
            Ok(req) => {
                let fut = f(req, ctx);
                async move {
                    let typed = fut.await?;
                    Ok::<_, Error>(relay_stream(typed))
                }
                .boxed()
            }
            Err(e) => futures::future::ready(Err(e)).boxed(),
        });
        self.handlers.insert(name, MethodHandler::Streaming(handler));
        self
    }
}

fn relay_stream<T: Serialize + Send + 'static>(
    mut typed: mpsc::Receiver<Result<T>>,
) -> mpsc::Receiver<Result<Value>> {
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    tokio::spawn(async move {
        loop {
            let item = tokio::select! {
                _ = tx.closed() => break,
                item = typed.recv() => item,
            };
            let Some(item) = item else { break };
            let encoded = item.and_then(|v| serde_json::to_value(v).map_err(Error::from));
            let last = encoded.is_err();
            if tx.send(encoded).await.is_err() || last {
                break;
            }
        }
    });
    rx
}

/// Service implementation behind a local descriptor.
pub trait ServiceHandler: Send + Sync + 'static {
    /// Handlers of the implemented methods.
    fn methods(self: Arc<Self>) -> MethodTable;
}

/// Method resolved against the declared API.
#[derive(Debug, Clone)]
pub struct ResolvedMethod {
    pub spec: MethodSpec,
    /// `None` when the method is declared but not implemented.
    pub handler: Option<MethodHandler>,
}

/// Per-service table covering every declared method.
#[derive(Debug, Clone, Default)]
pub struct DispatchTable {
    methods: HashMap<&'static str, ResolvedMethod>,
}

impl DispatchTable {
    /// Build the table of a local service. Implemented methods must be
    /// declared with the same streaming kind.
    pub fn build(api: &ApiDecl, table: MethodTable) -> Result<Self> {
        let mut handlers = table.handlers;
        let mut methods = HashMap::with_capacity(api.methods.len());
        for spec in api.methods {
            let handler = handlers.remove(spec.name);
            if let Some(h) = &handler {
                if h.is_streaming() != spec.streaming {
                    return Err(Error::validation(format!(
                        "method {}.{} registered as {:?} but declared {}",
                        api.service,
                        spec.name,
                        h,
                        if spec.streaming { "streaming" } else { "unary" }
                    )));
                }
            }
            methods.insert(spec.name, ResolvedMethod { spec: *spec, handler });
        }
        if let Some(extra) = handlers.keys().next() {
            return Err(Error::validation(format!(
                "method {}.{} is not declared by the service API",
                api.service, extra
            )));
        }
        Ok(Self { methods })
    }

    /// Table of a proxied service: declared methods only, no handlers.
    pub fn declared(api: &ApiDecl) -> Self {
        let methods = api
            .methods
            .iter()
            .map(|spec| (spec.name, ResolvedMethod { spec: *spec, handler: None }))
            .collect();
        Self { methods }
    }

    pub fn resolve(&self, service: &str, method: &str) -> Result<&ResolvedMethod> {
        self.methods
            .get(method)
            .ok_or_else(|| Error::not_found(format!("unknown method {service}.{method}")))
    }

    /// Invoke a local method.
    pub async fn invoke(&self, method: &str, body: Value, ctx: CallContext) -> Result<CallOutput> {
        let resolved = self.resolve(&ctx.service, method)?;
        match &resolved.handler {
            Some(handler) => handler.invoke(body, ctx).await,
            None => Err(Error::not_implemented(format!(
                "method {}.{} is not implemented",
                ctx.service, method
            ))),
        }
    }
}
