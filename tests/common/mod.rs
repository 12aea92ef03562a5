//! Shared fixtures: a sample service and servers on ephemeral ports.

#![allow(dead_code)]

use rpcmux::server::dispatch::{MethodTable, ServiceHandler};
use rpcmux::types::api::Empty;
use rpcmux::types::{ApiDecl, MethodSpec};
use rpcmux::{Folders, Result, RpcServer, ServerOptions, ServiceDescriptor};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// `echo` and `count` are implemented; `missing` is declared only.
pub const SAMPLE_API: ApiDecl = ApiDecl {
    service: "sample",
    min_version: 2,
    current_version: 3,
    methods: &[
        MethodSpec::unary("echo"),
        MethodSpec::streaming("count"),
        MethodSpec::unary("slow"),
        MethodSpec::unary("missing"),
    ],
};

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CountRequest {
    pub n: u32,
}

#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CountItem {
    pub i: u32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SlowRequest {
    pub ms: u64,
}

#[derive(Debug, Default)]
pub struct SampleService;

impl ServiceHandler for SampleService {
    fn methods(self: Arc<Self>) -> MethodTable {
        MethodTable::new()
            .unary("echo", |req: Value, _ctx| async move { Ok::<_, rpcmux::Error>(req) })
            .streaming("count", |req: CountRequest, _ctx| async move {
                let (tx, rx) = mpsc::channel::<Result<CountItem>>(4);
                tokio::spawn(async move {
                    for i in 0..req.n {
                        if tx.send(Ok(CountItem { i })).await.is_err() {
                            break;
                        }
                    }
                });
                Ok::<_, rpcmux::Error>(rx)
            })
            .unary("slow", |req: SlowRequest, _ctx| async move {
                tokio::time::sleep(Duration::from_millis(req.ms)).await;
                Ok::<_, rpcmux::Error>(Empty {})
            })
    }
}

pub fn sample() -> ServiceDescriptor {
    ServiceDescriptor::local(SAMPLE_API, Arc::new(SampleService)).with_version_label("sample:1.0")
}

/// Options for a loopback server with short timings.
pub fn options(workspace: &Path) -> ServerOptions {
    ServerOptions::new(Folders::new(workspace))
        .with_bind_host("127.0.0.1")
        .with_cli_value("rpc-main-host", "127.0.0.1")
        .with_cli_value("rpc-shutdown-grace", "1")
        .with_cli_value("rpc-shutdown-timeout", "0.2")
        .with_cli_value("rpc-client-timeout", "5")
}

pub async fn start(options: ServerOptions, descriptors: Vec<ServiceDescriptor>) -> RpcServer {
    RpcServer::start(options, descriptors).await.unwrap()
}
