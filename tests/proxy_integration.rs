//! Proxying: a main server forwarding a service to a server registered at
//! runtime through `srv.proxy_register`.

mod common;

use common::{options, sample, start, CountItem, CountRequest, SAMPLE_API};
use rpcmux::config::ConfigItem;
use rpcmux::server::proxy::ProxyState;
use rpcmux::types::api::{ConfigSetItem, ConfigUpdate, Filter, ProxyRegisterRequest};
use rpcmux::{ProxiedManager, ResultCode, RpcClient, RpcServer, ServiceDescriptor};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

async fn start_main(workspace: &Path) -> RpcServer {
    let options = options(workspace).with_cli_value("rpc-client-timeout", "0.5");
    start(options, vec![ServiceDescriptor::proxied(SAMPLE_API)]).await
}

async fn start_proxied(workspace: &Path, main_port: u16) -> RpcServer {
    let options = options(workspace)
        .with_cli_value("rpc-main-port", main_port.to_string())
        .with_user_items(vec![ConfigItem::new("sample-color", "blue")]);
    let manager = Arc::new(ProxiedManager::new(["sample"], "sample:1.0"));
    start(options, vec![sample().with_hooks(manager)]).await
}

/// Client with a budget larger than the main server client timeout.
fn patient_client(port: u16) -> RpcClient {
    RpcClient::builder("127.0.0.1", port)
        .stub("sample", SAMPLE_API.current_version)
        .timeout(Some(Duration::from_secs(5)))
        .build()
}

#[tokio::test]
async fn test_unregistered_proxy_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let main = start_main(dir.path()).await;
    assert_eq!(main.proxy_state("sample"), Some(ProxyState::Unregistered));

    let started = Instant::now();
    let err = patient_client(main.port())
        .stub("sample")
        .unwrap()
        .invoke::<_, Value>("echo", &json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ResultCode::ErrorProxyUnregistered);
    assert!(started.elapsed() >= Duration::from_millis(400));

    main.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_register_forward_forget() {
    let main_dir = tempfile::tempdir().unwrap();
    let proxied_dir = tempfile::tempdir().unwrap();
    let main = start_main(main_dir.path()).await;
    let proxied = start_proxied(proxied_dir.path(), main.port()).await;

    let registration = main.proxy_state("sample").unwrap();
    let registration = registration.registration().unwrap();
    assert_eq!(registration.port, proxied.port());
    assert_eq!(registration.version, "sample:1.0");

    let stub = patient_client(main.port()).stub("sample").unwrap();
    let reply: Value = stub.invoke("echo", &json!({"via": "main"})).await.unwrap();
    assert_eq!(reply, json!({"via": "main"}));

    let mut stream = stub
        .stream::<_, CountItem>("count", &CountRequest { n: 2 }, Default::default())
        .await
        .unwrap();
    let mut items = Vec::new();
    while let Some(item) = stream.next().await {
        items.push(item.unwrap().i);
    }
    assert_eq!(items, vec![0, 1]);

    let info = main.client().srv().info(&Filter::names(["sample"])).await.unwrap().into_result().unwrap();
    let info = &info.items[0];
    assert!(info.is_proxy);
    assert_eq!(info.proxy_port, proxied.port());
    assert_eq!(info.version, "sample:1.0");

    proxied.shutdown().await.unwrap();
    assert_eq!(main.proxy_state("sample"), Some(ProxyState::Forgotten));
    let err = stub.invoke::<_, Value>("echo", &json!({})).await.unwrap_err();
    assert_eq!(err.code(), ResultCode::ErrorProxyUnregistered);

    main.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_config_merges_proxied_items() {
    let main_dir = tempfile::tempdir().unwrap();
    let proxied_dir = tempfile::tempdir().unwrap();
    let main = start_main(main_dir.path()).await;
    let proxied = start_proxied(proxied_dir.path(), main.port()).await;

    let config = main.client().config();
    let status = config.get(&Filter::names(["sample-color"])).await.unwrap().into_result().unwrap();
    assert_eq!(status.items[0].value, "blue");

    let update = ConfigUpdate {
        items: vec![ConfigSetItem {
            name: "sample-color".into(),
            value: "red".into(),
        }],
        ignore_unknown: false,
    };
    let status = config.set(&update).await.unwrap().into_result().unwrap();
    assert_eq!(status.items[0].value, "red");
    assert_eq!(proxied.config().get("sample-color").unwrap().value, "red");

    config.reset(&Filter::names(["sample-color"])).await.unwrap();
    assert_eq!(proxied.config().get("sample-color").unwrap().value, "blue");

    proxied.shutdown().await.unwrap();
    main.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_registration_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let main = start_main(dir.path()).await;
    let request = ProxyRegisterRequest {
        names: vec!["sample".into()],
        version: "sample:2.0".into(),
        host: "127.0.0.1".into(),
        port: 1,
    };
    main.client().srv().proxy_register(&request).await.unwrap();
    main.shutdown().await.unwrap();

    let main = start_main(dir.path()).await;
    let state = main.proxy_state("sample").unwrap();
    assert_eq!(state.registration().map(|r| r.port), Some(1));

    // Nobody listens there: the call fails and the registration expires.
    let err = patient_client(main.port())
        .stub("sample")
        .unwrap()
        .invoke::<_, Value>("echo", &json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ResultCode::ErrorUnreachable);
    assert_eq!(main.proxy_state("sample"), Some(ProxyState::Expired));

    main.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_invalid_registrations() {
    let dir = tempfile::tempdir().unwrap();
    let main = start_main(dir.path()).await;
    let srv = main.client().srv();

    let valid = ProxyRegisterRequest {
        names: vec!["sample".into()],
        version: "sample:1.0".into(),
        host: String::new(),
        port: 4242,
    };
    for (request, code) in [
        (
            ProxyRegisterRequest {
                names: vec![],
                ..valid.clone()
            },
            ResultCode::ErrorValidation,
        ),
        (
            ProxyRegisterRequest {
                names: vec!["config".into()],
                ..valid.clone()
            },
            ResultCode::ErrorValidation,
        ),
        (
            ProxyRegisterRequest {
                names: vec!["nope".into()],
                ..valid.clone()
            },
            ResultCode::ErrorNotFound,
        ),
        (
            ProxyRegisterRequest {
                version: String::new(),
                ..valid.clone()
            },
            ResultCode::ErrorValidation,
        ),
        (
            ProxyRegisterRequest {
                port: 0,
                ..valid.clone()
            },
            ResultCode::ErrorValidation,
        ),
    ] {
        let err = srv.proxy_register(&request).await.unwrap_err();
        assert_eq!(err.code(), code, "{request:?}");
    }
    assert_eq!(main.proxy_state("sample"), Some(ProxyState::Unregistered));

    main.shutdown().await.unwrap();
}
