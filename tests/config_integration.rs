//! Configuration layers and persistence through a running server.

mod common;

use common::{options, start};
use pretty_assertions::assert_eq;
use rpcmux::config::{ConfigItem, Mutability, Validator, CONFIG_FILE};
use rpcmux::folders::write_json;
use rpcmux::types::api::Filter;
use rpcmux::{Error, ResultCode, RpcServer};
use serde_json::json;

fn user_items() -> Vec<ConfigItem> {
    vec![
        ConfigItem::new("app-greeting", "hello"),
        ConfigItem::new("app-retries", "3").with_validator(Validator::PosInt),
    ]
}

#[tokio::test]
async fn test_user_value_persists_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let server = start(options(dir.path()).with_user_items(user_items()), vec![]).await;

    let config = server.client().config();
    let status = config.set_one("app-retries", "7").await.unwrap().into_result().unwrap();
    assert_eq!(status.items[0].value, "7");
    assert_eq!(status.items[0].default_value, "3");

    let err = config.set_one("app-retries", "-1").await.unwrap_err();
    assert_eq!(err.code(), ResultCode::ErrorValidation);
    assert_eq!(server.config().get("app-retries").unwrap().value, "7");
    server.shutdown().await.unwrap();

    let server = start(options(dir.path()).with_user_items(user_items()), vec![]).await;
    assert_eq!(server.config().get("app-retries").unwrap().int_val().unwrap(), 7);

    server.client().config().reset(&Filter::names(["app-retries"])).await.unwrap();
    server.shutdown().await.unwrap();

    let server = start(options(dir.path()).with_user_items(user_items()), vec![]).await;
    assert_eq!(server.config().get("app-retries").unwrap().value, "3");
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_persisted_value_beats_env_and_cli_defaults() {
    let dir = tempfile::tempdir().unwrap();
    std::env::set_var("APP_PERSISTED_ENV", "env");
    let start_server = || {
        let items = vec![
            ConfigItem::new("app-persisted-cli", "hard"),
            ConfigItem::new("app-persisted-env", "hard"),
        ];
        let options = options(dir.path())
            .with_user_items(items)
            .with_cli_value("app-persisted-cli", "cli");
        start(options, vec![])
    };

    let server = start_server().await;
    assert_eq!(server.config().get("app-persisted-cli").unwrap().value, "cli");
    assert_eq!(server.config().get("app-persisted-env").unwrap().value, "env");
    let config = server.client().config();
    config.set_one("app-persisted-cli", "workspace").await.unwrap();
    config.set_one("app-persisted-env", "workspace").await.unwrap();
    server.shutdown().await.unwrap();

    let server = start_server().await;
    for (name, default) in [("app-persisted-cli", "cli"), ("app-persisted-env", "env")] {
        let value = server.config().get(name).unwrap();
        assert_eq!(value.value, "workspace", "{name}");
        assert_eq!(value.default_value, default, "{name}");
    }

    server
        .client()
        .config()
        .reset(&Filter::names(["app-persisted-cli", "app-persisted-env"]))
        .await
        .unwrap();
    assert_eq!(server.config().get("app-persisted-cli").unwrap().value, "cli");
    assert_eq!(server.config().get("app-persisted-env").unwrap().value, "env");
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_layer_precedence() {
    let root = tempfile::tempdir().unwrap();
    let workspace = root.path().join("ws");
    let system = root.path().join("system");
    let user = root.path().join("user");
    write_json(
        &system.join(CONFIG_FILE),
        &json!({"layer-a": "system", "layer-b": "system", "layer-c": "system"}),
    )
    .unwrap();
    write_json(&user.join(CONFIG_FILE), &json!({"layer-b": "user", "layer-c": "user"})).unwrap();
    // Unique names: the environment is shared by every test of the binary.
    std::env::set_var("LAYER_C", "env");
    std::env::set_var("LAYER_D", "env");

    let items = ["layer-a", "layer-b", "layer-c", "layer-d", "layer-e"]
        .into_iter()
        .map(|name| ConfigItem::new(name, "hard").with_mutability(Mutability::Static))
        .collect();
    let mut options = options(&workspace).with_static_items(items).with_cli_value("layer-d", "cli");
    options.folders = options.folders.with_system(&system).with_user(&user);
    let server = start(options, vec![]).await;

    let value = |name: &str| server.config().get(name).unwrap().value;
    assert_eq!(value("layer-a"), "system");
    assert_eq!(value("layer-b"), "user");
    assert_eq!(value("layer-c"), "env");
    assert_eq!(value("layer-d"), "cli");
    assert_eq!(value("layer-e"), "hard");

    // Static items are not served by the config service.
    let err = server.client().config().set_one("layer-a", "x").await.unwrap_err();
    assert_eq!(err.code(), ResultCode::ErrorNotFound);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_invalid_static_value_refuses_start() {
    let dir = tempfile::tempdir().unwrap();
    let options = options(dir.path()).with_cli_value("rpc-max-workers", "zero");
    let err = RpcServer::start(options, vec![]).await.unwrap_err();
    assert!(matches!(err, Error::ConfigValidation(_)), "{err}");
}

#[tokio::test]
async fn test_invalid_persisted_value_falls_back_to_default() {
    let dir = tempfile::tempdir().unwrap();
    write_json(&dir.path().join(CONFIG_FILE), &json!({"app-retries": "many"})).unwrap();

    let server = start(options(dir.path()).with_user_items(user_items()), vec![]).await;
    assert_eq!(server.config().get("app-retries").unwrap().value, "3");
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_tunables_come_from_config() {
    let dir = tempfile::tempdir().unwrap();
    let server = start(options(dir.path()).with_cli_value("rpc-max-workers", "4"), vec![]).await;
    assert_eq!(server.tunables().max_workers, 4);
    assert_eq!(server.pool_stats().capacity, 4);
    server.shutdown().await.unwrap();
}
