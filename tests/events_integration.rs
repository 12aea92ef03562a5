//! `events` service: listen streams, resume and client-side listener.

mod common;

use async_trait::async_trait;
use common::{options, start};
use pretty_assertions::assert_eq;
use rpcmux::events::{EventHandler, EventListener};
use rpcmux::types::api::{Event, EventFilter, EventStatus};
use rpcmux::{ResultCode, RpcServer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

async fn next_event(stream: &mut rpcmux::client::ReplyStream<EventStatus>) -> Event {
    loop {
        let status = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match status.event {
            Some(event) if !event.is_keepalive() => return event,
            _ => continue,
        }
    }
}

async fn server(dir: &std::path::Path) -> RpcServer {
    start(options(dir).with_cli_value("rpc-event-keepalive", "0.1"), vec![]).await
}

#[tokio::test]
async fn test_listen_send_and_resume() {
    let dir = tempfile::tempdir().unwrap();
    let server = server(dir.path()).await;
    let events = server.client().events();

    let filter = EventFilter {
        client_id: None,
        names: vec!["job-done".into()],
    };
    let mut stream = events.listen(&filter, None).await.unwrap();
    let first = stream.next().await.unwrap().unwrap();
    let client_id = first.client_id;
    assert!(client_id >= 1);
    assert!(first.event.is_none());
    assert_eq!(events.inspect().await.unwrap().into_result().unwrap(), vec![client_id]);

    events.send(&Event::new("ignored")).await.unwrap();
    events.send(&Event::new("job-done").with_property("job", "1")).await.unwrap();
    assert_eq!(next_event(&mut stream).await.properties["job"], "1");

    // Events sent while interrupted are replayed on resume, in order.
    events.interrupt(client_id).await.unwrap();
    for job in ["2", "3"] {
        events.send(&Event::new("job-done").with_property("job", job)).await.unwrap();
    }
    let resume = EventFilter {
        client_id: Some(client_id),
        names: vec!["job-done".into()],
    };
    let mut stream = events.listen(&resume, None).await.unwrap();
    assert_eq!(stream.next().await.unwrap().unwrap().client_id, client_id);
    assert_eq!(next_event(&mut stream).await.properties["job"], "2");
    assert_eq!(next_event(&mut stream).await.properties["job"], "3");

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_resume_unknown_id_and_bad_names() {
    let dir = tempfile::tempdir().unwrap();
    let server = server(dir.path()).await;
    let events = server.client().events();

    let filter = EventFilter {
        client_id: Some(42),
        names: vec![],
    };
    let err = events.listen(&filter, None).await.unwrap_err();
    assert_eq!(err.code(), ResultCode::ErrorNotFound);

    let err = events.send(&Event::new("has space")).await.unwrap_err();
    assert_eq!(err.code(), ResultCode::ErrorValidation);
    let err = events.interrupt(42).await.unwrap_err();
    assert_eq!(err.code(), ResultCode::ErrorNotFound);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_ends_streams() {
    let dir = tempfile::tempdir().unwrap();
    let server = server(dir.path()).await;
    let events = server.client().events();

    let mut stream = events.listen(&EventFilter::default(), None).await.unwrap();
    stream.next().await.unwrap().unwrap();

    server.shutdown().await.unwrap();
    let mut last = None;
    while let Some(item) = stream.next().await {
        last = Some(item);
    }
    if let Some(Err(e)) = last {
        assert_eq!(e.code(), ResultCode::ErrorShutdown);
    }
}

struct Forward(mpsc::UnboundedSender<Event>);

#[async_trait]
impl EventHandler for Forward {
    async fn on_event(&self, event: Event) {
        let _ = self.0.send(event);
    }
}

#[tokio::test]
async fn test_event_listener() {
    let dir = tempfile::tempdir().unwrap();
    let server = server(dir.path()).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let listener = EventListener::spawn(
        server.client().client().clone(),
        vec!["ping".into()],
        None,
        Arc::new(Forward(tx)),
    );
    let client_id = tokio::time::timeout(Duration::from_secs(5), listener.ready())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(listener.client_id(), Some(client_id));

    server.client().events().send(&Event::new("ping")).await.unwrap();
    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.name, "ping");

    listener.interrupt().await;
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_proxy_registration_is_published() {
    let dir = tempfile::tempdir().unwrap();
    let main = start(
        options(dir.path()),
        vec![rpcmux::ServiceDescriptor::proxied(common::SAMPLE_API)],
    )
    .await;
    let events = main.client().events();
    let filter = EventFilter {
        client_id: None,
        names: vec!["proxy-register".into(), "proxy-forget".into()],
    };
    let mut stream = events.listen(&filter, None).await.unwrap();
    stream.next().await.unwrap().unwrap();

    let request = rpcmux::types::api::ProxyRegisterRequest {
        names: vec!["sample".into()],
        version: "sample:1.0".into(),
        host: "127.0.0.1".into(),
        port: 4242,
    };
    let srv = main.client().srv();
    srv.proxy_register(&request).await.unwrap();
    srv.proxy_forget(&["sample".to_string()]).await.unwrap();

    let registered = next_event(&mut stream).await;
    assert_eq!(registered.name, "proxy-register");
    assert_eq!(registered.properties["port"], "4242");
    assert_eq!(next_event(&mut stream).await.name, "proxy-forget");

    main.shutdown().await.unwrap();
}
