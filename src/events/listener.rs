//! Client-side listener of a remote `events` service.
//!
//! Keeps one listen stream open in a background task. After an error the
//! stream is resumed with the same client id (so queued events are not
//! lost), after a retry delay doubling up to one minute. An unknown id
//! (expired on the server) is replaced by a fresh one. A stream ended by the
//! server means the listener was interrupted, and the task exits.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::RpcClient;
use crate::types::api::{Event, EventFilter};
use crate::types::{Error, Result, ResultCode};

const INITIAL_RETRY: Duration = Duration::from_secs(1);
const MAX_RETRY: Duration = Duration::from_secs(60);
const JOIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Receives the events of an [`EventListener`]; keepalives are filtered out.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn on_event(&self, event: Event);
}

#[derive(Debug)]
pub struct EventListener {
    client: RpcClient,
    client_id: watch::Receiver<Option<u32>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EventListener {
    /// Start listening to `names` (all events if empty). `client_id` resumes
    /// a listener known by the server.
    pub fn spawn(
        client: RpcClient,
        names: Vec<String>,
        client_id: Option<u32>,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        let (id_tx, id_rx) = watch::channel(None);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(
            client.clone(),
            names,
            client_id,
            handler,
            id_tx,
            cancel.clone(),
        ));
        Self {
            client,
            client_id: id_rx,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// Client id allocated by the server, once connected.
    pub fn client_id(&self) -> Option<u32> {
        *self.client_id.borrow()
    }

    /// Wait for the first connection and return the client id.
    pub async fn ready(&self) -> Result<u32> {
        let mut rx = self.client_id.clone();
        let id = *rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::shutting_down("event listener stopped before connecting"))?;
        id.ok_or_else(|| Error::internal("event listener connected without client id"))
    }

    /// Interrupt the remote stream and wait for the background task.
    pub async fn interrupt(&self) {
        if let Some(id) = self.client_id() {
            if let Err(e) = self.client.events().interrupt(id).await.and_then(|r| r.into_result()) {
                tracing::debug!(client_id = id, "Remote interrupt failed: {}", e);
            }
        }
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if tokio::time::timeout(JOIN_TIMEOUT, task).await.is_err() {
                tracing::warn!("Event listener task still running after {:?}", JOIN_TIMEOUT);
            }
        }
    }
}

impl Drop for EventListener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    client: RpcClient,
    names: Vec<String>,
    mut client_id: Option<u32>,
    handler: Arc<dyn EventHandler>,
    id_tx: watch::Sender<Option<u32>>,
    cancel: CancellationToken,
) {
    let mut delay = INITIAL_RETRY;
    loop {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = listen_once(&client, &names, &mut client_id, handler.as_ref(), &id_tx, &mut delay) => outcome,
        };
        match outcome {
            Ok(()) => {
                tracing::debug!(client_id = ?client_id, "Event stream interrupted");
                break;
            }
            Err(e) if e.code() == ResultCode::ErrorNotFound && client_id.is_some() => {
                tracing::warn!(client_id = ?client_id, "Listener id unknown on {}, asking for a new one", client.target());
                client_id = None;
            }
            Err(e) => {
                tracing::warn!("Event stream on {} failed ({}), retrying in {:?}", client.target(), e, delay);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = (delay * 2).min(MAX_RETRY);
            }
        }
    }
}

async fn listen_once(
    client: &RpcClient,
    names: &[String],
    client_id: &mut Option<u32>,
    handler: &dyn EventHandler,
    id_tx: &watch::Sender<Option<u32>>,
    delay: &mut Duration,
) -> Result<()> {
    let filter = EventFilter {
        client_id: *client_id,
        names: names.to_vec(),
    };
    let mut stream = client.events().listen(&filter, None).await?;
    *delay = INITIAL_RETRY;
    while let Some(item) = stream.next().await {
        let status = item?;
        if *client_id != Some(status.client_id) {
            *client_id = Some(status.client_id);
            id_tx.send_replace(Some(status.client_id));
        }
        if let Some(event) = status.event.filter(|e| !e.is_keepalive()) {
            handler.on_event(event).await;
        }
    }
    Ok(())
}
