//! Event bus with per-listener bounded queues.
//!
//! Each listener owns a FIFO queue fed by [`EventBus::publish`]. The queue
//! survives the listen stream: a listener that disconnects (or is
//! interrupted) can resume with its client id within the retention window
//! and receives what was queued meanwhile. Idle streams get a keepalive
//! event (empty name) every keepalive period.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::types::api::{Event, EventStatus};
use crate::types::{Error, Result};

/// Capacity of the channel between a listener pump and its stream.
const STREAM_BUFFER: usize = 16;

/// Bus tunables.
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Maximum queued events per listener; the oldest one is dropped first.
    pub queue_size: usize,
    /// How long the queue of a disconnected listener is kept.
    pub retention: Duration,
    /// Keepalive period of idle streams.
    pub keepalive: Duration,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            queue_size: 1024,
            retention: Duration::from_secs(60),
            keepalive: Duration::from_secs(5),
        }
    }
}

/// Statistics about bus usage.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct BusStats {
    pub events_published: u64,
    pub events_dropped: u64,
    pub listeners: usize,
    pub connected: usize,
}

#[derive(Debug)]
struct Listener {
    names: Vec<String>,
    queue: VecDeque<Event>,
    /// Set while a stream is attached; replaced on resume.
    stream: Option<Attached>,
    disconnected_at: Option<Instant>,
}

#[derive(Debug, Clone)]
struct Attached {
    cancel: CancellationToken,
    notify: Arc<Notify>,
}

impl Listener {
    fn accepts(&self, name: &str) -> bool {
        self.names.is_empty() || self.names.iter().any(|n| n == name)
    }

    fn detach(&mut self) {
        if let Some(attached) = self.stream.take() {
            attached.cancel.cancel();
        }
        self.disconnected_at = Some(Instant::now());
    }
}

#[derive(Debug, Default)]
struct State {
    listeners: BTreeMap<u32, Listener>,
    stats: BusStats,
}

/// Event names are non-empty and contain no space.
pub fn validate_event_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::validation("empty event name"));
    }
    if name.contains(' ') {
        return Err(Error::validation(format!("invalid event name: {name:?}")));
    }
    Ok(())
}

#[derive(Debug)]
pub struct EventBus {
    config: EventBusConfig,
    state: Mutex<State>,
    shutdown: CancellationToken,
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &EventBusConfig {
        &self.config
    }

    /// Queue an event for every interested listener. Never blocks on
    /// listeners; returns how many queues received it.
    pub fn publish(&self, mut event: Event) -> Result<usize> {
        validate_event_name(&event.name)?;
        if event.timestamp_ms == 0 {
            event.timestamp_ms = chrono::Utc::now().timestamp_millis();
        }

        let mut state = self.state.lock();
        self.purge_locked(&mut state);
        let mut delivered = 0;
        let mut dropped = 0;
        for (id, listener) in state.listeners.iter_mut() {
            if !listener.accepts(&event.name) {
                continue;
            }
            listener.queue.push_back(event.clone());
            if listener.queue.len() > self.config.queue_size {
                listener.queue.pop_front();
                dropped += 1;
                tracing::warn!(client_id = id, "event queue full, dropped oldest event");
            }
            if let Some(attached) = &listener.stream {
                attached.notify.notify_one();
            }
            delivered += 1;
        }
        state.stats.events_published += 1;
        state.stats.events_dropped += dropped;

        tracing::debug!("Published event {} to {} listeners", event.name, delivered);
        Ok(delivered)
    }

    /// Attach a stream to a listener. `client_id` resumes an existing
    /// listener (taking over any stream still attached to it); `None`
    /// allocates the smallest free id.
    ///
    /// The first item always carries the client id and no event.
    pub fn listen(
        self: &Arc<Self>,
        client_id: Option<u32>,
        names: Vec<String>,
    ) -> Result<mpsc::Receiver<Result<EventStatus>>> {
        if self.shutdown.is_cancelled() {
            return Err(Error::shutting_down("event service is shut down"));
        }
        for name in &names {
            validate_event_name(name)?;
        }

        let attached = Attached {
            cancel: self.shutdown.child_token(),
            notify: Arc::new(Notify::new()),
        };
        let client_id = {
            let mut state = self.state.lock();
            self.purge_locked(&mut state);
            let id = match client_id.filter(|&id| id > 0) {
                Some(id) => {
                    let listener = state
                        .listeners
                        .get_mut(&id)
                        .ok_or_else(|| Error::not_found(format!("unknown event listening id: {id}")))?;
                    if let Some(previous) = listener.stream.take() {
                        tracing::debug!(client_id = id, "listener resumed, previous stream taken over");
                        previous.cancel.cancel();
                    }
                    listener.names = names;
                    id
                }
                None => {
                    let id = (1..)
                        .find(|candidate| !state.listeners.contains_key(candidate))
                        .unwrap_or(u32::MAX);
                    state.listeners.insert(
                        id,
                        Listener {
                            names,
                            queue: VecDeque::new(),
                            stream: None,
                            disconnected_at: None,
                        },
                    );
                    id
                }
            };
            if let Some(listener) = state.listeners.get_mut(&id) {
                listener.stream = Some(attached.clone());
                listener.disconnected_at = None;
            }
            id
        };

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let bus = self.clone();
        tokio::spawn(async move {
            bus.pump(client_id, attached, tx).await;
        });
        Ok(rx)
    }

    async fn pump(&self, client_id: u32, attached: Attached, tx: mpsc::Sender<Result<EventStatus>>) {
        let status = |event: Option<Event>| EventStatus { client_id, event };
        if tx.send(Ok(status(None))).await.is_err() {
            self.detach_if_current(client_id, &attached);
            return;
        }

        loop {
            let next = {
                let mut state = self.state.lock();
                match state.listeners.get_mut(&client_id) {
                    Some(l) if is_current(l, &attached) => l.queue.pop_front(),
                    _ => break,
                }
            };

            if let Some(event) = next {
                tokio::select! {
                    sent = tx.send(Ok(status(Some(event.clone())))) => {
                        if sent.is_err() {
                            self.requeue(client_id, event);
                            break;
                        }
                    }
                    _ = attached.cancel.cancelled() => {
                        self.requeue(client_id, event);
                        break;
                    }
                }
                continue;
            }

            tokio::select! {
                _ = attached.notify.notified() => {}
                _ = tokio::time::sleep(self.config.keepalive) => {
                    let keepalive = Event {
                        timestamp_ms: chrono::Utc::now().timestamp_millis(),
                        ..Default::default()
                    };
                    if tx.send(Ok(status(Some(keepalive)))).await.is_err() {
                        break;
                    }
                }
                _ = attached.cancel.cancelled() => break,
                _ = tx.closed() => break,
            }
        }

        if self.shutdown.is_cancelled() {
            let _ = tx.send(Err(Error::shutting_down("event service is shut down"))).await;
        }
        self.detach_if_current(client_id, &attached);
        tracing::debug!(client_id, "event stream closed");
    }

    fn requeue(&self, client_id: u32, event: Event) {
        if let Some(listener) = self.state.lock().listeners.get_mut(&client_id) {
            listener.queue.push_front(event);
        }
    }

    fn detach_if_current(&self, client_id: u32, attached: &Attached) {
        let mut state = self.state.lock();
        if let Some(listener) = state.listeners.get_mut(&client_id) {
            if is_current(listener, attached) {
                listener.detach();
            }
        }
    }

    /// End the stream of a listener, keeping its queue for the retention
    /// window.
    pub fn interrupt(&self, client_id: u32) -> Result<()> {
        let mut state = self.state.lock();
        self.purge_locked(&mut state);
        let listener = state
            .listeners
            .get_mut(&client_id)
            .ok_or_else(|| Error::not_found(format!("unknown event listening id: {client_id}")))?;
        if listener.stream.is_some() {
            listener.detach();
            tracing::debug!(client_id, "listener interrupted");
        }
        Ok(())
    }

    /// Known listener ids.
    pub fn inspect(&self) -> Vec<u32> {
        let mut state = self.state.lock();
        self.purge_locked(&mut state);
        state.listeners.keys().copied().collect()
    }

    /// Drop listeners disconnected for longer than the retention window.
    pub fn purge_expired(&self) -> usize {
        let mut state = self.state.lock();
        self.purge_locked(&mut state)
    }

    fn purge_locked(&self, state: &mut State) -> usize {
        let retention = self.config.retention;
        let before = state.listeners.len();
        state.listeners.retain(|id, l| match l.disconnected_at {
            Some(at) if at.elapsed() >= retention => {
                tracing::debug!(client_id = id, "listener expired ({} queued events dropped)", l.queue.len());
                false
            }
            _ => true,
        });
        before - state.listeners.len()
    }

    /// Periodically purge expired listeners until shutdown.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let bus = self.clone();
        let period = (self.config.retention / 2).max(Duration::from_millis(50));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let purged = bus.purge_expired();
                        if purged > 0 {
                            tracing::debug!("event_sweeper purged {} listeners", purged);
                        }
                    }
                    _ = bus.shutdown.cancelled() => {
                        tracing::debug!("event_sweeper_stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Close every stream with a final shutdown status and refuse new ones.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn stats(&self) -> BusStats {
        let state = self.state.lock();
        let mut stats = state.stats.clone();
        stats.listeners = state.listeners.len();
        stats.connected = state.listeners.values().filter(|l| l.stream.is_some()).count();
        stats
    }
}

fn is_current(listener: &Listener, attached: &Attached) -> bool {
    listener
        .stream
        .as_ref()
        .is_some_and(|s| Arc::ptr_eq(&s.notify, &attached.notify))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResultCode;

    fn bus(retention_ms: u64, keepalive_ms: u64) -> Arc<EventBus> {
        Arc::new(EventBus::new(EventBusConfig {
            queue_size: 4,
            retention: Duration::from_millis(retention_ms),
            keepalive: Duration::from_millis(keepalive_ms),
        }))
    }

    async fn next_event(rx: &mut mpsc::Receiver<Result<EventStatus>>) -> Event {
        loop {
            let status = rx.recv().await.unwrap().unwrap();
            match status.event {
                Some(e) if !e.is_keepalive() => return e,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_first_chunk_carries_smallest_free_id() {
        let bus = bus(1000, 1000);
        let mut a = bus.listen(None, vec![]).unwrap();
        let mut b = bus.listen(None, vec![]).unwrap();
        assert_eq!(a.recv().await.unwrap().unwrap(), EventStatus { client_id: 1, event: None });
        assert_eq!(b.recv().await.unwrap().unwrap().client_id, 2);
        assert_eq!(bus.inspect(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_fifo_delivery_and_name_filter() {
        let bus = bus(1000, 1000);
        let mut rx = bus.listen(None, vec!["wanted".into()]).unwrap();
        rx.recv().await.unwrap().unwrap();

        bus.publish(Event::new("wanted").with_property("n", "1")).unwrap();
        bus.publish(Event::new("other")).unwrap();
        bus.publish(Event::new("wanted").with_property("n", "2")).unwrap();

        assert_eq!(next_event(&mut rx).await.properties["n"], "1");
        assert_eq!(next_event(&mut rx).await.properties["n"], "2");
    }

    #[tokio::test]
    async fn test_invalid_names() {
        let bus = bus(1000, 1000);
        assert_eq!(bus.publish(Event::new("")).unwrap_err().code(), ResultCode::ErrorValidation);
        assert_eq!(
            bus.publish(Event::new("two words")).unwrap_err().code(),
            ResultCode::ErrorValidation
        );
        assert!(bus.listen(None, vec!["bad name".into()]).is_err());
    }

    #[tokio::test]
    async fn test_keepalive_on_idle_stream() {
        let bus = bus(1000, 20);
        let mut rx = bus.listen(None, vec![]).unwrap();
        rx.recv().await.unwrap().unwrap();
        let status = rx.recv().await.unwrap().unwrap();
        assert!(status.event.unwrap().is_keepalive());
    }

    #[tokio::test]
    async fn test_resume_within_retention_replays_in_order() {
        let bus = bus(5_000, 1_000);
        let mut rx = bus.listen(None, vec![]).unwrap();
        let id = rx.recv().await.unwrap().unwrap().client_id;

        bus.interrupt(id).unwrap();
        assert!(rx.recv().await.is_none());

        bus.publish(Event::new("a")).unwrap();
        bus.publish(Event::new("b")).unwrap();

        let mut rx = bus.listen(Some(id), vec![]).unwrap();
        assert_eq!(rx.recv().await.unwrap().unwrap().client_id, id);
        assert_eq!(next_event(&mut rx).await.name, "a");
        assert_eq!(next_event(&mut rx).await.name, "b");
    }

    #[tokio::test]
    async fn test_queue_drops_oldest_when_full() {
        let bus = bus(5_000, 1_000);
        let mut rx = bus.listen(None, vec![]).unwrap();
        let id = rx.recv().await.unwrap().unwrap().client_id;
        bus.interrupt(id).unwrap();

        for i in 0..6 {
            bus.publish(Event::new(format!("e{i}"))).unwrap();
        }
        assert_eq!(bus.stats().events_dropped, 2);

        let mut rx = bus.listen(Some(id), vec![]).unwrap();
        rx.recv().await.unwrap().unwrap();
        assert_eq!(next_event(&mut rx).await.name, "e2");
    }

    #[tokio::test]
    async fn test_expired_listener_is_unknown() {
        let bus = bus(30, 1_000);
        let mut rx = bus.listen(None, vec![]).unwrap();
        let id = rx.recv().await.unwrap().unwrap().client_id;
        bus.interrupt(id).unwrap();
        bus.publish(Event::new("stale")).unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        let err = bus.listen(Some(id), vec![]).unwrap_err();
        assert_eq!(err.code(), ResultCode::ErrorNotFound);
        assert_eq!(bus.interrupt(id).unwrap_err().code(), ResultCode::ErrorNotFound);
        assert!(bus.inspect().is_empty());
    }

    #[tokio::test]
    async fn test_resume_takes_over_previous_stream() {
        let bus = bus(5_000, 1_000);
        let mut first = bus.listen(None, vec![]).unwrap();
        let id = first.recv().await.unwrap().unwrap().client_id;

        let mut second = bus.listen(Some(id), vec![]).unwrap();
        second.recv().await.unwrap().unwrap();
        assert!(first.recv().await.is_none());

        bus.publish(Event::new("x")).unwrap();
        assert_eq!(next_event(&mut second).await.name, "x");
    }

    #[tokio::test]
    async fn test_shutdown_sends_final_status() {
        let bus = bus(5_000, 1_000);
        let mut rx = bus.listen(None, vec![]).unwrap();
        rx.recv().await.unwrap().unwrap();
        bus.shutdown();
        let err = rx.recv().await.unwrap().unwrap_err();
        assert_eq!(err.code(), ResultCode::ErrorShutdown);
        assert!(rx.recv().await.is_none());
        assert!(bus.listen(None, vec![]).is_err());
    }
}
