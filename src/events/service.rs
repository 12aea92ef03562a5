//! `events` service over the event bus.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::bus::EventBus;
use crate::manager::{LifecycleHooks, ManagerContext};
use crate::server::dispatch::{MethodTable, ServiceHandler};
use crate::types::api::{Empty, Event, EventClients, EventFilter, EventInterrupt, EventStatus};
use crate::types::{Error, Result};

#[derive(Debug)]
pub struct EventsManager {
    bus: Arc<EventBus>,
}

impl EventsManager {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }

    fn listen(&self, filter: EventFilter) -> Result<mpsc::Receiver<Result<EventStatus>>> {
        tracing::debug!(client_id = ?filter.client_id, "listen on {:?}", filter.names);
        self.bus.listen(filter.client_id, filter.names)
    }

    fn send(&self, event: Event) -> Result<Empty> {
        self.bus.publish(event)?;
        Ok(Empty {})
    }
}

impl ServiceHandler for EventsManager {
    fn methods(self: Arc<Self>) -> MethodTable {
        let listen = self.clone();
        let interrupt = self.clone();
        let send = self.clone();
        let inspect = self;
        MethodTable::new()
            .streaming("listen", move |req: EventFilter, _ctx| {
                let result = listen.listen(req);
                async move { result }
            })
            .unary("interrupt", move |req: EventInterrupt, _ctx| {
                let result = interrupt.bus.interrupt(req.client_id).map(|()| Empty {});
                async move { result }
            })
            .unary("send", move |req: Event, _ctx| {
                let result = send.send(req);
                async move { result }
            })
            .unary("inspect", move |_req: Empty, _ctx| {
                let client_ids = inspect.bus.inspect();
                async move { Ok::<_, Error>(EventClients { client_ids }) }
            })
    }
}

#[async_trait]
impl LifecycleHooks for EventsManager {
    fn name(&self) -> &str {
        "events"
    }

    async fn shutdown(&self, _ctx: &ManagerContext) -> Result<()> {
        self.bus.shutdown();
        Ok(())
    }
}
