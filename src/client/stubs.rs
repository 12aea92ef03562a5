//! Typed stubs of the built-in services.
//!
//! Unary methods follow the client [`ErrorMode`](super::ErrorMode): non-OK
//! codes are raised as errors, or returned in [`Reply::status`].

use std::time::Duration;

use super::{CallTimeout, Reply, ReplyStream, RpcClient, Stub};
use crate::types::api::{
    ConfigSetItem, ConfigStatus, ConfigUpdate, Empty, Event, EventClients, EventFilter, EventInterrupt,
    EventStatus, Filter, LoggerConfig, LoggerStatus, LoggerUpdate, MultiServiceInfo, ProxyRegisterRequest,
    ShutdownRequest, CONFIG_API, EVENT_API, LOGGER_API, SRV_API,
};
use crate::types::{ApiDecl, Result};

fn builtin(client: &RpcClient, api: &ApiDecl) -> Stub {
    client.stub_with_version(api.service, client.version_of(api.service, api.current_version))
}

/// `srv` service.
#[derive(Debug, Clone)]
pub struct SrvStub(Stub);

impl SrvStub {
    pub async fn info(&self, filter: &Filter) -> Result<Reply<MultiServiceInfo>> {
        self.0.call("info", filter, CallTimeout::Default).await
    }

    /// Ask the server to shut down. `timeout` is the extra wait (seconds)
    /// the server observes before answering: negative for none, 0 for its
    /// configured default.
    pub async fn shutdown(&self, timeout: i64) -> Result<Reply<Empty>> {
        // The server answers after its own wait, so the client must not give up first.
        self.0
            .call("shutdown", &ShutdownRequest { timeout }, CallTimeout::Unlimited)
            .await
    }

    pub async fn proxy_register(&self, request: &ProxyRegisterRequest) -> Result<Reply<Empty>> {
        self.0.call("proxy_register", request, CallTimeout::Default).await
    }

    pub async fn proxy_forget(&self, names: &[String]) -> Result<Reply<Empty>> {
        let filter = Filter::names(names.iter().cloned());
        self.0.call("proxy_forget", &filter, CallTimeout::Default).await
    }
}

/// `config` service.
#[derive(Debug, Clone)]
pub struct ConfigStub(Stub);

impl ConfigStub {
    pub async fn get(&self, filter: &Filter) -> Result<Reply<ConfigStatus>> {
        self.0.call("get", filter, CallTimeout::Default).await
    }

    pub async fn set(&self, update: &ConfigUpdate) -> Result<Reply<ConfigStatus>> {
        self.0.call("set", update, CallTimeout::Default).await
    }

    /// Shorthand setting a single item.
    pub async fn set_one(&self, name: &str, value: &str) -> Result<Reply<ConfigStatus>> {
        let update = ConfigUpdate {
            items: vec![ConfigSetItem {
                name: name.to_string(),
                value: value.to_string(),
            }],
            ignore_unknown: false,
        };
        self.set(&update).await
    }

    pub async fn reset(&self, filter: &Filter) -> Result<Reply<ConfigStatus>> {
        self.0.call("reset", filter, CallTimeout::Default).await
    }
}

/// `log` service.
#[derive(Debug, Clone)]
pub struct LoggerStub(Stub);

impl LoggerStub {
    pub async fn get(&self, filter: &Filter) -> Result<Reply<LoggerStatus>> {
        self.0.call("get", filter, CallTimeout::Default).await
    }

    pub async fn set(&self, items: Vec<LoggerConfig>) -> Result<Reply<LoggerStatus>> {
        self.0.call("set", &LoggerUpdate { items }, CallTimeout::Default).await
    }

    pub async fn reset(&self, filter: &Filter) -> Result<Reply<LoggerStatus>> {
        self.0.call("reset", filter, CallTimeout::Default).await
    }
}

/// `events` service.
#[derive(Debug, Clone)]
pub struct EventsStub(Stub);

impl EventsStub {
    /// Open a listen stream. `connect_timeout` bounds the wait for the first
    /// chunk (which carries the allocated client id). Stream errors are
    /// always raised.
    pub async fn listen(
        &self,
        filter: &EventFilter,
        connect_timeout: Option<Duration>,
    ) -> Result<ReplyStream<EventStatus>> {
        let timeout = connect_timeout.map_or(CallTimeout::Default, CallTimeout::After);
        self.0.stream("listen", filter, timeout).await
    }

    pub async fn interrupt(&self, client_id: u32) -> Result<Reply<Empty>> {
        self.0
            .call("interrupt", &EventInterrupt { client_id }, CallTimeout::Default)
            .await
    }

    pub async fn send(&self, event: &Event) -> Result<Reply<Empty>> {
        self.0.call("send", event, CallTimeout::Default).await
    }

    pub async fn inspect(&self) -> Result<Reply<Vec<u32>>> {
        let clients: Reply<EventClients> = self.0.call("inspect", &Empty {}, CallTimeout::Default).await?;
        Ok(clients.map(|c| c.client_ids))
    }
}

impl RpcClient {
    pub fn srv(&self) -> SrvStub {
        SrvStub(builtin(self, &SRV_API))
    }

    pub fn config(&self) -> ConfigStub {
        ConfigStub(builtin(self, &CONFIG_API))
    }

    pub fn log(&self) -> LoggerStub {
        LoggerStub(builtin(self, &LOGGER_API))
    }

    pub fn events(&self) -> EventsStub {
        EventsStub(builtin(self, &EVENT_API))
    }
}
