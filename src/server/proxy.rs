//! Proxy routing of services served by another server.
//!
//! Each proxied service has its own state, published through a watch channel
//! so that calls waiting for a registration wake up as soon as it lands:
//!
//! ```text
//! Unregistered ──register──► Registered ──forget──► Forgotten
//!       ▲                        │   ▲                  │
//!       │                        │   └────register──────┤
//!       │                 forward fails                 │
//!       │                        ▼                      │
//!       └──────────────────── Expired ◄─────────────────┘
//! ```
//!
//! Forgotten and Expired behave as Unregistered for callers. Registrations
//! are persisted in `<workspace>/proxy.json` and trusted on restart until a
//! forwarded call fails to reach the target.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::calls::CallContext;
use super::dispatch::CallOutput;
use crate::client::RpcClient;
use crate::events::EventBus;
use crate::folders::{read_json, write_json};
use crate::types::api::{Event, ProxyRegisterRequest};
use crate::types::{Error, MethodSpec, Result};

/// Persisted registrations, in the workspace folder.
pub const PROXY_FILE: &str = "proxy.json";

/// Where calls to a proxied service go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRegistration {
    /// Empty means `rpc-main-host`.
    pub host: String,
    pub port: u16,
    /// Version label of the remote server.
    pub version: String,
    #[serde(skip, default = "Utc::now")]
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyState {
    Unregistered,
    Registered(ProxyRegistration),
    Forgotten,
    Expired,
}

impl ProxyState {
    pub fn registration(&self) -> Option<&ProxyRegistration> {
        match self {
            ProxyState::Registered(registration) => Some(registration),
            _ => None,
        }
    }
}

impl fmt::Display for ProxyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyState::Unregistered => write!(f, "unregistered"),
            ProxyState::Registered(r) => write!(f, "registered ({}:{} {})", r.host, r.port, r.version),
            ProxyState::Forgotten => write!(f, "forgotten"),
            ProxyState::Expired => write!(f, "expired"),
        }
    }
}

/// Routing table of every proxied service.
#[derive(Debug)]
pub struct ProxyRouter {
    file: PathBuf,
    main_host: String,
    client_timeout: Duration,
    /// Every served service name, proxied or not.
    known: HashSet<String>,
    routes: BTreeMap<String, watch::Sender<ProxyState>>,
    events: Option<Arc<EventBus>>,
    /// Serializes state updates with the file write.
    persist: Mutex<()>,
}

impl ProxyRouter {
    /// Build the routes of `proxied` services, reloading persisted
    /// registrations from `workspace`.
    pub fn new(
        workspace: &Path,
        known: impl IntoIterator<Item = String>,
        proxied: impl IntoIterator<Item = String>,
        main_host: impl Into<String>,
        client_timeout: Duration,
        events: Option<Arc<EventBus>>,
    ) -> Result<Self> {
        let file = workspace.join(PROXY_FILE);
        let persisted: BTreeMap<String, ProxyRegistration> = read_json(&file)?.unwrap_or_default();

        let routes = proxied
            .into_iter()
            .map(|name| {
                let initial = match persisted.get(&name) {
                    Some(registration) if registration.port > 0 => {
                        tracing::debug!(
                            service = %name,
                            "Reloaded proxy registration {}:{}",
                            registration.host,
                            registration.port
                        );
                        ProxyState::Registered(registration.clone())
                    }
                    _ => ProxyState::Unregistered,
                };
                (name, watch::Sender::new(initial))
            })
            .collect();

        Ok(Self {
            file,
            main_host: main_host.into(),
            client_timeout,
            known: known.into_iter().collect(),
            routes,
            events,
            persist: Mutex::new(()),
        })
    }

    pub fn is_proxied(&self, name: &str) -> bool {
        self.routes.contains_key(name)
    }

    pub fn state(&self, name: &str) -> Option<ProxyState> {
        self.routes.get(name).map(|route| route.borrow().clone())
    }

    pub fn registration(&self, name: &str) -> Option<ProxyRegistration> {
        self.routes
            .get(name)
            .and_then(|route| route.borrow().registration().cloned())
    }

    fn check_names(&self, names: &[String]) -> Result<()> {
        if names.is_empty() || names.iter().any(String::is_empty) {
            return Err(Error::validation("missing input name in request"));
        }
        if let Some(unknown) = names.iter().find(|n| !self.known.contains(*n)) {
            return Err(Error::not_found(format!("unknown service: {unknown}")));
        }
        if let Some(local) = names.iter().find(|n| !self.routes.contains_key(*n)) {
            return Err(Error::validation(format!("service {local} is not a proxy")));
        }
        Ok(())
    }

    /// Route `request.names` to `request.host:request.port`.
    pub fn register(&self, request: &ProxyRegisterRequest) -> Result<()> {
        self.check_names(&request.names)?;
        if request.version.is_empty() || request.port == 0 {
            return Err(Error::validation(
                "missing input parameter in request (one of version or port)",
            ));
        }

        let registration = ProxyRegistration {
            host: request.host.clone(),
            port: request.port,
            version: request.version.clone(),
            registered_at: Utc::now(),
        };
        {
            let _guard = self.persist.lock();
            self.persist_locked(&request.names, Some(&registration))?;
            for name in &request.names {
                if let Some(route) = self.routes.get(name) {
                    route.send_replace(ProxyState::Registered(registration.clone()));
                }
            }
        }

        tracing::info!(
            "Proxy registered for {:?}: {}:{} ({})",
            request.names,
            request.host,
            request.port,
            request.version
        );
        self.emit(
            Event::new("proxy-register")
                .with_property("names", request.names.join(","))
                .with_property("host", request.host.clone())
                .with_property("port", request.port.to_string())
                .with_property("version", request.version.clone()),
        );
        Ok(())
    }

    /// Drop the registration of `names`.
    pub fn forget(&self, names: &[String]) -> Result<()> {
        self.check_names(names)?;
        {
            let _guard = self.persist.lock();
            self.persist_locked(names, None)?;
            for name in names {
                if let Some(route) = self.routes.get(name) {
                    route.send_replace(ProxyState::Forgotten);
                }
            }
        }

        tracing::info!("Proxy forgotten for {:?}", names);
        self.emit(Event::new("proxy-forget").with_property("names", names.join(",")));
        Ok(())
    }

    fn emit(&self, event: Event) {
        if let Some(bus) = &self.events {
            if let Err(e) = bus.publish(event) {
                tracing::warn!("Failed to publish proxy event: {}", e);
            }
        }
    }

    /// Write the registrations, with `names` routed to `next`. Routes are
    /// only updated once the write succeeded.
    fn persist_locked(&self, names: &[String], next: Option<&ProxyRegistration>) -> Result<()> {
        let model: BTreeMap<&str, ProxyRegistration> = self
            .routes
            .iter()
            .filter_map(|(name, route)| {
                if names.contains(name) {
                    return next.map(|registration| (name.as_str(), registration.clone()));
                }
                route
                    .borrow()
                    .registration()
                    .map(|registration| (name.as_str(), registration.clone()))
            })
            .collect();
        write_json(&self.file, &model)
    }

    /// Wait for a registration of `name`, at most the client timeout (or
    /// the caller budget if shorter).
    pub async fn resolve(&self, name: &str, budget: Option<Duration>) -> Result<ProxyRegistration> {
        let route = self
            .routes
            .get(name)
            .ok_or_else(|| Error::not_found(format!("service {name} is not a proxy")))?;
        let mut rx = route.subscribe();
        let wait = budget.map_or(self.client_timeout, |b| b.min(self.client_timeout));
        if rx.borrow().registration().is_none() {
            tracing::debug!(service = %name, "Proxy not registered yet, waiting up to {:?}", wait);
        }

        let registration = match tokio::time::timeout(wait, rx.wait_for(|s| s.registration().is_some())).await {
            Ok(Ok(state)) => state.registration().cloned(),
            _ => None,
        };
        registration.ok_or_else(|| {
            Error::proxy_unregistered(format!("proxy for service {name} didn't register in time"))
        })
    }

    /// Mark a registration unreachable, unless it was replaced meanwhile.
    pub fn expire(&self, name: &str, registration: &ProxyRegistration) {
        let Some(route) = self.routes.get(name) else {
            return;
        };
        let _guard = self.persist.lock();
        let expired = route.send_if_modified(|state| match state {
            ProxyState::Registered(current) if current == registration => {
                *state = ProxyState::Expired;
                true
            }
            _ => false,
        });
        if expired {
            tracing::warn!(
                service = %name,
                "Proxy {}:{} is unreachable, registration expired",
                registration.host,
                registration.port
            );
            if let Err(e) = self.persist_locked(&[], None) {
                tracing::error!("Failed to persist proxy registrations: {}", e);
            }
        }
    }

    /// Forward a call to the registered server, with the caller metadata
    /// and remaining budget.
    pub async fn forward(
        &self,
        ctx: &CallContext,
        spec: MethodSpec,
        body: Value,
        current_version: u32,
    ) -> Result<CallOutput> {
        let registration = self.resolve(&ctx.service, ctx.remaining()).await?;
        let host = if registration.host.is_empty() {
            self.main_host.clone()
        } else {
            registration.host.clone()
        };
        let client = RpcClient::builder(host, registration.port)
            .name(ctx.meta.client.clone())
            .build();

        let mut meta = ctx.meta.proxied();
        meta.api_version = if ctx.client_version > 0 {
            ctx.client_version
        } else {
            current_version
        };
        let timeout = ctx.remaining().or(Some(self.client_timeout));
        tracing::debug!("Forwarding {} to {}", ctx, client.target());

        let result = if spec.streaming {
            client
                .stream_raw(&ctx.service, spec.name, body, meta, timeout)
                .await
                .map(CallOutput::Stream)
        } else {
            client
                .call_raw(&ctx.service, spec.name, body, meta, timeout)
                .await
                .map(CallOutput::Unary)
        };
        if let Err(Error::Unreachable(_)) = &result {
            self.expire(&ctx.service, &registration);
        }
        result
    }
}
