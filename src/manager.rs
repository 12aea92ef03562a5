//! Manager lifecycle: load/shutdown hooks and the context injected into them.
//!
//! Every local service may carry managers. The server builds one
//! [`ManagerContext`] per manager once it listens, calls every `load` hook in
//! registration order before serving, and every `shutdown` hook when it stops.

use async_trait::async_trait;
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use crate::client::{AutoClient, RpcClient};
use crate::config::static_items::RpcTunables;
use crate::config::ConfigStore;
use crate::events::EventBus;
use crate::folders::Folders;
use crate::types::api::{Filter, ProxyRegisterRequest};
use crate::types::{current_ip, Result};

/// Hooks called by the server around its serving phase.
#[async_trait]
pub trait LifecycleHooks: Send + Sync + 'static {
    /// Name used in logs and startup errors.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Called once the server listens, before it reports serving. An error
    /// aborts the startup.
    async fn load(&self, ctx: &ManagerContext) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Called once new calls are refused, before pending calls are drained.
    async fn shutdown(&self, ctx: &ManagerContext) -> Result<()> {
        let _ = ctx;
        Ok(())
    }
}

/// Runtime accessors handed to a manager.
#[derive(Debug, Clone)]
pub struct ManagerContext {
    /// Name of the service owning the manager.
    pub name: String,
    pub folders: Folders,
    /// Port the server listens on.
    pub port: u16,
    /// Client calling the server itself.
    pub client: AutoClient,
    pub config: Arc<ConfigStore>,
    pub events: Option<Arc<EventBus>>,
    lock: Arc<ReentrantMutex<()>>,
}

impl ManagerContext {
    pub(crate) fn new(
        name: impl Into<String>,
        folders: Folders,
        port: u16,
        client: AutoClient,
        config: Arc<ConfigStore>,
        events: Option<Arc<EventBus>>,
    ) -> Self {
        Self {
            name: name.into(),
            folders,
            port,
            client,
            config,
            events,
            lock: Arc::new(ReentrantMutex::new(())),
        }
    }

    /// Private lock of this manager. Reentrant, so helpers holding it may
    /// call each other; never held across an `.await`.
    pub fn lock(&self) -> ReentrantMutexGuard<'_, ()> {
        self.lock.lock()
    }

    pub fn tunables(&self) -> Result<RpcTunables> {
        RpcTunables::from_snapshot(&self.config.snapshot())
    }

    /// Folder receiving logs and debug dumps.
    pub fn logs_folder(&self) -> Result<PathBuf> {
        Ok(self.folders.logs(&self.tunables()?.logs_folder))
    }

    /// Clients to every distinct server currently registered as a proxy of
    /// one of our services.
    pub async fn proxied_servers(&self) -> Result<Vec<RpcClient>> {
        let tunables = self.tunables()?;
        let info = self.client.srv().info(&Filter::default()).await?.into_result()?;
        let targets: BTreeSet<(String, u16)> = info
            .items
            .into_iter()
            .filter(|s| s.is_proxy && s.proxy_port > 0)
            .map(|s| {
                let host = if s.proxy_host.is_empty() {
                    tunables.main_host.clone()
                } else {
                    s.proxy_host
                };
                (host, s.proxy_port)
            })
            .collect();
        Ok(targets
            .into_iter()
            .map(|(host, port)| {
                RpcClient::builder(host, port)
                    .name(format!("{}-proxied", self.name))
                    .timeout(Some(tunables.client_timeout))
                    .build()
            })
            .collect())
    }
}

/// Manager of a server whose services are proxied by a main server.
///
/// Registers the services on `rpc-main-host:rpc-main-port` at load, and
/// forgets them at shutdown.
#[derive(Debug)]
pub struct ProxiedManager {
    names: Vec<String>,
    version: String,
    use_current_host: bool,
    main: Mutex<Option<RpcClient>>,
}

impl ProxiedManager {
    pub fn new<I, S>(names: I, version: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
            version: version.into(),
            use_current_host: false,
            main: Mutex::new(None),
        }
    }

    /// Register with the local IP as seen from the main server instead of
    /// the main host name (for servers running on another host).
    pub fn with_current_host(mut self, enabled: bool) -> Self {
        self.use_current_host = enabled;
        self
    }

    pub fn is_registered(&self) -> bool {
        self.main.lock().is_some()
    }
}

#[async_trait]
impl LifecycleHooks for ProxiedManager {
    fn name(&self) -> &str {
        "proxied"
    }

    async fn load(&self, ctx: &ManagerContext) -> Result<()> {
        let tunables = ctx.tunables()?;
        let main = RpcClient::builder(tunables.main_host.clone(), tunables.main_port)
            .name(format!("{}-proxy", ctx.name))
            .timeout(Some(tunables.client_timeout))
            .build();
        let host = if self.use_current_host {
            current_ip(Some(&tunables.main_host))
        } else {
            tunables.main_host.clone()
        };
        let request = ProxyRegisterRequest {
            names: self.names.clone(),
            version: self.version.clone(),
            host,
            port: ctx.port,
        };
        main.srv().proxy_register(&request).await?.into_result()?;
        tracing::info!(
            "Registered {:?} on main server {} (proxy {}:{})",
            self.names,
            main.target(),
            request.host,
            request.port
        );
        *self.main.lock() = Some(main);
        Ok(())
    }

    async fn shutdown(&self, _ctx: &ManagerContext) -> Result<()> {
        let main = self.main.lock().take();
        if let Some(main) = main {
            main.srv().proxy_forget(&self.names).await?.into_result()?;
            tracing::info!("Forgot {:?} on main server {}", self.names, main.target());
        }
        Ok(())
    }
}
