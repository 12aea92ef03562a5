//! RPC server: the composition root multiplexing every service behind one
//! listening endpoint.
//!
//! ```text
//!  frame ─► IpcServer ─► ServerCore::dispatch
//!                          │ registry lookup ─► CallContext ─► version negotiation
//!                          │ worker permit (held for the whole stream)
//!                          ├─► local method table
//!                          └─► ProxyRouter ─► remote server
//! ```

pub mod calls;
pub mod dispatch;
pub mod lifecycle;
pub mod pool;
pub mod proxy;
pub mod registry;
mod service;
pub mod version;

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::client::AutoClient;
use crate::config::static_items::{static_items, RpcTunables};
use crate::config::{ConfigManager, ConfigStore, Mutability};
use crate::events::{EventBus, EventBusConfig, EventsManager};
use crate::ipc::codec::WireRequest;
use crate::ipc::{DispatchResponse, Dispatcher, IpcServer};
use crate::logs::LogsManager;
use crate::manager::{LifecycleHooks, ManagerContext};
use crate::types::api::{ServiceInfo, CONFIG_API, EVENT_API, LOGGER_API, SRV_API};
use crate::types::{Error, Result, RpcMetadata, ServerOptions};

use calls::{CallContext, CallGuard, CallRegistry};
use dispatch::CallOutput;
use lifecycle::{LifecycleManager, ServerState};
use pool::{PoolStats, WorkerPermit, WorkerPool};
use proxy::{ProxyRouter, ProxyState};
use registry::{ServiceDescriptor, ServiceRegistry};
use service::SrvService;

/// Capacity of the channel relaying a stream while its worker is held.
const STREAM_BUFFER: usize = 16;

/// A manager and the context it was loaded with.
struct Managed {
    hooks: Arc<dyn LifecycleHooks>,
    ctx: ManagerContext,
}

impl fmt::Debug for Managed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Managed")
            .field("name", &self.hooks.name())
            .field("service", &self.ctx.name)
            .finish()
    }
}

#[derive(Debug)]
struct Transport {
    accept: CancellationToken,
    connections: CancellationToken,
}

/// Shared server state, also the dispatcher behind the IPC accept loop.
#[derive(Debug)]
pub(crate) struct ServerCore {
    lifecycle: LifecycleManager,
    registry: ServiceRegistry,
    config: Arc<ConfigStore>,
    tunables: RpcTunables,
    pool: WorkerPool,
    calls: Arc<CallRegistry>,
    proxy: ProxyRouter,
    events: Option<Arc<EventBus>>,
    logs_folder: PathBuf,
    transport: OnceLock<Transport>,
    managers: OnceLock<Vec<Managed>>,
    /// Cancelled once stopped; ends background tasks.
    stopped: CancellationToken,
}

impl ServerCore {
    fn service_info(&self, descriptor: &ServiceDescriptor) -> ServiceInfo {
        let registration = if descriptor.is_proxied() {
            self.proxy.registration(&descriptor.name)
        } else {
            None
        };
        ServiceInfo {
            name: descriptor.name.clone(),
            version: registration
                .as_ref()
                .map_or_else(|| descriptor.version_label.clone(), |r| r.version.clone()),
            current_api_version: descriptor.current_version,
            supported_api_version: descriptor.min_version,
            is_proxy: descriptor.is_proxied(),
            proxy_host: registration.as_ref().map(|r| r.host.clone()).unwrap_or_default(),
            proxy_port: registration.as_ref().map_or(0, |r| r.port),
        }
    }

    async fn call(&self, service: &str, method: &str, meta: RpcMetadata, body: Value) -> Result<CallOutput> {
        if !self.lifecycle.state().is_accepting() {
            return Err(Error::shutting_down("server is shutting down"));
        }
        let registered = self.registry.lookup(service)?;
        let descriptor = &registered.descriptor;
        let ctx = CallContext::new(service, method, meta);
        let resolved = registered.table.resolve(service, method)?;
        version::negotiate(descriptor.min_version, descriptor.current_version, ctx.client_version)?;

        let guard = self.calls.track(&ctx);
        let permit = self.pool.acquire().await?;
        tracing::debug!("[RPC] >>> {}", ctx);

        let output = if descriptor.is_proxied() {
            self.proxy
                .forward(&ctx, resolved.spec, body, descriptor.current_version)
                .await?
        } else {
            registered.table.invoke(method, body, ctx.clone()).await?
        };

        Ok(match output {
            CallOutput::Unary(value) => {
                tracing::debug!("[RPC] <<< {}.{} ({})", ctx.service, ctx.method, ctx.id);
                CallOutput::Unary(value)
            }
            CallOutput::Stream(rx) => CallOutput::Stream(hold_for_stream(rx, permit, guard)),
        })
    }

    fn dump_debug(&self) -> Result<PathBuf> {
        lifecycle::dump_debug(
            &self.logs_folder,
            self.lifecycle.state(),
            self.pool.stats(),
            &self.calls.snapshot(),
        )
    }

    /// Refuse new calls and run every shutdown hook. Returns the first hook
    /// error; later hooks still run.
    async fn stop_serving(&self) -> Result<()> {
        tracing::info!("Shutting down RPC server; stop accepting new requests");
        if let Some(transport) = self.transport.get() {
            transport.accept.cancel();
        }

        let mut first_error = None;
        for managed in self.managers.get().map(Vec::as_slice).unwrap_or_default() {
            if let Err(e) = managed.hooks.shutdown(&managed.ctx).await {
                tracing::error!("Error during {} manager shutdown: {}", managed.hooks.name(), e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Drain pending calls for the grace period, then stop everything.
    async fn finish_shutdown(&self) {
        let grace = self.tunables.shutdown_grace;
        if !self.pool.drain(grace).await {
            tracing::warn!(
                "{} calls still running after {:?} grace period; terminating",
                self.pool.stats().active,
                grace
            );
        }
        self.pool.close();
        if let Some(bus) = &self.events {
            bus.shutdown();
        }
        if let Some(transport) = self.transport.get() {
            transport.connections.cancel();
        }
        self.stopped.cancel();
        if let Err(e) = self.lifecycle.transition(ServerState::Stopped) {
            tracing::error!("{}", e);
        }
        tracing::info!("RPC server stopped");
    }

    async fn shutdown(&self) -> Result<()> {
        if !self.lifecycle.begin_shutdown() {
            self.lifecycle.wait_stopped().await;
            return Ok(());
        }
        let result = self.stop_serving().await;
        self.finish_shutdown().await;
        result
    }

    /// Shutdown requested through `srv.shutdown`: the reply is held for
    /// `wait`, and pending calls are drained once it is sent.
    async fn shutdown_remote(self: &Arc<Self>, wait: Option<Duration>) {
        if !self.lifecycle.begin_shutdown() {
            return;
        }
        if let Err(e) = self.stop_serving().await {
            tracing::warn!("Remote shutdown: {}", e);
        }

        let core = self.clone();
        tokio::spawn(async move {
            if let Some(wait) = wait {
                tokio::time::sleep(wait).await;
            }
            core.finish_shutdown().await;
        });
        if let Some(wait) = wait {
            tracing::warn!("!!! Will shutdown in {:?} !!!", wait);
            tokio::time::sleep(wait).await;
        }
    }
}

#[async_trait]
impl Dispatcher for ServerCore {
    async fn dispatch(&self, request: WireRequest, peer: SocketAddr) -> DispatchResponse {
        let WireRequest {
            id,
            service,
            method,
            mut meta,
            body,
        } = request;
        if meta.ip.is_empty() {
            meta.ip = peer.ip().to_string();
        }

        match self.call(&service, &method, meta, body).await {
            Ok(CallOutput::Unary(value)) => DispatchResponse::Single(Ok(value)),
            Ok(CallOutput::Stream(rx)) => DispatchResponse::Stream(rx),
            Err(e) => {
                tracing::debug!(request_id = %id, "[RPC] <<< {}.{} failed: {}", service, method, e);
                DispatchResponse::Single(Err(e))
            }
        }
    }
}

/// Relay a stream, keeping its worker and call entry until it ends.
fn hold_for_stream(
    mut rx: mpsc::Receiver<Result<Value>>,
    permit: WorkerPermit,
    guard: CallGuard,
) -> mpsc::Receiver<Result<Value>> {
    let (tx, out) = mpsc::channel(STREAM_BUFFER);
    tokio::spawn(async move {
        let _held = (permit, guard);
        loop {
            let item = tokio::select! {
                _ = tx.closed() => break,
                item = rx.recv() => item,
            };
            match item {
                Some(item) => {
                    if tx.send(item).await.is_err() {
                        break;
                    }
                }
                None => break,
            }
        }
    });
    out
}

#[cfg(unix)]
fn spawn_debug_signal(core: Arc<ServerCore>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut signals = signal(SignalKind::user_defined2())?;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = core.stopped.cancelled() => break,
                received = signals.recv() => {
                    if received.is_none() {
                        break;
                    }
                    match core.dump_debug() {
                        Ok(path) => tracing::info!("Debug dump written to {}", path.display()),
                        Err(e) => tracing::error!("Debug dump failed: {}", e),
                    }
                }
            }
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn spawn_debug_signal(_core: Arc<ServerCore>) -> Result<()> {
    Ok(())
}

/// Running RPC server. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RpcServer {
    core: Arc<ServerCore>,
    port: u16,
    client: AutoClient,
}

impl RpcServer {
    /// Start serving the built-in services (`srv`, `config`, `log`, and
    /// `events` when enabled) plus `descriptors`.
    ///
    /// Returns once every manager is loaded. A manager load error shuts the
    /// server down and is returned as [`Error::StartupHook`].
    pub async fn start(options: ServerOptions, descriptors: Vec<ServiceDescriptor>) -> Result<Self> {
        let lifecycle = LifecycleManager::new();
        lifecycle.transition(ServerState::Loading)?;

        let config = Arc::new(ConfigStore::new(options.folders.clone(), options.cli_config.clone()));
        config.register(static_items())?;
        config.register(
            options
                .static_items
                .iter()
                .cloned()
                .map(|item| item.with_mutability(Mutability::Static))
                .collect(),
        )?;
        config.register(
            options
                .user_items
                .iter()
                .cloned()
                .map(|item| item.with_mutability(Mutability::User))
                .collect(),
        )?;
        config.load()?;
        let tunables = RpcTunables::from_snapshot(&config.snapshot())?;

        let events = options.with_events.then(|| {
            Arc::new(EventBus::new(EventBusConfig {
                queue_size: tunables.event_queue_size,
                retention: tunables.event_retention,
                keepalive: tunables.event_keepalive,
            }))
        });

        let label = options.version_label.clone();
        let srv = Arc::new(SrvService::new());
        let registry = ServiceRegistry::new();
        registry.register(ServiceDescriptor::local(SRV_API, srv.clone()).with_version_label(label.clone()))?;
        registry.register(
            ServiceDescriptor::managed(CONFIG_API, Arc::new(ConfigManager::new(config.clone())))
                .with_version_label(label.clone()),
        )?;
        registry.register(
            ServiceDescriptor::managed(LOGGER_API, Arc::new(LogsManager::new(options.folders.clone())))
                .with_version_label(label.clone()),
        )?;
        if let Some(bus) = &events {
            registry.register(
                ServiceDescriptor::managed(EVENT_API, Arc::new(EventsManager::new(bus.clone())))
                    .with_version_label(label.clone()),
            )?;
        }
        for descriptor in descriptors {
            let descriptor = if descriptor.version_label.is_empty() {
                descriptor.with_version_label(label.clone())
            } else {
                descriptor
            };
            registry.register(descriptor)?;
        }

        let services = registry.all();
        let proxy = ProxyRouter::new(
            &options.folders.workspace,
            services.iter().map(|s| s.descriptor.name.clone()),
            services
                .iter()
                .filter(|s| s.descriptor.is_proxied())
                .map(|s| s.descriptor.name.clone()),
            tunables.main_host.clone(),
            tunables.client_timeout,
            events.clone(),
        )?;

        let core = Arc::new(ServerCore {
            lifecycle,
            registry,
            config: config.clone(),
            pool: WorkerPool::new(tunables.max_workers),
            calls: Arc::new(CallRegistry::new()),
            proxy,
            events: events.clone(),
            logs_folder: options.folders.logs(&tunables.logs_folder),
            tunables,
            transport: OnceLock::new(),
            managers: OnceLock::new(),
            stopped: CancellationToken::new(),
        });
        srv.attach(&core);

        let addr = format!("{}:{}", options.bind_host, options.port);
        tracing::debug!("Starting RPC server on {}", addr);
        let abort = |e: Error| {
            if let Some(bus) = &events {
                bus.shutdown();
            }
            e
        };
        let ipc = IpcServer::bind(&addr, core.clone(), options.ipc.clone())
            .await
            .map_err(|e| abort(Error::internal(format!("failed to start RPC server on {addr}: {e}"))))?;
        let port = ipc.local_addr().port();
        let transport = Transport {
            accept: ipc.accept_token(),
            connections: ipc.connection_token(),
        };
        if core.transport.set(transport).is_err() {
            return Err(abort(Error::internal("RPC server transport attached twice")));
        }

        let client = AutoClient::new(
            port,
            services.iter().map(|s| &s.descriptor),
            core.tunables.client_timeout,
        );
        let mut managers = Vec::new();
        for service in &services {
            for hooks in service.descriptor.hooks() {
                managers.push(Managed {
                    hooks: hooks.clone(),
                    ctx: ManagerContext::new(
                        service.descriptor.name.clone(),
                        options.folders.clone(),
                        port,
                        client.clone(),
                        config.clone(),
                        events.clone(),
                    ),
                });
            }
        }
        if core.managers.set(managers).is_err() {
            return Err(abort(Error::internal("RPC server managers attached twice")));
        }
        if options.with_debug_signal {
            spawn_debug_signal(core.clone()).map_err(abort)?;
        }

        tokio::spawn(async move {
            if let Err(e) = ipc.serve().await {
                tracing::error!("RPC server accept loop failed: {}", e);
            }
        });
        if let Some(bus) = &events {
            bus.spawn_sweeper();
        }

        let server = Self { core, port, client };
        for managed in server.core.managers.get().map(Vec::as_slice).unwrap_or_default() {
            tracing::debug!("Loading {} manager", managed.hooks.name());
            if let Err(e) = managed.hooks.load(&managed.ctx).await {
                tracing::error!("Error during {} manager loading: {}", managed.hooks.name(), e);
                if let Err(shutdown_error) = server.core.shutdown().await {
                    tracing::warn!("Shutdown after failed startup: {}", shutdown_error);
                }
                return Err(Error::StartupHook {
                    manager: managed.hooks.name().to_string(),
                    reason: e.to_string(),
                });
            }
        }

        server.core.lifecycle.transition(ServerState::Serving)?;
        tracing::info!("RPC server started on port {}", port);
        Ok(server)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Client bound to this server, with a stub per served service.
    pub fn client(&self) -> &AutoClient {
        &self.client
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.core.config
    }

    pub fn tunables(&self) -> &RpcTunables {
        &self.core.tunables
    }

    pub fn events(&self) -> Option<&Arc<EventBus>> {
        self.core.events.as_ref()
    }

    pub fn state(&self) -> ServerState {
        self.core.lifecycle.state()
    }

    pub fn is_running(&self) -> bool {
        !self.state().is_terminal()
    }

    /// Every state entered so far, oldest first.
    pub fn state_history(&self) -> Vec<ServerState> {
        self.core.lifecycle.history().into_iter().map(|(state, _)| state).collect()
    }

    pub fn proxy_state(&self, service: &str) -> Option<ProxyState> {
        self.core.proxy.state(service)
    }

    /// Live calls, oldest first.
    pub fn calls(&self) -> Vec<CallContext> {
        self.core.calls.snapshot()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.core.pool.stats()
    }

    /// Write a debug dump in the logging folder.
    pub fn dump_debug(&self) -> Result<PathBuf> {
        self.core.dump_debug()
    }

    /// Stop the server and wait until it is stopped. Concurrent calls all
    /// wait; only the first one runs the shutdown hooks and gets their error.
    pub async fn shutdown(&self) -> Result<()> {
        self.core.shutdown().await
    }

    /// Wait until the server is stopped, whoever triggered the shutdown.
    pub async fn wait_shutdown(&self) {
        self.core.lifecycle.wait_stopped().await;
    }
}
