//! `srv` service: server info, remote shutdown and proxy registration.

use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use super::dispatch::{MethodTable, ServiceHandler};
use super::ServerCore;
use crate::types::api::{Empty, Filter, MultiServiceInfo, ProxyRegisterRequest, ServiceInfo, ShutdownRequest};
use crate::types::{Error, Result};

#[derive(Debug, Default)]
pub(crate) struct SrvService {
    core: OnceLock<Weak<ServerCore>>,
}

impl SrvService {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn attach(&self, core: &Arc<ServerCore>) {
        let _ = self.core.set(Arc::downgrade(core));
    }

    fn core(&self) -> Result<Arc<ServerCore>> {
        self.core
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::shutting_down("server is gone"))
    }

    fn info(&self, filter: Filter) -> Result<MultiServiceInfo> {
        let core = self.core()?;
        let items = if filter.names.is_empty() {
            core.registry
                .all()
                .iter()
                .map(|service| core.service_info(&service.descriptor))
                .collect()
        } else {
            filter
                .names
                .iter()
                .map(|name| {
                    let service = core.registry.lookup(name)?;
                    Ok(core.service_info(&service.descriptor))
                })
                .collect::<Result<Vec<ServiceInfo>>>()?
        };
        Ok(MultiServiceInfo { items })
    }

    async fn shutdown(&self, request: ShutdownRequest) -> Result<Empty> {
        let core = self.core()?;
        let wait = match request.timeout {
            t if t > 0 => Some(Duration::from_secs(t.unsigned_abs())),
            0 => Some(core.tunables.shutdown_timeout),
            _ => None,
        };
        core.shutdown_remote(wait).await;
        Ok(Empty {})
    }

    fn proxy_register(&self, request: ProxyRegisterRequest) -> Result<Empty> {
        self.core()?.proxy.register(&request)?;
        Ok(Empty {})
    }

    fn proxy_forget(&self, request: Filter) -> Result<Empty> {
        self.core()?.proxy.forget(&request.names)?;
        Ok(Empty {})
    }
}

impl ServiceHandler for SrvService {
    fn methods(self: Arc<Self>) -> MethodTable {
        let info = self.clone();
        let shutdown = self.clone();
        let register = self.clone();
        let forget = self;
        MethodTable::new()
            .unary("info", move |req: Filter, _ctx| {
                let this = info.clone();
                async move { this.info(req) }
            })
            .unary("shutdown", move |req: ShutdownRequest, _ctx| {
                let this = shutdown.clone();
                async move { this.shutdown(req).await }
            })
            .unary("proxy_register", move |req: ProxyRegisterRequest, _ctx| {
                let this = register.clone();
                async move { this.proxy_register(req) }
            })
            .unary("proxy_forget", move |req: Filter, _ctx| {
                let this = forget.clone();
                async move { this.proxy_forget(req) }
            })
    }
}
