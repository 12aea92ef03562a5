//! Service descriptors and the registry resolving them by name.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::dispatch::{DispatchTable, ServiceHandler};
use crate::manager::LifecycleHooks;
use crate::types::{ApiDecl, Error, Result};

/// How calls to a service are served.
#[derive(Clone)]
pub enum ServiceBinding {
    /// Served in-process.
    Local {
        handler: Arc<dyn ServiceHandler>,
        hooks: Vec<Arc<dyn LifecycleHooks>>,
    },
    /// Forwarded to the server registered through `srv.proxy_register`.
    Proxied,
}

impl fmt::Debug for ServiceBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceBinding::Local { hooks, .. } => f
                .debug_struct("Local")
                .field("hooks", &hooks.len())
                .finish_non_exhaustive(),
            ServiceBinding::Proxied => f.write_str("Proxied"),
        }
    }
}

/// Immutable description of a served API.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub name: String,
    pub min_version: u32,
    pub current_version: u32,
    /// Reported by `srv.info`, e.g. `myapp:1.2.0`.
    pub version_label: String,
    pub api: ApiDecl,
    pub binding: ServiceBinding,
}

impl ServiceDescriptor {
    pub fn local(api: ApiDecl, handler: Arc<dyn ServiceHandler>) -> Self {
        Self {
            name: api.service.to_string(),
            min_version: api.min_version,
            current_version: api.current_version,
            version_label: String::new(),
            api,
            binding: ServiceBinding::Local {
                handler,
                hooks: Vec::new(),
            },
        }
    }

    /// Local service whose handler is also its lifecycle manager.
    pub fn managed<T>(api: ApiDecl, manager: Arc<T>) -> Self
    where
        T: ServiceHandler + LifecycleHooks,
    {
        let hooks: Arc<dyn LifecycleHooks> = manager.clone();
        Self::local(api, manager).with_hooks(hooks)
    }

    pub fn proxied(api: ApiDecl) -> Self {
        Self {
            name: api.service.to_string(),
            min_version: api.min_version,
            current_version: api.current_version,
            version_label: String::new(),
            api,
            binding: ServiceBinding::Proxied,
        }
    }

    /// Attach a lifecycle manager. Ignored for proxied services, which never
    /// run local code.
    pub fn with_hooks(mut self, manager: Arc<dyn LifecycleHooks>) -> Self {
        if let ServiceBinding::Local { hooks, .. } = &mut self.binding {
            hooks.push(manager);
        }
        self
    }

    pub fn with_version_label(mut self, label: impl Into<String>) -> Self {
        self.version_label = label.into();
        self
    }

    pub fn is_proxied(&self) -> bool {
        matches!(self.binding, ServiceBinding::Proxied)
    }

    pub fn hooks(&self) -> &[Arc<dyn LifecycleHooks>] {
        match &self.binding {
            ServiceBinding::Local { hooks, .. } => hooks,
            ServiceBinding::Proxied => &[],
        }
    }
}

/// Descriptor plus its resolved dispatch table.
#[derive(Debug)]
pub struct RegisteredService {
    pub descriptor: ServiceDescriptor,
    pub table: DispatchTable,
}

#[derive(Debug, Default)]
struct Services {
    ordered: Vec<Arc<RegisteredService>>,
    by_name: HashMap<String, usize>,
}

/// Registry of every served descriptor, in registration order.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: RwLock<Services>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor. Duplicate names and inverted version ranges
    /// are configuration errors.
    pub fn register(&self, descriptor: ServiceDescriptor) -> Result<()> {
        if descriptor.name.is_empty() {
            return Err(Error::validation("service name is empty"));
        }
        if descriptor.min_version > descriptor.current_version {
            return Err(Error::validation(format!(
                "service {}: min version {} above current version {}",
                descriptor.name, descriptor.min_version, descriptor.current_version
            )));
        }

        let table = match &descriptor.binding {
            ServiceBinding::Local { handler, .. } => {
                DispatchTable::build(&descriptor.api, handler.clone().methods())?
            }
            ServiceBinding::Proxied => DispatchTable::declared(&descriptor.api),
        };

        let mut services = self.services.write();
        if services.by_name.contains_key(&descriptor.name) {
            return Err(Error::validation(format!(
                "service {} registered twice",
                descriptor.name
            )));
        }
        tracing::debug!(
            service = %descriptor.name,
            proxied = descriptor.is_proxied(),
            "registered service (api {}..={})",
            descriptor.min_version,
            descriptor.current_version
        );
        let index = services.ordered.len();
        services.by_name.insert(descriptor.name.clone(), index);
        services
            .ordered
            .push(Arc::new(RegisteredService { descriptor, table }));
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<RegisteredService>> {
        let services = self.services.read();
        services
            .by_name
            .get(name)
            .map(|&i| services.ordered[i].clone())
            .ok_or_else(|| Error::not_found(format!("unknown service: {name}")))
    }

    /// Every service, in registration order.
    pub fn all(&self) -> Vec<Arc<RegisteredService>> {
        self.services.read().ordered.clone()
    }

    pub fn len(&self) -> usize {
        self.services.read().ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::dispatch::MethodTable;
    use crate::types::{MethodSpec, ResultCode};

    const PING: &[MethodSpec] = &[MethodSpec::unary("ping")];

    struct Nothing;

    impl ServiceHandler for Nothing {
        fn methods(self: Arc<Self>) -> MethodTable {
            MethodTable::new()
        }
    }

    fn api(name: &'static str, min: u32, current: u32) -> ApiDecl {
        ApiDecl {
            service: name,
            min_version: min,
            current_version: current,
            methods: PING,
        }
    }

    #[test]
    fn test_duplicate_name_is_rejected() {
        let registry = ServiceRegistry::new();
        registry
            .register(ServiceDescriptor::local(api("a", 1, 2), Arc::new(Nothing)))
            .unwrap();
        let err = registry
            .register(ServiceDescriptor::proxied(api("a", 1, 2)))
            .unwrap_err();
        assert_eq!(err.code(), ResultCode::ErrorValidation);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_inverted_version_range_is_rejected() {
        let registry = ServiceRegistry::new();
        assert!(registry
            .register(ServiceDescriptor::proxied(api("b", 3, 2)))
            .is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_lookup_and_order() {
        let registry = ServiceRegistry::new();
        for name in ["z", "a", "m"] {
            registry
                .register(ServiceDescriptor::proxied(api(name, 1, 1)))
                .unwrap();
        }
        let names: Vec<String> = registry.all().iter().map(|s| s.descriptor.name.clone()).collect();
        assert_eq!(names, vec!["z", "a", "m"]);
        assert!(registry.lookup("m").unwrap().descriptor.is_proxied());
        assert_eq!(
            registry.lookup("nope").unwrap_err().code(),
            ResultCode::ErrorNotFound
        );
    }
}
