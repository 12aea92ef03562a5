//! In-flight call tracking.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::types::RpcMetadata;

/// Context of one inbound call, alive until the call completes.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub id: Uuid,
    pub service: String,
    pub method: String,
    pub client_version: u32,
    pub meta: RpcMetadata,
    pub started_at: DateTime<Utc>,
    pub deadline: Option<Instant>,
}

impl CallContext {
    pub fn new(service: &str, method: &str, meta: RpcMetadata) -> Self {
        let deadline = meta
            .timeout_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms));
        Self {
            id: Uuid::new_v4(),
            service: service.to_string(),
            method: method.to_string(),
            client_version: meta.api_version,
            meta,
            started_at: Utc::now(),
            deadline,
        }
    }

    /// Remaining budget; `None` when the caller set no timeout.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

impl fmt::Display for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}.{} (api:{}) since {}",
            self.id,
            self.meta,
            self.service,
            self.method,
            self.client_version,
            self.started_at.to_rfc3339()
        )?;
        if let Some(remaining) = self.remaining() {
            write!(f, " remaining {:?}", remaining)?;
        }
        Ok(())
    }
}

/// Registry of live calls, readable at any time by the debug dump.
#[derive(Debug, Default)]
pub struct CallRegistry {
    calls: Mutex<HashMap<Uuid, CallContext>>,
}

/// Removes its call from the registry when dropped.
#[derive(Debug)]
pub struct CallGuard {
    id: Uuid,
    registry: Arc<CallRegistry>,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.registry.calls.lock().remove(&self.id);
    }
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(self: &Arc<Self>, ctx: &CallContext) -> CallGuard {
        self.calls.lock().insert(ctx.id, ctx.clone());
        CallGuard {
            id: ctx.id,
            registry: self.clone(),
        }
    }

    /// Live calls, oldest first.
    pub fn snapshot(&self) -> Vec<CallContext> {
        let mut calls: Vec<CallContext> = self.calls.lock().values().cloned().collect();
        calls.sort_by_key(|c| c.started_at);
        calls
    }

    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_untracks_on_drop() {
        let registry = Arc::new(CallRegistry::new());
        let ctx = CallContext::new("srv", "info", RpcMetadata::default());
        let guard = registry.track(&ctx);
        let other = registry.track(&CallContext::new("config", "get", RpcMetadata::default()));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.snapshot()[0].id, ctx.id);
        drop(guard);
        assert_eq!(registry.len(), 1);
        drop(other);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_deadline_from_metadata() {
        let meta = RpcMetadata {
            timeout_ms: Some(5_000),
            api_version: 2,
            ..Default::default()
        };
        let ctx = CallContext::new("s", "m", meta);
        assert_eq!(ctx.client_version, 2);
        let remaining = ctx.remaining().unwrap();
        assert!(remaining <= Duration::from_secs(5) && remaining > Duration::from_secs(4));
        assert!(ctx.to_string().contains("s.m (api:2)"));

        let ctx = CallContext::new("s", "m", RpcMetadata::default());
        assert!(ctx.remaining().is_none());
    }
}
