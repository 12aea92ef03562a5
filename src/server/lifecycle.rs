//! Server lifecycle state machine and debug dumps.
//!
//! CREATED → LOADING → SERVING → SHUTTING_DOWN → STOPPED
//!
//! A failed load goes straight from LOADING to SHUTTING_DOWN.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tokio::sync::watch;

use super::calls::CallContext;
use super::pool::PoolStats;
use crate::types::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerState {
    Created,
    Loading,
    Serving,
    ShuttingDown,
    Stopped,
}

impl ServerState {
    /// Inbound calls are dispatched while loading (managers call their own
    /// server) and serving.
    pub fn is_accepting(self) -> bool {
        matches!(self, ServerState::Loading | ServerState::Serving)
    }

    pub fn is_terminal(self) -> bool {
        self == ServerState::Stopped
    }

    pub fn can_transition_to(self, to: ServerState) -> bool {
        matches!(
            (self, to),
            (ServerState::Created, ServerState::Loading)
                | (ServerState::Loading, ServerState::Serving)
                | (ServerState::Loading, ServerState::ShuttingDown)
                | (ServerState::Serving, ServerState::ShuttingDown)
                | (ServerState::ShuttingDown, ServerState::Stopped)
        )
    }
}

#[derive(Debug)]
pub struct LifecycleManager {
    state: watch::Sender<ServerState>,
    history: Mutex<Vec<(ServerState, DateTime<Utc>)>>,
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self {
            state: watch::Sender::new(ServerState::Created),
            history: Mutex::new(vec![(ServerState::Created, Utc::now())]),
        }
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Move to `to`; invalid transitions are rejected and leave the state
    /// untouched.
    pub fn transition(&self, to: ServerState) -> Result<()> {
        let mut from = None;
        let moved = self.state.send_if_modified(|state| {
            from = Some(*state);
            if state.can_transition_to(to) {
                *state = to;
                true
            } else {
                false
            }
        });
        if !moved {
            return Err(Error::state_transition(format!(
                "cannot move server from {:?} to {:?}",
                from.unwrap_or(to),
                to
            )));
        }
        self.history.lock().push((to, Utc::now()));
        tracing::debug!("Server state: {:?} -> {:?}", from, to);
        Ok(())
    }

    /// Enter SHUTTING_DOWN. Only the first caller gets `true`.
    pub fn begin_shutdown(&self) -> bool {
        self.transition(ServerState::ShuttingDown).is_ok()
    }

    /// Wait until the server is stopped.
    pub async fn wait_stopped(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives as long as `self`, so this only fails once we're gone.
        let _ = rx.wait_for(|s| s.is_terminal()).await;
    }

    pub fn history(&self) -> Vec<(ServerState, DateTime<Utc>)> {
        self.history.lock().clone()
    }
}

/// Write a debug dump (server state, worker pool, live calls) in `folder`.
pub fn dump_debug(
    folder: &Path,
    state: ServerState,
    pool: PoolStats,
    calls: &[CallContext],
) -> Result<PathBuf> {
    let now = Utc::now();
    let mut out = String::new();
    let _ = writeln!(out, "RPC server dump at {}", now.to_rfc3339());
    let _ = writeln!(out, "State: {:?}", state);
    let _ = writeln!(
        out,
        "Workers: {} active / {} capacity, {} queued, {} completed",
        pool.active, pool.capacity, pool.queued, pool.completed
    );
    let _ = writeln!(out, "\nPending RPC calls ({}):", calls.len());
    for call in calls {
        let _ = writeln!(out, "{call}");
    }

    std::fs::create_dir_all(folder)?;
    let path = folder.join(format!("RpcServerDump-{}.txt", now.format("%Y%m%d%H%M%S")));
    std::fs::write(&path, out)?;
    Ok(path)
}
