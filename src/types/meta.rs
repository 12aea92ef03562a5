//! Call metadata attached by clients to every request.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::UdpSocket;

/// Metadata describing the caller of an RPC.
///
/// `api_version` is the API version the caller was built against for the
/// target service (0 when unknown). `timeout_ms` is the remaining call budget
/// as seen by the caller; proxies forward it so the budget is preserved
/// across hops.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcMetadata {
    #[serde(default)]
    pub client: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub api_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl RpcMetadata {
    /// Metadata for a client running in the current process.
    pub fn local(client: impl Into<String>) -> Self {
        Self {
            client: client.into(),
            user: current_user(),
            host: current_host(),
            ip: current_ip(None),
            api_version: 0,
            timeout_ms: None,
        }
    }

    /// Copy of this metadata marked as relayed by a proxy.
    pub fn proxied(&self) -> Self {
        let mut out = self.clone();
        out.client = format!("{}(proxied)", self.client);
        out
    }
}

impl fmt::Display for RpcMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn or_unknown(s: &str) -> &str {
            if s.is_empty() {
                "unknown"
            } else {
                s
            }
        }
        write!(
            f,
            "[{}]{}@{}({}) api:{}",
            or_unknown(&self.client),
            or_unknown(&self.user),
            or_unknown(&self.host),
            or_unknown(&self.ip),
            self.api_version
        )
    }
}

fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default()
}

fn current_host() -> String {
    std::env::var("HOSTNAME").unwrap_or_default()
}

/// Best-effort local IP address, as seen when routing towards `target`.
///
/// Connecting a UDP socket sends no packet; it only resolves the outgoing
/// interface. Falls back to the loopback address.
pub fn current_ip(target: Option<&str>) -> String {
    let target = match target {
        Some(host) if !host.is_empty() => format!("{host}:80"),
        _ => "10.255.255.255:1".to_string(),
    };
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect(target.as_str())?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}
