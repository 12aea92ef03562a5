//! Observability utilities.

use std::sync::OnceLock;
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter, Registry};

use crate::types::{Error, Result};

type FilterHandle = reload::Handle<EnvFilter, Registry>;

static TRACING_INIT: OnceLock<()> = OnceLock::new();
static FILTER: OnceLock<FilterHandle> = OnceLock::new();
static DEFAULT_DIRECTIVE: OnceLock<String> = OnceLock::new();

/// Initialize tracing subscriber once for the process.
///
/// Log format defaults to plain text and can be switched to JSON via
/// `RPCMUX_LOG_FORMAT=json`. Filter defaults to `info` if `RUST_LOG` is unset.
/// The filter stays reloadable through [`reload_filter`].
pub fn init_tracing() {
    TRACING_INIT.get_or_init(|| {
        let env_filter = EnvFilter::try_new(default_directive()).unwrap_or_else(|_| EnvFilter::new("info"));
        let (filter, handle) = reload::Layer::new(env_filter);
        let json = std::env::var("RPCMUX_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let result = if json {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .try_init()
        } else {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().compact())
                .try_init()
        };

        match result {
            Ok(()) => {
                let _ = FILTER.set(handle);
            }
            Err(err) => eprintln!("tracing init skipped: {err}"),
        }
    });
}

/// Root directive: `RUST_LOG` as set at startup, `info` otherwise.
pub fn default_directive() -> &'static str {
    DEFAULT_DIRECTIVE.get_or_init(|| {
        std::env::var(EnvFilter::DEFAULT_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "info".to_string())
    })
}

/// Replace the active filter. Returns `false` when tracing was not
/// initialized by [`init_tracing`] (the directives are still validated).
pub fn reload_filter(directives: &str) -> Result<bool> {
    let filter = EnvFilter::try_new(directives)
        .map_err(|e| Error::validation(format!("invalid log directives {directives:?}: {e}")))?;
    match FILTER.get() {
        Some(handle) => {
            handle
                .reload(filter)
                .map_err(|e| Error::internal(format!("log filter reload failed: {e}")))?;
            Ok(true)
        }
        None => Ok(false),
    }
}
