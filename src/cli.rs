//! Command line arguments of the server binary.

use clap::Parser;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::folders::Folders;
use crate::types::ServerOptions;

/// Default listening port.
pub const DEFAULT_PORT: u16 = 54321;

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct ServerArgs {
    /// Listening port (0 picks an ephemeral one)
    #[clap(short, long, default_value_t = DEFAULT_PORT, env = "RPC_PORT")]
    pub port: u16,

    /// Bind host
    #[clap(long, default_value = "0.0.0.0")]
    pub bind: String,

    /// Workspace folder (persisted config, proxy registrations, logs)
    #[clap(short, long, default_value = ".")]
    pub workspace: PathBuf,

    /// System folder (config shared by all users)
    #[clap(long)]
    pub system: Option<PathBuf>,

    /// User folder (config shared by all applications of the user)
    #[clap(long)]
    pub user: Option<PathBuf>,

    /// Config item override, as NAME=VALUE (repeatable)
    #[clap(short = 'c', long = "config", value_parser = parse_override)]
    pub config: Vec<(String, String)>,

    /// Don't serve the events service
    #[clap(long)]
    pub no_events: bool,

    /// Write a debug dump on SIGUSR2
    #[clap(long)]
    pub debug_signal: bool,
}

impl ServerArgs {
    pub fn folders(&self) -> Folders {
        let mut folders = Folders::new(self.workspace.clone());
        if let Some(system) = &self.system {
            folders = folders.with_system(system.clone());
        }
        if let Some(user) = &self.user {
            folders = folders.with_user(user.clone());
        }
        folders
    }

    pub fn options(&self) -> ServerOptions {
        let mut options = ServerOptions::new(self.folders());
        options.port = self.port;
        options.bind_host = self.bind.clone();
        options.cli_config = self.config.iter().cloned().collect::<BTreeMap<_, _>>();
        options.with_events = !self.no_events;
        options.with_debug_signal = self.debug_signal;
        options
    }
}

fn parse_override(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got {raw:?}"))?;
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !valid {
        return Err(format!("invalid config item name: {name:?}"));
    }
    Ok((name.to_string(), value.to_string()))
}
