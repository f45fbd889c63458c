//! Load relay config from file and environment.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Relay configuration. File: ~/.config/codeshare/relay.toml or /etc/codeshare/relay.toml.
/// Env overrides: CODESHARE_LISTEN_PORT, CODESHARE_MAX_SESSIONS, CODESHARE_MAX_FILE_SIZE.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// TCP listen port (default 47800).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Address to bind (default 0.0.0.0).
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,
    /// Session policy handed to the session manager.
    #[serde(default)]
    pub sessions: codeshare_core::Config,
}

fn default_listen_port() -> u16 {
    47800
}
fn default_bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            bind_addr: default_bind_addr(),
            sessions: codeshare_core::Config::default(),
        }
    }
}

impl Config {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.listen_port)
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = var("CODESHARE_LISTEN_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.listen_port = p;
    }
    if let Some(n) = var("CODESHARE_MAX_SESSIONS").and_then(|s| s.parse::<usize>().ok()) {
        c.sessions.max_sessions = n;
    }
    if let Some(n) = var("CODESHARE_MAX_FILE_SIZE").and_then(|s| s.parse::<u64>().ok()) {
        c.sessions.max_file_size = n;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/codeshare/relay.toml"));
    }
    out.push(PathBuf::from("/etc/codeshare/relay.toml"));
    out
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    let text = match std::fs::read_to_string(&path) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(path = %path.display(), "cannot read config: {}", e);
            return None;
        }
    };
    match toml::from_str::<Config>(&text) {
        Ok(c) => {
            tracing::info!(path = %path.display(), "loaded config");
            Some(c)
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), "ignoring invalid config: {}", e);
            None
        }
    }
}
