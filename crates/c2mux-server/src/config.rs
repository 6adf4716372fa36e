//! Server configuration: TOML file + CLI overrides.

use crate::connection::ConnectionLimits;
use c2mux_core::{MuxError, MuxResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub beacon: BeaconSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_secs: u64,
    #[serde(default = "default_send_queue_capacity")]
    pub send_queue_capacity: usize,
    #[serde(default = "default_max_pending_calls")]
    pub max_pending_calls: usize,
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
    /// Timed-out call IDs remembered per connection. A response arriving
    /// after its ID has been pushed out is routed like any other inbound
    /// message, so a late `PING` answer is then echoed by the ping handler.
    #[serde(default = "default_expired_id_memory")]
    pub expired_id_memory: usize,
    #[serde(default = "default_gc_interval")]
    pub gc_interval_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            rpc_timeout_secs: default_rpc_timeout(),
            send_queue_capacity: default_send_queue_capacity(),
            max_pending_calls: default_max_pending_calls(),
            event_queue_capacity: default_event_queue_capacity(),
            expired_id_memory: default_expired_id_memory(),
            gc_interval_secs: default_gc_interval(),
        }
    }
}

/// `[beacon]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct BeaconSection {
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,
}

impl Default for BeaconSection {
    fn default() -> Self {
        Self {
            task_timeout_secs: default_task_timeout(),
        }
    }
}

fn default_rpc_timeout() -> u64 {
    60
}
fn default_send_queue_capacity() -> usize {
    64
}
fn default_max_pending_calls() -> usize {
    8192
}
fn default_event_queue_capacity() -> usize {
    256
}
fn default_expired_id_memory() -> usize {
    1024
}
fn default_gc_interval() -> u64 {
    60
}
fn default_task_timeout() -> u64 {
    3600
}

/// Command-line values that win over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub rpc_timeout_secs: Option<u64>,
    pub send_queue_capacity: Option<usize>,
    pub max_pending_calls: Option<usize>,
    pub gc_interval_secs: Option<u64>,
    pub beacon_task_timeout_secs: Option<u64>,
}

/// Resolved server configuration (CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub rpc_timeout: Duration,
    pub send_queue_capacity: usize,
    pub max_pending_calls: usize,
    pub event_queue_capacity: usize,
    /// See [`ServerSection::expired_id_memory`].
    pub expired_id_memory: usize,
    pub gc_interval: Duration,
    pub beacon_task_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::resolve(ConfigFile::default(), &Overrides::default())
    }
}

impl ServerConfig {
    /// Load config from a TOML file, then apply CLI overrides. A missing
    /// file means defaults.
    pub fn load(config_path: Option<&Path>, overrides: &Overrides) -> MuxResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        let config = Self::resolve(file_config, overrides);
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML text with no overrides.
    pub fn from_toml_str(content: &str) -> MuxResult<Self> {
        let config = Self::resolve(parse(content)?, &Overrides::default());
        config.validate()?;
        Ok(config)
    }

    fn resolve(file: ConfigFile, cli: &Overrides) -> Self {
        let server = file.server;
        Self {
            rpc_timeout: Duration::from_secs(cli.rpc_timeout_secs.unwrap_or(server.rpc_timeout_secs)),
            send_queue_capacity: cli.send_queue_capacity.unwrap_or(server.send_queue_capacity),
            max_pending_calls: cli.max_pending_calls.unwrap_or(server.max_pending_calls),
            event_queue_capacity: server.event_queue_capacity,
            expired_id_memory: server.expired_id_memory,
            gc_interval: Duration::from_secs(cli.gc_interval_secs.unwrap_or(server.gc_interval_secs)),
            beacon_task_timeout: Duration::from_secs(
                cli.beacon_task_timeout_secs
                    .unwrap_or(file.beacon.task_timeout_secs),
            ),
        }
    }

    fn validate(&self) -> MuxResult<()> {
        if self.send_queue_capacity == 0 {
            return Err(MuxError::Config("send_queue_capacity must be at least 1".into()));
        }
        if self.event_queue_capacity == 0 {
            return Err(MuxError::Config("event_queue_capacity must be at least 1".into()));
        }
        if self.max_pending_calls == 0 {
            return Err(MuxError::Config("max_pending_calls must be at least 1".into()));
        }
        if self.gc_interval.is_zero() {
            return Err(MuxError::Config("gc_interval_secs must be at least 1".into()));
        }
        Ok(())
    }

    pub fn connection_limits(&self) -> ConnectionLimits {
        ConnectionLimits {
            max_pending_calls: self.max_pending_calls,
            expired_id_memory: self.expired_id_memory,
        }
    }
}

fn parse(content: &str) -> MuxResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| MuxError::Config(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
