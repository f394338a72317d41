//! Runtime configuration
//!
//! Loaded from a YAML file (`FORWARD_CONFIG`, default
//! `/etc/tunnel-forward/forward.yaml`). Every field has a default, so a missing
//! file yields a usable configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/tunnel-forward/forward.yaml";
pub const DEFAULT_STATE_DIR: &str = "/etc/tunnel-forward";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of the persisted rule store
    pub state_dir: PathBuf,

    /// tracing max level: error, warn, info, debug or trace
    pub log_level: String,

    /// Pause between StopAll and StartAll in RestartAll
    pub restart_pause_ms: u64,

    pub relay: RelayConfig,
    pub proxy: ProxyConfig,
    pub helper: HelperConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            log_level: "info".to_string(),
            restart_pause_ms: 1000,
            relay: RelayConfig::default(),
            proxy: ProxyConfig::default(),
            helper: HelperConfig::default(),
        }
    }
}

impl Config {
    /// Load from `FORWARD_CONFIG` (or the default path), then apply
    /// `FORWARD_STATE_DIR`.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("FORWARD_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

        let mut cfg = if path.exists() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };

        if let Ok(dir) = std::env::var("FORWARD_STATE_DIR") {
            cfg.state_dir = PathBuf::from(dir);
        }

        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> anyhow::Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn restart_pause(&self) -> Duration {
        Duration::from_millis(self.restart_pause_ms)
    }

    pub fn tracing_level(&self) -> tracing::Level {
        self.log_level.parse().unwrap_or(tracing::Level::INFO)
    }
}

/// In-process relay settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Address every relay listener binds to
    pub listen_host: String,
    pub connect_timeout_secs: u64,
    /// Read silence after which a session ends normally
    pub idle_timeout_secs: u64,
    pub chunk_size: usize,
    /// Unflushed bytes that trigger a flush of the peer stream
    pub flush_threshold: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            connect_timeout_secs: 10,
            idle_timeout_secs: 60,
            chunk_size: 64 * 1024,
            flush_threshold: 256 * 1024,
        }
    }
}

impl RelayConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// External reverse proxy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub binary: String,
    pub config_path: PathBuf,
    /// One-time copy of whatever config existed before the first generated write
    pub backup_path: PathBuf,
    pub pid_file: PathBuf,
    pub reload_command: Vec<String>,
    pub restart_command: Vec<String>,
    pub stop_command: Vec<String>,
    /// Admin statistics frontend, always present in the generated file
    pub stats_bind: String,
    pub command_timeout_secs: u64,
    pub restart_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        let argv = |s: &str| s.split_whitespace().map(String::from).collect();
        Self {
            binary: "haproxy".to_string(),
            config_path: PathBuf::from("/etc/haproxy/haproxy.cfg"),
            backup_path: PathBuf::from("/etc/haproxy/haproxy.cfg.bak"),
            pid_file: PathBuf::from("/var/run/haproxy.pid"),
            reload_command: argv("systemctl reload haproxy"),
            restart_command: argv("systemctl restart haproxy"),
            stop_command: argv("systemctl stop haproxy"),
            stats_bind: "127.0.0.1:9999".to_string(),
            command_timeout_secs: 10,
            restart_timeout_secs: 15,
        }
    }
}

impl ProxyConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn restart_timeout(&self) -> Duration {
        Duration::from_secs(self.restart_timeout_secs)
    }
}

/// Per-port helper process settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HelperConfig {
    pub binary: String,
    /// Upper bound on waiting for a freshly spawned helper to listen
    pub startup_wait_ms: u64,
    pub poll_interval_ms: u64,
    pub stop_retries: u32,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            binary: "socat".to_string(),
            startup_wait_ms: 500,
            poll_interval_ms: 100,
            stop_retries: 5,
        }
    }
}

impl HelperConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn startup_wait(&self) -> Duration {
        Duration::from_millis(self.startup_wait_ms)
    }
}
