//! Persisted rule store
//!
//! Layout under the state directory:
//!
//! ```text
//! <state_dir>/config.yaml          forward_mode
//! <state_dir>/tunnels/<name>.yaml  remote_forward_ip, forwarded_ports
//! ```
//!
//! Backends read and mutate forward rules only through this store; none of them
//! keeps its own copy.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{ForwardError, ForwardResult};

/// The globally selected forwarding strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ForwardingMode {
    #[default]
    Disabled,
    Relay,
    ProxyConfig,
    ProcessPerPort,
}

impl ForwardingMode {
    pub const ALL: [ForwardingMode; 4] = [
        ForwardingMode::Disabled,
        ForwardingMode::Relay,
        ForwardingMode::ProxyConfig,
        ForwardingMode::ProcessPerPort,
    ];

    /// Name written to `config.yaml`
    pub fn as_str(&self) -> &'static str {
        match self {
            ForwardingMode::Disabled => "none",
            ForwardingMode::Relay => "relay",
            ForwardingMode::ProxyConfig => "haproxy",
            ForwardingMode::ProcessPerPort => "socat",
        }
    }
}

impl fmt::Display for ForwardingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ForwardingMode {
    type Err = ForwardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "disabled" | "off" => Ok(ForwardingMode::Disabled),
            "relay" => Ok(ForwardingMode::Relay),
            "haproxy" | "proxy" | "proxy-config" => Ok(ForwardingMode::ProxyConfig),
            "socat" | "process" | "process-per-port" => Ok(ForwardingMode::ProcessPerPort),
            other => Err(ForwardError::Validation(format!(
                "Invalid forward mode: {}. Must be one of none, relay, haproxy, socat",
                other
            ))),
        }
    }
}

/// One local port forwarded to `remote_ip:remote_port` on the tunnel peer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ForwardRule {
    pub tunnel: String,
    pub port: u16,
    pub remote_ip: String,
    pub remote_port: u16,
}

impl ForwardRule {
    pub fn new(tunnel: impl Into<String>, port: u16, remote_ip: impl Into<String>) -> Self {
        Self {
            tunnel: tunnel.into(),
            port,
            remote_ip: remote_ip.into(),
            remote_port: port,
        }
    }

    pub fn remote(&self) -> String {
        format!("{}:{}", self.remote_ip, self.remote_port)
    }
}

/// Forwarding-related fields of one tunnel's persisted configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TunnelRecord {
    pub name: String,
    #[serde(default)]
    pub remote_forward_ip: Option<String>,
    #[serde(default)]
    pub forwarded_ports: Vec<u16>,
}

impl TunnelRecord {
    pub fn new(name: impl Into<String>, remote_ip: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            remote_forward_ip: Some(remote_ip.into()),
            forwarded_ports: Vec::new(),
        }
    }

    pub fn forwards(&self, port: u16) -> bool {
        self.forwarded_ports.contains(&port)
    }

    /// Rules for every forwarded port; empty when no remote IP is set
    pub fn rules(&self) -> Vec<ForwardRule> {
        match &self.remote_forward_ip {
            Some(ip) if !ip.is_empty() => self
                .forwarded_ports
                .iter()
                .map(|&port| ForwardRule::new(&self.name, port, ip.clone()))
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TunnelSnapshot {
    pub record: TunnelRecord,
    raw: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct GlobalRecord {
    #[serde(default)]
    forward_mode: Option<String>,
}

pub struct RuleStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl RuleStore {
    pub fn open(root: impl Into<PathBuf>) -> ForwardResult<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("tunnels"))?;
        Ok(Self {
            root,
            lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Every read and write of a tunnel goes through here, so a name can
    /// never address a file outside `tunnels/`
    fn tunnel_path(&self, name: &str) -> ForwardResult<PathBuf> {
        validate_tunnel_name(name)?;
        Ok(self.root.join("tunnels").join(format!("{}.yaml", name)))
    }

    fn global_path(&self) -> PathBuf {
        self.root.join("config.yaml")
    }

    /// Sorted tunnel names
    pub fn list_tunnels(&self) -> ForwardResult<Vec<String>> {
        let _guard = self.lock.lock();
        self.list_tunnels_locked()
    }

    fn list_tunnels_locked(&self) -> ForwardResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.root.join("tunnels"))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) if validate_tunnel_name(stem).is_ok() => names.push(stem.to_string()),
                _ => tracing::debug!(path = %path.display(), "Skipping file with invalid tunnel name"),
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn tunnel(&self, name: &str) -> ForwardResult<Option<TunnelRecord>> {
        let _guard = self.lock.lock();
        self.read_tunnel(name)
    }

    /// Like [`RuleStore::tunnel`] but a missing tunnel is an error
    pub fn require_tunnel(&self, name: &str) -> ForwardResult<TunnelRecord> {
        self.tunnel(name)?
            .ok_or_else(|| ForwardError::NotFound(format!("Tunnel {} not found", name)))
    }

    fn read_tunnel(&self, name: &str) -> ForwardResult<Option<TunnelRecord>> {
        Ok(self.read_tunnel_raw(name)?.map(|(record, _)| record))
    }

    fn read_tunnel_raw(&self, name: &str) -> ForwardResult<Option<(TunnelRecord, Vec<u8>)>> {
        let path = self.tunnel_path(name)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let raw = String::from_utf8_lossy(&bytes);
        let mut record: TunnelRecord = if raw.trim().is_empty() {
            TunnelRecord::default()
        } else {
            serde_yaml::from_str(&raw)?
        };
        // file name is authoritative
        record.name = name.to_string();
        record.forwarded_ports.sort_unstable();
        record.forwarded_ports.dedup();
        Ok(Some((record, bytes)))
    }

    /// Exact on-disk state of one tunnel, for rolling back a failed mutation
    pub fn snapshot(&self, name: &str) -> ForwardResult<TunnelSnapshot> {
        let _guard = self.lock.lock();
        let (record, raw) = self
            .read_tunnel_raw(name)?
            .ok_or_else(|| ForwardError::NotFound(format!("Tunnel {} not found", name)))?;
        Ok(TunnelSnapshot { record, raw })
    }

    pub fn all_tunnels(&self) -> ForwardResult<Vec<TunnelRecord>> {
        let _guard = self.lock.lock();
        self.all_tunnels_locked()
    }

    fn all_tunnels_locked(&self) -> ForwardResult<Vec<TunnelRecord>> {
        let mut tunnels = Vec::new();
        for name in self.list_tunnels_locked()? {
            if let Some(record) = self.read_tunnel(&name)? {
                tunnels.push(record);
            }
        }
        Ok(tunnels)
    }

    /// Every forward rule across all tunnels, ordered by tunnel then port
    pub fn all_rules(&self) -> ForwardResult<Vec<ForwardRule>> {
        Ok(self
            .all_tunnels()?
            .iter()
            .flat_map(TunnelRecord::rules)
            .collect())
    }

    /// Name of the tunnel currently claiming `port`
    pub fn owner_of(&self, port: u16) -> ForwardResult<Option<String>> {
        Ok(self
            .all_tunnels()?
            .into_iter()
            .find(|t| t.forwards(port))
            .map(|t| t.name))
    }

    fn write_tunnel(&self, record: &TunnelRecord) -> ForwardResult<()> {
        let path = self.tunnel_path(&record.name)?;
        let mut record = record.clone();
        record.forwarded_ports.sort_unstable();
        record.forwarded_ports.dedup();
        let raw = serde_yaml::to_string(&record)?;
        write_atomic(&path, raw.as_bytes())
    }

    /// Create or replace a tunnel record
    pub fn upsert_tunnel(&self, record: &TunnelRecord) -> ForwardResult<()> {
        let _guard = self.lock.lock();
        self.write_tunnel(record)
    }

    pub fn set_remote_ip(&self, name: &str, remote_ip: &str) -> ForwardResult<()> {
        if remote_ip.parse::<std::net::IpAddr>().is_err() {
            return Err(ForwardError::Validation(format!("Invalid remote forward IP: {}", remote_ip)));
        }
        let _guard = self.lock.lock();
        let mut record = self.read_tunnel(name)?.unwrap_or_else(|| TunnelRecord {
            name: name.to_string(),
            ..TunnelRecord::default()
        });
        record.remote_forward_ip = Some(remote_ip.to_string());
        self.write_tunnel(&record)
    }

    /// Claim `port` for `tunnel`.
    ///
    /// Fails with a conflict if this or any other tunnel already forwards it.
    pub fn add_port(&self, tunnel: &str, port: u16) -> ForwardResult<ForwardRule> {
        let _guard = self.lock.lock();
        let mut record = self
            .read_tunnel(tunnel)?
            .ok_or_else(|| ForwardError::NotFound(format!("Tunnel {} not found", tunnel)))?;
        let remote_ip = match &record.remote_forward_ip {
            Some(ip) if !ip.is_empty() => ip.clone(),
            _ => {
                return Err(ForwardError::Validation(format!(
                    "Remote forward IP not configured for tunnel {}",
                    tunnel
                )));
            }
        };

        for other in self.all_tunnels_locked()? {
            if other.forwards(port) {
                return Err(ForwardError::already_forwarded(port, &other.name));
            }
        }

        record.forwarded_ports.push(port);
        self.write_tunnel(&record)?;
        Ok(ForwardRule::new(tunnel, port, remote_ip))
    }

    pub fn remove_port(&self, tunnel: &str, port: u16) -> ForwardResult<()> {
        let _guard = self.lock.lock();
        let mut record = self
            .read_tunnel(tunnel)?
            .ok_or_else(|| ForwardError::NotFound(format!("Tunnel {} not found", tunnel)))?;
        if !record.forwards(port) {
            return Err(ForwardError::not_forwarded(port));
        }
        record.forwarded_ports.retain(|&p| p != port);
        self.write_tunnel(&record)
    }

    /// Put a snapshot back byte for byte
    pub fn restore(&self, snapshot: &TunnelSnapshot) -> ForwardResult<()> {
        let _guard = self.lock.lock();
        write_atomic(&self.tunnel_path(&snapshot.record.name)?, &snapshot.raw)
    }

    pub fn forward_mode(&self) -> ForwardResult<ForwardingMode> {
        let _guard = self.lock.lock();
        let raw = match fs::read_to_string(self.global_path()) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ForwardingMode::Disabled),
            Err(e) => return Err(e.into()),
        };
        if raw.trim().is_empty() {
            return Ok(ForwardingMode::Disabled);
        }
        let global: GlobalRecord = serde_yaml::from_str(&raw)?;
        Ok(global
            .forward_mode
            .and_then(|m| m.parse().ok())
            .unwrap_or(ForwardingMode::Disabled))
    }

    pub fn set_forward_mode(&self, mode: ForwardingMode) -> ForwardResult<()> {
        let _guard = self.lock.lock();
        let path = self.global_path();
        // keep unrelated keys other tools put in config.yaml
        let mut doc = match fs::read_to_string(&path) {
            Ok(raw) if !raw.trim().is_empty() => serde_yaml::from_str::<serde_yaml::Mapping>(&raw)?,
            Ok(_) => serde_yaml::Mapping::new(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => serde_yaml::Mapping::new(),
            Err(e) => return Err(e.into()),
        };
        doc.insert(
            serde_yaml::Value::from("forward_mode"),
            serde_yaml::Value::from(mode.as_str()),
        );
        let raw = serde_yaml::to_string(&doc)?;
        write_atomic(&path, raw.as_bytes())
    }
}

fn validate_tunnel_name(name: &str) -> ForwardResult<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && !name.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(ForwardError::Validation(format!("Invalid tunnel name: {:?}", name)))
    }
}

/// Write to a sibling temp file, then rename over `path`
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> ForwardResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("state");
    let temp = path.with_file_name(format!(".{}.tmp", file_name));
    fs::write(&temp, contents)?;
    if let Err(e) = fs::rename(&temp, path) {
        let _ = fs::remove_file(&temp);
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse_aliases() {
        assert_eq!("none".parse::<ForwardingMode>().unwrap(), ForwardingMode::Disabled);
        assert_eq!("HAProxy".parse::<ForwardingMode>().unwrap(), ForwardingMode::ProxyConfig);
        assert_eq!("socat".parse::<ForwardingMode>().unwrap(), ForwardingMode::ProcessPerPort);
        assert!("nginx".parse::<ForwardingMode>().is_err());
    }

    #[test]
    fn test_mode_round_trips_through_display() {
        for mode in ForwardingMode::ALL {
            assert_eq!(mode.to_string().parse::<ForwardingMode>().unwrap(), mode);
        }
    }

    #[test]
    fn test_rules_need_remote_ip() {
        let mut record = TunnelRecord::new("t1", "10.0.0.2");
        record.forwarded_ports = vec![80, 443];
        assert_eq!(record.rules().len(), 2);
        assert_eq!(record.rules()[1].remote(), "10.0.0.2:443");

        record.remote_forward_ip = None;
        assert!(record.rules().is_empty());
    }

    #[test]
    fn test_tunnel_name_validation() {
        assert!(validate_tunnel_name("tunnel-1").is_ok());
        assert!(validate_tunnel_name("../etc").is_err());
        assert!(validate_tunnel_name("").is_err());
    }
}
