//! Reverse proxy config synthesis
//!
//! The whole file is rebuilt from the rule store on every mutation. Output is
//! deterministic: tunnels by name, ports ascending.

use std::fmt::Write;
use std::time::Duration;

use crate::store::TunnelRecord;

pub const BANNER: &str = "# Reverse proxy configuration for tunnel port forwarding\n# Auto-generated - do not edit manually\n";

/// Server health checking: a target is marked down after `fall` consecutive
/// failed checks and back up after `rise` consecutive successes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthCheck {
    pub interval: Duration,
    pub fall: u32,
    pub rise: u32,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            fall: 3,
            rise: 2,
        }
    }
}

/// One frontend/backend pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySection {
    pub tunnel: String,
    pub port: u16,
    pub remote_ip: String,
}

impl ProxySection {
    pub fn frontend_name(&self) -> String {
        format!("{}_port_{}", self.tunnel, self.port)
    }

    pub fn backend_name(&self) -> String {
        format!("{}_backend_{}", self.tunnel, self.port)
    }
}

/// Sections for every forwarded port; tunnels without a remote IP are skipped
pub fn sections(tunnels: &[TunnelRecord]) -> Vec<ProxySection> {
    let mut tunnels: Vec<&TunnelRecord> = tunnels.iter().collect();
    tunnels.sort_by(|a, b| a.name.cmp(&b.name));

    let mut out = Vec::new();
    for tunnel in tunnels {
        if tunnel.forwarded_ports.is_empty() {
            tracing::debug!(tunnel = %tunnel.name, "Skipping tunnel: no forwarded ports");
            continue;
        }
        let remote_ip = match &tunnel.remote_forward_ip {
            Some(ip) if !ip.is_empty() => ip,
            _ => {
                tracing::debug!(tunnel = %tunnel.name, "Skipping tunnel: no remote forward IP");
                continue;
            }
        };
        let mut ports = tunnel.forwarded_ports.clone();
        ports.sort_unstable();
        ports.dedup();
        out.extend(ports.into_iter().map(|port| ProxySection {
            tunnel: tunnel.name.clone(),
            port,
            remote_ip: remote_ip.clone(),
        }));
    }
    out
}

pub fn render(tunnels: &[TunnelRecord], stats_bind: &str, health: HealthCheck) -> String {
    let mut config = String::with_capacity(2048);
    config.push_str(BANNER);
    config.push_str(
        "
global
    maxconn 10000
    log /dev/log local0
    log /dev/log local1 notice
    stats timeout 30s

defaults
    log     global
    mode    tcp
    option  tcplog
    option  dontlognull
    option  redispatch
    retries 3
    timeout connect 5000
    timeout client  50000
    timeout server  50000

",
    );

    // keeps at least one frontend in the file when nothing is forwarded
    let _ = write!(
        config,
        "frontend stats_frontend
    mode http
    bind {}
    stats enable
    stats uri /stats
    stats refresh 10s

",
        stats_bind
    );

    for section in sections(tunnels) {
        let _ = write!(
            config,
            "frontend {frontend}
    mode tcp
    bind 0.0.0.0:{port}
    default_backend {backend}

backend {backend}
    mode tcp
    balance roundrobin
    default-server inter {inter}s fall {fall} rise {rise}
    server remote_host_{port} {ip}:{port} check

",
            frontend = section.frontend_name(),
            backend = section.backend_name(),
            port = section.port,
            ip = section.remote_ip,
            inter = health.interval.as_secs(),
            fall = health.fall,
            rise = health.rise,
        );
    }

    config
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tunnel(name: &str, ip: Option<&str>, ports: &[u16]) -> TunnelRecord {
        TunnelRecord {
            name: name.to_string(),
            remote_forward_ip: ip.map(String::from),
            forwarded_ports: ports.to_vec(),
        }
    }

    #[test]
    fn test_sections_sorted_and_filtered() {
        let tunnels = vec![
            tunnel("b", Some("10.0.0.3"), &[443, 80]),
            tunnel("a", Some("10.0.0.2"), &[22]),
            tunnel("c", None, &[8080]),
            tunnel("d", Some("10.0.0.4"), &[]),
        ];
        let names: Vec<String> = sections(&tunnels).iter().map(|s| s.frontend_name()).collect();
        assert_eq!(names, vec!["a_port_22", "b_port_80", "b_port_443"]);
    }

    #[test]
    fn test_render_is_deterministic() {
        let one = vec![tunnel("a", Some("10.0.0.2"), &[80]), tunnel("b", Some("10.0.0.3"), &[443])];
        let two = vec![tunnel("b", Some("10.0.0.3"), &[443]), tunnel("a", Some("10.0.0.2"), &[80])];
        let health = HealthCheck::default();
        assert_eq!(
            render(&one, "127.0.0.1:9999", health),
            render(&two, "127.0.0.1:9999", health)
        );
    }

    #[test]
    fn test_render_health_check_line() {
        let out = render(&[tunnel("a", Some("10.0.0.2"), &[80])], "127.0.0.1:9999", HealthCheck::default());
        assert!(out.starts_with(BANNER));
        assert!(out.contains("bind 127.0.0.1:9999"));
        assert!(out.contains("default-server inter 10s fall 3 rise 2"));
        assert!(out.contains("server remote_host_80 10.0.0.2:80 check"));
    }
}
