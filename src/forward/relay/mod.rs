//! In-process relay backend
//!
//! One listener per forwarded port. Every accepted connection gets an outbound
//! connection to the tunnel peer and two relay routines, one per direction.
//! No external dependency is involved.
//!
//! ```text
//!  client ──► listener :port ──► connect remote_ip:port (10s)
//!                 │
//!                 ├─ relay client->remote ─┐
//!                 └─ relay remote->client ─┴─► both done → session removed
//! ```

mod listener;
pub mod session;

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{info, warn};

use self::listener::{ListenerHandle, RelayContext};
use self::session::{RelayTuning, SessionSnapshot, SessionTable, TrafficSnapshot, TrafficStats};
use super::{ForwardBackend, ForwardStatus, summarize_sweep};
use crate::config::Config;
use crate::error::{ForwardError, ForwardResult};
use crate::probe::ListenerProbe;
use crate::store::{ForwardRule, ForwardingMode, RuleStore};

pub struct RelayBackend {
    store: Arc<RuleStore>,
    probe: ListenerProbe,
    bind_ip: IpAddr,
    ctx: Arc<RelayContext>,
    listeners: Mutex<HashMap<u16, ListenerHandle>>,
    op_lock: tokio::sync::Mutex<()>,
    restart_pause: Duration,
}

impl RelayBackend {
    pub fn new(store: Arc<RuleStore>, config: &Config) -> ForwardResult<Self> {
        let relay = &config.relay;
        let bind_ip: IpAddr = relay.listen_host.parse().map_err(|_| {
            ForwardError::Validation(format!("Invalid relay listen_host: {}", relay.listen_host))
        })?;
        if relay.chunk_size == 0 {
            return Err(ForwardError::Validation("Relay chunk_size must be positive".into()));
        }

        Ok(Self {
            store,
            probe: ListenerProbe::new(),
            bind_ip,
            ctx: Arc::new(RelayContext {
                tuning: RelayTuning {
                    chunk_size: relay.chunk_size,
                    idle_timeout: relay.idle_timeout(),
                    flush_threshold: relay.flush_threshold,
                },
                connect_timeout: relay.connect_timeout(),
                sessions: Arc::new(SessionTable::default()),
                stats: Arc::new(TrafficStats::default()),
            }),
            listeners: Mutex::new(HashMap::new()),
            op_lock: tokio::sync::Mutex::new(()),
            restart_pause: config.restart_pause(),
        })
    }

    pub fn with_probe(mut self, probe: ListenerProbe) -> Self {
        self.probe = probe;
        self
    }

    /// Live sessions, optionally for one port
    pub fn sessions(&self, port: Option<u16>) -> Vec<SessionSnapshot> {
        self.ctx.sessions.snapshot(port)
    }

    pub fn stats(&self) -> TrafficSnapshot {
        self.ctx.stats.snapshot()
    }

    /// Ports with a running listener
    pub fn listening_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.listeners.lock().keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    pub fn local_addr(&self, port: u16) -> Option<SocketAddr> {
        self.listeners.lock().get(&port).map(|h| h.local_addr)
    }

    fn is_running(&self, rule: &ForwardRule) -> bool {
        self.listeners
            .lock()
            .get(&rule.port)
            .is_some_and(|h| h.rule == *rule)
    }

    /// Bind and spawn the accept loop for `rule`
    fn start_listener(&self, rule: &ForwardRule) -> ForwardResult<ListenerHandle> {
        if let Some(existing) = self.probe.find_conflict(rule.port, self.bind_ip) {
            return Err(ForwardError::port_in_use(rule.port, self.probe.owner(&existing)));
        }

        let addr = SocketAddr::new(self.bind_ip, rule.port);
        let socket = listener::bind(addr).map_err(|e| match e.kind() {
            std::io::ErrorKind::AddrInUse => {
                ForwardError::port_in_use(rule.port, self.probe.port_owner(rule.port))
            }
            std::io::ErrorKind::PermissionDenied => ForwardError::Validation(format!(
                "Permission denied binding to {}. Ports below 1024 require elevated privileges.",
                addr
            )),
            _ => ForwardError::DependencyFailure(format!("Failed to bind to {}: {}", addr, e)),
        })?;

        Ok(listener::spawn(socket, rule.clone(), self.ctx.clone())?)
    }

    async fn stop_listener(&self, port: u16) -> ForwardResult<bool> {
        let handle = self.listeners.lock().remove(&port);
        match handle {
            Some(handle) => {
                handle.stop().await.map_err(|e| {
                    ForwardError::DependencyFailure(format!("Relay listener on {} failed: {}", port, e))
                })?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl ForwardBackend for RelayBackend {
    fn mode(&self) -> ForwardingMode {
        ForwardingMode::Relay
    }

    fn accepts_ranges(&self) -> bool {
        false
    }

    fn restart_pause(&self) -> Duration {
        self.restart_pause
    }

    async fn create_forward(&self, tunnel: &str, port: u16) -> ForwardResult<String> {
        if port == 0 {
            return Err(ForwardError::Validation("Invalid port number: 0".into()));
        }
        let _op = self.op_lock.lock().await;

        let record = self.store.require_tunnel(tunnel)?;
        if record.forwards(port) {
            return Err(ForwardError::already_forwarded(port, tunnel));
        }
        if let Some(owner) = self.store.owner_of(port)? {
            return Err(ForwardError::already_forwarded(port, &owner));
        }
        let remote_ip = record.remote_forward_ip.clone().filter(|ip| !ip.is_empty()).ok_or_else(|| {
            ForwardError::Validation(format!("Remote forward IP not configured for tunnel {}", tunnel))
        })?;

        // a listener left over from a rule removed behind our back
        self.stop_listener(port).await?;

        let rule = ForwardRule::new(tunnel, port, remote_ip);
        let handle = self.start_listener(&rule)?;

        if let Err(e) = self.store.add_port(tunnel, port) {
            warn!(port, tunnel, error = %e, "Persisting forward failed, closing listener");
            let _ = handle.stop().await;
            return Err(e);
        }
        self.listeners.lock().insert(port, handle);

        info!(port, tunnel, remote = %rule.remote(), "Relay forward created");
        Ok(format!("Port forward for {} created (-> {})", port, rule.remote()))
    }

    async fn remove_forward(&self, tunnel: &str, port: u16) -> ForwardResult<String> {
        let _op = self.op_lock.lock().await;

        let record = self.store.require_tunnel(tunnel)?;
        if !record.forwards(port) {
            return Err(ForwardError::not_forwarded(port));
        }

        self.store.remove_port(tunnel, port)?;
        if let Err(e) = self.stop_listener(port).await {
            warn!(port, error = %e, "Listener did not stop cleanly");
        }

        info!(port, tunnel, "Relay forward removed");
        Ok(format!("Port forward for {} removed", port))
    }

    async fn list_forwards(&self) -> ForwardResult<Vec<ForwardStatus>> {
        let rules = self.store.all_rules()?;
        Ok(rules
            .iter()
            .map(|rule| {
                let mut status = ForwardStatus::from_rule(rule, self.is_running(rule));
                status.active_sessions = self.ctx.sessions.count(rule.port);
                status
            })
            .collect())
    }

    /// Bring listeners in line with the store: start missing ones, close ones
    /// whose rule is gone
    async fn validate_and_reload(&self) -> ForwardResult<String> {
        let _op = self.op_lock.lock().await;
        let rules = self.store.all_rules()?;

        let stale: Vec<u16> = self
            .listeners
            .lock()
            .iter()
            .filter(|(_, h)| !rules.contains(&h.rule))
            .map(|(&port, _)| port)
            .collect();

        let mut errors = Vec::new();
        for port in &stale {
            if let Err(e) = self.stop_listener(*port).await {
                errors.push(format!("Port {}: {}", port, e));
            }
        }

        let mut started = 0;
        for rule in rules.iter().filter(|r| !self.is_running(r)) {
            match self.start_listener(rule) {
                Ok(handle) => {
                    self.listeners.lock().insert(rule.port, handle);
                    started += 1;
                }
                Err(e) => errors.push(format!("Port {}: {}", rule.port, e)),
            }
        }

        if errors.is_empty() {
            Ok(format!(
                "Relay listeners reconciled: {} started, {} stopped",
                started,
                stale.len()
            ))
        } else {
            Err(ForwardError::DependencyFailure(errors.join("\n")))
        }
    }

    async fn start_all(&self) -> ForwardResult<String> {
        let _op = self.op_lock.lock().await;
        let rules = self.store.all_rules()?;
        if rules.is_empty() {
            return Ok("No port forwards configured".into());
        }

        let mut running = 0;
        let mut errors = Vec::new();
        for rule in &rules {
            if self.is_running(rule) {
                running += 1;
                continue;
            }
            // same port, different tunnel or target
            let _ = self.stop_listener(rule.port).await;
            match self.start_listener(rule) {
                Ok(handle) => {
                    self.listeners.lock().insert(rule.port, handle);
                    running += 1;
                }
                Err(e) => {
                    warn!(port = rule.port, error = %e, "Relay listener failed to start");
                    errors.push(format!("Port {}: {}", rule.port, e));
                }
            }
        }

        summarize_sweep("Started", running, &errors)
    }

    async fn stop_all(&self) -> ForwardResult<String> {
        let _op = self.op_lock.lock().await;
        let handles: Vec<ListenerHandle> = self.listeners.lock().drain().map(|(_, h)| h).collect();
        if handles.is_empty() {
            return Ok("No port forwards running".into());
        }

        let mut stopped = 0;
        let mut errors = Vec::new();
        for handle in handles {
            let port = handle.rule.port;
            match handle.stop().await {
                Ok(()) => stopped += 1,
                Err(e) => errors.push(format!("Port {}: {}", port, e)),
            }
        }

        summarize_sweep("Stopped", stopped, &errors)
    }
}
