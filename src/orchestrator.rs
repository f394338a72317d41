//! Forwarding orchestrator
//!
//! Owns the process-wide forwarding mode and the one backend that serves it.
//! Every contract call is dispatched to that backend; nothing else in the crate
//! reads the mode to decide what to do.
//!
//! Mode switches run under the write half of an async `RwLock`, so no
//! operation can observe two backends at once. The old backend is stopped
//! before the new mode is persisted and before the new backend starts.

use std::fmt;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{ForwardError, ForwardResult};
use crate::forward::relay::session::{SessionSnapshot, TrafficSnapshot};
use crate::forward::{ForwardBackend, ForwardStatus, HelperBackend, ProxyConfigBackend, RelayBackend};
use crate::ports::BatchReport;
use crate::store::{ForwardingMode, RuleStore};

pub const DISABLED_MESSAGE: &str = "Port forwarding is disabled";

/// The backend serving a non-disabled mode
pub enum ActiveBackend {
    Relay(RelayBackend),
    ProxyConfig(ProxyConfigBackend),
    ProcessPerPort(HelperBackend),
}

impl ActiveBackend {
    /// `None` for [`ForwardingMode::Disabled`]
    pub fn build(mode: ForwardingMode, store: Arc<RuleStore>, config: &Config) -> ForwardResult<Option<Self>> {
        Ok(match mode {
            ForwardingMode::Disabled => None,
            ForwardingMode::Relay => Some(Self::Relay(RelayBackend::new(store, config)?)),
            ForwardingMode::ProxyConfig => Some(Self::ProxyConfig(ProxyConfigBackend::new(store, config))),
            ForwardingMode::ProcessPerPort => Some(Self::ProcessPerPort(HelperBackend::new(store, config)?)),
        })
    }

    pub fn as_backend(&self) -> &dyn ForwardBackend {
        match self {
            Self::Relay(b) => b,
            Self::ProxyConfig(b) => b,
            Self::ProcessPerPort(b) => b,
        }
    }

    pub fn mode(&self) -> ForwardingMode {
        self.as_backend().mode()
    }
}

/// Outcome of [`Forwarder::switch_mode`]
#[derive(Debug, Clone)]
pub struct ModeSwitch {
    pub from: ForwardingMode,
    pub to: ForwardingMode,
    /// Problems that did not stop the switch
    pub warnings: Vec<String>,
    /// Result message of the new backend's start, if it was started
    pub started: Option<String>,
}

impl ModeSwitch {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

impl fmt::Display for ModeSwitch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.changed() {
            return write!(f, "Forward mode is already {}", self.to);
        }
        write!(f, "Forward mode changed from {} to {}", self.from, self.to)?;
        if let Some(started) = &self.started {
            write!(f, "\n{}", started)?;
        }
        for w in &self.warnings {
            write!(f, "\nWarning: {}", w)?;
        }
        Ok(())
    }
}

pub struct Forwarder {
    store: Arc<RuleStore>,
    config: Config,
    active: RwLock<Option<ActiveBackend>>,
}

impl Forwarder {
    /// Read the persisted mode and build its backend. Nothing is started.
    pub fn init(store: Arc<RuleStore>, config: Config) -> ForwardResult<Self> {
        let mode = store.forward_mode()?;
        let active = ActiveBackend::build(mode, store.clone(), &config)?;
        info!(mode = %mode, "Forwarder initialised");
        Ok(Self {
            store,
            config,
            active: RwLock::new(active),
        })
    }

    pub fn store(&self) -> &Arc<RuleStore> {
        &self.store
    }

    pub async fn mode(&self) -> ForwardingMode {
        self.active
            .read()
            .await
            .as_ref()
            .map_or(ForwardingMode::Disabled, ActiveBackend::mode)
    }

    pub async fn create_forward(&self, tunnel: &str, port: u16) -> ForwardResult<String> {
        let guard = self.active.read().await;
        let backend = guard.as_ref().ok_or(ForwardError::Disabled)?;
        backend.as_backend().create_forward(tunnel, port).await
    }

    pub async fn remove_forward(&self, tunnel: &str, port: u16) -> ForwardResult<String> {
        let guard = self.active.read().await;
        let backend = guard.as_ref().ok_or(ForwardError::Disabled)?;
        backend.as_backend().remove_forward(tunnel, port).await
    }

    pub async fn add_multiple(&self, tunnel: &str, spec: &str) -> ForwardResult<BatchReport> {
        let guard = self.active.read().await;
        let backend = guard.as_ref().ok_or(ForwardError::Disabled)?;
        Ok(backend.as_backend().add_multiple(tunnel, spec).await)
    }

    pub async fn remove_multiple(&self, tunnel: &str, spec: &str) -> ForwardResult<BatchReport> {
        let guard = self.active.read().await;
        let backend = guard.as_ref().ok_or(ForwardError::Disabled)?;
        Ok(backend.as_backend().remove_multiple(tunnel, spec).await)
    }

    /// With forwarding disabled the persisted rules are listed as inactive
    pub async fn list_forwards(&self) -> ForwardResult<Vec<ForwardStatus>> {
        let guard = self.active.read().await;
        match guard.as_ref() {
            Some(backend) => backend.as_backend().list_forwards().await,
            None => Ok(self
                .store
                .all_rules()?
                .iter()
                .map(|rule| {
                    let mut status = ForwardStatus::from_rule(rule, false);
                    status.detail = Some("forwarding disabled".into());
                    status
                })
                .collect()),
        }
    }

    pub async fn validate_and_reload(&self) -> ForwardResult<String> {
        let guard = self.active.read().await;
        match guard.as_ref() {
            Some(backend) => backend.as_backend().validate_and_reload().await,
            None => Ok(DISABLED_MESSAGE.into()),
        }
    }

    pub async fn start_all(&self) -> ForwardResult<String> {
        let guard = self.active.read().await;
        match guard.as_ref() {
            Some(backend) => backend.as_backend().start_all().await,
            None => Ok(DISABLED_MESSAGE.into()),
        }
    }

    pub async fn stop_all(&self) -> ForwardResult<String> {
        let guard = self.active.read().await;
        match guard.as_ref() {
            Some(backend) => backend.as_backend().stop_all().await,
            None => Ok(DISABLED_MESSAGE.into()),
        }
    }

    pub async fn restart_all(&self) -> ForwardResult<String> {
        let guard = self.active.read().await;
        match guard.as_ref() {
            Some(backend) => backend.as_backend().restart_all().await,
            None => Ok(DISABLED_MESSAGE.into()),
        }
    }

    /// Live relay sessions; empty unless the relay backend is active
    pub async fn relay_sessions(&self, port: Option<u16>) -> Vec<SessionSnapshot> {
        match self.active.read().await.as_ref() {
            Some(ActiveBackend::Relay(relay)) => relay.sessions(port),
            _ => Vec::new(),
        }
    }

    pub async fn relay_stats(&self) -> Option<TrafficSnapshot> {
        match self.active.read().await.as_ref() {
            Some(ActiveBackend::Relay(relay)) => Some(relay.stats()),
            _ => None,
        }
    }

    /// Stop the current backend, persist `to`, then start the new backend.
    ///
    /// Stop failures are collected as warnings. If the new mode cannot be
    /// persisted or its backend cannot be built, the previous mode stays in
    /// effect and its forwards are started again.
    pub async fn switch_mode(&self, to: ForwardingMode) -> ForwardResult<ModeSwitch> {
        let mut guard = self.active.write().await;
        let from = guard.as_ref().map_or(ForwardingMode::Disabled, ActiveBackend::mode);

        let mut report = ModeSwitch {
            from,
            to,
            warnings: Vec::new(),
            started: None,
        };
        if from == to {
            return Ok(report);
        }

        info!(from = %from, to = %to, "Switching forward mode");

        if let Some(old) = guard.as_ref() {
            match old.as_backend().stop_all().await {
                Ok(msg) => info!(mode = %from, "{}", msg),
                Err(e) => {
                    warn!(mode = %from, error = %e, "Previous backend did not stop cleanly");
                    report.warnings.push(format!("Stopping {} forwards: {}", from, e));
                }
            }
        }

        let next = ActiveBackend::build(to, self.store.clone(), &self.config)
            .and_then(|next| self.store.set_forward_mode(to).map(|_| next));
        let next = match next {
            Ok(next) => next,
            Err(e) => {
                error!(to = %to, error = %e, "Mode switch failed, restoring previous backend");
                if let Some(old) = guard.as_ref() {
                    if let Err(restart) = old.as_backend().start_all().await {
                        warn!(mode = %from, error = %restart, "Restarting previous backend failed");
                    }
                }
                return Err(e);
            }
        };

        // old listeners are already closed; dropping releases the rest
        *guard = next;

        if let Some(new) = guard.as_ref() {
            match new.as_backend().start_all().await {
                Ok(msg) => report.started = Some(msg),
                Err(e) => {
                    warn!(mode = %to, error = %e, "New backend started with errors");
                    report.warnings.push(format!("Starting {} forwards: {}", to, e));
                }
            }
        }

        info!(from = %from, to = %to, "Forward mode switched");
        Ok(report)
    }
}
