//! Forwarding backends
//!
//! Three interchangeable strategies implement one contract, [`ForwardBackend`]:
//!
//! - **`relay`**: in-process listeners relaying bytes to the peer
//! - **`proxy_config`**: config synthesis and commit for an external reverse proxy
//! - **`helper`**: one external helper process per forwarded port
//!
//! Only the orchestrator knows which one is active.

pub mod helper;
pub mod proxy_config;
pub mod relay;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{ForwardResult, ProcessInfo};
use crate::ports::{BatchItem, BatchOp, BatchReport, PortToken, parse_port_spec};
use crate::store::{ForwardRule, ForwardingMode};

pub use helper::HelperBackend;
pub use proxy_config::ProxyConfigBackend;
pub use relay::RelayBackend;

/// Status of one forwarded port as reported by `list_forwards`
#[derive(Debug, Clone)]
pub struct ForwardStatus {
    pub tunnel: String,
    pub port: u16,
    pub remote: String,
    /// Whether the port is actually being served right now
    pub active: bool,
    pub active_sessions: usize,
    /// Process holding the listening socket, when resolvable
    pub owner: Option<ProcessInfo>,
    pub detail: Option<String>,
}

impl ForwardStatus {
    pub fn from_rule(rule: &ForwardRule, active: bool) -> Self {
        Self {
            tunnel: rule.tunnel.clone(),
            port: rule.port,
            remote: rule.remote(),
            active,
            active_sessions: 0,
            owner: None,
            detail: None,
        }
    }
}

impl fmt::Display for ForwardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<12} {:>5} -> {:<21} {:<8}",
            self.tunnel,
            self.port,
            self.remote,
            if self.active { "active" } else { "stopped" }
        )?;
        if self.active_sessions > 0 {
            write!(f, " sessions={}", self.active_sessions)?;
        }
        if let Some(owner) = &self.owner {
            write!(f, " [{}]", owner)?;
        }
        if let Some(detail) = &self.detail {
            write!(f, " {}", detail)?;
        }
        Ok(())
    }
}

/// Operations every forwarding backend implements.
///
/// Mutating calls on one backend instance are serialized by the backend
/// itself; callers may issue them concurrently.
#[async_trait]
pub trait ForwardBackend: Send + Sync {
    fn mode(&self) -> ForwardingMode;

    /// Whether batch specs may contain `start-end` ranges
    fn accepts_ranges(&self) -> bool;

    /// Pause between stop and start in [`ForwardBackend::restart_all`]
    fn restart_pause(&self) -> Duration {
        Duration::from_secs(1)
    }

    async fn create_forward(&self, tunnel: &str, port: u16) -> ForwardResult<String>;

    async fn remove_forward(&self, tunnel: &str, port: u16) -> ForwardResult<String>;

    async fn list_forwards(&self) -> ForwardResult<Vec<ForwardStatus>>;

    async fn validate_and_reload(&self) -> ForwardResult<String>;

    async fn start_all(&self) -> ForwardResult<String>;

    async fn stop_all(&self) -> ForwardResult<String>;

    async fn restart_all(&self) -> ForwardResult<String> {
        if let Err(e) = self.stop_all().await {
            tracing::warn!(mode = %self.mode(), error = %e, "Stop before restart was incomplete");
        }
        tokio::time::sleep(self.restart_pause()).await;
        self.start_all().await
    }

    /// Each port is created independently; failures never abort the batch
    async fn add_multiple(&self, tunnel: &str, spec: &str) -> BatchReport {
        let mut report = BatchReport::new(BatchOp::Add);
        for token in parse_port_spec(spec, self.accepts_ranges()) {
            match token {
                PortToken::Port(port) => {
                    let outcome = self.create_forward(tunnel, port).await;
                    report.push(BatchItem::for_port(port, outcome));
                }
                PortToken::Invalid { token, reason } => {
                    report.push(BatchItem::invalid(token, reason));
                }
            }
        }
        report
    }

    async fn remove_multiple(&self, tunnel: &str, spec: &str) -> BatchReport {
        let mut report = BatchReport::new(BatchOp::Remove);
        for token in parse_port_spec(spec, self.accepts_ranges()) {
            match token {
                PortToken::Port(port) => {
                    let outcome = self.remove_forward(tunnel, port).await;
                    report.push(BatchItem::for_port(port, outcome));
                }
                PortToken::Invalid { token, reason } => {
                    report.push(BatchItem::invalid(token, reason));
                }
            }
        }
        report
    }
}

/// Render aggregated per-port failures of a start/stop sweep
pub(crate) fn summarize_sweep(verb: &str, done: usize, errors: &[String]) -> ForwardResult<String> {
    if errors.is_empty() {
        Ok(format!("{} {} forward(s)", verb, done))
    } else {
        Err(crate::error::ForwardError::DependencyFailure(format!(
            "{} {} forward(s), but errors occurred:\n{}",
            verb,
            done,
            errors.join("\n")
        )))
    }
}
