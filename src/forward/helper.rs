//! Process-per-port backend
//!
//! Every forwarded port is served by its own detached helper process:
//!
//! ```text
//! socat TCP-LISTEN:<port>,fork,reuseaddr TCP:<remote_ip>:<port>
//! ```
//!
//! Helpers are found again through the process table by program name and
//! `TCP-LISTEN:<port>` argument, so they survive restarts of this process.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::{Child, Command};
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use super::{ForwardBackend, ForwardStatus, summarize_sweep};
use crate::config::{Config, HelperConfig};
use crate::error::{ForwardError, ForwardResult};
use crate::exec::{self, Termination};
use crate::probe::ListenerProbe;
use crate::store::{ForwardRule, ForwardingMode, RuleStore};

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(200);
const FORCED_STOP_SETTLE: Duration = Duration::from_millis(500);

pub struct HelperBackend {
    store: Arc<RuleStore>,
    probe: ListenerProbe,
    settings: HelperConfig,
    listen_arg: Regex,
    op_lock: tokio::sync::Mutex<()>,
    restart_pause: Duration,
}

impl HelperBackend {
    pub fn new(store: Arc<RuleStore>, config: &Config) -> ForwardResult<Self> {
        let listen_arg = Regex::new(r"^TCP6?-LISTEN:(\d+)(?:,|$)")
            .map_err(|e| ForwardError::Validation(format!("Invalid helper pattern: {}", e)))?;
        if config.helper.binary.trim().is_empty() {
            return Err(ForwardError::Validation("Helper binary must not be empty".into()));
        }

        Ok(Self {
            store,
            probe: ListenerProbe::new(),
            settings: config.helper.clone(),
            listen_arg,
            op_lock: tokio::sync::Mutex::new(()),
            restart_pause: config.restart_pause(),
        })
    }

    pub fn with_probe(mut self, probe: ListenerProbe) -> Self {
        self.probe = probe;
        self
    }

    fn program_name(&self) -> &str {
        Path::new(&self.settings.binary)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.settings.binary)
    }

    fn ensure_installed(&self) -> ForwardResult<()> {
        match exec::find_program(&self.settings.binary) {
            Some(path) => {
                debug!(path = %path.display(), "Helper binary found");
                Ok(())
            }
            None => Err(ForwardError::DependencyMissing(self.settings.binary.clone())),
        }
    }

    /// Live helper processes, optionally only the one serving `port`
    pub fn helper_pids(&self, port: Option<u16>) -> Vec<u32> {
        let program = self.program_name();
        self.probe
            .processes()
            .into_iter()
            .filter(|p| !p.is_zombie() && p.runs(program))
            .filter(|p| {
                p.cmdline.iter().skip(1).any(|arg| {
                    self.listen_arg
                        .captures(arg)
                        .and_then(|c| c[1].parse::<u16>().ok())
                        .is_some_and(|listen| port.is_none_or(|want| want == listen))
                })
            })
            .map(|p| p.pid)
            .collect()
    }

    fn spawn_helper(&self, rule: &ForwardRule) -> ForwardResult<Child> {
        let mut cmd = Command::new(&self.settings.binary);
        cmd.arg(format!("TCP-LISTEN:{},fork,reuseaddr", rule.port))
            .arg(format!("TCP:{}", rule.remote()))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // own process group: terminal signals aimed at us must not reach it
        #[cfg(unix)]
        cmd.process_group(0);

        cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ForwardError::DependencyMissing(self.settings.binary.clone()),
            _ => ForwardError::DependencyFailure(format!(
                "Failed to start {}: {}",
                self.settings.binary, e
            )),
        })
    }

    /// Launch a helper for `rule` and wait for its listener to appear
    async fn start_helper(&self, rule: &ForwardRule) -> ForwardResult<u32> {
        if self.probe.is_listening(rule.port) {
            return Err(ForwardError::port_in_use(rule.port, self.probe.port_owner(rule.port)));
        }

        let mut child = self.spawn_helper(rule)?;
        let pid = child.id().unwrap_or_default();
        let deadline = Instant::now() + self.settings.startup_wait();

        loop {
            if self.probe.is_listening(rule.port) {
                info!(port = rule.port, pid, remote = %rule.remote(), "Helper forward started");
                return Ok(pid);
            }
            if let Ok(Some(status)) = child.try_wait() {
                return Err(ForwardError::DependencyFailure(format!(
                    "{} exited early ({}) while starting forward for port {}",
                    self.program_name(),
                    status,
                    rule.port
                )));
            }
            if Instant::now() >= deadline {
                let _ = child.start_kill();
                return Err(ForwardError::DependencyFailure(format!(
                    "{} did not start listening on port {} within {}ms",
                    self.program_name(),
                    rule.port,
                    self.settings.startup_wait_ms
                )));
            }
            sleep(self.settings.poll_interval()).await;
        }
    }

    async fn wait_port_released(&self, port: u16) -> bool {
        let deadline = Instant::now() + self.settings.startup_wait();
        loop {
            if !self.probe.is_listening(port) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(self.settings.poll_interval()).await;
        }
    }

    fn signal_all(&self, pids: &[u32], how: Termination) {
        for &pid in pids {
            if let Err(e) = exec::signal_pid(pid, how) {
                warn!(pid, error = %e, "Signalling helper failed");
            }
        }
    }
}

#[async_trait]
impl ForwardBackend for HelperBackend {
    fn mode(&self) -> ForwardingMode {
        ForwardingMode::ProcessPerPort
    }

    fn accepts_ranges(&self) -> bool {
        true
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
        self.ensure_installed()?;

        let rule = ForwardRule::new(tunnel, port, remote_ip);
        let pid = self.start_helper(&rule).await?;

        if let Err(e) = self.store.add_port(tunnel, port) {
            warn!(port, pid, error = %e, "Persisting forward failed, stopping helper");
            if pid != 0 {
                let _ = exec::signal_pid(pid, Termination::Forced);
            }
            return Err(e);
        }

        Ok(format!("Port forward for {} started (-> {})", port, rule.remote()))
    }

    /// The rule is dropped only once the port is confirmed free
    async fn remove_forward(&self, tunnel: &str, port: u16) -> ForwardResult<String> {
        let _op = self.op_lock.lock().await;

        let record = self.store.require_tunnel(tunnel)?;
        if !record.forwards(port) {
            return Err(ForwardError::not_forwarded(port));
        }

        if self.probe.is_listening(port) {
            let pids = self.helper_pids(Some(port));
            if pids.is_empty() {
                let owner = self
                    .probe
                    .port_owner(port)
                    .map(|o| o.to_string())
                    .unwrap_or_else(|| "another process".into());
                return Err(ForwardError::DependencyFailure(format!(
                    "Port {} is served by {}, not by a forward helper",
                    port, owner
                )));
            }

            self.signal_all(&pids, Termination::Graceful);
            if !self.wait_port_released(port).await {
                return Err(ForwardError::Timeout(format!(
                    "Helper on port {} did not stop (PIDs: {:?})",
                    port, pids
                )));
            }
            info!(port, tunnel, "Helper forward stopped");
        } else {
            debug!(port, "Port not listening, dropping rule only");
        }

        self.store.remove_port(tunnel, port)?;
        Ok(format!("Port forward {} removed", port))
    }

    async fn list_forwards(&self) -> ForwardResult<Vec<ForwardStatus>> {
        let rules = self.store.all_rules()?;
        Ok(rules
            .iter()
            .map(|rule| {
                let active = self.probe.is_listening(rule.port);
                let mut status = ForwardStatus::from_rule(rule, active);
                if active {
                    status.owner = self.probe.port_owner(rule.port);
                    let by_helper = !self.helper_pids(Some(rule.port)).is_empty();
                    status.detail = Some(if by_helper { "Active (helper)" } else { "Active (other)" }.into());
                }
                status
            })
            .collect())
    }

    async fn validate_and_reload(&self) -> ForwardResult<String> {
        Ok("Helper forwards are managed per process, nothing to reload".into())
    }

    async fn start_all(&self) -> ForwardResult<String> {
        let _op = self.op_lock.lock().await;
        let rules = self.store.all_rules()?;
        if rules.is_empty() {
            return Ok("No port forwards configured".into());
        }
        self.ensure_installed()?;

        let mut running = 0;
        let mut errors = Vec::new();
        for rule in &rules {
            if !self.helper_pids(Some(rule.port)).is_empty() {
                debug!(port = rule.port, "Helper already running");
                running += 1;
                continue;
            }
            match self.start_helper(rule).await {
                Ok(_) => running += 1,
                Err(e) => {
                    warn!(port = rule.port, error = %e, "Helper failed to start");
                    errors.push(format!("Port {}: {}", rule.port, e));
                }
            }
        }

        summarize_sweep("Started", running, &errors)
    }

    /// SIGTERM every helper, then SIGKILL the survivors one PID at a time
    async fn stop_all(&self) -> ForwardResult<String> {
        let _op = self.op_lock.lock().await;

        let pids = self.helper_pids(None);
        if pids.is_empty() {
            return Ok("All helper forwards stopped".into());
        }
        self.signal_all(&pids, Termination::Graceful);

        for _ in 0..self.settings.stop_retries {
            sleep(STOP_POLL_INTERVAL).await;
            if self.helper_pids(None).is_empty() {
                info!(count = pids.len(), "All helper forwards stopped");
                return Ok("All helper forwards stopped".into());
            }
        }

        let survivors = self.helper_pids(None);
        warn!(pids = ?survivors, "Helpers ignored SIGTERM, killing");
        self.signal_all(&survivors, Termination::Forced);
        sleep(FORCED_STOP_SETTLE).await;

        let remaining = self.helper_pids(None);
        if remaining.is_empty() {
            Ok("All helper forwards stopped (forced)".into())
        } else {
            Err(ForwardError::DependencyFailure(format!(
                "Some helper processes failed to stop (PIDs: {:?})",
                remaining
            )))
        }
    }
}
