//! Reverse-proxy config backend
//!
//! Keeps the external proxy's configuration in sync with the union of forwarded
//! ports across all tunnels:
//!
//! ```text
//! render ─► write <config>.tmp ─► proxy -c -f <tmp> ─► rename over live ─► reload
//!                                        │ fail                              │ fail
//!                                        ▼                                   ▼
//!                          live file untouched, rule reverted      restart, else revert rule + file
//! ```

pub mod render;

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use self::render::HealthCheck;
use super::{ForwardBackend, ForwardStatus};
use crate::config::{Config, ProxyConfig};
use crate::error::{ErrorKind, ForwardError, ForwardResult};
use crate::exec::{self, Termination};
use crate::probe::ListenerProbe;
use crate::store::{ForwardingMode, RuleStore, TunnelSnapshot, write_atomic};

/// Retries after signalling a launched proxy to exit
const STOP_POLL_RETRIES: u32 = 10;
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct ProxyConfigBackend {
    store: Arc<RuleStore>,
    probe: ListenerProbe,
    settings: ProxyConfig,
    health: HealthCheck,
    op_lock: tokio::sync::Mutex<()>,
    restart_pause: Duration,
}

impl ProxyConfigBackend {
    pub fn new(store: Arc<RuleStore>, config: &Config) -> Self {
        Self {
            store,
            probe: ListenerProbe::new(),
            settings: config.proxy.clone(),
            health: HealthCheck::default(),
            op_lock: tokio::sync::Mutex::new(()),
            restart_pause: config.restart_pause(),
        }
    }

    pub fn with_probe(mut self, probe: ListenerProbe) -> Self {
        self.probe = probe;
        self
    }

    pub fn config_path(&self) -> &Path {
        &self.settings.config_path
    }

    fn temp_path(&self) -> PathBuf {
        let name = self
            .settings
            .config_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("proxy.cfg");
        self.settings.config_path.with_file_name(format!("{}.tmp", name))
    }

    /// Full config for the current rule store
    pub fn render(&self) -> ForwardResult<String> {
        let tunnels = self.store.all_tunnels()?;
        Ok(render::render(&tunnels, &self.settings.stats_bind, self.health))
    }

    /// Run the proxy's own syntax check against `path`
    pub async fn validate_file(&self, path: &Path) -> ForwardResult<()> {
        let out = exec::run(
            &self.settings.binary,
            [OsStr::new("-c"), OsStr::new("-f"), path.as_os_str()],
            self.settings.command_timeout(),
        )
        .await?;
        if out.success {
            Ok(())
        } else {
            error!(diagnostic = %out.diagnostic(), "Proxy config validation failed");
            Err(ForwardError::DependencyFailure(format!(
                "Proxy config validation failed:\n{}",
                out.diagnostic()
            )))
        }
    }

    /// Validate `contents` and, if accepted, atomically replace the live file.
    ///
    /// Returns the previous live contents. On validation failure the live
    /// file is not touched.
    pub async fn commit(&self, contents: &str) -> ForwardResult<Option<String>> {
        let live = &self.settings.config_path;
        if let Some(parent) = live.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp = self.temp_path();
        fs::write(&temp, contents)?;
        if let Err(e) = self.validate_file(&temp).await {
            let _ = fs::remove_file(&temp);
            return Err(e);
        }

        let previous = match fs::read_to_string(live) {
            Ok(raw) => Some(raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                let _ = fs::remove_file(&temp);
                return Err(e.into());
            }
        };

        // one-time backup of whatever was there before we first wrote
        if previous.is_some() && !self.settings.backup_path.exists() {
            fs::copy(live, &self.settings.backup_path)?;
            info!(backup = %self.settings.backup_path.display(), "Backed up original proxy config");
        }

        if let Err(e) = fs::rename(&temp, live) {
            let _ = fs::remove_file(&temp);
            return Err(e.into());
        }
        info!(path = %live.display(), "Proxy config committed");
        Ok(previous)
    }

    fn restore_live(&self, previous: Option<String>) {
        let live = &self.settings.config_path;
        let restored = match previous {
            Some(raw) => write_atomic(live, raw.as_bytes()),
            None => fs::remove_file(live).map_err(ForwardError::from),
        };
        if let Err(e) = restored {
            warn!(error = %e, "Could not restore previous proxy config");
        }
    }

    /// Graceful reload, falling back to a full restart
    pub async fn reload(&self) -> ForwardResult<String> {
        let reload = exec::run_argv(&self.settings.reload_command, self.settings.command_timeout()).await;
        match reload {
            Ok(out) if out.success => {
                info!("Proxy reloaded");
                return Ok("reloaded".into());
            }
            Ok(out) => warn!(diagnostic = %out.diagnostic(), "Proxy reload failed, trying restart"),
            Err(e) => warn!(error = %e, "Proxy reload failed, trying restart"),
        }

        let out = exec::run_argv(&self.settings.restart_command, self.settings.restart_timeout()).await?;
        if out.success {
            info!("Proxy restarted");
            Ok("restarted".into())
        } else {
            error!(diagnostic = %out.diagnostic(), "Proxy restart failed");
            Err(ForwardError::DependencyFailure(format!(
                "Proxy reload and restart failed: {}",
                out.diagnostic()
            )))
        }
    }

    /// Regenerate, commit and reload after the store was mutated from
    /// `snapshot`. Any failure puts `snapshot` back.
    async fn apply(&self, snapshot: &TunnelSnapshot) -> ForwardResult<()> {
        let committed = match self.render() {
            Ok(rendered) => self.commit(&rendered).await,
            Err(e) => Err(e),
        };
        let previous = match committed {
            Ok(previous) => previous,
            Err(e) => {
                self.rollback(snapshot);
                return Err(e);
            }
        };

        if let Err(e) = self.reload().await {
            self.rollback(snapshot);
            self.restore_live(previous);
            return Err(e);
        }
        Ok(())
    }

    fn rollback(&self, snapshot: &TunnelSnapshot) {
        let tunnel = &snapshot.record.name;
        warn!(tunnel = %tunnel, "Rolling back forward rule change");
        if let Err(e) = self.store.restore(snapshot) {
            error!(tunnel = %tunnel, error = %e, "Rule rollback failed");
        }
    }

    fn program_name(&self) -> &str {
        Path::new(&self.settings.binary)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.settings.binary)
    }

    /// PID of a proxy we launched, if the PID file still names one.
    ///
    /// A PID file pointing at a dead process or at some other program is
    /// stale and gets removed.
    fn running_pid(&self) -> Option<u32> {
        let pid_file = &self.settings.pid_file;
        let raw = fs::read_to_string(pid_file).ok()?;
        let pid = raw.split_whitespace().next()?.parse().ok()?;
        match self.probe.process(pid).filter(|p| !p.is_zombie()) {
            Some(process) if process.runs(self.program_name()) => Some(pid),
            Some(process) => {
                warn!(
                    pid,
                    program = process.program().unwrap_or("?"),
                    expected = self.program_name(),
                    "PID file names another program, discarding it"
                );
                let _ = fs::remove_file(pid_file);
                None
            }
            None => {
                debug!(pid, "Stale proxy PID file removed");
                let _ = fs::remove_file(pid_file);
                None
            }
        }
    }

    async fn launch(&self) -> ForwardResult<()> {
        let out = exec::run(
            &self.settings.binary,
            [
                OsStr::new("-f"),
                self.settings.config_path.as_os_str(),
                OsStr::new("-p"),
                self.settings.pid_file.as_os_str(),
                OsStr::new("-D"),
            ],
            self.settings.command_timeout(),
        )
        .await?;
        if out.success {
            info!("Proxy started");
            Ok(())
        } else {
            Err(ForwardError::DependencyFailure(format!(
                "Failed to start proxy: {}",
                out.diagnostic()
            )))
        }
    }
}

#[async_trait]
impl ForwardBackend for ProxyConfigBackend {
    fn mode(&self) -> ForwardingMode {
        ForwardingMode::ProxyConfig
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

        let snapshot = self.store.snapshot(tunnel)?;
        if snapshot.record.forwards(port) {
            return Err(ForwardError::already_forwarded(port, tunnel));
        }
        if let Some(owner) = self.store.owner_of(port)? {
            return Err(ForwardError::already_forwarded(port, &owner));
        }
        if self.probe.is_listening(port) {
            return Err(ForwardError::port_in_use(port, self.probe.port_owner(port)));
        }

        let rule = self.store.add_port(tunnel, port)?;
        self.apply(&snapshot).await?;

        info!(port, tunnel, remote = %rule.remote(), "Proxy forward created");
        Ok(format!("Port forward for {} created (-> {})", port, rule.remote()))
    }

    async fn remove_forward(&self, tunnel: &str, port: u16) -> ForwardResult<String> {
        let _op = self.op_lock.lock().await;

        let snapshot = self.store.snapshot(tunnel)?;
        if !snapshot.record.forwards(port) {
            return Err(ForwardError::not_forwarded(port));
        }

        self.store.remove_port(tunnel, port)?;
        self.apply(&snapshot).await?;

        info!(port, tunnel, "Proxy forward removed");
        Ok(format!("Port forward for {} removed", port))
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
                }
                status
            })
            .collect())
    }

    async fn validate_and_reload(&self) -> ForwardResult<String> {
        let _op = self.op_lock.lock().await;
        let rendered = self.render()?;
        self.commit(&rendered).await?;
        self.reload().await?;
        Ok("Proxy configuration validated and reloaded successfully".into())
    }

    /// Rule-store state is left as is when launch or reload fails here, unlike
    /// create/remove which roll back.
    async fn start_all(&self) -> ForwardResult<String> {
        let _op = self.op_lock.lock().await;
        let rules = self.store.all_rules()?;
        if rules.is_empty() {
            return Ok("No port forwards configured across all tunnels".into());
        }

        let rendered = self.render()?;
        self.commit(&rendered).await.map_err(|e| match e.kind() {
            ErrorKind::DependencyMissing => e,
            _ => ForwardError::DependencyFailure(format!("Failed to write proxy configuration: {}", e)),
        })?;

        match self.running_pid() {
            Some(pid) => {
                info!(pid, "Proxy already running, reloading configuration");
                self.reload().await?;
            }
            None => {
                info!("Starting proxy");
                self.launch().await?;
            }
        }

        let mut ports: Vec<u16> = rules.iter().map(|r| r.port).collect();
        ports.sort_unstable();
        ports.dedup();
        let list = ports.iter().map(u16::to_string).collect::<Vec<_>>().join(", ");
        info!(ports = %list, "Proxy port forwarding started");
        Ok(format!("Proxy port forwarding started for ports: {}", list))
    }

    async fn stop_all(&self) -> ForwardResult<String> {
        let _op = self.op_lock.lock().await;
        let mut problems = Vec::new();

        match exec::run_argv(&self.settings.stop_command, self.settings.command_timeout()).await {
            Ok(out) if out.success => {}
            Ok(out) => problems.push(format!("stop command failed: {}", out.diagnostic())),
            Err(e) => problems.push(format!("stop command failed: {}", e)),
        }

        // a proxy we launched ourselves is not known to the service manager
        if let Some(pid) = self.running_pid() {
            exec::signal_pid(pid, Termination::Graceful)?;
            let mut alive = true;
            for _ in 0..STOP_POLL_RETRIES {
                tokio::time::sleep(STOP_POLL_INTERVAL).await;
                if !self.probe.is_alive(pid) {
                    alive = false;
                    break;
                }
            }
            if alive {
                exec::signal_pid(pid, Termination::Forced)?;
                tokio::time::sleep(STOP_POLL_INTERVAL).await;
                if self.probe.is_alive(pid) {
                    return Err(ForwardError::Timeout(format!("Proxy (PID {}) did not exit", pid)));
                }
            }
            let _ = fs::remove_file(&self.settings.pid_file);
            return Ok("Proxy port forwarding stopped".into());
        }

        if problems.is_empty() {
            Ok("Proxy port forwarding stopped".into())
        } else {
            Err(ForwardError::DependencyFailure(problems.join("\n")))
        }
    }
}
