//! External command invocation with fixed timeouts

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;

use crate::error::{ForwardError, ForwardResult};

/// Captured result of a finished command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// stderr if non-empty, else stdout, else the exit code
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        match self.code {
            Some(code) => format!("exit status {}", code),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Run `program args..` to completion, bounded by `limit`.
///
/// A missing program maps to `DependencyMissing` and an overrun to `Timeout`;
/// a non-zero exit is not an error here, callers inspect `success`.
pub async fn run<I, S>(program: &str, args: I, limit: Duration) -> ForwardResult<CommandOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    tracing::trace!(program, "Running external command");

    let child = cmd.spawn().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => ForwardError::DependencyMissing(program.to_string()),
        _ => ForwardError::DependencyFailure(format!("Failed to run {}: {}", program, e)),
    })?;

    let output = timeout(limit, child.wait_with_output())
        .await
        .map_err(|_| {
            ForwardError::Timeout(format!("{} did not finish within {}s", program, limit.as_secs()))
        })??;

    Ok(CommandOutput {
        success: output.status.success(),
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Run an argv vector (`[program, args..]`) as configured
pub async fn run_argv(argv: &[String], limit: Duration) -> ForwardResult<CommandOutput> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| ForwardError::Validation("Empty command line".to_string()))?;
    run(program, args, limit).await
}

/// Resolve `program` against `PATH`; paths containing '/' are checked directly
pub fn find_program(program: &str) -> Option<PathBuf> {
    if program.contains('/') {
        let path = Path::new(program);
        return is_executable(path).then(|| path.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Signals sent to external processes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Graceful,
    Forced,
}

/// Signal one process by id; never a group or a pattern
#[cfg(unix)]
pub fn signal_pid(pid: u32, how: Termination) -> ForwardResult<()> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let sig = match how {
        Termination::Graceful => Signal::SIGTERM,
        Termination::Forced => Signal::SIGKILL,
    };
    let raw = i32::try_from(pid)
        .map_err(|_| ForwardError::Validation(format!("Invalid PID {}", pid)))?;
    match kill(Pid::from_raw(raw), sig) {
        Ok(()) => Ok(()),
        // already gone
        Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(ForwardError::DependencyFailure(format!(
            "Failed to send {} to PID {}: {}",
            sig, pid, e
        ))),
    }
}

#[cfg(not(unix))]
pub fn signal_pid(pid: u32, _how: Termination) -> ForwardResult<()> {
    Err(ForwardError::DependencyMissing(format!(
        "process signalling (PID {})",
        pid
    )))
}
