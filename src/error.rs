//! Error types for the forwarding control plane.
//!
//! Every failure here is per-operation: it is reported to the caller and never
//! takes the hosting process down.

use std::fmt;

use thiserror::Error;

/// A process found holding a listening socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: Option<String>,
}

impl fmt::Display for ProcessInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} (PID: {})", name, self.pid),
            None => write!(f, "PID: {}", self.pid),
        }
    }
}

/// Broad class of a [`ForwardError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    DependencyMissing,
    DependencyFailure,
    Timeout,
    NotFound,
    Disabled,
    Store,
    Io,
}

#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("{0}")]
    Validation(String),

    #[error("Port {port} {reason}")]
    Conflict {
        port: u16,
        reason: String,
        owner: Option<ProcessInfo>,
    },

    #[error("{0} is not installed")]
    DependencyMissing(String),

    #[error("{0}")]
    DependencyFailure(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Port forwarding is disabled")]
    Disabled,

    #[error("Rule store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ForwardError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ForwardError::Validation(_) => ErrorKind::Validation,
            ForwardError::Conflict { .. } => ErrorKind::Conflict,
            ForwardError::DependencyMissing(_) => ErrorKind::DependencyMissing,
            ForwardError::DependencyFailure(_) => ErrorKind::DependencyFailure,
            ForwardError::Timeout(_) => ErrorKind::Timeout,
            ForwardError::NotFound(_) => ErrorKind::NotFound,
            ForwardError::Disabled => ErrorKind::Disabled,
            ForwardError::Store(_) => ErrorKind::Store,
            ForwardError::Io(_) => ErrorKind::Io,
        }
    }

    /// Port already forwarded by some tunnel.
    pub fn already_forwarded(port: u16, tunnel: &str) -> Self {
        ForwardError::Conflict {
            port,
            reason: format!("is already forwarded by tunnel {}", tunnel),
            owner: None,
        }
    }

    /// Port bound by a process outside this subsystem.
    pub fn port_in_use(port: u16, owner: Option<ProcessInfo>) -> Self {
        let reason = match &owner {
            Some(process) => format!("is already in use by: {}", process),
            None => "is already in use by another process".to_string(),
        };
        ForwardError::Conflict {
            port,
            reason,
            owner,
        }
    }

    pub fn not_forwarded(port: u16) -> Self {
        ForwardError::NotFound(format!("Port {} not found", port))
    }
}

impl From<serde_yaml::Error> for ForwardError {
    fn from(err: serde_yaml::Error) -> Self {
        ForwardError::Store(err.to_string())
    }
}

pub type ForwardResult<T> = Result<T, ForwardError>;
