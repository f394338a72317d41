//! Tunnel Forward - port forwarding control plane
//!
//! Forwards local TCP ports to remote endpoints behind site-to-site tunnels,
//! using one of three interchangeable backends selected at runtime.

pub mod config;
pub mod error;
pub mod exec;
pub mod forward;
pub mod orchestrator;
pub mod ports;
pub mod probe;
pub mod store;

pub use error::{ErrorKind, ForwardError, ForwardResult};
pub use forward::{ForwardBackend, ForwardStatus};
pub use orchestrator::{Forwarder, ModeSwitch};
pub use store::{ForwardRule, ForwardingMode, RuleStore, TunnelRecord};
