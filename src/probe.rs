//! Liveness probe
//!
//! Reads the kernel's socket tables (`/proc/net/tcp`, `/proc/net/tcp6`) to
//! find listening ports and resolves the owning process through
//! `/proc/<pid>/fd`. The process table comes from `sysinfo`. Nothing here is
//! cached: every call re-reads the tables.

use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

use sysinfo::{Pid, Process, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};

use crate::error::ProcessInfo;

/// TCP_LISTEN in the kernel's state table
const TCP_LISTEN: u8 = 0x0A;

/// A socket in LISTEN state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listener {
    pub addr: IpAddr,
    pub port: u16,
    pub inode: u64,
}

impl Listener {
    /// Whether binding `bind_ip:self.port` would collide with this socket
    pub fn overlaps(&self, bind_ip: IpAddr) -> bool {
        self.addr.is_unspecified() || bind_ip.is_unspecified() || self.addr == bind_ip
    }
}

/// One entry of the process table
#[derive(Debug, Clone)]
pub struct ProcessEntry {
    pub pid: u32,
    /// Kernel process name, truncated to 15 bytes on Linux
    pub name: String,
    pub zombie: bool,
    pub cmdline: Vec<String>,
}

impl ProcessEntry {
    fn from_process(process: &Process) -> Self {
        Self {
            pid: process.pid().as_u32(),
            name: process.name().to_string_lossy().into_owned(),
            zombie: matches!(process.status(), ProcessStatus::Zombie),
            cmdline: process
                .cmd()
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned())
                .collect(),
        }
    }

    pub fn is_zombie(&self) -> bool {
        self.zombie
    }

    /// Base name of argv[0], or the kernel name when the command line is
    /// unreadable
    pub fn program(&self) -> Option<&str> {
        match self.cmdline.first() {
            Some(arg0) => arg0.rsplit('/').next(),
            None if !self.name.is_empty() => Some(&self.name),
            None => None,
        }
    }

    /// Whether this process runs `program` (a base name)
    pub fn runs(&self, program: &str) -> bool {
        self.program() == Some(program) || self.name == program
    }
}

/// Fresh view of the requested processes; threads are left out
fn process_table(which: ProcessesToUpdate<'_>) -> Vec<ProcessEntry> {
    let mut system = System::new();
    system.refresh_processes_specifics(which, true, ProcessRefreshKind::everything());
    let mut out: Vec<ProcessEntry> = system
        .processes()
        .values()
        .filter(|p| p.thread_kind().is_none())
        .map(ProcessEntry::from_process)
        .collect();
    out.sort_unstable_by_key(|p| p.pid);
    out
}

#[derive(Debug, Clone)]
pub struct ListenerProbe {
    proc_root: PathBuf,
}

impl Default for ListenerProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerProbe {
    pub fn new() -> Self {
        Self::with_proc_root("/proc")
    }

    pub fn with_proc_root(root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: root.into(),
        }
    }

    /// All TCP listeners, IPv4 and IPv6
    pub fn listeners(&self) -> io::Result<Vec<Listener>> {
        let mut out = Vec::new();
        let mut found_table = false;
        for table in ["net/tcp", "net/tcp6"] {
            match fs::read_to_string(self.proc_root.join(table)) {
                Ok(raw) => {
                    found_table = true;
                    out.extend(parse_socket_table(&raw));
                }
                // tcp6 is absent on kernels without IPv6
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        if !found_table {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "no socket tables under proc root",
            ));
        }
        Ok(out)
    }

    fn listeners_or_empty(&self) -> Vec<Listener> {
        self.listeners().unwrap_or_else(|e| {
            tracing::debug!(error = %e, "Unable to read socket tables");
            Vec::new()
        })
    }

    /// Whether anything listens on `port`, on any address
    pub fn is_listening(&self, port: u16) -> bool {
        self.listeners_or_empty().iter().any(|l| l.port == port)
    }

    /// A listener that would collide with binding `bind_ip:port`
    pub fn find_conflict(&self, port: u16, bind_ip: IpAddr) -> Option<Listener> {
        self.listeners_or_empty()
            .into_iter()
            .find(|l| l.port == port && l.overlaps(bind_ip))
    }

    /// Best-effort owner of `port`'s listening socket
    pub fn port_owner(&self, port: u16) -> Option<ProcessInfo> {
        let inodes: Vec<u64> = self
            .listeners_or_empty()
            .into_iter()
            .filter(|l| l.port == port)
            .map(|l| l.inode)
            .collect();
        if inodes.is_empty() {
            return None;
        }
        self.owner_of_inodes(&inodes)
    }

    pub fn owner(&self, listener: &Listener) -> Option<ProcessInfo> {
        self.owner_of_inodes(&[listener.inode])
    }

    fn owner_of_inodes(&self, inodes: &[u64]) -> Option<ProcessInfo> {
        let targets: Vec<String> = inodes
            .iter()
            .filter(|&&i| i != 0)
            .map(|i| format!("socket:[{}]", i))
            .collect();
        if targets.is_empty() {
            return None;
        }

        for pid in self.pids() {
            let fd_dir = self.proc_root.join(pid.to_string()).join("fd");
            // other users' fd tables are unreadable without privileges
            let Ok(entries) = fs::read_dir(&fd_dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let Ok(link) = fs::read_link(entry.path()) else {
                    continue;
                };
                if targets.iter().any(|t| Path::new(t) == link) {
                    return Some(ProcessInfo {
                        pid,
                        name: self.process_name(pid),
                    });
                }
            }
        }
        None
    }

    /// One process by PID, if it exists
    pub fn process(&self, pid: u32) -> Option<ProcessEntry> {
        process_table(ProcessesToUpdate::Some(&[Pid::from_u32(pid)]))
            .into_iter()
            .find(|p| p.pid == pid)
    }

    pub fn process_name(&self, pid: u32) -> Option<String> {
        self.process(pid).map(|p| p.name).filter(|n| !n.is_empty())
    }

    /// Whether `pid` exists and is not a zombie
    pub fn is_alive(&self, pid: u32) -> bool {
        self.process(pid).is_some_and(|p| !p.is_zombie())
    }

    fn pids(&self) -> Vec<u32> {
        self.processes().into_iter().map(|p| p.pid).collect()
    }

    /// Snapshot of the process table, ordered by PID
    pub fn processes(&self) -> Vec<ProcessEntry> {
        process_table(ProcessesToUpdate::All)
    }
}

/// Parse the LISTEN rows of a `/proc/net/tcp{,6}` table
pub fn parse_socket_table(raw: &str) -> Vec<Listener> {
    raw.lines()
        .skip(1)
        .filter_map(parse_socket_line)
        .filter(|(_, state)| *state == TCP_LISTEN)
        .map(|(listener, _)| listener)
        .collect()
}

fn parse_socket_line(line: &str) -> Option<(Listener, u8)> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 10 {
        return None;
    }
    let (addr_hex, port_hex) = fields[1].split_once(':')?;
    let addr = parse_hex_addr(addr_hex)?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;
    let state = u8::from_str_radix(fields[3], 16).ok()?;
    let inode = fields[9].parse().ok()?;
    Some((Listener { addr, port, inode }, state))
}

/// Addresses are printed as 32-bit words in host byte order
fn parse_hex_addr(hex: &str) -> Option<IpAddr> {
    match hex.len() {
        8 => {
            let word = u32::from_str_radix(hex, 16).ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(word.to_ne_bytes())))
        }
        32 => {
            let mut bytes = [0u8; 16];
            for (i, chunk) in bytes.chunks_mut(4).enumerate() {
                let word = u32::from_str_radix(&hex[i * 8..i * 8 + 8], 16).ok()?;
                chunk.copy_from_slice(&word.to_ne_bytes());
            }
            Some(IpAddr::V6(Ipv6Addr::from(bytes)))
        }
        _ => None,
    }
}
