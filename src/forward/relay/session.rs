//! Relay sessions and byte counters

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, trace};

/// Backend-wide counters
#[derive(Debug, Default)]
pub struct TrafficStats {
    connections: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficSnapshot {
    pub connections: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub errors: u64,
}

impl TrafficStats {
    pub fn record_connection(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            connections: self.connections.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// One accepted connection
#[derive(Debug)]
pub struct Session {
    pub id: u64,
    pub port: u16,
    pub peer: SocketAddr,
    pub created_at: SystemTime,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub id: u64,
    pub port: u16,
    pub peer: SocketAddr,
    pub created_at: SystemTime,
    /// client -> remote
    pub bytes_sent: u64,
    /// remote -> client
    pub bytes_received: u64,
}

impl Session {
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            port: self.port,
            peer: self.peer,
            created_at: self.created_at,
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Live sessions of one relay backend
#[derive(Debug, Default)]
pub struct SessionTable {
    next_id: AtomicU64,
    sessions: Mutex<HashMap<u64, Arc<Session>>>,
}

impl SessionTable {
    /// Register a session; it leaves the table when the guard drops
    pub fn open(self: &Arc<Self>, port: u16, peer: SocketAddr) -> SessionGuard {
        let session = Arc::new(Session {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            port,
            peer,
            created_at: SystemTime::now(),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        });
        self.sessions.lock().insert(session.id, session.clone());
        SessionGuard {
            table: self.clone(),
            session,
        }
    }

    pub fn snapshot(&self, port: Option<u16>) -> Vec<SessionSnapshot> {
        let mut out: Vec<_> = self
            .sessions
            .lock()
            .values()
            .filter(|s| port.is_none_or(|p| s.port == p))
            .map(|s| s.snapshot())
            .collect();
        out.sort_by_key(|s| s.id);
        out
    }

    pub fn count(&self, port: u16) -> usize {
        self.sessions.lock().values().filter(|s| s.port == port).count()
    }
}

/// Removes its session from the table on every exit path, abort included
pub struct SessionGuard {
    table: Arc<SessionTable>,
    session: Arc<Session>,
}

impl SessionGuard {
    pub fn session(&self) -> Arc<Session> {
        self.session.clone()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.table.sessions.lock().remove(&self.session.id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToRemote,
    RemoteToClient,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ClientToRemote => "client->remote",
            Direction::RemoteToClient => "remote->client",
        }
    }
}

/// Tuning for one relay routine
#[derive(Debug, Clone, Copy)]
pub struct RelayTuning {
    pub chunk_size: usize,
    pub idle_timeout: Duration,
    pub flush_threshold: usize,
}

/// Copy `reader` into `writer` until EOF, idle timeout or error.
///
/// Idle timeout ends the direction like EOF does. The write side is shut down
/// on exit; the connection handler then drops the companion direction, which
/// closes the rest of both sockets.
pub async fn relay<R, W>(
    mut reader: R,
    mut writer: W,
    direction: Direction,
    session: Arc<Session>,
    stats: Arc<TrafficStats>,
    tuning: RelayTuning,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(tuning.chunk_size);
    let mut pending = 0usize;
    let mut total = 0u64;

    let result = loop {
        buf.clear();
        let n = match timeout(tuning.idle_timeout, reader.read_buf(&mut buf)).await {
            Ok(Ok(0)) => break Ok(()),
            Ok(Ok(n)) => n,
            Ok(Err(e)) => break Err(e),
            Err(_) => {
                debug!(
                    session = session.id,
                    direction = direction.as_str(),
                    idle_secs = tuning.idle_timeout.as_secs(),
                    "Relay idle, ending direction"
                );
                break Ok(());
            }
        };

        total += n as u64;
        match direction {
            Direction::ClientToRemote => {
                session.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                stats.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
            }
            Direction::RemoteToClient => {
                session.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                stats.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
            }
        }

        if let Err(e) = writer.write_all(&buf[..n]).await {
            break Err(e);
        }
        pending += n;
        if pending > tuning.flush_threshold {
            if let Err(e) = writer.flush().await {
                break Err(e);
            }
            pending = 0;
        }
    };

    if let Err(e) = &result {
        trace!(session = session.id, direction = direction.as_str(), error = %e, "Relay error");
    }

    let _ = writer.flush().await;
    let _ = writer.shutdown().await;

    result.map(|_| total)
}
