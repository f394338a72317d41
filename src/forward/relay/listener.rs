use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::session::{Direction, RelayTuning, SessionTable, TrafficStats, relay};
use crate::store::ForwardRule;

/// State shared by every listener of one relay backend
pub(super) struct RelayContext {
    pub tuning: RelayTuning,
    pub connect_timeout: std::time::Duration,
    pub sessions: Arc<SessionTable>,
    pub stats: Arc<TrafficStats>,
}

/// A running accept loop. Dropping it stops the loop as well.
pub(super) struct ListenerHandle {
    pub rule: ForwardRule,
    pub local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// Close the listener and wait until its connections are torn down
    pub async fn stop(self) -> Result<(), JoinError> {
        let _ = self.shutdown.send(true);
        self.task.await
    }
}

/// Bind with address reuse enabled
pub(super) fn bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(1024)
}

pub(super) fn spawn(listener: TcpListener, rule: ForwardRule, ctx: Arc<RelayContext>) -> std::io::Result<ListenerHandle> {
    let local_addr = listener.local_addr()?;
    let (shutdown, shutdown_rx) = watch::channel(false);

    info!(
        port = rule.port,
        tunnel = %rule.tunnel,
        remote = %rule.remote(),
        "Relay listening on {}",
        local_addr
    );

    let task = tokio::spawn(run(listener, Arc::new(rule.clone()), ctx, shutdown_rx));

    Ok(ListenerHandle {
        rule,
        local_addr,
        shutdown,
        task,
    })
}

/// Accept loop. Connection tasks live in a `JoinSet` owned by the loop, so
/// stopping the loop aborts them too.
async fn run(
    listener: TcpListener,
    rule: Arc<ForwardRule>,
    ctx: Arc<RelayContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,

            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    debug!(port = rule.port, "Accepted connection from {}", peer);
                    connections.spawn(handle_connection(socket, peer, rule.clone(), ctx.clone()));
                }
                Err(e) => {
                    error!(port = rule.port, error = %e, "Accept error");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            },

            Some(finished) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = finished {
                    if e.is_panic() {
                        warn!(port = rule.port, "Relay connection task panicked");
                    }
                }
            }
        }
    }

    drop(listener);
    let open = connections.len();
    connections.shutdown().await;
    info!(port = rule.port, closed_sessions = open, "Relay listener stopped");
}

async fn handle_connection(inbound: TcpStream, peer: SocketAddr, rule: Arc<ForwardRule>, ctx: Arc<RelayContext>) {
    let guard = ctx.sessions.open(rule.port, peer);
    ctx.stats.record_connection();

    let target = (rule.remote_ip.as_str(), rule.remote_port);
    let outbound = match timeout(ctx.connect_timeout, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!(port = rule.port, remote = %rule.remote(), error = %e, "Failed to connect to remote");
            ctx.stats.record_error();
            return;
        }
        Err(_) => {
            warn!(port = rule.port, remote = %rule.remote(), "Timeout connecting to remote");
            ctx.stats.record_error();
            return;
        }
    };

    for stream in [&inbound, &outbound] {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }
    }

    let (client_read, client_write) = inbound.into_split();
    let (remote_read, remote_write) = outbound.into_split();

    let mut routines = JoinSet::new();
    routines.spawn(relay(
        client_read,
        remote_write,
        Direction::ClientToRemote,
        guard.session(),
        ctx.stats.clone(),
        ctx.tuning,
    ));
    routines.spawn(relay(
        remote_read,
        client_write,
        Direction::RemoteToClient,
        guard.session(),
        ctx.stats.clone(),
        ctx.tuning,
    ));

    while let Some(done) = routines.join_next().await {
        match done {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => debug!(port = rule.port, error = %e, "Relay direction ended with error"),
            Err(e) if e.is_panic() => {
                warn!(port = rule.port, "Relay routine panicked");
                ctx.stats.record_error();
            }
            Err(_) => {}
        }
        // the first direction to end closes both sockets
        routines.abort_all();
    }

    let snapshot = guard.session().snapshot();
    debug!(
        port = rule.port,
        sent = snapshot.bytes_sent,
        received = snapshot.bytes_received,
        "Client {} disconnected",
        peer
    );
}
