use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::forward::forward;
use super::ids::ConnectionId;
use super::net::{connect_outbound, listen_inbound};
use super::runtime::SshRuntime;
use super::session::SshSession;
use super::types::TunnelConfig;
use crate::error::{Result, TunnelError};

/// Back-off after a failed `accept` so a persistent error (e.g. out of file
/// descriptors) doesn't spin the accept loop.
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

/// Tunnel lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Uninitialized,
    RuntimeReady,
    Connected,
    SessionActive,
    Listening,
    Running,
    Stopped,
}

/// Where accepted connections are sent, as seen from the SSH server
#[derive(Debug, Clone)]
struct RemoteTarget {
    host: String,
    port: u16,
}

/// Resources held while the tunnel runs, in acquisition order
struct ActiveTunnel {
    runtime: SshRuntime,
    session: Arc<SshSession>,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    /// Hands the listener back once accepting has stopped
    accept_task: JoinHandle<TcpListener>,
}

/// Owns one SSH tunnel: a local listener whose connections are forwarded
/// over a single authenticated SSH session.
pub struct TunnelManager {
    state: TunnelState,
    active: Option<ActiveTunnel>,
    connections: Arc<AtomicUsize>,
}

impl Default for TunnelManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelManager {
    pub fn new() -> Self {
        Self {
            state: TunnelState::Uninitialized,
            active: None,
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Bring the tunnel up and return the local address to connect to.
    ///
    /// Either everything is up and forwarding when this returns, or every
    /// resource acquired along the way has been released again.
    pub async fn start(&mut self, config: TunnelConfig) -> Result<SocketAddr> {
        if let Some(active) = &self.active {
            return Err(TunnelError::AlreadyRunning(active.local_addr));
        }

        match self.bring_up(config).await {
            Ok(active) => {
                let local_addr = active.local_addr;
                self.active = Some(active);
                self.state = TunnelState::Running;
                Ok(local_addr)
            }
            Err(e) => {
                error!("Tunnel startup failed: {}", e);
                self.state = TunnelState::Stopped;
                Err(e)
            }
        }
    }

    async fn bring_up(&mut self, config: TunnelConfig) -> Result<ActiveTunnel> {
        config.validate()?;
        let bind_addr = config.local_addr()?;

        // Each `?` below drops what was acquired so far, newest first
        let runtime = SshRuntime::acquire();
        self.state = TunnelState::RuntimeReady;

        info!("Connecting to {}...", config.ssh_authority());
        let stream = connect_outbound(&config.ssh_host, config.ssh_port, config.timeouts.connect)
            .await?;
        self.state = TunnelState::Connected;

        let session = SshSession::establish(&runtime, stream, &config).await?;
        self.state = TunnelState::SessionActive;

        let bound = listen_inbound(bind_addr).and_then(|listener| {
            let local_addr = listener.local_addr()?;
            Ok((listener, local_addr))
        });
        let (listener, local_addr) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                session.close().await;
                return Err(e);
            }
        };
        self.state = TunnelState::Listening;

        info!(
            "Waiting for TCP connection on {} -> {}:{} via {}",
            local_addr,
            config.remote_host,
            config.remote_port,
            config.ssh_authority()
        );

        let session = Arc::new(session);
        let cancel = CancellationToken::new();
        let target = RemoteTarget {
            host: config.remote_host.clone(),
            port: config.remote_port,
        };

        let accept_task = tokio::spawn(accept_loop(
            listener,
            runtime.clone(),
            session.clone(),
            target,
            cancel.clone(),
            self.connections.clone(),
            config.timeouts.shutdown_grace,
        ));

        Ok(ActiveTunnel {
            runtime,
            session,
            local_addr,
            cancel,
            accept_task,
        })
    }

    /// Stop accepting, end every forwarder, then release the session,
    /// listener and runtime in that order. Does nothing if not running.
    pub async fn stop(&mut self) {
        let Some(active) = self.active.take() else {
            debug!("Stop requested but tunnel is not running");
            return;
        };

        let ActiveTunnel {
            runtime,
            session,
            local_addr,
            cancel,
            accept_task,
        } = active;

        info!("Stopping tunnel on {}", local_addr);
        cancel.cancel();

        let listener = match accept_task.await {
            Ok(listener) => Some(listener),
            Err(e) => {
                error!("Accept task for {} ended abnormally: {}", local_addr, e);
                None
            }
        };

        session.close().await;
        drop(session);
        drop(listener);
        drop(runtime);

        self.connections.store(0, Ordering::SeqCst);
        self.state = TunnelState::Stopped;
        info!("Tunnel on {} stopped", local_addr);
    }

    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    /// Local endpoint the database driver should connect to
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.active.as_ref().map(|a| a.local_addr)
    }

    /// Number of client connections currently being forwarded
    pub fn active_connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Drop for TunnelManager {
    fn drop(&mut self) {
        // Without an async context the best we can do is make every task wind
        // down. The accept task releases the session and then its runtime
        // handle once the last forwarder is gone.
        if let Some(active) = self.active.take() {
            active.cancel.cancel();
        }
    }
}

/// Holds its own runtime handle so the runtime outlives every forwarder, even
/// when the manager is dropped without `stop`.
async fn accept_loop(
    listener: TcpListener,
    runtime: SshRuntime,
    session: Arc<SshSession>,
    target: RemoteTarget,
    cancel: CancellationToken,
    connections: Arc<AtomicUsize>,
    grace: Duration,
) -> TcpListener {
    let mut forwarders = JoinSet::new();
    let mut next_id = ConnectionId::from(1);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let id = next_id.next();
                        debug!("Connection {} accepted from {}", id, peer);
                        forwarders.spawn(run_forwarder(
                            id,
                            stream,
                            session.clone(),
                            target.clone(),
                            cancel.child_token(),
                        ));
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
                    }
                }
            }

            Some(joined) = forwarders.join_next(), if !forwarders.is_empty() => {
                if let Err(e) = joined {
                    error!("Forwarder task failed: {}", e);
                }
            }
        }

        connections.store(forwarders.len(), Ordering::SeqCst);
    }

    let draining = forwarders.len();
    if draining > 0 {
        debug!("Waiting for {} connections to finish", draining);
    }

    let drained = tokio::time::timeout(grace, async {
        while forwarders.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        warn!(
            "{} connections still open after {:?}, aborting them",
            forwarders.len(),
            grace
        );
        forwarders.shutdown().await;
    }

    connections.store(0, Ordering::SeqCst);
    drop(session);
    drop(runtime);
    listener
}

async fn run_forwarder(
    id: ConnectionId,
    stream: TcpStream,
    session: Arc<SshSession>,
    target: RemoteTarget,
    cancel: CancellationToken,
) {
    match forward(&session, stream, &target.host, target.port, cancel).await {
        Ok(stats) if stats.closed_by.is_error() => {
            warn!(
                "Connection {} ended: {} ({} bytes out, {} bytes in)",
                id, stats.closed_by, stats.to_remote, stats.to_client
            );
        }
        Ok(stats) => {
            debug!(
                "Connection {} ended: {} ({} bytes out, {} bytes in)",
                id, stats.closed_by, stats.to_remote, stats.to_client
            );
        }
        Err(e) => {
            warn!("Connection {} failed: {}", id, e);
        }
    }
}
