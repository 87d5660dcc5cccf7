//! Outbound connect and inbound listen, nothing else.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::debug;

use crate::error::{Phase, Result, TunnelError};

/// Pending-connection queue for the local listener. A database driver opens a
/// handful of pooled connections, not hundreds.
pub const LISTEN_BACKLOG: u32 = 8;

/// Resolve `host` and connect to it, bounded by `timeout`.
pub async fn connect_outbound(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    let addr = format!("{}:{}", host, port);

    let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| TunnelError::TimeoutExceeded {
            phase: Phase::Connect,
            after: timeout,
        })?
        .map_err(|source| TunnelError::ConnectFailed {
            addr: addr.clone(),
            source,
        })?;

    // SSH packets are small and latency sensitive
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not set TCP_NODELAY on {}: {}", addr, e);
    }

    debug!("Connected to {}", addr);
    Ok(stream)
}

/// Bind `addr` with address reuse and start listening.
pub fn listen_inbound(addr: SocketAddr) -> Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(|source| TunnelError::BindFailed { addr, source })?;

    socket
        .set_reuseaddr(true)
        .map_err(|source| TunnelError::BindFailed { addr, source })?;
    socket
        .bind(addr)
        .map_err(|source| TunnelError::BindFailed { addr, source })?;

    let listener = socket
        .listen(LISTEN_BACKLOG)
        .map_err(|source| TunnelError::ListenFailed { addr, source })?;

    debug!("Listening on {}", addr);
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_refused() {
        // Grab a free port, then close it so nothing is listening
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let result = connect_outbound("127.0.0.1", port, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(TunnelError::ConnectFailed { .. })));
    }

    #[tokio::test]
    async fn test_listen_and_connect() {
        let listener = listen_inbound("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        let stream = connect_outbound("127.0.0.1", addr.port(), Duration::from_secs(5))
            .await
            .unwrap();
        let (_accepted, peer) = listener.accept().await.unwrap();
        assert_eq!(peer, stream.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_port_in_use_is_bind_failure() {
        let first = listen_inbound("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = first.local_addr().unwrap();

        // A live listener on the same port blocks the bind even with SO_REUSEADDR
        let second = listen_inbound(addr);
        assert!(matches!(second, Err(TunnelError::BindFailed { .. })));
    }
}
