//! Relays one local client connection through one SSH channel.

use std::fmt;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::session::SshSession;
use crate::error::Result;

const BUFFER_SIZE: usize = 32 * 1024;

/// Why a relay stopped
#[derive(Debug)]
pub enum CloseReason {
    ClientClosed,
    RemoteClosed,
    Cancelled,
    ClientError(io::Error),
    ChannelError(io::Error),
}

impl CloseReason {
    pub fn is_error(&self) -> bool {
        matches!(self, CloseReason::ClientError(_) | CloseReason::ChannelError(_))
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::ClientClosed => write!(f, "client closed"),
            CloseReason::RemoteClosed => write!(f, "remote closed"),
            CloseReason::Cancelled => write!(f, "tunnel stopping"),
            CloseReason::ClientError(e) => write!(f, "client error: {}", e),
            CloseReason::ChannelError(e) => write!(f, "channel error: {}", e),
        }
    }
}

#[derive(Debug)]
pub struct ForwardStats {
    pub to_remote: u64,
    pub to_client: u64,
    pub closed_by: CloseReason,
}

/// Which end of a one-way copy failed
enum PumpError {
    Read(io::Error),
    Write(io::Error),
}

/// Open a direct-tcpip channel to `remote_host:remote_port` and shuttle
/// bytes between it and `client` until either side ends or `cancel` fires.
///
/// Only channel setup errors are returned; how the relay ended is reported
/// in [`ForwardStats::closed_by`].
pub async fn forward(
    session: &SshSession,
    mut client: TcpStream,
    remote_host: &str,
    remote_port: u16,
    cancel: CancellationToken,
) -> Result<ForwardStats> {
    let originator = client.peer_addr()?;
    let channel = session
        .open_direct_tcpip(remote_host, remote_port, originator)
        .await?;

    debug!(
        "Channel open: {} -> {}:{} via {}",
        originator,
        remote_host,
        remote_port,
        session.authority()
    );

    let (mut channel_read, mut channel_write) = tokio::io::split(channel.into_stream());
    let (mut client_read, mut client_write) = client.split();

    let mut to_remote = 0u64;
    let mut to_client = 0u64;

    // Each direction runs on its own so a full channel window upstream never
    // stalls delivery downstream. The first one to finish ends both.
    let closed_by = tokio::select! {
        _ = cancel.cancelled() => CloseReason::Cancelled,

        upstream = pump(&mut client_read, &mut channel_write, &mut to_remote) => match upstream {
            Ok(()) => CloseReason::ClientClosed,
            Err(PumpError::Read(e)) => CloseReason::ClientError(e),
            Err(PumpError::Write(e)) => CloseReason::ChannelError(e),
        },

        downstream = pump(&mut channel_read, &mut client_write, &mut to_client) => match downstream {
            Ok(()) => CloseReason::RemoteClosed,
            Err(PumpError::Read(e)) => CloseReason::ChannelError(e),
            Err(PumpError::Write(e)) => CloseReason::ClientError(e),
        },
    };

    // Sends EOF; the channel itself is closed when the stream halves drop
    let _ = channel_write.shutdown().await;
    let _ = client_write.shutdown().await;

    Ok(ForwardStats {
        to_remote,
        to_client,
        closed_by,
    })
}

/// Copy `reader` into `writer` until EOF, preserving byte order.
async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    total: &mut u64,
) -> std::result::Result<(), PumpError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];

    loop {
        let n = reader.read(&mut buf).await.map_err(PumpError::Read)?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await.map_err(PumpError::Write)?;
        writer.flush().await.map_err(PumpError::Write)?;
        *total += n as u64;
    }
}
