use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Startup phase that can be bounded by a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connect,
    Handshake,
    Authentication,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Connect => write!(f, "connect"),
            Phase::Handshake => write!(f, "handshake"),
            Phase::Authentication => write!(f, "authentication"),
        }
    }
}

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("invalid tunnel configuration: {0}")]
    InvalidConfig(String),

    #[error("tunnel is already running on {0}")]
    AlreadyRunning(SocketAddr),

    #[error("failed to connect to {addr}: {source}")]
    ConnectFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot bind to {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to listen on {addr}: {source}")]
    ListenFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("could not initialize SSH session: {0}")]
    SessionInitFailed(String),

    #[error("error when starting up SSH session: {0}")]
    HandshakeFailed(#[source] russh::Error),

    #[error("host key for {host} rejected ({fingerprint}): {reason}")]
    HostKeyRejected {
        host: String,
        fingerprint: String,
        reason: String,
    },

    #[error("cannot load key file {path}: {source}")]
    KeyFile {
        path: PathBuf,
        #[source]
        source: russh::keys::Error,
    },

    #[error("no supported authentication methods found for {user} (server offers: {offered})")]
    NoSupportedAuthMethod { user: String, offered: String },

    #[error("authentication by {method} failed for {user}: {reason}")]
    AuthFailed {
        user: String,
        method: &'static str,
        reason: String,
    },

    #[error("cannot open channel to {host}:{port}: {source}")]
    ChannelOpenFailed {
        host: String,
        port: u16,
        #[source]
        source: russh::Error,
    },

    #[error("{phase} timed out after {after:?}")]
    TimeoutExceeded { phase: Phase, after: Duration },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// Required by `russh::client::Handler::Error`: anything the engine raises
// while the handshake is in flight surfaces as a handshake failure.
impl From<russh::Error> for TunnelError {
    fn from(e: russh::Error) -> Self {
        TunnelError::HandshakeFailed(e)
    }
}

pub type Result<T> = std::result::Result<T, TunnelError>;
