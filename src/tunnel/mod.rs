//! SSH tunnel implementation.
//!
//! This module provides the core tunnel functionality:
//! - [`TunnelManager`] - start/stop lifecycle and the accept loop
//! - [`SshSession`] - handshake, host key check and authentication
//! - [`forward`] - relays one client connection over one SSH channel
//! - [`SshRuntime`] - process-wide runtime shared by all tunnels

mod forward;
mod ids;
mod manager;
pub mod net;
mod runtime;
mod session;
mod types;

pub use forward::{forward, CloseReason, ForwardStats};
pub use ids::ConnectionId;
pub use manager::{TunnelManager, TunnelState};
pub use runtime::SshRuntime;
pub use session::{SessionHandler, SshSession};
pub use types::{AuthMethod, HostKeyPolicy, Timeouts, TunnelConfig};
