//! dbtunnel
//!
//! Opens an SSH session to a bastion host and exposes a remote TCP service
//! (typically a database) on a local port. Every connection accepted on the
//! local port is relayed over its own direct-tcpip channel.

#![deny(clippy::correctness)]
#![warn(clippy::suspicious)]
#![warn(clippy::style)]
#![warn(clippy::complexity)]
#![warn(clippy::perf)]

pub mod config;
pub mod error;
pub mod hostkeys;
pub mod tunnel;

pub use error::{Result, TunnelError};
pub use tunnel::{AuthMethod, HostKeyPolicy, Timeouts, TunnelConfig, TunnelManager, TunnelState};
