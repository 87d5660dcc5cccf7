use std::net::SocketAddr;
use std::sync::Arc;

use russh::client::{self, AuthResult, Handle, Msg};
use russh::keys::{load_public_key, load_secret_key, PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use russh::{Channel, Disconnect};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::runtime::SshRuntime;
use super::types::{AuthMethod, HostKeyPolicy, TunnelConfig};
use crate::error::{Phase, Result, TunnelError};
use crate::hostkeys::check_host_key;

/// russh callbacks for one outbound session
pub struct SessionHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
}

impl client::Handler for SessionHandler {
    type Error = TunnelError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        check_host_key(&self.policy, &self.host, self.port, server_public_key).await?;
        Ok(true)
    }
}

/// Credentials ready to hand to the server, key files already read
enum Credentials {
    Password(String),
    PublicKey(PrivateKey),
}

impl Credentials {
    fn load(auth: &AuthMethod) -> Result<Self> {
        match auth {
            AuthMethod::Password { password } => Ok(Credentials::Password(password.clone())),
            AuthMethod::PublicKey {
                private_key_path,
                public_key_path,
                passphrase,
            } => {
                let private = load_secret_key(private_key_path, passphrase.as_deref())
                    .map_err(|source| TunnelError::KeyFile {
                        path: private_key_path.clone(),
                        source,
                    })?;
                let public =
                    load_public_key(public_key_path).map_err(|source| TunnelError::KeyFile {
                        path: public_key_path.clone(),
                        source,
                    })?;

                if private.public_key().key_data() != public.key_data() {
                    return Err(TunnelError::InvalidConfig(format!(
                        "public key {} does not belong to private key {}",
                        public_key_path.display(),
                        private_key_path.display()
                    )));
                }

                Ok(Credentials::PublicKey(private))
            }
        }
    }
}

/// An authenticated SSH connection.
///
/// The underlying [`Handle`] funnels every request through the single russh
/// session task, so forwarders can share an `Arc<SshSession>` without locking.
pub struct SshSession {
    handle: Handle<SessionHandler>,
    authority: String,
}

impl SshSession {
    /// Drive the handshake, verify the host key and authenticate over `stream`.
    ///
    /// On failure the half-built session is disconnected before returning.
    pub async fn establish(
        runtime: &SshRuntime,
        stream: TcpStream,
        config: &TunnelConfig,
    ) -> Result<Self> {
        let authority = config.ssh_authority();

        // The socket must still be connected before the handshake takes it over
        stream
            .peer_addr()
            .map_err(|e| TunnelError::SessionInitFailed(format!("{}: {}", authority, e)))?;
        let credentials = Credentials::load(&config.auth)?;

        let handler = SessionHandler {
            host: config.ssh_host.clone(),
            port: config.ssh_port,
            policy: config.host_key.clone(),
        };

        let timeouts = config.timeouts;
        let handle = tokio::time::timeout(
            timeouts.handshake,
            client::connect_stream(runtime.client_config(), stream, handler),
        )
        .await
        .map_err(|_| TunnelError::TimeoutExceeded {
            phase: Phase::Handshake,
            after: timeouts.handshake,
        })??;

        debug!("SSH handshake with {} complete", authority);

        let mut session = Self { handle, authority };

        let auth = tokio::time::timeout(
            timeouts.auth,
            session.authenticate(&config.username, config.auth.name(), credentials),
        )
        .await
        .unwrap_or_else(|_| {
            Err(TunnelError::TimeoutExceeded {
                phase: Phase::Authentication,
                after: timeouts.auth,
            })
        });

        match auth {
            Ok(()) => Ok(session),
            Err(e) => {
                session.close().await;
                Err(e)
            }
        }
    }

    async fn authenticate(
        &mut self,
        user: &str,
        method: &'static str,
        credentials: Credentials,
    ) -> Result<()> {
        let auth_error = |reason: String| TunnelError::AuthFailed {
            user: user.to_string(),
            method,
            reason,
        };

        // A "none" request either lets us in or tells us what the server accepts
        let offered = match self
            .handle
            .authenticate_none(user)
            .await
            .map_err(|e| auth_error(e.to_string()))?
        {
            AuthResult::Success => {
                warn!("Server {} accepted {} without credentials", self.authority, user);
                return Ok(());
            }
            AuthResult::Failure {
                remaining_methods, ..
            } => remaining_methods
                .iter()
                .map(|m| {
                    let name: &str = m.into();
                    name.to_string()
                })
                .collect::<Vec<_>>(),
        };

        info!("Authentication methods: {}", offered.join(","));

        if !offered.iter().any(|m| m == method) {
            return Err(TunnelError::NoSupportedAuthMethod {
                user: user.to_string(),
                offered: offered.join(","),
            });
        }

        let result = match credentials {
            Credentials::Password(password) => {
                self.handle.authenticate_password(user, password).await
            }
            Credentials::PublicKey(key) => {
                // RSA keys need the hash the server prefers; others ignore it
                let hash_alg = self
                    .handle
                    .best_supported_rsa_hash()
                    .await
                    .ok()
                    .flatten()
                    .flatten();
                self.handle
                    .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
                    .await
            }
        }
        .map_err(|e| auth_error(e.to_string()))?;

        if result.success() {
            info!("Authentication by {} succeeded.", method);
            Ok(())
        } else {
            Err(auth_error("rejected by server".to_string()))
        }
    }

    /// Ask the server to connect to `host:port` on our behalf.
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
        originator: SocketAddr,
    ) -> Result<Channel<Msg>> {
        self.handle
            .channel_open_direct_tcpip(
                host,
                u32::from(port),
                originator.ip().to_string(),
                u32::from(originator.port()),
            )
            .await
            .map_err(|source| TunnelError::ChannelOpenFailed {
                host: host.to_string(),
                port,
                source,
            })
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// Disconnect politely. Errors are only logged: the socket goes away
    /// with the handle either way.
    pub async fn close(&self) {
        if self.is_closed() {
            return;
        }
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!("Failed to disconnect from {} gracefully: {}", self.authority, e);
        }
    }
}
