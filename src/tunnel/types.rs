//! SSH tunnel configuration types.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, TunnelError};

/// Credentials used to authenticate against the SSH server
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// Password authentication
    Password { password: String },
    /// Key pair on disk with optional passphrase for the private key
    PublicKey {
        private_key_path: PathBuf,
        public_key_path: PathBuf,
        passphrase: Option<String>,
    },
}

impl AuthMethod {
    /// SSH method name as it appears in the server's method list
    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::Password { .. } => "password",
            AuthMethod::PublicKey { .. } => "publickey",
        }
    }
}

// Hand-written so secrets never end up in logs.
impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Password { .. } => f
                .debug_struct("Password")
                .field("password", &"<redacted>")
                .finish(),
            AuthMethod::PublicKey {
                private_key_path,
                public_key_path,
                passphrase,
            } => f
                .debug_struct("PublicKey")
                .field("private_key_path", private_key_path)
                .field("public_key_path", public_key_path)
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .finish(),
        }
    }
}

/// How the server's host key is checked before authenticating
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Accept only this SHA-256 fingerprint (`SHA256:...`)
    Pinned(String),
    /// Look the key up in a persisted store, optionally trusting unknown hosts on first use
    KnownHosts { path: PathBuf, accept_new: bool },
}

/// Bounds on the blocking startup phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub handshake: Duration,
    pub auth: Duration,
    /// How long `stop` waits for forwarders before aborting them
    pub shutdown_grace: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(15),
            handshake: Duration::from_secs(15),
            auth: Duration::from_secs(15),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Everything needed to bring one tunnel up
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Local bind address (loopback in practice)
    pub local_host: String,
    /// Local port to bind (0 for auto-assign)
    pub local_port: u16,
    /// SSH server hostname or address
    pub ssh_host: String,
    /// SSH server port (default: 22)
    pub ssh_port: u16,
    /// SSH username
    pub username: String,
    pub auth: AuthMethod,
    /// Remote host to tunnel to (as seen from SSH server)
    pub remote_host: String,
    pub remote_port: u16,
    pub host_key: HostKeyPolicy,
    pub timeouts: Timeouts,
}

impl TunnelConfig {
    /// Create a tunnel configuration with password authentication
    #[allow(clippy::too_many_arguments)]
    pub fn with_password(
        ssh_host: impl Into<String>,
        ssh_port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
        remote_host: impl Into<String>,
        remote_port: u16,
        host_key: HostKeyPolicy,
    ) -> Self {
        Self {
            local_host: "127.0.0.1".to_string(),
            local_port: 0,
            ssh_host: ssh_host.into(),
            ssh_port,
            username: username.into(),
            auth: AuthMethod::Password {
                password: password.into(),
            },
            remote_host: remote_host.into(),
            remote_port,
            host_key,
            timeouts: Timeouts::default(),
        }
    }

    /// Create a tunnel configuration with public key authentication
    #[allow(clippy::too_many_arguments)]
    pub fn with_public_key(
        ssh_host: impl Into<String>,
        ssh_port: u16,
        username: impl Into<String>,
        private_key_path: impl Into<PathBuf>,
        public_key_path: impl Into<PathBuf>,
        passphrase: Option<String>,
        remote_host: impl Into<String>,
        remote_port: u16,
        host_key: HostKeyPolicy,
    ) -> Self {
        Self {
            local_host: "127.0.0.1".to_string(),
            local_port: 0,
            ssh_host: ssh_host.into(),
            ssh_port,
            username: username.into(),
            auth: AuthMethod::PublicKey {
                private_key_path: private_key_path.into(),
                public_key_path: public_key_path.into(),
                passphrase: passphrase.filter(|p| !p.is_empty()),
            },
            remote_host: remote_host.into(),
            remote_port,
            host_key,
            timeouts: Timeouts::default(),
        }
    }

    /// Set the local bind address and port (0 for auto-assign)
    pub fn with_local(mut self, host: impl Into<String>, port: u16) -> Self {
        self.local_host = host.into();
        self.local_port = port;
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Address the listener binds to. Fails if the host is not an IP literal.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self.local_host.parse().map_err(|_| {
            TunnelError::InvalidConfig(format!(
                "local bind address '{}' is not an IP address",
                self.local_host
            ))
        })?;
        Ok(SocketAddr::new(ip, self.local_port))
    }

    /// `host:port` of the SSH server, for logs and host key lookups
    pub fn ssh_authority(&self) -> String {
        format!("{}:{}", self.ssh_host, self.ssh_port)
    }

    pub fn validate(&self) -> Result<()> {
        self.local_addr()?;

        let require = |value: &str, what: &str| {
            if value.trim().is_empty() {
                Err(TunnelError::InvalidConfig(format!("{} must not be empty", what)))
            } else {
                Ok(())
            }
        };

        require(&self.ssh_host, "SSH server address")?;
        require(&self.username, "SSH username")?;
        require(&self.remote_host, "remote host")?;

        if self.ssh_port == 0 {
            return Err(TunnelError::InvalidConfig("SSH port must not be 0".into()));
        }
        if self.remote_port == 0 {
            return Err(TunnelError::InvalidConfig("remote port must not be 0".into()));
        }

        match &self.auth {
            AuthMethod::Password { password } => {
                if password.is_empty() {
                    return Err(TunnelError::InvalidConfig(
                        "password authentication requires a password".into(),
                    ));
                }
            }
            AuthMethod::PublicKey {
                private_key_path,
                public_key_path,
                ..
            } => {
                if private_key_path.as_os_str().is_empty() || public_key_path.as_os_str().is_empty()
                {
                    return Err(TunnelError::InvalidConfig(
                        "public key authentication requires both key file paths".into(),
                    ));
                }
            }
        }

        if let HostKeyPolicy::Pinned(fingerprint) = &self.host_key {
            if !fingerprint.starts_with("SHA256:") {
                return Err(TunnelError::InvalidConfig(format!(
                    "pinned host key fingerprint '{}' must start with SHA256:",
                    fingerprint
                )));
            }
        }

        let t = &self.timeouts;
        if t.connect.is_zero() || t.handshake.is_zero() || t.auth.is_zero() {
            return Err(TunnelError::InvalidConfig("timeouts must be non-zero".into()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pinned() -> HostKeyPolicy {
        HostKeyPolicy::Pinned("SHA256:abc".to_string())
    }

    #[test]
    fn test_password_config_validates() {
        let config =
            TunnelConfig::with_password("db.example.com", 22, "app", "secret", "localhost", 5432, pinned());
        assert!(config.validate().is_ok());
        assert_eq!(config.local_addr().unwrap().to_string(), "127.0.0.1:0");
    }

    #[test]
    fn test_empty_password_rejected() {
        let config =
            TunnelConfig::with_password("db.example.com", 22, "app", "", "localhost", 5432, pinned());
        assert!(matches!(config.validate(), Err(TunnelError::InvalidConfig(_))));
    }

    #[test]
    fn test_public_key_requires_both_paths() {
        let config = TunnelConfig::with_public_key(
            "198.61.166.171",
            22,
            "dmitry",
            "/home/dmitry/.ssh/id_ed25519",
            "",
            None,
            "localhost",
            27017,
            pinned(),
        );
        assert!(matches!(config.validate(), Err(TunnelError::InvalidConfig(_))));
    }

    #[test]
    fn test_empty_passphrase_is_unset() {
        let config = TunnelConfig::with_public_key(
            "198.61.166.171",
            22,
            "dmitry",
            "/k",
            "/k.pub",
            Some(String::new()),
            "localhost",
            27017,
            pinned(),
        );
        match config.auth {
            AuthMethod::PublicKey { passphrase, .. } => assert!(passphrase.is_none()),
            _ => panic!("expected public key auth"),
        }
    }

    #[test]
    fn test_local_host_must_be_ip() {
        let config =
            TunnelConfig::with_password("h", 22, "u", "p", "localhost", 27017, pinned())
                .with_local("localhost", 27040);
        assert!(matches!(config.validate(), Err(TunnelError::InvalidConfig(_))));
    }

    #[test]
    fn test_pinned_fingerprint_format() {
        let config = TunnelConfig::with_password(
            "h",
            22,
            "u",
            "p",
            "localhost",
            27017,
            HostKeyPolicy::Pinned("aa:bb:cc".into()),
        );
        assert!(matches!(config.validate(), Err(TunnelError::InvalidConfig(_))));
    }

    #[test]
    fn test_auth_method_wire_names() {
        let password = TunnelConfig::with_password("h", 22, "u", "p", "localhost", 27017, pinned());
        let key = TunnelConfig::with_public_key(
            "h", 22, "u", "/k", "/k.pub", None, "localhost", 27017, pinned(),
        );

        assert_eq!(password.auth.name(), "password");
        assert_eq!(key.auth.name(), "publickey");
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let auth = AuthMethod::Password {
            password: "hunter2".into(),
        };
        assert!(!format!("{:?}", auth).contains("hunter2"));
    }
}
