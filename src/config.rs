//! Configuration management for dbtunnel.
//!
//! Handles loading and saving configuration from `<config dir>/dbtunnel/config.toml`
//! and turning it into a validated [`TunnelConfig`].

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::hostkeys::KnownHosts;
use crate::tunnel::{AuthMethod, HostKeyPolicy, Timeouts, TunnelConfig};

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Config {
    pub tunnel: Option<TunnelSection>,
    #[serde(default)]
    pub host_key: HostKeySection,
    #[serde(default)]
    pub timeouts: TimeoutSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSection {
    #[serde(default = "default_local_host")]
    pub local_host: String,
    #[serde(default)]
    pub local_port: u16,
    pub ssh_host: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    pub username: String,
    pub remote_host: String,
    pub remote_port: u16,
    pub auth: AuthSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum AuthSection {
    Password {
        /// Usually supplied through the environment instead
        password: Option<String>,
    },
    PublicKey {
        private_key_path: PathBuf,
        /// Defaults to the private key path with `.pub` appended
        public_key_path: Option<PathBuf>,
        passphrase: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostKeySection {
    /// Pin the server to one `SHA256:` fingerprint instead of using the store
    pub fingerprint: Option<String>,
    pub known_hosts: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub accept_new: bool,
}

impl Default for HostKeySection {
    fn default() -> Self {
        Self {
            fingerprint: None,
            known_hosts: None,
            accept_new: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSection {
    pub connect_secs: u64,
    pub handshake_secs: u64,
    pub auth_secs: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for TimeoutSection {
    fn default() -> Self {
        let defaults = Timeouts::default();
        Self {
            connect_secs: defaults.connect.as_secs(),
            handshake_secs: defaults.handshake.as_secs(),
            auth_secs: defaults.auth.as_secs(),
            shutdown_grace_secs: defaults.shutdown_grace.as_secs(),
        }
    }
}

fn default_local_host() -> String {
    "127.0.0.1".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_true() -> bool {
    true
}

/// Secrets that may come from the command line or environment
#[derive(Debug, Default, Clone)]
pub struct SecretOverrides {
    pub password: Option<String>,
    pub passphrase: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    pub fn config_path() -> Result<PathBuf> {
        let proj_dirs =
            ProjectDirs::from("", "", "dbtunnel").context("Could not determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }

    pub fn host_key_policy(&self) -> HostKeyPolicy {
        match &self.host_key.fingerprint {
            Some(fingerprint) => HostKeyPolicy::Pinned(fingerprint.clone()),
            None => HostKeyPolicy::KnownHosts {
                path: self
                    .host_key
                    .known_hosts
                    .clone()
                    .unwrap_or_else(KnownHosts::default_path),
                accept_new: self.host_key.accept_new,
            },
        }
    }

    /// Build the validated tunnel configuration, letting `secrets` override
    /// anything stored in the file.
    pub fn to_tunnel_config(&self, secrets: SecretOverrides) -> Result<TunnelConfig> {
        let tunnel = self
            .tunnel
            .as_ref()
            .context("No [tunnel] section in config file")?;

        let auth = match &tunnel.auth {
            AuthSection::Password { password } => AuthMethod::Password {
                password: secrets
                    .password
                    .or_else(|| password.clone())
                    .unwrap_or_default(),
            },
            AuthSection::PublicKey {
                private_key_path,
                public_key_path,
                passphrase,
            } => AuthMethod::PublicKey {
                private_key_path: private_key_path.clone(),
                public_key_path: public_key_path
                    .clone()
                    .unwrap_or_else(|| default_public_key_path(private_key_path)),
                passphrase: secrets
                    .passphrase
                    .or_else(|| passphrase.clone())
                    .filter(|p| !p.is_empty()),
            },
        };

        let config = TunnelConfig {
            local_host: tunnel.local_host.clone(),
            local_port: tunnel.local_port,
            ssh_host: tunnel.ssh_host.clone(),
            ssh_port: tunnel.ssh_port,
            username: tunnel.username.clone(),
            auth,
            remote_host: tunnel.remote_host.clone(),
            remote_port: tunnel.remote_port,
            host_key: self.host_key_policy(),
            timeouts: Timeouts {
                connect: Duration::from_secs(self.timeouts.connect_secs),
                handshake: Duration::from_secs(self.timeouts.handshake_secs),
                auth: Duration::from_secs(self.timeouts.auth_secs),
                shutdown_grace: Duration::from_secs(self.timeouts.shutdown_grace_secs),
            },
        };

        config.validate()?;
        Ok(config)
    }
}

fn default_public_key_path(private_key_path: &Path) -> PathBuf {
    let mut path = private_key_path.as_os_str().to_owned();
    path.push(".pub");
    PathBuf::from(path)
}
