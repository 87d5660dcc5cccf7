//! Trusted SSH host keys.
//!
//! Keys are stored as SHA-256 fingerprints in `known_hosts.toml`, keyed by
//! `host:port`. A changed key is always rejected; an unknown key is either
//! learned (trust on first use) or rejected depending on the tunnel's
//! [`HostKeyPolicy`].

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use russh::keys::{HashAlg, PublicKey};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::TunnelError;
use crate::tunnel::HostKeyPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostKeyEntry {
    pub algorithm: String,
    pub fingerprint: String,
    /// RFC 3339 timestamp of when the key was first trusted
    pub added: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct KnownHostsFile {
    #[serde(default)]
    hosts: BTreeMap<String, HostKeyEntry>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum VerifyResult {
    Trusted,
    Unknown,
    Mismatch { expected: String, actual: String },
}

pub struct KnownHosts {
    path: PathBuf,
    hosts: BTreeMap<String, HostKeyEntry>,
}

/// `SHA256:<base64>` fingerprint of a host key
pub fn fingerprint(key: &PublicKey) -> String {
    key.fingerprint(HashAlg::Sha256).to_string()
}

fn authority(host: &str, port: u16) -> String {
    format!("{}:{}", host, port)
}

impl KnownHosts {
    /// Load the store, or start an empty one if the file doesn't exist yet
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self {
                path: path.to_path_buf(),
                hosts: BTreeMap::new(),
            });
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read known hosts: {}", path.display()))?;
        let file: KnownHostsFile = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse known hosts: {}", path.display()))?;

        Ok(Self {
            path: path.to_path_buf(),
            hosts: file.hosts,
        })
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create known hosts directory: {}", parent.display())
            })?;
        }

        let file = KnownHostsFile {
            hosts: self.hosts.clone(),
        };
        let contents = toml::to_string_pretty(&file).context("Failed to serialize known hosts")?;

        fs::write(&self.path, contents)
            .with_context(|| format!("Failed to write known hosts: {}", self.path.display()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, host: &str, port: u16) -> Option<&HostKeyEntry> {
        self.hosts.get(&authority(host, port))
    }

    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> VerifyResult {
        let actual = fingerprint(key);
        match self.get(host, port) {
            None => VerifyResult::Unknown,
            Some(entry) if entry.fingerprint == actual => VerifyResult::Trusted,
            Some(entry) => VerifyResult::Mismatch {
                expected: entry.fingerprint.clone(),
                actual,
            },
        }
    }

    pub fn add(&mut self, host: &str, port: u16, key: &PublicKey) {
        self.hosts.insert(
            authority(host, port),
            HostKeyEntry {
                algorithm: key.algorithm().to_string(),
                fingerprint: fingerprint(key),
                added: chrono::Utc::now().to_rfc3339(),
            },
        );
    }

    /// Returns true if an entry was removed
    pub fn remove(&mut self, host: &str, port: u16) -> bool {
        self.hosts.remove(&authority(host, port)).is_some()
    }

    /// Default store location (`<data dir>/dbtunnel/known_hosts.toml`)
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("", "", "dbtunnel")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
            .join("known_hosts.toml")
    }
}

fn rejection(host: &str, port: u16, key: &PublicKey, reason: String) -> TunnelError {
    TunnelError::HostKeyRejected {
        host: authority(host, port),
        fingerprint: fingerprint(key),
        reason,
    }
}

/// Decide whether the server presenting `key` may be talked to.
///
/// Store lookups and writes run on the blocking pool since this is called
/// from inside the SSH handshake.
pub async fn check_host_key(
    policy: &HostKeyPolicy,
    host: &str,
    port: u16,
    key: &PublicKey,
) -> std::result::Result<(), TunnelError> {
    match policy {
        HostKeyPolicy::Pinned(expected) => check_pinned(expected, host, port, key),
        HostKeyPolicy::KnownHosts { path, accept_new } => {
            let path = path.clone();
            let accept_new = *accept_new;
            let owned_host = host.to_string();
            let owned_key = key.clone();

            tokio::task::spawn_blocking(move || {
                check_known_hosts(&path, accept_new, &owned_host, port, &owned_key)
            })
            .await
            .map_err(|e| rejection(host, port, key, format!("host key check aborted: {}", e)))?
        }
    }
}

fn check_pinned(
    expected: &str,
    host: &str,
    port: u16,
    key: &PublicKey,
) -> std::result::Result<(), TunnelError> {
    let actual = fingerprint(key);
    if expected == actual {
        info!("Host key for {}:{} matches pinned fingerprint", host, port);
        Ok(())
    } else {
        error!(
            "Host key for {}:{} does not match pinned fingerprint (expected {}, got {})",
            host, port, expected, actual
        );
        Err(rejection(
            host,
            port,
            key,
            format!("expected pinned fingerprint {}", expected),
        ))
    }
}

fn check_known_hosts(
    path: &Path,
    accept_new: bool,
    host: &str,
    port: u16,
    key: &PublicKey,
) -> std::result::Result<(), TunnelError> {
    let reject = |reason: String| rejection(host, port, key, reason);
    let mut known = KnownHosts::load(path).map_err(|e| reject(format!("{:#}", e)))?;

    match known.verify(host, port, key) {
        VerifyResult::Trusted => {
            info!("Host key verified for {}:{}", host, port);
            Ok(())
        }
        VerifyResult::Unknown if accept_new => {
            known.add(host, port, key);
            known.save().map_err(|e| reject(format!("{:#}", e)))?;
            warn!(
                "Permanently added {}:{} ({} {}) to {}",
                host,
                port,
                key.algorithm(),
                fingerprint(key),
                known.path().display()
            );
            Ok(())
        }
        VerifyResult::Unknown => Err(reject(format!(
            "host is not in {} and new keys are not accepted",
            known.path().display()
        ))),
        VerifyResult::Mismatch { expected, actual } => {
            error!("REMOTE HOST IDENTIFICATION HAS CHANGED for {}:{}", host, port);
            error!("Expected fingerprint: {}", expected);
            error!("Actual fingerprint: {}", actual);
            error!(
                "Run `dbtunnel forget-host {} --port {}` if the change is expected",
                host, port
            );
            Err(reject(format!("key changed, previously trusted {}", expected)))
        }
    }
}
