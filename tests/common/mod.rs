//! In-process SSH server and echo target shared by the integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::LineEnding;
use russh::keys::{Algorithm, HashAlg, PrivateKey, PublicKey};
use russh::{MethodKind, MethodSet};
use russh::server::{self, Auth, Msg, Session};
use russh::Channel;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub const USER: &str = "app";
pub const PASSWORD: &str = "secret";

/// What the fixture server lets in
#[derive(Clone, Default)]
pub struct ServerAuth {
    pub password: Option<String>,
    pub authorized_key: Option<PublicKey>,
    /// Stall every credential check this long before answering
    pub delay: Option<Duration>,
}

impl ServerAuth {
    pub fn password() -> Self {
        Self {
            password: Some(PASSWORD.to_string()),
            ..Self::default()
        }
    }

    pub fn public_key(key: PublicKey) -> Self {
        Self {
            authorized_key: Some(key),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn methods(&self) -> MethodSet {
        let mut methods = MethodSet::empty();
        if self.password.is_some() {
            methods.push(MethodKind::Password);
        }
        if self.authorized_key.is_some() {
            methods.push(MethodKind::PublicKey);
        }
        methods
    }
}

/// A russh server on 127.0.0.1 that honours direct-tcpip requests
pub struct SshServer {
    pub addr: SocketAddr,
    pub fingerprint: String,
    pub host_key: PublicKey,
    channels_opened: Arc<AtomicUsize>,
    accept_task: JoinHandle<()>,
}

impl SshServer {
    pub async fn start(auth: ServerAuth) -> Result<Self> {
        let host_key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)?;
        let public = host_key.public_key().clone();

        let config = Arc::new(server::Config {
            methods: auth.methods(),
            keys: vec![host_key],
            auth_rejection_time: Duration::from_millis(10),
            auth_rejection_time_initial: Some(Duration::from_millis(0)),
            inactivity_timeout: None,
            ..Default::default()
        });

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let channels_opened = Arc::new(AtomicUsize::new(0));

        let handler = FixtureHandler {
            auth,
            channels_opened: channels_opened.clone(),
        };

        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let config = config.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    if let Ok(session) = server::run_stream(config, stream, handler).await {
                        let _ = session.await;
                    }
                });
            }
        });

        Ok(Self {
            addr,
            fingerprint: public.fingerprint(HashAlg::Sha256).to_string(),
            host_key: public,
            channels_opened,
            accept_task,
        })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// direct-tcpip channels successfully opened so far
    pub fn channels_opened(&self) -> usize {
        self.channels_opened.load(Ordering::SeqCst)
    }
}

impl Drop for SshServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

#[derive(Clone)]
struct FixtureHandler {
    auth: ServerAuth,
    channels_opened: Arc<AtomicUsize>,
}

impl server::Handler for FixtureHandler {
    type Error = anyhow::Error;

    async fn auth_password(&mut self, _user: &str, password: &str) -> Result<Auth, Self::Error> {
        if let Some(delay) = self.auth.delay {
            tokio::time::sleep(delay).await;
        }
        if self.auth.password.as_deref() == Some(password) {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::reject())
        }
    }

    async fn auth_publickey(
        &mut self,
        _user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if let Some(delay) = self.auth.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.auth.authorized_key {
            Some(key) if key.key_data() == public_key.key_data() => Ok(Auth::Accept),
            _ => Ok(Auth::reject()),
        }
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Ok(port) = u16::try_from(port_to_connect) else {
            return Ok(false);
        };
        let Ok(mut target) = TcpStream::connect((host_to_connect, port)).await else {
            return Ok(false);
        };

        self.channels_opened.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let mut stream = channel.into_stream();
            let _ = tokio::io::copy_bidirectional(&mut stream, &mut target).await;
        });

        Ok(true)
    }
}

/// TCP server that writes back whatever it reads, standing in for the database
pub struct EchoServer {
    pub addr: SocketAddr,
    task: JoinHandle<()>,
}

impl EchoServer {
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let task = tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut reader, mut writer) = stream.split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                    let _ = writer.shutdown().await;
                });
            }
        });

        Ok(Self { addr, task })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

impl Drop for EchoServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Write an unencrypted Ed25519 key pair as `<name>` and `<name>.pub`
pub fn write_key_pair(dir: &Path, name: &str) -> Result<(PathBuf, PathBuf, PublicKey)> {
    write_key_pair_with_passphrase(dir, name, None)
}

/// Same as [`write_key_pair`], encrypting the private key when a passphrase is given
pub fn write_key_pair_with_passphrase(
    dir: &Path,
    name: &str,
    passphrase: Option<&str>,
) -> Result<(PathBuf, PathBuf, PublicKey)> {
    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)?;
    let public = key.public_key().clone();
    let private_path = dir.join(name);
    let public_path = dir.join(format!("{}.pub", name));

    let stored = match passphrase {
        Some(passphrase) => key.encrypt(&mut OsRng, passphrase)?,
        None => key,
    };
    std::fs::write(&private_path, stored.to_openssh(LineEnding::LF)?.as_bytes())?;
    std::fs::write(&public_path, public.to_openssh()?)?;

    Ok((private_path, public_path, public))
}

/// Accepts TCP connections and holds them open without ever speaking SSH
pub struct SilentServer {
    pub addr: SocketAddr,
    task: JoinHandle<()>,
}

impl SilentServer {
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let task = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        Ok(Self { addr, task })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

impl Drop for SilentServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A port nothing is listening on right now
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .unwrap()
}

/// Send `payload` through `stream` and read back the same number of bytes
pub async fn round_trip(stream: &mut TcpStream, payload: &[u8]) -> Result<Vec<u8>> {
    let mut echoed = vec![0u8; payload.len()];
    let (mut reader, mut writer) = stream.split();

    let write = async {
        writer.write_all(payload).await?;
        writer.flush().await
    };
    let read = reader.read_exact(&mut echoed);

    let (written, read) = tokio::time::timeout(Duration::from_secs(10), async {
        tokio::join!(write, read)
    })
    .await?;
    written?;
    read?;

    Ok(echoed)
}
