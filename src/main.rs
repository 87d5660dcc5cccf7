//! dbtunnel CLI
//!
//! Exposes a database that is only reachable from an SSH server on a local
//! port, for as long as the process runs.

#![deny(clippy::correctness)]
#![warn(clippy::suspicious)]
#![warn(clippy::style)]
#![warn(clippy::complexity)]
#![warn(clippy::perf)]

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dbtunnel::config::{Config, SecretOverrides};
use dbtunnel::hostkeys::KnownHosts;
use dbtunnel::{AuthMethod, HostKeyPolicy, TunnelConfig, TunnelManager};

#[derive(Parser, Debug)]
#[command(name = "dbtunnel")]
#[command(author, version, about = "Reach a remote database through an SSH tunnel")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true, env = "DBTUNNEL_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the tunnel and keep it up until Ctrl-C
    Start(StartArgs),

    /// Validate the config file and print what would be started
    Check {
        #[command(flatten)]
        secrets: SecretArgs,
    },

    /// Forget the trusted host key of an SSH server
    ForgetHost {
        /// SSH server hostname or address
        host: String,

        #[arg(short, long, default_value = "22")]
        port: u16,
    },
}

#[derive(Parser, Debug)]
struct StartArgs {
    /// Override the local port (0 picks a free one)
    #[arg(short = 'l', long)]
    local_port: Option<u16>,

    #[command(flatten)]
    secrets: SecretArgs,
}

#[derive(Args, Debug)]
struct SecretArgs {
    /// SSH password, instead of storing it in the config file
    #[arg(long, env = "DBTUNNEL_SSH_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Private key passphrase
    #[arg(long, env = "DBTUNNEL_KEY_PASSPHRASE", hide_env_values = true)]
    passphrase: Option<String>,
}

impl From<SecretArgs> for SecretOverrides {
    fn from(args: SecretArgs) -> Self {
        SecretOverrides {
            password: args.password,
            passphrase: args.passphrase,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = cli.config.as_deref();

    match cli.command {
        Some(Commands::Start(args)) => run_start(config_path, args).await,
        Some(Commands::Check { secrets }) => run_check(config_path, secrets.into()),
        Some(Commands::ForgetHost { host, port }) => run_forget_host(config_path, &host, port),
        None => {
            eprintln!("No command specified. Use --help for usage information.");
            eprintln!();
            eprintln!("Quick start:");
            eprintln!("  dbtunnel check                  Validate the config file");
            eprintln!("  dbtunnel start                  Start the tunnel");
            eprintln!("  dbtunnel forget-host <host>     Drop a trusted host key");
            std::process::exit(1);
        }
    }
}

/// Explicit `--config` path, or the platform default
fn load_config(config_path: Option<&Path>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

fn display_path(config_path: Option<&Path>) -> String {
    config_path
        .map(Path::to_path_buf)
        .or_else(|| Config::config_path().ok())
        .unwrap_or_default()
        .display()
        .to_string()
}

fn load_tunnel_config(
    config_path: Option<&Path>,
    secrets: SecretOverrides,
) -> Result<TunnelConfig> {
    let config = load_config(config_path)?;
    if config.tunnel.is_none() {
        anyhow::bail!(
            "No tunnel configured. Add a [tunnel] section to {}",
            display_path(config_path)
        );
    }
    config.to_tunnel_config(secrets)
}

async fn run_start(config_path: Option<&Path>, args: StartArgs) -> Result<()> {
    let mut tunnel_config = load_tunnel_config(config_path, args.secrets.into())?;
    if let Some(port) = args.local_port {
        tunnel_config.local_port = port;
    }

    let remote = format!("{}:{}", tunnel_config.remote_host, tunnel_config.remote_port);
    let via = tunnel_config.ssh_authority();

    let mut manager = TunnelManager::new();
    let local_addr = manager
        .start(tunnel_config)
        .await
        .context("Failed to start tunnel")?;

    println!("Tunnel up: {} -> {} via {}", local_addr, remote, via);
    println!("Press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutting down...");
    manager.stop().await;

    Ok(())
}

fn run_check(config_path: Option<&Path>, secrets: SecretOverrides) -> Result<()> {
    let tunnel = load_tunnel_config(config_path, secrets)?;

    println!("Config: {}", display_path(config_path));
    println!();
    println!("  Local:      {}", tunnel.local_addr()?);
    println!("  SSH server: {} as {}", tunnel.ssh_authority(), tunnel.username);
    println!("  Remote:     {}:{}", tunnel.remote_host, tunnel.remote_port);
    match &tunnel.auth {
        AuthMethod::Password { .. } => println!("  Auth:       password"),
        AuthMethod::PublicKey {
            private_key_path, ..
        } => println!("  Auth:       public key {}", private_key_path.display()),
    }
    match &tunnel.host_key {
        HostKeyPolicy::Pinned(fingerprint) => println!("  Host key:   pinned {}", fingerprint),
        HostKeyPolicy::KnownHosts { path, accept_new } => println!(
            "  Host key:   {} ({})",
            path.display(),
            if *accept_new {
                "trust on first use"
            } else {
                "known hosts only"
            }
        ),
    }

    Ok(())
}

fn run_forget_host(config_path: Option<&Path>, host: &str, port: u16) -> Result<()> {
    let config = load_config(config_path)?;
    let store = config
        .host_key
        .known_hosts
        .unwrap_or_else(KnownHosts::default_path);
    let mut known = KnownHosts::load(&store)?;

    if known.remove(host, port) {
        known.save()?;
        println!("Removed host key for {}:{}", host, port);
    } else {
        println!("No host key stored for {}:{}", host, port);
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
