//! kappad: the Kappa daemon.
//!
//! Runs a Kappa server node: the authenticated RPC transport plus gossip
//! membership. Without an external overlay the node gossips over an
//! in-process hub, which makes it a single-node cluster.
//!
//! # Usage
//!
//! ```text
//! kappad server --config /etc/kappa/kappa.toml --bootstrap
//! kappad keygen
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use rand::RngCore;
use tracing::{debug, info, warn};

use kappa_server::{Server, ServerConfig};
use kappa_transport::SigningKey;

#[derive(Parser)]
#[command(name = "kappad", about = "Kappa daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a server node.
    Server(ServerArgs),

    /// Generate an ed25519 client key pair.
    Keygen {
        /// User name to print in the authorized_keys line.
        #[arg(long, default_value = "admin")]
        user: String,
    },
}

#[derive(clap::Args)]
struct ServerArgs {
    /// Path to kappa.toml.
    #[arg(long, short)]
    config: Option<PathBuf>,

    #[arg(long)]
    node_name: Option<String>,

    #[arg(long)]
    cluster: Option<String>,

    /// Transport bind address, `host:port` or `:port`.
    #[arg(long)]
    bind: Option<String>,

    #[arg(long)]
    authorized_keys: Option<PathBuf>,

    /// Gossip seed to join; repeatable.
    #[arg(long = "join")]
    join: Vec<String>,

    /// Form a single-node cluster.
    #[arg(long)]
    bootstrap: bool,

    /// Servers to wait for before forming the cluster.
    #[arg(long)]
    bootstrap_expect: Option<usize>,

    #[arg(long)]
    gossip_port: Option<u16>,
}

impl ServerArgs {
    fn load(self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_file(path)?,
            None => ServerConfig::default(),
        };
        if let Some(name) = self.node_name {
            config.node_name = name;
        }
        if let Some(cluster) = self.cluster {
            config.cluster_name = cluster;
        }
        if let Some(bind) = self.bind {
            config.bind_address = bind;
        }
        if let Some(path) = self.authorized_keys {
            config.authorized_keys = Some(path);
        }
        if !self.join.is_empty() {
            config.existing_nodes = self.join;
        }
        if self.bootstrap {
            config.bootstrap = true;
        }
        if let Some(expect) = self.bootstrap_expect {
            config.bootstrap_expect = expect;
        }
        if let Some(port) = self.gossip_port {
            config.gossip.bind_port = port;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,kappad=debug,kappa=debug".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Server(args) => run_server(args.load()?).await,
        Command::Keygen { user } => {
            keygen(&user);
            Ok(())
        }
    }
}

async fn run_server(config: ServerConfig) -> anyhow::Result<()> {
    info!(node = %config.node_name, cluster = %config.cluster_name, "kappa daemon starting");

    let server = Server::builder(config).build()?;
    info!(fingerprint = %server.host_fingerprint(), "host identity ready");

    if let Some(mut reconcile) = server.take_reconcile_stream() {
        tokio::spawn(async move {
            while let Some(member) = reconcile.recv().await {
                debug!(member = %member.name, status = %member.status, "reconcile requested");
            }
        });
    }
    if let Some(mut events) = server.take_user_events() {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                info!(event = %event.name, bytes = event.payload.len(), "user event");
            }
        });
    }
    let mut formed = server.bootstrap().subscribe();
    tokio::spawn(async move {
        if formed.wait_for(Option::is_some).await.is_ok() {
            info!("cluster formed");
        }
    });

    server.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    if let Err(err) = server.stop().await {
        warn!(error = %format!("{err:#}"), "server stopped with errors");
    }
    info!("kappa daemon stopped");
    Ok(())
}

fn keygen(user: &str) {
    let mut seed = [0u8; 32];
    rand::rng().fill_bytes(&mut seed);
    let key = SigningKey::from_bytes(&seed);

    println!("# private key (keep secret)");
    println!("{}", hex::encode(seed));
    println!("# authorized_keys line");
    println!("{user} {}", hex::encode(key.verifying_key().as_bytes()));
}
