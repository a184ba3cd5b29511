//! driftnet node CLI.
//!
//! Parses arguments, builds a [`Config`], brings up a
//! [`ConnectionManager`]/[`Orchestrator`] pair over a TCP direct transport,
//! and runs until interrupted.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use driftnet::config::Config;
use driftnet::connection::ConnectionManager;
use driftnet::identity::{generate_node_id, KeyPair};
use driftnet::transport::tcp::TcpTransportFactory;
use driftnet::{Orchestrator, Result};

#[derive(Parser, Debug)]
#[command(author, version, about = "Encrypted, intent-addressed peer-to-peer overlay node", long_about = None)]
struct Args {
    /// Tracing filter, e.g. "info" or "driftnet=debug"
    #[arg(short, long, default_value = "info")]
    verbosity: String,

    /// Address to listen on for inbound direct connections
    #[arg(short, long, default_value = "0.0.0.0:8787")]
    listen: String,

    /// Relay server endpoint, repeatable; tried in order when a direct
    /// connection attempt fails
    #[arg(long = "relay")]
    relay_servers: Vec<String>,

    /// Optional TOML config file; CLI flags override its values
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Peer table cap
    #[arg(long)]
    max_connections: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&args.verbosity))
        .init();

    let mut config = match &args.config {
        Some(path) => Config::from_toml_file(path)?,
        None => Config::default(),
    };
    if !args.relay_servers.is_empty() {
        config.connection.relay_servers = args.relay_servers.clone();
    }
    if let Some(max_connections) = args.max_connections {
        config.max_connections = max_connections;
    }

    let local_node_id = generate_node_id()?;
    let local_keypair = KeyPair::generate();
    tracing::info!(node_id = %local_node_id, "generated ephemeral identity");

    let factory = Arc::new(TcpTransportFactory::new(local_node_id.to_string()));
    let connections = Arc::new(ConnectionManager::new(
        local_node_id.clone(),
        local_keypair,
        config.connection.clone(),
        config.max_connections,
        factory,
    ));

    let bind_addr: SocketAddr = args
        .listen
        .parse()
        .map_err(|e| driftnet::Error::Config(format!("invalid --listen address: {e}")))?;
    let listen_timeout = Duration::from_millis(config.connection.timeout_ms);
    let listener_connections = connections.clone();
    tokio::spawn(async move {
        if let Err(e) =
            driftnet::transport::tcp::listen(bind_addr, listener_connections, listen_timeout).await
        {
            tracing::error!(error = %e, "inbound listener stopped");
        }
    });

    let orchestrator = Arc::new(Orchestrator::new(local_node_id, connections, config.gossip));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let run_handle = tokio::spawn(orchestrator.clone().run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| driftnet::Error::Fatal(format!("failed to listen for ctrl-c: {e}")))?;
    tracing::info!("shutdown requested");
    let _ = shutdown_tx.send(true);
    let _ = run_handle.await;

    Ok(())
}
