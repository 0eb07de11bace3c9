//! `helm-server`: run a replica or an interactive client shell.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use helm_raft::RaftConfig;
use helm_server::{bootstrap, parse_peer, shell, Server, ServerConfig};
use helm_store::EngineKind;
use helm_types::NodeId;

/// Replicated key/value store.
#[derive(Parser)]
#[command(name = "helm-server")]
#[command(about = "HelmDB replica and client shell", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a replica.
    Serve {
        /// Unique replica id.
        #[arg(long)]
        id: String,

        /// Address to bind the RPC server to.
        #[arg(long)]
        bind: SocketAddr,

        /// Peer replica as id:host:port; repeat per peer.
        #[arg(long = "peer", value_parser = parse_peer)]
        peers: Vec<(NodeId, SocketAddr)>,

        /// Directory for the index file.
        #[arg(long, default_value = "./helm-data")]
        data_dir: PathBuf,

        /// Storage backend (tree | memory).
        #[arg(long, default_value = "tree")]
        engine: EngineKind,
    },

    /// Open an interactive shell against a replica.
    Shell {
        /// Address of any replica.
        #[arg(long, default_value = "127.0.0.1:7101")]
        server: SocketAddr,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Commands::Serve {
            id,
            bind,
            peers,
            data_dir,
            engine,
        } => {
            let mut config = ServerConfig::single(id, bind, data_dir).with_engine(engine);
            config.peers = peers;

            let replica = bootstrap(&config, RaftConfig::default())
                .with_context(|| format!("starting replica {}", config.id))?;
            let mut server =
                Server::start(replica.store).context("starting the RPC server")?;

            // Runs until the process is killed.
            server.join();
            Ok(())
        }
        Commands::Shell { server } => shell::run(server).context("running the shell"),
    }
}
