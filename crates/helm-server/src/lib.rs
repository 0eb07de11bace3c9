//! # helm-server: replica process plumbing for `HelmDB`
//!
//! Ties the storage and consensus crates into a runnable replica:
//!
//! - [`ServerConfig`] — id, bind address, peers, data directory, engine
//! - [`Server`] — the framed RPC listener (peer + client traffic)
//! - [`KvClient`] — connection-holding client with leader-redirect logic
//! - [`bootstrap`] — builds the registry, transport, node, and façade
//!
//! The `helm-server` binary wraps this with `serve` and `shell`
//! subcommands.

mod client;
mod config;
mod server;
pub mod shell;

#[cfg(test)]
mod tests;

pub use client::{ClientFailure, KvClient};
pub use config::{parse_peer, ServerConfig};
pub use server::Server;

use std::sync::Arc;

use tracing::info;

use helm_raft::{ClusterRegistry, RaftConfig, RaftNode, ReplicatedStore, TcpTransport};
use helm_store::{open_engine, StoreError};
use helm_types::NodeId;

// ============================================================================
// Errors
// ============================================================================

/// Errors starting or running a replica process.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Socket-level failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame-level failure on a connection.
    #[error(transparent)]
    Framing(#[from] helm_raft::FramingError),

    /// The index could not be opened.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

// ============================================================================
// Bootstrap
// ============================================================================

/// A fully wired replica: node, façade, and registry.
pub struct Replica {
    pub store: ReplicatedStore,
    pub registry: Arc<ClusterRegistry>,
}

/// Builds a replica from its configuration.
///
/// Opens the index at `data_dir/<id>.helm` (for the tree engine), wires
/// the TCP transport through a fresh registry, registers all peers, and
/// starts the raft node and the registry monitor. The RPC server is
/// started separately via [`Server::start`].
pub fn bootstrap(config: &ServerConfig, raft: RaftConfig) -> Result<Replica, ServerError> {
    std::fs::create_dir_all(&config.data_dir)?;
    let engine = open_engine(config.engine, config.index_path())?;

    let registry = ClusterRegistry::new();
    registry.register_peer(config.id.clone(), config.bind);
    for (id, addr) in &config.peers {
        registry.register_peer(id.clone(), *addr);
    }

    let transport = Arc::new(TcpTransport::new(Arc::clone(&registry)));
    let peer_ids: Vec<NodeId> = config.peers.iter().map(|(id, _)| id.clone()).collect();

    let node = RaftNode::spawn(
        config.id.clone(),
        config.bind,
        peer_ids,
        engine,
        transport,
        Arc::clone(&registry),
        raft.clone(),
    );
    registry.spawn_monitor(raft.monitor_interval);

    info!(
        id = %config.id,
        engine = ?config.engine,
        peers = config.peers.len(),
        "replica bootstrapped"
    );

    Ok(Replica {
        store: ReplicatedStore::new(node),
        registry,
    })
}
