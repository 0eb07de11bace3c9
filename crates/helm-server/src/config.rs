//! Replica process configuration.

use std::net::SocketAddr;
use std::path::PathBuf;

use helm_store::EngineKind;
use helm_types::NodeId;

/// Configuration for one replica process.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// This replica's unique id.
    pub id: NodeId,
    /// Address the RPC server binds to.
    pub bind: SocketAddr,
    /// The other replicas, as `(id, address)` pairs.
    pub peers: Vec<(NodeId, SocketAddr)>,
    /// Directory holding the index file.
    pub data_dir: PathBuf,
    /// Storage backend selector.
    pub engine: EngineKind,
}

impl ServerConfig {
    /// Creates a single-replica configuration.
    pub fn single(id: impl Into<NodeId>, bind: SocketAddr, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            bind,
            peers: Vec::new(),
            data_dir: data_dir.into(),
            engine: EngineKind::default(),
        }
    }

    /// Adds a peer replica.
    pub fn with_peer(mut self, id: impl Into<NodeId>, addr: SocketAddr) -> Self {
        self.peers.push((id.into(), addr));
        self
    }

    /// Sets the storage backend.
    pub fn with_engine(mut self, engine: EngineKind) -> Self {
        self.engine = engine;
        self
    }

    /// Returns the path of this replica's index file.
    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}.helm", self.id))
    }
}

/// Parses a peer given as `id:host:port`.
pub fn parse_peer(arg: &str) -> Result<(NodeId, SocketAddr), String> {
    let (id, addr) = arg
        .split_once(':')
        .ok_or_else(|| format!("expected id:host:port, got '{arg}'"))?;
    if id.is_empty() {
        return Err(format!("empty peer id in '{arg}'"));
    }
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| format!("bad peer address in '{arg}': {e}"))?;
    Ok((NodeId::new(id), addr))
}

#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn peer_parsing() {
        let (id, addr) = parse_peer("n2:127.0.0.1:7102").unwrap();
        assert_eq!(id, NodeId::new("n2"));
        assert_eq!(addr, "127.0.0.1:7102".parse().unwrap());

        assert!(parse_peer("missing-addr").is_err());
        assert!(parse_peer(":127.0.0.1:7102").is_err());
        assert!(parse_peer("n2:not-an-addr").is_err());
    }

    #[test]
    fn index_path_is_per_replica() {
        let config = ServerConfig::single("n1", "127.0.0.1:7101".parse().unwrap(), "/tmp/helm");
        assert_eq!(config.index_path(), PathBuf::from("/tmp/helm/n1.helm"));
    }
}
