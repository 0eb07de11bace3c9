//! Transport abstraction for peer RPCs.
//!
//! The consensus core issues request/response RPCs through the
//! [`Transport`] trait and never touches sockets itself. Implementations:
//!
//! - [`LoopbackTransport`] — in-process dispatch through the cluster
//!   registry, with a partition switch for cluster tests
//! - [`TcpTransport`](crate::tcp::TcpTransport) — framed blocking TCP
//!
//! Every call is made with the caller's raft lock released; a slow or
//! unreachable peer therefore only stalls the calling task, never the
//! replica's state machine.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, RwLock};

use helm_types::NodeId;

use crate::message::{AppendRequest, AppendResponse, VoteRequest, VoteResponse};
use crate::registry::ClusterRegistry;

// ============================================================================
// Errors
// ============================================================================

/// Errors delivering a peer RPC.
///
/// Transport failures are never protocol decisions: the caller retries on
/// its own schedule (heartbeat for replication, next election for votes).
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The peer has no known address or is not accepting connections.
    #[error("peer {0} unreachable")]
    Unreachable(NodeId),

    /// Socket-level failure.
    #[error("transport I/O: {0}")]
    Io(String),

    /// The peer answered with something other than the matching response.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

// ============================================================================
// Transport Trait
// ============================================================================

/// Request/response RPC delivery between replicas.
pub trait Transport: Send + Sync + Debug {
    /// Sends a vote request and waits for the reply.
    fn request_vote(&self, to: &NodeId, request: VoteRequest)
        -> Result<VoteResponse, TransportError>;

    /// Sends an append-entries request and waits for the reply.
    fn append_entries(
        &self,
        to: &NodeId,
        request: AppendRequest,
    ) -> Result<AppendResponse, TransportError>;
}

// ============================================================================
// Loopback Network
// ============================================================================

/// Shared fabric for in-process clusters.
///
/// Dispatches RPCs directly to the target replica's handlers via the
/// registry. [`partition`](LoopbackNet::partition) splits the fabric into
/// groups that cannot reach each other, for split-brain tests.
#[derive(Debug)]
pub struct LoopbackNet {
    registry: Arc<ClusterRegistry>,
    /// When set, maps each node to its partition group; RPCs cross group
    /// boundaries with `Unreachable`.
    groups: RwLock<Option<HashMap<NodeId, usize>>>,
}

impl LoopbackNet {
    /// Creates a fabric over the given registry.
    pub fn new(registry: Arc<ClusterRegistry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            groups: RwLock::new(None),
        })
    }

    /// Returns a transport endpoint for one replica.
    pub fn transport(self: &Arc<Self>, local: NodeId) -> LoopbackTransport {
        LoopbackTransport {
            net: Arc::clone(self),
            local,
        }
    }

    /// Splits the fabric into isolated groups.
    pub fn partition(&self, groups: &[&[NodeId]]) {
        let mut map = HashMap::new();
        for (index, group) in groups.iter().enumerate() {
            for id in *group {
                map.insert(id.clone(), index);
            }
        }
        *self.groups.write().expect("lock poisoned") = Some(map);
    }

    /// Removes all partitions.
    pub fn heal(&self) {
        *self.groups.write().expect("lock poisoned") = None;
    }

    fn reachable(&self, from: &NodeId, to: &NodeId) -> bool {
        match &*self.groups.read().expect("lock poisoned") {
            None => true,
            Some(map) => match (map.get(from), map.get(to)) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            },
        }
    }
}

/// One replica's endpoint on a [`LoopbackNet`].
#[derive(Debug, Clone)]
pub struct LoopbackTransport {
    net: Arc<LoopbackNet>,
    local: NodeId,
}

impl Transport for LoopbackTransport {
    fn request_vote(
        &self,
        to: &NodeId,
        request: VoteRequest,
    ) -> Result<VoteResponse, TransportError> {
        if !self.net.reachable(&self.local, to) {
            return Err(TransportError::Unreachable(to.clone()));
        }
        let node = self
            .net
            .registry
            .node_of(to)
            .ok_or_else(|| TransportError::Unreachable(to.clone()))?;
        Ok(node.handle_request_vote(request))
    }

    fn append_entries(
        &self,
        to: &NodeId,
        request: AppendRequest,
    ) -> Result<AppendResponse, TransportError> {
        if !self.net.reachable(&self.local, to) {
            return Err(TransportError::Unreachable(to.clone()));
        }
        let node = self
            .net
            .registry
            .node_of(to)
            .ok_or_else(|| TransportError::Unreachable(to.clone()))?;
        Ok(node.handle_append_entries(request))
    }
}
