//! Process-wide directory of replicas.
//!
//! The registry maps peer identities to addresses for outbound RPC
//! dispatch and leader discovery. Replicas running in this process also
//! register a handle, which the loopback transport and the multi-leader
//! monitor use. The registry is an explicit dependency handed to each
//! replica and façade; there is no hidden global instance.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{info, warn};

use helm_types::{NodeId, Term};

use crate::node::RaftNode;

/// One registered replica.
struct RegistryEntry {
    addr: SocketAddr,
    /// Set for replicas running in this process.
    node: Option<Arc<RaftNode>>,
}

/// Directory of peer identities and in-process replica handles.
#[derive(Default)]
pub struct ClusterRegistry {
    entries: RwLock<HashMap<NodeId, RegistryEntry>>,
    monitor_stop: Arc<AtomicBool>,
}

impl ClusterRegistry {
    /// Creates an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Records the address of a replica (local or remote).
    pub fn register_peer(&self, id: NodeId, addr: SocketAddr) {
        self.entries
            .write()
            .expect("lock poisoned")
            .entry(id)
            .or_insert(RegistryEntry { addr, node: None })
            .addr = addr;
    }

    /// Attaches a handle for a replica running in this process.
    ///
    /// The address must already be registered (or is taken from the node).
    pub fn register_node(&self, node: &Arc<RaftNode>) {
        let mut entries = self.entries.write().expect("lock poisoned");
        entries.insert(
            node.id().clone(),
            RegistryEntry {
                addr: node.addr(),
                node: Some(Arc::clone(node)),
            },
        );
        info!(node = %node.id(), addr = %node.addr(), "replica registered");
    }

    /// Removes a replica from the directory.
    pub fn deregister(&self, id: &NodeId) {
        if self
            .entries
            .write()
            .expect("lock poisoned")
            .remove(id)
            .is_some()
        {
            info!(node = %id, "replica deregistered");
        }
    }

    /// Returns the address registered for `id`.
    pub fn address_of(&self, id: &NodeId) -> Option<SocketAddr> {
        self.entries
            .read()
            .expect("lock poisoned")
            .get(id)
            .map(|e| e.addr)
    }

    /// Returns the in-process handle for `id`, if any.
    pub fn node_of(&self, id: &NodeId) -> Option<Arc<RaftNode>> {
        self.entries
            .read()
            .expect("lock poisoned")
            .get(id)
            .and_then(|e| e.node.clone())
    }

    /// Returns all registered replica ids.
    pub fn ids(&self) -> Vec<NodeId> {
        self.entries
            .read()
            .expect("lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Returns all in-process replica handles.
    pub fn local_nodes(&self) -> Vec<Arc<RaftNode>> {
        self.entries
            .read()
            .expect("lock poisoned")
            .values()
            .filter_map(|e| e.node.clone())
            .collect()
    }

    /// Finds the current leader among in-process replicas.
    ///
    /// When several replicas claim leadership (transiently possible while
    /// a deposed leader has not yet heard of a newer term), the one with
    /// the highest term wins.
    pub fn find_leader(&self) -> Option<(NodeId, Term, SocketAddr)> {
        let entries = self.entries.read().expect("lock poisoned");
        entries
            .values()
            .filter_map(|e| {
                let node = e.node.as_ref()?;
                let status = node.status();
                status
                    .is_leader()
                    .then(|| (node.id().clone(), status.term, e.addr))
            })
            .max_by_key(|(_, term, _)| *term)
    }

    /// Starts the multi-leader monitor.
    ///
    /// Correct execution never produces two leaders in one term, but a
    /// deposed leader can linger until it hears a higher term. The monitor
    /// periodically steps down every leader except the highest-term one.
    pub fn spawn_monitor(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let stop = Arc::clone(&self.monitor_stop);

        thread::Builder::new()
            .name("cluster-monitor".into())
            .spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    thread::sleep(interval);

                    let leaders: Vec<(Arc<RaftNode>, Term)> = registry
                        .local_nodes()
                        .into_iter()
                        .filter_map(|node| {
                            let status = node.status();
                            status.is_leader().then(|| (node, status.term))
                        })
                        .collect();

                    if leaders.len() <= 1 {
                        continue;
                    }

                    let highest = leaders
                        .iter()
                        .map(|(_, term)| *term)
                        .max()
                        .unwrap_or(Term::ZERO);
                    warn!(
                        count = leaders.len(),
                        highest = %highest,
                        "multiple leaders detected, resolving"
                    );

                    let mut kept = false;
                    for (node, term) in leaders {
                        if term == highest && !kept {
                            kept = true;
                            continue;
                        }
                        warn!(node = %node.id(), term = %term, "stepping down surplus leader");
                        node.step_down();
                    }
                }
            })
            .expect("spawn monitor thread")
    }

    /// Stops a monitor started with [`spawn_monitor`](Self::spawn_monitor).
    pub fn stop_monitor(&self) {
        self.monitor_stop.store(true, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for ClusterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.entries.read().expect("lock poisoned");
        f.debug_struct("ClusterRegistry")
            .field("replicas", &entries.len())
            .field(
                "local",
                &entries.values().filter(|e| e.node.is_some()).count(),
            )
            .finish()
    }
}
