//! Per-peer replicator tasks.
//!
//! The leader keeps one long-lived replicator per peer rather than
//! spawning a task per entry. Each replicator sleeps on its own signal;
//! the heartbeat ticker and the client submission path wake it, and every
//! pass sends one `AppendEntries` built from the peer's `next_index` —
//! which doubles as the heartbeat when the peer is already caught up.
//!
//! The raft lock is held only to build the request and to integrate the
//! response, never across the network call.

use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, trace};

use helm_types::{LogIndex, NodeId};

use crate::message::AppendRequest;
use crate::node::{RaftNode, Role};

/// Result of one replication pass.
enum Pass {
    /// Nothing further to do until the next wake.
    Done,
    /// Consistency-check mismatch: retry immediately with a lower
    /// `next_index`.
    Retry,
}

/// Handle to a running replicator thread.
pub(crate) struct Replicator {
    signal: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl Replicator {
    /// Spawns the replicator thread for `peer`.
    pub(crate) fn spawn(node: &Arc<RaftNode>, peer: NodeId) -> Self {
        let signal = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_signal = Arc::clone(&signal);
        let weak = Arc::downgrade(node);
        let idle_wait = node.config().heartbeat_interval;

        let handle = thread::Builder::new()
            .name(format!("replicator-{peer}"))
            .spawn(move || run(weak, peer, thread_signal, idle_wait))
            .expect("spawn replicator thread");

        Self {
            signal,
            handle: Some(handle),
        }
    }

    /// Wakes the replicator for a pass.
    pub(crate) fn wake(&self) {
        let (flag, condvar) = &*self.signal;
        *flag.lock().expect("lock poisoned") = true;
        condvar.notify_one();
    }

    /// Wakes the thread and waits for it to exit.
    ///
    /// The owning node sets its shutdown flag first.
    pub(crate) fn join(&mut self) {
        self.wake();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Replicator main loop.
fn run(node: Weak<RaftNode>, peer: NodeId, signal: Arc<(Mutex<bool>, Condvar)>, idle_wait: Duration) {
    loop {
        // Sleep until woken; wake up periodically anyway so transport
        // failures are retried even if a signal was missed.
        {
            let (flag, condvar) = &*signal;
            let mut woken = flag.lock().expect("lock poisoned");
            if !*woken {
                let (guard, _) = condvar
                    .wait_timeout(woken, idle_wait)
                    .expect("lock poisoned");
                woken = guard;
            }
            *woken = false;
        }

        let Some(node) = node.upgrade() else {
            return;
        };
        if node.is_shutdown() {
            return;
        }

        // Walk next_index backwards until the logs agree, then stream
        // forward. A pass is a no-op when the node is not the leader.
        while let Pass::Retry = replicate_once(&node, &peer) {}
    }
}

/// Builds, sends, and integrates one `AppendEntries` exchange.
fn replicate_once(node: &Arc<RaftNode>, peer: &NodeId) -> Pass {
    let Some(request) = build_request(node, peer) else {
        return Pass::Done;
    };
    let request_term = request.term;
    let matched = LogIndex::new(request.prev_log_index.as_u64() + request.entries.len() as u64);
    let had_entries = !request.entries.is_empty();

    let response = match node.transport().append_entries(peer, request) {
        Ok(response) => response,
        Err(e) => {
            // The leader retries indefinitely: the next heartbeat tick
            // lands here again.
            trace!(peer = %peer, error = %e, "append_entries failed");
            return Pass::Done;
        }
    };

    let (pass, advanced) = {
        let mut state = node.state_mut();

        if response.term > state.current_term {
            debug!(peer = %peer, term = %response.term, "stepping down on higher term");
            state.step_down(response.term);
            (Pass::Done, false)
        } else if state.role != Role::Leader || state.current_term != request_term {
            // The response belongs to an older leadership; drop it.
            (Pass::Done, false)
        } else if response.success {
            let match_index = state.match_index.entry(peer.clone()).or_default();
            if matched > *match_index {
                *match_index = matched;
            }
            state.next_index.insert(peer.clone(), matched.next());
            (Pass::Done, had_entries)
        } else {
            // Consistency check failed: back next_index off by one and
            // retry with an earlier prev_log_index.
            let next = state
                .next_index
                .entry(peer.clone())
                .or_insert_with(|| LogIndex::new(1));
            if next.as_u64() > 1 {
                *next = next.prev();
            }
            trace!(peer = %peer, next = %*next, "log mismatch, backing off");
            (Pass::Retry, false)
        }
    };

    if advanced {
        node.advance_commit();
    }
    pass
}

/// Snapshots an `AppendEntries` request for `peer` under the read lock.
///
/// Returns `None` when the node is not currently the leader.
fn build_request(node: &Arc<RaftNode>, peer: &NodeId) -> Option<AppendRequest> {
    let state = node.state_ref();
    if state.role != Role::Leader {
        return None;
    }

    let next = state
        .next_index
        .get(peer)
        .copied()
        .unwrap_or_else(|| state.log.last_index().next());
    let prev_log_index = next.prev();
    let prev_log_term = state.log.term_at(prev_log_index)?;

    Some(AppendRequest {
        term: state.current_term,
        leader_id: node.id().clone(),
        prev_log_index,
        prev_log_term,
        entries: state.log.entries_from(next).to_vec(),
        leader_commit: state.commit_index,
    })
}
