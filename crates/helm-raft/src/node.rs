//! The replica state machine: roles, elections, replication, apply.
//!
//! A [`RaftNode`] runs three classes of activity besides inbound RPC
//! handling (which arrives on the server's threads):
//!
//! - an election ticker that turns a quiet follower into a candidate;
//! - a heartbeat ticker that wakes the per-peer replicators while leader;
//! - one replicator per peer (see [`crate::replicate`]).
//!
//! # Locking discipline
//!
//! All raft state sits behind one `RwLock`. Mutating RPC handlers take the
//! write lock; inspection takes the read lock. Outbound RPCs are always
//! issued with the lock released. The index has its own lock inside
//! [`StateMachine`]; apply runs under that lock and outside the raft lock.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use helm_store::{StorageEngine, StoreError};
use helm_types::{quorum_size, LogIndex, NodeId, Term};

use crate::command::Command;
use crate::config::RaftConfig;
use crate::log::{LogEntry, RaftLog};
use crate::message::{AppendRequest, AppendResponse, VoteRequest, VoteResponse};
use crate::registry::ClusterRegistry;
use crate::replicate::Replicator;
use crate::state_machine::StateMachine;
use crate::transport::Transport;
use crate::RaftError;

// ============================================================================
// Role
// ============================================================================

/// The three consensus roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Listening for heartbeats; the initial role.
    Follower,
    /// Campaigning for leadership.
    Candidate,
    /// Sequencing writes and replicating to followers.
    Leader,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

// ============================================================================
// Raft State
// ============================================================================

/// Everything behind the raft lock.
pub(crate) struct RaftState {
    pub(crate) role: Role,
    pub(crate) current_term: Term,
    pub(crate) voted_for: Option<NodeId>,
    pub(crate) log: RaftLog,
    pub(crate) commit_index: LogIndex,
    /// Per-peer: index of the next entry to send (leader only).
    pub(crate) next_index: std::collections::HashMap<NodeId, LogIndex>,
    /// Per-peer: highest index known replicated (leader only).
    pub(crate) match_index: std::collections::HashMap<NodeId, LogIndex>,
    /// Last time a valid heartbeat or vote grant reset the election timer.
    pub(crate) last_heartbeat: Instant,
    /// Current randomized election timeout, redrawn at each reset.
    pub(crate) election_timeout: Duration,
    /// The replica believed to be leader, for client redirects.
    pub(crate) leader_hint: Option<NodeId>,
}

impl RaftState {
    /// Adopts a higher term and reverts to follower.
    pub(crate) fn step_down(&mut self, term: Term) {
        debug_assert!(term >= self.current_term);
        self.role = Role::Follower;
        self.current_term = term;
        self.voted_for = None;
    }
}

/// A point-in-time view of a replica's consensus state.
#[derive(Debug, Clone)]
pub struct RaftStatus {
    pub role: Role,
    pub term: Term,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
    pub leader_hint: Option<NodeId>,
}

impl RaftStatus {
    /// Returns true if the replica is currently leader.
    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }
}

// ============================================================================
// Raft Node
// ============================================================================

/// One replica of the cluster.
pub struct RaftNode {
    id: NodeId,
    addr: SocketAddr,
    peers: Vec<NodeId>,
    config: RaftConfig,
    registry: Arc<ClusterRegistry>,
    transport: Arc<dyn Transport>,
    state: RwLock<RaftState>,
    machine: StateMachine,
    replicators: Mutex<Vec<Replicator>>,
    tickers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: AtomicBool,
}

impl RaftNode {
    /// Creates a replica, registers it, and starts its timers and
    /// replicators.
    ///
    /// `peers` lists the *other* replicas; their addresses must be (or
    /// become) known to the registry before outbound RPCs can resolve.
    pub fn spawn(
        id: NodeId,
        addr: SocketAddr,
        peers: Vec<NodeId>,
        engine: Box<dyn StorageEngine>,
        transport: Arc<dyn Transport>,
        registry: Arc<ClusterRegistry>,
        config: RaftConfig,
    ) -> Arc<Self> {
        let election_timeout = config.draw_election_timeout();
        let node = Arc::new(Self {
            id,
            addr,
            peers,
            config,
            registry: Arc::clone(&registry),
            transport,
            state: RwLock::new(RaftState {
                role: Role::Follower,
                current_term: Term::ZERO,
                voted_for: None,
                log: RaftLog::new(),
                commit_index: LogIndex::ZERO,
                next_index: Default::default(),
                match_index: Default::default(),
                last_heartbeat: Instant::now(),
                election_timeout,
                leader_hint: None,
            }),
            machine: StateMachine::new(engine),
            replicators: Mutex::new(Vec::new()),
            tickers: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
        });

        registry.register_node(&node);

        {
            let mut replicators = node.replicators.lock().expect("lock poisoned");
            for peer in node.peers.clone() {
                replicators.push(Replicator::spawn(&node, peer));
            }
        }
        {
            let mut tickers = node.tickers.lock().expect("lock poisoned");
            tickers.push(Self::spawn_election_ticker(&node));
            tickers.push(Self::spawn_heartbeat_ticker(&node));
        }

        info!(node = %node.id, addr = %node.addr, peers = node.peers.len(), "replica started");
        node
    }

    /// Stops all background threads and deregisters the replica.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(node = %self.id, "replica shutting down");

        self.registry.deregister(&self.id);

        // Release the replicator list before joining the tickers: the
        // heartbeat ticker takes the same lock to wake replicators.
        {
            let mut replicators = self.replicators.lock().expect("lock poisoned");
            for replicator in replicators.iter_mut() {
                replicator.join();
            }
            replicators.clear();
        }

        let handles: Vec<JoinHandle<()>> = {
            let mut tickers = self.tickers.lock().expect("lock poisoned");
            tickers.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.join();
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Returns this replica's id.
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Returns this replica's bind address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the timing configuration.
    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    /// Returns true once shutdown has begun.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Returns true if this replica is currently leader.
    pub fn is_leader(&self) -> bool {
        self.state_ref().role == Role::Leader
    }

    /// Snapshots the consensus state.
    pub fn status(&self) -> RaftStatus {
        // Take the raft and machine locks in sequence, never nested: apply
        // holds the machine lock while briefly taking raft read locks.
        let (role, term, commit_index, last_log_index, leader_hint) = {
            let state = self.state_ref();
            (
                state.role,
                state.current_term,
                state.commit_index,
                state.log.last_index(),
                state.leader_hint.clone(),
            )
        };
        RaftStatus {
            role,
            term,
            commit_index,
            last_applied: self.machine.last_applied(),
            last_log_index,
            leader_hint,
        }
    }

    /// Returns the known leader's address, if any.
    pub fn leader_addr(&self) -> Option<SocketAddr> {
        let hint = self.state_ref().leader_hint.clone()?;
        self.registry.address_of(&hint)
    }

    /// Reads a key from the locally applied state.
    ///
    /// This is a stale read on followers; linearizable reads go through
    /// [`ReplicatedStore`](crate::ReplicatedStore), which requires leader
    /// status first.
    pub fn local_get(&self, key: &[u8]) -> Result<Option<Bytes>, StoreError> {
        self.machine.read(key)
    }

    /// Returns true if the locally applied state contains `key`.
    pub fn local_contains(&self, key: &[u8]) -> Result<bool, StoreError> {
        self.machine.contains(key)
    }

    /// Returns the number of keys in the locally applied state.
    pub fn local_size(&self) -> u64 {
        self.machine.size()
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub(crate) fn state_ref(&self) -> RwLockReadGuard<'_, RaftState> {
        self.state.read().expect("lock poisoned")
    }

    pub(crate) fn state_mut(&self) -> RwLockWriteGuard<'_, RaftState> {
        self.state.write().expect("lock poisoned")
    }

    fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    fn quorum(&self) -> usize {
        quorum_size(self.cluster_size())
    }

    // ========================================================================
    // Inbound RPC handlers
    // ========================================================================

    /// Handles a vote request from a candidate.
    pub fn handle_request_vote(&self, request: VoteRequest) -> VoteResponse {
        let mut state = self.state_mut();

        if request.term < state.current_term {
            return VoteResponse {
                term: state.current_term,
                vote_granted: false,
            };
        }
        if request.term > state.current_term {
            state.step_down(request.term);
        }

        // The candidate's log must be at least as up to date as ours.
        let up_to_date = request.last_log_term > state.log.last_term()
            || (request.last_log_term == state.log.last_term()
                && request.last_log_index >= state.log.last_index());
        let free_to_vote = state
            .voted_for
            .as_ref()
            .map_or(true, |voted| *voted == request.candidate_id);

        if free_to_vote && up_to_date {
            state.voted_for = Some(request.candidate_id.clone());
            // Granting a vote resets the election timer (with a fresh draw).
            state.last_heartbeat = Instant::now();
            state.election_timeout = self.config.draw_election_timeout();
            debug!(node = %self.id, candidate = %request.candidate_id, term = %state.current_term, "vote granted");
            VoteResponse {
                term: state.current_term,
                vote_granted: true,
            }
        } else {
            debug!(node = %self.id, candidate = %request.candidate_id, term = %state.current_term, "vote denied");
            VoteResponse {
                term: state.current_term,
                vote_granted: false,
            }
        }
    }

    /// Handles replication (or a heartbeat) from a leader.
    pub fn handle_append_entries(&self, request: AppendRequest) -> AppendResponse {
        let (response, apply) = {
            let mut state = self.state_mut();

            if request.term < state.current_term {
                return AppendResponse {
                    term: state.current_term,
                    success: false,
                };
            }
            if request.term > state.current_term {
                state.step_down(request.term);
            } else if state.role == Role::Candidate {
                // A live leader for our own term ends the candidacy.
                state.role = Role::Follower;
            }

            state.last_heartbeat = Instant::now();
            state.election_timeout = self.config.draw_election_timeout();
            state.leader_hint = Some(request.leader_id.clone());

            // Every append, heartbeats included, carries the consistency
            // check against the preceding entry.
            if !state.log.matches(request.prev_log_index, request.prev_log_term) {
                trace!(
                    node = %self.id,
                    prev = %request.prev_log_index,
                    "append rejected: log mismatch"
                );
                (
                    AppendResponse {
                        term: state.current_term,
                        success: false,
                    },
                    false,
                )
            } else {
                // Truncate a conflicting suffix, append what is new.
                let mut index = request.prev_log_index;
                for entry in request.entries {
                    index = index.next();
                    debug_assert_eq!(entry.index, index, "entries must be dense");
                    match state.log.term_at(index) {
                        Some(term) if term == entry.term => {} // already present
                        Some(_) => {
                            warn!(node = %self.id, from = %index, "truncating conflicting suffix");
                            state.log.truncate_from(index);
                            state.log.append(entry);
                        }
                        None => state.log.append(entry),
                    }
                }

                let mut apply = false;
                if request.leader_commit > state.commit_index {
                    // `index` is the last entry known to match the leader.
                    state.commit_index = request.leader_commit.min(index);
                    apply = true;
                }

                (
                    AppendResponse {
                        term: state.current_term,
                        success: true,
                    },
                    apply,
                )
            }
        };

        if apply {
            self.apply_committed();
        }
        response
    }

    // ========================================================================
    // Client path (leader)
    // ========================================================================

    /// Appends a command as leader and waits for commit and apply.
    ///
    /// # Errors
    ///
    /// - `NotLeader`/`NoLeader` when this replica cannot sequence writes
    /// - `Timeout` when the entry fails to commit within the wait bound
    pub fn submit(&self, command: Command) -> Result<(), RaftError> {
        if self.is_shutdown() {
            return Err(RaftError::Shutdown);
        }

        let (index, term) = {
            let mut state = self.state_mut();
            if state.role != Role::Leader {
                return Err(self.not_leader_error(&state));
            }
            let term = state.current_term;
            let index = state.log.last_index().next();
            state
                .log
                .append(LogEntry::new(term, index, command.encode()));
            (index, term)
        };

        trace!(node = %self.id, index = %index, "command appended");
        self.wake_replicators();
        // A single-replica cluster has its majority already.
        self.advance_commit();

        if !self.machine.wait_for(index, self.config.commit_wait) {
            warn!(node = %self.id, index = %index, "commit wait timed out");
            return Err(RaftError::Timeout);
        }

        // Leadership may have changed while we waited; only report success
        // if the entry we appended is the one that committed.
        let state = self.state_ref();
        if state.log.term_at(index) == Some(term) {
            Ok(())
        } else {
            Err(self.not_leader_error(&state))
        }
    }

    /// Builds the redirect error for a non-leader replica.
    fn not_leader_error(&self, state: &RaftState) -> RaftError {
        match &state.leader_hint {
            Some(hint) if *hint != self.id => RaftError::NotLeader {
                leader: self.registry.address_of(hint).map(|a| a.to_string()),
            },
            _ => RaftError::NoLeader,
        }
    }

    /// Returns `Ok` if this replica is leader, or the redirect error.
    pub fn ensure_leader(&self) -> Result<(), RaftError> {
        let state = self.state_ref();
        if state.role == Role::Leader {
            Ok(())
        } else {
            Err(self.not_leader_error(&state))
        }
    }

    // ========================================================================
    // Elections
    // ========================================================================

    fn spawn_election_ticker(node: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(node);
        let tick = node.config.tick_interval;

        thread::Builder::new()
            .name(format!("election-{}", node.id))
            .spawn(move || loop {
                thread::sleep(tick);
                let Some(node) = weak.upgrade() else {
                    return;
                };
                if node.is_shutdown() {
                    return;
                }

                let timed_out = {
                    let state = node.state_ref();
                    state.role != Role::Leader
                        && state.last_heartbeat.elapsed() >= state.election_timeout
                };
                if timed_out {
                    node.start_election();
                }
            })
            .expect("spawn election ticker")
    }

    fn spawn_heartbeat_ticker(node: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(node);
        let interval = node.config.heartbeat_interval;

        thread::Builder::new()
            .name(format!("heartbeat-{}", node.id))
            .spawn(move || loop {
                thread::sleep(interval);
                let Some(node) = weak.upgrade() else {
                    return;
                };
                if node.is_shutdown() {
                    return;
                }
                if node.is_leader() {
                    node.wake_replicators();
                }
            })
            .expect("spawn heartbeat ticker")
    }

    /// Becomes candidate and campaigns for the next term.
    fn start_election(self: &Arc<Self>) {
        let (term, last_log_index, last_log_term) = {
            let mut state = self.state_mut();
            state.role = Role::Candidate;
            state.current_term = state.current_term.next();
            state.voted_for = Some(self.id.clone());
            state.leader_hint = None;
            state.last_heartbeat = Instant::now();
            state.election_timeout = self.config.draw_election_timeout();
            (
                state.current_term,
                state.log.last_index(),
                state.log.last_term(),
            )
        };

        info!(node = %self.id, term = %term, "starting election");

        let quorum = self.quorum();
        if quorum == 1 {
            // Single-replica cluster: the self-vote is the majority.
            let mut state = self.state_mut();
            if state.role == Role::Candidate && state.current_term == term {
                self.become_leader(&mut state);
            }
            drop(state);
            self.wake_replicators();
            return;
        }

        // One short-lived vote solicitation per peer; responses race to
        // push the count over the quorum line.
        let votes = Arc::new(AtomicUsize::new(1));
        for peer in self.peers.clone() {
            let node = Arc::clone(self);
            let votes = Arc::clone(&votes);
            let peer_for_log = peer.clone();

            let spawned = thread::Builder::new()
                .name(format!("vote-{}-{peer}", node.id))
                .spawn(move || {
                    let request = VoteRequest {
                        term,
                        candidate_id: node.id.clone(),
                        last_log_index,
                        last_log_term,
                    };
                    let response = match node.transport.request_vote(&peer, request) {
                        Ok(response) => response,
                        Err(e) => {
                            debug!(node = %node.id, peer = %peer, error = %e, "vote request failed");
                            return;
                        }
                    };

                    let mut state = node.state_mut();
                    if response.term > state.current_term {
                        state.step_down(response.term);
                        return;
                    }
                    if !response.vote_granted
                        || state.role != Role::Candidate
                        || state.current_term != term
                    {
                        return;
                    }

                    let granted = votes.fetch_add(1, Ordering::SeqCst) + 1;
                    if granted >= node.quorum() {
                        node.become_leader(&mut state);
                        drop(state);
                        node.wake_replicators();
                    }
                });
            if let Err(e) = spawned {
                warn!(node = %self.id, peer = %peer_for_log, error = %e, "failed to spawn vote thread");
            }
        }
    }

    /// Transitions to leader under the write lock.
    fn become_leader(&self, state: &mut RaftState) {
        info!(node = %self.id, term = %state.current_term, "became leader");
        state.role = Role::Leader;
        state.leader_hint = Some(self.id.clone());

        let next = state.log.last_index().next();
        for peer in &self.peers {
            state.next_index.insert(peer.clone(), next);
            state.match_index.insert(peer.clone(), LogIndex::ZERO);
        }
    }

    /// Forces this replica out of leadership.
    ///
    /// Used by the registry's multi-leader monitor; never needed under
    /// honest execution.
    pub fn step_down(&self) {
        let mut state = self.state_mut();
        if state.role == Role::Leader {
            warn!(node = %self.id, term = %state.current_term, "forced step-down");
            state.role = Role::Follower;
            state.voted_for = None;
            state.last_heartbeat = Instant::now();
        }
    }

    // ========================================================================
    // Commit & apply
    // ========================================================================

    /// Wakes every per-peer replicator for a pass.
    pub(crate) fn wake_replicators(&self) {
        for replicator in self.replicators.lock().expect("lock poisoned").iter() {
            replicator.wake();
        }
    }

    /// Advances the leader's commit index over majority-matched entries.
    ///
    /// An index commits only when a majority of `match_index` (counting
    /// the leader) covers it *and* its entry is from the current term;
    /// older entries commit transitively.
    pub(crate) fn advance_commit(&self) {
        let advanced = {
            let mut state = self.state_mut();
            if state.role != Role::Leader {
                false
            } else {
                let quorum = self.quorum();
                let last = state.log.last_index();
                let mut candidate = None;
                let mut n = state.commit_index.next();
                while n <= last {
                    let replicated = 1 + self
                        .peers
                        .iter()
                        .filter(|peer| {
                            state
                                .match_index
                                .get(*peer)
                                .is_some_and(|matched| *matched >= n)
                        })
                        .count();
                    if replicated < quorum {
                        break;
                    }
                    if state.log.term_at(n) == Some(state.current_term) {
                        candidate = Some(n);
                    }
                    n = n.next();
                }

                match candidate {
                    Some(n) => {
                        trace!(node = %self.id, commit = %n, "commit index advanced");
                        state.commit_index = n;
                        true
                    }
                    None => false,
                }
            }
        };

        if advanced {
            self.apply_committed();
        }
    }

    /// Applies committed entries to the index, in order, under the index
    /// lock and outside the raft lock.
    pub(crate) fn apply_committed(&self) {
        self.machine.apply_available(
            || self.state_ref().commit_index,
            |index| self.state_ref().log.entry(index).cloned(),
        );
    }
}

impl std::fmt::Debug for RaftNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self.status();
        f.debug_struct("RaftNode")
            .field("id", &self.id)
            .field("role", &status.role)
            .field("term", &status.term)
            .field("commit", &status.commit_index)
            .finish_non_exhaustive()
    }
}
