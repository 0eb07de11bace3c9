//! # helm-raft: Leader-based replication for `HelmDB`
//!
//! This crate sequences mutating operations across a small cluster and
//! applies them deterministically to every replica's index:
//!
//! - **Elections**: randomized timeouts, majority votes, term monotonicity
//! - **Replication**: one long-lived replicator per peer, heartbeats as
//!   empty appends, indefinite retry with `next_index` backoff
//! - **Commit**: majority match plus the current-term rule; apply is
//!   strictly monotonic in log index on every replica
//! - **Client path**: writes through the leader with commit/apply waits;
//!   linearizable reads require leader status
//!
//! ```text
//! Client ──Put──► ReplicatedStore ──► RaftNode (leader)
//!                                        │ append, wake replicators
//!                                        ├──AppendEntries──► follower
//!                                        ├──AppendEntries──► follower
//!                                        │   majority matched
//!                                        ▼
//!                                   StateMachine ──► StorageEngine
//! ```

mod command;
mod config;
mod facade;
mod framing;
mod log;
mod message;
mod node;
mod registry;
mod replicate;
mod state_machine;
mod tcp;
mod transport;


pub use command::{Command, CommandError};
pub use config::RaftConfig;
pub use facade::ReplicatedStore;
pub use framing::{encode_frame, read_frame, write_frame, FramingError, HEADER_SIZE};
pub use log::{LogEntry, RaftLog};
pub use message::{
    AppendRequest, AppendResponse, ClientError, Request, Response, StatusInfo, VoteRequest,
    VoteResponse,
};
pub use node::{RaftNode, RaftStatus, Role};
pub use registry::ClusterRegistry;
pub use state_machine::StateMachine;
pub use tcp::TcpTransport;
pub use transport::{LoopbackNet, LoopbackTransport, Transport, TransportError};

use helm_store::StoreError;

// ============================================================================
// Errors
// ============================================================================

/// Errors from the replicated store.
#[derive(Debug, thiserror::Error)]
pub enum RaftError {
    /// This replica is not the leader; `leader` carries the known
    /// leader's address.
    #[error("not the leader{}", leader.as_deref().map(|l| format!(" (leader at {l})")).unwrap_or_default())]
    NotLeader { leader: Option<String> },

    /// No leader is known; an election is likely in progress.
    #[error("no leader elected")]
    NoLeader,

    /// The write did not commit within the configured wait.
    #[error("timed out waiting for commit")]
    Timeout,

    /// Index-level failure (bounds, duplicates, missing keys, I/O).
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Peer RPC delivery failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The replica is shutting down.
    #[error("replica is shutting down")]
    Shutdown,
}

impl RaftError {
    /// Maps the error onto the wire-level client error vocabulary.
    pub fn to_client_error(&self) -> ClientError {
        match self {
            RaftError::NotLeader { leader } => ClientError::NotLeader {
                leader: leader.clone(),
            },
            RaftError::NoLeader => ClientError::NoLeader,
            RaftError::Timeout => ClientError::Timeout,
            RaftError::Store(StoreError::KeyTooLarge { .. }) => ClientError::KeyTooLarge,
            RaftError::Store(StoreError::ValueTooLarge { .. }) => ClientError::ValueTooLarge,
            RaftError::Store(StoreError::DuplicateKey) => ClientError::DuplicateKey,
            RaftError::Store(StoreError::NotFound) => ClientError::NotFound,
            other => ClientError::Internal(other.to_string()),
        }
    }
}
