//! Wire messages: the peer RPC surface and the client RPC surface.
//!
//! Both travel over the same framed connection (see [`crate::framing`]):
//! a replica's RPC server accepts `RequestVote` and `AppendEntries` from
//! peers and `Put`/`Get`/`Delete` from clients.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use helm_types::{LogIndex, NodeId, Term};

use crate::log::LogEntry;

// ============================================================================
// Peer RPCs
// ============================================================================

/// Candidate → All: vote for me in this term.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    /// Candidate's term.
    pub term: Term,
    /// Candidate requesting the vote.
    pub candidate_id: NodeId,
    /// Index of the candidate's last log entry.
    pub last_log_index: LogIndex,
    /// Term of the candidate's last log entry.
    pub last_log_term: Term,
}

/// Reply to a [`VoteRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    /// Receiver's current term, for the candidate to update itself.
    pub term: Term,
    /// True if the candidate received the vote.
    pub vote_granted: bool,
}

/// Leader → Follower: replicate entries (empty for a heartbeat).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendRequest {
    /// Leader's term.
    pub term: Term,
    /// Leader's id, so followers can redirect clients.
    pub leader_id: NodeId,
    /// Index of the entry immediately preceding the new ones.
    pub prev_log_index: LogIndex,
    /// Term of the entry at `prev_log_index`.
    pub prev_log_term: Term,
    /// Entries to store; empty for a heartbeat.
    pub entries: Vec<LogEntry>,
    /// Leader's commit index.
    pub leader_commit: LogIndex,
}

/// Reply to an [`AppendRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendResponse {
    /// Receiver's current term, for the leader to update itself.
    pub term: Term,
    /// True if the follower held the entry at `prev_log_index` with
    /// `prev_log_term` and accepted the entries.
    pub success: bool,
}

// ============================================================================
// Client-visible errors
// ============================================================================

/// Errors reported to clients over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum ClientError {
    /// The contacted replica is not the leader; `leader` carries the
    /// current leader's address when known.
    #[error("not the leader{}", leader.as_deref().map(|l| format!(" (leader at {l})")).unwrap_or_default())]
    NotLeader { leader: Option<String> },

    /// An election is in progress; retry shortly.
    #[error("no leader elected")]
    NoLeader,

    /// The write was accepted but did not commit within the wait bound.
    #[error("timed out waiting for commit")]
    Timeout,

    /// Key exceeds the maximum length.
    #[error("key too large")]
    KeyTooLarge,

    /// Value exceeds the maximum length.
    #[error("value too large")]
    ValueTooLarge,

    /// Put of a key that already exists.
    #[error("duplicate key")]
    DuplicateKey,

    /// Get or delete of a key that does not exist.
    #[error("key not found")]
    NotFound,

    /// Anything else; the replica logs the details.
    #[error("internal error: {0}")]
    Internal(String),
}

// ============================================================================
// Request/Response envelopes
// ============================================================================

/// Any message a replica's RPC server accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Peer: leader election.
    RequestVote(VoteRequest),
    /// Peer: log replication and heartbeats.
    AppendEntries(AppendRequest),
    /// Client: store a key/value pair.
    Put { key: Bytes, value: Bytes },
    /// Client: read a key (linearizable; leader only).
    Get { key: Bytes },
    /// Client: remove a key.
    Delete { key: Bytes },
    /// Client: inspect this replica's consensus state.
    Status,
}

/// Replies matching [`Request`] variants one for one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// Reply to `RequestVote`.
    RequestVote(VoteResponse),
    /// Reply to `AppendEntries`.
    AppendEntries(AppendResponse),
    /// Reply to `Put`.
    Put {
        success: bool,
        error: Option<ClientError>,
    },
    /// Reply to `Get`.
    Get {
        value: Option<Bytes>,
        found: bool,
        error: Option<ClientError>,
    },
    /// Reply to `Delete`.
    Delete {
        success: bool,
        error: Option<ClientError>,
    },
    /// Reply to `Status`.
    Status(StatusInfo),
}

/// A replica's consensus state as reported over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusInfo {
    /// The replica's id.
    pub id: NodeId,
    /// Current role (`follower`, `candidate`, `leader`).
    pub role: String,
    /// Current term.
    pub term: Term,
    /// Highest committed log index.
    pub commit_index: LogIndex,
    /// Highest applied log index.
    pub last_applied: LogIndex,
    /// Address of the replica believed to be leader.
    pub leader: Option<String>,
    /// Number of keys in the applied state.
    pub keys: u64,
}

impl Response {
    /// Returns a short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Response::RequestVote(_) => "RequestVote",
            Response::AppendEntries(_) => "AppendEntries",
            Response::Put { .. } => "Put",
            Response::Get { .. } => "Get",
            Response::Delete { .. } => "Delete",
            Response::Status(_) => "Status",
        }
    }
}

impl Request {
    /// Returns a short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Request::RequestVote(_) => "RequestVote",
            Request::AppendEntries(_) => "AppendEntries",
            Request::Put { .. } => "Put",
            Request::Get { .. } => "Get",
            Request::Delete { .. } => "Delete",
            Request::Status => "Status",
        }
    }
}

#[cfg(test)]
mod message_tests {
    use super::*;

    #[test]
    fn bincode_roundtrip() {
        let request = Request::AppendEntries(AppendRequest {
            term: Term::new(3),
            leader_id: NodeId::new("n1"),
            prev_log_index: LogIndex::new(7),
            prev_log_term: Term::new(2),
            entries: vec![LogEntry::new(
                Term::new(3),
                LogIndex::new(8),
                Bytes::from_static(b"\x01\x00\x00\x00\x01k\x00\x00\x00\x01v"),
            )],
            leader_commit: LogIndex::new(7),
        });

        let bytes = bincode::serialize(&request).unwrap();
        let decoded: Request = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn client_error_display() {
        let err = ClientError::NotLeader {
            leader: Some("127.0.0.1:7101".into()),
        };
        assert!(err.to_string().contains("127.0.0.1:7101"));
        assert_eq!(
            ClientError::NotLeader { leader: None }.to_string(),
            "not the leader"
        );
    }
}
