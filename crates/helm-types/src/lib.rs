//! # helm-types: Shared identifier and ordering types for `HelmDB`
//!
//! This crate defines the small vocabulary shared by the storage and
//! consensus layers:
//!
//! - [`NodeId`] - Unique identifier for a replica in the cluster
//! - [`Term`] - Monotonically increasing election term
//! - [`LogIndex`] - 1-based position in the replicated log
//! - [`quorum_size`] / [`max_failures`] - Majority math
//!
//! Keeping these in a leaf crate lets `helm-store` stay independent of the
//! consensus layer while `helm-raft` and `helm-server` agree on identities.

use std::fmt::{self, Debug, Display};

use serde::{Deserialize, Serialize};

// ============================================================================
// Node Identifier
// ============================================================================

/// Unique identifier for a replica in the cluster.
///
/// Node ids are short human-chosen strings (`"n1"`, `"replica-a"`) assigned
/// at process start and never changed. They key the cluster registry and the
/// leader's per-peer replication state.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a new node id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// ============================================================================
// Term
// ============================================================================

/// Monotonically increasing logical clock for leader elections.
///
/// At most one leader exists per term. A replica's current term only
/// increases; any message carrying a higher term forces the receiver to
/// adopt it and revert to follower.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Term(u64);

impl Term {
    /// The initial term, before any election.
    pub const ZERO: Term = Term(0);

    /// Creates a term from a raw value.
    pub fn new(term: u64) -> Self {
        Self(term)
    }

    /// Returns the term as a `u64`.
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next term.
    pub fn next(self) -> Self {
        Term(self.0.saturating_add(1))
    }
}

impl Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

impl From<u64> for Term {
    fn from(term: u64) -> Self {
        Self(term)
    }
}

impl From<Term> for u64 {
    fn from(term: Term) -> Self {
        term.0
    }
}

// ============================================================================
// Log Index
// ============================================================================

/// Position of an entry in the replicated log.
///
/// Indices start at 1 and are dense; 0 means "before the first entry" and
/// is used as the `prev_log_index` of the log head.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct LogIndex(u64);

impl LogIndex {
    /// The position before the first entry.
    pub const ZERO: LogIndex = LogIndex(0);

    /// Creates an index from a raw value.
    pub fn new(index: u64) -> Self {
        Self(index)
    }

    /// Returns the index as a `u64`.
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next index.
    pub fn next(self) -> Self {
        LogIndex(self.0.saturating_add(1))
    }

    /// Returns the previous index, saturating at zero.
    pub fn prev(self) -> Self {
        LogIndex(self.0.saturating_sub(1))
    }

    /// Returns true if this is the position before the first entry.
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u64> for LogIndex {
    fn from(index: u64) -> Self {
        Self(index)
    }
}

impl From<LogIndex> for u64 {
    fn from(index: LogIndex) -> Self {
        index.0
    }
}

// ============================================================================
// Quorum helpers
// ============================================================================

/// Minimum number of replicas that constitute a majority.
///
/// Strictly more than half of all configured replicas: any two quorums
/// overlap by at least one replica.
///
/// # Panics
///
/// Debug builds panic if `cluster_size` is 0.
pub fn quorum_size(cluster_size: usize) -> usize {
    debug_assert!(cluster_size > 0, "cluster size must be positive");
    (cluster_size / 2) + 1
}

/// Number of simultaneous failures a cluster of the given size tolerates.
pub fn max_failures(cluster_size: usize) -> usize {
    cluster_size.saturating_sub(1) / 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_display() {
        let id = NodeId::new("n1");
        assert_eq!(format!("{id}"), "n1");
        assert_eq!(id.as_str(), "n1");
    }

    #[test]
    fn term_ordering() {
        let t1 = Term::new(1);
        let t2 = Term::new(2);
        assert!(t1 < t2);
        assert_eq!(t1.next(), t2);
        assert_eq!(Term::ZERO.as_u64(), 0);
    }

    #[test]
    fn log_index_navigation() {
        let i = LogIndex::new(5);
        assert_eq!(i.next(), LogIndex::new(6));
        assert_eq!(i.prev(), LogIndex::new(4));
        assert!(LogIndex::ZERO.is_zero());
        assert_eq!(LogIndex::ZERO.prev(), LogIndex::ZERO);
    }

    #[test]
    fn quorum_calculations() {
        // 1 replica: quorum is 1, tolerates 0 failures
        assert_eq!(quorum_size(1), 1);
        assert_eq!(max_failures(1), 0);

        // 3 replicas: quorum is 2, tolerates 1 failure
        assert_eq!(quorum_size(3), 2);
        assert_eq!(max_failures(3), 1);

        // 5 replicas: quorum is 3, tolerates 2 failures
        assert_eq!(quorum_size(5), 3);
        assert_eq!(max_failures(5), 2);

        // Even sizes still need a strict majority
        assert_eq!(quorum_size(4), 3);
        assert_eq!(max_failures(4), 1);
    }
}
