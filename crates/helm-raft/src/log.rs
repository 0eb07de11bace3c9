//! The replicated log.
//!
//! An ordered sequence of `(term, index, command)` entries with append,
//! suffix truncation, and the prefix-match check AppendEntries relies on.
//! Indices are 1-based and dense; index 0 is the imaginary entry before
//! the log with term 0.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use helm_types::{LogIndex, Term};

// ============================================================================
// Log Entry
// ============================================================================

/// A single entry in the replicated log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Term of the leader that created the entry.
    pub term: Term,
    /// Position in the log.
    pub index: LogIndex,
    /// Opaque command bytes, decoded at apply time.
    pub command: Bytes,
}

impl LogEntry {
    /// Creates a new log entry.
    pub fn new(term: Term, index: LogIndex, command: Bytes) -> Self {
        Self {
            term,
            index,
            command,
        }
    }
}

// ============================================================================
// Raft Log
// ============================================================================

/// The in-memory replicated log of one replica.
///
/// # Invariants
///
/// - `entries[i].index == i + 1` (dense, 1-based)
/// - Entries are only removed by [`truncate_from`](Self::truncate_from),
///   never overwritten in place.
#[derive(Debug, Default, Clone)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
}

impl RaftLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the log has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the index of the last entry (0 if the log is empty).
    pub fn last_index(&self) -> LogIndex {
        LogIndex::new(self.entries.len() as u64)
    }

    /// Returns the term of the last entry (0 if the log is empty).
    pub fn last_term(&self) -> Term {
        self.entries.last().map_or(Term::ZERO, |e| e.term)
    }

    /// Returns the entry at `index`, if present.
    pub fn entry(&self, index: LogIndex) -> Option<&LogEntry> {
        if index.is_zero() {
            return None;
        }
        self.entries.get(index.as_u64() as usize - 1)
    }

    /// Returns the term of the entry at `index`.
    ///
    /// Index 0 reports term 0 (the imaginary pre-log entry), so prefix
    /// checks at the log head fall out naturally.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index.is_zero() {
            return Some(Term::ZERO);
        }
        self.entry(index).map(|e| e.term)
    }

    /// Returns true if the log contains an entry at `prev_index` with
    /// `prev_term` (the AppendEntries consistency check).
    pub fn matches(&self, prev_index: LogIndex, prev_term: Term) -> bool {
        self.term_at(prev_index) == Some(prev_term)
    }

    /// Appends an entry at the tail.
    pub fn append(&mut self, entry: LogEntry) {
        debug_assert_eq!(
            entry.index,
            self.last_index().next(),
            "log entries must be dense"
        );
        self.entries.push(entry);
    }

    /// Drops every entry at or after `index`.
    pub fn truncate_from(&mut self, index: LogIndex) {
        debug_assert!(!index.is_zero(), "cannot truncate from index 0");
        self.entries.truncate(index.as_u64() as usize - 1);
    }

    /// Returns all entries at or after `index`.
    pub fn entries_from(&self, index: LogIndex) -> &[LogEntry] {
        if index.is_zero() {
            return &self.entries;
        }
        let start = (index.as_u64() as usize - 1).min(self.entries.len());
        &self.entries[start..]
    }
}

#[cfg(test)]
mod log_tests {
    use super::*;

    fn entry(term: u64, index: u64) -> LogEntry {
        LogEntry::new(
            Term::new(term),
            LogIndex::new(index),
            Bytes::from(format!("cmd-{term}-{index}")),
        )
    }

    #[test]
    fn empty_log() {
        let log = RaftLog::new();
        assert!(log.is_empty());
        assert_eq!(log.last_index(), LogIndex::ZERO);
        assert_eq!(log.last_term(), Term::ZERO);
        assert!(log.entry(LogIndex::new(1)).is_none());
    }

    #[test]
    fn append_and_lookup() {
        let mut log = RaftLog::new();
        log.append(entry(1, 1));
        log.append(entry(1, 2));
        log.append(entry(2, 3));

        assert_eq!(log.len(), 3);
        assert_eq!(log.last_index(), LogIndex::new(3));
        assert_eq!(log.last_term(), Term::new(2));
        assert_eq!(log.entry(LogIndex::new(2)).unwrap().term, Term::new(1));
        assert_eq!(log.term_at(LogIndex::new(3)), Some(Term::new(2)));
        assert_eq!(log.term_at(LogIndex::new(4)), None);
    }

    #[test]
    fn prefix_match_at_head() {
        let log = RaftLog::new();
        // The imaginary entry before the log always matches term 0.
        assert!(log.matches(LogIndex::ZERO, Term::ZERO));
        assert!(!log.matches(LogIndex::new(1), Term::ZERO));
    }

    #[test]
    fn prefix_match_mid_log() {
        let mut log = RaftLog::new();
        log.append(entry(1, 1));
        log.append(entry(2, 2));

        assert!(log.matches(LogIndex::new(1), Term::new(1)));
        assert!(log.matches(LogIndex::new(2), Term::new(2)));
        assert!(!log.matches(LogIndex::new(2), Term::new(1)));
        assert!(!log.matches(LogIndex::new(3), Term::new(2)));
    }

    #[test]
    fn truncate_suffix() {
        let mut log = RaftLog::new();
        for i in 1..=5 {
            log.append(entry(1, i));
        }

        log.truncate_from(LogIndex::new(3));
        assert_eq!(log.last_index(), LogIndex::new(2));
        assert!(log.entry(LogIndex::new(3)).is_none());

        // Appending after a truncation continues densely.
        log.append(entry(2, 3));
        assert_eq!(log.term_at(LogIndex::new(3)), Some(Term::new(2)));
    }

    #[test]
    fn entries_from_positions() {
        let mut log = RaftLog::new();
        for i in 1..=4 {
            log.append(entry(1, i));
        }

        assert_eq!(log.entries_from(LogIndex::new(1)).len(), 4);
        assert_eq!(log.entries_from(LogIndex::new(3)).len(), 2);
        assert_eq!(log.entries_from(LogIndex::new(5)).len(), 0);
        assert_eq!(log.entries_from(LogIndex::new(99)).len(), 0);
    }
}
