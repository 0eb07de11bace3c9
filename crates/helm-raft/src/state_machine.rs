//! The applied state machine: the index plus its apply watermark.
//!
//! Committed log entries become index mutations here, under the index
//! write lock and outside the raft lock. The watermark (`last_applied`)
//! lives with the engine rather than in the raft state so that the
//! "fetch next entry, apply it, advance" step is atomic under one lock:
//! apply is strictly monotonic in log index no matter which thread
//! (AppendEntries handler, commit advancement, or a waiting client)
//! triggers it.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{error, trace};

use helm_store::{StorageEngine, StoreError};
use helm_types::LogIndex;

use crate::command::Command;
use crate::log::LogEntry;

struct MachineInner {
    engine: Box<dyn StorageEngine>,
    last_applied: LogIndex,
}

/// The index and the log position applied into it.
pub struct StateMachine {
    inner: Mutex<MachineInner>,
    applied: Condvar,
}

impl StateMachine {
    /// Wraps a storage engine as the cluster state machine.
    pub fn new(engine: Box<dyn StorageEngine>) -> Self {
        Self {
            inner: Mutex::new(MachineInner {
                engine,
                last_applied: LogIndex::ZERO,
            }),
            applied: Condvar::new(),
        }
    }

    /// Returns the highest applied log index.
    pub fn last_applied(&self) -> LogIndex {
        self.inner.lock().expect("lock poisoned").last_applied
    }

    /// Reads a key from the applied state.
    pub fn read(&self, key: &[u8]) -> Result<Option<Bytes>, StoreError> {
        self.inner.lock().expect("lock poisoned").engine.get(key)
    }

    /// Returns true if the applied state contains `key`.
    pub fn contains(&self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.read(key)?.is_some())
    }

    /// Returns the number of keys in the applied state.
    pub fn size(&self) -> u64 {
        self.inner.lock().expect("lock poisoned").engine.len()
    }

    /// Applies every committed-but-unapplied entry.
    ///
    /// `commit_index` and `fetch` read the raft state under its own lock;
    /// the raft lock is never held across an apply. Returns the number of
    /// entries applied and wakes any threads waiting on the watermark.
    pub(crate) fn apply_available(
        &self,
        commit_index: impl Fn() -> LogIndex,
        fetch: impl Fn(LogIndex) -> Option<LogEntry>,
    ) -> u64 {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let mut applied = 0u64;

        loop {
            let next = inner.last_applied.next();
            if next > commit_index() {
                break;
            }
            let Some(entry) = fetch(next) else {
                break;
            };

            inner.apply_entry(&entry);
            inner.last_applied = next;
            applied += 1;
        }

        drop(inner);
        if applied > 0 {
            self.applied.notify_all();
        }
        applied
    }

    /// Blocks until `index` has been applied or `timeout` elapses.
    ///
    /// Returns false on timeout.
    pub(crate) fn wait_for(&self, index: LogIndex, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().expect("lock poisoned");

        while inner.last_applied < index {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .applied
                .wait_timeout(inner, deadline - now)
                .expect("lock poisoned");
            inner = guard;
        }
        true
    }
}

impl MachineInner {
    /// Applies one decoded log entry to the engine.
    ///
    /// Apply must be idempotent with respect to log replays: a put of an
    /// existing key is an overwrite, a delete of a missing key is a no-op.
    /// The surfaced `DuplicateKey`/`NotFound` contract belongs to the
    /// leader's submission path, not here.
    fn apply_entry(&mut self, entry: &LogEntry) {
        let command = match Command::decode(&entry.command) {
            Ok(command) => command,
            Err(e) => {
                // Only leaders encode commands, so this points at a damaged
                // log; skipping keeps the replica alive and deterministic.
                error!(index = %entry.index, error = %e, "undecodable command in log");
                return;
            }
        };

        trace!(index = %entry.index, key = ?command.key(), "applying entry");

        let result = match command {
            Command::Put { key, value } => match self.engine.put(key.clone(), value.clone()) {
                Err(StoreError::DuplicateKey) => self
                    .engine
                    .delete(&key)
                    .and_then(|()| self.engine.put(key, value)),
                other => other,
            },
            Command::Delete { key } => match self.engine.delete(&key) {
                Err(StoreError::NotFound) => Ok(()),
                other => other,
            },
        };

        if let Err(e) = result {
            // Store-level failures (I/O, corruption) are replica-local; the
            // watermark still advances so the replica cannot wedge behind a
            // single bad page, but the condition is loud.
            error!(index = %entry.index, error = %e, "apply failed");
        }
    }
}

impl std::fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("lock poisoned");
        f.debug_struct("StateMachine")
            .field("last_applied", &inner.last_applied)
            .field("keys", &inner.engine.len())
            .finish()
    }
}

#[cfg(test)]
mod machine_tests {
    use super::*;
    use helm_store::MemoryEngine;
    use helm_types::Term;

    fn entry(index: u64, command: Command) -> LogEntry {
        LogEntry::new(Term::new(1), LogIndex::new(index), command.encode())
    }

    fn machine_with(entries: Vec<LogEntry>) -> StateMachine {
        let machine = StateMachine::new(Box::new(MemoryEngine::new()));
        let commit = LogIndex::new(entries.len() as u64);
        machine.apply_available(
            || commit,
            |index| entries.get(index.as_u64() as usize - 1).cloned(),
        );
        machine
    }

    #[test]
    fn applies_in_order() {
        let machine = machine_with(vec![
            entry(1, Command::put(&b"a"[..], &b"1"[..])),
            entry(2, Command::put(&b"b"[..], &b"2"[..])),
            entry(3, Command::delete(&b"a"[..])),
        ]);

        assert_eq!(machine.last_applied(), LogIndex::new(3));
        assert_eq!(machine.read(b"a").unwrap(), None);
        assert_eq!(machine.read(b"b").unwrap(), Some(Bytes::from("2")));
    }

    #[test]
    fn replayed_put_overwrites() {
        let machine = machine_with(vec![
            entry(1, Command::put(&b"k"[..], &b"v1"[..])),
            entry(2, Command::put(&b"k"[..], &b"v2"[..])),
        ]);

        assert_eq!(machine.read(b"k").unwrap(), Some(Bytes::from("v2")));
        assert_eq!(machine.size(), 1);
    }

    #[test]
    fn delete_of_missing_key_is_silent() {
        let machine = machine_with(vec![entry(1, Command::delete(&b"ghost"[..]))]);
        assert_eq!(machine.last_applied(), LogIndex::new(1));
    }

    #[test]
    fn does_not_apply_past_commit() {
        let machine = StateMachine::new(Box::new(MemoryEngine::new()));
        let entries = vec![
            entry(1, Command::put(&b"a"[..], &b"1"[..])),
            entry(2, Command::put(&b"b"[..], &b"2"[..])),
        ];

        machine.apply_available(
            || LogIndex::new(1),
            |index| entries.get(index.as_u64() as usize - 1).cloned(),
        );

        assert_eq!(machine.last_applied(), LogIndex::new(1));
        assert_eq!(machine.read(b"b").unwrap(), None);
    }

    #[test]
    fn wait_for_times_out() {
        let machine = StateMachine::new(Box::new(MemoryEngine::new()));
        assert!(!machine.wait_for(LogIndex::new(1), Duration::from_millis(20)));
        assert!(machine.wait_for(LogIndex::ZERO, Duration::from_millis(20)));
    }
}
