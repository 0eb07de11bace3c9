//! Storage façade: Put/Get/Delete over the replicated log.
//!
//! [`ReplicatedStore`] exposes the local index's contract but routes every
//! mutation through the raft node: writes become log entries, commit on a
//! majority, and apply on every replica; reads require leader status
//! (linearizable) and consult the locally applied state. Non-leaders
//! answer with `NotLeader` carrying the leader's address — no automatic
//! forwarding happens at this layer.

use std::sync::Arc;

use bytes::Bytes;

use helm_store::{StoreError, MAX_KEY_LEN, MAX_VALUE_LEN};

use crate::command::Command;
use crate::node::RaftNode;
use crate::RaftError;

/// Client-facing handle over one replica.
#[derive(Clone)]
pub struct ReplicatedStore {
    node: Arc<RaftNode>,
}

impl ReplicatedStore {
    /// Wraps a replica.
    pub fn new(node: Arc<RaftNode>) -> Self {
        Self { node }
    }

    /// Returns the underlying replica.
    pub fn node(&self) -> &Arc<RaftNode> {
        &self.node
    }

    /// Stores a new key/value pair.
    ///
    /// # Errors
    ///
    /// - `Store(KeyTooLarge | ValueTooLarge)` before submission
    /// - `Store(DuplicateKey)` when the key already exists in the applied
    ///   state (checked on the leader; replays at the apply boundary still
    ///   overwrite)
    /// - `NotLeader` / `NoLeader` / `Timeout` from the consensus path
    pub fn put(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<(), RaftError> {
        let key = key.into();
        let value = value.into();

        if key.len() > MAX_KEY_LEN {
            return Err(StoreError::KeyTooLarge {
                len: key.len(),
                max: MAX_KEY_LEN,
            }
            .into());
        }
        if value.len() > MAX_VALUE_LEN {
            return Err(StoreError::ValueTooLarge {
                len: value.len(),
                max: MAX_VALUE_LEN,
            }
            .into());
        }

        self.node.ensure_leader()?;
        if self.node.local_contains(&key)? {
            return Err(StoreError::DuplicateKey.into());
        }

        self.node.submit(Command::put(key, value))
    }

    /// Reads a key, linearizably.
    ///
    /// Only the leader serves reads; stale local reads are not offered.
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>, RaftError> {
        self.node.ensure_leader()?;
        Ok(self.node.local_get(key)?)
    }

    /// Removes a key.
    ///
    /// # Errors
    ///
    /// `Store(NotFound)` when the key is absent from the applied state
    /// (checked on the leader; the apply boundary stays silent).
    pub fn delete(&self, key: impl Into<Bytes>) -> Result<(), RaftError> {
        let key = key.into();

        self.node.ensure_leader()?;
        if !self.node.local_contains(&key)? {
            return Err(StoreError::NotFound.into());
        }

        self.node.submit(Command::delete(key))
    }

    /// Returns the number of keys in the applied state.
    pub fn size(&self) -> u64 {
        self.node.local_size()
    }
}

impl std::fmt::Debug for ReplicatedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedStore")
            .field("node", &self.node.id())
            .finish()
    }
}
