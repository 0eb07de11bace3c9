//! # helm-store: Paged B+Tree storage engine for `HelmDB`
//!
//! This crate provides the durable index that serves as the replicated
//! cluster's state machine:
//!
//! - **B+Tree indexing**: point insert/lookup/delete over opaque byte keys
//! - **Page-based storage**: 4KB pages, big-endian node encoding
//! - **Crash consistency**: copy-on-write pages with an atomic superblock swap
//! - **Backend polymorphism**: the [`StorageEngine`] trait with a durable
//!   tree variant and an in-memory variant
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │  StorageEngine (public contract)                    │
//! ├─────────────────────────────────────────────────────┤
//! │  Tree (descent, splits, rebalancing, CoW commit)    │
//! ├─────────────────────────────────────────────────────┤
//! │  PageCache (clean-only LRU, dirty tracking)         │
//! ├─────────────────────────────────────────────────────┤
//! │  PageFile (DiskFile / MemFile)                      │
//! └─────────────────────────────────────────────────────┘
//! ```

mod cache;
mod error;
mod file;
mod memory;
mod node;
mod page;
mod tree;
mod types;


// Public API
pub use error::StoreError;
pub use file::{DiskFile, MemFile, PageFile};
pub use memory::MemoryEngine;
pub use node::{Entry, Node, NodeKind};
pub use page::Page;
pub use tree::Tree;
pub use types::{PageId, MAX_KEY_LEN, MAX_VALUE_LEN, PAGE_SIZE};

use std::path::Path;
use std::str::FromStr;

use bytes::Bytes;

// ============================================================================
// Storage Engine Contract
// ============================================================================

/// The capability set consensus depends on.
///
/// Both backends implement the same contract, so the replicated layer is
/// polymorphic over where applied state actually lives. Read methods take
/// `&mut self` because the tree variant may fault pages into its cache.
pub trait StorageEngine: Send {
    /// Stores a new key/value pair.
    ///
    /// # Errors
    ///
    /// `KeyTooLarge` / `ValueTooLarge` on bound violations and
    /// `DuplicateKey` if the key already exists.
    fn put(&mut self, key: Bytes, value: Bytes) -> Result<(), StoreError>;

    /// Returns the value stored under `key`, if any.
    fn get(&mut self, key: &[u8]) -> Result<Option<Bytes>, StoreError>;

    /// Removes a key.
    ///
    /// # Errors
    ///
    /// `NotFound` if the key is absent.
    fn delete(&mut self, key: &[u8]) -> Result<(), StoreError>;

    /// Returns the number of keys stored.
    fn len(&self) -> u64;

    /// Returns true if no keys are stored.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forces buffered state to durable storage.
    fn sync(&mut self) -> Result<(), StoreError>;
}

impl StorageEngine for Tree {
    fn put(&mut self, key: Bytes, value: Bytes) -> Result<(), StoreError> {
        self.insert(key, value)
    }

    fn get(&mut self, key: &[u8]) -> Result<Option<Bytes>, StoreError> {
        Tree::get(self, key)
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), StoreError> {
        Tree::delete(self, key)
    }

    fn len(&self) -> u64 {
        Tree::len(self)
    }

    fn sync(&mut self) -> Result<(), StoreError> {
        Tree::sync(self)
    }
}

// ============================================================================
// Engine Selection
// ============================================================================

/// Which storage backend a replica runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineKind {
    /// The durable paged B+Tree.
    #[default]
    Tree,
    /// The volatile in-memory engine.
    Memory,
}

impl FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tree" => Ok(Self::Tree),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown engine '{other}' (expected tree|memory)")),
        }
    }
}

/// Opens a storage engine of the requested kind.
///
/// The tree engine persists at `path`; the memory engine ignores it.
pub fn open_engine(kind: EngineKind, path: impl AsRef<Path>) -> Result<Box<dyn StorageEngine>, StoreError> {
    match kind {
        EngineKind::Tree => {
            let file = DiskFile::open(path)?;
            Ok(Box::new(Tree::open(Box::new(file))?))
        }
        EngineKind::Memory => Ok(Box::new(MemoryEngine::new())),
    }
}
