//! In-memory storage engine.
//!
//! A `BTreeMap`-backed implementation of [`StorageEngine`](crate::StorageEngine)
//! with the same contract as the paged tree: size bounds enforced,
//! `DuplicateKey` on repeated insert, `NotFound` on missing delete. Used by
//! tests and as the lightweight backend selector option.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::error::StoreError;
use crate::types::{MAX_KEY_LEN, MAX_VALUE_LEN};
use crate::StorageEngine;

/// Volatile key/value engine with B+Tree-equivalent semantics.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    map: BTreeMap<Bytes, Bytes>,
}

impl MemoryEngine {
    /// Creates an empty engine.
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageEngine for MemoryEngine {
    fn put(&mut self, key: Bytes, value: Bytes) -> Result<(), StoreError> {
        if key.len() > MAX_KEY_LEN {
            return Err(StoreError::KeyTooLarge {
                len: key.len(),
                max: MAX_KEY_LEN,
            });
        }
        if value.len() > MAX_VALUE_LEN {
            return Err(StoreError::ValueTooLarge {
                len: value.len(),
                max: MAX_VALUE_LEN,
            });
        }
        if self.map.contains_key(&key) {
            return Err(StoreError::DuplicateKey);
        }

        self.map.insert(key, value);
        Ok(())
    }

    fn get(&mut self, key: &[u8]) -> Result<Option<Bytes>, StoreError> {
        Ok(self.map.get(key).cloned())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), StoreError> {
        match self.map.remove(key) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound),
        }
    }

    fn len(&self) -> u64 {
        self.map.len() as u64
    }

    fn sync(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod memory_tests {
    use super::*;

    #[test]
    fn contract_matches_tree() {
        let mut engine = MemoryEngine::new();

        engine
            .put(Bytes::from("k"), Bytes::from("v1"))
            .unwrap();
        assert!(matches!(
            engine.put(Bytes::from("k"), Bytes::from("v2")),
            Err(StoreError::DuplicateKey)
        ));
        assert_eq!(engine.get(b"k").unwrap(), Some(Bytes::from("v1")));

        engine.delete(b"k").unwrap();
        assert!(matches!(engine.delete(b"k"), Err(StoreError::NotFound)));
        assert_eq!(engine.len(), 0);
    }

    #[test]
    fn bounds_enforced() {
        let mut engine = MemoryEngine::new();
        assert!(matches!(
            engine.put(Bytes::from(vec![0u8; MAX_KEY_LEN + 1]), Bytes::new()),
            Err(StoreError::KeyTooLarge { .. })
        ));
        assert!(matches!(
            engine.put(Bytes::from("k"), Bytes::from(vec![0u8; MAX_VALUE_LEN + 1])),
            Err(StoreError::ValueTooLarge { .. })
        ));
    }
}
