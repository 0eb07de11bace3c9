//! The paged B+Tree.
//!
//! [`Tree`] owns a [`PageCache`] over the durable file, a root pointer, and
//! a free-page list, and implements point insert/lookup/delete with
//! recursive rebalancing.
//!
//! # Persistence
//!
//! Every mutating operation is copy-on-write: each modified node is
//! rewritten into a freshly allocated page, parents are rewritten to point
//! at the new children, and the superblock (page 0) is swapped last:
//!
//! 1. write new data pages and free-list links, sync;
//! 2. write the superblock with the new root and free-list head, sync.
//!
//! A page is only ever written while it is unreferenced by the *durable*
//! image, so a crash at any point leaves either the pre-operation or the
//! fully applied state. This forces freed pages through two staging pools:
//!
//! - `limbo` — pages freed by the most recent committed operation. The
//!   durable image no longer references them, so they may be reused at
//!   once; leftovers are chained into the durable free list at the next
//!   commit.
//! - `ready` — pages a previous superblock already struck from the durable
//!   free list. Pages still *on* the durable list are never written: their
//!   link bytes are live pre-state.
//!
//! # Superblock (page 0)
//!
//! | offset | size | field |
//! |---|---|---|
//! | 0 | 4 B | magic = 0x12345678 |
//! | 4 | 4 B | version = 1 |
//! | 8 | 8 B | root page id |
//! | 16 | 8 B | free-list head page id |
//! | 24 | 8 B | next page id (allocation watermark) |
//! | 32 | 8 B | key count |
//!
//! A free page holds the id of the next free page in its first 8 bytes.

use bytes::Bytes;
use tracing::trace;

use crate::cache::PageCache;
use crate::error::StoreError;
use crate::file::PageFile;
use crate::node::{Entry, Node};
use crate::page::Page;
use crate::types::{PageId, MAX_KEY_LEN, MAX_VALUE_LEN};

/// Database file magic.
const MAGIC: u32 = 0x1234_5678;

/// Database format version.
const VERSION: u32 = 1;

/// Maximum tree depth; descents past this indicate a corrupted file.
const MAX_DEPTH: usize = 32;

/// Free pages kept ready for allocation between commits.
const READY_TARGET: usize = 16;

// ============================================================================
// Descent bookkeeping
// ============================================================================

/// One internal node on the root-to-leaf path of a mutation.
struct PathStep {
    /// The node's current (pre-operation) page id.
    page_id: PageId,
    /// The decoded node.
    node: Node,
    /// Index of the child the descent took.
    child_pos: usize,
}

/// Snapshot of allocator and tree state, restored when an operation fails
/// before its commit point.
struct Snapshot {
    root: PageId,
    free_head: PageId,
    next_page: PageId,
    key_count: u64,
    limbo: Vec<PageId>,
    ready: Vec<PageId>,
}

// ============================================================================
// Tree
// ============================================================================

/// A durable B+Tree over opaque byte keys and values.
pub struct Tree {
    cache: PageCache,
    /// Root page id; `NONE` when the tree is empty.
    root: PageId,
    /// Head of the durable free list; `NONE` when empty.
    free_head: PageId,
    /// First never-allocated page id.
    next_page: PageId,
    /// Number of keys in the tree.
    key_count: u64,
    /// Pages freed by the last committed operation (reusable now,
    /// chained into the free list at the next commit).
    limbo: Vec<PageId>,
    /// Pages already struck from the durable free list (reusable now).
    ready: Vec<PageId>,
}

impl Tree {
    /// Opens or creates a tree over the given file.
    pub fn open(file: Box<dyn PageFile>) -> Result<Self, StoreError> {
        let mut cache = PageCache::new(file);

        if cache.file_pages() == 0 {
            let mut tree = Self {
                cache,
                root: PageId::NONE,
                free_head: PageId::NONE,
                next_page: PageId::new(1),
                key_count: 0,
                limbo: Vec::new(),
                ready: Vec::new(),
            };
            let superblock = tree.superblock_page(PageId::NONE, PageId::NONE);
            tree.cache.write_direct(&superblock)?;
            return Ok(tree);
        }

        let superblock = cache.read_direct(PageId::NONE)?;
        let magic = superblock.read_u32(0);
        if magic != MAGIC {
            return Err(StoreError::InvalidDb { actual: magic });
        }
        let version = superblock.read_u32(4);
        if version != VERSION {
            return Err(StoreError::UnsupportedVersion(version));
        }

        Ok(Self {
            cache,
            root: PageId::new(superblock.read_u64(8)),
            free_head: PageId::new(superblock.read_u64(16)),
            next_page: PageId::new(superblock.read_u64(24)),
            key_count: superblock.read_u64(32),
            limbo: Vec::new(),
            ready: Vec::new(),
        })
    }

    /// Returns the number of keys in the tree.
    pub fn len(&self) -> u64 {
        self.key_count
    }

    /// Returns true if the tree holds no keys.
    pub fn is_empty(&self) -> bool {
        self.key_count == 0
    }

    /// Forces buffered pages to durable storage.
    ///
    /// Each mutation commits durably on its own; this exists to satisfy
    /// callers that batch at a higher level.
    pub fn sync(&mut self) -> Result<(), StoreError> {
        self.cache.flush()
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Returns the value stored under `key`, if any.
    pub fn get(&mut self, key: &[u8]) -> Result<Option<Bytes>, StoreError> {
        if self.root.is_none() {
            return Ok(None);
        }

        let mut id = self.root;
        for _ in 0..MAX_DEPTH {
            let node = self.read_node(id)?;
            if node.is_leaf() {
                return Ok(match node.search(key) {
                    Ok(pos) => Some(node.entry(pos).value.clone()),
                    Err(_) => None,
                });
            }
            id = node.child(node.child_index_for(key));
        }

        Err(StoreError::Corrupt {
            page_id: id,
            reason: "tree deeper than maximum",
        })
    }

    // ========================================================================
    // Insert
    // ========================================================================

    /// Inserts a new key/value pair.
    ///
    /// # Errors
    ///
    /// - `KeyTooLarge` / `ValueTooLarge` if a bound is exceeded
    /// - `DuplicateKey` if the key is already present
    pub fn insert(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<(), StoreError> {
        let key = key.into();
        let value = value.into();

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

        let snapshot = self.snapshot();
        self.key_count += 1;
        match self.insert_staged(key, value) {
            Ok((new_root, freed)) => match self.commit(new_root, freed) {
                Ok(()) => Ok(()),
                Err(e) => {
                    self.rollback(snapshot);
                    Err(e)
                }
            },
            Err(e) => {
                self.rollback(snapshot);
                Err(e)
            }
        }
    }

    /// Stages an insert, returning the new root and the freed page ids.
    fn insert_staged(&mut self, key: Bytes, value: Bytes) -> Result<(PageId, Vec<PageId>), StoreError> {
        if self.root.is_none() {
            let mut leaf = Node::leaf();
            leaf.insert_entry(0, Entry::new(key, value));
            return Ok((self.stage(&leaf), Vec::new()));
        }

        let (mut path, leaf_id, mut leaf) = self.descend(&key)?;
        match leaf.search(&key) {
            Ok(_) => return Err(StoreError::DuplicateKey),
            Err(pos) => leaf.insert_entry(pos, Entry::new(key, value)),
        }

        let mut freed = vec![leaf_id];

        // Separator + right sibling waiting to be hooked into the parent.
        let mut carry: Option<(Bytes, PageId)> = None;
        let mut current = leaf;
        if current.is_overfull() {
            let (separator, right) = current.split()?;
            carry = Some((separator, self.stage(&right)));
        }
        let mut child_id = self.stage(&current);

        while let Some(mut step) = path.pop() {
            step.node.set_child(step.child_pos, child_id);
            if let Some((separator, right_id)) = carry.take() {
                step.node.insert_split(step.child_pos, separator, right_id);
            }
            if step.node.is_overfull() {
                let (separator, right) = step.node.split()?;
                carry = Some((separator, self.stage(&right)));
            }
            child_id = self.stage(&step.node);
            freed.push(step.page_id);
        }

        if let Some((separator, right_id)) = carry {
            let root = Node::root_from_split(child_id, separator, right_id);
            child_id = self.stage(&root);
            trace!(root = %child_id, "root split");
        }

        Ok((child_id, freed))
    }

    // ========================================================================
    // Delete
    // ========================================================================

    /// Removes `key` from the tree.
    ///
    /// # Errors
    ///
    /// `NotFound` if the key is absent.
    pub fn delete(&mut self, key: &[u8]) -> Result<(), StoreError> {
        if self.root.is_none() {
            return Err(StoreError::NotFound);
        }

        let snapshot = self.snapshot();
        self.key_count -= 1;
        match self.delete_staged(key) {
            Ok((new_root, freed)) => match self.commit(new_root, freed) {
                Ok(()) => Ok(()),
                Err(e) => {
                    self.rollback(snapshot);
                    Err(e)
                }
            },
            Err(e) => {
                self.rollback(snapshot);
                Err(e)
            }
        }
    }

    /// Stages a delete, returning the new root and the freed page ids.
    fn delete_staged(&mut self, key: &[u8]) -> Result<(PageId, Vec<PageId>), StoreError> {
        let (mut path, leaf_id, mut leaf) = self.descend(key)?;
        let pos = leaf.search(key).map_err(|_| StoreError::NotFound)?;
        leaf.remove_entry(pos);

        let mut freed = vec![leaf_id];
        let mut current = leaf;

        loop {
            match path.pop() {
                None => {
                    // `current` is the new root.
                    if current.is_empty() {
                        let new_root = if current.is_leaf() {
                            PageId::NONE
                        } else {
                            // An internal root with a single child collapses;
                            // the tree shrinks by one level.
                            current.child(0)
                        };
                        return Ok((new_root, freed));
                    }
                    return Ok((self.stage(&current), freed));
                }
                Some(mut step) => {
                    if current.is_empty() {
                        self.resolve_underflow(&mut step.node, step.child_pos, current, &mut freed)?;
                    } else {
                        let id = self.stage(&current);
                        step.node.set_child(step.child_pos, id);
                    }
                    freed.push(step.page_id);
                    current = step.node;
                }
            }
        }
    }

    /// Restores an empty child at `parent.child(pos)` by redistribution or
    /// merge with an adjacent sibling.
    ///
    /// Redistribution is preferred over merging, and the left sibling over
    /// the right. The child's old page id is freed by the caller; this
    /// method frees any sibling pages it rewrites.
    fn resolve_underflow(
        &mut self,
        parent: &mut Node,
        pos: usize,
        child: Node,
        freed: &mut Vec<PageId>,
    ) -> Result<(), StoreError> {
        debug_assert!(child.is_empty(), "underflow resolution on non-empty child");
        debug_assert!(parent.child_count() >= 2, "parent must have a sibling");

        // Redistribution: a donor must keep at least one entry.
        if pos > 0 {
            let left_id = parent.child(pos - 1);
            let left = self.read_node(left_id)?;
            if left.len() >= 2 {
                self.redistribute_from_left(parent, pos, left_id, left, child, freed);
                return Ok(());
            }
        }
        if pos + 1 < parent.child_count() {
            let right_id = parent.child(pos + 1);
            let right = self.read_node(right_id)?;
            if right.len() >= 2 {
                self.redistribute_from_right(parent, pos, right_id, right, child, freed);
                return Ok(());
            }
        }

        // Merge. Siblings here hold exactly one entry, so the result always
        // fits a page.
        if pos > 0 {
            let left_id = parent.child(pos - 1);
            let mut left = self.read_node(left_id)?;
            let (separator, _dead) = parent.remove_split(pos - 1);
            let sep = if child.is_leaf() { Bytes::new() } else { separator.key };
            left.merge(sep, child);
            debug_assert!(!left.is_overfull());

            let new_left = self.stage(&left);
            parent.set_child(pos - 1, new_left);
            freed.push(left_id);
        } else {
            let right_id = parent.child(pos + 1);
            let right = self.read_node(right_id)?;
            let (separator, _dead) = parent.remove_split(pos);
            let mut merged = child;
            let sep = if merged.is_leaf() { Bytes::new() } else { separator.key };
            merged.merge(sep, right);
            debug_assert!(!merged.is_overfull());

            let new_id = self.stage(&merged);
            parent.set_child(pos, new_id);
            freed.push(right_id);
        }

        Ok(())
    }

    /// Moves one entry from the left sibling into the empty child.
    fn redistribute_from_left(
        &mut self,
        parent: &mut Node,
        pos: usize,
        left_id: PageId,
        mut left: Node,
        mut child: Node,
        freed: &mut Vec<PageId>,
    ) {
        if child.is_leaf() {
            let donated = left.remove_entry(left.len() - 1);
            parent.set_separator(pos - 1, donated.key.clone());
            child.insert_entry(0, donated);
        } else {
            // Rotate through the parent: the separator comes down, the
            // donor's last key goes up, and its last child crosses over.
            let separator = parent.entry(pos - 1).key.clone();
            let crossing = left.remove_child(left.child_count() - 1);
            let promoted = left.remove_entry(left.len() - 1);
            child.insert_entry(0, Entry::separator(separator));
            child.insert_child(0, crossing);
            parent.set_separator(pos - 1, promoted.key);
        }
        debug_assert!(!left.is_overfull() && !child.is_overfull());

        let new_left = self.stage(&left);
        parent.set_child(pos - 1, new_left);
        freed.push(left_id);

        let new_child = self.stage(&child);
        parent.set_child(pos, new_child);
    }

    /// Moves one entry from the right sibling into the empty child.
    fn redistribute_from_right(
        &mut self,
        parent: &mut Node,
        pos: usize,
        right_id: PageId,
        mut right: Node,
        mut child: Node,
        freed: &mut Vec<PageId>,
    ) {
        if child.is_leaf() {
            let donated = right.remove_entry(0);
            child.insert_entry(0, donated);
            let new_separator = right.first_key().expect("donor keeps an entry").clone();
            parent.set_separator(pos, new_separator);
        } else {
            let separator = parent.entry(pos).key.clone();
            let crossing = right.remove_child(0);
            let promoted = right.remove_entry(0);
            child.insert_entry(child.len(), Entry::separator(separator));
            child.insert_child(child.child_count(), crossing);
            parent.set_separator(pos, promoted.key);
        }
        debug_assert!(!right.is_overfull() && !child.is_overfull());

        let new_child = self.stage(&child);
        parent.set_child(pos, new_child);

        let new_right = self.stage(&right);
        parent.set_child(pos + 1, new_right);
        freed.push(right_id);
    }

    // ========================================================================
    // Descent
    // ========================================================================

    /// Walks from the root to the leaf responsible for `key`, recording the
    /// internal path for the mutation to rewrite on the way back up.
    fn descend(&mut self, key: &[u8]) -> Result<(Vec<PathStep>, PageId, Node), StoreError> {
        let mut path = Vec::new();
        let mut id = self.root;

        for _ in 0..MAX_DEPTH {
            let node = self.read_node(id)?;
            if node.is_leaf() {
                return Ok((path, id, node));
            }
            let child_pos = node.child_index_for(key);
            let next = node.child(child_pos);
            path.push(PathStep {
                page_id: id,
                node,
                child_pos,
            });
            id = next;
        }

        Err(StoreError::Corrupt {
            page_id: id,
            reason: "tree deeper than maximum",
        })
    }

    /// Decodes the node stored at `id`.
    fn read_node(&mut self, id: PageId) -> Result<Node, StoreError> {
        Node::decode(self.cache.get(id)?)
    }

    // ========================================================================
    // Allocation & commit
    // ========================================================================

    /// Allocates a page id for a copy-on-write node.
    ///
    /// Preference order: pages freed by the last committed operation, then
    /// pages already struck from the durable free list, then fresh pages.
    /// All three are unreferenced by the durable image, so writing them
    /// never damages the pre-operation state.
    fn alloc(&mut self) -> PageId {
        if let Some(id) = self.limbo.pop() {
            return id;
        }
        if let Some(id) = self.ready.pop() {
            return id;
        }
        let id = self.next_page;
        self.next_page = self.next_page.next();
        id
    }

    /// Encodes `node` into a freshly allocated page and stages it.
    fn stage(&mut self, node: &Node) -> PageId {
        let id = self.alloc();
        self.cache.put(node.encode(id));
        id
    }

    /// Makes a staged operation durable.
    ///
    /// Writes data pages and free-list links, syncs, then swaps the
    /// superblock. Only after the swap succeeds does the in-memory state
    /// advance.
    fn commit(&mut self, new_root: PageId, freed: Vec<PageId>) -> Result<(), StoreError> {
        // Refill the ready pool from the durable list. These pages are only
        // read here; they become writable once the superblock below has
        // struck them from the list.
        let mut head = self.free_head;
        let mut popped = Vec::new();
        while self.ready.len() + popped.len() < READY_TARGET && !head.is_none() {
            let link = self.cache.read_direct(head)?;
            popped.push(head);
            head = PageId::new(link.read_u64(0));
        }

        // Chain last operation's leftover limbo pages onto the list. They
        // are durably unreferenced, so the link bytes cannot damage the
        // pre-operation image.
        for &id in &self.limbo {
            let mut link = Page::new(id);
            link.write_u64(0, head.as_u64());
            self.cache.put(link);
            head = id;
        }

        self.cache.flush()?;
        let superblock = self.superblock_page(new_root, head);
        self.cache.write_direct(&superblock)?;

        self.root = new_root;
        self.free_head = head;
        self.limbo = freed;
        self.ready.extend(popped);
        Ok(())
    }

    /// Builds the superblock image for the given root and free-list head.
    fn superblock_page(&self, root: PageId, free_head: PageId) -> Page {
        let mut page = Page::new(PageId::NONE);
        page.write_u32(0, MAGIC);
        page.write_u32(4, VERSION);
        page.write_u64(8, root.as_u64());
        page.write_u64(16, free_head.as_u64());
        page.write_u64(24, self.next_page.as_u64());
        page.write_u64(32, self.key_count);
        page
    }

    /// Captures the state restored when an operation fails pre-commit.
    fn snapshot(&self) -> Snapshot {
        Snapshot {
            root: self.root,
            free_head: self.free_head,
            next_page: self.next_page,
            key_count: self.key_count,
            limbo: self.limbo.clone(),
            ready: self.ready.clone(),
        }
    }

    /// Rolls the in-memory state back to `snapshot` and drops staged pages.
    fn rollback(&mut self, snapshot: Snapshot) {
        self.root = snapshot.root;
        self.free_head = snapshot.free_head;
        self.next_page = snapshot.next_page;
        self.key_count = snapshot.key_count;
        self.limbo = snapshot.limbo;
        self.ready = snapshot.ready;
        self.cache.discard_dirty();
    }

    // ========================================================================
    // Test support
    // ========================================================================

    /// Walks the whole tree checking structural invariants.
    ///
    /// Verifies that all leaves sit at the same depth, that no node other
    /// than the root is empty, that every node fits its page, that keys are
    /// sorted, and that internal nodes carry `nkeys + 1` children.
    #[cfg(test)]
    pub(crate) fn check_invariants(&mut self) -> Result<(), String> {
        use crate::types::PAGE_SIZE;

        if self.root.is_none() {
            return Ok(());
        }

        let mut leaf_depth: Option<usize> = None;
        let mut stack = vec![(self.root, 0usize)];
        while let Some((id, depth)) = stack.pop() {
            let is_root = id == self.root;
            let node = self.read_node(id).map_err(|e| e.to_string())?;

            if node.encoded_size() > PAGE_SIZE {
                return Err(format!("node {id} exceeds page size"));
            }
            if node.is_empty() && !is_root {
                return Err(format!("non-root node {id} is empty"));
            }
            for window in node.entries().windows(2) {
                if window[0].key >= window[1].key {
                    return Err(format!("node {id} keys out of order"));
                }
            }

            if node.is_leaf() {
                match leaf_depth {
                    None => leaf_depth = Some(depth),
                    Some(expected) if expected != depth => {
                        return Err(format!(
                            "leaf {id} at depth {depth}, expected {expected}"
                        ));
                    }
                    Some(_) => {}
                }
            } else {
                if node.child_count() != node.len() + 1 {
                    return Err(format!("internal node {id} child count mismatch"));
                }
                for &child in node.children() {
                    stack.push((child, depth + 1));
                }
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree")
            .field("root", &self.root)
            .field("keys", &self.key_count)
            .field("next_page", &self.next_page)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tree_tests {
    use super::*;
    use crate::file::{DiskFile, MemFile};
    use tempfile::tempdir;

    fn mem_tree() -> Tree {
        Tree::open(Box::new(MemFile::new())).unwrap()
    }

    #[test]
    fn empty_tree_lookup() {
        let mut tree = mem_tree();
        assert_eq!(tree.get(b"missing").unwrap(), None);
        assert!(tree.is_empty());
    }

    #[test]
    fn single_insert_and_get() {
        let mut tree = mem_tree();
        tree.insert(&b"hello"[..], &b"world"[..]).unwrap();

        assert_eq!(tree.get(b"hello").unwrap(), Some(Bytes::from("world")));
        assert_eq!(tree.get(b"other").unwrap(), None);
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn duplicate_insert_rejected() {
        let mut tree = mem_tree();
        tree.insert(&b"k"[..], &b"v1"[..]).unwrap();

        assert!(matches!(
            tree.insert(&b"k"[..], &b"v2"[..]),
            Err(StoreError::DuplicateKey)
        ));
        // The original value survives and the count is unchanged.
        assert_eq!(tree.get(b"k").unwrap(), Some(Bytes::from("v1")));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn key_and_value_bounds() {
        let mut tree = mem_tree();

        let long_key = vec![0u8; MAX_KEY_LEN + 1];
        assert!(matches!(
            tree.insert(long_key, &b"v"[..]),
            Err(StoreError::KeyTooLarge { .. })
        ));

        let long_value = vec![0u8; MAX_VALUE_LEN + 1];
        assert!(matches!(
            tree.insert(&b"k"[..], long_value),
            Err(StoreError::ValueTooLarge { .. })
        ));

        // Exactly at the bounds is accepted.
        tree.insert(vec![1u8; MAX_KEY_LEN], vec![2u8; MAX_VALUE_LEN])
            .unwrap();
    }

    #[test]
    fn delete_missing_key() {
        let mut tree = mem_tree();
        assert!(matches!(tree.delete(b"nope"), Err(StoreError::NotFound)));

        tree.insert(&b"a"[..], &b"1"[..]).unwrap();
        assert!(matches!(tree.delete(b"nope"), Err(StoreError::NotFound)));
    }

    #[test]
    fn insert_delete_roundtrip() {
        let mut tree = mem_tree();
        tree.insert(&b"hello"[..], &b"world"[..]).unwrap();
        tree.delete(b"hello").unwrap();

        assert_eq!(tree.get(b"hello").unwrap(), None);
        assert!(tree.is_empty());
    }

    #[test]
    fn many_inserts_stay_balanced() {
        let mut tree = mem_tree();

        // Roughly 100 bytes per entry: a few hundred entries forces several
        // levels of splits.
        for i in 0..500u32 {
            let key = format!("key-{i:05}");
            let value = format!("value-{i:05}-{}", "x".repeat(80));
            tree.insert(key.into_bytes(), value.into_bytes()).unwrap();
        }

        tree.check_invariants().unwrap();
        assert_eq!(tree.len(), 500);

        for i in 0..500u32 {
            let key = format!("key-{i:05}");
            let got = tree.get(key.as_bytes()).unwrap();
            assert!(got.is_some(), "missing {key}");
        }
    }

    #[test]
    fn deletes_rebalance_back_down() {
        let mut tree = mem_tree();

        for i in 0..400u32 {
            let key = format!("key-{i:05}");
            let value = "v".repeat(120);
            tree.insert(key.into_bytes(), value.into_bytes()).unwrap();
        }
        tree.check_invariants().unwrap();

        // Delete everything in an order that exercises both siblings.
        for i in (0..400u32).rev() {
            let key = format!("key-{i:05}");
            tree.delete(key.as_bytes()).unwrap();
            if i % 37 == 0 {
                tree.check_invariants().unwrap();
            }
        }

        assert!(tree.is_empty());
        assert_eq!(tree.get(b"key-00000").unwrap(), None);
    }

    #[test]
    fn interleaved_inserts_and_deletes_match_model() {
        use std::collections::BTreeMap;

        let mut tree = mem_tree();
        let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

        // Deterministic pseudo-random mix of operations.
        let mut state = 0x2545_f491_4f6c_dd1du64;
        for _ in 0..2000 {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;

            let key = format!("k{:03}", state % 331).into_bytes();
            if state % 3 == 0 {
                let expect = model.remove(&key);
                let got = tree.delete(&key);
                assert_eq!(expect.is_some(), got.is_ok());
            } else {
                let value = format!("v{state}").into_bytes();
                if model.contains_key(&key) {
                    assert!(matches!(
                        tree.insert(key, value),
                        Err(StoreError::DuplicateKey)
                    ));
                } else {
                    tree.insert(key.clone(), value.clone()).unwrap();
                    model.insert(key, value);
                }
            }
        }

        tree.check_invariants().unwrap();
        assert_eq!(tree.len(), model.len() as u64);
        for (key, value) in &model {
            assert_eq!(
                tree.get(key).unwrap(),
                Some(Bytes::from(value.clone())),
                "mismatch for {key:?}"
            );
        }
    }

    #[test]
    fn split_boundary_is_exact() {
        // Fill one leaf to just under the page size, then push it over and
        // verify the overflowing insert is the one that splits.
        let mut tree = mem_tree();

        // Each entry: 4-byte header + 8-byte key + 100-byte value = 112
        // bytes, plus a 2-byte offset slot = 114 bytes of page budget.
        let mut budget = 4usize; // node header
        let mut count = 0u32;
        loop {
            let next = budget + 2 + 4 + 8 + 100;
            if next > 4096 {
                break;
            }
            let key = format!("k{count:07}");
            tree.insert(key.into_bytes(), vec![b'v'; 100]).unwrap();
            budget = next;
            count += 1;
        }

        // Everything so far fits the single root leaf.
        tree.check_invariants().unwrap();

        // One more entry overflows the leaf and forces the first split.
        let key = format!("k{count:07}");
        tree.insert(key.into_bytes(), vec![b'v'; 100]).unwrap();
        tree.check_invariants().unwrap();

        for i in 0..=count {
            let key = format!("k{i:07}");
            assert!(tree.get(key.as_bytes()).unwrap().is_some());
        }
    }

    #[test]
    fn reopen_recovers_committed_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tree.db");

        {
            let file = DiskFile::open(&path).unwrap();
            let mut tree = Tree::open(Box::new(file)).unwrap();
            for i in 0..200u32 {
                let key = format!("key-{i:04}");
                let value = format!("value-{i}");
                tree.insert(key.into_bytes(), value.into_bytes()).unwrap();
            }
            tree.delete(b"key-0000").unwrap();
        }

        let file = DiskFile::open(&path).unwrap();
        let mut tree = Tree::open(Box::new(file)).unwrap();
        assert_eq!(tree.len(), 199);
        assert_eq!(tree.get(b"key-0000").unwrap(), None);
        assert_eq!(
            tree.get(b"key-0137").unwrap(),
            Some(Bytes::from("value-137"))
        );
        tree.check_invariants().unwrap();
    }

    #[test]
    fn open_rejects_foreign_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("not-a-db");

        {
            let mut file = DiskFile::open(&path).unwrap();
            let mut page = Page::new(PageId::NONE);
            page.write_u32(0, 0xdead_beef);
            file.write_page(&page).unwrap();
            file.sync().unwrap();
        }

        let file = DiskFile::open(&path).unwrap();
        assert!(matches!(
            Tree::open(Box::new(file)),
            Err(StoreError::InvalidDb { .. })
        ));
    }

    #[test]
    fn open_rejects_future_versions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("future.db");

        {
            let mut file = DiskFile::open(&path).unwrap();
            let mut page = Page::new(PageId::NONE);
            page.write_u32(0, MAGIC);
            page.write_u32(4, 99);
            file.write_page(&page).unwrap();
            file.sync().unwrap();
        }

        let file = DiskFile::open(&path).unwrap();
        assert!(matches!(
            Tree::open(Box::new(file)),
            Err(StoreError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn freed_pages_are_recycled() {
        let mut tree = mem_tree();

        // Churn the same keys; the file should not grow without bound
        // because copy-on-write pages return through the free list.
        for round in 0..50u32 {
            for i in 0..20u32 {
                let key = format!("churn-{i:02}");
                let value = format!("round-{round}");
                match tree.insert(key.clone().into_bytes(), value.into_bytes()) {
                    Ok(()) => {}
                    Err(StoreError::DuplicateKey) => {
                        tree.delete(key.as_bytes()).unwrap();
                        let value = format!("round-{round}");
                        tree.insert(key.into_bytes(), value.into_bytes()).unwrap();
                    }
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
        }

        // 20 keys in a single leaf plus recycled churn: the watermark stays
        // far below one-page-per-operation.
        assert!(
            tree.next_page.as_u64() < 200,
            "allocation watermark grew to {}",
            tree.next_page.as_u64()
        );
        tree.check_invariants().unwrap();
    }
}
