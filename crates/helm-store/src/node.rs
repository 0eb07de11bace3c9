//! B+Tree nodes and their on-page encoding.
//!
//! A node serializes into exactly one 4096-byte page:
//!
//! ```text
//! | kind (2B) | nkeys (2B) | children[nkeys+1] (8B each, internal only) |
//! | offsets[nkeys] (2B each) | entries (variable) | unused |
//! ```
//!
//! Each entry is `keylen(2) | vallen(2) | key | value`, with offsets measured
//! from the start of the entry region. All integers are big-endian.
//!
//! - **Leaf** (`kind == 2`): entries hold the stored values; `children` is
//!   empty.
//! - **Internal** (`kind == 1`): entry values are empty and the keys act as
//!   separators; `children.len() == nkeys + 1`, with keys in subtree `i`
//!   below `keys[i]` and subtree `i + 1` at or above it.

use bytes::Bytes;

use crate::error::StoreError;
use crate::page::Page;
use crate::types::{PageId, ENTRY_HEADER_SIZE, MAX_KEY_LEN, MAX_VALUE_LEN, NODE_HEADER_SIZE, PAGE_SIZE};

// ============================================================================
// Node Kind
// ============================================================================

/// Kind of a B+Tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum NodeKind {
    /// Internal node: separator keys plus child page pointers.
    Internal = 1,
    /// Leaf node: keys plus stored values.
    Leaf = 2,
}

impl NodeKind {
    /// Creates a `NodeKind` from its wire representation.
    pub fn from_u16(kind: u16) -> Option<Self> {
        match kind {
            1 => Some(Self::Internal),
            2 => Some(Self::Leaf),
            _ => None,
        }
    }
}

// ============================================================================
// Entry
// ============================================================================

/// A single key/value entry within a node.
///
/// Internal nodes carry entries with empty values; the key is the separator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Bytes,
    pub value: Bytes,
}

impl Entry {
    /// Creates a new entry.
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Creates a separator entry (empty value) for an internal node.
    pub fn separator(key: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: Bytes::new(),
        }
    }

    /// Returns the encoded size of this entry.
    pub fn encoded_size(&self) -> usize {
        ENTRY_HEADER_SIZE + self.key.len() + self.value.len()
    }
}

// ============================================================================
// Node
// ============================================================================

/// An in-memory B+Tree node, decoded from (or encodable into) one page.
///
/// # Invariants
///
/// - Entries are in ascending key order with unique keys.
/// - For an internal node, `children.len() == entries.len() + 1` and all
///   entry values are empty.
/// - For a leaf node, `children` is empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    kind: NodeKind,
    entries: Vec<Entry>,
    children: Vec<PageId>,
}

impl Node {
    /// Creates an empty leaf node.
    pub fn leaf() -> Self {
        Self {
            kind: NodeKind::Leaf,
            entries: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Creates an internal node from a split: two children and a separator.
    pub fn root_from_split(left: PageId, separator: Bytes, right: PageId) -> Self {
        Self {
            kind: NodeKind::Internal,
            entries: vec![Entry::separator(separator)],
            children: vec![left, right],
        }
    }

    /// Returns the node kind.
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Returns true if this is a leaf node.
    pub fn is_leaf(&self) -> bool {
        self.kind == NodeKind::Leaf
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the node holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the entry at `pos`.
    pub fn entry(&self, pos: usize) -> &Entry {
        &self.entries[pos]
    }

    /// Returns the entries in key order.
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Returns the child page id at `pos` (internal nodes only).
    pub fn child(&self, pos: usize) -> PageId {
        self.children[pos]
    }

    /// Returns the child pointers.
    pub fn children(&self) -> &[PageId] {
        &self.children
    }

    /// Returns the number of children.
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Replaces the child page id at `pos`.
    pub fn set_child(&mut self, pos: usize, child: PageId) {
        self.children[pos] = child;
    }

    /// Replaces the separator key at `pos` (internal nodes only).
    pub fn set_separator(&mut self, pos: usize, key: Bytes) {
        debug_assert_eq!(self.kind, NodeKind::Internal, "separator on leaf");
        self.entries[pos] = Entry::separator(key);
    }

    /// Returns the first key, if any.
    pub fn first_key(&self) -> Option<&Bytes> {
        self.entries.first().map(|e| &e.key)
    }

    // ========================================================================
    // Search
    // ========================================================================

    /// Locates `key` among the entries.
    ///
    /// Returns `Ok(pos)` on an exact match or `Err(pos)` with the first
    /// position holding a greater key. Keys are sorted, so a binary search
    /// suffices at 4KB fan-out.
    pub fn search(&self, key: &[u8]) -> Result<usize, usize> {
        self.entries.binary_search_by(|e| e.key.as_ref().cmp(key))
    }

    /// Returns the index of the child to descend into for `key`.
    ///
    /// Child `i` holds keys below `keys[i]`; the last child holds everything
    /// at or above the last separator.
    pub fn child_index_for(&self, key: &[u8]) -> usize {
        debug_assert_eq!(self.kind, NodeKind::Internal, "descend through leaf");
        match self.search(key) {
            Ok(pos) => pos + 1,
            Err(pos) => pos,
        }
    }

    // ========================================================================
    // Entry mutation
    // ========================================================================

    /// Inserts `entry` at position `pos`, shifting later entries right.
    pub fn insert_entry(&mut self, pos: usize, entry: Entry) {
        debug_assert!(pos <= self.entries.len(), "insert position out of bounds");
        self.entries.insert(pos, entry);
    }

    /// Removes and returns the entry at position `pos`.
    pub fn remove_entry(&mut self, pos: usize) -> Entry {
        debug_assert!(pos < self.entries.len(), "remove position out of bounds");
        self.entries.remove(pos)
    }

    /// Inserts a separator and the child to its right (internal nodes only).
    ///
    /// Used when a child at `pos` split: the new separator lands at `pos`
    /// and the new right sibling becomes child `pos + 1`.
    pub fn insert_split(&mut self, pos: usize, separator: Bytes, right: PageId) {
        debug_assert_eq!(self.kind, NodeKind::Internal, "split insert on leaf");
        self.entries.insert(pos, Entry::separator(separator));
        self.children.insert(pos + 1, right);
    }

    /// Removes the separator at `pos` and the child to its right.
    ///
    /// Inverse of [`insert_split`](Self::insert_split); used when the child
    /// at `pos + 1` has been merged away.
    pub fn remove_split(&mut self, pos: usize) -> (Entry, PageId) {
        debug_assert_eq!(self.kind, NodeKind::Internal, "split remove on leaf");
        let entry = self.entries.remove(pos);
        let child = self.children.remove(pos + 1);
        (entry, child)
    }

    /// Inserts a bare child pointer at `pos` (internal nodes only).
    ///
    /// Used by redistribution, which rotates an entry and a child across
    /// the parent separately.
    pub fn insert_child(&mut self, pos: usize, child: PageId) {
        debug_assert_eq!(self.kind, NodeKind::Internal, "child insert on leaf");
        self.children.insert(pos, child);
    }

    /// Removes and returns the child pointer at `pos` (internal nodes only).
    pub fn remove_child(&mut self, pos: usize) -> PageId {
        debug_assert_eq!(self.kind, NodeKind::Internal, "child remove on leaf");
        self.children.remove(pos)
    }

    // ========================================================================
    // Size accounting
    // ========================================================================

    /// Returns the serialized size of this node in bytes.
    pub fn encoded_size(&self) -> usize {
        let children = if self.kind == NodeKind::Internal {
            self.children.len() * 8
        } else {
            0
        };
        let offsets = self.entries.len() * 2;
        let entries: usize = self.entries.iter().map(Entry::encoded_size).sum();
        NODE_HEADER_SIZE + children + offsets + entries
    }

    /// Returns true if the node no longer fits in a page and must split.
    pub fn is_overfull(&self) -> bool {
        self.encoded_size() > PAGE_SIZE
    }

    // ========================================================================
    // Split & merge
    // ========================================================================

    /// Splits the node in half, returning the promoted separator and the
    /// new right sibling.
    ///
    /// The partition point is `m = nkeys / 2`. For a leaf the separator is
    /// the right half's first key and continues to live there; for an
    /// internal node the key at `m` moves up to the parent and child `m + 1`
    /// onward follow it to the right sibling.
    ///
    /// # Errors
    ///
    /// `StoreError::TooLarge` if either half would still exceed a page.
    pub fn split(&mut self) -> Result<(Bytes, Node), StoreError> {
        debug_assert!(self.entries.len() >= 2, "split of a node with <2 entries");
        let m = self.entries.len() / 2;

        let (separator, right) = match self.kind {
            NodeKind::Leaf => {
                let right_entries = self.entries.split_off(m);
                let separator = right_entries[0].key.clone();
                (
                    separator,
                    Node {
                        kind: NodeKind::Leaf,
                        entries: right_entries,
                        children: Vec::new(),
                    },
                )
            }
            NodeKind::Internal => {
                let mut right_entries = self.entries.split_off(m);
                let right_children = self.children.split_off(m + 1);
                let separator = right_entries.remove(0).key;
                (
                    separator,
                    Node {
                        kind: NodeKind::Internal,
                        entries: right_entries,
                        children: right_children,
                    },
                )
            }
        };

        if self.encoded_size() > PAGE_SIZE {
            return Err(StoreError::TooLarge {
                size: self.encoded_size(),
            });
        }
        if right.encoded_size() > PAGE_SIZE {
            return Err(StoreError::TooLarge {
                size: right.encoded_size(),
            });
        }

        Ok((separator, right))
    }

    /// Returns the size the node would have after absorbing `right`.
    ///
    /// `separator` is the parent key pulled down between two internal
    /// siblings; leaves concatenate directly.
    pub fn merged_size(&self, separator: &Bytes, right: &Node) -> usize {
        let sep = match self.kind {
            NodeKind::Internal => 2 + ENTRY_HEADER_SIZE + separator.len(),
            NodeKind::Leaf => 0,
        };
        // Right's header is absorbed; its children and offsets are not.
        self.encoded_size() + sep + right.encoded_size() - NODE_HEADER_SIZE
    }

    /// Absorbs `right` into this node.
    ///
    /// For internal nodes the parent separator is pulled down between the
    /// two key runs. The caller is responsible for checking
    /// [`merged_size`](Self::merged_size) first and for unlinking `right`
    /// from the parent.
    pub fn merge(&mut self, separator: Bytes, mut right: Node) {
        debug_assert_eq!(self.kind, right.kind, "merge of mismatched kinds");
        if self.kind == NodeKind::Internal {
            self.entries.push(Entry::separator(separator));
            self.children.append(&mut right.children);
        }
        self.entries.append(&mut right.entries);
    }

    // ========================================================================
    // Encoding
    // ========================================================================

    /// Serializes the node into a page with the given id.
    pub fn encode(&self, id: PageId) -> Page {
        debug_assert!(!self.is_overfull(), "encoding an overfull node");
        debug_assert!(
            self.kind == NodeKind::Leaf || self.children.len() == self.entries.len() + 1,
            "internal child count must be nkeys + 1"
        );

        let mut page = Page::new(id);
        page.write_u16(0, self.kind as u16);
        page.write_u16(2, self.entries.len() as u16);

        let mut pos = NODE_HEADER_SIZE;
        if self.kind == NodeKind::Internal {
            for child in &self.children {
                page.write_u64(pos, child.as_u64());
                pos += 8;
            }
        }

        let offsets_start = pos;
        let entries_start = offsets_start + self.entries.len() * 2;

        let mut entry_offset = 0usize;
        for (i, entry) in self.entries.iter().enumerate() {
            page.write_u16(offsets_start + i * 2, entry_offset as u16);

            let at = entries_start + entry_offset;
            page.write_u16(at, entry.key.len() as u16);
            page.write_u16(at + 2, entry.value.len() as u16);
            page.write_slice(at + ENTRY_HEADER_SIZE, &entry.key);
            page.write_slice(at + ENTRY_HEADER_SIZE + entry.key.len(), &entry.value);

            entry_offset += entry.encoded_size();
        }

        page
    }

    /// Decodes a node from a page.
    ///
    /// # Errors
    ///
    /// `StoreError::Corrupt` if the kind is unknown, any offset or length
    /// runs past the page, offsets are not strictly increasing, or an
    /// internal entry carries a value.
    pub fn decode(page: &Page) -> Result<Self, StoreError> {
        let corrupt = |reason: &'static str| StoreError::Corrupt {
            page_id: page.id,
            reason,
        };

        let kind = NodeKind::from_u16(page.read_u16(0)).ok_or(corrupt("unknown node kind"))?;
        let nkeys = page.read_u16(2) as usize;

        let mut pos = NODE_HEADER_SIZE;
        let mut children = Vec::new();
        if kind == NodeKind::Internal {
            let child_count = nkeys + 1;
            if pos + child_count * 8 > PAGE_SIZE {
                return Err(corrupt("child array exceeds page"));
            }
            children.reserve(child_count);
            for _ in 0..child_count {
                children.push(PageId::new(page.read_u64(pos)));
                pos += 8;
            }
        }

        let offsets_start = pos;
        let entries_start = offsets_start + nkeys * 2;
        if entries_start > PAGE_SIZE {
            return Err(corrupt("offset array exceeds page"));
        }
        let region_len = PAGE_SIZE - entries_start;

        let mut entries = Vec::with_capacity(nkeys);
        let mut prev_offset: Option<usize> = None;
        for i in 0..nkeys {
            let offset = page.read_u16(offsets_start + i * 2) as usize;
            if let Some(prev) = prev_offset {
                if offset <= prev {
                    return Err(corrupt("offsets not strictly increasing"));
                }
            }
            prev_offset = Some(offset);

            if offset + ENTRY_HEADER_SIZE > region_len {
                return Err(corrupt("entry header exceeds page"));
            }
            let at = entries_start + offset;
            let key_len = page.read_u16(at) as usize;
            let val_len = page.read_u16(at + 2) as usize;
            if key_len > MAX_KEY_LEN {
                return Err(corrupt("key length exceeds bound"));
            }
            if val_len > MAX_VALUE_LEN {
                return Err(corrupt("value length exceeds bound"));
            }
            if kind == NodeKind::Internal && val_len != 0 {
                return Err(corrupt("internal entry carries a value"));
            }
            if offset + ENTRY_HEADER_SIZE + key_len + val_len > region_len {
                return Err(corrupt("entry data exceeds page"));
            }

            let key = Bytes::copy_from_slice(page.read_slice(at + ENTRY_HEADER_SIZE, key_len));
            let value = Bytes::copy_from_slice(
                page.read_slice(at + ENTRY_HEADER_SIZE + key_len, val_len),
            );
            entries.push(Entry { key, value });
        }

        Ok(Self {
            kind,
            entries,
            children,
        })
    }
}

#[cfg(test)]
mod node_tests {
    use super::*;

    fn leaf_with(entries: &[(&str, &str)]) -> Node {
        let mut node = Node::leaf();
        for (i, (k, v)) in entries.iter().enumerate() {
            node.insert_entry(i, Entry::new(k.as_bytes().to_vec(), v.as_bytes().to_vec()));
        }
        node
    }

    #[test]
    fn leaf_roundtrip() {
        let node = leaf_with(&[("apple", "red"), ("banana", "yellow"), ("cherry", "dark")]);
        let page = node.encode(PageId::new(7));
        let decoded = Node::decode(&page).unwrap();
        assert_eq!(decoded, node);
    }

    #[test]
    fn internal_roundtrip() {
        let mut node = Node::root_from_split(
            PageId::new(1),
            Bytes::from_static(b"m"),
            PageId::new(2),
        );
        node.insert_split(1, Bytes::from_static(b"t"), PageId::new(3));

        let page = node.encode(PageId::new(9));
        let decoded = Node::decode(&page).unwrap();
        assert_eq!(decoded, node);
        assert_eq!(decoded.child_count(), decoded.len() + 1);
    }

    #[test]
    fn empty_leaf_roundtrip() {
        let node = Node::leaf();
        let page = node.encode(PageId::new(1));
        let decoded = Node::decode(&page).unwrap();
        assert!(decoded.is_empty());
        assert!(decoded.is_leaf());
    }

    #[test]
    fn search_positions() {
        let node = leaf_with(&[("b", "1"), ("d", "2"), ("f", "3")]);

        assert_eq!(node.search(b"b"), Ok(0));
        assert_eq!(node.search(b"d"), Ok(1));
        assert_eq!(node.search(b"a"), Err(0));
        assert_eq!(node.search(b"c"), Err(1));
        assert_eq!(node.search(b"z"), Err(3));
    }

    #[test]
    fn child_routing() {
        let mut node = Node::root_from_split(
            PageId::new(1),
            Bytes::from_static(b"m"),
            PageId::new(2),
        );
        node.insert_split(1, Bytes::from_static(b"t"), PageId::new(3));

        // keys < "m" go left, "m" <= keys < "t" go middle, keys >= "t" go right
        assert_eq!(node.child_index_for(b"a"), 0);
        assert_eq!(node.child_index_for(b"m"), 1);
        assert_eq!(node.child_index_for(b"n"), 1);
        assert_eq!(node.child_index_for(b"t"), 2);
        assert_eq!(node.child_index_for(b"z"), 2);
    }

    #[test]
    fn leaf_split_keeps_separator_in_right() {
        let mut node = leaf_with(&[("a", "1"), ("b", "2"), ("c", "3"), ("d", "4")]);
        let (separator, right) = node.split().unwrap();

        assert_eq!(&separator[..], b"c");
        assert_eq!(node.len(), 2);
        assert_eq!(right.len(), 2);
        assert_eq!(right.first_key().unwrap().as_ref(), b"c");
    }

    #[test]
    fn internal_split_promotes_middle_key() {
        let mut node = Node::root_from_split(
            PageId::new(1),
            Bytes::from_static(b"b"),
            PageId::new(2),
        );
        node.insert_split(1, Bytes::from_static(b"d"), PageId::new(3));
        node.insert_split(2, Bytes::from_static(b"f"), PageId::new(4));
        node.insert_split(3, Bytes::from_static(b"h"), PageId::new(5));

        let (separator, right) = node.split().unwrap();

        // m = 2: "f" goes up, left keeps {b, d} with 3 children,
        // right keeps {h} with 2 children.
        assert_eq!(&separator[..], b"f");
        assert_eq!(node.len(), 2);
        assert_eq!(node.child_count(), 3);
        assert_eq!(right.len(), 1);
        assert_eq!(right.child_count(), 2);
    }

    #[test]
    fn merge_leaves() {
        let mut left = leaf_with(&[("a", "1")]);
        let right = leaf_with(&[("b", "2"), ("c", "3")]);

        let size = left.merged_size(&Bytes::new(), &right);
        assert!(size <= PAGE_SIZE);

        left.merge(Bytes::new(), right);
        assert_eq!(left.len(), 3);
        assert_eq!(left.entry(0).key.as_ref(), b"a");
        assert_eq!(left.entry(2).key.as_ref(), b"c");
    }

    #[test]
    fn merge_internal_pulls_separator_down() {
        let mut left = Node::root_from_split(
            PageId::new(1),
            Bytes::from_static(b"b"),
            PageId::new(2),
        );
        let right = Node::root_from_split(
            PageId::new(3),
            Bytes::from_static(b"f"),
            PageId::new(4),
        );

        left.merge(Bytes::from_static(b"d"), right);

        assert_eq!(left.len(), 3);
        assert_eq!(left.child_count(), 4);
        assert_eq!(left.entry(1).key.as_ref(), b"d");
    }

    #[test]
    fn overfull_detection() {
        let mut node = Node::leaf();
        let mut i = 0usize;
        while !node.is_overfull() {
            let key = format!("key-{i:05}");
            node.insert_entry(node.len(), Entry::new(key.into_bytes(), vec![0u8; 100]));
            i += 1;
        }
        assert!(node.encoded_size() > PAGE_SIZE);

        node.remove_entry(node.len() - 1);
        assert!(!node.is_overfull());
        assert!(node.encoded_size() <= PAGE_SIZE);
    }

    #[test]
    fn decode_rejects_bad_kind() {
        let node = leaf_with(&[("a", "1")]);
        let mut page = node.encode(PageId::new(1));
        page.write_u16(0, 9);

        assert!(matches!(
            Node::decode(&page),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn decode_rejects_oversized_lengths() {
        let node = leaf_with(&[("a", "1")]);
        let mut page = node.encode(PageId::new(1));
        // Corrupt the key length of the first entry (entry region starts
        // right after the header and one offset slot).
        let entries_start = NODE_HEADER_SIZE + 2;
        page.write_u16(entries_start, u16::MAX);

        assert!(matches!(
            Node::decode(&page),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn decode_rejects_unsorted_offsets() {
        let node = leaf_with(&[("a", "1"), ("b", "2")]);
        let mut page = node.encode(PageId::new(1));
        // Second offset must be greater than the first; zero it out.
        let offsets_start = NODE_HEADER_SIZE;
        page.write_u16(offsets_start + 2, 0);

        assert!(matches!(
            Node::decode(&page),
            Err(StoreError::Corrupt { .. })
        ));
    }
}
