// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! L1: an ordered `u64 -> u64` B+tree (§4.4), used by
//! [`crate::index::IndexTree`] to map object ids to their physical flat
//! file address.
//!
//! Every node is a single fixed-size cell in an
//! [`crate::equi_blobs_file::EquiBlobsFile`]. Leaves are threaded with
//! `prev`/`next` links so the whole tree can be walked in key order without
//! revisiting branch nodes.

mod node;

use crate::equi_blobs_file::{EquiBlobsFile, NULL_ADDRESS};
use node::Node;
use std::{io, path::Path};

pub use node::{BigTreeNode, BIG_TREE_NODE_ENTRY_SIZE};

/// Maximum number of (key, value) pairs in a leaf, or keys in a branch.
const CAP: usize = 7;
/// Minimum number of entries a non-root node must hold after a removal.
const MIN: usize = CAP / 2;

const ROOT_FIELD: &str = "root";
const COUNT_FIELD: &str = "count";

/// An ordered `u64 -> u64` B+tree.
#[derive(Debug)]
pub struct BTree {
    cells: EquiBlobsFile,
    root: u64,
    count: u64,
}

impl BTree {
    /// Creates a brand-new, empty tree.
    pub fn create_new<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let cells = EquiBlobsFile::create_new(path, node::ENTRY_SIZE, &[ROOT_FIELD, COUNT_FIELD])?;
        Ok(Self {
            cells,
            root: NULL_ADDRESS,
            count: 0,
        })
    }

    /// Reopens a tree from its backing file.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let cells = EquiBlobsFile::open(path)?;
        let root = cells.custom_field(ROOT_FIELD).unwrap_or(NULL_ADDRESS);
        let count = cells.custom_field(COUNT_FIELD).unwrap_or(0);
        Ok(Self { cells, root, count })
    }

    /// Number of key/value pairs stored.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.count
    }

    /// Returns `true` if the tree holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Flushes the backing file to disk.
    pub fn sync(&self) -> io::Result<()> {
        self.cells.sync()
    }

    fn read_node(&self, address: u64) -> io::Result<Node> {
        Node::decode(&self.cells.retrieve_blob(address)?)
    }

    fn write_node(&mut self, address: u64, node: &Node) -> io::Result<()> {
        self.cells.store_blob(address, &node.encode())
    }

    fn persist_header(&mut self) -> io::Result<()> {
        self.cells.set_custom_field(ROOT_FIELD, self.root)?;
        self.cells.set_custom_field(COUNT_FIELD, self.count)
    }

    /// Returns the value associated with `key`, if present.
    pub fn get(&self, key: u64) -> io::Result<Option<u64>> {
        if self.root == NULL_ADDRESS {
            return Ok(None);
        }

        let mut address = self.root;
        loop {
            match self.read_node(address)? {
                Node::Leaf(leaf) => {
                    return Ok(leaf
                        .entries
                        .binary_search_by_key(&key, |&(k, _)| k)
                        .ok()
                        .map(|idx| leaf.entries[idx].1));
                }
                Node::Branch(branch) => {
                    let idx = branch.keys.partition_point(|&k| k <= key);
                    address = branch.children[idx];
                }
            }
        }
    }

    /// Returns `true` if `key` is present.
    pub fn has_key(&self, key: u64) -> io::Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Inserts or updates `key` to map to `value`.
    pub fn insert(&mut self, key: u64, value: u64) -> io::Result<()> {
        if self.root == NULL_ADDRESS {
            let address = self.cells.free_address()?;
            let leaf = node::Leaf {
                entries: vec![(key, value)],
                prev: NULL_ADDRESS,
                next: NULL_ADDRESS,
            };
            self.write_node(address, &Node::Leaf(leaf))?;
            self.root = address;
            self.count = 1;
            return self.persist_header();
        }

        let was_present = self.has_key(key)?;

        if let Some((sep, right_addr)) = self.insert_rec(self.root, key, value)? {
            let new_root_addr = self.cells.free_address()?;
            let new_root = node::Branch {
                keys: vec![sep],
                children: vec![self.root, right_addr],
            };
            self.write_node(new_root_addr, &Node::Branch(new_root))?;
            self.root = new_root_addr;
        }

        if !was_present {
            self.count += 1;
        }

        self.persist_header()
    }

    /// Inserts into the subtree rooted at `address`. On an overflowing
    /// split, returns the separator key and the address of the new right
    /// sibling for the caller to link into its parent.
    fn insert_rec(&mut self, address: u64, key: u64, value: u64) -> io::Result<Option<(u64, u64)>> {
        match self.read_node(address)? {
            Node::Leaf(mut leaf) => {
                match leaf.entries.binary_search_by_key(&key, |&(k, _)| k) {
                    Ok(idx) => {
                        leaf.entries[idx].1 = value;
                        self.write_node(address, &Node::Leaf(leaf))?;
                        Ok(None)
                    }
                    Err(idx) => {
                        leaf.entries.insert(idx, (key, value));

                        if leaf.entries.len() <= CAP {
                            self.write_node(address, &Node::Leaf(leaf))?;
                            return Ok(None);
                        }

                        let mid = leaf.entries.len().div_ceil(2);
                        let right_entries = leaf.entries.split_off(mid);
                        let separator = right_entries[0].0;

                        let right_addr = self.cells.free_address()?;
                        let old_next = leaf.next;

                        let right_leaf = node::Leaf {
                            entries: right_entries,
                            prev: address,
                            next: old_next,
                        };
                        self.write_node(right_addr, &Node::Leaf(right_leaf))?;

                        leaf.next = right_addr;
                        self.write_node(address, &Node::Leaf(leaf))?;

                        if old_next != NULL_ADDRESS {
                            if let Node::Leaf(mut next_leaf) = self.read_node(old_next)? {
                                next_leaf.prev = right_addr;
                                self.write_node(old_next, &Node::Leaf(next_leaf))?;
                            }
                        }

                        Ok(Some((separator, right_addr)))
                    }
                }
            }
            Node::Branch(mut branch) => {
                let idx = branch.keys.partition_point(|&k| k <= key);
                let child_addr = branch.children[idx];

                let Some((sep, new_child)) = self.insert_rec(child_addr, key, value)? else {
                    return Ok(None);
                };

                branch.keys.insert(idx, sep);
                branch.children.insert(idx + 1, new_child);

                if branch.keys.len() <= CAP {
                    self.write_node(address, &Node::Branch(branch))?;
                    return Ok(None);
                }

                let mid = branch.keys.len() / 2;
                let promoted = branch.keys[mid];

                let right_keys = branch.keys.split_off(mid + 1);
                branch.keys.pop(); // drop the promoted key from the left side
                let right_children = branch.children.split_off(mid + 1);

                let right_addr = self.cells.free_address()?;
                self.write_node(
                    right_addr,
                    &Node::Branch(node::Branch {
                        keys: right_keys,
                        children: right_children,
                    }),
                )?;
                self.write_node(address, &Node::Branch(branch))?;

                Ok(Some((promoted, right_addr)))
            }
        }
    }

    /// Removes `key`, returning `true` if it was present.
    pub fn remove(&mut self, key: u64) -> io::Result<bool> {
        if self.root == NULL_ADDRESS {
            return Ok(false);
        }

        let removed = self.remove_rec(self.root, key)?;
        if !removed {
            return Ok(false);
        }

        self.count -= 1;

        match self.read_node(self.root)? {
            Node::Branch(branch) if branch.keys.is_empty() => {
                let only_child = branch.children[0];
                self.cells.delete_blob(self.root)?;
                self.root = only_child;
            }
            Node::Leaf(leaf) if leaf.entries.is_empty() => {
                self.cells.delete_blob(self.root)?;
                self.root = NULL_ADDRESS;
            }
            _ => {}
        }

        self.persist_header()?;

        Ok(true)
    }

    fn remove_rec(&mut self, address: u64, key: u64) -> io::Result<bool> {
        match self.read_node(address)? {
            Node::Leaf(mut leaf) => {
                match leaf.entries.binary_search_by_key(&key, |&(k, _)| k) {
                    Ok(idx) => {
                        leaf.entries.remove(idx);
                        self.write_node(address, &Node::Leaf(leaf))?;
                        Ok(true)
                    }
                    Err(_) => Ok(false),
                }
            }
            Node::Branch(branch) => {
                let idx = branch.keys.partition_point(|&k| k <= key);
                let child_addr = branch.children[idx];

                if !self.remove_rec(child_addr, key)? {
                    return Ok(false);
                }

                self.fix_underflow(address, idx)?;

                Ok(true)
            }
        }
    }

    /// After recursing into `children[child_idx]`, checks whether that
    /// child now holds fewer than [`MIN`] entries and, if so, borrows from
    /// a sibling or merges with one.
    fn fix_underflow(&mut self, parent_addr: u64, child_idx: usize) -> io::Result<()> {
        let Node::Branch(mut parent) = self.read_node(parent_addr)? else {
            return Ok(());
        };

        let child_addr = parent.children[child_idx];
        let child_len = self.node_len(child_addr)?;

        if child_len >= MIN {
            return Ok(());
        }

        let has_left = child_idx > 0;
        let has_right = child_idx + 1 < parent.children.len();

        if has_left && self.node_len(parent.children[child_idx - 1])? > MIN {
            self.borrow_from_left(&mut parent, child_idx)?;
        } else if has_right && self.node_len(parent.children[child_idx + 1])? > MIN {
            self.borrow_from_right(&mut parent, child_idx)?;
        } else if has_left {
            self.merge_children(&mut parent, child_idx - 1)?;
        } else {
            self.merge_children(&mut parent, child_idx)?;
        }

        self.write_node(parent_addr, &Node::Branch(parent))?;

        Ok(())
    }

    fn node_len(&self, address: u64) -> io::Result<usize> {
        Ok(match self.read_node(address)? {
            Node::Leaf(leaf) => leaf.entries.len(),
            Node::Branch(branch) => branch.keys.len(),
        })
    }

    fn borrow_from_left(&mut self, parent: &mut node::Branch, child_idx: usize) -> io::Result<()> {
        let left_addr = parent.children[child_idx - 1];
        let child_addr = parent.children[child_idx];

        match (self.read_node(left_addr)?, self.read_node(child_addr)?) {
            (Node::Leaf(mut left), Node::Leaf(mut child)) => {
                let moved = left.entries.pop().expect("left has more than MIN entries");
                child.entries.insert(0, moved);
                parent.keys[child_idx - 1] = child.entries[0].0;
                self.write_node(left_addr, &Node::Leaf(left))?;
                self.write_node(child_addr, &Node::Leaf(child))?;
            }
            (Node::Branch(mut left), Node::Branch(mut child)) => {
                let moved_child = left.children.pop().expect("left has a spare child");
                let moved_key = left.keys.pop().expect("left has more than MIN keys");
                child.children.insert(0, moved_child);
                child.keys.insert(0, parent.keys[child_idx - 1]);
                parent.keys[child_idx - 1] = moved_key;
                self.write_node(left_addr, &Node::Branch(left))?;
                self.write_node(child_addr, &Node::Branch(child))?;
            }
            _ => unreachable!("siblings must be the same node kind"),
        }

        Ok(())
    }

    fn borrow_from_right(&mut self, parent: &mut node::Branch, child_idx: usize) -> io::Result<()> {
        let right_addr = parent.children[child_idx + 1];
        let child_addr = parent.children[child_idx];

        match (self.read_node(child_addr)?, self.read_node(right_addr)?) {
            (Node::Leaf(mut child), Node::Leaf(mut right)) => {
                let moved = right.entries.remove(0);
                child.entries.push(moved);
                parent.keys[child_idx] = right.entries[0].0;
                self.write_node(child_addr, &Node::Leaf(child))?;
                self.write_node(right_addr, &Node::Leaf(right))?;
            }
            (Node::Branch(mut child), Node::Branch(mut right)) => {
                let moved_child = right.children.remove(0);
                let moved_key = right.keys.remove(0);
                child.children.push(moved_child);
                child.keys.push(parent.keys[child_idx]);
                parent.keys[child_idx] = moved_key;
                self.write_node(child_addr, &Node::Branch(child))?;
                self.write_node(right_addr, &Node::Branch(right))?;
            }
            _ => unreachable!("siblings must be the same node kind"),
        }

        Ok(())
    }

    /// Merges `parent.children[left_idx + 1]` into `parent.children[left_idx]`,
    /// removing the separator key at `left_idx` from `parent`.
    fn merge_children(&mut self, parent: &mut node::Branch, left_idx: usize) -> io::Result<()> {
        let left_addr = parent.children[left_idx];
        let right_addr = parent.children[left_idx + 1];
        let separator = parent.keys.remove(left_idx);
        parent.children.remove(left_idx + 1);

        match (self.read_node(left_addr)?, self.read_node(right_addr)?) {
            (Node::Leaf(mut left), Node::Leaf(right)) => {
                left.entries.extend(right.entries);
                left.next = right.next;
                self.write_node(left_addr, &Node::Leaf(left))?;

                if right.next != NULL_ADDRESS {
                    if let Node::Leaf(mut after) = self.read_node(right.next)? {
                        after.prev = left_addr;
                        self.write_node(right.next, &Node::Leaf(after))?;
                    }
                }
            }
            (Node::Branch(mut left), Node::Branch(right)) => {
                left.keys.push(separator);
                left.keys.extend(right.keys);
                left.children.extend(right.children);
                self.write_node(left_addr, &Node::Branch(left))?;
            }
            _ => unreachable!("siblings must be the same node kind"),
        }

        self.cells.delete_blob(right_addr)?;

        Ok(())
    }

    /// Empties the tree entirely.
    pub fn clear(&mut self) -> io::Result<()> {
        self.cells.clear()?;
        self.root = NULL_ADDRESS;
        self.count = 0;
        self.persist_header()
    }

    fn leftmost_leaf(&self) -> io::Result<Option<u64>> {
        if self.root == NULL_ADDRESS {
            return Ok(None);
        }

        let mut address = self.root;
        loop {
            match self.read_node(address)? {
                Node::Leaf(_) => return Ok(Some(address)),
                Node::Branch(branch) => address = branch.children[0],
            }
        }
    }

    fn rightmost_leaf(&self) -> io::Result<Option<u64>> {
        if self.root == NULL_ADDRESS {
            return Ok(None);
        }

        let mut address = self.root;
        loop {
            match self.read_node(address)? {
                Node::Leaf(_) => return Ok(Some(address)),
                Node::Branch(branch) => {
                    address = *branch.children.last().expect("branch always has a child");
                }
            }
        }
    }

    /// Visits every `(key, value)` pair in ascending key order.
    pub fn each(&self, mut f: impl FnMut(u64, u64)) -> io::Result<()> {
        let Some(mut address) = self.leftmost_leaf()? else {
            return Ok(());
        };

        loop {
            let Node::Leaf(leaf) = self.read_node(address)? else {
                unreachable!("leaf chain must only contain leaves");
            };
            for &(k, v) in &leaf.entries {
                f(k, v);
            }
            if leaf.next == NULL_ADDRESS {
                break;
            }
            address = leaf.next;
        }

        Ok(())
    }

    /// Visits every `(key, value)` pair in descending key order.
    pub fn reverse_each(&self, mut f: impl FnMut(u64, u64)) -> io::Result<()> {
        let Some(mut address) = self.rightmost_leaf()? else {
            return Ok(());
        };

        loop {
            let Node::Leaf(leaf) = self.read_node(address)? else {
                unreachable!("leaf chain must only contain leaves");
            };
            for &(k, v) in leaf.entries.iter().rev() {
                f(k, v);
            }
            if leaf.prev == NULL_ADDRESS {
                break;
            }
            address = leaf.prev;
        }

        Ok(())
    }

    /// Removes every key for which `predicate` returns `true`.
    pub fn delete_if(&mut self, mut predicate: impl FnMut(u64, u64) -> bool) -> io::Result<usize> {
        let mut to_delete = Vec::new();
        self.each(|k, v| {
            if predicate(k, v) {
                to_delete.push(k);
            }
        })?;

        for key in &to_delete {
            self.remove(*key)?;
        }

        Ok(to_delete.len())
    }

    /// Verifies key ordering, node occupancy bounds, leaf linkage, and the
    /// cached entry count. Returns `true` iff every invariant holds.
    pub fn check(&self) -> io::Result<bool> {
        if !self.cells.check()? {
            return Ok(false);
        }

        if self.root == NULL_ADDRESS {
            return Ok(self.count == 0);
        }

        let mut total = 0u64;
        let mut last_key: Option<u64> = None;
        let mut ok = true;

        self.each(|k, _| {
            if let Some(last) = last_key {
                if k <= last {
                    ok = false;
                }
            }
            last_key = Some(k);
            total += 1;
        })?;

        if total != self.count {
            log::warn!("btree check: cached count {} != observed {total}", self.count);
            return Ok(false);
        }

        Ok(ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn insert_get_roundtrip() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut tree = BTree::create_new(dir.path().join("t.blobs"))?;

        for i in 0..200u64 {
            tree.insert(i, i * 10)?;
        }

        assert_eq!(tree.len(), 200);
        for i in 0..200u64 {
            assert_eq!(tree.get(i)?, Some(i * 10));
        }
        assert_eq!(tree.get(999)?, None);

        Ok(())
    }

    #[test]
    fn update_existing_key_does_not_grow_tree() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut tree = BTree::create_new(dir.path().join("t.blobs"))?;

        tree.insert(1, 10)?;
        tree.insert(1, 20)?;

        assert_eq!(tree.len(), 1);
        assert_eq!(tree.get(1)?, Some(20));

        Ok(())
    }

    #[test]
    fn each_visits_in_ascending_order() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut tree = BTree::create_new(dir.path().join("t.blobs"))?;

        let mut keys: Vec<u64> = (0..100).collect();
        // insert out of order
        keys.reverse();
        for &k in &keys {
            tree.insert(k, k)?;
        }

        let mut seen = Vec::new();
        tree.each(|k, _| seen.push(k))?;
        assert_eq!(seen, (0..100).collect::<Vec<_>>());

        let mut seen_rev = Vec::new();
        tree.reverse_each(|k, _| seen_rev.push(k))?;
        assert_eq!(seen_rev, (0..100).rev().collect::<Vec<_>>());

        Ok(())
    }

    #[test]
    fn remove_shrinks_tree_and_preserves_order() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut tree = BTree::create_new(dir.path().join("t.blobs"))?;

        for i in 0..343u64 {
            tree.insert(i, i)?;
        }

        for i in (0..343u64).step_by(2) {
            assert!(tree.remove(i)?);
        }

        assert_eq!(tree.len(), 343 / 2);
        assert!(tree.check()?);

        for i in (1..343u64).step_by(2) {
            assert_eq!(tree.get(i)?, Some(i));
        }
        for i in (0..343u64).step_by(2) {
            assert_eq!(tree.get(i)?, None);
        }

        Ok(())
    }

    #[test]
    fn removing_everything_empties_the_tree() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut tree = BTree::create_new(dir.path().join("t.blobs"))?;

        for i in 0..50u64 {
            tree.insert(i, i)?;
        }
        for i in 0..50u64 {
            assert!(tree.remove(i)?);
        }

        assert_eq!(tree.len(), 0);
        assert!(tree.is_empty());
        assert!(tree.check()?);

        Ok(())
    }

    #[test]
    fn delete_if_removes_matching_entries() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut tree = BTree::create_new(dir.path().join("t.blobs"))?;

        for i in 0..60u64 {
            tree.insert(i, i)?;
        }

        let removed = tree.delete_if(|k, _| k % 3 == 0)?;
        assert_eq!(removed, 20);
        assert_eq!(tree.len(), 40);

        tree.each(|k, _| assert_ne!(k % 3, 0))?;

        Ok(())
    }

    #[test]
    fn persists_across_reopen() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("t.blobs");

        {
            let mut tree = BTree::create_new(&path)?;
            for i in 0..30u64 {
                tree.insert(i, i + 1)?;
            }
        }

        let tree = BTree::open(&path)?;
        assert_eq!(tree.len(), 30);
        assert_eq!(tree.get(15)?, Some(16));

        Ok(())
    }

    #[test]
    fn random_insert_remove_matches_btreemap_reference() -> io::Result<()> {
        use rand::{rngs::StdRng, Rng, SeedableRng};
        use std::collections::BTreeMap;

        let dir = tempfile::tempdir()?;
        let mut tree = BTree::create_new(dir.path().join("t.blobs"))?;
        let mut reference: BTreeMap<u64, u64> = BTreeMap::new();
        let mut rng = StdRng::seed_from_u64(0xB7EE_1234);

        for _ in 0..4000 {
            let key: u64 = rng.random_range(0..500);
            if rng.random_bool(0.7) {
                let value = rng.random();
                tree.insert(key, value)?;
                reference.insert(key, value);
            } else {
                let removed = tree.remove(key)?;
                assert_eq!(removed, reference.remove(&key).is_some());
            }

            assert_eq!(tree.get(key)?, reference.get(&key).copied());
        }

        assert_eq!(tree.len(), reference.len() as u64);
        assert!(tree.check()?);

        let mut seen = Vec::new();
        tree.each(|k, v| seen.push((k, v)))?;
        let expected: Vec<(u64, u64)> = reference.into_iter().collect();
        assert_eq!(seen, expected);

        Ok(())
    }
}
