// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! L0: an unbalanced binary search tree, keyed by free-region size, that
//! tracks the holes [`crate::flat_file::FlatFile`] can reuse (§4.3).
//!
//! Every tree node is one fixed-size cell in an [`EquiBlobsFile`], so the
//! tree itself gets crash-safety and slot reuse for free.

use crate::equi_blobs_file::{EquiBlobsFile, NULL_ADDRESS};
use byteorder::{ByteOrder, LittleEndian};
use std::{io, path::Path};

const NODE_ENTRY_SIZE: u32 = 32;
const ROOT_FIELD: &str = "root";

#[derive(Debug, Copy, Clone)]
struct Node {
    size: u64,
    region_address: u64,
    left: u64,
    right: u64,
}

impl Node {
    fn to_bytes(self) -> [u8; 32] {
        let mut buf = [0u8; 32];
        LittleEndian::write_u64(&mut buf[0..8], self.size);
        LittleEndian::write_u64(&mut buf[8..16], self.region_address);
        LittleEndian::write_u64(&mut buf[16..24], self.left);
        LittleEndian::write_u64(&mut buf[24..32], self.right);
        buf
    }

    fn from_bytes(buf: &[u8]) -> Self {
        Self {
            size: LittleEndian::read_u64(&buf[0..8]),
            region_address: LittleEndian::read_u64(&buf[8..16]),
            left: LittleEndian::read_u64(&buf[16..24]),
            right: LittleEndian::read_u64(&buf[24..32]),
        }
    }
}

/// A free-region index: maps region sizes to the address of a hole in the
/// companion data file.
#[derive(Debug)]
pub struct SpaceManager {
    cells: EquiBlobsFile,
    root: u64,
}

impl SpaceManager {
    /// Creates the backing [`EquiBlobsFile`] for a brand-new, empty tree.
    pub fn create_new<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let cells = EquiBlobsFile::create_new(path, NODE_ENTRY_SIZE, &[ROOT_FIELD])?;
        Ok(Self {
            cells,
            root: NULL_ADDRESS,
        })
    }

    /// Reopens a tree from its backing file.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let cells = EquiBlobsFile::open(path)?;
        let root = cells.custom_field(ROOT_FIELD).unwrap_or(NULL_ADDRESS);
        Ok(Self { cells, root })
    }

    fn read_node(&self, address: u64) -> io::Result<Node> {
        Ok(Node::from_bytes(&self.cells.retrieve_blob(address)?))
    }

    fn write_node(&mut self, address: u64, node: Node) -> io::Result<()> {
        self.cells.store_blob(address, &node.to_bytes())
    }

    fn persist_root(&mut self) -> io::Result<()> {
        self.cells.set_custom_field(ROOT_FIELD, self.root)
    }

    /// Returns `true` if a region of at least `min_size` bytes is indexed.
    pub fn has_space(&self, min_size: u64) -> io::Result<bool> {
        Ok(self.find_best_fit(min_size)?.is_some())
    }

    /// Registers a free region of `size` bytes located at `region_address`.
    pub fn add_space(&mut self, region_address: u64, size: u64) -> io::Result<()> {
        let new_address = self.cells.free_address()?;
        self.write_node(
            new_address,
            Node {
                size,
                region_address,
                left: NULL_ADDRESS,
                right: NULL_ADDRESS,
            },
        )?;

        if self.root == NULL_ADDRESS {
            self.root = new_address;
        } else {
            let mut cursor = self.root;
            loop {
                let mut node = self.read_node(cursor)?;
                if size < node.size {
                    if node.left == NULL_ADDRESS {
                        node.left = new_address;
                        self.write_node(cursor, node)?;
                        break;
                    }
                    cursor = node.left;
                } else {
                    if node.right == NULL_ADDRESS {
                        node.right = new_address;
                        self.write_node(cursor, node)?;
                        break;
                    }
                    cursor = node.right;
                }
            }
        }

        self.persist_root()
    }

    /// Walks the tree, returning the path from the root to the
    /// smallest-fitting node (best-fit-upward), alongside its index in
    /// that path.
    fn find_best_fit(&self, min_size: u64) -> io::Result<Option<(Vec<u64>, usize)>> {
        let mut path = Vec::new();
        let mut best_idx = None;
        let mut cursor = self.root;

        while cursor != NULL_ADDRESS {
            path.push(cursor);
            let node = self.read_node(cursor)?;
            if node.size >= min_size {
                best_idx = Some(path.len() - 1);
                if node.size == min_size {
                    break;
                }
                cursor = node.left;
            } else {
                cursor = node.right;
            }
        }

        Ok(best_idx.map(|idx| (path, idx)))
    }

    /// Finds and removes the smallest region of at least `min_size` bytes,
    /// returning its `(region_address, size)`.
    pub fn get_space(&mut self, min_size: u64) -> io::Result<Option<(u64, u64)>> {
        let Some((path, best_idx)) = self.find_best_fit(min_size)? else {
            return Ok(None);
        };

        let best_address = path[best_idx];
        let best_node = self.read_node(best_address)?;
        let parent_address = if best_idx == 0 { NULL_ADDRESS } else { path[best_idx - 1] };

        let new_subtree_root = self.remove_node(best_address)?;

        if parent_address == NULL_ADDRESS {
            self.root = new_subtree_root;
        } else {
            let mut parent = self.read_node(parent_address)?;
            if parent.left == best_address {
                parent.left = new_subtree_root;
            } else {
                parent.right = new_subtree_root;
            }
            self.write_node(parent_address, parent)?;
        }

        self.persist_root()?;

        Ok(Some((best_node.region_address, best_node.size)))
    }

    /// Removes the node at `address`, returning the address that should
    /// replace it in its parent's child pointer (or the tree's root).
    fn remove_node(&mut self, address: u64) -> io::Result<u64> {
        let node = self.read_node(address)?;

        match (node.left, node.right) {
            (NULL_ADDRESS, NULL_ADDRESS) => {
                self.cells.delete_blob(address)?;
                Ok(NULL_ADDRESS)
            }
            (NULL_ADDRESS, right) => {
                self.cells.delete_blob(address)?;
                Ok(right)
            }
            (left, NULL_ADDRESS) => {
                self.cells.delete_blob(address)?;
                Ok(left)
            }
            (left, right) => {
                let (successor, new_right) = self.remove_min(right)?;
                self.write_node(
                    address,
                    Node {
                        size: successor.size,
                        region_address: successor.region_address,
                        left,
                        right: new_right,
                    },
                )?;
                Ok(address)
            }
        }
    }

    /// Removes the leftmost (minimum) node under `address`, returning its
    /// data plus the address that should replace `address`.
    fn remove_min(&mut self, address: u64) -> io::Result<(Node, u64)> {
        let node = self.read_node(address)?;

        if node.left == NULL_ADDRESS {
            self.cells.delete_blob(address)?;
            Ok((node, node.right))
        } else {
            let (min_node, new_left) = self.remove_min(node.left)?;
            self.write_node(
                address,
                Node {
                    size: node.size,
                    region_address: node.region_address,
                    left: new_left,
                    right: node.right,
                },
            )?;
            Ok((min_node, address))
        }
    }

    /// Number of regions currently indexed.
    pub fn len(&self) -> u64 {
        self.cells.total_entries()
    }

    /// Returns `true` if no free regions are indexed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Verifies the backing [`EquiBlobsFile`]'s own invariants.
    pub fn check(&self) -> io::Result<bool> {
        self.cells.check()
    }

    /// Flushes the backing file to disk.
    pub fn sync(&self) -> io::Result<()> {
        self.cells.sync()
    }

    /// Sums the size of every indexed free region.
    pub fn total_bytes(&self) -> io::Result<u64> {
        let mut total = 0u64;
        let mut stack = if self.root == NULL_ADDRESS { vec![] } else { vec![self.root] };

        while let Some(address) = stack.pop() {
            let node = self.read_node(address)?;
            total += node.size;
            if node.left != NULL_ADDRESS {
                stack.push(node.left);
            }
            if node.right != NULL_ADDRESS {
                stack.push(node.right);
            }
        }

        Ok(total)
    }

    /// Drops every indexed region, emptying the tree. Used after
    /// [`crate::flat_file::FlatFile::defragmentize`] reclaims all holes at
    /// once.
    pub fn clear_all(&mut self) -> io::Result<()> {
        self.cells.clear()?;
        self.root = NULL_ADDRESS;
        self.persist_root()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn best_fit_picks_smallest_match() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut sm = SpaceManager::create_new(dir.path().join("spaces.blobs"))?;

        sm.add_space(100, 50)?;
        sm.add_space(200, 30)?;
        sm.add_space(300, 80)?;
        sm.add_space(400, 30)?;

        // smallest region that fits >= 30 is one of the two size-30 holes
        let (addr, size) = sm.get_space(30)?.expect("should find a fit");
        assert_eq!(size, 30);
        assert!(addr == 200 || addr == 400);

        // next best fit for >=40 is the 50-byte hole
        let (addr, size) = sm.get_space(40)?.expect("should find a fit");
        assert_eq!(size, 50);
        assert_eq!(addr, 100);

        Ok(())
    }

    #[test]
    fn get_space_returns_none_when_nothing_fits() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut sm = SpaceManager::create_new(dir.path().join("spaces.blobs"))?;
        sm.add_space(100, 10)?;

        assert!(sm.get_space(20)?.is_none());

        Ok(())
    }

    #[test]
    fn removed_regions_are_gone() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut sm = SpaceManager::create_new(dir.path().join("spaces.blobs"))?;

        for i in 0..20u64 {
            sm.add_space(i * 10, 20 + i)?;
        }
        assert_eq!(sm.len(), 20);

        while let Some(_) = sm.get_space(0)? {}
        assert!(sm.is_empty());
        assert!(sm.check()?);

        Ok(())
    }

    #[test]
    fn persists_across_reopen() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("spaces.blobs");

        {
            let mut sm = SpaceManager::create_new(&path)?;
            sm.add_space(42, 99)?;
        }

        let mut sm = SpaceManager::open(&path)?;
        let (addr, size) = sm.get_space(50)?.expect("should find a fit");
        assert_eq!((addr, size), (42, 99));

        Ok(())
    }
}
