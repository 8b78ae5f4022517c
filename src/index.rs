// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The persistent `oid -> flat file address` index (§4.4), a thin,
//! crash-safe counterpart to [`crate::flat_file::FlatFile`]'s in-memory
//! hash index.

use crate::btree::BTree;
use std::{io, path::Path};

/// Maps object ids to their physical address in the flat file.
#[derive(Debug)]
pub struct IndexTree {
    tree: BTree,
}

impl IndexTree {
    /// Creates a brand-new, empty index.
    pub fn create_new<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Ok(Self {
            tree: BTree::create_new(path)?,
        })
    }

    /// Reopens an index from its backing file.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Ok(Self {
            tree: BTree::open(path)?,
        })
    }

    /// Looks up `oid`'s physical address.
    pub fn get(&self, oid: u64) -> io::Result<Option<u64>> {
        self.tree.get(oid)
    }

    /// Records or updates `oid`'s physical address.
    pub fn set(&mut self, oid: u64, address: u64) -> io::Result<()> {
        self.tree.insert(oid, address)
    }

    /// Removes `oid` from the index, returning `true` if it was present.
    pub fn remove(&mut self, oid: u64) -> io::Result<bool> {
        self.tree.remove(oid)
    }

    /// Returns `true` if `oid` is indexed.
    pub fn has_key(&self, oid: u64) -> io::Result<bool> {
        self.tree.has_key(oid)
    }

    /// Number of indexed object ids.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.tree.len()
    }

    /// Returns `true` if the index holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Visits every `(oid, address)` pair in ascending oid order.
    pub fn each(&self, f: impl FnMut(u64, u64)) -> io::Result<()> {
        self.tree.each(f)
    }

    /// Empties the index.
    pub fn clear(&mut self) -> io::Result<()> {
        self.tree.clear()
    }

    /// Verifies the backing tree's structural invariants.
    pub fn check(&self) -> io::Result<bool> {
        self.tree.check()
    }

    /// Flushes the backing file to disk.
    pub fn sync(&self) -> io::Result<()> {
        self.tree.sync()
    }
}
