// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A snapshot of store-wide counters, returned by
//! [`crate::store::Store::statistics`] (§10).

/// A point-in-time snapshot of store-wide counters.
///
/// Cheap to compute: every field is either already tracked incrementally by
/// its owning component or derived from an O(1) structure (cell counts,
/// pool lengths), never from scanning the flat file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Statistics {
    /// Number of live (non-deleted) objects in the flat file.
    pub live_object_count: u64,

    /// Number of free regions tracked by the space manager.
    pub free_region_count: u64,

    /// Total bytes spanned by free regions, i.e. reclaimable by
    /// [`crate::flat_file::FlatFile::defragmentize`].
    pub free_bytes: u64,

    /// Current on-disk size of the flat file, in bytes.
    pub flat_file_bytes: u64,

    /// Number of entries currently held in the cache's read pool.
    pub cache_read_pool_len: usize,

    /// Number of entries currently held in the cache's write (dirty) pool.
    pub cache_write_pool_len: usize,

    /// Number of registered classes in the class map.
    pub class_count: usize,

    /// Number of named roots.
    pub root_count: usize,

    /// Objects reclaimed by the most recent garbage collection pass, or 0
    /// if none has run yet this session.
    pub last_gc_reclaimed: u64,

    /// Current size of the transaction log, in bytes.
    pub transaction_log_bytes: u64,
}
