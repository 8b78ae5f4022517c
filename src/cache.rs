// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! L2: the bounded, two-pool object cache sitting in front of
//! [`crate::flat_file::FlatFile`] (§4.5).
//!
//! A read pool holds clean copies of recently retrieved blobs and can drop
//! entries silently; a write pool holds blobs modified by the current (or
//! a just-committed) transaction and must flush an entry to disk before it
//! can be evicted, since it is the only copy of that write. Entries pinned
//! for an in-flight transaction are never evicted from the write pool.

use quick_cache::unsync::Cache as QuickCache;
use rustc_hash::{FxHashMap, FxHashSet};
use std::{collections::VecDeque, sync::Arc};

/// A function that durably persists a dirty blob, called before it is
/// dropped from the write pool.
pub trait Flush {
    /// Persists `oid`'s current bytes.
    fn flush(&mut self, oid: u64, bytes: &[u8]) -> crate::Result<()>;
}

impl<F> Flush for F
where
    F: FnMut(u64, &[u8]) -> crate::Result<()>,
{
    fn flush(&mut self, oid: u64, bytes: &[u8]) -> crate::Result<()> {
        self(oid, bytes)
    }
}

/// Extracts the object ids a blob's payload references, so a cached entry
/// can cooperate with [`crate::gc::GarbageCollector`] and leak detection
/// without either party re-parsing the blob format from scratch.
pub type ReferenceExtractor = Arc<dyn Fn(&[u8]) -> Vec<u64> + Send + Sync>;

struct DirtyPool {
    capacity: usize,
    entries: FxHashMap<u64, Arc<[u8]>>,
    /// Approximate recency order, oldest first. May contain stale ids for
    /// entries touched again since being pushed; `touch` just re-pushes,
    /// and eviction skips ids no longer present.
    order: VecDeque<u64>,
    pinned: FxHashSet<u64>,
}

impl DirtyPool {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: FxHashMap::default(),
            order: VecDeque::new(),
            pinned: FxHashSet::default(),
        }
    }

    fn touch(&mut self, oid: u64) {
        self.order.push_back(oid);
    }
}

/// The bounded cache sitting between a [`crate::store::Store`] and its
/// flat file.
pub struct Cache {
    read_pool: QuickCache<u64, Arc<[u8]>>,
    write_pool: DirtyPool,
    reference_extractor: Option<ReferenceExtractor>,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("read_pool_len", &self.read_pool.len())
            .field("write_pool_len", &self.write_pool.entries.len())
            .finish_non_exhaustive()
    }
}

impl Cache {
    /// Creates a cache whose read and write pools each hold up to
    /// `2.pow(cache_bits)` entries.
    #[must_use]
    pub fn with_cache_bits(cache_bits: u8) -> Self {
        let capacity = 1usize << cache_bits;
        Self {
            read_pool: QuickCache::new(capacity),
            write_pool: DirtyPool::new(capacity),
            reference_extractor: None,
        }
    }

    /// Registers the callback used to extract cross-object references from
    /// a cached blob (§4.5, §4.7).
    pub fn set_reference_extractor(&mut self, extractor: ReferenceExtractor) {
        self.reference_extractor = Some(extractor);
    }

    /// Extracts the object ids `bytes` references, if an extractor is
    /// registered.
    #[must_use]
    pub fn extract_references(&self, bytes: &[u8]) -> Vec<u64> {
        self.reference_extractor
            .as_ref()
            .map_or_else(Vec::new, |f| f(bytes))
    }

    /// Returns `oid`'s cached bytes, preferring the write pool (which may
    /// hold a newer, not-yet-flushed version) over the read pool.
    #[must_use]
    pub fn get(&mut self, oid: u64) -> Option<Arc<[u8]>> {
        if let Some(bytes) = self.write_pool.entries.get(&oid) {
            return Some(Arc::clone(bytes));
        }
        self.read_pool.get(&oid).cloned()
    }

    /// Inserts a clean (already-durable) copy of `oid` into the read pool.
    pub fn put_clean(&mut self, oid: u64, bytes: Arc<[u8]>) {
        self.read_pool.insert(oid, bytes);
    }

    /// Inserts a dirty copy of `oid`, flushing the least-recently-touched
    /// unpinned entry first if the write pool is at capacity.
    pub fn put_dirty(&mut self, oid: u64, bytes: Arc<[u8]>, flush: &mut dyn Flush) -> crate::Result<()> {
        let is_new = !self.write_pool.entries.contains_key(&oid);
        self.write_pool.entries.insert(oid, bytes);
        self.write_pool.touch(oid);

        if is_new && self.write_pool.entries.len() > self.write_pool.capacity {
            self.evict_one_dirty(flush)?;
        }

        Ok(())
    }

    fn evict_one_dirty(&mut self, flush: &mut dyn Flush) -> crate::Result<()> {
        while let Some(candidate) = self.write_pool.order.pop_front() {
            if self.write_pool.pinned.contains(&candidate) {
                continue;
            }

            let Some(bytes) = self.write_pool.entries.remove(&candidate) else {
                // stale recency entry for an id already evicted/removed
                continue;
            };

            flush.flush(candidate, &bytes)?;
            // the bytes just flushed are now durable; promote them into the
            // read pool instead of leaving whatever stale clean copy (or
            // nothing) was there, so a later `get` never returns pre-write
            // bytes once the write pool entry is gone.
            self.read_pool.insert(candidate, bytes);
            return Ok(());
        }

        Ok(())
    }

    /// Flushes and drops every dirty entry, durably persisting the write
    /// pool's contents. Used by [`crate::store::Store::sync`].
    pub fn flush_all(&mut self, flush: &mut dyn Flush) -> crate::Result<()> {
        let oids: Vec<u64> = self.write_pool.entries.keys().copied().collect();
        for oid in oids {
            if let Some(bytes) = self.write_pool.entries.remove(&oid) {
                flush.flush(oid, &bytes)?;
                self.read_pool.insert(oid, bytes);
            }
        }
        self.write_pool.order.clear();
        Ok(())
    }

    /// Pins `oid` in the write pool so it cannot be evicted, e.g. while an
    /// open transaction still holds an undo record referencing it.
    pub fn pin(&mut self, oid: u64) {
        self.write_pool.pinned.insert(oid);
    }

    /// Releases a previous [`Self::pin`].
    pub fn unpin(&mut self, oid: u64) {
        self.write_pool.pinned.remove(&oid);
    }

    /// Drops `oid` from both pools without flushing, e.g. after the object
    /// has been deleted.
    pub fn invalidate(&mut self, oid: u64) {
        self.read_pool.remove(&oid);
        self.write_pool.entries.remove(&oid);
        self.write_pool.pinned.remove(&oid);
    }

    /// Number of entries currently held in the read pool.
    #[must_use]
    pub fn read_pool_len(&self) -> usize {
        self.read_pool.len()
    }

    /// Number of entries currently held in the write (dirty) pool.
    #[must_use]
    pub fn write_pool_len(&self) -> usize {
        self.write_pool.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use test_log::test;

    #[test]
    fn read_pool_roundtrip() {
        let mut cache = Cache::with_cache_bits(4);
        cache.put_clean(1, Arc::from(vec![1, 2, 3]));
        assert_eq!(cache.get(1).as_deref(), Some([1, 2, 3].as_slice()));
    }

    #[test]
    fn dirty_pool_evicts_with_flush() -> crate::Result<()> {
        let mut cache = Cache::with_cache_bits(1); // capacity 2
        let flushed = Arc::new(Mutex::new(Vec::new()));

        let flushed_clone = Arc::clone(&flushed);
        let mut flush = move |oid: u64, bytes: &[u8]| -> crate::Result<()> {
            flushed_clone.lock().unwrap().push((oid, bytes.to_vec()));
            Ok(())
        };

        cache.put_dirty(1, Arc::from(vec![1]), &mut flush)?;
        cache.put_dirty(2, Arc::from(vec![2]), &mut flush)?;
        cache.put_dirty(3, Arc::from(vec![3]), &mut flush)?;

        assert_eq!(flushed.lock().unwrap().as_slice(), &[(1, vec![1])]);
        assert_eq!(cache.write_pool_len(), 2);

        Ok(())
    }

    #[test]
    fn pinned_entries_are_not_evicted() -> crate::Result<()> {
        let mut cache = Cache::with_cache_bits(1); // capacity 2
        let mut flush = |_: u64, _: &[u8]| -> crate::Result<()> { Ok(()) };

        cache.pin(1);
        cache.put_dirty(1, Arc::from(vec![1]), &mut flush)?;
        cache.put_dirty(2, Arc::from(vec![2]), &mut flush)?;
        cache.put_dirty(3, Arc::from(vec![3]), &mut flush)?;

        assert!(cache.get(1).is_some(), "pinned entry must survive eviction pressure");

        Ok(())
    }

    #[test]
    fn invalidate_drops_from_both_pools() {
        let mut cache = Cache::with_cache_bits(4);
        cache.put_clean(1, Arc::from(vec![1]));
        cache.invalidate(1);
        assert!(cache.get(1).is_none());
    }

    #[test]
    fn flush_all_does_not_resurrect_stale_read_pool_copy() -> crate::Result<()> {
        let mut cache = Cache::with_cache_bits(4);
        let mut flush = |_: u64, _: &[u8]| -> crate::Result<()> { Ok(()) };

        cache.put_clean(1, Arc::from(vec![1]));
        cache.put_dirty(1, Arc::from(vec![2]), &mut flush)?;
        cache.flush_all(&mut flush)?;

        assert_eq!(cache.get(1).as_deref(), Some([2].as_slice()));

        Ok(())
    }

    #[test]
    fn evict_one_dirty_does_not_resurrect_stale_read_pool_copy() -> crate::Result<()> {
        let mut cache = Cache::with_cache_bits(1); // capacity 2
        let mut flush = |_: u64, _: &[u8]| -> crate::Result<()> { Ok(()) };

        cache.put_clean(1, Arc::from(vec![1]));
        cache.put_dirty(1, Arc::from(vec![2]), &mut flush)?;
        // force eviction pressure so oid 1's dirty copy gets flushed out
        cache.put_dirty(2, Arc::from(vec![20]), &mut flush)?;
        cache.put_dirty(3, Arc::from(vec![30]), &mut flush)?;

        assert_eq!(cache.get(1).as_deref(), Some([2].as_slice()));

        Ok(())
    }
}
