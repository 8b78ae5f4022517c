// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! L3: the `Store` façade (§4.8) — owns every component, holds the
//! directory lock, and exposes the public API.
//!
//! Read path: a cache hit returns directly; a miss falls through to the
//! index and flat file, and the result is cached. Write path: a mutation
//! is buffered dirty in the cache and only reaches the flat file (and the
//! index) when the cache evicts it, [`Store::sync`] runs, or a
//! transaction commits. A [`TransactionLog`] frame records enough undo
//! information to roll a write back if the enclosing transaction aborts.

use crate::{
    cache::{Cache, Flush, ReferenceExtractor},
    classmap::{ClassMap, CLASS_MAP_OID},
    config::{Config, ProgressMeter},
    file::{
        decode_version_block, encode_version_block, rewrite_atomic, CURRENT_VERSION,
        DATABASE_FILE, INDEX_CELLS_FILE, NEXT_OID_FILE, SPACES_CELLS_FILE, VERSION_FILE,
    },
    flat_file::FlatFile,
    fs::StdFileSystem,
    gc::{self, GcStats},
    index::IndexTree,
    lock::DirectoryLock,
    path::absolute_path,
    roots::Roots,
    stats::Statistics,
    tlog::{TransactionLog, UndoSink},
    Error, Result,
};
use byteorder::{ByteOrder, LittleEndian};
use rustc_hash::FxHashSet;
use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
};

/// First object id available for application use. 0 is reserved for "nil",
/// 1 for [`CLASS_MAP_OID`].
const FIRST_USER_OID: u64 = 2;

/// A cached, reference-counted view of one object's bytes, returned by
/// [`Store::object_by_id`], [`Store::new_object`] and [`Store::get`].
#[derive(Debug, Clone)]
pub struct Handle {
    oid: u64,
    bytes: Arc<[u8]>,
}

impl Handle {
    /// This object's id.
    #[must_use]
    pub fn oid(&self) -> u64 {
        self.oid
    }

    /// This object's current bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// The outcome of [`Store::check`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckReport {
    /// Whether the flat file (and its space manager) passed structural
    /// validation.
    pub flat_file_consistent: bool,

    /// Whether the index tree passed its own structural validation.
    pub index_tree_consistent: bool,

    /// Number of index/flat-file divergences found (dangling entries in
    /// either direction).
    pub divergent_entries: u64,

    /// Number of divergences actually fixed (only nonzero if `repair` was
    /// requested).
    pub repaired: u64,
}

impl CheckReport {
    /// Whether the store was found fully consistent.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.flat_file_consistent && self.index_tree_consistent && self.divergent_entries == 0
    }
}

/// Applies transaction abort/replay-on-recovery undo records directly
/// against the flat file, index and cache, bypassing the transaction log
/// and cache-dirty bookkeeping entirely (an undo write must never itself
/// become undoable).
struct UndoApply<'a> {
    flat_file: &'a mut FlatFile,
    index: &'a mut IndexTree,
    cache: &'a mut Cache,
}

impl UndoSink for UndoApply<'_> {
    fn restore(&mut self, oid: u64, bytes: &[u8]) -> Result<()> {
        self.flat_file.store_obj(oid, bytes)?;
        let address = self
            .flat_file
            .find_obj_addr_by_id(oid)
            .expect("object was just stored");
        self.index.set(oid, address)?;
        self.cache.invalidate(oid);
        Ok(())
    }

    fn forget(&mut self, oid: u64) -> Result<()> {
        self.cache.invalidate(oid);
        if self.flat_file.find_obj_addr_by_id(oid).is_some() {
            self.flat_file.delete_obj(oid)?;
            self.index.remove(oid)?;
        }
        Ok(())
    }
}

struct FlushToFlatFile<'a> {
    flat_file: &'a mut FlatFile,
    index: &'a mut IndexTree,
}

impl Flush for FlushToFlatFile<'_> {
    fn flush(&mut self, oid: u64, bytes: &[u8]) -> Result<()> {
        self.flat_file.store_obj(oid, bytes)?;
        let address = self
            .flat_file
            .find_obj_addr_by_id(oid)
            .expect("object was just stored");
        self.index.set(oid, address)
    }
}

/// A never-exercised [`UndoSink`] used only while bootstrapping a brand
/// new store directory, whose transaction log is empty by construction
/// (nothing has been written yet, so [`TransactionLog::open`] never needs
/// to replay anything against it).
struct NullSink;

impl UndoSink for NullSink {
    fn restore(&mut self, oid: u64, _bytes: &[u8]) -> Result<()> {
        unreachable!("a brand-new store's transaction log cannot hold undo records (oid {oid})")
    }

    fn forget(&mut self, oid: u64) -> Result<()> {
        unreachable!("a brand-new store's transaction log cannot hold undo records (oid {oid})")
    }
}

/// An embedded, single-process persistent object store.
///
/// A `Store` owns one directory on disk and a single-writer lock on it for
/// as long as it is alive; see [`Config::open`] / [`Config::create_new`].
pub struct Store {
    _lock: DirectoryLock,
    path: PathBuf,

    flat_file: FlatFile,
    index: IndexTree,
    cache: Cache,
    roots: Roots,
    class_map: ClassMap,
    tlog: TransactionLog,

    next_oid: u64,
    reference_extractor: Option<ReferenceExtractor>,
    progress_meter: Option<ProgressMeter>,
    serializer: Option<String>,
    last_gc: GcStats,

    /// Set once a fatal (structural) error has surfaced; every mutating
    /// call fails fast afterwards instead of risking further corruption
    /// (§7, §10.2).
    degraded: bool,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .field("live_object_count", &self.flat_file.len())
            .field("next_oid", &self.next_oid)
            .field("degraded", &self.degraded)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Creates a brand-new store directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created, already
    /// contains a store, or the directory lock cannot be acquired.
    pub fn create_new(config: Config) -> Result<Self> {
        let dir = config.path.clone();
        std::fs::create_dir_all(&dir)?;

        if dir.join(VERSION_FILE).exists() {
            return Err(Error::Corruption(
                "store directory already contains a store".into(),
            ));
        }

        let lock = DirectoryLock::acquire(
            &dir,
            config.lock_max_retries,
            config.lock_pause,
            config.lock_timeout,
        )?;

        rewrite_atomic::<StdFileSystem>(
            &dir.join(VERSION_FILE),
            &encode_version_block(CURRENT_VERSION, config.serializer.as_deref()),
        )?;

        let mut flat_file =
            FlatFile::create_new(dir.join(DATABASE_FILE), dir.join(SPACES_CELLS_FILE))?;
        let mut index = IndexTree::create_new(dir.join(INDEX_CELLS_FILE))?;
        let roots = Roots::create_new(&dir)?;
        let cache = Cache::with_cache_bits(config.cache_bits);

        let class_map = ClassMap::new();
        flat_file.store_obj(CLASS_MAP_OID, &class_map.encode())?;
        let address = flat_file
            .find_obj_addr_by_id(CLASS_MAP_OID)
            .expect("object was just stored");
        index.set(CLASS_MAP_OID, address)?;

        persist_next_oid(&dir, FIRST_USER_OID)?;

        let mut sink = NullSink;
        let tlog = TransactionLog::open(&dir, &mut sink)?;

        log::info!("created new store at {}", dir.display());

        Ok(Self {
            _lock: lock,
            path: dir,
            flat_file,
            index,
            cache,
            roots,
            class_map,
            tlog,
            next_oid: FIRST_USER_OID,
            reference_extractor: None,
            progress_meter: config.progress_meter,
            serializer: config.serializer,
            last_gc: GcStats::default(),
            degraded: false,
        })
    }

    /// Opens an existing store directory, replaying its transaction log
    /// if it holds undo records from an unfinished transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory does not contain a store, its
    /// on-disk format is newer than this build supports, or the directory
    /// lock cannot be acquired.
    pub fn open(config: Config) -> Result<Self> {
        let dir = config.path.clone();

        let version_bytes = std::fs::read(dir.join(VERSION_FILE)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::Corruption("store directory does not contain a store".into())
            } else {
                Error::Io(e)
            }
        })?;
        let (version, serializer) = decode_version_block(&version_bytes)
            .map_err(|e| Error::Corruption(e.to_string()))?;
        if version > CURRENT_VERSION {
            return Err(Error::InvalidVersion(version));
        }

        let lock = DirectoryLock::acquire(
            &dir,
            config.lock_max_retries,
            config.lock_pause,
            config.lock_timeout,
        )?;

        let mut flat_file = FlatFile::open(dir.join(DATABASE_FILE), dir.join(SPACES_CELLS_FILE))?;
        let mut index = IndexTree::open(dir.join(INDEX_CELLS_FILE))?;
        let roots = Roots::open(&dir)?;
        let mut cache = Cache::with_cache_bits(config.cache_bits);

        let mut sink = UndoApply {
            flat_file: &mut flat_file,
            index: &mut index,
            cache: &mut cache,
        };
        let tlog = TransactionLog::open(&dir, &mut sink)?;

        let class_map = ClassMap::decode(&flat_file.read_obj_by_id(CLASS_MAP_OID)?)?;
        let next_oid = read_next_oid(&dir)?;

        log::info!("opened store at {} ({} live objects)", dir.display(), flat_file.len());

        Ok(Self {
            _lock: lock,
            path: dir,
            flat_file,
            index,
            cache,
            roots,
            class_map,
            tlog,
            next_oid,
            reference_extractor: None,
            progress_meter: config.progress_meter,
            serializer,
            last_gc: GcStats::default(),
            degraded: false,
        })
    }

    /// Returns the opaque serializer tag registered via
    /// [`Config::serializer`] when this store was created, if any. The
    /// core never interprets this value; it is persisted purely so a
    /// wrapper layer can recover which value encoding it used.
    #[must_use]
    pub fn serializer_tag(&self) -> Option<&str> {
        self.serializer.as_deref()
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.degraded {
            return Err(Error::Corruption(
                "store is degraded after a prior fatal error and is read-only".into(),
            ));
        }
        Ok(())
    }

    fn note_fatal<T>(&mut self, result: &Result<T>) {
        if let Err(e) = result {
            if matches!(e, Error::Corruption(_) | Error::ChecksumMismatch { .. } | Error::Io(_)) {
                log::error!("store entering degraded read-only mode after fatal error: {e}");
                self.degraded = true;
            }
        }
    }

    fn report_progress(&self, phase: &str, done: u64, total: u64) {
        if let Some(meter) = &self.progress_meter {
            meter(phase, done, total);
        }
    }

    fn flush_to_flat_file(&mut self, oid: u64, bytes: Arc<[u8]>) -> Result<()> {
        let mut flush = FlushToFlatFile {
            flat_file: &mut self.flat_file,
            index: &mut self.index,
        };
        self.cache.put_dirty(oid, bytes, &mut flush)
    }

    /// Reads `oid`'s current bytes, preferring the cache, without caching
    /// a clean copy. Returns `None` if `oid` is unknown.
    fn read_raw(&mut self, oid: u64) -> Result<Option<Vec<u8>>> {
        if let Some(bytes) = self.cache.get(oid) {
            return Ok(Some(bytes.to_vec()));
        }
        if self.flat_file.find_obj_addr_by_id(oid).is_none() {
            return Ok(None);
        }
        Ok(Some(self.flat_file.read_obj_by_id(oid)?))
    }

    /// Captures `oid`'s pre-write state in the currently open transaction
    /// frame, if any. No-op outside a transaction.
    fn capture_prior(&mut self, oid: u64) -> Result<()> {
        match self.read_raw(oid)? {
            Some(bytes) => self.tlog.capture_restore(oid, &bytes),
            None => self.tlog.capture_new(oid),
        }
    }

    fn persist_next_oid(&self) -> Result<()> {
        persist_next_oid(&self.path, self.next_oid)
    }

    /// Allocates a fresh object id and stores `bytes` as its payload,
    /// returning a [`Handle`] to it. The write is buffered dirty until the
    /// cache evicts it, [`Self::sync`] runs, or the enclosing transaction
    /// commits.
    pub fn new_object(&mut self, bytes: &[u8]) -> Result<Handle> {
        self.ensure_writable()?;

        let oid = self.next_oid;
        self.next_oid += 1;
        self.persist_next_oid()?;
        self.tlog.capture_new(oid)?;

        let arc: Arc<[u8]> = Arc::from(bytes);
        let result = self.flush_to_flat_file(oid, Arc::clone(&arc));
        self.note_fatal(&result);
        result?;

        Ok(Handle { oid, bytes: arc })
    }

    /// Looks up `oid`, returning its current bytes wrapped in a
    /// [`Handle`], or `None` if `oid` is nil or unknown.
    pub fn object_by_id(&mut self, oid: u64) -> Result<Option<Handle>> {
        if oid == 0 {
            return Ok(None);
        }

        match self.read_raw(oid)? {
            None => Ok(None),
            Some(bytes) => {
                let arc: Arc<[u8]> = Arc::from(bytes);
                self.cache.put_clean(oid, Arc::clone(&arc));
                Ok(Some(Handle { oid, bytes: arc }))
            }
        }
    }

    /// Overwrites `oid`'s bytes. `oid` must already exist (from
    /// [`Self::new_object`] or an earlier `put`).
    pub fn put(&mut self, oid: u64, bytes: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        self.capture_prior(oid)?;

        let result = self.flush_to_flat_file(oid, Arc::from(bytes));
        self.note_fatal(&result);
        result
    }

    /// Looks up the object bound to a named root.
    ///
    /// # Errors
    ///
    /// Propagates any error reading the object's bytes back from storage.
    pub fn get(&mut self, root: &str) -> Result<Option<Handle>> {
        match self.roots.get(root) {
            Some(oid) => self.object_by_id(oid),
            None => Ok(None),
        }
    }

    /// Binds a named root to an object. Roots are the entry points a
    /// [`Self::gc`] pass treats as reachable by definition.
    pub fn set(&mut self, root: &str, handle: &Handle) -> Result<()> {
        self.ensure_writable()?;
        self.roots.set(root, handle.oid())?;
        Ok(())
    }

    /// Removes a named root, returning `true` if it existed. The object it
    /// pointed to is not deleted immediately; it is reclaimed by the next
    /// [`Self::gc`] pass if nothing else references it.
    pub fn remove_root(&mut self, root: &str) -> Result<bool> {
        self.ensure_writable()?;
        Ok(self.roots.remove(root)?)
    }

    /// Registers the callback used to discover the object ids a blob's
    /// payload references, used by [`Self::gc`] to walk the reference
    /// graph and by the cache for cooperative bookkeeping (§4.5, §4.7).
    pub fn set_reference_extractor(&mut self, extractor: ReferenceExtractor) {
        self.cache.set_reference_extractor(Arc::clone(&extractor));
        self.reference_extractor = Some(extractor);
    }

    /// Runs `body` as one atomic, possibly-nested transaction: if `body`
    /// returns `Err`, every write performed inside it (and any nested
    /// transaction it committed) is rolled back before the error is
    /// returned to the caller unchanged.
    ///
    /// # Errors
    ///
    /// Returns whatever error `body` returned, after undo replay. May also
    /// return an I/O error if the on-disk undo log could not be updated.
    pub fn transaction<T>(&mut self, body: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.tlog.begin();

        match body(self) {
            Ok(value) => {
                self.tlog.commit()?;
                Ok(value)
            }
            Err(e) => {
                let mut sink = UndoApply {
                    flat_file: &mut self.flat_file,
                    index: &mut self.index,
                    cache: &mut self.cache,
                };
                self.tlog.abort(&mut sink)?;
                Err(e)
            }
        }
    }

    /// Flushes every dirty cache entry to the flat file and index, then
    /// fsyncs the flat file, space manager and index. The only point at
    /// which durability is guaranteed (§5).
    ///
    /// # Errors
    ///
    /// Returns an error if a flush write or an fsync fails.
    pub fn sync(&mut self) -> Result<()> {
        let mut flush = FlushToFlatFile {
            flat_file: &mut self.flat_file,
            index: &mut self.index,
        };
        let result = self.cache.flush_all(&mut flush);
        self.note_fatal(&result);
        result?;

        self.flat_file.sync()?;
        self.index.sync()?;
        Ok(())
    }

    /// Flushes and syncs, then releases the directory lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the final sync fails.
    pub fn close(mut self) -> Result<()> {
        self.sync()
    }

    /// Drops the store without flushing or syncing, simulating a process
    /// being killed mid-operation. Any buffered writes not yet reflected
    /// on disk are lost; a transaction in progress is left for the next
    /// [`Config::open`] to roll back via the on-disk undo log (§5).
    pub fn exit(self) {
        log::warn!("store exiting without flushing dirty cache entries");
    }

    /// Runs one mark-and-sweep collection pass: flushes dirty state,
    /// marks every object reachable from the named roots and the class
    /// map, then deletes every unmarked live object from the flat file and
    /// index. If `defragmentize` is set, also compacts the flat file
    /// afterwards and rebuilds the index from the compacted layout.
    ///
    /// # Errors
    ///
    /// Returns an error if a reachable object's blob is missing or fails
    /// its checksum, or if the sweep or defragmentize step fails.
    pub fn gc(&mut self, defragmentize: bool) -> Result<GcStats> {
        self.ensure_writable()?;
        self.sync()?;

        let mut roots: Vec<u64> = Vec::new();
        self.roots.each(|_, oid| roots.push(oid));
        roots.push(CLASS_MAP_OID);

        let no_references: ReferenceExtractor = Arc::new(|_: &[u8]| Vec::new());
        let extractor = self.reference_extractor.clone().unwrap_or(no_references);

        let stats = gc::collect(&mut self.flat_file, &mut self.index, roots, &extractor)?;
        self.last_gc = stats;
        self.report_progress("gc", stats.marked_objects, stats.marked_objects);

        if defragmentize {
            self.flat_file.defragmentize()?;
            let oids: Vec<u64> = self.flat_file.oids().collect();
            self.index.clear()?;
            let total = oids.len() as u64;
            for (done, oid) in oids.into_iter().enumerate() {
                let address = self
                    .flat_file
                    .find_obj_addr_by_id(oid)
                    .expect("oid came from a just-collected flat file snapshot");
                self.index.set(oid, address)?;
                self.report_progress("defragmentize", done as u64 + 1, total);
            }
        }

        log::info!(
            "gc: marked {}, swept {}{}",
            stats.marked_objects,
            stats.swept_objects,
            if defragmentize { ", defragmented" } else { "" }
        );

        Ok(stats)
    }

    /// Cross-validates the flat file and the index tree, optionally
    /// repairing divergences by trusting the flat file as ground truth
    /// (per §7: a dangling index entry is fatal but repairable).
    ///
    /// # Errors
    ///
    /// Returns an error if a structural check itself cannot complete (an
    /// I/O failure reading a cell), as opposed to finding one.
    pub fn check(&mut self, repair: bool) -> Result<CheckReport> {
        let flat_file_consistent = self.flat_file.check()?;
        let index_tree_consistent = self.index.check()?;

        let mut indexed = Vec::new();
        self.index.each(|oid, address| indexed.push((oid, address)))?;
        let indexed_oids: FxHashSet<u64> = indexed.iter().map(|&(oid, _)| oid).collect();

        let mut divergent_entries = 0u64;
        let mut repaired = 0u64;

        for (oid, address) in indexed {
            let actual = self.flat_file.find_obj_addr_by_id(oid);
            if actual != Some(address) {
                divergent_entries += 1;
                log::warn!("check: index entry for oid {oid} diverges from flat file");
                if repair {
                    match actual {
                        Some(real_address) => self.index.set(oid, real_address)?,
                        None => {
                            self.index.remove(oid)?;
                        }
                    }
                    repaired += 1;
                }
            }
        }

        for oid in self.flat_file.oids().collect::<Vec<_>>() {
            if !indexed_oids.contains(&oid) {
                divergent_entries += 1;
                log::warn!("check: oid {oid} is live in the flat file but missing from the index");
                if repair {
                    let address = self
                        .flat_file
                        .find_obj_addr_by_id(oid)
                        .expect("oid came from a live flat file scan");
                    self.index.set(oid, address)?;
                    repaired += 1;
                }
            }
        }

        Ok(CheckReport {
            flat_file_consistent,
            index_tree_consistent,
            divergent_entries,
            repaired,
        })
    }

    /// Returns a point-in-time snapshot of store-wide counters.
    ///
    /// # Errors
    ///
    /// Returns an error if the flat file's or space manager's on-disk
    /// size cannot be read.
    pub fn statistics(&self) -> Result<Statistics> {
        Ok(Statistics {
            live_object_count: self.flat_file.len() as u64,
            free_region_count: self.flat_file.free_region_count(),
            free_bytes: self.flat_file.free_bytes()?,
            flat_file_bytes: self.flat_file.file_size()?,
            cache_read_pool_len: self.cache.read_pool_len(),
            cache_write_pool_len: self.cache.write_pool_len(),
            class_count: self.class_map.len(),
            root_count: self.roots.len(),
            last_gc_reclaimed: self.last_gc.swept_objects,
            transaction_log_bytes: self.tlog.on_disk_len(),
        })
    }

    /// Returns the id for `name`, registering it in the class map if not
    /// already present.
    ///
    /// # Errors
    ///
    /// Returns an error if the updated class map cannot be persisted.
    pub fn class_id_for(&mut self, name: &str) -> Result<u32> {
        self.ensure_writable()?;
        let id = self.class_map.class_id_for(name);
        self.persist_class_map()?;
        Ok(id)
    }

    /// Returns the class name registered for `id`, if any.
    #[must_use]
    pub fn class_name_for(&self, id: u32) -> Option<String> {
        self.class_map.class_name_for(id).map(String::from)
    }

    /// Renames classes in the class map according to `renames` (old name
    /// -> new name), preserving every id.
    ///
    /// # Errors
    ///
    /// Returns an error if the updated class map cannot be persisted.
    pub fn rename_classes(&mut self, renames: &HashMap<String, String>) -> Result<()> {
        self.ensure_writable()?;
        self.class_map.rename_classes(renames);
        self.persist_class_map()
    }

    /// Tombstones every registered class not in `allowed`, typically
    /// called after [`Self::gc`] with the set of class names a wrapper
    /// layer found still referenced by surviving objects (the core has no
    /// way to derive class names from opaque bytes on its own). Returns
    /// the number of classes dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the updated class map cannot be persisted.
    pub fn keep_classes(&mut self, allowed: &HashSet<String>) -> Result<usize> {
        self.ensure_writable()?;
        let dropped = self.class_map.keep(allowed);
        self.persist_class_map()?;
        Ok(dropped)
    }

    fn persist_class_map(&mut self) -> Result<()> {
        let bytes = self.class_map.encode();
        self.put(CLASS_MAP_OID, &bytes)
    }

    /// Creates a defragmented copy of this store at `target_dir`: flushes
    /// the cache, then streams every live object into a freshly created
    /// flat file and index, rebuilding the roots alongside them.
    ///
    /// # Errors
    ///
    /// Returns an error if `target_dir` cannot be created, already
    /// contains a store, or any copy step fails.
    pub fn copy<P: AsRef<Path>>(&mut self, target_dir: P) -> Result<()> {
        self.ensure_writable()?;
        self.sync()?;

        let target = absolute_path(target_dir);
        std::fs::create_dir_all(&target)?;
        if target.join(VERSION_FILE).exists() {
            return Err(Error::Corruption(
                "copy target directory already contains a store".into(),
            ));
        }

        rewrite_atomic::<StdFileSystem>(
            &target.join(VERSION_FILE),
            &encode_version_block(CURRENT_VERSION, self.serializer.as_deref()),
        )?;

        let mut new_flat_file =
            FlatFile::create_new(target.join(DATABASE_FILE), target.join(SPACES_CELLS_FILE))?;
        let mut new_index = IndexTree::create_new(target.join(INDEX_CELLS_FILE))?;

        let oids: Vec<u64> = self.flat_file.oids().collect();
        let total = oids.len() as u64;

        for (done, oid) in oids.into_iter().enumerate() {
            let bytes = self.flat_file.read_obj_by_id(oid)?;
            new_flat_file.store_obj(oid, &bytes)?;
            let address = new_flat_file
                .find_obj_addr_by_id(oid)
                .expect("object was just stored");
            new_index.set(oid, address)?;
            self.report_progress("copy", done as u64 + 1, total);
        }

        let mut new_roots = Roots::create_new(&target)?;
        let mut copy_err = None;
        self.roots.each(|name, oid| {
            if copy_err.is_none() {
                if let Err(e) = new_roots.set(name, oid) {
                    copy_err = Some(e);
                }
            }
        });
        if let Some(e) = copy_err {
            return Err(e);
        }

        persist_next_oid(&target, self.next_oid)?;

        new_flat_file.sync()?;
        new_index.sync()?;

        Ok(())
    }

    /// Releases the directory lock and deletes the entire store directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be removed.
    pub fn delete_store(self) -> Result<()> {
        let dir = self.path.clone();
        drop(self);
        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }
}

fn persist_next_oid(dir: &Path, next_oid: u64) -> Result<()> {
    rewrite_atomic::<StdFileSystem>(&dir.join(NEXT_OID_FILE), &next_oid.to_le_bytes())?;
    Ok(())
}

fn read_next_oid(dir: &Path) -> Result<u64> {
    let bytes = std::fs::read(dir.join(NEXT_OID_FILE))?;
    if bytes.len() < 8 {
        return Err(Error::Corruption("next_oid file is truncated".into()));
    }
    Ok(LittleEndian::read_u64(&bytes[0..8]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn config(dir: &Path) -> Config {
        Config::new(dir).cache_bits(4)
    }

    #[test]
    fn create_new_then_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let mut store = Store::create_new(config(dir.path()))?;
            let handle = store.new_object(b"hello")?;
            store.set("main", &handle)?;
            store.close()?;
        }

        let mut store = Store::open(config(dir.path()))?;
        let handle = store.get("main")?.expect("root should survive reopen");
        assert_eq!(handle.bytes(), b"hello");

        Ok(())
    }

    #[test]
    fn serializer_tag_survives_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let mut store =
                Store::create_new(config(dir.path()).serializer("msgpack"))?;
            assert_eq!(store.serializer_tag(), Some("msgpack"));
            store.close()?;
        }

        let store = Store::open(config(dir.path()))?;
        assert_eq!(store.serializer_tag(), Some("msgpack"));

        Ok(())
    }

    #[test]
    fn put_overwrites_bytes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut store = Store::create_new(config(dir.path()))?;

        let handle = store.new_object(b"v1")?;
        store.put(handle.oid(), b"v2")?;

        let reread = store.object_by_id(handle.oid())?.expect("object exists");
        assert_eq!(reread.bytes(), b"v2");

        Ok(())
    }

    #[test]
    fn aborted_transaction_rolls_back_writes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut store = Store::create_new(config(dir.path()))?;

        let handle = store.new_object(b"original")?;
        store.set("main", &handle)?;
        let oid = handle.oid();

        let result: Result<()> = store.transaction(|tx| {
            tx.put(oid, b"changed")?;
            Err(Error::Corruption("boom".into()))
        });
        assert!(result.is_err());

        let handle = store.get("main")?.expect("root still present");
        assert_eq!(handle.bytes(), b"original");

        Ok(())
    }

    #[test]
    fn committed_transaction_keeps_writes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut store = Store::create_new(config(dir.path()))?;

        let oid = store.transaction(|tx| {
            let handle = tx.new_object(b"a")?;
            tx.put(handle.oid(), b"b")?;
            Ok(handle.oid())
        })?;

        let handle = store.object_by_id(oid)?.expect("object committed");
        assert_eq!(handle.bytes(), b"b");

        Ok(())
    }

    #[test]
    fn gc_sweeps_unrooted_objects() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut store = Store::create_new(config(dir.path()))?;

        let kept = store.new_object(b"kept")?;
        store.set("main", &kept)?;
        let orphan = store.new_object(b"orphan")?;
        let orphan_oid = orphan.oid();

        let stats = store.gc(false)?;
        assert_eq!(stats.swept_objects, 1);
        assert!(store.object_by_id(orphan_oid)?.is_none());
        assert!(store.object_by_id(kept.oid())?.is_some());

        Ok(())
    }

    #[test]
    fn check_repairs_dangling_index_entry() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut store = Store::create_new(config(dir.path()))?;
        let handle = store.new_object(b"data")?;
        store.sync()?;

        store.index.remove(handle.oid())?;

        let report = store.check(false)?;
        assert!(!report.is_ok());
        assert_eq!(report.divergent_entries, 1);

        let report = store.check(true)?;
        assert_eq!(report.repaired, 1);

        let report = store.check(false)?;
        assert!(report.is_ok());

        Ok(())
    }

    #[test]
    fn class_map_round_trips_and_renames() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut store = Store::create_new(config(dir.path()))?;

        let id = store.class_id_for("Person")?;
        assert_eq!(store.class_name_for(id), Some("Person".to_string()));

        let mut renames = HashMap::new();
        renames.insert("Person".to_string(), "Contact".to_string());
        store.rename_classes(&renames)?;
        assert_eq!(store.class_name_for(id), Some("Contact".to_string()));

        Ok(())
    }

    #[test]
    fn copy_produces_independent_store() -> Result<()> {
        let src_dir = tempfile::tempdir()?;
        let dst_dir = tempfile::tempdir()?;

        let mut store = Store::create_new(config(src_dir.path()))?;
        let handle = store.new_object(b"payload")?;
        store.set("main", &handle)?;

        let dst_path = dst_dir.path().join("copy");
        store.copy(&dst_path)?;

        let mut copied = Store::open(Config::new(&dst_path).cache_bits(4))?;
        let handle = copied.get("main")?.expect("root copied");
        assert_eq!(handle.bytes(), b"payload");

        Ok(())
    }

    #[test]
    fn delete_store_removes_directory() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("store");
        let store = Store::create_new(config(&path))?;
        store.delete_store()?;
        assert!(!path.exists());
        Ok(())
    }
}
