// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! L3: mark-and-sweep collection over the on-disk id graph (§4.7).
//!
//! The collector never reference-counts; cycles are handled entirely by
//! the mark phase's visited set (a blob already marked is never
//! re-traversed), so back-references carry no special semantics and
//! fully-unreachable cycles are swept just like any other garbage.

use crate::{cache::ReferenceExtractor, flat_file::FlatFile, index::IndexTree, Result};

/// Deterministic counters from one collection pass (§4.7: "must produce
/// deterministic `marked_objects` and `swept_objects` counters for
/// tests").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Objects visited and marked reachable during the mark phase.
    pub marked_objects: u64,
    /// Live objects deleted during the sweep phase because they were left
    /// unmarked.
    pub swept_objects: u64,
}

/// Runs one mark-and-sweep pass: clears every mark, walks the reference
/// graph from `roots` via `extractor`, then deletes every live object that
/// remains unmarked, removing it from `index` too.
///
/// # Errors
///
/// Returns an error if a root or a reachable oid's blob is missing or
/// fails its checksum (a dangling reference is a structural corruption,
/// not a normal miss, since every reference the extractor yields is
/// expected to name a live object).
pub fn collect(
    flat_file: &mut FlatFile,
    index: &mut IndexTree,
    roots: impl IntoIterator<Item = u64>,
    extractor: &ReferenceExtractor,
) -> Result<GcStats> {
    flat_file.clear_all_marks();

    let mut stack: Vec<u64> = roots.into_iter().filter(|&oid| oid != 0).collect();
    let mut marked_objects = 0u64;

    while let Some(oid) = stack.pop() {
        if flat_file.is_marked(oid) {
            continue;
        }

        flat_file.mark_obj_by_id(oid);
        marked_objects += 1;

        let bytes = flat_file.read_obj_by_id(oid)?;
        for referenced in extractor(&bytes) {
            if referenced != 0 && !flat_file.is_marked(referenced) {
                stack.push(referenced);
            }
        }
    }

    let swept = flat_file.delete_unmarked_objects()?;
    for &oid in &swept {
        index.remove(oid)?;
    }

    log::info!(
        "gc: marked {marked_objects} reachable objects, swept {} unreachable",
        swept.len()
    );

    Ok(GcStats {
        marked_objects,
        swept_objects: swept.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use test_log::test;

    fn flat_file(dir: &std::path::Path) -> FlatFile {
        FlatFile::create_new(dir.join("database.blobs"), dir.join("spaces.blobs")).unwrap()
    }

    fn index(dir: &std::path::Path) -> IndexTree {
        IndexTree::create_new(dir.join("index.blobs")).unwrap()
    }

    /// Payload format for these tests: a little-endian `u64` naming the
    /// one object this blob references (0 = none).
    fn extractor() -> ReferenceExtractor {
        Arc::new(|bytes: &[u8]| {
            if bytes.len() < 8 {
                return vec![];
            }
            let referenced = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
            if referenced == 0 {
                vec![]
            } else {
                vec![referenced]
            }
        })
    }

    fn store(ff: &mut FlatFile, idx: &mut IndexTree, oid: u64, references: u64) {
        ff.store_obj(oid, &references.to_le_bytes()).unwrap();
        idx.set(oid, ff.find_obj_addr_by_id(oid).unwrap()).unwrap();
    }

    #[test]
    fn sweeps_unreachable_cycle() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut ff = flat_file(dir.path());
        let mut idx = index(dir.path());
        let ex = extractor();

        // A -> B, B -> C, C -> B (cycle dangling off B/C)
        store(&mut ff, &mut idx, 1, 2);
        store(&mut ff, &mut idx, 2, 3);
        store(&mut ff, &mut idx, 3, 2);

        // root = A: nothing should be swept yet
        let stats = collect(&mut ff, &mut idx, vec![1], &ex)?;
        assert_eq!(stats.marked_objects, 3);
        assert_eq!(stats.swept_objects, 0);

        // drop A's reference to B: now B and C are unreachable
        store(&mut ff, &mut idx, 1, 0);
        let stats = collect(&mut ff, &mut idx, vec![1], &ex)?;
        assert_eq!(stats.marked_objects, 1);
        assert_eq!(stats.swept_objects, 2);

        assert!(ff.find_obj_addr_by_id(2).is_none());
        assert!(ff.find_obj_addr_by_id(3).is_none());
        assert_eq!(idx.get(2)?, None);
        assert_eq!(idx.get(3)?, None);

        Ok(())
    }

    #[test]
    fn unrooted_objects_are_swept() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut ff = flat_file(dir.path());
        let mut idx = index(dir.path());
        let ex = extractor();

        store(&mut ff, &mut idx, 1, 0);
        store(&mut ff, &mut idx, 2, 0);

        let stats = collect(&mut ff, &mut idx, vec![1], &ex)?;
        assert_eq!(stats.marked_objects, 1);
        assert_eq!(stats.swept_objects, 1);
        assert!(ff.find_obj_addr_by_id(2).is_none());

        Ok(())
    }
}
