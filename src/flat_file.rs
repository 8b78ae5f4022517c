// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! L0: a variable-length blob heap keyed by object id (§4.2).
//!
//! Each stored blob occupies a physical *slot*: a small self-describing
//! header (mark bit, liveness, length, allocated size, oid, CRC32) followed
//! by the payload and, possibly, trailing slack reused by later in-place
//! updates. Free slots are tracked by a companion
//! [`crate::space_manager::SpaceManager`] so deleted or moved blobs can be
//! reused by later writes instead of growing the file forever.

use crate::{
    checksum,
    file::{read_at, write_at},
    space_manager::SpaceManager,
    Error, Result,
};
use byteorder::{ByteOrder, LittleEndian};
use rustc_hash::{FxHashMap, FxHashSet};
use std::{
    fs::{File, OpenOptions},
    path::Path,
};

const FILE_HEADER_LEN: u64 = 4;
const SLOT_HEADER_LEN: u64 = 1 + 1 + 1 + 4 + 4 + 8 + 4;
const FORMAT_VERSION: u32 = 1;

/// A slot is kept in place on update if the new payload still fits and
/// wastes at most this many bytes of trailing slack; past this it is
/// considered a "splinter" and the blob is relocated so slack does not
/// accumulate without bound. Chosen as a fixed, generous constant rather
/// than a configurable knob (see crate-level design notes).
const SPLINTER_THRESHOLD_BYTES: u32 = 64;

#[derive(Debug, Copy, Clone)]
struct SlotHeader {
    mark: bool,
    compressed: bool,
    live: bool,
    length: u32,
    allocated_size: u32,
    oid: u64,
    crc32: u32,
}

impl SlotHeader {
    fn to_bytes(self) -> [u8; SLOT_HEADER_LEN as usize] {
        let mut buf = [0u8; SLOT_HEADER_LEN as usize];
        buf[0] = u8::from(self.mark);
        buf[1] = u8::from(self.compressed);
        buf[2] = u8::from(self.live);
        LittleEndian::write_u32(&mut buf[3..7], self.length);
        LittleEndian::write_u32(&mut buf[7..11], self.allocated_size);
        LittleEndian::write_u64(&mut buf[11..19], self.oid);
        LittleEndian::write_u32(&mut buf[19..23], self.crc32);
        buf
    }

    fn from_bytes(buf: &[u8]) -> Self {
        Self {
            mark: buf[0] != 0,
            compressed: buf[1] != 0,
            live: buf[2] != 0,
            length: LittleEndian::read_u32(&buf[3..7]),
            allocated_size: LittleEndian::read_u32(&buf[7..11]),
            oid: LittleEndian::read_u64(&buf[11..19]),
            crc32: LittleEndian::read_u32(&buf[19..23]),
        }
    }

    fn slot_size(self) -> u64 {
        SLOT_HEADER_LEN + u64::from(self.allocated_size)
    }
}

/// The blob heap backing a store's object data (`database.blobs`).
#[derive(Debug)]
pub struct FlatFile {
    data: File,
    spaces: SpaceManager,
    index: FxHashMap<u64, u64>,
    marked: FxHashSet<u64>,
}

impl FlatFile {
    /// Creates a brand-new, empty flat file and its companion space index.
    pub fn create_new<P: AsRef<Path>>(data_path: P, spaces_path: P) -> Result<Self> {
        let data = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(data_path)?;

        let mut header = [0u8; FILE_HEADER_LEN as usize];
        LittleEndian::write_u32(&mut header, FORMAT_VERSION);
        write_at(&data, 0, &header)?;
        data.sync_all()?;

        let spaces = SpaceManager::create_new(spaces_path)?;

        Ok(Self {
            data,
            spaces,
            index: FxHashMap::default(),
            marked: FxHashSet::default(),
        })
    }

    /// Reopens a flat file, rebuilding the in-memory oid index by scanning
    /// every slot once.
    pub fn open<P: AsRef<Path>>(data_path: P, spaces_path: P) -> Result<Self> {
        let data = OpenOptions::new().read(true).write(true).open(data_path)?;

        let version = LittleEndian::read_u32(&read_at(&data, 0, FILE_HEADER_LEN as usize)?);
        if version > FORMAT_VERSION {
            return Err(Error::InvalidVersion(version));
        }

        let spaces = SpaceManager::open(spaces_path)?;

        let mut index = FxHashMap::default();
        let file_len = data.metadata()?.len();
        let mut offset = FILE_HEADER_LEN;

        while offset + SLOT_HEADER_LEN <= file_len {
            let header = SlotHeader::from_bytes(&read_at(&data, offset, SLOT_HEADER_LEN as usize)?);
            if header.live {
                index.insert(header.oid, offset);
            }
            offset += header.slot_size();
        }

        Ok(Self {
            data,
            spaces,
            index,
            marked: FxHashSet::default(),
        })
    }

    /// Number of live blobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Returns `true` if the flat file holds no live blobs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Returns the physical address (byte offset) of `oid`'s slot, if any.
    #[must_use]
    pub fn find_obj_addr_by_id(&self, oid: u64) -> Option<u64> {
        self.index.get(&oid).copied()
    }

    /// Iterates over every live object id.
    pub fn oids(&self) -> impl Iterator<Item = u64> + '_ {
        self.index.keys().copied()
    }

    /// Current on-disk size of the data file, in bytes.
    pub fn file_size(&self) -> Result<u64> {
        Ok(self.data.metadata()?.len())
    }

    /// Number of free regions tracked by the companion space manager.
    #[must_use]
    pub fn free_region_count(&self) -> u64 {
        self.spaces.len()
    }

    /// Total bytes spanned by free regions.
    pub fn free_bytes(&self) -> Result<u64> {
        Ok(self.spaces.total_bytes()?)
    }

    /// Flushes the data file and the space manager's backing file to disk.
    pub fn sync(&self) -> Result<()> {
        self.data.sync_all()?;
        self.spaces.sync()?;
        Ok(())
    }

    fn read_header(&self, address: u64) -> Result<SlotHeader> {
        Ok(SlotHeader::from_bytes(&read_at(
            &self.data,
            address,
            SLOT_HEADER_LEN as usize,
        )?))
    }

    fn write_header(&self, address: u64, header: SlotHeader) -> Result<()> {
        write_at(&self.data, address, &header.to_bytes())?;
        Ok(())
    }

    fn read_payload(&self, address: u64, length: u32) -> Result<Vec<u8>> {
        Ok(read_at(&self.data, address + SLOT_HEADER_LEN, length as usize)?)
    }

    fn write_payload(&self, address: u64, bytes: &[u8]) -> Result<()> {
        write_at(&self.data, address + SLOT_HEADER_LEN, bytes)?;
        Ok(())
    }

    /// Reads and CRC-verifies `oid`'s payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corruption`] if `oid` is unknown, or
    /// [`Error::ChecksumMismatch`] if the stored CRC32 does not match.
    pub fn read_obj_by_id(&self, oid: u64) -> Result<Vec<u8>> {
        let address = self
            .index
            .get(&oid)
            .copied()
            .ok_or_else(|| Error::Corruption(format!("no flat file entry for oid {oid}")))?;

        let header = self.read_header(address)?;
        let bytes = self.read_payload(address, header.length)?;
        checksum::check(checksum::crc32(&bytes), header.crc32)?;

        Ok(bytes)
    }

    /// Writes (inserting or updating) `oid`'s payload.
    pub fn store_obj(&mut self, oid: u64, bytes: &[u8]) -> Result<()> {
        let crc32 = checksum::crc32(bytes);
        let length = u32::try_from(bytes.len())
            .map_err(|_| Error::Corruption("blob exceeds maximum flat file slot size".into()))?;

        if let Some(&address) = self.index.get(&oid) {
            let existing = self.read_header(address)?;
            let slack = existing.allocated_size.saturating_sub(length);

            if length <= existing.allocated_size && slack <= SPLINTER_THRESHOLD_BYTES {
                self.write_payload(address, bytes)?;
                self.write_header(
                    address,
                    SlotHeader {
                        mark: existing.mark,
                        compressed: false,
                        live: true,
                        length,
                        allocated_size: existing.allocated_size,
                        oid,
                        crc32,
                    },
                )?;
                return Ok(());
            }

            // splinter: the old slot is either too small or would waste too
            // much slack. Free it and relocate.
            self.free_slot(address, existing)?;
        }

        let (address, allocated_size) = self.find_or_append_slot(length)?;
        self.write_header(
            address,
            SlotHeader {
                mark: false,
                compressed: false,
                live: true,
                length,
                allocated_size,
                oid,
                crc32,
            },
        )?;
        self.write_payload(address, bytes)?;
        self.index.insert(oid, address);

        Ok(())
    }

    /// Finds a hole big enough for `length` bytes of payload via
    /// [`SpaceManager`], or appends at the end of the file. Returns the
    /// slot's address and its full allocated payload capacity (which may
    /// exceed `length` when a larger hole was reused).
    fn find_or_append_slot(&mut self, length: u32) -> Result<(u64, u32)> {
        let needed = SLOT_HEADER_LEN + u64::from(length);

        if let Some((address, hole_size)) = self.spaces.get_space(needed)? {
            let allocated_size = u32::try_from(hole_size - SLOT_HEADER_LEN)
                .map_err(|_| Error::Corruption("free region too large".into()))?;
            Ok((address, allocated_size))
        } else {
            Ok((self.data.metadata()?.len(), length))
        }
    }

    fn free_slot(&mut self, address: u64, header: SlotHeader) -> Result<()> {
        self.write_header(
            address,
            SlotHeader {
                mark: false,
                compressed: false,
                live: false,
                length: 0,
                allocated_size: header.allocated_size,
                oid: 0,
                crc32: 0,
            },
        )?;
        self.spaces.add_space(address, header.slot_size())?;
        Ok(())
    }

    /// Deletes `oid`, freeing its slot for reuse.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corruption`] if `oid` is unknown.
    pub fn delete_obj(&mut self, oid: u64) -> Result<()> {
        let address = self
            .index
            .remove(&oid)
            .ok_or_else(|| Error::Corruption(format!("no flat file entry for oid {oid}")))?;
        let header = self.read_header(address)?;
        self.marked.remove(&oid);
        self.free_slot(address, header)
    }

    /// Marks `oid` reachable for the current garbage collection pass.
    pub fn mark_obj_by_id(&mut self, oid: u64) {
        self.marked.insert(oid);
    }

    /// Returns whether `oid` is currently marked.
    #[must_use]
    pub fn is_marked(&self, oid: u64) -> bool {
        self.marked.contains(&oid)
    }

    /// Clears every mark ahead of a fresh garbage collection pass.
    pub fn clear_all_marks(&mut self) {
        self.marked.clear();
    }

    /// Deletes every object that was not marked since the last
    /// [`Self::clear_all_marks`], returning the oids that were swept.
    pub fn delete_unmarked_objects(&mut self) -> Result<Vec<u64>> {
        let unmarked: Vec<u64> = self
            .index
            .keys()
            .copied()
            .filter(|oid| !self.marked.contains(oid))
            .collect();

        for oid in &unmarked {
            self.delete_obj(*oid)?;
        }

        Ok(unmarked)
    }

    /// Compacts the file: rewrites every live blob contiguously with no
    /// slack, in ascending oid order, reclaiming all free space. Address
    /// order is not used since in-place slot reuse can leave it unrelated
    /// to insertion or oid order.
    /// Returns the number of bytes reclaimed.
    pub fn defragmentize(&mut self) -> Result<u64> {
        let old_len = self.data.metadata()?.len();

        let mut entries: Vec<(u64, u64)> =
            self.index.iter().map(|(&oid, &addr)| (oid, addr)).collect();
        entries.sort_unstable();

        let mut write_offset = FILE_HEADER_LEN;
        let mut new_index = FxHashMap::default();

        for (oid, address) in entries {
            let header = self.read_header(address)?;
            let bytes = self.read_payload(address, header.length)?;

            if write_offset != address {
                let compact = SlotHeader {
                    mark: header.mark,
                    compressed: header.compressed,
                    live: true,
                    length: header.length,
                    allocated_size: header.length,
                    oid,
                    crc32: header.crc32,
                };
                self.write_header(write_offset, compact)?;
                self.write_payload(write_offset, &bytes)?;
            } else if header.allocated_size != header.length {
                let compact = SlotHeader {
                    allocated_size: header.length,
                    ..header
                };
                self.write_header(write_offset, compact)?;
            }

            new_index.insert(oid, write_offset);
            write_offset += SLOT_HEADER_LEN + u64::from(header.length);
        }

        self.data.set_len(write_offset)?;
        self.index = new_index;

        self.spaces.clear_all()?;

        Ok(old_len.saturating_sub(write_offset))
    }

    /// Walks every slot, verifying header CRCs and that the in-memory oid
    /// index matches the on-disk live set. Returns `true` iff consistent.
    pub fn check(&self) -> Result<bool> {
        if !self.spaces.check()? {
            return Ok(false);
        }

        let file_len = self.data.metadata()?.len();
        let mut offset = FILE_HEADER_LEN;
        let mut seen = FxHashMap::default();

        while offset + SLOT_HEADER_LEN <= file_len {
            let header = self.read_header(offset)?;

            if header.live {
                let bytes = self.read_payload(offset, header.length)?;
                if checksum::crc32(&bytes) != header.crc32 {
                    log::warn!("flat file check: checksum mismatch for oid {}", header.oid);
                    return Ok(false);
                }
                seen.insert(header.oid, offset);
            }

            offset += header.slot_size();
        }

        if offset != file_len {
            log::warn!("flat file check: trailing bytes past last slot");
            return Ok(false);
        }

        if seen != self.index {
            log::warn!("flat file check: in-memory index diverges from on-disk live set");
            return Ok(false);
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn open(dir: &std::path::Path) -> FlatFile {
        FlatFile::create_new(dir.join("database.blobs"), dir.join("spaces.blobs")).unwrap()
    }

    #[test]
    fn store_retrieve_delete_roundtrip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut ff = open(dir.path());

        ff.store_obj(1, b"hello")?;
        assert_eq!(ff.read_obj_by_id(1)?, b"hello");
        assert_eq!(ff.len(), 1);

        ff.delete_obj(1)?;
        assert!(ff.read_obj_by_id(1).is_err());
        assert!(ff.find_obj_addr_by_id(1).is_none());

        Ok(())
    }

    #[test]
    fn deleted_slot_is_reused_by_a_same_size_write() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut ff = open(dir.path());

        ff.store_obj(1, b"aaaaaaaaaa")?;
        let first_address = ff.find_obj_addr_by_id(1).expect("just stored");
        ff.delete_obj(1)?;

        ff.store_obj(2, b"bbbbbbbbbb")?;
        let second_address = ff.find_obj_addr_by_id(2).expect("just stored");

        assert_eq!(first_address, second_address, "hole should be reused, not appended past");

        Ok(())
    }

    #[test]
    fn shrinking_write_within_slack_keeps_the_slot_in_place() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut ff = open(dir.path());

        ff.store_obj(1, &vec![0u8; 100])?;
        let address = ff.find_obj_addr_by_id(1).expect("just stored");

        ff.store_obj(1, &vec![1u8; 90])?;
        assert_eq!(ff.find_obj_addr_by_id(1), Some(address), "small shrink should not splinter");
        assert_eq!(ff.read_obj_by_id(1)?, vec![1u8; 90]);

        Ok(())
    }

    #[test]
    fn shrinking_write_past_splinter_threshold_relocates() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut ff = open(dir.path());

        ff.store_obj(1, &vec![0u8; 200])?;
        let address = ff.find_obj_addr_by_id(1).expect("just stored");
        assert!(!ff.spaces.has_space(1)?);

        ff.store_obj(1, &vec![1u8; 10])?;
        assert_ne!(ff.find_obj_addr_by_id(1), Some(address), "large shrink should splinter and relocate");
        assert!(ff.spaces.has_space(1)?, "old slot should be freed");

        Ok(())
    }

    #[test]
    fn checksum_mismatch_is_detected_on_read() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut ff = open(dir.path());
        ff.store_obj(1, b"original")?;

        let address = ff.find_obj_addr_by_id(1).expect("just stored");
        ff.write_payload(address, b"corrupt!")?;

        let err = ff.read_obj_by_id(1).expect_err("checksum should not match");
        assert!(matches!(err, Error::ChecksumMismatch { .. }));

        Ok(())
    }

    #[test]
    fn defragmentize_compacts_and_preserves_live_data() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut ff = open(dir.path());

        for oid in 1..=5u64 {
            ff.store_obj(oid, format!("object-{oid}").as_bytes())?;
        }
        ff.delete_obj(2)?;
        ff.delete_obj(4)?;

        let reclaimed = ff.defragmentize()?;
        assert!(reclaimed > 0);

        assert_eq!(ff.len(), 3);
        assert_eq!(ff.read_obj_by_id(1)?, b"object-1");
        assert_eq!(ff.read_obj_by_id(3)?, b"object-3");
        assert_eq!(ff.read_obj_by_id(5)?, b"object-5");
        assert_eq!(ff.free_region_count(), 0);
        assert!(ff.check()?);

        Ok(())
    }

    #[test]
    fn check_passes_on_consistent_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut ff = open(dir.path());

        for oid in 1..=3u64 {
            ff.store_obj(oid, b"payload")?;
        }
        ff.delete_obj(2)?;

        assert!(ff.check()?);

        Ok(())
    }

    #[test]
    fn random_store_delete_matches_reference_model() -> Result<()> {
        use rand::{rngs::StdRng, Rng, SeedableRng};
        use std::collections::HashMap;

        let dir = tempfile::tempdir()?;
        let mut ff = open(dir.path());
        let mut reference: HashMap<u64, Vec<u8>> = HashMap::new();
        let mut rng = StdRng::seed_from_u64(0xF1A7_F11E);

        for oid in 1..=300u64 {
            if rng.random_bool(0.8) {
                let len = rng.random_range(0..200usize);
                let bytes: Vec<u8> = (0..len).map(|_| rng.random()).collect();
                ff.store_obj(oid, &bytes)?;
                reference.insert(oid, bytes);
            }
        }

        for _ in 0..600 {
            let oid = rng.random_range(1..=300u64);
            match rng.random_range(0..3) {
                0 => {
                    let len = rng.random_range(0..200);
                    let bytes: Vec<u8> = (0..len).map(|_| rng.random()).collect();
                    ff.store_obj(oid, &bytes)?;
                    reference.insert(oid, bytes);
                }
                1 => {
                    if reference.remove(&oid).is_some() {
                        ff.delete_obj(oid)?;
                    }
                }
                _ => {
                    let expected = reference.get(&oid);
                    let actual = ff.find_obj_addr_by_id(oid).is_some();
                    assert_eq!(actual, expected.is_some());
                    if let Some(expected_bytes) = expected {
                        assert_eq!(&ff.read_obj_by_id(oid)?, expected_bytes);
                    }
                }
            }
        }

        assert_eq!(ff.len(), reference.len());
        for (oid, bytes) in &reference {
            assert_eq!(&ff.read_obj_by_id(*oid)?, bytes);
        }
        assert!(ff.check()?);

        Ok(())
    }
}
