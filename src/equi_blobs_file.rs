// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! L0: an addressable array of equal-size byte cells backed by a single
//! file, with O(1) allocation and deletion (§4.1).
//!
//! Used as the building block for the [`crate::btree::BTree`] (one node per
//! cell) and the [`crate::space_manager::SpaceManager`] (one free-region
//! record per cell).

use crate::file::{read_at, write_at};
use byteorder::{ByteOrder, LittleEndian};
use std::{
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
};

const STATE_FREE: u8 = 0;
const STATE_RESERVED: u8 = 1;
const STATE_LIVE: u8 = 2;

/// Fixed header size in bytes, see module docs for the on-disk layout.
const HEADER_LEN: u64 = 38;

/// Free cells store a doubly-linked free list in their payload so an
/// arbitrary cell can be unlinked in O(1) during trimming (§4.1).
const FREE_LIST_LINK_LEN: usize = 16;

/// Null address sentinel (§3: "address 0 is the null sentinel").
pub const NULL_ADDRESS: u64 = 0;

#[derive(Debug, Clone)]
struct CustomField {
    name: String,
    value: u64,
}

/// A fixed-size record container, see module docs.
#[derive(Debug)]
pub struct EquiBlobsFile {
    file: File,
    path: PathBuf,
    entry_size: u32,
    cell_size: u64,
    total_entries: u64,
    total_spaces: u64,
    first_free_address: u64,
    custom_fields: Vec<CustomField>,
    data_offset: u64,
}

/// The state of a cell, surfaced for `check()` and tests.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CellState {
    Free,
    Reserved,
    Live,
}

impl EquiBlobsFile {
    /// Creates a new, empty backing file with the given fixed entry size and
    /// custom header field names (registered up front, per §4.1).
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if `entry_size` is too small to hold the
    /// internal free-list links.
    pub fn create_new<P: AsRef<Path>>(
        path: P,
        entry_size: u32,
        custom_field_names: &[&str],
    ) -> io::Result<Self> {
        if (entry_size as usize) < FREE_LIST_LINK_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("entry_size must be at least {FREE_LIST_LINK_LEN} bytes"),
            ));
        }

        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        let custom_fields = custom_field_names
            .iter()
            .map(|name| CustomField {
                name: (*name).to_string(),
                value: 0,
            })
            .collect::<Vec<_>>();

        let mut this = Self {
            file,
            path,
            entry_size,
            cell_size: 1 + u64::from(entry_size),
            total_entries: 0,
            total_spaces: 0,
            first_free_address: NULL_ADDRESS,
            custom_fields,
            data_offset: 0,
        };
        this.data_offset = this.compute_data_offset();
        this.persist_header()?;

        Ok(this)
    }

    /// Opens an existing backing file, reading its header and custom
    /// fields back into memory.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        let header = read_at(&file, 0, HEADER_LEN as usize)?;
        let total_entries = LittleEndian::read_u64(&header[0..8]);
        let total_spaces = LittleEndian::read_u64(&header[8..16]);
        let first_free_address = LittleEndian::read_u64(&header[16..24]);
        let entry_size = LittleEndian::read_u32(&header[24..28]);
        let first_custom_entry_address = LittleEndian::read_u64(&header[28..36]);
        let custom_field_count = LittleEndian::read_u16(&header[36..38]);

        let mut custom_fields = Vec::with_capacity(custom_field_count as usize);
        let mut cursor = first_custom_entry_address;

        for _ in 0..custom_field_count {
            let name_len = LittleEndian::read_u16(&read_at(&file, cursor, 2)?) as u64;
            cursor += 2;
            let name_bytes = read_at(&file, cursor, name_len as usize)?;
            let name = String::from_utf8(name_bytes).map_err(|e| {
                io::Error::new(io::ErrorKind::InvalidData, e.to_string())
            })?;
            cursor += name_len;
            let value = LittleEndian::read_u64(&read_at(&file, cursor, 8)?);
            cursor += 8;

            custom_fields.push(CustomField { name, value });
        }

        Ok(Self {
            file,
            path,
            entry_size,
            cell_size: 1 + u64::from(entry_size),
            total_entries,
            total_spaces,
            first_free_address,
            custom_fields,
            data_offset: cursor,
        })
    }

    fn compute_data_offset(&self) -> u64 {
        let mut offset = HEADER_LEN;
        for field in &self.custom_fields {
            offset += 2 + field.name.len() as u64 + 8;
        }
        offset
    }

    /// Fixed payload size of every cell.
    #[must_use]
    pub fn entry_size(&self) -> u32 {
        self.entry_size
    }

    /// Number of cells currently reserved or live.
    #[must_use]
    pub fn total_entries(&self) -> u64 {
        self.total_entries
    }

    /// Number of cells currently free.
    #[must_use]
    pub fn total_spaces(&self) -> u64 {
        self.total_spaces
    }

    /// Total number of cells backing the file (live + reserved + free).
    pub fn cell_count(&self) -> io::Result<u64> {
        let len = self.file.metadata()?.len();
        if len <= self.data_offset {
            return Ok(0);
        }
        Ok((len - self.data_offset) / self.cell_size)
    }

    /// Reads a registered custom header field by name.
    #[must_use]
    pub fn custom_field(&self, name: &str) -> Option<u64> {
        self.custom_fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.value)
    }

    /// Writes a registered custom header field by name and persists the
    /// header immediately.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if `name` was not registered at creation.
    pub fn set_custom_field(&mut self, name: &str, value: u64) -> io::Result<()> {
        let field = self
            .custom_fields
            .iter_mut()
            .find(|f| f.name == name)
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, format!("unknown custom field {name}"))
            })?;
        field.value = value;
        self.persist_header()
    }

    fn cell_offset(&self, address: u64) -> u64 {
        self.data_offset + (address - 1) * self.cell_size
    }

    fn read_state(&self, address: u64) -> io::Result<u8> {
        let offset = self.cell_offset(address);
        Ok(read_at(&self.file, offset, 1)?[0])
    }

    fn write_state(&self, address: u64, state: u8) -> io::Result<()> {
        let offset = self.cell_offset(address);
        write_at(&self.file, offset, &[state])
    }

    fn read_free_links(&self, address: u64) -> io::Result<(u64, u64)> {
        let offset = self.cell_offset(address) + 1;
        let buf = read_at(&self.file, offset, FREE_LIST_LINK_LEN)?;
        Ok((
            LittleEndian::read_u64(&buf[0..8]),
            LittleEndian::read_u64(&buf[8..16]),
        ))
    }

    fn write_free_links(&self, address: u64, prev: u64, next: u64) -> io::Result<()> {
        let mut buf = [0u8; FREE_LIST_LINK_LEN];
        LittleEndian::write_u64(&mut buf[0..8], prev);
        LittleEndian::write_u64(&mut buf[8..16], next);
        let offset = self.cell_offset(address) + 1;
        write_at(&self.file, offset, &buf)
    }

    fn persist_header(&mut self) -> io::Result<()> {
        let mut header = [0u8; HEADER_LEN as usize];
        LittleEndian::write_u64(&mut header[0..8], self.total_entries);
        LittleEndian::write_u64(&mut header[8..16], self.total_spaces);
        LittleEndian::write_u64(&mut header[16..24], self.first_free_address);
        LittleEndian::write_u32(&mut header[24..28], self.entry_size);
        LittleEndian::write_u64(&mut header[28..36], HEADER_LEN);
        LittleEndian::write_u16(&mut header[36..38], self.custom_fields.len() as u16);
        write_at(&self.file, 0, &header)?;

        let mut cursor = HEADER_LEN;
        for field in &self.custom_fields {
            let mut name_len_buf = [0u8; 2];
            LittleEndian::write_u16(&mut name_len_buf, field.name.len() as u16);
            write_at(&self.file, cursor, &name_len_buf)?;
            cursor += 2;
            write_at(&self.file, cursor, field.name.as_bytes())?;
            cursor += field.name.len() as u64;
            let mut value_buf = [0u8; 8];
            LittleEndian::write_u64(&mut value_buf, field.value);
            write_at(&self.file, cursor, &value_buf)?;
            cursor += 8;
        }

        self.file.sync_data()
    }

    /// Unlinks `address` from the free list in O(1) using its stored
    /// prev/next links.
    fn unlink_free(&mut self, address: u64, prev: u64, next: u64) -> io::Result<()> {
        if prev == NULL_ADDRESS {
            self.first_free_address = next;
        } else {
            let (pprev, _) = self.read_free_links(prev)?;
            self.write_free_links(prev, pprev, next)?;
        }
        if next != NULL_ADDRESS {
            let (_, nnext) = self.read_free_links(next)?;
            self.write_free_links(next, prev, nnext)?;
        }
        Ok(())
    }

    /// Reserves a cell: pops the free list head if non-empty, otherwise
    /// appends a fresh cell. Returns the new cell's address.
    pub fn free_address(&mut self) -> io::Result<u64> {
        let address = if self.first_free_address != NULL_ADDRESS {
            let address = self.first_free_address;
            let (_, next) = self.read_free_links(address)?;
            self.unlink_free(address, NULL_ADDRESS, next)?;
            self.total_spaces -= 1;
            address
        } else {
            self.cell_count()? + 1
        };

        self.write_state(address, STATE_RESERVED)?;
        self.total_entries += 1;
        self.persist_header()?;

        log::trace!("equi_blobs_file: reserved cell at address {address}");

        Ok(address)
    }

    /// Writes `bytes` into a `reserved` or `live` cell, marking it `live`.
    ///
    /// # Errors
    ///
    /// Fails if the cell is `free`, out of range, or `bytes.len()` does not
    /// match the registered entry size.
    pub fn store_blob(&mut self, address: u64, bytes: &[u8]) -> io::Result<()> {
        if bytes.len() as u32 != self.entry_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "blob length does not match entry size",
            ));
        }

        if address == NULL_ADDRESS || address > self.cell_count()? {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "address out of range"));
        }

        match self.read_state(address)? {
            STATE_FREE => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "cannot store into a free cell",
                ))
            }
            STATE_RESERVED | STATE_LIVE => {}
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("corrupt cell state byte {other}"),
                ))
            }
        }

        let offset = self.cell_offset(address) + 1;
        write_at(&self.file, offset, bytes)?;
        self.write_state(address, STATE_LIVE)?;

        Ok(())
    }

    /// Reads the payload of a `live` cell.
    ///
    /// # Errors
    ///
    /// Fails if the address is out of range or the cell is not `live`.
    pub fn retrieve_blob(&self, address: u64) -> io::Result<Vec<u8>> {
        if address == NULL_ADDRESS || address > self.cell_count()? {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "address out of range"));
        }

        if self.read_state(address)? != STATE_LIVE {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "cell is not live"));
        }

        let offset = self.cell_offset(address) + 1;
        read_at(&self.file, offset, self.entry_size as usize)
    }

    /// Marks a `live` cell `free`, pushing it onto the free list, and trims
    /// the file if the freed cell (or its predecessors) are now the tail.
    pub fn delete_blob(&mut self, address: u64) -> io::Result<()> {
        let cell_count = self.cell_count()?;
        if address == NULL_ADDRESS || address > cell_count {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "address out of range"));
        }

        if self.read_state(address)? != STATE_LIVE {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "cell is not live"));
        }

        self.push_free(address)?;
        self.total_entries -= 1;
        self.total_spaces += 1;

        if address == cell_count {
            self.trim()?;
        }

        self.persist_header()?;

        Ok(())
    }

    fn push_free(&mut self, address: u64) -> io::Result<()> {
        let old_head = self.first_free_address;
        self.write_free_links(address, NULL_ADDRESS, old_head)?;
        if old_head != NULL_ADDRESS {
            let (_, old_head_next) = self.read_free_links(old_head)?;
            self.write_free_links(old_head, address, old_head_next)?;
        }
        self.first_free_address = address;
        self.write_state(address, STATE_FREE)?;
        Ok(())
    }

    /// Repeatedly truncates trailing free cells until the tail cell is
    /// live/reserved or the file is empty (§4.1: "trimming").
    fn trim(&mut self) -> io::Result<()> {
        loop {
            let cell_count = self.cell_count()?;
            if cell_count == 0 {
                break;
            }

            let tail = cell_count;
            if self.read_state(tail)? != STATE_FREE {
                break;
            }

            let (prev, next) = self.read_free_links(tail)?;
            self.unlink_free(tail, prev, next)?;
            self.total_spaces -= 1;

            let new_len = self.data_offset + (cell_count - 1) * self.cell_size;
            self.file.set_len(new_len)?;

            log::trace!("equi_blobs_file: trimmed trailing free cell {tail}");
        }

        Ok(())
    }

    /// Flushes every buffered write to disk. `sync()` is the only
    /// operation that guarantees durability (§5); every other mutation may
    /// sit in OS buffers until this is called or the process exits cleanly.
    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_all()
    }

    /// Logically empties the file (all cells dropped), keeping custom
    /// fields and the entry size.
    pub fn clear(&mut self) -> io::Result<()> {
        self.file.set_len(self.data_offset)?;
        self.total_entries = 0;
        self.total_spaces = 0;
        self.first_free_address = NULL_ADDRESS;
        self.persist_header()
    }

    /// Removes the backing file from disk entirely, unlike [`Self::clear`]
    /// which only empties it (§4.1).
    ///
    /// # Errors
    ///
    /// Propagates any error removing the file, e.g. if it was already
    /// removed out from under this handle.
    pub fn erase(self) -> io::Result<()> {
        let path = self.path.clone();
        drop(self);
        std::fs::remove_file(path)
    }

    /// Returns the on-disk state of `address`, for tests and `check()`.
    pub fn cell_state(&self, address: u64) -> io::Result<CellState> {
        Ok(match self.read_state(address)? {
            STATE_FREE => CellState::Free,
            STATE_RESERVED => CellState::Reserved,
            _ => CellState::Live,
        })
    }

    /// Walks the file and the free list, verifying every structural
    /// invariant from §4.1 and §8. Returns `true` iff all hold.
    pub fn check(&self) -> io::Result<bool> {
        let cell_count = self.cell_count()?;

        if self.total_entries + self.total_spaces != cell_count {
            log::warn!("equi_blobs_file check: total_entries + total_spaces != cell_count");
            return Ok(false);
        }

        let mut seen = std::collections::HashSet::new();
        let mut address = self.first_free_address;
        let mut prev = NULL_ADDRESS;

        while address != NULL_ADDRESS {
            if !seen.insert(address) {
                log::warn!("equi_blobs_file check: cycle in free list at {address}");
                return Ok(false);
            }

            if address > cell_count {
                log::warn!("equi_blobs_file check: free list points past end of file");
                return Ok(false);
            }

            if self.read_state(address)? != STATE_FREE {
                log::warn!("equi_blobs_file check: free list entry {address} is not free");
                return Ok(false);
            }

            let (actual_prev, next) = self.read_free_links(address)?;
            if actual_prev != prev {
                log::warn!("equi_blobs_file check: broken prev link at {address}");
                return Ok(false);
            }

            prev = address;
            address = next;
        }

        if seen.len() as u64 != self.total_spaces {
            log::warn!("equi_blobs_file check: free list length != total_spaces");
            return Ok(false);
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn entry(n: u8) -> Vec<u8> {
        vec![n; 16]
    }

    #[test]
    fn allocate_store_retrieve() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut f = EquiBlobsFile::create_new(dir.path().join("f.blobs"), 16, &["root"])?;

        let a1 = f.free_address()?;
        f.store_blob(a1, &entry(1))?;
        assert_eq!(f.retrieve_blob(a1)?, entry(1));
        assert_eq!(f.total_entries(), 1);
        assert_eq!(f.total_spaces(), 0);

        Ok(())
    }

    #[test]
    fn delete_and_reuse_slot() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut f = EquiBlobsFile::create_new(dir.path().join("f.blobs"), 16, &[])?;

        let a1 = f.free_address()?;
        f.store_blob(a1, &entry(1))?;
        let a2 = f.free_address()?;
        f.store_blob(a2, &entry(2))?;

        f.delete_blob(a1)?;
        assert_eq!(f.cell_state(a1)?, CellState::Free);

        let a3 = f.free_address()?;
        assert_eq!(a3, a1, "freed slot should be reused");
        f.store_blob(a3, &entry(3))?;
        assert_eq!(f.retrieve_blob(a3)?, entry(3));

        Ok(())
    }

    #[test]
    fn trimming_truncates_trailing_free_cells() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut f = EquiBlobsFile::create_new(dir.path().join("f.blobs"), 16, &[])?;

        let addrs: Vec<u64> = (0..5)
            .map(|i| {
                let a = f.free_address().unwrap();
                f.store_blob(a, &entry(i)).unwrap();
                a
            })
            .collect();

        assert_eq!(f.cell_count()?, 5);

        // delete the last three in descending order: each should trim immediately
        f.delete_blob(addrs[4])?;
        assert_eq!(f.cell_count()?, 4);
        f.delete_blob(addrs[3])?;
        assert_eq!(f.cell_count()?, 3);
        f.delete_blob(addrs[2])?;
        assert_eq!(f.cell_count()?, 2);

        assert_eq!(f.total_spaces(), 0);
        assert_eq!(f.total_entries(), 2);

        Ok(())
    }

    #[test]
    fn trimming_cascades_through_non_contiguous_frees() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut f = EquiBlobsFile::create_new(dir.path().join("f.blobs"), 16, &[])?;

        let addrs: Vec<u64> = (0..4)
            .map(|i| {
                let a = f.free_address().unwrap();
                f.store_blob(a, &entry(i)).unwrap();
                a
            })
            .collect();

        // free cell 2 (not the tail) first: no trim yet
        f.delete_blob(addrs[2])?;
        assert_eq!(f.cell_count()?, 4);
        assert_eq!(f.total_spaces(), 1);

        // freeing the tail (cell 3) should cascade and also reclaim cell 2
        f.delete_blob(addrs[3])?;
        assert_eq!(f.cell_count()?, 2);
        assert_eq!(f.total_spaces(), 0);

        Ok(())
    }

    #[test]
    fn store_into_free_cell_fails() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut f = EquiBlobsFile::create_new(dir.path().join("f.blobs"), 16, &[])?;

        let a1 = f.free_address()?;
        f.store_blob(a1, &entry(1))?;
        f.delete_blob(a1)?;

        assert!(f.store_blob(a1, &entry(2)).is_err());

        Ok(())
    }

    #[test]
    fn custom_header_fields_round_trip() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("f.blobs");

        {
            let mut f = EquiBlobsFile::create_new(&path, 16, &["root", "count"])?;
            f.set_custom_field("root", 42)?;
            f.set_custom_field("count", 7)?;
        }

        let f = EquiBlobsFile::open(&path)?;
        assert_eq!(f.custom_field("root"), Some(42));
        assert_eq!(f.custom_field("count"), Some(7));

        Ok(())
    }

    #[test]
    fn close_and_reopen_preserves_entries() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("f.blobs");

        let addr;
        {
            let mut f = EquiBlobsFile::create_new(&path, 16, &[])?;
            addr = f.free_address()?;
            f.store_blob(addr, &entry(9))?;
        }

        let f = EquiBlobsFile::open(&path)?;
        assert_eq!(f.retrieve_blob(addr)?, entry(9));
        assert_eq!(f.total_entries(), 1);

        Ok(())
    }

    #[test]
    fn erase_removes_backing_file() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("f.blobs");
        let mut f = EquiBlobsFile::create_new(&path, 16, &[])?;
        let a1 = f.free_address()?;
        f.store_blob(a1, &entry(1))?;

        assert!(path.exists());
        f.erase()?;
        assert!(!path.exists());

        Ok(())
    }

    #[test]
    fn check_detects_consistent_state() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut f = EquiBlobsFile::create_new(dir.path().join("f.blobs"), 16, &[])?;

        for i in 0..10 {
            let a = f.free_address()?;
            f.store_blob(a, &entry(i))?;
        }

        assert!(f.check()?);

        Ok(())
    }
}
