// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The store's named roots (`roots.blob`): the handful of named entry
//! points (e.g. `"main"`) a [`crate::gc::GarbageCollector`] treats as
//! reachable by definition.
//!
//! Small and rewritten wholesale on every change, so it uses the same
//! atomic small-file rewrite as the version file rather than its own
//! cell-based storage.

use crate::{
    file::{rewrite_atomic, ROOTS_FILE},
    fs::StdFileSystem,
    Result,
};
use byteorder::{ByteOrder, LittleEndian};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

/// The store's named roots.
#[derive(Debug)]
pub struct Roots {
    path: PathBuf,
    entries: BTreeMap<String, u64>,
}

impl Roots {
    /// Creates a brand-new, empty roots file.
    pub fn create_new(dir: &Path) -> Result<Self> {
        let this = Self {
            path: dir.join(ROOTS_FILE),
            entries: BTreeMap::new(),
        };
        this.persist()?;
        Ok(this)
    }

    /// Reopens the roots file.
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(ROOTS_FILE);
        let bytes = std::fs::read(&path)?;
        let entries = decode(&bytes)?;
        Ok(Self { path, entries })
    }

    fn persist(&self) -> Result<()> {
        rewrite_atomic::<StdFileSystem>(&self.path, &encode(&self.entries))?;
        Ok(())
    }

    /// Looks up a named root's object id.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<u64> {
        self.entries.get(name).copied()
    }

    /// Returns `true` if `name` is a registered root.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registers or updates a named root.
    pub fn set(&mut self, name: &str, oid: u64) -> Result<()> {
        self.entries.insert(name.to_string(), oid);
        self.persist()
    }

    /// Removes a named root, returning `true` if it existed.
    pub fn remove(&mut self, name: &str) -> Result<bool> {
        let removed = self.entries.remove(name).is_some();
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Number of registered roots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if there are no registered roots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Visits every `(name, oid)` pair.
    pub fn each(&self, mut f: impl FnMut(&str, u64)) {
        for (name, &oid) in &self.entries {
            f(name, oid);
        }
    }
}

fn encode(entries: &BTreeMap<String, u64>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + entries.len() * 16);
    let mut count_buf = [0u8; 4];
    LittleEndian::write_u32(&mut count_buf, entries.len() as u32);
    buf.extend_from_slice(&count_buf);

    for (name, &oid) in entries {
        let mut name_len_buf = [0u8; 2];
        LittleEndian::write_u16(&mut name_len_buf, name.len() as u16);
        buf.extend_from_slice(&name_len_buf);
        buf.extend_from_slice(name.as_bytes());

        let mut oid_buf = [0u8; 8];
        LittleEndian::write_u64(&mut oid_buf, oid);
        buf.extend_from_slice(&oid_buf);
    }

    buf
}

fn decode(bytes: &[u8]) -> Result<BTreeMap<String, u64>> {
    let mut entries = BTreeMap::new();

    if bytes.len() < 4 {
        return Ok(entries);
    }

    let count = LittleEndian::read_u32(&bytes[0..4]);
    let mut offset = 4;

    for _ in 0..count {
        let name_len = LittleEndian::read_u16(&bytes[offset..offset + 2]) as usize;
        offset += 2;
        let name = String::from_utf8(bytes[offset..offset + name_len].to_vec())
            .map_err(|e| crate::Error::Corruption(e.to_string()))?;
        offset += name_len;
        let oid = LittleEndian::read_u64(&bytes[offset..offset + 8]);
        offset += 8;
        entries.insert(name, oid);
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn set_get_remove() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut roots = Roots::create_new(dir.path())?;

        roots.set("main", 1)?;
        roots.set("scratch", 2)?;

        assert_eq!(roots.get("main"), Some(1));
        assert!(roots.remove("scratch")?);
        assert_eq!(roots.len(), 1);

        Ok(())
    }

    #[test]
    fn persists_across_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let mut roots = Roots::create_new(dir.path())?;
            roots.set("main", 42)?;
        }

        let roots = Roots::open(dir.path())?;
        assert_eq!(roots.get("main"), Some(42));

        Ok(())
    }
}
