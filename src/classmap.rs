// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The class name registry (§11: "ClassMap"), a small reserved object that
//! lets stored objects record their class as a compact `u32` id instead of
//! repeating the class name in every blob.
//!
//! Stored as the object with the reserved id [`CLASS_MAP_OID`], so it
//! travels through the same flat file / cache / transaction machinery as
//! every other object.

use crate::{Error, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::collections::{HashMap, HashSet};

/// The object id reserved for the class map itself; no user object may use
/// this id.
pub const CLASS_MAP_OID: u64 = 1;

/// Maps class names to stable, compact ids.
///
/// Removing a class (via [`Self::keep`]) tombstones its slot instead of
/// shifting every later index, so ids already recorded in stored objects
/// stay valid until those objects themselves are collected.
#[derive(Debug, Default)]
pub struct ClassMap {
    names: Vec<Option<String>>,
}

impl ClassMap {
    /// Creates an empty class map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the id for `name`, registering it if not already present.
    pub fn class_id_for(&mut self, name: &str) -> u32 {
        if let Some(idx) = self.names.iter().position(|n| n.as_deref() == Some(name)) {
            return idx as u32;
        }

        if let Some(idx) = self.names.iter().position(Option::is_none) {
            self.names[idx] = Some(name.to_string());
            return idx as u32;
        }

        self.names.push(Some(name.to_string()));
        (self.names.len() - 1) as u32
    }

    /// Returns the class name for `id`, if it is registered and not
    /// tombstoned.
    #[must_use]
    pub fn class_name_for(&self, id: u32) -> Option<&str> {
        self.names.get(id as usize).and_then(Option::as_deref)
    }

    /// Number of registered (non-tombstoned) classes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.iter().filter(|n| n.is_some()).count()
    }

    /// Returns `true` if no classes are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Renames classes in place according to `renames` (old name -> new
    /// name), preserving every id.
    pub fn rename_classes(&mut self, renames: &HashMap<String, String>) {
        for slot in &mut self.names {
            if let Some(name) = slot {
                if let Some(new_name) = renames.get(name) {
                    *name = new_name.clone();
                }
            }
        }
    }

    /// Tombstones every registered class not in `allowed`. Called after a
    /// garbage collection sweep with the set of class names still
    /// referenced by surviving objects. Returns the number of classes
    /// dropped.
    pub fn keep(&mut self, allowed: &HashSet<String>) -> usize {
        let mut dropped = 0;

        for slot in &mut self.names {
            if let Some(name) = slot {
                if !allowed.contains(name) {
                    *slot = None;
                    dropped += 1;
                }
            }
        }

        dropped
    }

    /// Serializes the map for storage as [`CLASS_MAP_OID`]'s payload.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut count_buf = [0u8; 4];
        LittleEndian::write_u32(&mut count_buf, self.names.len() as u32);
        buf.extend_from_slice(&count_buf);

        for slot in &self.names {
            match slot {
                None => buf.push(0),
                Some(name) => {
                    buf.push(1);
                    let mut len_buf = [0u8; 2];
                    LittleEndian::write_u16(&mut len_buf, name.len() as u16);
                    buf.extend_from_slice(&len_buf);
                    buf.extend_from_slice(name.as_bytes());
                }
            }
        }

        buf
    }

    /// Deserializes a map previously produced by [`Self::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(Error::Corruption("class map payload too short".into()));
        }

        let count = LittleEndian::read_u32(&bytes[0..4]);
        let mut offset = 4;
        let mut names = Vec::with_capacity(count as usize);

        for _ in 0..count {
            match bytes[offset] {
                0 => {
                    names.push(None);
                    offset += 1;
                }
                1 => {
                    offset += 1;
                    let len = LittleEndian::read_u16(&bytes[offset..offset + 2]) as usize;
                    offset += 2;
                    let name = String::from_utf8(bytes[offset..offset + len].to_vec())
                        .map_err(|e| Error::Corruption(e.to_string()))?;
                    offset += len;
                    names.push(Some(name));
                }
                other => {
                    return Err(Error::Corruption(format!("invalid class map tag {other}")));
                }
            }
        }

        Ok(Self { names })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn assigns_stable_ids() {
        let mut map = ClassMap::new();
        let a = map.class_id_for("Person");
        let b = map.class_id_for("Address");
        assert_eq!(map.class_id_for("Person"), a);
        assert_ne!(a, b);
        assert_eq!(map.class_name_for(a), Some("Person"));
    }

    #[test]
    fn keep_tombstones_and_reuses_slots() {
        let mut map = ClassMap::new();
        let person = map.class_id_for("Person");
        let _address = map.class_id_for("Address");

        let mut allowed = HashSet::new();
        allowed.insert("Person".to_string());
        let dropped = map.keep(&allowed);
        assert_eq!(dropped, 1);

        assert_eq!(map.class_name_for(person), Some("Person"));

        let car = map.class_id_for("Car");
        // the tombstoned "Address" slot should be reused rather than growing
        assert_eq!(map.len(), 2);
        assert_eq!(map.class_name_for(car), Some("Car"));
    }

    #[test]
    fn encode_decode_roundtrip() -> Result<()> {
        let mut map = ClassMap::new();
        map.class_id_for("Person");
        map.class_id_for("Address");
        map.keep(&{
            let mut s = HashSet::new();
            s.insert("Person".to_string());
            s
        });

        let decoded = ClassMap::decode(&map.encode())?;
        assert_eq!(decoded.class_name_for(0), Some("Person"));
        assert_eq!(decoded.class_name_for(1), None);

        Ok(())
    }
}
