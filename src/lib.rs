// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! An embedded, single-process persistent object store.
//!
//! ##### About
//!
//! A store maps opaque `u64` object ids to byte blobs, persisted across
//! process restarts in a single directory on disk. It is built from a small
//! stack of layers, each a K.I.S.S. persistent structure in its own right:
//!
//! - [`equi_blobs_file`] — a fixed-size record container with O(1)
//!   allocation and deletion, the substrate every higher layer is built on.
//! - [`space_manager`] and [`flat_file`] — a free-region index and the
//!   variable-length blob heap it backs, object storage itself.
//! - [`btree`] and [`index`] — an ordered `u64 -> u64` B+tree mapping every
//!   object id to its physical address in the flat file.
//! - [`cache`] — a bounded, two-pool cache of recently read and
//!   not-yet-flushed object bytes sitting in front of the flat file.
//! - [`tlog`] — nested, crash-safe transaction frames recorded as an
//!   on-disk undo log.
//! - [`gc`] — mark-and-sweep collection over the id-reference graph a
//!   caller's [`cache::ReferenceExtractor`] exposes.
//! - [`store`] — the [`Store`] façade tying every layer together behind a
//!   single-writer directory lock.
//!
//! # Example usage
//!
//! ```
//! use perobs::Config;
//! # let dir = tempfile::tempdir()?;
//!
//! let mut store = Config::new(dir.path()).create_new()?;
//!
//! let handle = store.new_object(b"hello, world")?;
//! store.set("main", &handle)?;
//! store.sync()?;
//!
//! let root = store.get("main")?;
//! assert_eq!(root.map(|h| h.bytes().to_vec()), Some(b"hello, world".to_vec()));
//! # Ok::<(), perobs::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::indexing_slicing)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![warn(clippy::multiple_crate_versions)]
#![allow(clippy::option_if_let_else)]

pub mod btree;
pub mod cache;
mod checksum;
pub mod classmap;
pub mod config;
pub mod equi_blobs_file;
mod error;
pub mod file;
pub mod flat_file;
pub mod fs;
pub mod gc;
pub mod index;
pub mod lock;
mod path;
pub mod roots;
pub mod space_manager;
pub mod stats;
pub mod store;
pub mod tlog;

pub use {
    cache::ReferenceExtractor,
    classmap::CLASS_MAP_OID,
    config::{Config, ProgressMeter},
    error::{Error, Result},
    gc::GcStats,
    stats::Statistics,
    store::{CheckReport, Handle, Store},
};
