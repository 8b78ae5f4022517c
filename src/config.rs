// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{path::absolute_path, store::Store, Result};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

/// Called periodically during long-running operations ([`Store::gc`],
/// [`Store::check`], [`Store::copy`]) to report progress, e.g. for a
/// terminal progress bar.
pub type ProgressMeter = Arc<dyn Fn(&str, u64, u64) + Send + Sync>;

const DEFAULT_CACHE_BITS: u8 = 16;
const DEFAULT_LOCK_MAX_RETRIES: u32 = 5;
const DEFAULT_LOCK_PAUSE: Duration = Duration::from_millis(500);

/// Store configuration builder.
#[derive(Clone)]
pub struct Config {
    /// Store directory
    pub(crate) path: PathBuf,

    /// `log2` of the number of entries each cache pool can hold, see
    /// [`crate::cache::Cache`]
    pub(crate) cache_bits: u8,

    /// How many times to retry acquiring the directory lock before giving
    /// up, see [`crate::lock::DirectoryLock`]
    pub(crate) lock_max_retries: u32,

    /// How long to sleep between lock acquisition attempts
    pub(crate) lock_pause: Duration,

    /// Optional overall timeout across all lock retries
    pub(crate) lock_timeout: Option<Duration>,

    /// Optional progress reporting callback
    pub(crate) progress_meter: Option<ProgressMeter>,

    /// Opaque tag identifying the wrapper layer's value-serialization
    /// format. The core never interprets it, only persists it in the
    /// `version` block so a later `open` can hand it back (§6).
    pub(crate) serializer: Option<String>,
}

impl Config {
    /// Initializes a new config for the store directory at `path`.
    #[must_use]
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: absolute_path(path),
            cache_bits: DEFAULT_CACHE_BITS,
            lock_max_retries: DEFAULT_LOCK_MAX_RETRIES,
            lock_pause: DEFAULT_LOCK_PAUSE,
            lock_timeout: None,
            progress_meter: None,
            serializer: None,
        }
    }

    /// Sets `log2` of the cache pool sizes.
    ///
    /// Each of the read and write pools in [`crate::cache::Cache`] holds up
    /// to `2.pow(bits)` entries.
    ///
    /// Defaults to 16 (65536 entries per pool).
    ///
    /// # Panics
    ///
    /// Panics if `bits` is 0 or greater than 32.
    #[must_use]
    pub fn cache_bits(mut self, bits: u8) -> Self {
        assert!(bits > 0 && bits <= 32, "invalid cache_bits value");

        self.cache_bits = bits;
        self
    }

    /// Sets how many times to retry acquiring the directory lock before
    /// [`Error::LockTimeout`](crate::Error::LockTimeout) is returned.
    ///
    /// Defaults to 5.
    #[must_use]
    pub fn lock_max_retries(mut self, retries: u32) -> Self {
        self.lock_max_retries = retries;
        self
    }

    /// Sets how long to sleep between lock acquisition attempts.
    ///
    /// Defaults to 500ms.
    #[must_use]
    pub fn lock_pause(mut self, pause: Duration) -> Self {
        self.lock_pause = pause;
        self
    }

    /// Sets an overall timeout across all lock retries, in addition to
    /// [`Self::lock_max_retries`].
    ///
    /// Defaults to unset (only `lock_max_retries` bounds the wait).
    #[must_use]
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// Registers a callback invoked periodically during [`Store::gc`],
    /// [`Store::check`] and [`Store::copy`] with a phase name, the current
    /// progress, and the total amount of work for that phase.
    #[must_use]
    pub fn progress_meter(mut self, meter: ProgressMeter) -> Self {
        self.progress_meter = Some(meter);
        self
    }

    /// Registers an opaque tag identifying the wrapper layer's
    /// value-serialization format (e.g. `"msgpack"`, `"json"`). The core
    /// never interprets this tag, only persists it in the store's `version`
    /// block so that reopening the store can hand it back via
    /// [`Store::serializer_tag`](crate::store::Store::serializer_tag).
    ///
    /// Defaults to unset.
    #[must_use]
    pub fn serializer(mut self, tag: impl Into<String>) -> Self {
        self.serializer = Some(tag.into());
        self
    }

    /// Opens an existing store directory, replaying its transaction log if
    /// necessary.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory does not contain a store, the
    /// on-disk format is newer than this build supports, or the directory
    /// lock cannot be acquired.
    pub fn open(self) -> Result<Store> {
        Store::open(self)
    }

    /// Creates a brand-new store directory. Fails if the directory already
    /// contains a store.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or already
    /// contains a store.
    pub fn create_new(self) -> Result<Store> {
        Store::create_new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn builder_defaults() {
        let config = Config::new("/tmp/example-store");
        assert_eq!(config.cache_bits, DEFAULT_CACHE_BITS);
        assert_eq!(config.lock_max_retries, DEFAULT_LOCK_MAX_RETRIES);
        assert!(config.lock_timeout.is_none());
    }

    #[test]
    #[should_panic(expected = "invalid cache_bits value")]
    fn rejects_zero_cache_bits() {
        let _ = Config::new("/tmp/example-store").cache_bits(0);
    }

    #[test]
    fn serializer_defaults_to_unset() {
        let config = Config::new("/tmp/example-store");
        assert!(config.serializer.is_none());

        let config = Config::new("/tmp/example-store").serializer("msgpack");
        assert_eq!(config.serializer.as_deref(), Some("msgpack"));
    }
}
