// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Represents errors that can occur in the store.
///
/// [`Error::Corruption`], [`Error::ChecksumMismatch`] and the lock errors are
/// fatal: once one of these surfaces, the owning [`crate::Store`] degrades to
/// a read-only state for the remainder of the process (see the error
/// handling policy in the crate-level docs).
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// On-disk format version is newer than this build supports
    InvalidVersion(u32),

    /// A blob's CRC32 did not match its header (got, expected)
    ChecksumMismatch {
        /// Checksum computed over the bytes actually read
        got: u32,
        /// Checksum recorded in the header
        expected: u32,
    },

    /// A structural invariant was violated: a dangling index entry, a write
    /// into a non-reserved slot, a cycle in a free list, etc. Always fatal.
    Corruption(String),

    /// The directory lock is held by another live process
    LockHeld {
        /// PID of the holder, if it could be parsed from the lock file
        pid: Option<u32>,
    },

    /// The directory lock could not be acquired within `max_retries`
    LockTimeout,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::InvalidVersion(v) => write!(f, "unsupported store format version: {v}"),
            Self::ChecksumMismatch { got, expected } => {
                write!(f, "checksum mismatch: got {got:#010x}, expected {expected:#010x}")
            }
            Self::Corruption(msg) => write!(f, "store corruption: {msg}"),
            Self::LockHeld { pid: Some(pid) } => write!(f, "store directory is locked by pid {pid}"),
            Self::LockHeld { pid: None } => write!(f, "store directory is locked"),
            Self::LockTimeout => write!(f, "timed out waiting for the store directory lock"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Store result
pub type Result<T> = std::result::Result<T, Error>;
