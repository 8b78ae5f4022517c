// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::fs::FileSystem;
use byteorder::{ByteOrder, LittleEndian};
use std::{fs::File, io::Write, path::Path};

/// Store directory layout, see crate-level docs and §6 of the specification.
pub const VERSION_FILE: &str = "version";
pub const LOCK_FILE: &str = "lock";
pub const DATABASE_FILE: &str = "database.blobs";
pub const INDEX_CELLS_FILE: &str = "index.blobs";
pub const SPACES_CELLS_FILE: &str = "spaces.blobs";
pub const ROOTS_FILE: &str = "roots.blob";
pub const TRANSACTION_LOG_FILE: &str = "transaction.log";
pub const NEXT_OID_FILE: &str = "next_oid";

/// The on-disk format version this build writes and the highest version it
/// can open (§6: opening a higher version fails outright).
pub const CURRENT_VERSION: u32 = 1;

/// Encodes the `version` file: a `u32` format version followed by the
/// optional `serializer` tag a caller registered via
/// [`crate::config::Config::serializer`] (§6: "an opaque tag understood by
/// the wrapper layer only; the core treats it as metadata to store in the
/// `version` block"). Absent a tag, only the 4-byte version is written, so
/// the file stays minimal for the common case.
#[must_use]
pub fn encode_version_block(version: u32, serializer: Option<&str>) -> Vec<u8> {
    let mut buf = version.to_le_bytes().to_vec();
    if let Some(tag) = serializer {
        let mut len_buf = [0u8; 2];
        LittleEndian::write_u16(&mut len_buf, tag.len() as u16);
        buf.extend_from_slice(&len_buf);
        buf.extend_from_slice(tag.as_bytes());
    }
    buf
}

/// Decodes a `version` file written by [`encode_version_block`], returning
/// the format version and the serializer tag, if one was stored. A file
/// holding only the 4-byte version (no trailing tag) decodes to `None`.
pub fn decode_version_block(bytes: &[u8]) -> std::io::Result<(u32, Option<String>)> {
    if bytes.len() < 4 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "version file is truncated",
        ));
    }
    let version = LittleEndian::read_u32(&bytes[0..4]);

    if bytes.len() == 4 {
        return Ok((version, None));
    }
    if bytes.len() < 6 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "version file's serializer tag is truncated",
        ));
    }
    let tag_len = LittleEndian::read_u16(&bytes[4..6]) as usize;
    let tag_bytes = bytes.get(6..6 + tag_len).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "version file's serializer tag is truncated",
        )
    })?;
    let tag = String::from_utf8(tag_bytes.to_vec())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;

    Ok((version, Some(tag)))
}

/// Reads exactly `size` bytes at `offset` using positional I/O (`pread` on
/// Unix, `seek_read` on Windows), leaving the file's cursor untouched.
#[cfg(unix)]
pub fn read_at(file: &File, offset: u64, size: usize) -> std::io::Result<Vec<u8>> {
    use std::os::unix::fs::FileExt;

    let mut buf = vec![0u8; size];
    file.read_exact_at(&mut buf, offset)?;
    Ok(buf)
}

/// Reads exactly `size` bytes at `offset` using positional I/O (`pread` on
/// Unix, `seek_read` on Windows), leaving the file's cursor untouched.
#[cfg(windows)]
pub fn read_at(file: &File, offset: u64, size: usize) -> std::io::Result<Vec<u8>> {
    use std::os::windows::fs::FileExt;

    let mut buf = vec![0u8; size];
    let mut read_so_far = 0;

    while read_so_far < size {
        let n = file.seek_read(&mut buf[read_so_far..], offset + read_so_far as u64)?;

        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("read_at({read_so_far}) at {offset} did not read enough bytes {size}"),
            ));
        }

        read_so_far += n;
    }

    Ok(buf)
}

/// Writes `buf` at `offset` using positional I/O, leaving the file's cursor
/// untouched.
#[cfg(unix)]
pub fn write_at(file: &File, offset: u64, buf: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;

    file.write_all_at(buf, offset)
}

/// Writes `buf` at `offset` using positional I/O, leaving the file's cursor
/// untouched.
#[cfg(windows)]
pub fn write_at(file: &File, offset: u64, buf: &[u8]) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;

    let mut written_so_far = 0;

    while written_so_far < buf.len() {
        let n = file.seek_write(&buf[written_so_far..], offset + written_so_far as u64)?;
        written_so_far += n;
    }

    Ok(())
}

/// Atomically rewrites a small metadata file (e.g. `version`, `roots.blob`)
/// by writing to a temp file in the same directory and renaming over it.
pub fn rewrite_atomic<F: FileSystem>(path: &Path, content: &[u8]) -> std::io::Result<()> {
    #[expect(
        clippy::expect_used,
        reason = "every file should have a parent directory"
    )]
    let folder = path.parent().expect("should have a parent");

    let mut temp_file = tempfile::NamedTempFile::new_in(folder)?;
    temp_file.write_all(content)?;
    temp_file.flush()?;
    temp_file.as_file_mut().sync_all()?;
    temp_file.persist(path)?;

    // TODO: not sure why it fails on Windows...
    #[cfg(not(target_os = "windows"))]
    {
        let file = F::open(path)?;
        file.sync_all()?;

        #[expect(
            clippy::expect_used,
            reason = "files should always have a parent directory"
        )]
        let folder = path.parent().expect("should have parent folder");
        fsync_directory::<F>(folder)?;
    }

    Ok(())
}

#[cfg(not(target_os = "windows"))]
pub fn fsync_directory<F: FileSystem>(path: &Path) -> std::io::Result<()> {
    let file = F::open(path)?;
    debug_assert!(file.metadata()?.is_dir());
    file.sync_all()
}

#[cfg(target_os = "windows")]
pub fn fsync_directory<F: FileSystem>(_path: &Path) -> std::io::Result<()> {
    // Cannot fsync directory on Windows
    Ok(())
}
