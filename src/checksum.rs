// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! CRC32 helpers shared by the blob header (§6) and the transaction log
//! frame format (§4.6).

use crc32fast::Hasher;

/// Computes the CRC32 (IEEE) of a byte slice.
#[must_use]
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// Verifies `got` against `expected`, returning a fatal [`crate::Error`] on
/// mismatch.
pub fn check(got: u32, expected: u32) -> crate::Result<()> {
    if got == expected {
        Ok(())
    } else {
        Err(crate::Error::ChecksumMismatch { got, expected })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_matches_known_vector() {
        // "123456789" -> 0xCBF43926 is the standard CRC-32/ISO-HDLC check value
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn check_ok_and_mismatch() {
        assert!(check(5, 5).is_ok());
        assert!(matches!(
            check(5, 6),
            Err(crate::Error::ChecksumMismatch {
                got: 5,
                expected: 6
            })
        ));
    }
}
