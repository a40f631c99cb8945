use std::io::Read;
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use md5::Md5;
use sha2::{Digest, Sha256};

use crate::TransferError;

/// Base64 MD5 of `data`, the encoding used by `Content-MD5`.
pub fn content_md5(data: &[u8]) -> String {
    BASE64.encode(Md5::digest(data))
}

/// Compares `data` against a `Content-MD5` header value.
pub fn verify_content_md5(data: &[u8], expected: &str) -> Result<(), TransferError> {
    let actual = content_md5(data);
    if actual != expected.trim() {
        return Err(TransferError::ChecksumMismatch {
            expected: expected.trim().to_string(),
            actual,
        });
    }
    Ok(())
}

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Computes SHA-256 of an entire file and returns the hex-encoded digest.
pub fn calculate_file_checksum(path: &Path) -> Result<String, TransferError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_known_value() {
        // RFC 1321 test suite.
        assert_eq!(content_md5(b""), "1B2M2Y8AsgTpgAmY7PhCfg==");
        assert_eq!(content_md5(b"abc"), "kAFQmDzST7DWlj99KOF/cg==");
    }

    #[test]
    fn md5_mismatch_is_integrity_error() {
        verify_content_md5(b"abc", "kAFQmDzST7DWlj99KOF/cg==").unwrap();
        let err = verify_content_md5(b"abd", "kAFQmDzST7DWlj99KOF/cg==").unwrap_err();
        assert!(matches!(err, TransferError::ChecksumMismatch { .. }));
    }

    #[test]
    fn file_checksum_matches_bytes() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"test content for checksum").unwrap();

        assert_eq!(
            calculate_file_checksum(&path).unwrap(),
            checksum_bytes(b"test content for checksum")
        );
        assert_eq!(checksum_bytes(b"x").len(), 64);
    }
}
