//! Content-hash helpers
//!
//! A content hash is a 64-character lowercase hex SHA-256 digest computed
//! over audio sample data (metadata stripped). It is the sharing key for
//! analysis jobs, waveforms and stem sets, so identical audio in different
//! files reuses work.

use sha2::{Digest, Sha256};

/// SHA-256 of a byte slice as lowercase hex
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Whether a string is a well-formed content hash (64 hex digits)
pub fn is_content_hash(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_shape() {
        let h = sha256_hex(b"four on the floor");
        assert_eq!(h.len(), 64);
        assert!(is_content_hash(&h));
    }

    #[test]
    fn rejects_malformed_hashes() {
        assert!(!is_content_hash("abc"));
        assert!(!is_content_hash(&"g".repeat(64)));
        assert!(is_content_hash(&"0".repeat(64)));
    }
}
