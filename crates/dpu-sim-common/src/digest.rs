//! Truncated SHA-256 digests used as content-addressed keys

use std::fmt::Write;

use aws_lc_rs::digest;

/// Hex length of a short hash (8 bytes)
pub const SHORT_HASH_LEN: usize = 16;

/// Lowercase hex SHA-256 of `data`, truncated to `hex_len` characters.
///
/// `hex_len` is capped at the full digest length (64).
pub fn sha256_hex_prefix(data: &[u8], hex_len: usize) -> String {
    let hash = digest::digest(&digest::SHA256, data);
    let mut hex = hash
        .as_ref()
        .iter()
        .fold(String::with_capacity(64), |mut s, b| {
            let _ = write!(s, "{:02x}", b);
            s
        });
    hex.truncate(hex_len);
    hex
}

/// 16-character hex digest of `data`
pub fn short_hash(data: &[u8]) -> String {
    sha256_hex_prefix(data, SHORT_HASH_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_hash_is_stable_lowercase_hex() {
        // sha256("") = e3b0c44298fc1c149afbf4c8996fb924...
        assert_eq!(short_hash(b""), "e3b0c44298fc1c14");
        assert_eq!(short_hash(b"abc"), "ba7816bf8f01cfea");
        assert_eq!(short_hash(b"abc"), short_hash(b"abc"));
    }

    #[test]
    fn prefix_length_is_respected() {
        assert_eq!(sha256_hex_prefix(b"abc", 12), "ba7816bf8f01");
        assert_eq!(sha256_hex_prefix(b"abc", 100).len(), 64);
    }

    #[test]
    fn different_inputs_differ() {
        assert_ne!(short_hash(b"arch=amd64"), short_hash(b"arch=arm64"));
    }
}
