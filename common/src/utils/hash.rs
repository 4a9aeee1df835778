use std::fmt::Write;

use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of a single input.
pub fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Lowercase hex SHA-256 over fields joined with `|`, the separator used
/// by every derived id in the data model.
pub fn sha256_hex_parts(parts: &[&str]) -> String {
    sha256_hex(&parts.join("|"))
}

/// Hash raw bytes, used for file content hashes.
pub fn sha256_hex_bytes(input: &[u8]) -> String {
    let digest = Sha256::digest(input);
    let mut out = String::with_capacity(64);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
