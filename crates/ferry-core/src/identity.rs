//! Content-derived session identity.
//!
//! A session is keyed by the file it carries, not by who sends it: the
//! identifier is the leading 64 bits of the content's SHA-256. The same
//! bytes always map to the same session across retries and hosts, which is
//! what makes resumption work. It is an identifier, not a security
//! primitive.

use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

/// Hex characters of the digest that form the session identifier.
pub const FILE_ID_HEX_CHARS: usize = 16;

/// Streaming SHA-256 of a file, returned as lowercase hex.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 of an in-memory buffer, as lowercase hex.
pub fn sha256_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Session identifier: the first [`FILE_ID_HEX_CHARS`] hex characters of a
/// SHA-256 digest, read as a big-endian u64.
pub fn file_id_from_digest(digest: &str) -> Result<u64, IdentityError> {
    let prefix = digest
        .get(..FILE_ID_HEX_CHARS)
        .ok_or(IdentityError::DigestTooShort(digest.len()))?;
    u64::from_str_radix(prefix, 16).map_err(|_| IdentityError::NotHex(prefix.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("digest too short for an identifier: {0} chars")]
    DigestTooShort(usize),

    #[error("digest prefix is not hex: {0:?}")]
    NotHex(String),
}
