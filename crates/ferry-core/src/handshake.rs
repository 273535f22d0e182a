//! Handshake documents — the JSON payloads of SYN and SYN-ACK.
//!
//! Both documents are UTF-8 JSON with insignificant key order; unknown keys
//! are ignored and missing keys fall back to defaults, so old and new
//! endpoints can interoperate.

use std::path::Path;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Default chunk size when the sender does not choose one.
pub const DEFAULT_CHUNK_SIZE: u32 = 1024;

/// Filename used when the offer carries none.
pub const FALLBACK_FILENAME: &str = "recv.bin";

/// SYN payload: everything the receiver needs to create or resume a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferOffer {
    #[serde(default = "default_filename")]
    pub filename: String,
    /// Total file size in bytes.
    #[serde(default)]
    pub filesize: u64,
    /// The sender's chunking unit. Fixed for the life of the session.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u32,
    /// Lowercase hex SHA-256 of the full file content.
    #[serde(default)]
    pub sha256: String,
}

impl TransferOffer {
    pub fn from_payload(payload: &[u8]) -> Result<Self, HandshakeError> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn to_payload(&self) -> Result<Bytes, HandshakeError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// The offered filename reduced to its final path component.
    ///
    /// A receiver must never let the sender pick directories; anything that
    /// does not reduce to a plain leaf name falls back to a fixed name.
    pub fn leaf_filename(&self) -> &str {
        Path::new(&self.filename)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(FALLBACK_FILENAME)
    }

    /// Number of chunks the file divides into. Zero for an empty file; the
    /// sender still transmits one empty EOF chunk in that case.
    pub fn total_chunks(&self) -> u32 {
        chunk_count(self.filesize, self.chunk_size)
    }
}

/// SYN-ACK payload: where the sender should start, plus an advisory note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferReply {
    /// Smallest chunk index the receiver does not yet hold.
    #[serde(default)]
    pub next_chunk: u32,
    /// Free-form human-readable status. Never interpreted.
    #[serde(default)]
    pub message: String,
}

impl OfferReply {
    pub fn from_payload(payload: &[u8]) -> Result<Self, HandshakeError> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn to_payload(&self) -> Result<Bytes, HandshakeError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

/// `ceil(filesize / chunk_size)`.
pub fn chunk_count(filesize: u64, chunk_size: u32) -> u32 {
    filesize.div_ceil(chunk_size as u64) as u32
}

fn default_filename() -> String {
    FALLBACK_FILENAME.to_string()
}

fn default_chunk_size() -> u32 {
    DEFAULT_CHUNK_SIZE
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("malformed handshake document: {0}")]
    Json(#[from] serde_json::Error),
}
