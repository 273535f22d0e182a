//! On-disk session state — the partial file and its metadata sidecar.
//!
//! Each in-flight session leaves two artifacts in the output directory:
//! `<filename>.part` (append-only prefix of the file) and
//! `<filename>.rdtmeta.json` (a human-readable mirror of the session
//! record). Finalization renames the part over the final name and then
//! deletes the sidecar; a crash between the two steps leaves a completed
//! file plus a stale sidecar, which the next startup ignores because no
//! `.part` remains.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use ferry_core::identity::sha256_file;
use ferry_core::TransferOffer;

/// Suffix of the append-only partial file.
pub const PART_SUFFIX: &str = ".part";

/// Suffix of the metadata sidecar.
pub const META_SUFFIX: &str = ".rdtmeta.json";

/// One receiver-side session record, exactly as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub filename: String,
    pub file_id: u64,
    pub filesize: u64,
    pub chunk_size: u32,
    pub sha256: String,
    /// Smallest chunk index not yet written to the partial file.
    pub next_chunk: u32,
    /// Wall-clock seconds since the epoch at the last accepted chunk.
    pub updated_at: f64,
}

impl SessionMeta {
    /// A fresh record for an incoming offer, starting at chunk zero.
    pub fn from_offer(offer: &TransferOffer, file_id: u64) -> Self {
        SessionMeta {
            filename: offer.leaf_filename().to_string(),
            file_id,
            filesize: offer.filesize,
            chunk_size: offer.chunk_size,
            sha256: offer.sha256.clone(),
            next_chunk: 0,
            updated_at: unix_now(),
        }
    }

    /// Does this record describe the same transfer as `offer`?
    ///
    /// Identity is the full tuple: a changed hash, size, or chunking unit
    /// means the bytes on disk cannot be a prefix of the offered file.
    pub fn matches_offer(&self, offer: &TransferOffer, file_id: u64) -> bool {
        self.file_id == file_id
            && self.sha256 == offer.sha256
            && self.chunk_size == offer.chunk_size
            && self.filesize == offer.filesize
    }

    pub fn touch(&mut self) {
        self.updated_at = unix_now();
    }
}

/// Wall clock as float seconds, the sidecar's timestamp format.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Outcome of a finalization attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FinalizeOutcome {
    /// The part was verified and renamed to its final name.
    Completed(PathBuf),
    /// Not all bytes have arrived yet; nothing was changed.
    Incomplete,
    /// All bytes arrived but the content hash disagrees with the offer.
    /// The part and sidecar are retained so a re-run can heal the file.
    HashMismatch { expected: String, computed: String },
}

/// Owner of the output directory and the per-session artifacts inside it.
pub struct SessionStore {
    out_dir: PathBuf,
}

impl SessionStore {
    pub fn open(out_dir: impl Into<PathBuf>) -> Result<Self> {
        let out_dir = out_dir.into();
        std::fs::create_dir_all(&out_dir)
            .with_context(|| format!("failed to create output directory {}", out_dir.display()))?;
        Ok(SessionStore { out_dir })
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub fn part_path(&self, filename: &str) -> PathBuf {
        self.out_dir.join(format!("{filename}{PART_SUFFIX}"))
    }

    pub fn meta_path(&self, filename: &str) -> PathBuf {
        self.out_dir.join(format!("{filename}{META_SUFFIX}"))
    }

    pub fn final_path(&self, filename: &str) -> PathBuf {
        self.out_dir.join(filename)
    }

    /// Read the persisted record for `filename`. Missing or unreadable
    /// sidecars both count as "no prior session".
    pub fn load_meta(&self, filename: &str) -> Option<SessionMeta> {
        let path = self.meta_path(filename);
        let text = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&text) {
            Ok(meta) => Some(meta),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable session sidecar");
                None
            }
        }
    }

    /// Rewrite the sidecar in full, indented for human inspection.
    pub fn save_meta(&self, meta: &SessionMeta) -> Result<()> {
        let path = self.meta_path(&meta.filename);
        let text = serde_json::to_string_pretty(meta).context("failed to serialize session meta")?;
        std::fs::write(&path, text)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn remove_meta(&self, filename: &str) {
        let _ = std::fs::remove_file(self.meta_path(filename));
    }

    /// Size of the partial file, if one exists.
    pub fn part_size(&self, filename: &str) -> Option<u64> {
        std::fs::metadata(self.part_path(filename)).ok().map(|m| m.len())
    }

    /// Append one accepted chunk to the partial file, creating it on first
    /// write. The single recv loop is the only writer.
    pub fn append_chunk(&self, filename: &str, payload: &[u8]) -> Result<()> {
        use std::io::Write;
        let path = self.part_path(filename);
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        file.write_all(payload)
            .with_context(|| format!("failed to append to {}", path.display()))?;
        Ok(())
    }

    /// Move a file out of the way under a timestamped name, returning the
    /// backup path.
    pub fn backup_aside(&self, path: &Path) -> Result<PathBuf> {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("orphan");
        let backup = path.with_file_name(format!("{name}.bak_{secs}"));
        std::fs::rename(path, &backup)
            .with_context(|| format!("failed to back up {}", path.display()))?;
        tracing::info!(from = %path.display(), to = %backup.display(), "moved stale file aside");
        Ok(backup)
    }

    /// Verify and promote a completed partial file.
    ///
    /// Preconditions checked here: the part exists and holds at least
    /// `filesize` bytes. On a hash match the promotion is a rename (any
    /// previous file under the final name is backed up first) followed by
    /// sidecar removal, in that order.
    pub fn finalize(&self, meta: &SessionMeta) -> Result<FinalizeOutcome> {
        let part = self.part_path(&meta.filename);
        let Some(size) = self.part_size(&meta.filename) else {
            return Ok(FinalizeOutcome::Incomplete);
        };
        if size < meta.filesize {
            return Ok(FinalizeOutcome::Incomplete);
        }

        let computed = sha256_file(&part)
            .with_context(|| format!("failed to hash {}", part.display()))?;
        if !meta.sha256.is_empty() && computed != meta.sha256 {
            return Ok(FinalizeOutcome::HashMismatch {
                expected: meta.sha256.clone(),
                computed,
            });
        }

        let target = self.final_path(&meta.filename);
        if target.exists() {
            self.backup_aside(&target)?;
        }
        std::fs::rename(&part, &target)
            .with_context(|| format!("failed to promote {}", part.display()))?;
        self.remove_meta(&meta.filename);

        tracing::info!(path = %target.display(), bytes = meta.filesize, "file received and verified");
        Ok(FinalizeOutcome::Completed(target))
    }
}
