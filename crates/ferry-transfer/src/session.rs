//! Receiver session table and the adopt-or-reset rule.
//!
//! One record per `file_id`. A session survives receiver restarts through
//! the on-disk sidecar; this module decides, on each SYN, whether the
//! persisted state may be adopted (resume) or must be discarded (fresh
//! start).

use std::sync::Arc;

use anyhow::Result;
use dashmap::DashMap;

use ferry_core::TransferOffer;

use crate::store::{SessionMeta, SessionStore};

/// The session table — shared between the recv loop and any inspector.
pub type SessionTable = Arc<DashMap<u64, SessionMeta>>;

pub fn new_session_table() -> SessionTable {
    Arc::new(DashMap::new())
}

/// Create or revive the session for an incoming offer and persist it.
///
/// Adoption requires all of: the sender asked to resume, the persisted
/// record matches the offer's full identity tuple, and a partial file is
/// actually on disk. The partial file's size is authoritative for
/// `next_chunk` — stop-and-wait never leaves holes, so
/// `floor(part_size / chunk_size)` is exactly the number of whole chunks
/// held. Every other case starts fresh at chunk zero, moving any stale
/// partial file aside first.
pub fn open_session(
    store: &SessionStore,
    offer: &TransferOffer,
    file_id: u64,
    resume: bool,
) -> Result<SessionMeta> {
    let filename = offer.leaf_filename();

    if resume {
        if let Some(prior) = store.load_meta(filename) {
            if prior.matches_offer(offer, file_id) {
                if let Some(part_size) = store.part_size(filename) {
                    let mut meta = prior;
                    let derived = (part_size / meta.chunk_size as u64) as u32;
                    if derived != meta.next_chunk {
                        tracing::warn!(
                            filename,
                            recorded = meta.next_chunk,
                            derived,
                            "sidecar and partial file disagree; trusting the file"
                        );
                    }
                    meta.next_chunk = derived;
                    meta.touch();
                    store.save_meta(&meta)?;
                    return Ok(meta);
                }
                // Sidecar without a partial file: a finalization completed
                // (or the part was removed); nothing to resume from.
                tracing::info!(filename, "stale sidecar without partial file, starting fresh");
            } else {
                tracing::info!(filename, "offer does not match persisted session, starting fresh");
            }
        }
    }

    if store.part_path(filename).exists() {
        store.backup_aside(&store.part_path(filename))?;
    }
    let meta = SessionMeta::from_offer(offer, file_id);
    store.save_meta(&meta)?;
    Ok(meta)
}
