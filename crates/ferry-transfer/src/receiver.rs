//! Receiver endpoint — one UDP socket serving any number of sessions.
//!
//! A single recv loop demultiplexes on `file_id`. Stop-and-wait keeps the
//! acceptance rule tiny: a DATA chunk is written only when it is exactly
//! the next expected one; everything else is answered with an ACK for the
//! newest in-order chunk, which is what tells the sender to retransmit or
//! move on.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use ferry_core::wire::{FLAG_EOF, FLAG_META_JSON, FLAG_RESUME, FLAG_RESUME_OK};
use ferry_core::{OfferReply, Packet, PacketKind, TransferOffer};

use crate::session::{new_session_table, open_session, SessionTable};
use crate::store::{FinalizeOutcome, SessionMeta, SessionStore};

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Address and port to serve on. Port 0 asks the OS for one.
    pub bind: SocketAddr,
    /// Where delivered files (and in-flight session state) live.
    pub out_dir: PathBuf,
}

pub struct Receiver {
    socket: Arc<UdpSocket>,
    store: SessionStore,
    sessions: SessionTable,
}

impl Receiver {
    pub async fn bind(cfg: ReceiverConfig) -> Result<Self> {
        let socket = UdpSocket::bind(cfg.bind)
            .await
            .with_context(|| format!("failed to bind {}", cfg.bind))?;
        let store = SessionStore::open(&cfg.out_dir)?;
        tracing::info!(
            addr = %socket.local_addr()?,
            out_dir = %cfg.out_dir.display(),
            "receiver listening"
        );
        Ok(Receiver {
            socket: Arc::new(socket),
            store,
            sessions: new_session_table(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Handle on the live session table, for inspection from outside the
    /// recv loop.
    pub fn sessions(&self) -> SessionTable {
        self.sessions.clone()
    }

    /// Serve until the shutdown channel fires.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut buf = vec![0u8; 65536];
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("receiver shutting down");
                    return Ok(());
                }

                result = self.socket.recv_from(&mut buf) => {
                    let (len, addr) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "recv_from failed");
                            continue;
                        }
                    };
                    self.handle_datagram(&buf[..len], addr).await;
                }
            }
        }
    }

    async fn handle_datagram(&self, data: &[u8], addr: SocketAddr) {
        let pkt = match Packet::decode(data) {
            Ok(pkt) => pkt,
            Err(e) => {
                tracing::debug!(%addr, error = %e, "corrupt datagram");
                self.send(Packet::err(0, Bytes::from_static(b"bad checksum")), addr)
                    .await;
                return;
            }
        };

        match pkt.kind {
            PacketKind::Syn => self.handle_syn(pkt, addr).await,
            PacketKind::Data => self.handle_data(pkt, addr).await,
            PacketKind::Fin => self.handle_fin(pkt, addr).await,
            other => {
                tracing::trace!(%addr, kind = ?other, "ignoring packet");
            }
        }
    }

    async fn handle_syn(&self, pkt: Packet, addr: SocketAddr) {
        if !pkt.has_flag(FLAG_META_JSON) {
            // No offer document: nothing to build a session from. Tell the
            // sender to start over from zero once it sends one.
            let reply = OfferReply {
                next_chunk: 0,
                message: "transfer offer missing, starting from chunk 0".into(),
            };
            if let Ok(payload) = reply.to_payload() {
                self.send(Packet::syn_ack(pkt.file_id, 0, payload), addr).await;
            }
            return;
        }

        let offer = match TransferOffer::from_payload(&pkt.payload) {
            Ok(offer) => offer,
            Err(e) => {
                tracing::warn!(%addr, error = %e, "dropping SYN with malformed offer");
                return;
            }
        };
        if offer.chunk_size == 0 {
            tracing::warn!(%addr, "dropping SYN with zero chunk size");
            return;
        }

        let file_id = pkt.file_id;
        let resume = pkt.has_flag(FLAG_RESUME);
        let meta = match open_session(&self.store, &offer, file_id, resume) {
            Ok(meta) => meta,
            Err(e) => {
                tracing::error!(%addr, error = %e, "failed to open session");
                return;
            }
        };

        tracing::info!(
            %addr,
            file_id = format_args!("{file_id:016x}"),
            filename = %meta.filename,
            filesize = meta.filesize,
            next_chunk = meta.next_chunk,
            resume,
            "session open"
        );

        let reply = OfferReply {
            next_chunk: meta.next_chunk,
            message: if resume {
                format!("resuming from chunk {}", meta.next_chunk)
            } else {
                "fresh transfer ready".into()
            },
        };
        self.sessions.insert(file_id, meta);

        let flags = FLAG_META_JSON | if resume { FLAG_RESUME_OK } else { 0 };
        match reply.to_payload() {
            Ok(payload) => {
                self.send(Packet::syn_ack(file_id, flags, payload), addr).await;
            }
            Err(e) => tracing::warn!(error = %e, "failed to encode offer reply"),
        }
    }

    async fn handle_data(&self, pkt: Packet, addr: SocketAddr) {
        let file_id = pkt.file_id;
        let Some((expected, filename)) = self
            .sessions
            .get(&file_id)
            .map(|entry| (entry.next_chunk, entry.filename.clone()))
        else {
            tracing::warn!(%addr, file_id = format_args!("{file_id:016x}"), "DATA without a session, ignoring");
            return;
        };

        if pkt.chunk_id != expected || pkt.seq != expected {
            // Duplicate or out-of-order: re-acknowledge the newest in-order
            // chunk, write nothing.
            tracing::trace!(
                chunk_id = pkt.chunk_id,
                expected,
                "out-of-sequence DATA, re-acking"
            );
            self.send(Packet::ack(file_id, expected.saturating_sub(1)), addr)
                .await;
            return;
        }

        if let Err(e) = self.store.append_chunk(&filename, &pkt.payload) {
            // Local I/O trouble is fatal for progress: withhold the ACK so
            // the sender keeps the chunk.
            tracing::error!(filename = %filename, error = %e, "failed to persist chunk");
            return;
        }

        let meta = {
            let Some(mut entry) = self.sessions.get_mut(&file_id) else {
                return;
            };
            entry.next_chunk = expected + 1;
            entry.touch();
            entry.clone()
        };
        if let Err(e) = self.store.save_meta(&meta) {
            tracing::warn!(filename = %meta.filename, error = %e, "failed to update session sidecar");
        }

        tracing::debug!(
            filename = %meta.filename,
            chunk_id = pkt.chunk_id,
            payload_len = pkt.payload.len(),
            "chunk accepted"
        );
        self.send(Packet::ack(file_id, expected), addr).await;

        if pkt.has_flag(FLAG_EOF) {
            self.finalize(&meta);
        }
    }

    async fn handle_fin(&self, pkt: Packet, addr: SocketAddr) {
        let file_id = pkt.file_id;
        if let Some(meta) = self.sessions.get(&file_id).map(|entry| entry.clone()) {
            self.finalize(&meta);
        }
        // FIN-ACK is never withheld: the sender is entitled to terminate
        // whether or not finalization succeeded.
        self.send(Packet::fin_ack(file_id, pkt.seq), addr).await;
    }

    fn finalize(&self, meta: &SessionMeta) {
        match self.store.finalize(meta) {
            Ok(FinalizeOutcome::Completed(_)) => {}
            Ok(FinalizeOutcome::Incomplete) => {
                tracing::debug!(filename = %meta.filename, "not complete yet");
            }
            Ok(FinalizeOutcome::HashMismatch { expected, computed }) => {
                tracing::warn!(
                    filename = %meta.filename,
                    expected,
                    computed,
                    "content hash mismatch, keeping partial file"
                );
            }
            Err(e) => {
                tracing::error!(filename = %meta.filename, error = %e, "finalization failed");
            }
        }
    }

    async fn send(&self, pkt: Packet, addr: SocketAddr) {
        let bytes = match pkt.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode reply");
                return;
            }
        };
        if let Err(e) = self.socket.send_to(&bytes, addr).await {
            tracing::warn!(%addr, error = %e, "failed to send reply");
        }
    }
}
