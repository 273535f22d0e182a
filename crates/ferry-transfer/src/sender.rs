//! Sender endpoint — drives one file through handshake, stop-and-wait
//! data exchange, and termination.
//!
//! Each exchange transmits a packet and waits for its matching reply
//! within the current retransmission timeout. Corrupt or unexpected
//! traffic is discarded without touching the pending deadline: the retry
//! counter is bounded by wall-clock patience, not by event count.

use std::io::SeekFrom;
use std::net::SocketAddr;
use std::path::Path;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::net::UdpSocket;
use tokio::time::timeout;

use ferry_core::handshake::{chunk_count, HandshakeError, DEFAULT_CHUNK_SIZE};
use ferry_core::identity::{self, IdentityError};
use ferry_core::rto::RtoEstimator;
use ferry_core::wire::{FLAG_EOF, FLAG_META_JSON, FLAG_RESUME};
use ferry_core::{OfferReply, Packet, PacketKind, TransferOffer, WireError};

#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub chunk_size: u32,
    /// Timeout applied until the first round trip is measured.
    pub rto_init: Duration,
    pub rto_min: Duration,
    pub rto_max: Duration,
    /// Retransmissions tolerated per exchange before giving up.
    pub max_retries: u32,
    /// Ask the receiver to continue an interrupted session.
    pub resume: bool,
}

impl Default for SenderConfig {
    fn default() -> Self {
        SenderConfig {
            chunk_size: DEFAULT_CHUNK_SIZE,
            rto_init: Duration::from_millis(300),
            rto_min: Duration::from_millis(100),
            rto_max: Duration::from_secs(2),
            max_retries: 50,
            resume: true,
        }
    }
}

/// What happened, for the caller's logs and exit code.
#[derive(Debug, Clone)]
pub struct TransferReport {
    pub file_id: u64,
    pub filesize: u64,
    pub total_chunks: u32,
    /// First chunk actually transmitted (nonzero on resume).
    pub resumed_from: u32,
    pub chunks_sent: u32,
    pub retransmissions: u32,
    pub elapsed: Duration,
    /// False when the receiver never confirmed the FIN; the data itself
    /// was still delivered and verified chunk by chunk.
    pub fin_acked: bool,
}

impl TransferReport {
    pub fn goodput_mib_s(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.filesize as f64 / secs / (1024.0 * 1024.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("retry budget exhausted after {retries} retransmissions waiting for {expected}")]
    RetryExhausted { expected: &'static str, retries: u32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Wire(#[from] WireError),
}

/// The reply a pending exchange is waiting for.
#[derive(Debug, Clone, Copy)]
enum Expect {
    SynAck,
    Ack(u32),
    FinAck,
}

impl Expect {
    fn matches(&self, pkt: &Packet) -> bool {
        match self {
            Expect::SynAck => pkt.kind == PacketKind::SynAck,
            Expect::Ack(chunk) => pkt.kind == PacketKind::Ack && pkt.ack == *chunk,
            Expect::FinAck => pkt.kind == PacketKind::FinAck,
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            Expect::SynAck => "SYN-ACK",
            Expect::Ack(_) => "ACK",
            Expect::FinAck => "FIN-ACK",
        }
    }
}

pub struct Sender {
    socket: UdpSocket,
    peer: SocketAddr,
    cfg: SenderConfig,
    rto: RtoEstimator,
    retransmissions: u32,
}

impl Sender {
    pub async fn connect(peer: SocketAddr, cfg: SenderConfig) -> Result<Self, SendError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let rto = RtoEstimator::new(cfg.rto_init, cfg.rto_min, cfg.rto_max);
        Ok(Sender {
            socket,
            peer,
            cfg,
            rto,
            retransmissions: 0,
        })
    }

    /// Transfer one file, returning a report on success.
    pub async fn send_file(&mut self, path: &Path) -> Result<TransferReport, SendError> {
        let digest = identity::sha256_file(path)?;
        let file_id = identity::file_id_from_digest(&digest)?;
        let filesize = std::fs::metadata(path)?.len();

        let offer = TransferOffer {
            filename: path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("upload.bin")
                .to_string(),
            filesize,
            chunk_size: self.cfg.chunk_size,
            sha256: digest,
        };

        tracing::info!(
            peer = %self.peer,
            file_id = format_args!("{file_id:016x}"),
            filename = %offer.filename,
            filesize,
            chunk_size = self.cfg.chunk_size,
            resume = self.cfg.resume,
            "opening transfer"
        );

        let flags = FLAG_META_JSON | if self.cfg.resume { FLAG_RESUME } else { 0 };
        let syn = Packet::syn(file_id, flags, offer.to_payload()?);
        let syn_ack = self.send_and_wait(&syn, Expect::SynAck, file_id).await?;

        // A reply we cannot parse means a fresh start, not a failure.
        let next_chunk = match OfferReply::from_payload(&syn_ack.payload) {
            Ok(reply) => {
                if !reply.message.is_empty() {
                    tracing::info!(message = %reply.message, next_chunk = reply.next_chunk, "receiver ready");
                }
                reply.next_chunk
            }
            Err(e) => {
                tracing::debug!(error = %e, "unparseable SYN-ACK payload, starting from chunk 0");
                0
            }
        };

        // An empty file still crosses the wire as one empty EOF chunk.
        let total_chunks = chunk_count(filesize, self.cfg.chunk_size).max(1);
        let first_chunk = next_chunk.min(total_chunks);
        let start = Instant::now();

        let mut file = tokio::fs::File::open(path).await?;
        if first_chunk > 0 {
            file.seek(SeekFrom::Start(
                first_chunk as u64 * self.cfg.chunk_size as u64,
            ))
            .await?;
        }

        let mut chunks_sent = 0u32;
        for chunk_id in first_chunk..total_chunks {
            let payload = read_chunk(&mut file, self.cfg.chunk_size as usize).await?;
            let eof = chunk_id + 1 == total_chunks;
            let data = Packet::data(file_id, chunk_id, if eof { FLAG_EOF } else { 0 }, payload);

            self.send_and_wait(&data, Expect::Ack(chunk_id), file_id).await?;
            chunks_sent += 1;

            if chunk_id % 200 == 0 || eof {
                let done = (chunk_id + 1) as u64 * self.cfg.chunk_size as u64;
                let pct = done.min(filesize) as f64 / filesize.max(1) as f64 * 100.0;
                tracing::debug!(
                    chunk_id,
                    total = total_chunks,
                    progress = format_args!("{pct:.1}%"),
                    rto_ms = self.rto.current().as_millis() as u64,
                    "chunk acknowledged"
                );
            }
        }

        let fin = Packet::fin(file_id, total_chunks);
        let fin_acked = match self.send_and_wait(&fin, Expect::FinAck, file_id).await {
            Ok(_) => true,
            Err(SendError::RetryExhausted { retries, .. }) => {
                // Every chunk was individually acknowledged; only the
                // goodbye was lost.
                tracing::warn!(retries, "no FIN-ACK before the retry budget ran out");
                false
            }
            Err(e) => return Err(e),
        };

        let report = TransferReport {
            file_id,
            filesize,
            total_chunks,
            resumed_from: first_chunk,
            chunks_sent,
            retransmissions: self.retransmissions,
            elapsed: start.elapsed(),
            fin_acked,
        };
        tracing::info!(
            chunks_sent = report.chunks_sent,
            retransmissions = report.retransmissions,
            elapsed_ms = report.elapsed.as_millis() as u64,
            goodput_mib_s = format_args!("{:.2}", report.goodput_mib_s()),
            "transfer complete"
        );
        Ok(report)
    }

    /// One stop-and-wait exchange.
    ///
    /// Transmits `pkt` and waits for a reply matching `expect` within the
    /// current RTO, measured from the transmit instant. A timeout
    /// retransmits and counts against the retry budget; anything received
    /// that does not match is dropped and the original deadline keeps
    /// running. The round trip is sampled into the RTO estimate only when
    /// the exchange needed no retransmission.
    async fn send_and_wait(
        &mut self,
        pkt: &Packet,
        expect: Expect,
        file_id: u64,
    ) -> Result<Packet, SendError> {
        let wire = pkt.encode()?;
        let mut buf = vec![0u8; 65536];
        let mut retries = 0u32;

        loop {
            self.socket.send_to(&wire, self.peer).await?;
            let sent_at = Instant::now();
            let deadline = sent_at + self.rto.current();

            'window: loop {
                let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                    break 'window;
                };
                let received = match timeout(remaining, self.socket.recv_from(&mut buf)).await {
                    Err(_) => break 'window,
                    Ok(Err(e)) => return Err(e.into()),
                    Ok(Ok((len, _from))) => len,
                };

                let resp = match Packet::decode(&buf[..received]) {
                    Ok(resp) => resp,
                    Err(e) => {
                        tracing::trace!(error = %e, "corrupt reply discarded");
                        continue 'window;
                    }
                };
                if resp.file_id != file_id {
                    tracing::trace!(
                        got = format_args!("{:016x}", resp.file_id),
                        "reply for a different session discarded"
                    );
                    continue 'window;
                }
                if !expect.matches(&resp) {
                    tracing::trace!(kind = ?resp.kind, ack = resp.ack, "unexpected reply discarded");
                    continue 'window;
                }

                if retries == 0 {
                    self.rto.sample(sent_at.elapsed());
                }
                return Ok(resp);
            }

            retries += 1;
            if retries > self.cfg.max_retries {
                return Err(SendError::RetryExhausted {
                    expected: expect.describe(),
                    retries: retries - 1,
                });
            }
            self.retransmissions += 1;
            tracing::debug!(
                seq = pkt.seq,
                retries,
                rto_ms = self.rto.current().as_millis() as u64,
                "timeout, retransmitting"
            );
        }
    }
}

/// Read up to `chunk_size` bytes from the current position. Short only at
/// end of file.
async fn read_chunk(file: &mut tokio::fs::File, chunk_size: usize) -> std::io::Result<Bytes> {
    let mut buf = vec![0u8; chunk_size];
    let mut filled = 0;
    while filled < chunk_size {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(Bytes::from(buf))
}
