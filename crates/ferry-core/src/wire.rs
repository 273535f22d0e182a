//! Ferry wire format — the on-wire datagram carried over UDP.
//!
//! These types ARE the protocol. Every datagram is a fixed 32-byte header
//! followed by up to [`MAX_PAYLOAD`] payload bytes. All integer fields are
//! big-endian, and the whole datagram is covered by a CRC32 computed with
//! the checksum field zeroed. Changing anything here is a breaking change.
//!
//! The header is a #[repr(C)] zerocopy view for deterministic layout and
//! allocation-free parsing. There is no unsafe code in this module.

use bytes::{Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Leading two bytes of every ferry datagram.
pub const MAGIC: [u8; 2] = [0xCA, 0xFE];

/// Current wire format version.
pub const WIRE_VERSION: u8 = 1;

/// Fixed header length in bytes. Carried on the wire in the `hlen` field so
/// a receiver can reject datagrams framed for a different layout.
pub const HEADER_LEN: usize = 32;

/// Maximum payload size: a 65535-byte UDP datagram minus the header.
pub const MAX_PAYLOAD: usize = 65535 - HEADER_LEN;

// Flag bits. The flags byte is a bitmask; undefined bits are ignored.

/// SYN: the sender wants to continue an interrupted transfer.
pub const FLAG_RESUME: u8 = 0x01;
/// DATA: this is the final chunk of the file.
pub const FLAG_EOF: u8 = 0x02;
/// SYN-ACK: the resume request was honored.
pub const FLAG_RESUME_OK: u8 = 0x04;
/// The payload is a UTF-8 JSON document.
pub const FLAG_META_JSON: u8 = 0x08;

// ── Packet kinds ──────────────────────────────────────────────────────────────

/// The seven datagram types of the transfer protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    /// Opens a session; carries the transfer offer when META-JSON is set.
    Syn = 1,
    /// Answers a SYN; carries the offer reply (`next_chunk`).
    SynAck = 2,
    /// One chunk of file content. `seq == chunk_id` under stop-and-wait.
    Data = 3,
    /// Acknowledges the chunk named in `ack`.
    Ack = 4,
    /// The sender is done; `seq` is the total chunk count.
    Fin = 5,
    /// Answers a FIN; `ack` echoes the FIN's `seq`.
    FinAck = 6,
    /// Advisory error report. Best-effort, never required for progress.
    Err = 7,
}

impl TryFrom<u8> for PacketKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketKind::Syn),
            2 => Ok(PacketKind::SynAck),
            3 => Ok(PacketKind::Data),
            4 => Ok(PacketKind::Ack),
            5 => Ok(PacketKind::Fin),
            6 => Ok(PacketKind::FinAck),
            7 => Ok(PacketKind::Err),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

// ── Header ────────────────────────────────────────────────────────────────────

/// Raw 32-byte header, exactly as it appears on the wire.
///
/// `file_id` sits at byte offset 6; the link emulator depends on that offset
/// for reverse routing (see [`peek_file_id`]).
#[derive(Debug, Clone, FromZeroes, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
struct WireHeader {
    magic: [u8; 2],
    version: u8,
    kind: u8,
    flags: u8,
    hlen: u8,
    file_id: U64<BigEndian>,
    seq: U32<BigEndian>,
    ack: U32<BigEndian>,
    chunk_id: U32<BigEndian>,
    payload_len: U16<BigEndian>,
    checksum: U32<BigEndian>,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(WireHeader, [u8; 32]);

/// Byte offset of `file_id` within the header. Relays route on this.
pub const FILE_ID_OFFSET: usize = 6;

// ── Packet ────────────────────────────────────────────────────────────────────

/// A decoded (or to-be-encoded) protocol datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketKind,
    pub flags: u8,
    pub file_id: u64,
    pub seq: u32,
    pub ack: u32,
    pub chunk_id: u32,
    pub payload: Bytes,
}

impl Packet {
    /// SYN opening a session. `payload` is the transfer offer document.
    pub fn syn(file_id: u64, flags: u8, payload: Bytes) -> Self {
        Packet {
            kind: PacketKind::Syn,
            flags,
            file_id,
            seq: 0,
            ack: 0,
            chunk_id: 0,
            payload,
        }
    }

    /// SYN-ACK answering a SYN. `payload` is the offer reply document.
    pub fn syn_ack(file_id: u64, flags: u8, payload: Bytes) -> Self {
        Packet {
            kind: PacketKind::SynAck,
            flags,
            file_id,
            seq: 0,
            ack: 0,
            chunk_id: 0,
            payload,
        }
    }

    /// DATA carrying one chunk. Stop-and-wait keeps `seq == chunk_id`.
    pub fn data(file_id: u64, chunk_id: u32, flags: u8, payload: Bytes) -> Self {
        Packet {
            kind: PacketKind::Data,
            flags,
            file_id,
            seq: chunk_id,
            ack: 0,
            chunk_id,
            payload,
        }
    }

    /// ACK for `chunk`, the newest in-order chunk held by the receiver.
    pub fn ack(file_id: u64, chunk: u32) -> Self {
        Packet {
            kind: PacketKind::Ack,
            flags: 0,
            file_id,
            seq: 0,
            ack: chunk,
            chunk_id: chunk,
            payload: Bytes::new(),
        }
    }

    /// FIN closing the stream. `seq` is the total chunk count.
    pub fn fin(file_id: u64, seq: u32) -> Self {
        Packet {
            kind: PacketKind::Fin,
            flags: 0,
            file_id,
            seq,
            ack: 0,
            chunk_id: seq,
            payload: Bytes::new(),
        }
    }

    /// FIN-ACK echoing the FIN's `seq` in `ack`.
    pub fn fin_ack(file_id: u64, ack: u32) -> Self {
        Packet {
            kind: PacketKind::FinAck,
            flags: 0,
            file_id,
            seq: 0,
            ack,
            chunk_id: 0,
            payload: Bytes::new(),
        }
    }

    /// Advisory ERR with a short diagnostic payload.
    pub fn err(file_id: u64, payload: Bytes) -> Self {
        Packet {
            kind: PacketKind::Err,
            flags: 0,
            file_id,
            seq: 0,
            ack: 0,
            chunk_id: 0,
            payload,
        }
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    /// Serialize to wire bytes: header with zeroed checksum, CRC32 over
    /// header‖payload, checksum written back into the header.
    pub fn encode(&self) -> Result<Bytes, WireError> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(WireError::PayloadTooLarge(self.payload.len()));
        }

        let mut header = WireHeader {
            magic: MAGIC,
            version: WIRE_VERSION,
            kind: self.kind as u8,
            flags: self.flags,
            hlen: HEADER_LEN as u8,
            file_id: U64::new(self.file_id),
            seq: U32::new(self.seq),
            ack: U32::new(self.ack),
            chunk_id: U32::new(self.chunk_id),
            payload_len: U16::new(self.payload.len() as u16),
            checksum: U32::new(0),
        };
        header.checksum = U32::new(checksum(&header, &self.payload));

        let mut out = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&self.payload);
        Ok(out.freeze())
    }

    /// Parse and verify a datagram.
    ///
    /// A declared `payload_len` reaching past the end of the buffer is
    /// truncated to what is actually present; the CRC check then rejects the
    /// datagram as corrupt. Bytes after the declared payload are ignored.
    pub fn decode(buf: &[u8]) -> Result<Packet, WireError> {
        let header = WireHeader::read_from_prefix(buf).ok_or(WireError::Truncated(buf.len()))?;

        if header.magic != MAGIC {
            return Err(WireError::BadMagic);
        }
        if header.version != WIRE_VERSION {
            return Err(WireError::BadVersion(header.version));
        }
        if header.hlen as usize != HEADER_LEN {
            return Err(WireError::BadHeaderLen(header.hlen));
        }

        let declared = header.payload_len.get() as usize;
        let available = buf.len() - HEADER_LEN;
        let payload = &buf[HEADER_LEN..HEADER_LEN + declared.min(available)];

        let expected = header.checksum.get();
        let mut zeroed = header.clone();
        zeroed.checksum = U32::new(0);
        let computed = checksum(&zeroed, payload);
        if computed != expected {
            return Err(WireError::ChecksumMismatch { expected, computed });
        }

        Ok(Packet {
            kind: PacketKind::try_from(header.kind)?,
            flags: header.flags,
            file_id: header.file_id.get(),
            seq: header.seq.get(),
            ack: header.ack.get(),
            chunk_id: header.chunk_id.get(),
            payload: Bytes::copy_from_slice(payload),
        })
    }
}

/// CRC32 (IEEE) over the zero-checksum header concatenated with the payload.
fn checksum(header: &WireHeader, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(header.as_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// Extract the session identifier from a raw datagram without full decoding.
///
/// Returns `None` for datagrams shorter than one header or whose magic does
/// not match. This is all the protocol knowledge a relay needs: the
/// `file_id` lives at a fixed offset and identifies the session in both
/// directions.
pub fn peek_file_id(datagram: &[u8]) -> Option<u64> {
    let header = WireHeader::read_from_prefix(datagram)?;
    if header.magic != MAGIC {
        return None;
    }
    Some(header.file_id.get())
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("datagram too short: {0} bytes")]
    Truncated(usize),

    #[error("bad magic")]
    BadMagic,

    #[error("unsupported wire version: 0x{0:02x}")]
    BadVersion(u8),

    #[error("unexpected header length: {0}")]
    BadHeaderLen(u8),

    #[error("unknown packet type: 0x{0:02x}")]
    UnknownKind(u8),

    #[error("checksum mismatch: header says 0x{expected:08x}, computed 0x{computed:08x}")]
    ChecksumMismatch { expected: u32, computed: u32 },

    #[error("payload length {0} exceeds maximum {}", MAX_PAYLOAD)]
    PayloadTooLarge(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
