//! ferry-core — wire format, handshake documents, session identity, and
//! timeout estimation. Pure protocol: no sockets, no event loops.
//! All other ferry crates depend on this one.

pub mod handshake;
pub mod identity;
pub mod rto;
pub mod wire;

pub use handshake::{OfferReply, TransferOffer};
pub use wire::{Packet, PacketKind, WireError};
