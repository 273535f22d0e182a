//! ferry-transfer — the two endpoints of the transfer protocol and the
//! receiver's persistence layer.
//!
//! [`Sender`] pushes one file through handshake, stop-and-wait data
//! exchange, and termination. [`Receiver`] serves any number of sessions
//! on one socket, persisting progress after every accepted chunk so an
//! interrupted transfer can resume.

pub mod receiver;
pub mod sender;
pub mod session;
pub mod store;

pub use receiver::{Receiver, ReceiverConfig};
pub use sender::{SendError, Sender, SenderConfig, TransferReport};
pub use session::{new_session_table, SessionTable};
pub use store::{FinalizeOutcome, SessionMeta, SessionStore};
