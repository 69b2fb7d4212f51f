//! UNIX-Domain-Socket Transport
//!
//! Plumbing between the service core and its IPC clients:
//!
//! - [`message`] - wire message ids and typed packet bodies
//! - [`codec`] - length-prefixed frame codec for tokio streams
//! - [`session`] - per-client [`Session`] handles and the [`SessionRegistry`]
//!
//! # Framing
//!
//! Every packet on the wire is `u32 body-length (LE) | u32 message-id (LE) |
//! body bytes`, with the body encoded as JSON. Report bodies always place the
//! registration id before the event payload; clients rely on that field order.
//!
//! # Session lifetime
//!
//! A [`Session`] is created when a connection is accepted and removed when the
//! connection closes. The registry owns the only strong reference shared with
//! the core; pipeline state keys off the session fd and resolves a live
//! session at delivery time, so a disappeared client is a lookup miss, never a
//! dangling pointer.

use thiserror::Error;

pub mod codec;
pub mod message;
pub mod session;

pub use codec::PacketCodec;
pub use message::{MessageId, Packet};
pub use session::{Session, SessionRegistry};

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Transport error types.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Frame exceeds the wire size bound
    #[error("Packet body too large: {0} bytes (max: {1})")]
    BodyTooLarge(usize, usize),

    /// Message id not known to this protocol revision
    #[error("Unknown message id: 0x{0:04X}")]
    UnknownMessage(u32),

    /// Body failed to encode or decode
    #[error("Packet body codec error: {0}")]
    Body(#[from] serde_json::Error),

    /// Session table is at capacity
    #[error("Session limit reached: {0}")]
    SessionLimit(usize),

    /// A session with this fd is already registered
    #[error("Duplicate session fd: {0}")]
    DuplicateSession(i32),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
