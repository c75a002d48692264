//! GarlicNet garlic layer
//!
//! End-to-end encryption between destinations: the
//! ECIES-X25519-AEAD-Ratchet session with its forward-secret tagsets, the
//! payload block framing carrying cloves, and the per-destination session
//! owner with the incoming tag index.

pub mod blocks;
pub mod ratchet;
pub mod service;
pub mod session;

use thiserror::Error;

pub use blocks::{parse_blocks, serialize_blocks, CloveDelivery, GarlicBlock};
pub use ratchet::{RatchetTagSet, SessionTag, OLD_TAGSET_GRACE_MS, TAGSET_LOOKAHEAD};
pub use service::{wrap_router_garlic, GarlicIncoming, GarlicService, RouterIncomingSession};
pub use session::{RatchetSession, TagPointer, SESSION_EXPIRATION_MS};

#[derive(Error, Debug)]
pub enum GarlicError {
    #[error("Malformed garlic frame: {0}")]
    MalformedFrame(&'static str),

    #[error("Malformed payload block: {0}")]
    MalformedBlock(&'static str),

    #[error("No session for this peer")]
    NoSession,

    #[error("Session tag already consumed")]
    TagConsumed,

    #[error(transparent)]
    Aead(#[from] garlicnet_crypto::AeadError),

    #[error(transparent)]
    Core(#[from] garlicnet_core::CoreError),
}

pub type Result<T> = std::result::Result<T, GarlicError>;
