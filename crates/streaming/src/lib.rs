//! GarlicNet streaming
//!
//! A TCP-like reliable, ordered byte stream multiplexed inside a
//! destination and carried as garlic-wrapped data-protocol messages:
//! packet codec, per-stream state machine (window, RTT/RTO, NACKs,
//! SYN/FIN/RESET) and the stream table of one destination.

pub mod destination;
pub mod packet;
pub mod stream;

use thiserror::Error;

pub use destination::{
    unwrap_data_protocol, wrap_data_protocol, StreamingDestination, StreamingEvent,
    MAX_DATA_SIZE, PROTOCOL_DATAGRAM, PROTOCOL_RAW, PROTOCOL_STREAMING,
};
pub use packet::{Packet, PacketFlags};
pub use stream::{
    Stream, StreamStatus, DELAYED_ACK_MS, INITIAL_RTO_MS, MAX_RESEND_ATTEMPTS, MAX_WINDOW_SIZE,
    MIN_WINDOW_SIZE, STREAMING_MTU, WINDOW_SIZE,
};

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Malformed streaming packet: {0}")]
    MalformedPacket(&'static str),

    #[error("Bad packet signature")]
    BadSignature,

    #[error("Stream is closed")]
    StreamClosed,

    #[error("Decompressed payload too large: {0} bytes")]
    OversizePayload(usize),

    #[error(transparent)]
    Core(#[from] garlicnet_core::CoreError),
}

pub type Result<T> = std::result::Result<T, StreamError>;
