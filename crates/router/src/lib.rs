//! GarlicNet router
//!
//! The node wiring: the router context (our identity and reachability),
//! local destinations (pool + garlic + streaming + lease set publication),
//! the transports boundary, and the event loop tying the netdb, tunnel and
//! garlic subsystems together. Startup order is context, netdb, tunnels,
//! destinations; teardown is the reverse.

pub mod context;
pub mod destination;
pub mod node;
pub mod transports;

use thiserror::Error;

pub use context::{Reachability, RouterContext};
pub use destination::{DestinationEvent, LocalDestination};
pub use node::{spawn_node, NodeCommand, NodeHandle, RouterCore};
pub use transports::{SimTransports, Transports, MAX_PEER_QUEUE};

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Unknown stream {0}")]
    UnknownStream(u32),

    #[error("Garlic error: {0}")]
    Garlic(String),

    #[error("Streaming error: {0}")]
    Streaming(String),

    #[error("No tunnel available")]
    NoTunnel,

    #[error(transparent)]
    Core(garlicnet_core::CoreError),
}

pub type Result<T> = std::result::Result<T, RouterError>;
