//! GarlicNet tunnels
//!
//! Everything circuit-shaped: the short build protocol, the 1024-byte
//! tunnel-data path with per-hop AES layers, transit participation,
//! per-destination pools with periodic replacement and testing, and the
//! manager task tying the tunnel-id space together.

pub mod build;
pub mod data;
pub mod pool;
pub mod service;
pub mod transit;
pub mod tunnel;

use thiserror::Error;

pub use build::{BuildHop, BuildRequest, BuildRequestRecord, IncomingBuild};
pub use data::{TunnelDelivery, TunnelEndpointRx, TunnelGatewayBuffer, TunnelMessageBlock};
pub use pool::{PeerSelector, PoolOwner, PoolSettings, TunnelPool, TunnelTestOrder};
pub use service::{TunnelManager, TunnelOutput};
pub use transit::{AdmissionContext, TransitRole, TransitTunnel};
pub use tunnel::{Tunnel, TunnelHop, TunnelState};

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Malformed build message: {0}")]
    MalformedBuild(&'static str),

    #[error("Malformed tunnel data frame: {0}")]
    MalformedFrame(&'static str),

    #[error("Unknown tunnel {0}")]
    UnknownTunnel(u32),

    #[error("Role mismatch: {0}")]
    WrongRole(&'static str),

    #[error("No tunnel available")]
    NoTunnelAvailable,

    #[error("No eligible peers for hop selection")]
    NoPeers,

    #[error(transparent)]
    Core(#[from] garlicnet_core::CoreError),
}

pub type Result<T> = std::result::Result<T, TunnelError>;
