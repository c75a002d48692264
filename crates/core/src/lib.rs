//! GarlicNet core types
//!
//! The I2NP message envelope, router and destination identities, published
//! descriptors (RouterInfo, LeaseSet), the router configuration struct and
//! the storage abstraction. Everything here is passive data; the services
//! that move it live in the netdb, tunnel, garlic and streaming crates.

pub mod config;
pub mod error;
pub mod i2np;
pub mod identity;
pub mod lease_set;
pub mod router_info;
pub mod storage;
pub mod types;

pub use config::RouterConfig;
pub use error::{CoreError, Result};
pub use i2np::{I2npMessage, MessageType, I2NP_HEADER_SIZE, I2NP_HEADROOM};
pub use identity::PeerIdentity;
pub use lease_set::{Lease, LeaseSet};
pub use router_info::{
    BandwidthClass, CongestionLevel, RouterCaps, RouterInfo, TransportAddress, TransportKind,
    TransportSet,
};
pub use storage::{MemoryStorage, Storage};
pub use types::{now_ms, now_s, xor_distance, IdentHash, PublicKey, Signature, TunnelId};
