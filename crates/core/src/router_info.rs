//! Router descriptors
//!
//! A RouterInfo is the signed, published description of one router: its
//! identity, transport addresses, capability flags and congestion state.
//! It lives in the netDb and is refreshed whenever a newer timestamp is
//! received.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

use crate::error::{CoreError, Result};
use crate::identity::PeerIdentity;
use crate::types::{IdentHash, Signature};

/// Routers older than this are dropped outright
pub const ROUTER_INFO_MAX_AGE_MS: u64 = 72 * 3600 * 1000;

bitflags! {
    /// Capability flags published in a RouterInfo
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct RouterCaps: u8 {
        const FLOODFILL    = 0b0000_0001;
        const REACHABLE    = 0b0000_0010;
        const UNREACHABLE  = 0b0000_0100;
        const HIDDEN       = 0b0000_1000;
    }
}

bitflags! {
    /// Transport kinds a router listens on; used to pair tunnels with peers
    /// both sides can actually reach.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TransportSet: u8 {
        const NTCP2_V4 = 0b0000_0001;
        const NTCP2_V6 = 0b0000_0010;
        const SSU2_V4  = 0b0000_0100;
        const SSU2_V6  = 0b0000_1000;
    }
}

impl TransportSet {
    pub fn intersects_with(&self, other: TransportSet) -> bool {
        !(*self & other).is_empty()
    }
}

/// Relative share of traffic a router is willing to carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BandwidthClass {
    /// Under 256 KB/s
    Low,
    /// 256 KB/s - 2 MB/s
    Medium,
    /// Over 2 MB/s
    High,
    /// Unlimited
    Unlimited,
}

/// Congestion advertised by a router, consulted by transit admission and
/// hop selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum CongestionLevel {
    #[default]
    Low,
    Medium,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportKind {
    Ntcp2,
    Ssu2,
}

/// One transport endpoint of a router
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportAddress {
    pub kind: TransportKind,
    pub host: String,
    pub port: u16,
}

/// Signed router descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterInfo {
    pub identity: PeerIdentity,
    /// Publication timestamp, ms since epoch; newer replaces older
    pub published_ms: u64,
    /// Ordered list of transport addresses
    pub addresses: Vec<TransportAddress>,
    pub caps: RouterCaps,
    pub bandwidth: BandwidthClass,
    pub congestion: CongestionLevel,
    /// Optional router-family signature blob
    pub family: Option<Vec<u8>>,
    #[serde(with = "BigArray")]
    pub signature: Signature,
}

impl RouterInfo {
    /// The bytes covered by the signature: everything except the signature.
    pub fn signable_data(&self) -> Vec<u8> {
        let unsigned = UnsignedRouterInfo {
            identity: &self.identity,
            published_ms: self.published_ms,
            addresses: &self.addresses,
            caps: self.caps,
            bandwidth: self.bandwidth,
            congestion: self.congestion,
            family: &self.family,
        };
        bincode::serialize(&unsigned).expect("serialization of plain data")
    }

    pub fn verify(&self) -> Result<()> {
        self.identity.verify(&self.signable_data(), &self.signature)
    }

    pub fn hash(&self) -> IdentHash {
        self.identity.hash()
    }

    pub fn is_floodfill(&self) -> bool {
        self.caps.contains(RouterCaps::FLOODFILL)
    }

    pub fn is_reachable(&self) -> bool {
        self.caps.contains(RouterCaps::REACHABLE)
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.published_ms + ROUTER_INFO_MAX_AGE_MS < now_ms
    }

    /// Transports this router can be reached over
    pub fn transports(&self) -> TransportSet {
        let mut set = TransportSet::empty();
        for addr in &self.addresses {
            set |= match addr.kind {
                TransportKind::Ntcp2 => TransportSet::NTCP2_V4,
                TransportKind::Ssu2 => TransportSet::SSU2_V4,
            };
        }
        set
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("serialization of plain data")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(CoreError::from)
    }
}

#[derive(Serialize)]
struct UnsignedRouterInfo<'a> {
    identity: &'a PeerIdentity,
    published_ms: u64,
    addresses: &'a [TransportAddress],
    caps: RouterCaps,
    bandwidth: BandwidthClass,
    congestion: CongestionLevel,
    family: &'a Option<Vec<u8>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::now_ms;
    use garlicnet_crypto::Identity;

    pub fn signed_router_info(keys: &Identity) -> RouterInfo {
        let mut ri = RouterInfo {
            identity: PeerIdentity::new(
                keys.signing.public_key_bytes(),
                keys.encryption.public_key_bytes(),
            ),
            published_ms: now_ms(),
            addresses: vec![TransportAddress {
                kind: TransportKind::Ntcp2,
                host: "10.0.0.1".to_string(),
                port: 9111,
            }],
            caps: RouterCaps::REACHABLE | RouterCaps::FLOODFILL,
            bandwidth: BandwidthClass::High,
            congestion: CongestionLevel::Low,
            family: None,
            signature: [0u8; 64],
        };
        ri.signature = keys.signing.sign(&ri.signable_data());
        ri
    }

    #[test]
    fn test_serde_roundtrip() {
        let keys = Identity::generate();
        let ri = signed_router_info(&keys);

        let restored = RouterInfo::from_bytes(&ri.to_bytes()).unwrap();
        assert_eq!(restored.hash(), ri.hash());
        assert_eq!(restored.published_ms, ri.published_ms);
        assert_eq!(restored.addresses, ri.addresses);
        assert!(restored.verify().is_ok());
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let keys = Identity::generate();
        let mut ri = signed_router_info(&keys);
        ri.published_ms += 1;
        assert!(ri.verify().is_err());
    }

    #[test]
    fn test_caps_queries() {
        let keys = Identity::generate();
        let ri = signed_router_info(&keys);
        assert!(ri.is_floodfill());
        assert!(ri.is_reachable());
    }

    #[test]
    fn test_expiry() {
        let keys = Identity::generate();
        let mut ri = signed_router_info(&keys);
        assert!(!ri.is_expired(now_ms()));
        ri.published_ms = 0;
        assert!(ri.is_expired(now_ms()));
    }

    #[test]
    fn test_transport_set_intersection() {
        assert!(TransportSet::NTCP2_V4.intersects_with(TransportSet::all()));
        assert!(!TransportSet::NTCP2_V4.intersects_with(TransportSet::SSU2_V4));
    }
}
