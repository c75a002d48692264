//! Router context
//!
//! This node's own identity and key material, its reachability status, the
//! RouterInfo it publishes, and the incoming garlic session for messages
//! addressed to the router itself (tunnel build requests arriving wrapped,
//! and their replies).

use garlicnet_core::{
    now_ms, BandwidthClass, CongestionLevel, IdentHash, PeerIdentity, RouterCaps, RouterConfig,
    RouterInfo, TransportAddress,
};
use garlicnet_crypto::{EncryptionKeypair, Identity};
use garlicnet_garlic::{GarlicService, RouterIncomingSession};

/// RouterInfo republication cadence, with jitter applied by the caller
pub const ROUTER_PUBLISH_INTERVAL_MS: u64 = 40 * 60 * 1000;

/// Reachability per address family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reachability {
    #[default]
    Unknown,
    Ok,
    Firewalled,
    Proxy,
    Mesh,
}

pub struct RouterContext {
    keys: Identity,
    identity: PeerIdentity,
    ident_hash: IdentHash,
    pub config: RouterConfig,
    pub reachability_v4: Reachability,
    pub reachability_v6: Reachability,
    pub addresses: Vec<TransportAddress>,
    pub bandwidth: BandwidthClass,
    /// Router-addressed garlic (build replies and the like)
    pub incoming: RouterIncomingSession,
    /// The router's own session owner: exploratory lookups, publish
    /// confirmations
    pub garlic: GarlicService,
    last_publish_ms: u64,
}

impl RouterContext {
    pub fn new(keys: Identity, config: RouterConfig, addresses: Vec<TransportAddress>) -> Self {
        let identity = PeerIdentity::new(
            keys.signing.public_key_bytes(),
            keys.encryption.public_key_bytes(),
        );
        let ident_hash = identity.hash();
        let incoming = RouterIncomingSession::new(keys.encryption.clone());
        let garlic = GarlicService::new(keys.encryption.clone());
        Self {
            keys,
            identity,
            ident_hash,
            config,
            reachability_v4: Reachability::Unknown,
            reachability_v6: Reachability::Unknown,
            addresses,
            bandwidth: BandwidthClass::High,
            incoming,
            garlic,
            last_publish_ms: 0,
        }
    }

    pub fn ident_hash(&self) -> IdentHash {
        self.ident_hash
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    pub fn static_key(&self) -> &EncryptionKeypair {
        &self.keys.encryption
    }

    pub fn keys(&self) -> &Identity {
        &self.keys
    }

    pub fn is_reachable(&self) -> bool {
        matches!(self.reachability_v4, Reachability::Ok | Reachability::Mesh)
            || matches!(self.reachability_v6, Reachability::Ok | Reachability::Mesh)
    }

    /// Build and sign our current RouterInfo.
    pub fn build_router_info(&self, congestion: CongestionLevel) -> RouterInfo {
        let mut caps = RouterCaps::empty();
        if self.is_reachable() {
            caps |= RouterCaps::REACHABLE;
        } else {
            caps |= RouterCaps::UNREACHABLE;
        }
        if self.config.is_floodfill {
            caps |= RouterCaps::FLOODFILL;
        }
        let mut ri = RouterInfo {
            identity: self.identity.clone(),
            published_ms: now_ms(),
            addresses: self.addresses.clone(),
            caps,
            bandwidth: self.bandwidth,
            congestion,
            family: None,
            signature: [0u8; 64],
        };
        ri.signature = self.keys.signing.sign(&ri.signable_data());
        ri
    }

    /// Whether the republish timer has come around.
    pub fn publish_due(&self, now_ms: u64) -> bool {
        self.last_publish_ms + ROUTER_PUBLISH_INTERVAL_MS <= now_ms
    }

    pub fn mark_published(&mut self) {
        self.last_publish_ms = now_ms();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use garlicnet_core::TransportKind;

    fn make_context(floodfill: bool) -> RouterContext {
        RouterContext::new(
            Identity::generate(),
            RouterConfig {
                is_floodfill: floodfill,
                ..Default::default()
            },
            vec![TransportAddress {
                kind: TransportKind::Ntcp2,
                host: "10.1.2.3".into(),
                port: 9110,
            }],
        )
    }

    #[test]
    fn test_router_info_reflects_state() {
        let mut ctx = make_context(true);
        ctx.reachability_v4 = Reachability::Ok;
        let ri = ctx.build_router_info(CongestionLevel::Low);

        assert!(ri.verify().is_ok());
        assert!(ri.is_floodfill());
        assert!(ri.is_reachable());
        assert_eq!(ri.hash(), ctx.ident_hash());
    }

    #[test]
    fn test_firewalled_not_reachable() {
        let mut ctx = make_context(false);
        ctx.reachability_v4 = Reachability::Firewalled;
        assert!(!ctx.is_reachable());
        let ri = ctx.build_router_info(CongestionLevel::Low);
        assert!(!ri.is_reachable());
        assert!(ri.caps.contains(RouterCaps::UNREACHABLE));
    }

    #[test]
    fn test_publish_timer() {
        let mut ctx = make_context(false);
        assert!(ctx.publish_due(now_ms()));
        ctx.mark_published();
        assert!(!ctx.publish_due(now_ms()));
        assert!(ctx.publish_due(now_ms() + ROUTER_PUBLISH_INTERVAL_MS + 1));
    }
}
