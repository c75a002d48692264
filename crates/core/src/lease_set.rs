//! Lease sets
//!
//! A LeaseSet is the signed contact card of a destination: one Lease per
//! inbound tunnel (gateway router, tunnel id, expiry) plus the destination's
//! current encryption key for the garlic ratchet. Owners rebuild and
//! republish it whenever their inbound tunnel set changes; floodfills store
//! it until every lease has expired.

use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

use crate::error::{CoreError, Result};
use crate::identity::PeerIdentity;
use crate::types::{IdentHash, PublicKey, Signature, TunnelId};

/// A cached remote lease set is refreshed when the freshest lease is this
/// close to expiry.
pub const LEASE_REFRESH_THRESHOLD_MS: u64 = 60_000;

/// Extra lifetime granted past the last lease expiry before a stored lease
/// set is swept.
pub const LEASE_SET_GRACE_MS: u64 = 60_000;

/// One entry point into a destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Hash of the inbound gateway router
    pub tunnel_gateway: IdentHash,
    /// Gateway-side tunnel id
    pub tunnel_id: TunnelId,
    /// Absolute expiry, ms since epoch
    pub end_time_ms: u64,
}

impl Lease {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.end_time_ms < now_ms
    }

    /// True when the lease should no longer be handed out for new sends.
    pub fn needs_refresh(&self, now_ms: u64) -> bool {
        self.end_time_ms < now_ms + LEASE_REFRESH_THRESHOLD_MS
    }
}

/// Signed collection of leases for one destination
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseSet {
    pub destination: PeerIdentity,
    /// Current X25519 key new garlic sessions should address
    pub encryption_pubkey: PublicKey,
    pub leases: Vec<Lease>,
    /// Publication timestamp, ms since epoch
    pub published_ms: u64,
    /// Store type tag (reserved; 3 = standard)
    pub store_type: u8,
    pub flags: u16,
    #[serde(with = "BigArray")]
    pub signature: Signature,
}

impl LeaseSet {
    pub fn signable_data(&self) -> Vec<u8> {
        let unsigned = UnsignedLeaseSet {
            destination: &self.destination,
            encryption_pubkey: &self.encryption_pubkey,
            leases: &self.leases,
            published_ms: self.published_ms,
            store_type: self.store_type,
            flags: self.flags,
        };
        bincode::serialize(&unsigned).expect("serialization of plain data")
    }

    pub fn verify(&self) -> Result<()> {
        self.destination
            .verify(&self.signable_data(), &self.signature)
    }

    /// Hash of the owning destination; the netDb key
    pub fn dest_hash(&self) -> IdentHash {
        self.destination.hash()
    }

    /// Expired once every lease has expired (plus grace)
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.latest_end_time() + LEASE_SET_GRACE_MS < now_ms
    }

    pub fn latest_end_time(&self) -> u64 {
        self.leases.iter().map(|l| l.end_time_ms).max().unwrap_or(0)
    }

    /// Leases still usable for sending at `now_ms`
    pub fn non_expired_leases(&self, now_ms: u64) -> Vec<&Lease> {
        self.leases.iter().filter(|l| !l.is_expired(now_ms)).collect()
    }

    /// True when the set should be re-fetched before further sends.
    pub fn needs_refresh(&self, now_ms: u64) -> bool {
        self.leases.iter().all(|l| l.needs_refresh(now_ms))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("serialization of plain data")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(CoreError::from)
    }
}

#[derive(Serialize)]
struct UnsignedLeaseSet<'a> {
    destination: &'a PeerIdentity,
    encryption_pubkey: &'a PublicKey,
    leases: &'a [Lease],
    published_ms: u64,
    store_type: u8,
    flags: u16,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::now_ms;
    use garlicnet_crypto::Identity;

    fn signed_lease_set(keys: &Identity, lease_lifetime_ms: u64) -> LeaseSet {
        let mut ls = LeaseSet {
            destination: PeerIdentity::new(
                keys.signing.public_key_bytes(),
                keys.encryption.public_key_bytes(),
            ),
            encryption_pubkey: keys.encryption.public_key_bytes(),
            leases: vec![
                Lease {
                    tunnel_gateway: [1u8; 32],
                    tunnel_id: 100,
                    end_time_ms: now_ms() + lease_lifetime_ms,
                },
                Lease {
                    tunnel_gateway: [2u8; 32],
                    tunnel_id: 200,
                    end_time_ms: now_ms() + lease_lifetime_ms / 2,
                },
            ],
            published_ms: now_ms(),
            store_type: 3,
            flags: 0,
            signature: [0u8; 64],
        };
        ls.signature = keys.signing.sign(&ls.signable_data());
        ls
    }

    #[test]
    fn test_serde_roundtrip_and_verify() {
        let keys = Identity::generate();
        let ls = signed_lease_set(&keys, 600_000);

        let restored = LeaseSet::from_bytes(&ls.to_bytes()).unwrap();
        assert_eq!(restored.dest_hash(), ls.dest_hash());
        assert_eq!(restored.leases, ls.leases);
        assert!(restored.verify().is_ok());
    }

    #[test]
    fn test_tampered_lease_rejected() {
        let keys = Identity::generate();
        let mut ls = signed_lease_set(&keys, 600_000);
        ls.leases[0].tunnel_id = 999;
        assert!(ls.verify().is_err());
    }

    #[test]
    fn test_expiry_tracks_latest_lease() {
        let keys = Identity::generate();
        let ls = signed_lease_set(&keys, 600_000);
        assert!(!ls.is_expired(now_ms()));
        assert!(ls.is_expired(now_ms() + 600_000 + LEASE_SET_GRACE_MS + 1));
    }

    #[test]
    fn test_needs_refresh_near_expiry() {
        let keys = Identity::generate();
        let fresh = signed_lease_set(&keys, 600_000);
        assert!(!fresh.needs_refresh(now_ms()));

        let stale = signed_lease_set(&keys, 30_000);
        assert!(stale.needs_refresh(now_ms()));
    }

    #[test]
    fn test_non_expired_filtering() {
        let keys = Identity::generate();
        let ls = signed_lease_set(&keys, 600_000);
        // halfway through, the shorter lease is gone
        let later = now_ms() + 400_000;
        let live = ls.non_expired_leases(later);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].tunnel_id, 100);
    }
}
