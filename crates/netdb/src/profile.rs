//! Peer profiles
//!
//! Per-router behavior counters feeding hop selection: how often a router
//! agreed to, declined or ignored our build requests. Profiles are shared
//! reference-counted structs mutated under a per-profile lock and persisted
//! as bincode records through the storage abstraction. The store also
//! carries the duplicated-router set: identities the netdb has seen
//! publishing an address another router already claims.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::debug;

use garlicnet_core::{now_s, IdentHash, Storage};

/// A recent decline keeps a peer out of selection for this long
const DECLINE_PENALTY_S: u64 = 300;

/// Unreachable marks age out after this long
const UNREACHABLE_PENALTY_S: u64 = 900;

/// Profiles idle longer than this are dropped from memory and disk
const PROFILE_EXPIRATION_S: u64 = 36 * 3600;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterProfile {
    pub tunnels_agreed: u32,
    pub tunnels_declined: u32,
    pub tunnels_non_replied: u32,
    pub last_decline_s: u64,
    pub last_unreachable_s: u64,
    pub last_update_s: u64,
}

impl RouterProfile {
    pub fn on_agreed(&mut self) {
        self.tunnels_agreed += 1;
        self.last_decline_s = 0;
        self.last_update_s = now_s();
    }

    pub fn on_declined(&mut self) {
        self.tunnels_declined += 1;
        self.last_decline_s = now_s();
        self.last_update_s = now_s();
    }

    pub fn on_non_replied(&mut self) {
        self.tunnels_non_replied += 1;
        self.last_update_s = now_s();
    }

    pub fn on_unreachable(&mut self) {
        self.last_unreachable_s = now_s();
        self.last_update_s = now_s();
    }

    /// Excluded from hop selection: recently declined, recently
    /// unreachable, or a heavy decliner / non-replier overall.
    pub fn is_bad(&self) -> bool {
        let now = now_s();
        if self.last_decline_s + DECLINE_PENALTY_S > now {
            return true;
        }
        if self.last_unreachable_s + UNREACHABLE_PENALTY_S > now {
            return true;
        }
        let total = self.tunnels_agreed + self.tunnels_declined;
        if total >= 5 && self.tunnels_declined * 3 > total * 2 {
            return true;
        }
        let replied = self.tunnels_agreed + self.tunnels_declined;
        if self.tunnels_non_replied >= 10 && self.tunnels_non_replied > replied * 4 {
            return true;
        }
        false
    }

    fn is_expired(&self) -> bool {
        self.last_update_s + PROFILE_EXPIRATION_S < now_s()
    }
}

/// Shared profile table.
///
/// Entries are `Arc<Mutex<_>>` so samples recorded from any subsystem hit
/// the same counters without a global lock on the table.
#[derive(Default)]
pub struct ProfileStore {
    profiles: Mutex<HashMap<IdentHash, Arc<Mutex<RouterProfile>>>>,
    /// Identities sharing a published address with another known router
    duplicated: Mutex<HashSet<IdentHash>>,
}

impl ProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, ident: &IdentHash) -> Arc<Mutex<RouterProfile>> {
        self.profiles
            .lock()
            .expect("profile table lock")
            .entry(*ident)
            .or_default()
            .clone()
    }

    pub fn is_bad(&self, ident: &IdentHash) -> bool {
        self.get(ident).lock().expect("profile lock").is_bad()
    }

    pub fn record_agreed(&self, ident: &IdentHash) {
        self.get(ident).lock().expect("profile lock").on_agreed();
    }

    pub fn record_declined(&self, ident: &IdentHash) {
        self.get(ident).lock().expect("profile lock").on_declined();
    }

    pub fn record_non_replied(&self, ident: &IdentHash) {
        self.get(ident).lock().expect("profile lock").on_non_replied();
    }

    pub fn record_unreachable(&self, ident: &IdentHash) {
        self.get(ident).lock().expect("profile lock").on_unreachable();
    }

    /// The netdb saw this identity publish an address another router
    /// already claims; transit admission declines tunnels toward it.
    pub fn mark_duplicated(&self, ident: &IdentHash) {
        self.duplicated
            .lock()
            .expect("duplicated set lock")
            .insert(*ident);
    }

    pub fn is_duplicated(&self, ident: &IdentHash) -> bool {
        self.duplicated
            .lock()
            .expect("duplicated set lock")
            .contains(ident)
    }

    /// Drop idle profiles and persist the rest.
    pub fn sweep_and_persist(&self, storage: &dyn Storage) {
        let mut table = self.profiles.lock().expect("profile table lock");
        table.retain(|ident, profile| {
            let profile = profile.lock().expect("profile lock");
            if profile.is_expired() {
                let _ = storage.remove(&profile_name(ident));
                return false;
            }
            if let Ok(bytes) = bincode::serialize(&*profile) {
                if let Err(e) = storage.save(&profile_name(ident), &bytes) {
                    debug!("failed to persist profile {}: {}", hex::encode(&ident[..8]), e);
                }
            }
            true
        });
    }

    /// Load previously persisted profiles.
    pub fn load(&self, storage: &dyn Storage) {
        let Ok(names) = storage.iterate() else {
            return;
        };
        let mut table = self.profiles.lock().expect("profile table lock");
        for name in names.iter().filter(|n| n.starts_with("profiles/")) {
            let Ok(Some(bytes)) = storage.load(name) else {
                continue;
            };
            let Ok(profile) = bincode::deserialize::<RouterProfile>(&bytes) else {
                continue;
            };
            let Ok(ident_bytes) = hex::decode(&name["profiles/".len()..]) else {
                continue;
            };
            let Ok(ident) = <IdentHash>::try_from(ident_bytes.as_slice()) else {
                continue;
            };
            table.insert(ident, Arc::new(Mutex::new(profile)));
        }
    }
}

fn profile_name(ident: &IdentHash) -> String {
    format!("profiles/{}", hex::encode(ident))
}

#[cfg(test)]
mod tests {
    use super::*;
    use garlicnet_core::MemoryStorage;

    #[test]
    fn test_fresh_profile_is_good() {
        let store = ProfileStore::new();
        assert!(!store.is_bad(&[1u8; 32]));
    }

    #[test]
    fn test_recent_decline_marks_bad() {
        let store = ProfileStore::new();
        let ident = [2u8; 32];
        store.record_declined(&ident);
        assert!(store.is_bad(&ident));
    }

    #[test]
    fn test_agreed_clears_decline() {
        let store = ProfileStore::new();
        let ident = [3u8; 32];
        store.record_declined(&ident);
        store.record_agreed(&ident);
        assert!(!store.is_bad(&ident));
    }

    #[test]
    fn test_heavy_decliner_is_bad() {
        let profile = RouterProfile {
            tunnels_agreed: 1,
            tunnels_declined: 9,
            ..Default::default()
        };
        assert!(profile.is_bad());
    }

    #[test]
    fn test_duplicated_marking() {
        let store = ProfileStore::new();
        let ident = [9u8; 32];
        assert!(!store.is_duplicated(&ident));
        store.mark_duplicated(&ident);
        assert!(store.is_duplicated(&ident));
        assert!(!store.is_duplicated(&[8u8; 32]));
    }

    #[test]
    fn test_persist_and_load_roundtrip() {
        let storage = MemoryStorage::new();
        let store = ProfileStore::new();
        let ident = [4u8; 32];
        store.record_agreed(&ident);
        store.sweep_and_persist(&storage);

        let restored = ProfileStore::new();
        restored.load(&storage);
        let profile = restored.get(&ident);
        assert_eq!(profile.lock().unwrap().tunnels_agreed, 1);
    }
}
