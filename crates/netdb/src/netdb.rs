//! The network database proper
//!
//! One owner task holds the router and lease-set maps; message handling
//! mutates them and returns outbound actions for the wiring layer to
//! execute. Read access from other subsystems goes through an immutable
//! snapshot republished whenever the tables change.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use garlicnet_core::{
    now_ms, xor_distance, CoreError, I2npMessage, IdentHash, LeaseSet, MessageType, RouterConfig,
    RouterInfo, Storage, TunnelId,
};
use garlicnet_crypto::{aead_encrypt, nonce_from_index};

use crate::messages::{
    DatabaseLookupMsg, DatabaseSearchReplyMsg, DatabaseStoreMsg, LookupKind,
    STORE_TYPE_ROUTER_INFO,
};
use crate::profile::ProfileStore;
use crate::requests::{LookupResult, RequestManager};
use crate::routing_key::{ms_until_midnight, routing_key, routing_key_for_day};
use crate::Result;

/// Closest floodfills a store is flooded to
const FLOOD_WIDTH: usize = 2;

/// Closer floodfills listed in a DatabaseSearchReply
const SEARCH_REPLY_WIDTH: usize = 3;

/// Stores this close to UTC midnight also flood to tomorrow's closest set
const DAY_BOUNDARY_MS: u64 = 10 * 60 * 1000;

/// Routers idle longer than this are expired when the table is large
const ROUTER_EXPIRATION_FAST_MS: u64 = 27 * 3600 * 1000 + 1800 * 1000;

/// Table size above which the fast expiration applies
const LARGE_NETDB: usize = 4000;

#[derive(Error, Debug)]
pub enum NetDbError {
    #[error("Malformed netdb message: {0}")]
    Malformed(String),

    #[error("Store rejected: {0}")]
    StoreRejected(&'static str),

    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Outbound actions produced by netdb handling; executed by the router
/// wiring layer, which owns the transports and the exploratory pool.
#[derive(Debug)]
pub enum NetDbEvent {
    /// Send directly via transports
    SendDirect { to: IdentHash, msg: I2npMessage },
    /// Issue a lookup to a floodfill; the wiring layer picks direct or
    /// tunnel delivery and fills in the reply route before encoding
    SendLookup {
        to: IdentHash,
        key: IdentHash,
        kind: LookupKind,
        excluded: Vec<IdentHash>,
    },
    /// Router table fell below the reseed floor
    Reseed,
}

/// Immutable view for readers on other tasks
#[derive(Default)]
pub struct NetDbSnapshot {
    pub routers: Vec<Arc<RouterInfo>>,
    pub floodfills: Vec<IdentHash>,
}

pub struct NetDb {
    local: IdentHash,
    config: RouterConfig,
    routers: HashMap<IdentHash, Arc<RouterInfo>>,
    lease_sets: HashMap<IdentHash, Arc<LeaseSet>>,
    /// Copy-on-write floodfill index, rebuilt when the router table changes
    floodfills: Vec<IdentHash>,
    profiles: Arc<ProfileStore>,
    requests: RequestManager,
    storage: Arc<dyn Storage>,
    snapshot_tx: watch::Sender<Arc<NetDbSnapshot>>,
    /// Router hashes touched since the last persistence pass
    dirty: Vec<IdentHash>,
}

impl NetDb {
    pub fn new(
        local: IdentHash,
        config: RouterConfig,
        profiles: Arc<ProfileStore>,
        storage: Arc<dyn Storage>,
    ) -> (Self, watch::Receiver<Arc<NetDbSnapshot>>) {
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(NetDbSnapshot::default()));
        let netdb = Self {
            local,
            config,
            routers: HashMap::new(),
            lease_sets: HashMap::new(),
            floodfills: Vec::new(),
            profiles,
            requests: RequestManager::new(),
            storage,
            snapshot_tx,
            dirty: Vec::new(),
        };
        (netdb, snapshot_rx)
    }

    pub fn router_count(&self) -> usize {
        self.routers.len()
    }

    pub fn floodfill_count(&self) -> usize {
        self.floodfills.len()
    }

    pub fn lookup_router(&self, ident: &IdentHash) -> Option<Arc<RouterInfo>> {
        self.routers.get(ident).cloned()
    }

    pub fn lookup_lease_set(&self, dest: &IdentHash) -> Option<Arc<LeaseSet>> {
        self.lease_sets.get(dest).cloned()
    }

    /// Load persisted router descriptors at startup.
    pub fn load_from_storage(&mut self) {
        let Ok(names) = self.storage.iterate() else {
            return;
        };
        let mut loaded = 0usize;
        for name in names.iter().filter(|n| n.starts_with("ri/")) {
            let Ok(Some(bytes)) = self.storage.load(name) else {
                continue;
            };
            match RouterInfo::from_bytes(&bytes) {
                Ok(ri) if ri.verify().is_ok() && !ri.is_expired(now_ms()) => {
                    self.routers.insert(ri.hash(), Arc::new(ri));
                    loaded += 1;
                }
                _ => {
                    let _ = self.storage.remove(name);
                }
            }
        }
        info!("loaded {} router descriptors from {}", loaded, self.storage.path());
        self.rebuild_indexes();
    }

    /// Insert or refresh a router descriptor. Returns true when the table
    /// changed (new router or newer timestamp).
    pub fn add_router_info(&mut self, ri: RouterInfo) -> Result<bool> {
        ri.verify()?;
        if ri.is_expired(now_ms()) {
            return Err(NetDbError::StoreRejected("expired descriptor"));
        }
        let hash = ri.hash();
        if let Some(existing) = self.routers.get(&hash) {
            if existing.published_ms >= ri.published_ms {
                return Ok(false);
            }
        }
        self.routers.insert(hash, Arc::new(ri));
        self.dirty.push(hash);
        self.rebuild_indexes();
        Ok(true)
    }

    /// Insert or refresh a lease set. Only accepted when we are a floodfill
    /// or the set answers one of our own lookups.
    pub fn add_lease_set(&mut self, ls: LeaseSet, from_lookup: bool) -> Result<bool> {
        if !self.config.is_floodfill && !from_lookup {
            return Err(NetDbError::StoreRejected("not a floodfill"));
        }
        ls.verify()?;
        if ls.is_expired(now_ms()) {
            return Err(NetDbError::StoreRejected("expired lease set"));
        }
        let hash = ls.dest_hash();
        if let Some(existing) = self.lease_sets.get(&hash) {
            if existing.published_ms >= ls.published_ms {
                return Ok(false);
            }
        }
        self.lease_sets.insert(hash, Arc::new(ls));
        self.publish_snapshot();
        Ok(true)
    }

    /// The up-to-`count` floodfills closest to `key` by XOR distance
    /// against today's routing key, skipping excluded and profile-bad
    /// routers.
    pub fn closest_floodfills(
        &self,
        key: &IdentHash,
        count: usize,
        excluded: &[IdentHash],
    ) -> Vec<IdentHash> {
        self.closest_floodfills_for_day(key, count, excluded, now_ms() / 86_400_000)
    }

    fn closest_floodfills_for_day(
        &self,
        key: &IdentHash,
        count: usize,
        excluded: &[IdentHash],
        day: u64,
    ) -> Vec<IdentHash> {
        let target = routing_key_for_day(key, day);
        let mut candidates: Vec<(IdentHash, [u8; 32])> = self
            .floodfills
            .iter()
            .filter(|ff| **ff != self.local)
            .filter(|ff| !excluded.contains(ff))
            .filter(|ff| !self.profiles.is_bad(ff))
            .filter(|ff| {
                self.routers
                    .get(*ff)
                    .map(|ri| ri.is_reachable())
                    .unwrap_or(false)
            })
            .map(|ff| (*ff, xor_distance(&target, ff)))
            .collect();
        candidates.sort_by(|a, b| a.1.cmp(&b.1));
        candidates.truncate(count);
        candidates.into_iter().map(|(ff, _)| ff).collect()
    }

    /// Start (or join) a lookup for `key`. The completion fires with the
    /// result or `None` after the retry cap.
    pub fn request_destination(
        &mut self,
        key: IdentHash,
        kind: LookupKind,
        completion: oneshot::Sender<Option<LookupResult>>,
    ) -> Vec<NetDbEvent> {
        // already known?
        match kind {
            LookupKind::LeaseSet => {
                if let Some(ls) = self.lease_sets.get(&key) {
                    if !ls.needs_refresh(now_ms()) {
                        let _ = completion.send(Some(LookupResult::LeaseSet(ls.clone())));
                        return Vec::new();
                    }
                }
            }
            LookupKind::RouterInfo | LookupKind::Any => {
                if let Some(ri) = self.routers.get(&key) {
                    let _ = completion.send(Some(LookupResult::Router(ri.clone())));
                    return Vec::new();
                }
            }
            LookupKind::Exploration => {}
        }

        if !self.requests.insert(key, kind, completion) {
            return Vec::new();
        }
        self.next_attempt(&key)
    }

    fn next_attempt(&mut self, key: &IdentHash) -> Vec<NetDbEvent> {
        let Some(request) = self.requests.get_mut(key) else {
            return Vec::new();
        };
        let excluded: Vec<IdentHash> = request.excluded.iter().copied().collect();
        let kind = request.kind;
        let Some(floodfill) = self
            .closest_floodfills(key, 1, &excluded)
            .into_iter()
            .next()
        else {
            debug!("no floodfill left for lookup {}", hex::encode(&key[..8]));
            self.requests.complete(key, None);
            return Vec::new();
        };
        let request = self.requests.get_mut(key).expect("request still present");
        request.mark_attempt(floodfill);
        vec![NetDbEvent::SendLookup {
            to: floodfill,
            key: *key,
            kind,
            excluded,
        }]
    }

    /// Typed dispatch for the three netdb message kinds.
    pub fn handle_message(&mut self, from: IdentHash, msg: &I2npMessage) -> Vec<NetDbEvent> {
        let result = match msg.msg_type() {
            MessageType::DatabaseStore => self.handle_store(from, msg.payload()),
            MessageType::DatabaseLookup => self.handle_lookup(from, msg.payload()),
            MessageType::DatabaseSearchReply => self.handle_search_reply(msg.payload()),
            other => {
                warn!("netdb received unexpected {:?}", other);
                Ok(Vec::new())
            }
        };
        match result {
            Ok(events) => events,
            Err(e) => {
                debug!("dropping netdb message from {}: {}", hex::encode(&from[..8]), e);
                self.profiles.record_unreachable(&from);
                Vec::new()
            }
        }
    }

    fn handle_store(&mut self, from: IdentHash, payload: &[u8]) -> Result<Vec<NetDbEvent>> {
        let store = DatabaseStoreMsg::parse(payload)?;
        let mut events = Vec::new();

        let changed = if store.store_type == STORE_TYPE_ROUTER_INFO {
            let ri = RouterInfo::from_bytes(&store.data)?;
            if ri.hash() != store.key {
                return Err(NetDbError::StoreRejected("key does not match identity"));
            }
            self.add_router_info(ri)?
        } else {
            let ls = LeaseSet::from_bytes(&store.data)?;
            if ls.dest_hash() != store.key {
                return Err(NetDbError::StoreRejected("key does not match destination"));
            }
            let from_lookup = self.requests.contains(&store.key);
            let changed = self.add_lease_set(ls, from_lookup)?;
            if from_lookup {
                let result = self
                    .lease_sets
                    .get(&store.key)
                    .map(|ls| LookupResult::LeaseSet(ls.clone()));
                self.requests.complete(&store.key, result);
            }
            changed
        };

        if store.reply_token != 0 {
            let status = I2npMessage::new(
                MessageType::DeliveryStatus,
                garlicnet_core::i2np::random_msg_id(),
                &delivery_status_payload(store.reply_token, now_ms()),
            );
            match store.reply_tunnel {
                Some((tunnel_id, gateway)) => {
                    let wrapped =
                        status.wrap_gateway(tunnel_id, garlicnet_core::i2np::random_msg_id());
                    events.push(NetDbEvent::SendDirect {
                        to: gateway,
                        msg: wrapped,
                    });
                }
                None => events.push(NetDbEvent::SendDirect {
                    to: from,
                    msg: status,
                }),
            }

            // a publish with a reply token gets flooded onward
            if self.config.is_floodfill && changed {
                events.extend(self.flood(&store));
            }
        }

        Ok(events)
    }

    fn flood(&self, store: &DatabaseStoreMsg) -> Vec<NetDbEvent> {
        let mut targets = self.closest_floodfills(&store.key, FLOOD_WIDTH, &[]);
        if ms_until_midnight() < DAY_BOUNDARY_MS {
            let tomorrow = now_ms() / 86_400_000 + 1;
            for ff in self.closest_floodfills_for_day(&store.key, FLOOD_WIDTH, &[], tomorrow) {
                if !targets.contains(&ff) {
                    targets.push(ff);
                }
            }
        }

        let flooded = DatabaseStoreMsg {
            reply_token: 0,
            reply_tunnel: None,
            ..store.clone()
        };
        let payload = flooded.to_payload();
        targets
            .into_iter()
            .map(|to| NetDbEvent::SendDirect {
                to,
                msg: I2npMessage::new(
                    MessageType::DatabaseStore,
                    garlicnet_core::i2np::random_msg_id(),
                    &payload,
                ),
            })
            .collect()
    }

    fn handle_lookup(&mut self, from: IdentHash, payload: &[u8]) -> Result<Vec<NetDbEvent>> {
        let lookup = DatabaseLookupMsg::parse(payload)?;
        let now = now_ms();

        let reply = match lookup.kind {
            LookupKind::RouterInfo | LookupKind::Any
                if self
                    .routers
                    .get(&lookup.key)
                    .map(|ri| !ri.is_expired(now))
                    .unwrap_or(false) =>
            {
                let ri = self.routers.get(&lookup.key).expect("checked above");
                let store = DatabaseStoreMsg {
                    key: lookup.key,
                    store_type: STORE_TYPE_ROUTER_INFO,
                    reply_token: 0,
                    reply_tunnel: None,
                    data: ri.to_bytes(),
                };
                (MessageType::DatabaseStore, store.to_payload())
            }
            LookupKind::LeaseSet | LookupKind::Any
                if self
                    .lease_sets
                    .get(&lookup.key)
                    .map(|ls| !ls.is_expired(now))
                    .unwrap_or(false) =>
            {
                let ls = self.lease_sets.get(&lookup.key).expect("checked above");
                let store = DatabaseStoreMsg {
                    key: lookup.key,
                    store_type: ls.store_type,
                    reply_token: 0,
                    reply_tunnel: None,
                    data: ls.to_bytes(),
                };
                (MessageType::DatabaseStore, store.to_payload())
            }
            _ => {
                let peers =
                    self.closest_floodfills(&lookup.key, SEARCH_REPLY_WIDTH, &lookup.excluded);
                let reply = DatabaseSearchReplyMsg {
                    key: lookup.key,
                    peers,
                    from: self.local,
                };
                (MessageType::DatabaseSearchReply, reply.to_payload())
            }
        };

        let mut msg = I2npMessage::new(reply.0, garlicnet_core::i2np::random_msg_id(), &reply.1);

        // encrypted reply: one-time tag + AEAD over the whole envelope
        if let Some((key, tag)) = lookup.reply_key_tag {
            let mut frame = Vec::with_capacity(8 + msg.len() + 16);
            frame.extend_from_slice(&tag);
            let ct = aead_encrypt(&key, &nonce_from_index(0), &tag, msg.as_bytes())
                .map_err(|_| NetDbError::Malformed("reply encryption".into()))?;
            frame.extend_from_slice(&ct);
            msg = I2npMessage::new(
                MessageType::Garlic,
                garlicnet_core::i2np::random_msg_id(),
                &frame,
            );
        }

        let event = match lookup.reply_tunnel_id {
            Some(tunnel_id) => NetDbEvent::SendDirect {
                to: lookup.from,
                msg: msg.wrap_gateway(tunnel_id, garlicnet_core::i2np::random_msg_id()),
            },
            None => NetDbEvent::SendDirect {
                to: if lookup.from == [0u8; 32] { from } else { lookup.from },
                msg,
            },
        };
        Ok(vec![event])
    }

    fn handle_search_reply(&mut self, payload: &[u8]) -> Result<Vec<NetDbEvent>> {
        let reply = DatabaseSearchReplyMsg::parse(payload)?;
        if !self.requests.contains(&reply.key) {
            return Ok(Vec::new());
        }

        // remember suggested floodfills we have descriptors for
        let mut events = Vec::new();
        for peer in &reply.peers {
            if !self.routers.contains_key(peer) && !self.requests.contains(peer) {
                // fetch the suggested router itself so later attempts can
                // use it; fire-and-forget
                let (tx, _rx) = oneshot::channel();
                events.extend(self.request_destination(*peer, LookupKind::RouterInfo, tx));
            }
        }

        events.extend(self.next_attempt(&reply.key.clone()));
        Ok(events)
    }

    /// Periodic maintenance: expire entries, persist dirty descriptors,
    /// retry or fail lookups, trigger reseed.
    pub fn maintenance(&mut self) -> Vec<NetDbEvent> {
        let now = now_ms();
        let mut events = Vec::new();

        self.lease_sets.retain(|_, ls| !ls.is_expired(now));

        // adaptive router expiration, never shrinking below the floor
        let timeout = if self.routers.len() > LARGE_NETDB {
            ROUTER_EXPIRATION_FAST_MS
        } else {
            garlicnet_core::router_info::ROUTER_INFO_MAX_AGE_MS
        };
        if self.routers.len() > self.config.min_routers {
            let mut removable: Vec<IdentHash> = self
                .routers
                .iter()
                .filter(|(_, ri)| ri.published_ms + timeout < now)
                .map(|(hash, _)| *hash)
                .collect();
            let max_remove = self.routers.len() - self.config.min_routers;
            removable.truncate(max_remove);
            for hash in &removable {
                self.routers.remove(hash);
                let _ = self.storage.remove(&router_name(hash));
            }
            if !removable.is_empty() {
                debug!("expired {} routers", removable.len());
                self.rebuild_indexes();
            }
        }

        // persist recently updated descriptors
        for hash in std::mem::take(&mut self.dirty) {
            if let Some(ri) = self.routers.get(&hash) {
                if let Err(e) = self.storage.save(&router_name(&hash), &ri.to_bytes()) {
                    debug!("persist {} failed: {}", hex::encode(&hash[..8]), e);
                }
            }
        }

        // lookup retries
        for key in self.requests.sweep(now) {
            events.extend(self.next_attempt(&key));
        }

        if self.routers.len() < self.config.min_routers
            || self.floodfills.len() < self.config.min_floodfills
        {
            events.push(NetDbEvent::Reseed);
        }
        events
    }

    fn rebuild_indexes(&mut self) {
        self.floodfills = self
            .routers
            .values()
            .filter(|ri| ri.is_floodfill())
            .map(|ri| ri.hash())
            .collect();

        // identities sharing a published address: the later arrival is a
        // duplicated router and transit admission declines toward it
        let mut by_host: HashMap<&str, IdentHash> = HashMap::new();
        let mut by_age: Vec<&Arc<RouterInfo>> = self.routers.values().collect();
        by_age.sort_by_key(|ri| ri.published_ms);
        for ri in by_age {
            let hash = ri.hash();
            for addr in &ri.addresses {
                match by_host.get(addr.host.as_str()) {
                    Some(existing) if *existing != hash => {
                        debug!(
                            "router {} duplicates address {} of {}",
                            hex::encode(&hash[..8]),
                            addr.host,
                            hex::encode(&existing[..8])
                        );
                        self.profiles.mark_duplicated(&hash);
                    }
                    Some(_) => {}
                    None => {
                        by_host.insert(addr.host.as_str(), hash);
                    }
                }
            }
        }

        self.publish_snapshot();
    }

    fn publish_snapshot(&self) {
        let snapshot = NetDbSnapshot {
            routers: self.routers.values().cloned().collect(),
            floodfills: self.floodfills.clone(),
        };
        let _ = self.snapshot_tx.send(Arc::new(snapshot));
    }
}

/// DeliveryStatus payload: `msg_id(4) || timestamp_ms(8)`
pub fn delivery_status_payload(msg_id: u32, timestamp_ms: u64) -> [u8; 12] {
    let mut out = [0u8; 12];
    out[..4].copy_from_slice(&msg_id.to_be_bytes());
    out[4..].copy_from_slice(&timestamp_ms.to_be_bytes());
    out
}

/// Parse a DeliveryStatus payload into `(msg_id, timestamp_ms)`
pub fn parse_delivery_status(payload: &[u8]) -> Result<(u32, u64)> {
    if payload.len() < 12 {
        return Err(NetDbError::Core(CoreError::Truncated {
            need: 12,
            got: payload.len(),
        }));
    }
    Ok((
        u32::from_be_bytes(payload[..4].try_into().expect("4 bytes")),
        u64::from_be_bytes(payload[4..12].try_into().expect("8 bytes")),
    ))
}

fn router_name(hash: &IdentHash) -> String {
    let name = hex::encode(hash);
    // two-level fan-out keyed by the first character
    format!("ri/{}/{}", &name[..1], name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use garlicnet_core::router_info::{BandwidthClass, CongestionLevel, RouterCaps, TransportAddress, TransportKind};
    use garlicnet_core::{MemoryStorage, PeerIdentity};
    use garlicnet_crypto::Identity;

    fn make_router_info(keys: &Identity, floodfill: bool) -> RouterInfo {
        let mut caps = RouterCaps::REACHABLE;
        if floodfill {
            caps |= RouterCaps::FLOODFILL;
        }
        let identity = PeerIdentity::new(
            keys.signing.public_key_bytes(),
            keys.encryption.public_key_bytes(),
        );
        // each identity listens on its own address
        let hash = identity.hash();
        let mut ri = RouterInfo {
            identity,
            published_ms: now_ms(),
            addresses: vec![TransportAddress {
                kind: TransportKind::Ntcp2,
                host: format!("10.{}.{}.{}", hash[0], hash[1], hash[2]),
                port: 9000,
            }],
            caps,
            bandwidth: BandwidthClass::High,
            congestion: CongestionLevel::Low,
            family: None,
            signature: [0u8; 64],
        };
        ri.signature = keys.signing.sign(&ri.signable_data());
        ri
    }

    fn make_netdb(floodfill: bool) -> NetDb {
        let config = RouterConfig {
            is_floodfill: floodfill,
            ..Default::default()
        };
        let (netdb, _rx) = NetDb::new(
            [0xFFu8; 32],
            config,
            Arc::new(ProfileStore::new()),
            Arc::new(MemoryStorage::new()),
        );
        netdb
    }

    #[test]
    fn test_add_router_info_newer_wins() {
        let mut netdb = make_netdb(false);
        let keys = Identity::generate();
        let mut ri = make_router_info(&keys, false);

        assert!(netdb.add_router_info(ri.clone()).unwrap());
        // same timestamp: no change
        assert!(!netdb.add_router_info(ri.clone()).unwrap());

        ri.published_ms += 1000;
        ri.signature = keys.signing.sign(&ri.signable_data());
        assert!(netdb.add_router_info(ri).unwrap());
    }

    #[test]
    fn test_closest_floodfills_ordered_by_xor() {
        let mut netdb = make_netdb(false);
        let mut idents = Vec::new();
        for _ in 0..50 {
            let keys = Identity::generate();
            let ri = make_router_info(&keys, true);
            idents.push(ri.hash());
            netdb.add_router_info(ri).unwrap();
        }

        let key = [0x42u8; 32];
        let closest = netdb.closest_floodfills(&key, 3, &[]);
        assert_eq!(closest.len(), 3);

        let target = routing_key(&key);
        let mut best: Vec<[u8; 32]> = idents
            .iter()
            .map(|ident| xor_distance(&target, ident))
            .collect();
        best.sort();
        assert_eq!(xor_distance(&target, &closest[0]), best[0]);

        // excluding the winner must strictly increase the top distance
        let closest2 = netdb.closest_floodfills(&key, 3, &[closest[0]]);
        assert!(xor_distance(&target, &closest2[0]) > xor_distance(&target, &closest[0]));
    }

    #[test]
    fn test_lease_set_rejected_when_not_floodfill() {
        let mut netdb = make_netdb(false);
        let keys = Identity::generate();
        let ls = make_lease_set(&keys);
        assert!(matches!(
            netdb.add_lease_set(ls, false),
            Err(NetDbError::StoreRejected(_))
        ));
    }

    #[test]
    fn test_lease_set_accepted_as_floodfill() {
        let mut netdb = make_netdb(true);
        let keys = Identity::generate();
        let ls = make_lease_set(&keys);
        let hash = ls.dest_hash();
        assert!(netdb.add_lease_set(ls, false).unwrap());
        assert!(netdb.lookup_lease_set(&hash).is_some());
    }

    fn make_lease_set(keys: &Identity) -> LeaseSet {
        let mut ls = LeaseSet {
            destination: PeerIdentity::new(
                keys.signing.public_key_bytes(),
                keys.encryption.public_key_bytes(),
            ),
            encryption_pubkey: keys.encryption.public_key_bytes(),
            leases: vec![garlicnet_core::Lease {
                tunnel_gateway: [1u8; 32],
                tunnel_id: 5,
                end_time_ms: now_ms() + 600_000,
            }],
            published_ms: now_ms(),
            store_type: 3,
            flags: 0,
            signature: [0u8; 64],
        };
        ls.signature = keys.signing.sign(&ls.signable_data());
        ls
    }

    #[test]
    fn test_lookup_replies_with_search_reply_when_missing() {
        let mut netdb = make_netdb(true);
        for _ in 0..5 {
            let keys = Identity::generate();
            netdb.add_router_info(make_router_info(&keys, true)).unwrap();
        }

        let lookup = DatabaseLookupMsg {
            key: [9u8; 32],
            from: [8u8; 32],
            kind: LookupKind::LeaseSet,
            reply_tunnel_id: None,
            excluded: vec![],
            reply_key_tag: None,
        };
        let msg = I2npMessage::new(MessageType::DatabaseLookup, 1, &lookup.to_payload());
        let events = netdb.handle_message([8u8; 32], &msg);
        assert_eq!(events.len(), 1);
        match &events[0] {
            NetDbEvent::SendDirect { to, msg } => {
                assert_eq!(*to, [8u8; 32]);
                assert_eq!(msg.msg_type(), MessageType::DatabaseSearchReply);
                let reply = DatabaseSearchReplyMsg::parse(msg.payload()).unwrap();
                assert!(reply.peers.len() <= SEARCH_REPLY_WIDTH);
                assert!(!reply.peers.is_empty());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_store_with_reply_token_sends_delivery_status() {
        let mut netdb = make_netdb(true);
        let keys = Identity::generate();
        let ri = make_router_info(&keys, false);

        let store = DatabaseStoreMsg {
            key: ri.hash(),
            store_type: STORE_TYPE_ROUTER_INFO,
            reply_token: 777,
            reply_tunnel: None,
            data: ri.to_bytes(),
        };
        let msg = I2npMessage::new(MessageType::DatabaseStore, 1, &store.to_payload());
        let events = netdb.handle_message([5u8; 32], &msg);

        let status = events
            .iter()
            .find_map(|e| match e {
                NetDbEvent::SendDirect { to, msg }
                    if msg.msg_type() == MessageType::DeliveryStatus =>
                {
                    Some((*to, msg.clone()))
                }
                _ => None,
            })
            .expect("delivery status reply");
        assert_eq!(status.0, [5u8; 32]);
        let (token, _ts) = parse_delivery_status(status.1.payload()).unwrap();
        assert_eq!(token, 777);
    }

    #[test]
    fn test_maintenance_keeps_router_floor() {
        let mut netdb = make_netdb(false);
        netdb.config.min_routers = 3;
        for _ in 0..3 {
            let keys = Identity::generate();
            let mut ri = make_router_info(&keys, false);
            // ancient
            ri.published_ms = 1;
            ri.signature = keys.signing.sign(&ri.signable_data());
            netdb.routers.insert(ri.hash(), Arc::new(ri));
        }
        netdb.maintenance();
        assert_eq!(netdb.router_count(), 3);
    }

    #[test]
    fn test_maintenance_triggers_reseed_when_small() {
        let mut netdb = make_netdb(false);
        let events = netdb.maintenance();
        assert!(events.iter().any(|e| matches!(e, NetDbEvent::Reseed)));
    }

    #[test]
    fn test_request_destination_known_router_completes_immediately() {
        let mut netdb = make_netdb(false);
        let keys = Identity::generate();
        let ri = make_router_info(&keys, false);
        let hash = ri.hash();
        netdb.add_router_info(ri).unwrap();

        let (tx, mut rx) = oneshot::channel();
        let events = netdb.request_destination(hash, LookupKind::RouterInfo, tx);
        assert!(events.is_empty());
        assert!(matches!(rx.try_recv(), Ok(Some(LookupResult::Router(_)))));
    }

    #[test]
    fn test_request_destination_emits_lookup() {
        let mut netdb = make_netdb(false);
        for _ in 0..4 {
            let keys = Identity::generate();
            netdb.add_router_info(make_router_info(&keys, true)).unwrap();
        }
        let (tx, _rx) = oneshot::channel();
        let events = netdb.request_destination([7u8; 32], LookupKind::LeaseSet, tx);
        assert!(matches!(events[0], NetDbEvent::SendLookup { .. }));
    }

    #[test]
    fn test_delivery_status_roundtrip() {
        let payload = delivery_status_payload(42, 123456);
        assert_eq!(parse_delivery_status(&payload).unwrap(), (42, 123456));
    }

    #[test]
    fn test_shared_address_marks_duplicated() {
        let mut netdb = make_netdb(false);
        let first_keys = Identity::generate();
        let mut first = make_router_info(&first_keys, false);
        first.addresses[0].host = "192.0.2.7".into();
        first.signature = first_keys.signing.sign(&first.signable_data());
        netdb.add_router_info(first.clone()).unwrap();

        let second_keys = Identity::generate();
        let mut second = make_router_info(&second_keys, false);
        second.addresses[0].host = "192.0.2.7".into();
        second.published_ms = first.published_ms + 1;
        second.signature = second_keys.signing.sign(&second.signable_data());
        netdb.add_router_info(second.clone()).unwrap();

        // the earlier arrival keeps the address; the later one is the
        // duplicate
        assert!(!netdb.profiles.is_duplicated(&first.hash()));
        assert!(netdb.profiles.is_duplicated(&second.hash()));

        let third_keys = Identity::generate();
        let third = make_router_info(&third_keys, false);
        netdb.add_router_info(third.clone()).unwrap();
        assert!(!netdb.profiles.is_duplicated(&third.hash()));
    }
}
