//! Tunnel pools
//!
//! One pool per local destination (plus the shared exploratory pool). The
//! pool keeps its inbound and outbound sets at their configured quantity,
//! replaces tunnels ahead of expiry, pairs tunnels for the periodic test
//! loop and answers selection queries with a bias against slow tunnels.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, info, warn};

use garlicnet_core::{now_ms, IdentHash, RouterInfo, TransportSet};
use garlicnet_netdb::{NetDbSnapshot, ProfileStore};

use crate::tunnel::{Tunnel, TunnelState, MAX_TUNNEL_LENGTH};

/// Pool management cadence
pub const POOL_MANAGE_INTERVAL_MS: u64 = 5_000;

/// Tunnel test cadence
pub const TUNNEL_TEST_INTERVAL_MS: u64 = 15_000;

/// EWMA smoothing constant for the pool's creation success rate
const TCSR_SMOOTHING: f64 = 0.0005;

/// Who consumes messages arriving through this pool's inbound tunnels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolOwner {
    /// The router itself: netdb lookups, build replies, publication
    Exploratory,
    /// A local destination, keyed by its identity hash
    Destination(IdentHash),
}

/// Overrides the default weighted-random hop selection for a pool.
pub trait PeerSelector: Send + Sync {
    fn select_peers(
        &self,
        length: usize,
        snapshot: &NetDbSnapshot,
        profiles: &ProfileStore,
        local: &IdentHash,
    ) -> Option<Vec<Arc<RouterInfo>>>;
}

/// Pool shape parameters
#[derive(Clone)]
pub struct PoolSettings {
    pub in_length: usize,
    pub out_length: usize,
    pub in_quantity: usize,
    pub out_quantity: usize,
    /// Hop-count jitter, applied as `uniform[-|var|, +|var|]`
    pub in_variance: i32,
    pub out_variance: i32,
    /// Optional latency window tunnels should fall into, ms
    pub latency_range: Option<(u32, u32)>,
    /// Restrict hop selection to these routers
    pub explicit_peers: Option<Vec<IdentHash>>,
    /// Fully custom hop selection
    pub selector: Option<Arc<dyn PeerSelector>>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            in_length: 3,
            out_length: 3,
            in_quantity: 5,
            out_quantity: 5,
            in_variance: 0,
            out_variance: 0,
            latency_range: None,
            explicit_peers: None,
            selector: None,
        }
    }
}

impl PoolSettings {
    /// Exploratory pools are short and small.
    pub fn exploratory() -> Self {
        Self {
            in_length: 2,
            out_length: 2,
            in_quantity: 3,
            out_quantity: 3,
            in_variance: 0,
            out_variance: 0,
            latency_range: None,
            explicit_peers: None,
            selector: None,
        }
    }

    fn jittered_len(&self, base: usize, variance: i32) -> usize {
        if variance == 0 {
            return base.min(MAX_TUNNEL_LENGTH);
        }
        let spread = variance.unsigned_abs() as i64;
        let jitter = rand::thread_rng().gen_range(-spread..=spread);
        (base as i64 + jitter).clamp(0, MAX_TUNNEL_LENGTH as i64) as usize
    }

    pub fn next_in_length(&self) -> usize {
        self.jittered_len(self.in_length, self.in_variance)
    }

    pub fn next_out_length(&self) -> usize {
        self.jittered_len(self.out_length, self.out_variance)
    }
}

/// An in-flight tunnel test
struct PendingTest {
    outbound_id: u32,
    inbound_id: u32,
}

/// What the manager should build next for this pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolDemand {
    pub inbound: usize,
    pub outbound: usize,
}

pub struct TunnelPool {
    pub id: u32,
    pub owner: PoolOwner,
    pub settings: PoolSettings,
    pub inbound: Vec<Tunnel>,
    pub outbound: Vec<Tunnel>,
    /// msg_id → tunnel pair under test
    tests: HashMap<u32, PendingTest>,
    /// One-time garlic tags for test replies: tag → key
    test_tags: HashMap<[u8; 8], [u8; 32]>,
    /// Builds currently in flight, counted against demand
    pub pending_inbound: usize,
    pub pending_outbound: usize,
    /// Creation success rate EWMA, for telemetry
    success_rate: f64,
    last_test_ms: u64,
}

impl TunnelPool {
    pub fn new(id: u32, owner: PoolOwner, settings: PoolSettings) -> Self {
        Self {
            id,
            owner,
            settings,
            inbound: Vec::new(),
            outbound: Vec::new(),
            tests: HashMap::new(),
            test_tags: HashMap::new(),
            pending_inbound: 0,
            pending_outbound: 0,
            success_rate: 0.1,
            last_test_ms: 0,
        }
    }

    pub fn find(&self, tunnel_id: u32, inbound: bool) -> Option<&Tunnel> {
        let set = if inbound { &self.inbound } else { &self.outbound };
        set.iter().find(|t| t.tunnel_id == tunnel_id)
    }

    pub fn find_mut(&mut self, tunnel_id: u32, inbound: bool) -> Option<&mut Tunnel> {
        let set = if inbound {
            &mut self.inbound
        } else {
            &mut self.outbound
        };
        set.iter_mut().find(|t| t.tunnel_id == tunnel_id)
    }

    /// How many tunnels of each direction are missing, counting pending
    /// builds and tunnels already marked for replacement.
    pub fn demand(&self) -> PoolDemand {
        let live_in = self
            .inbound
            .iter()
            .filter(|t| t.is_established() && !t.needs_recreation() && !t.is_expiring())
            .count();
        let pending_in = self.pending_inbound
            + self
                .inbound
                .iter()
                .filter(|t| t.state == TunnelState::Pending)
                .count();
        let live_out = self
            .outbound
            .iter()
            .filter(|t| t.is_established() && !t.needs_recreation() && !t.is_expiring())
            .count();
        let pending_out = self.pending_outbound
            + self
                .outbound
                .iter()
                .filter(|t| t.state == TunnelState::Pending)
                .count();
        PoolDemand {
            inbound: self
                .settings
                .in_quantity
                .saturating_sub(live_in + pending_in),
            outbound: self
                .settings
                .out_quantity
                .saturating_sub(live_out + pending_out),
        }
    }

    /// Record a build outcome for the success-rate EWMA.
    pub fn record_build_result(&mut self, success: bool) {
        let sample = if success { 1.0 } else { 0.0 };
        self.success_rate += TCSR_SMOOTHING * (sample - self.success_rate);
    }

    pub fn success_rate(&self) -> f64 {
        self.success_rate
    }

    /// Drop expired tunnels; returns true when the inbound set changed
    /// (the owner must republish its lease set).
    pub fn expire_tunnels(&mut self) -> bool {
        let before = self.inbound.len();
        self.inbound.retain(|t| !t.is_expired() && !t.is_failed());
        let inbound_changed = self.inbound.len() != before;
        self.outbound.retain(|t| !t.is_expired() && !t.is_failed());

        for tunnel in self.inbound.iter_mut().chain(self.outbound.iter_mut()) {
            if tunnel.is_expiring() && tunnel.state == TunnelState::Established {
                tunnel.state = TunnelState::Expiring;
            }
        }
        inbound_changed
    }

    /// Uniform pick among established outbound tunnels reaching a
    /// compatible far end, preferring ones that are neither slow nor
    /// outside the pool's latency range; relaxes when nothing qualifies.
    pub fn next_outbound(
        &self,
        exclude: &[u32],
        compatible: TransportSet,
        far_transports: impl Fn(&IdentHash) -> TransportSet,
    ) -> Option<&Tunnel> {
        self.pick(&self.outbound, exclude, compatible, far_transports)
    }

    pub fn next_inbound(
        &self,
        exclude: &[u32],
        compatible: TransportSet,
        far_transports: impl Fn(&IdentHash) -> TransportSet,
    ) -> Option<&Tunnel> {
        self.pick(&self.inbound, exclude, compatible, far_transports)
    }

    fn pick<'a>(
        &self,
        set: &'a [Tunnel],
        exclude: &[u32],
        compatible: TransportSet,
        far_transports: impl Fn(&IdentHash) -> TransportSet,
    ) -> Option<&'a Tunnel> {
        let eligible: Vec<&Tunnel> = set
            .iter()
            .filter(|t| t.is_established() && !t.is_expiring())
            .filter(|t| !exclude.contains(&t.tunnel_id))
            .filter(|t| match t.far_end() {
                Some(hop) => far_transports(&hop.ident).intersects_with(compatible),
                // zero-hop tunnels end at ourselves
                None => true,
            })
            .collect();
        if eligible.is_empty() {
            return None;
        }

        let preferred: Vec<&&Tunnel> = eligible
            .iter()
            .filter(|t| !t.is_slow())
            .filter(|t| match self.settings.latency_range {
                Some((low, high)) => t.latency_us.is_none() || t.latency_fits(low, high),
                None => true,
            })
            .collect();

        let mut rng = rand::thread_rng();
        if let Some(tunnel) = preferred.choose(&mut rng) {
            return Some(**tunnel);
        }
        eligible.choose(&mut rng).copied()
    }

    /// Choose hops for a new tunnel.
    ///
    /// Weighted random over the netDb snapshot filtered by profile and
    /// reachability; explicit peer lists bypass the filter. The hop
    /// adjacent to us is biased toward already-connected peers via
    /// `is_connected`.
    pub fn select_hops(
        &self,
        length: usize,
        snapshot: &NetDbSnapshot,
        profiles: &ProfileStore,
        local: &IdentHash,
        is_connected: impl Fn(&IdentHash) -> bool,
    ) -> Option<Vec<Arc<RouterInfo>>> {
        if length == 0 {
            return Some(Vec::new());
        }

        if let Some(selector) = &self.settings.selector {
            return selector.select_peers(length, snapshot, profiles, local);
        }

        if let Some(explicit) = &self.settings.explicit_peers {
            let mut hops = Vec::with_capacity(length);
            for ident in explicit.iter().take(length) {
                hops.push(
                    snapshot
                        .routers
                        .iter()
                        .find(|ri| ri.hash() == *ident)?
                        .clone(),
                );
            }
            return (hops.len() == length).then_some(hops);
        }

        let mut chosen: Vec<Arc<RouterInfo>> = Vec::with_capacity(length);
        let mut used: HashSet<IdentHash> = HashSet::new();
        used.insert(*local);

        for position in 0..length {
            let candidates: Vec<&Arc<RouterInfo>> = snapshot
                .routers
                .iter()
                .filter(|ri| ri.is_reachable())
                .filter(|ri| {
                    ri.congestion != garlicnet_core::CongestionLevel::Full
                })
                .filter(|ri| !used.contains(&ri.hash()))
                .filter(|ri| !profiles.is_bad(&ri.hash()))
                .collect();
            if candidates.is_empty() {
                debug!("pool {}: no eligible hop for position {}", self.id, position);
                return None;
            }

            // the hop adjacent to us prefers routers we already talk to
            let pick = if position == 0 {
                let connected: Vec<&&Arc<RouterInfo>> = candidates
                    .iter()
                    .filter(|ri| is_connected(&ri.hash()))
                    .collect();
                if connected.is_empty() {
                    weighted_pick(&candidates)
                } else {
                    **connected
                        .choose(&mut rand::thread_rng())
                        .expect("non-empty")
                }
            } else {
                weighted_pick(&candidates)
            };

            used.insert(pick.hash());
            chosen.push(pick.clone());
        }
        Some(chosen)
    }

    /// Whether the 15-second test cadence has come around.
    pub fn test_due(&self, now_ms: u64) -> bool {
        self.last_test_ms + TUNNEL_TEST_INTERVAL_MS <= now_ms
    }

    /// Fail tunnels whose previous test never came back, then pair
    /// established tunnels for a new round. Returns the test payload
    /// descriptors for the manager to wrap and send.
    pub fn start_test_round(&mut self) -> Vec<TunnelTestOrder> {
        self.last_test_ms = now_ms();

        // anything still pending from the previous round failed
        let failed: Vec<PendingTest> = self.tests.drain().map(|(_, t)| t).collect();
        self.test_tags.clear();
        for test in failed {
            warn!("pool {}: tunnel test failed for pair ({}, {})", self.id, test.outbound_id, test.inbound_id);
            Self::fail_tested(&mut self.outbound, test.outbound_id, self.settings.out_quantity);
            Self::fail_tested(&mut self.inbound, test.inbound_id, self.settings.in_quantity);
        }
        self.outbound.retain(|t| !t.is_failed());
        self.inbound.retain(|t| !t.is_failed());

        // zero-hop tunnels have nothing to probe
        let mut outs: Vec<u32> = self
            .outbound
            .iter()
            .filter(|t| t.is_established() && t.num_hops() > 0)
            .map(|t| t.tunnel_id)
            .collect();
        let mut ins: Vec<u32> = self
            .inbound
            .iter()
            .filter(|t| t.is_established() && t.num_hops() > 0)
            .map(|t| t.tunnel_id)
            .collect();
        let mut rng = rand::thread_rng();
        outs.shuffle(&mut rng);
        ins.shuffle(&mut rng);

        let mut orders = Vec::new();
        for (outbound_id, inbound_id) in outs.into_iter().zip(ins) {
            let msg_id: u32 = rng.gen();
            let mut key = [0u8; 32];
            let mut tag = [0u8; 8];
            rng.fill(&mut key);
            rng.fill(&mut tag);
            self.tests.insert(
                msg_id,
                PendingTest {
                    outbound_id,
                    inbound_id,
                },
            );
            self.test_tags.insert(tag, key);
            orders.push(TunnelTestOrder {
                msg_id,
                outbound_id,
                inbound_id,
                key,
                tag,
            });
        }
        orders
    }

    fn fail_tested(set: &mut [Tunnel], tunnel_id: u32, quantity: usize) {
        let len = set.len();
        if let Some(tunnel) = set.iter_mut().find(|t| t.tunnel_id == tunnel_id) {
            match tunnel.state {
                TunnelState::TestFailed if len > 1 || quantity <= 1 => {
                    tunnel.state = TunnelState::Failed;
                }
                TunnelState::Expiring | TunnelState::Failed => {}
                _ => tunnel.state = TunnelState::TestFailed,
            }
        }
    }

    /// Look up a one-time test tag; consuming it retires the key.
    pub fn take_test_tag(&mut self, tag: &[u8; 8]) -> Option<[u8; 32]> {
        self.test_tags.remove(tag)
    }

    /// A test reply arrived: restore both tunnels, feed the latency EWMA.
    pub fn process_test_response(&mut self, msg_id: u32, sent_us: u64, now_us: u64) -> bool {
        let Some(test) = self.tests.remove(&msg_id) else {
            return false;
        };
        let rtt_us = now_us.saturating_sub(sent_us) as u32;
        let total_hops: usize = [
            self.find(test.outbound_id, false).map(|t| t.num_hops()),
            self.find(test.inbound_id, true).map(|t| t.num_hops()),
        ]
        .into_iter()
        .flatten()
        .sum();

        for (tunnel_id, inbound) in [(test.outbound_id, false), (test.inbound_id, true)] {
            if let Some(tunnel) = self.find_mut(tunnel_id, inbound) {
                if tunnel.state != TunnelState::Expiring {
                    tunnel.state = TunnelState::Established;
                }
                let share = if total_hops > 0 {
                    rtt_us * tunnel.num_hops() as u32 / total_hops as u32
                } else {
                    rtt_us / 2
                };
                tunnel.add_latency_sample(share.max(1));
            }
        }
        info!("pool {}: test {} returned in {} us", self.id, msg_id, rtt_us);
        true
    }
}

/// A tunnel test the manager must wrap and send
#[derive(Debug, Clone, Copy)]
pub struct TunnelTestOrder {
    pub msg_id: u32,
    pub outbound_id: u32,
    pub inbound_id: u32,
    pub key: [u8; 32],
    pub tag: [u8; 8],
}

fn weighted_pick<'a>(candidates: &[&'a Arc<RouterInfo>]) -> &'a Arc<RouterInfo> {
    use garlicnet_core::BandwidthClass;
    let weight = |ri: &RouterInfo| -> u32 {
        match ri.bandwidth {
            BandwidthClass::Low => 1,
            BandwidthClass::Medium => 2,
            BandwidthClass::High => 4,
            BandwidthClass::Unlimited => 8,
        }
    };
    let total: u32 = candidates.iter().map(|ri| weight(ri)).sum();
    let mut roll = rand::thread_rng().gen_range(0..total.max(1));
    for candidate in candidates {
        let w = weight(candidate);
        if roll < w {
            return candidate;
        }
        roll -= w;
    }
    candidates.last().expect("non-empty")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::{TunnelHop, TUNNEL_EXPIRATION_MS};
    use garlicnet_core::router_info::{
        BandwidthClass, CongestionLevel, RouterCaps, TransportAddress, TransportKind,
    };
    use garlicnet_core::PeerIdentity;
    use garlicnet_crypto::{Identity, TunnelLayerCipher};

    fn make_tunnel(id: u32, inbound: bool, state: TunnelState) -> Tunnel {
        let hops = vec![TunnelHop {
            ident: [id as u8; 32],
            static_key: [0u8; 32],
            receive_tunnel_id: id * 10,
            cipher: TunnelLayerCipher::new(&[1u8; 32], &[2u8; 32]),
        }];
        let mut tunnel = Tunnel::new(id, inbound, hops);
        tunnel.state = state;
        tunnel
    }

    fn make_snapshot(n: usize) -> NetDbSnapshot {
        let routers = (0..n)
            .map(|_| {
                let keys = Identity::generate();
                let mut ri = RouterInfo {
                    identity: PeerIdentity::new(
                        keys.signing.public_key_bytes(),
                        keys.encryption.public_key_bytes(),
                    ),
                    published_ms: now_ms(),
                    addresses: vec![TransportAddress {
                        kind: TransportKind::Ntcp2,
                        host: "10.0.0.1".into(),
                        port: 9000,
                    }],
                    caps: RouterCaps::REACHABLE,
                    bandwidth: BandwidthClass::High,
                    congestion: CongestionLevel::Low,
                    family: None,
                    signature: [0u8; 64],
                };
                ri.signature = keys.signing.sign(&ri.signable_data());
                Arc::new(ri)
            })
            .collect();
        NetDbSnapshot {
            routers,
            floodfills: Vec::new(),
        }
    }

    #[test]
    fn test_demand_counts_pending() {
        let mut pool = TunnelPool::new(1, PoolOwner::Exploratory, PoolSettings::exploratory());
        assert_eq!(pool.demand(), PoolDemand { inbound: 3, outbound: 3 });

        pool.inbound.push(make_tunnel(1, true, TunnelState::Established));
        pool.pending_outbound = 2;
        let demand = pool.demand();
        assert_eq!(demand.inbound, 2);
        assert_eq!(demand.outbound, 1);
    }

    #[test]
    fn test_expire_reports_inbound_change() {
        let mut pool = TunnelPool::new(1, PoolOwner::Exploratory, PoolSettings::default());
        let mut tunnel = make_tunnel(1, true, TunnelState::Established);
        tunnel.created_ms -= TUNNEL_EXPIRATION_MS + 1;
        pool.inbound.push(tunnel);
        pool.outbound.push(make_tunnel(2, false, TunnelState::Established));

        assert!(pool.expire_tunnels());
        assert!(pool.inbound.is_empty());
        assert_eq!(pool.outbound.len(), 1);
    }

    #[test]
    fn test_selection_skips_excluded_and_slow() {
        let mut pool = TunnelPool::new(1, PoolOwner::Exploratory, PoolSettings::default());
        let mut slow = make_tunnel(1, false, TunnelState::Established);
        slow.add_latency_sample(10_000_000);
        pool.outbound.push(slow);
        pool.outbound.push(make_tunnel(2, false, TunnelState::Established));

        let all = TransportSet::all();
        let picked = pool
            .next_outbound(&[], all, |_| TransportSet::NTCP2_V4)
            .unwrap();
        assert_eq!(picked.tunnel_id, 2, "fast tunnel preferred");

        // excluding the fast one relaxes to the slow one
        let picked = pool
            .next_outbound(&[2], all, |_| TransportSet::NTCP2_V4)
            .unwrap();
        assert_eq!(picked.tunnel_id, 1);
    }

    #[test]
    fn test_selection_requires_transport_overlap() {
        let mut pool = TunnelPool::new(1, PoolOwner::Exploratory, PoolSettings::default());
        pool.outbound.push(make_tunnel(1, false, TunnelState::Established));

        let picked = pool.next_outbound(&[], TransportSet::SSU2_V4, |_| TransportSet::NTCP2_V4);
        assert!(picked.is_none());
    }

    #[test]
    fn test_select_hops_distinct_and_filtered() {
        let pool = TunnelPool::new(1, PoolOwner::Exploratory, PoolSettings::default());
        let snapshot = make_snapshot(20);
        let profiles = ProfileStore::new();
        let local = [0xAAu8; 32];

        let hops = pool
            .select_hops(3, &snapshot, &profiles, &local, |_| false)
            .unwrap();
        assert_eq!(hops.len(), 3);
        let mut idents: Vec<IdentHash> = hops.iter().map(|ri| ri.hash()).collect();
        idents.dedup();
        assert_eq!(idents.len(), 3, "hops must be distinct");
    }

    #[test]
    fn test_select_hops_fails_when_too_few_peers() {
        let pool = TunnelPool::new(1, PoolOwner::Exploratory, PoolSettings::default());
        let snapshot = make_snapshot(2);
        let profiles = ProfileStore::new();
        assert!(pool
            .select_hops(3, &snapshot, &profiles, &[0u8; 32], |_| false)
            .is_none());
    }

    #[test]
    fn test_zero_length_select() {
        let pool = TunnelPool::new(1, PoolOwner::Exploratory, PoolSettings::default());
        let snapshot = make_snapshot(0);
        let profiles = ProfileStore::new();
        let hops = pool
            .select_hops(0, &snapshot, &profiles, &[0u8; 32], |_| false)
            .unwrap();
        assert!(hops.is_empty());
    }

    #[test]
    fn test_test_round_pairs_and_failure_escalation() {
        // out_quantity 1 so the escalation path may remove the last tunnel
        let settings = PoolSettings {
            out_quantity: 1,
            ..Default::default()
        };
        let mut pool = TunnelPool::new(1, PoolOwner::Exploratory, settings);
        pool.outbound.push(make_tunnel(1, false, TunnelState::Established));
        pool.inbound.push(make_tunnel(2, true, TunnelState::Established));
        pool.inbound.push(make_tunnel(3, true, TunnelState::Established));

        let orders = pool.start_test_round();
        assert_eq!(orders.len(), 1, "pairs limited by the smaller side");

        // nobody answers: first miss marks TestFailed
        let orders2 = pool.start_test_round();
        let tested_out = pool.find(1, false).unwrap();
        assert_eq!(tested_out.state, TunnelState::TestFailed);

        // TestFailed tunnels still count as established, so they are
        // paired and, on a second miss, removed
        assert_eq!(orders2.len(), 1);
        pool.start_test_round();
        assert!(pool.find(1, false).is_none(), "second miss removes the tunnel");
    }

    #[test]
    fn test_test_response_restores_and_samples_latency() {
        let mut pool = TunnelPool::new(1, PoolOwner::Exploratory, PoolSettings::default());
        pool.outbound.push(make_tunnel(1, false, TunnelState::Established));
        pool.inbound.push(make_tunnel(2, true, TunnelState::Established));

        let orders = pool.start_test_round();
        let order = orders[0];
        assert!(pool.take_test_tag(&order.tag).is_some());
        assert!(pool.take_test_tag(&order.tag).is_none(), "tag consumed once");

        assert!(pool.process_test_response(order.msg_id, 1_000, 251_000));
        let outbound = pool.find(1, false).unwrap();
        assert_eq!(outbound.state, TunnelState::Established);
        assert!(outbound.latency_us.is_some());

        // next round has nothing pending to fail
        pool.start_test_round();
        assert!(pool.find(1, false).is_some());
    }

    #[test]
    fn test_jittered_length_clamped() {
        let settings = PoolSettings {
            in_length: 7,
            in_variance: 3,
            ..Default::default()
        };
        for _ in 0..50 {
            let len = settings.next_in_length();
            assert!(len <= MAX_TUNNEL_LENGTH);
        }
    }
}
