//! The tunnel manager
//!
//! Owns every tunnel this router knows about: its own pools, the transit
//! tunnels it carries for others, and the pending build table. Incoming
//! messages are batched (up to 100 per iteration) and touched outbound
//! tunnels are flushed once per batch.
//!
//! The manager is single-owner state driven by one task; it returns
//! `TunnelOutput` actions instead of talking to the transports directly so
//! the wiring layer stays testable.

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use tracing::{debug, info, warn};

use garlicnet_core::{
    now_ms, CongestionLevel, I2npMessage, IdentHash, MessageType, RouterConfig, TransportSet,
    TunnelId,
};
use garlicnet_crypto::{
    aead_decrypt, aead_encrypt, nonce_from_index, EncryptionKeypair, TunnelLayerCipher,
};
use garlicnet_netdb::{NetDbSnapshot, ProfileStore};

use crate::build::{
    create_build_request, parse_build_reply, BuildHop, BuildRequest, BuildRequestRecord,
    IncomingBuild, BUILD_ACCEPT, BUILD_REJECT_BANDWIDTH,
};
use crate::data::{TunnelDelivery, TunnelMessageBlock, TUNNEL_DATA_SIZE};
use crate::pool::{PoolOwner, PoolSettings, TunnelPool, TunnelTestOrder};
use crate::transit::{AdmissionContext, TransitAction, TransitRole, TransitTunnel};
use crate::tunnel::{random_tunnel_id, Tunnel, TunnelHop, TunnelState, BUILD_TIMEOUT_MS};
use crate::{Result, TunnelError};

/// Messages handled per batch before flushing touched tunnels
pub const MAX_BATCH_SIZE: usize = 100;

/// Timestamp granularity of tunnel tests, microseconds
fn now_us() -> u64 {
    now_ms() * 1000
}

/// Actions the wiring layer executes on the manager's behalf
#[derive(Debug)]
pub enum TunnelOutput {
    /// Hand to the transports
    SendDirect { to: IdentHash, msg: I2npMessage },
    /// A message arrived for a pool owner (garlic, netdb, destination)
    DeliverLocal { owner: PoolOwner, msg: I2npMessage },
    /// A pool's inbound set changed; its lease set must be republished
    LeaseSetChanged { pool_id: u32 },
}

struct PendingBuild {
    pool_id: u32,
    is_inbound: bool,
    tunnel: Tunnel,
    request: BuildRequest,
    hop_idents: Vec<IdentHash>,
    created_ms: u64,
}

pub struct TunnelManager {
    local: IdentHash,
    /// Router static key; build records addressed to us decrypt with it
    local_static: EncryptionKeypair,
    config: RouterConfig,
    pools: HashMap<u32, TunnelPool>,
    next_pool_id: u32,
    transit: HashMap<TunnelId, TransitTunnel>,
    /// Receive id → (pool id, inbound?) for tunnels we own
    owned: HashMap<TunnelId, (u32, bool)>,
    /// reply_msg_id → pending build
    pending: HashMap<u32, PendingBuild>,
    profiles: Arc<ProfileStore>,
}

impl TunnelManager {
    pub fn new(
        local: IdentHash,
        local_static: EncryptionKeypair,
        config: RouterConfig,
        profiles: Arc<ProfileStore>,
    ) -> Self {
        let mut manager = Self {
            local,
            local_static,
            config,
            pools: HashMap::new(),
            next_pool_id: 1,
            transit: HashMap::new(),
            owned: HashMap::new(),
            pending: HashMap::new(),
            profiles,
        };
        // pool 0 is the shared exploratory pool
        manager.pools.insert(
            0,
            TunnelPool::new(0, PoolOwner::Exploratory, PoolSettings::exploratory()),
        );
        manager
    }

    pub fn exploratory_pool_id(&self) -> u32 {
        0
    }

    pub fn create_pool(&mut self, owner: PoolOwner, settings: PoolSettings) -> u32 {
        let id = self.next_pool_id;
        self.next_pool_id += 1;
        self.pools.insert(id, TunnelPool::new(id, owner, settings));
        id
    }

    /// Detach a destination's pool; its tunnels are dropped along with
    /// their timers and pending builds.
    pub fn remove_pool(&mut self, pool_id: u32) {
        if let Some(pool) = self.pools.remove(&pool_id) {
            for tunnel in pool.inbound.iter().chain(pool.outbound.iter()) {
                self.owned.remove(&tunnel.tunnel_id);
            }
        }
        self.pending.retain(|_, p| p.pool_id != pool_id);
    }

    pub fn pool(&self, pool_id: u32) -> Option<&TunnelPool> {
        self.pools.get(&pool_id)
    }

    pub fn pool_mut(&mut self, pool_id: u32) -> Option<&mut TunnelPool> {
        self.pools.get_mut(&pool_id)
    }

    pub fn transit_count(&self) -> usize {
        self.transit.len()
    }

    /// Transit load expressed as a congestion level, published in our
    /// RouterInfo.
    pub fn congestion_level(&self) -> CongestionLevel {
        self.admission_context().congestion()
    }

    fn admission_context(&self) -> AdmissionContext {
        AdmissionContext {
            accept_tunnels: self.config.accept_tunnels,
            current_transit: self.transit.len(),
            max_transit: self.config.max_transit_tunnels,
            local_ident: self.local,
            profiles: self.profiles.clone(),
        }
    }

    // ---- message handling -------------------------------------------------

    /// Typed dispatch for every tunnel-bound message.
    pub fn handle_message(&mut self, msg: I2npMessage) -> Vec<TunnelOutput> {
        let result = match msg.msg_type() {
            MessageType::TunnelData => self.handle_tunnel_data(&msg),
            MessageType::TunnelGateway => self.handle_tunnel_gateway(&msg),
            MessageType::ShortTunnelBuild => self.handle_build(&msg),
            MessageType::ShortTunnelBuildReply => self.handle_build_reply(&msg),
            other => {
                warn!("tunnel manager received unexpected {:?}", other);
                Ok(Vec::new())
            }
        };
        match result {
            Ok(outputs) => outputs,
            Err(e) => {
                debug!("tunnel message dropped: {}", e);
                Vec::new()
            }
        }
    }

    fn handle_tunnel_data(&mut self, msg: &I2npMessage) -> Result<Vec<TunnelOutput>> {
        let payload = msg.payload();
        if payload.len() != 4 + TUNNEL_DATA_SIZE {
            return Err(TunnelError::MalformedFrame("bad tunnel data size"));
        }
        let tunnel_id = u32::from_be_bytes(payload[..4].try_into().expect("4 bytes"));
        let frame: [u8; TUNNEL_DATA_SIZE] =
            payload[4..].try_into().expect("fixed frame size");

        if let Some(transit) = self.transit.get_mut(&tunnel_id) {
            let actions = transit.handle_tunnel_data(&frame)?;
            return Ok(self.transit_actions_to_outputs(actions));
        }

        let Some(&(pool_id, is_inbound)) = self.owned.get(&tunnel_id) else {
            return Err(TunnelError::UnknownTunnel(tunnel_id));
        };
        if !is_inbound {
            return Err(TunnelError::WrongRole("tunnel data on outbound id"));
        }
        let pool = self
            .pools
            .get_mut(&pool_id)
            .ok_or(TunnelError::UnknownTunnel(tunnel_id))?;
        let owner = pool.owner;
        let tunnel = pool
            .find_mut(tunnel_id, true)
            .ok_or(TunnelError::UnknownTunnel(tunnel_id))?;

        let mut frame = frame;
        tunnel.owner_transform(&mut frame);
        let blocks = tunnel.endpoint.process_frame(&frame)?;

        let mut outputs = Vec::new();
        for block in blocks {
            match block.delivery {
                TunnelDelivery::Local => {
                    outputs.extend(self.deliver_local(pool_id, owner, block.msg))
                }
                TunnelDelivery::Tunnel { to, tunnel_id } => outputs.push(TunnelOutput::SendDirect {
                    to,
                    msg: block
                        .msg
                        .wrap_gateway(tunnel_id, garlicnet_core::i2np::random_msg_id()),
                }),
                TunnelDelivery::Router { to } => {
                    outputs.push(TunnelOutput::SendDirect { to, msg: block.msg })
                }
            }
        }
        Ok(outputs)
    }

    /// Local deliveries out of an inbound endpoint. Tunnel tests and build
    /// replies are consumed here; everything else goes to the pool owner.
    fn deliver_local(
        &mut self,
        pool_id: u32,
        owner: PoolOwner,
        msg: I2npMessage,
    ) -> Vec<TunnelOutput> {
        match msg.msg_type() {
            MessageType::Garlic => {
                // one-time test tags take the fast path
                if let Some(inner) = self.try_unwrap_test(pool_id, &msg) {
                    return self.deliver_local(pool_id, owner, inner);
                }
                vec![TunnelOutput::DeliverLocal { owner, msg }]
            }
            MessageType::TunnelTest => {
                if let Some(pool) = self.pools.get_mut(&pool_id) {
                    let payload = msg.payload();
                    if payload.len() >= 12 {
                        let msg_id =
                            u32::from_be_bytes(payload[..4].try_into().expect("4 bytes"));
                        let sent_us =
                            u64::from_be_bytes(payload[4..12].try_into().expect("8 bytes"));
                        pool.process_test_response(msg_id, sent_us, now_us());
                    }
                }
                Vec::new()
            }
            MessageType::ShortTunnelBuildReply => self
                .handle_build_reply(&msg)
                .unwrap_or_default(),
            _ => vec![TunnelOutput::DeliverLocal { owner, msg }],
        }
    }

    fn try_unwrap_test(&mut self, pool_id: u32, msg: &I2npMessage) -> Option<I2npMessage> {
        let payload = msg.payload();
        if payload.len() < 8 + 16 {
            return None;
        }
        let tag: [u8; 8] = payload[..8].try_into().expect("8 bytes");
        let pool = self.pools.get_mut(&pool_id)?;
        let key = pool.take_test_tag(&tag)?;
        let inner = aead_decrypt(&key, &nonce_from_index(0), &tag, &payload[8..]).ok()?;
        I2npMessage::parse(&inner, self.config.clock_skew_ms).ok()
    }

    fn handle_tunnel_gateway(&mut self, msg: &I2npMessage) -> Result<Vec<TunnelOutput>> {
        let (tunnel_id, inner_bytes) = garlicnet_core::i2np::parse_gateway_payload(msg.payload())?;
        let inner = I2npMessage::parse(inner_bytes, self.config.clock_skew_ms)?;

        if let Some(transit) = self.transit.get_mut(&tunnel_id) {
            let actions = transit.handle_tunnel_gateway(inner)?;
            return Ok(self.transit_actions_to_outputs(actions));
        }

        // zero-hop inbound: the lease points straight at us
        if let Some(&(pool_id, true)) = self.owned.get(&tunnel_id) {
            let owner = self
                .pools
                .get(&pool_id)
                .map(|p| p.owner)
                .ok_or(TunnelError::UnknownTunnel(tunnel_id))?;
            return Ok(self.deliver_local(pool_id, owner, inner));
        }
        Err(TunnelError::UnknownTunnel(tunnel_id))
    }

    fn transit_actions_to_outputs(&self, actions: Vec<TransitAction>) -> Vec<TunnelOutput> {
        actions
            .into_iter()
            .map(|action| match action {
                TransitAction::SendDirect { to, msg } => TunnelOutput::SendDirect { to, msg },
                TransitAction::DeliverLocal { msg } => TunnelOutput::DeliverLocal {
                    owner: PoolOwner::Exploratory,
                    msg,
                },
            })
            .collect()
    }

    // ---- responder side ---------------------------------------------------

    /// A build request reached us as a candidate hop.
    fn handle_build(&mut self, msg: &I2npMessage) -> Result<Vec<TunnelOutput>> {
        // an inbound build's last hop forwards the processed record set to
        // the requester as a plain ShortTunnelBuild; recognize ours by the
        // pending reply id
        if self.pending.contains_key(&msg.msg_id()) {
            return self.handle_build_reply(msg);
        }

        let mut incoming = IncomingBuild::parse(msg.payload())?;
        let Some((slot, record, crypto)) =
            incoming.find_our_record(&self.local, &self.local_static)
        else {
            debug!("build request without our record, dropped");
            return Ok(Vec::new());
        };

        let verdict = self.build_verdict(&record);
        if verdict == BUILD_ACCEPT {
            let role = if record.is_inbound_gateway {
                TransitRole::InboundGateway
            } else if record.is_outbound_endpoint {
                TransitRole::OutboundEndpoint
            } else {
                TransitRole::Participant
            };
            self.transit.insert(
                record.receive_tunnel_id,
                TransitTunnel::new(
                    role,
                    record.receive_tunnel_id,
                    record.next_tunnel_id,
                    record.next_ident,
                    &record.layer_key,
                    &record.iv_key,
                    self.config.clock_skew_ms,
                ),
            );
            info!(
                "accepted transit tunnel {} ({:?})",
                record.receive_tunnel_id, role
            );
        }
        incoming.write_reply(slot, &crypto.reply_key, verdict);

        // forward, or reply if we are the last hop
        let outputs = if record.is_outbound_endpoint {
            let reply = I2npMessage::new(
                MessageType::ShortTunnelBuildReply,
                record.reply_msg_id,
                &incoming.to_payload(),
            );
            if record.next_tunnel_id != 0 {
                vec![TunnelOutput::SendDirect {
                    to: record.next_ident,
                    msg: reply.wrap_gateway(
                        record.next_tunnel_id,
                        garlicnet_core::i2np::random_msg_id(),
                    ),
                }]
            } else {
                vec![TunnelOutput::SendDirect {
                    to: record.next_ident,
                    msg: reply,
                }]
            }
        } else {
            vec![TunnelOutput::SendDirect {
                to: record.next_ident,
                msg: I2npMessage::new(
                    MessageType::ShortTunnelBuild,
                    record.send_msg_id,
                    &incoming.to_payload(),
                ),
            }]
        };
        Ok(outputs)
    }

    fn build_verdict(&self, record: &BuildRequestRecord) -> u8 {
        if !record.request_time_in_window(now_ms()) {
            debug!("build request outside the clock window, declining");
            return BUILD_REJECT_BANDWIDTH;
        }
        let admitted = self
            .admission_context()
            .admit(&record.next_ident, record.is_outbound_endpoint);
        if admitted {
            BUILD_ACCEPT
        } else {
            BUILD_REJECT_BANDWIDTH
        }
    }

    // ---- requester side ---------------------------------------------------

    /// Launch a build for one tunnel of the given pool.
    ///
    /// Returns the messages to send, or None when hop selection failed.
    pub fn build_tunnel(
        &mut self,
        pool_id: u32,
        is_inbound: bool,
        snapshot: &NetDbSnapshot,
        is_connected: impl Fn(&IdentHash) -> bool,
    ) -> Option<Vec<TunnelOutput>> {
        let pool = self.pools.get(&pool_id)?;
        let length = if is_inbound {
            pool.settings.next_in_length()
        } else {
            pool.settings.next_out_length()
        };

        if length == 0 {
            return Some(self.create_zero_hop(pool_id, is_inbound));
        }

        let routers =
            pool.select_hops(length, snapshot, &self.profiles, &self.local, &is_connected)?;

        let mut rng = rand::thread_rng();
        let reply_msg_id: u32 = rng.gen();
        let our_receive_id = random_tunnel_id();

        // for an inbound build the record chain ends at us; for an
        // outbound build it ends at the reply gateway of one of our
        // inbound tunnels
        let (reply_gateway, reply_tunnel_id) = if is_inbound {
            (self.local, our_receive_id)
        } else {
            match self.reply_route() {
                Some(route) => route,
                None => (self.local, 0),
            }
        };

        let mut hops = Vec::with_capacity(routers.len());
        let mut build_hops = Vec::with_capacity(routers.len());
        let receive_ids: Vec<TunnelId> = routers.iter().map(|_| random_tunnel_id()).collect();

        for (i, router) in routers.iter().enumerate() {
            let layer_key: [u8; 32] = rng.gen();
            let iv_key: [u8; 32] = rng.gen();
            let is_last = i == routers.len() - 1;

            let (next_ident, next_tunnel_id) = if is_last {
                if is_inbound {
                    (self.local, our_receive_id)
                } else {
                    (reply_gateway, reply_tunnel_id)
                }
            } else {
                (routers[i + 1].hash(), receive_ids[i + 1])
            };

            // the last hop of an inbound build forwards the record set to
            // us under the reply id
            let send_msg_id = if is_inbound && is_last {
                reply_msg_id
            } else {
                rng.gen()
            };

            let record = BuildRequestRecord {
                receive_tunnel_id: receive_ids[i],
                our_ident_prefix: router.hash()[..16].try_into().expect("16 bytes"),
                next_tunnel_id,
                next_ident,
                layer_key,
                iv_key,
                is_inbound_gateway: is_inbound && i == 0,
                is_outbound_endpoint: !is_inbound && is_last,
                request_time_hours: (now_ms() / 3_600_000) as u32,
                send_msg_id,
                reply_msg_id,
                layer_encryption_type: 0,
            };
            build_hops.push(BuildHop {
                ident: router.hash(),
                static_key: router.identity.encryption_pubkey,
                record,
            });
            hops.push(TunnelHop {
                ident: router.hash(),
                static_key: router.identity.encryption_pubkey,
                receive_tunnel_id: receive_ids[i],
                cipher: TunnelLayerCipher::new(&layer_key, &iv_key),
            });
        }

        let request = create_build_request(&build_hops, reply_msg_id);
        let first_hop = routers[0].hash();
        let our_id = if is_inbound {
            our_receive_id
        } else {
            receive_ids[0]
        };
        let tunnel = Tunnel::new(our_id, is_inbound, hops);

        let pool = self.pools.get_mut(&pool_id)?;
        if is_inbound {
            pool.pending_inbound += 1;
        } else {
            pool.pending_outbound += 1;
        }
        let hop_idents: Vec<IdentHash> = routers.iter().map(|r| r.hash()).collect();
        let payload = request.payload.clone();
        self.pending.insert(
            reply_msg_id,
            PendingBuild {
                pool_id,
                is_inbound,
                tunnel,
                request,
                hop_idents,
                created_ms: now_ms(),
            },
        );

        let build_msg = I2npMessage::new(
            MessageType::ShortTunnelBuild,
            rand::thread_rng().gen(),
            &payload,
        );

        // an inbound build travels to its first hop as router-addressed
        // garlic so the hop cannot tell requester from forwarder
        let msg = if is_inbound {
            let first_static = routers[0].identity.encryption_pubkey;
            let clove = garlicnet_garlic::GarlicBlock::Clove {
                delivery: garlicnet_garlic::CloveDelivery::Local,
                msg: build_msg.as_bytes().to_vec(),
            };
            match garlicnet_garlic::wrap_router_garlic(&first_static, &[clove]) {
                Ok(frame) => I2npMessage::new(
                    MessageType::Garlic,
                    garlicnet_core::i2np::random_msg_id(),
                    &frame,
                ),
                Err(_) => build_msg,
            }
        } else {
            build_msg
        };
        Some(vec![TunnelOutput::SendDirect { to: first_hop, msg }])
    }

    /// The gateway and tunnel id a build reply should come back through.
    fn reply_route(&self) -> Option<(IdentHash, TunnelId)> {
        for pool in self.pools.values() {
            if let Some(tunnel) = pool.next_inbound(&[], TransportSet::all(), |_| {
                TransportSet::all()
            }) {
                if let Some(gateway) = tunnel.hops.first() {
                    return Some((gateway.ident, gateway.receive_tunnel_id));
                }
            }
        }
        None
    }

    fn create_zero_hop(&mut self, pool_id: u32, is_inbound: bool) -> Vec<TunnelOutput> {
        let Some(pool) = self.pools.get_mut(&pool_id) else {
            return Vec::new();
        };
        let mut tunnel = Tunnel::new(random_tunnel_id(), is_inbound, Vec::new());
        tunnel.state = TunnelState::Established;
        self.owned.insert(tunnel.tunnel_id, (pool_id, is_inbound));
        if is_inbound {
            pool.inbound.push(tunnel);
            vec![TunnelOutput::LeaseSetChanged { pool_id }]
        } else {
            pool.outbound.push(tunnel);
            Vec::new()
        }
    }

    /// A ShortTunnelBuildReply with a known reply_msg_id closes a pending
    /// build.
    fn handle_build_reply(&mut self, msg: &I2npMessage) -> Result<Vec<TunnelOutput>> {
        let Some(mut pending) = self.pending.remove(&msg.msg_id()) else {
            debug!("build reply {} without pending build", msg.msg_id());
            return Ok(Vec::new());
        };

        let pool_id = pending.pool_id;
        if let Some(pool) = self.pools.get_mut(&pool_id) {
            if pending.is_inbound {
                pool.pending_inbound = pool.pending_inbound.saturating_sub(1);
            } else {
                pool.pending_outbound = pool.pending_outbound.saturating_sub(1);
            }
        }

        let verdicts = parse_build_reply(msg.payload(), &pending.request)?;
        let accepted = verdicts.iter().all(|v| *v == BUILD_ACCEPT);

        for (ident, verdict) in pending.hop_idents.iter().zip(&verdicts) {
            if *verdict == BUILD_ACCEPT {
                self.profiles.record_agreed(ident);
            } else {
                self.profiles.record_declined(ident);
            }
        }

        let Some(pool) = self.pools.get_mut(&pool_id) else {
            return Ok(Vec::new());
        };
        pool.record_build_result(accepted);

        if !accepted {
            info!(
                "tunnel build {} declined ({:?})",
                msg.msg_id(),
                verdicts
            );
            pending.tunnel.state = TunnelState::BuildFailed;
            return Ok(Vec::new());
        }

        pending.tunnel.state = TunnelState::Established;
        let tunnel_id = pending.tunnel.tunnel_id;
        let is_inbound = pending.is_inbound;
        info!(
            "tunnel {} established ({} hops, {})",
            tunnel_id,
            pending.tunnel.num_hops(),
            if is_inbound { "inbound" } else { "outbound" }
        );
        self.owned.insert(tunnel_id, (pool_id, is_inbound));
        if is_inbound {
            pool.inbound.push(pending.tunnel);
            Ok(vec![TunnelOutput::LeaseSetChanged { pool_id }])
        } else {
            pool.outbound.push(pending.tunnel);
            Ok(Vec::new())
        }
    }

    // ---- send path --------------------------------------------------------

    /// Queue blocks on a pool's outbound tunnel and flush immediately.
    pub fn send_blocks(
        &mut self,
        pool_id: u32,
        blocks: Vec<TunnelMessageBlock>,
        exclude: &[TunnelId],
    ) -> Result<Vec<TunnelOutput>> {
        let pool = self
            .pools
            .get_mut(&pool_id)
            .ok_or(TunnelError::NoTunnelAvailable)?;
        let owner = pool.owner;
        let tunnel_id = pool
            .next_outbound(exclude, TransportSet::all(), |_| TransportSet::all())
            .map(|t| t.tunnel_id)
            .ok_or(TunnelError::NoTunnelAvailable)?;
        let tunnel = pool
            .find_mut(tunnel_id, false)
            .ok_or(TunnelError::NoTunnelAvailable)?;

        if tunnel.num_hops() == 0 {
            // zero-hop outbound dispatches delivery instructions directly
            let mut outputs = Vec::new();
            for block in blocks {
                match block.delivery {
                    TunnelDelivery::Local => {
                        outputs.push(TunnelOutput::DeliverLocal { owner, msg: block.msg })
                    }
                    TunnelDelivery::Tunnel { to, tunnel_id } => {
                        outputs.push(TunnelOutput::SendDirect {
                            to,
                            msg: block
                                .msg
                                .wrap_gateway(tunnel_id, garlicnet_core::i2np::random_msg_id()),
                        })
                    }
                    TunnelDelivery::Router { to } => {
                        outputs.push(TunnelOutput::SendDirect { to, msg: block.msg })
                    }
                }
            }
            return Ok(outputs);
        }

        for block in blocks {
            tunnel.gateway.put(block);
        }
        Ok(Self::flush_tunnel(tunnel))
    }

    /// Drain one outbound tunnel's gateway into wire messages.
    fn flush_tunnel(tunnel: &mut Tunnel) -> Vec<TunnelOutput> {
        let first_hop = match tunnel.hops.first() {
            Some(hop) => hop.ident,
            None => return Vec::new(),
        };
        let send_id = tunnel.tunnel_id;
        tunnel
            .gateway
            .flush()
            .into_iter()
            .map(|mut frame| {
                tunnel.owner_transform(&mut frame);
                let mut payload = Vec::with_capacity(4 + TUNNEL_DATA_SIZE);
                payload.extend_from_slice(&send_id.to_be_bytes());
                payload.extend_from_slice(&frame);
                TunnelOutput::SendDirect {
                    to: first_hop,
                    msg: I2npMessage::new(
                        MessageType::TunnelData,
                        garlicnet_core::i2np::random_msg_id(),
                        &payload,
                    ),
                }
            })
            .collect()
    }

    // ---- maintenance ------------------------------------------------------

    /// The transport session to a peer died: tunnels with it as the
    /// adjacent hop age out immediately.
    pub fn age_out_peer(&mut self, peer: &IdentHash) {
        for pool in self.pools.values_mut() {
            for tunnel in pool.inbound.iter_mut().chain(pool.outbound.iter_mut()) {
                let adjacent = if tunnel.is_inbound {
                    tunnel.hops.last()
                } else {
                    tunnel.hops.first()
                };
                if adjacent.map(|h| h.ident == *peer).unwrap_or(false) {
                    warn!("aging out tunnel {} after transport drop", tunnel.tunnel_id);
                    tunnel.age_out();
                }
            }
        }
    }

    /// Periodic pass: expire transit and owned tunnels, time out pending
    /// builds, replace and test pool tunnels.
    pub fn maintenance(
        &mut self,
        snapshot: &NetDbSnapshot,
        is_connected: impl Fn(&IdentHash) -> bool,
    ) -> Vec<TunnelOutput> {
        let mut outputs = Vec::new();
        let now = now_ms();

        // transit expiry
        let before = self.transit.len();
        self.transit.retain(|_, t| !t.is_expired());
        if self.transit.len() != before {
            debug!("expired {} transit tunnels", before - self.transit.len());
        }
        for transit in self.transit.values_mut() {
            transit.sweep();
        }

        // pending build timeouts: every hop gets a non-reply sample
        let timed_out: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, p)| p.created_ms + BUILD_TIMEOUT_MS < now)
            .map(|(id, _)| *id)
            .collect();
        for reply_msg_id in timed_out {
            let pending = self.pending.remove(&reply_msg_id).expect("key present");
            warn!("tunnel build {} timed out", reply_msg_id);
            for ident in &pending.hop_idents {
                self.profiles.record_non_replied(ident);
            }
            if let Some(pool) = self.pools.get_mut(&pending.pool_id) {
                if pending.is_inbound {
                    pool.pending_inbound = pool.pending_inbound.saturating_sub(1);
                } else {
                    pool.pending_outbound = pool.pending_outbound.saturating_sub(1);
                }
                pool.record_build_result(false);
            }
        }

        // per-pool expiry, replacement builds, tests
        let pool_ids: Vec<u32> = self.pools.keys().copied().collect();
        for pool_id in pool_ids {
            let (inbound_changed, demand, test_due) = {
                let pool = self.pools.get_mut(&pool_id).expect("pool present");
                let changed = pool.expire_tunnels();
                for tunnel in &mut pool.inbound {
                    tunnel.endpoint.sweep();
                }
                (changed, pool.demand(), pool.test_due(now))
            };

            if inbound_changed {
                outputs.push(TunnelOutput::LeaseSetChanged { pool_id });
            }

            for _ in 0..demand.inbound {
                if let Some(mut built) =
                    self.build_tunnel(pool_id, true, snapshot, &is_connected)
                {
                    outputs.append(&mut built);
                }
            }
            for _ in 0..demand.outbound {
                if let Some(mut built) =
                    self.build_tunnel(pool_id, false, snapshot, &is_connected)
                {
                    outputs.append(&mut built);
                }
            }

            if test_due {
                let orders = self
                    .pools
                    .get_mut(&pool_id)
                    .expect("pool present")
                    .start_test_round();
                for order in orders {
                    if let Some(mut sent) = self.send_test(pool_id, order) {
                        outputs.append(&mut sent);
                    }
                }
            }
        }

        // prune owned ids whose tunnels went away
        self.owned.retain(|tunnel_id, (pool_id, is_inbound)| {
            self.pools
                .get(pool_id)
                .map(|p| p.find(*tunnel_id, *is_inbound).is_some())
                .unwrap_or(false)
        });

        outputs
    }

    fn send_test(&mut self, pool_id: u32, order: TunnelTestOrder) -> Option<Vec<TunnelOutput>> {
        let local = self.local;
        let pool = self.pools.get_mut(&pool_id)?;
        let inbound = pool.find(order.inbound_id, true)?;
        let (gateway_ident, gateway_tunnel_id) = match inbound.hops.first() {
            Some(hop) => (hop.ident, hop.receive_tunnel_id),
            // zero-hop inbound: address ourselves
            None => (local, inbound.tunnel_id),
        };

        let mut payload = [0u8; 12];
        payload[..4].copy_from_slice(&order.msg_id.to_be_bytes());
        payload[4..].copy_from_slice(&now_us().to_be_bytes());
        let test = I2npMessage::new(MessageType::TunnelTest, order.msg_id, &payload);

        // one-time AEAD wrap so transit hops cannot recognize test traffic
        let mut frame = Vec::with_capacity(8 + test.len() + 16);
        frame.extend_from_slice(&order.tag);
        let ct = aead_encrypt(&order.key, &nonce_from_index(0), &order.tag, test.as_bytes())
            .ok()?;
        frame.extend_from_slice(&ct);
        let wrapped = I2npMessage::new(
            MessageType::Garlic,
            garlicnet_core::i2np::random_msg_id(),
            &frame,
        );

        // pin the test to the outbound tunnel it was paired with
        let outbound = pool.find_mut(order.outbound_id, false)?;
        outbound.gateway.put(TunnelMessageBlock {
            delivery: TunnelDelivery::Tunnel {
                to: gateway_ident,
                tunnel_id: gateway_tunnel_id,
            },
            msg: wrapped,
        });
        Some(Self::flush_tunnel(outbound))
    }
}
