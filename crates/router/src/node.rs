//! Router wiring
//!
//! `RouterCore` owns every subsystem in dependency order (context, netdb,
//! tunnels, destinations) and routes messages between them and the
//! transports. It is single-owner state: the async node loop feeds it from
//! a FIFO inbox, keeping per-subsystem ordering, with build requests on a
//! separate lane so record crypto cannot stall the data path.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use garlicnet_core::{
    now_ms, I2npMessage, IdentHash, Lease, MessageType, RouterConfig, Storage, TransportSet,
};
use garlicnet_crypto::Identity;
use garlicnet_netdb::messages::{DatabaseLookupMsg, DatabaseStoreMsg, LookupKind};
use garlicnet_netdb::netdb::parse_delivery_status;
use garlicnet_netdb::{LookupResult, NetDb, NetDbEvent, NetDbSnapshot, ProfileStore};
use garlicnet_garlic::{CloveDelivery, GarlicBlock};
use garlicnet_tunnel::pool::POOL_MANAGE_INTERVAL_MS;
use garlicnet_tunnel::tunnel::TUNNEL_EXPIRATION_MS;
use garlicnet_tunnel::{
    PoolOwner, PoolSettings, TunnelDelivery, TunnelManager, TunnelMessageBlock, TunnelOutput,
};

use crate::context::RouterContext;
use crate::destination::{DestinationEvent, LocalDestination};
use crate::transports::Transports;

/// NetDb maintenance cadence
pub const NETDB_MAINTENANCE_INTERVAL_MS: u64 = 60_000;

struct PendingLookup {
    waiter_dest: Option<IdentHash>,
    rx: oneshot::Receiver<Option<LookupResult>>,
}

pub struct RouterCore {
    pub context: RouterContext,
    pub netdb: NetDb,
    pub tunnels: TunnelManager,
    pub destinations: HashMap<IdentHash, LocalDestination>,
    pool_to_dest: HashMap<u32, IdentHash>,
    transports: Arc<dyn Transports>,
    profiles: Arc<ProfileStore>,
    snapshot_rx: watch::Receiver<Arc<NetDbSnapshot>>,
    pending_lookups: Vec<PendingLookup>,
    storage: Arc<dyn Storage>,
}

impl RouterCore {
    /// Bring the node up in dependency order: context, netdb, tunnels.
    pub fn new(
        keys: Identity,
        config: RouterConfig,
        addresses: Vec<garlicnet_core::TransportAddress>,
        storage: Arc<dyn Storage>,
        transports: Arc<dyn Transports>,
    ) -> Self {
        let context = RouterContext::new(keys, config.clone(), addresses);
        let profiles = Arc::new(ProfileStore::new());
        profiles.load(storage.as_ref());

        let (mut netdb, snapshot_rx) = NetDb::new(
            context.ident_hash(),
            config.clone(),
            profiles.clone(),
            storage.clone(),
        );
        netdb.load_from_storage();

        let tunnels = TunnelManager::new(
            context.ident_hash(),
            context.static_key().clone(),
            config,
            profiles.clone(),
        );

        Self {
            context,
            netdb,
            tunnels,
            destinations: HashMap::new(),
            pool_to_dest: HashMap::new(),
            transports,
            profiles,
            snapshot_rx,
            pending_lookups: Vec::new(),
            storage,
        }
    }

    pub fn ident_hash(&self) -> IdentHash {
        self.context.ident_hash()
    }

    pub fn profiles(&self) -> &Arc<ProfileStore> {
        &self.profiles
    }

    fn snapshot(&self) -> Arc<NetDbSnapshot> {
        self.snapshot_rx.borrow().clone()
    }

    /// Create a destination with its own tunnel pool.
    pub fn create_destination(&mut self, keys: Identity, settings: PoolSettings) -> IdentHash {
        let identity = garlicnet_core::PeerIdentity::new(
            keys.signing.public_key_bytes(),
            keys.encryption.public_key_bytes(),
        );
        let dest_hash = identity.hash();
        let pool_id = self
            .tunnels
            .create_pool(PoolOwner::Destination(dest_hash), settings);
        let destination = LocalDestination::new(keys, pool_id);
        self.pool_to_dest.insert(pool_id, dest_hash);
        self.destinations.insert(dest_hash, destination);
        info!(
            "destination {} created with pool {}",
            hex::encode(&dest_hash[..8]),
            pool_id
        );
        dest_hash
    }

    /// Tear a destination down: its pool detaches and its builds cancel.
    pub fn remove_destination(&mut self, dest_hash: &IdentHash) {
        if let Some(destination) = self.destinations.remove(dest_hash) {
            self.pool_to_dest.remove(&destination.pool_id);
            self.tunnels.remove_pool(destination.pool_id);
        }
    }

    // ---- inbound dispatch -------------------------------------------------

    /// Upcall from the transports: one I2NP message from a peer.
    pub fn handle_message(&mut self, from: IdentHash, msg: I2npMessage) {
        match msg.msg_type() {
            MessageType::DatabaseStore
            | MessageType::DatabaseLookup
            | MessageType::DatabaseSearchReply => {
                let events = self.netdb.handle_message(from, &msg);
                self.run_netdb_events(events);
            }
            MessageType::TunnelData
            | MessageType::TunnelGateway
            | MessageType::ShortTunnelBuild
            | MessageType::ShortTunnelBuildReply => {
                let outputs = self.tunnels.handle_message(msg);
                self.run_tunnel_outputs(outputs);
            }
            MessageType::Garlic => self.handle_router_garlic(msg),
            MessageType::DeliveryStatus => self.confirm_delivery_status(&msg),
            MessageType::VariableTunnelBuild | MessageType::VariableTunnelBuildReply => {
                debug!("legacy variable build from {}, unsupported", hex::encode(&from[..8]));
                self.profiles.record_unreachable(&from);
            }
            other => debug!("unhandled message type {:?} from transport", other),
        }
    }

    /// Garlic addressed to the router itself.
    fn handle_router_garlic(&mut self, msg: I2npMessage) {
        // router-to-router wraps (tunnel build requests) use one-shot
        // Noise-N against our static key
        if let Ok(blocks) = self.context.incoming.decrypt(msg.payload()) {
            for block in blocks {
                if let GarlicBlock::Clove { delivery, msg } = block {
                    self.dispatch_clove(delivery, &msg);
                }
            }
            return;
        }
        // otherwise: one-time reply tags and ratchet sessions of the
        // router's own session owner
        match self.context.garlic.handle_garlic(msg.payload()) {
            Ok(incoming) => {
                if let Some(raw) = incoming.raw {
                    if let Ok(inner) =
                        I2npMessage::parse(&raw, self.context.config.clock_skew_ms)
                    {
                        let local = self.ident_hash();
                        self.handle_message(local, inner);
                    }
                }
                for (delivery, clove_msg) in incoming.cloves {
                    self.dispatch_clove(delivery, &clove_msg);
                }
            }
            Err(e) => debug!("router garlic dropped: {}", e),
        }
    }

    fn dispatch_clove(&mut self, delivery: CloveDelivery, inner: &[u8]) {
        let Ok(msg) = I2npMessage::parse(inner, self.context.config.clock_skew_ms) else {
            debug!("clove with bad inner message, dropped");
            return;
        };
        match delivery {
            CloveDelivery::Local => {
                let local = self.ident_hash();
                self.handle_message(local, msg);
            }
            CloveDelivery::Destination { hash } => {
                if msg.msg_type() == MessageType::Garlic {
                    self.deliver_to_destination(hash, msg);
                }
            }
            CloveDelivery::Router { hash } => self.transports.send_message(&hash, msg),
            CloveDelivery::Tunnel { hash, tunnel_id } => {
                let wrapped =
                    msg.wrap_gateway(tunnel_id, garlicnet_core::i2np::random_msg_id());
                self.transports.send_message(&hash, wrapped);
            }
        }
    }

    fn confirm_delivery_status(&mut self, msg: &I2npMessage) {
        let Ok((token, _)) = parse_delivery_status(msg.payload()) else {
            return;
        };
        if self.context.garlic.confirm_delivery(token) {
            return;
        }
        for destination in self.destinations.values_mut() {
            if destination.garlic.confirm_delivery(token) {
                return;
            }
        }
        debug!("delivery status {} without a waiter", token);
    }

    // ---- netdb event execution --------------------------------------------

    fn run_netdb_events(&mut self, events: Vec<NetDbEvent>) {
        for event in events {
            match event {
                NetDbEvent::SendDirect { to, msg } => self.transports.send_message(&to, msg),
                NetDbEvent::SendLookup {
                    to,
                    key,
                    kind,
                    excluded,
                } => self.send_lookup(to, key, kind, excluded),
                NetDbEvent::Reseed => {
                    warn!("netdb below reseed threshold; external reseed required")
                }
            }
        }
    }

    /// Issue a lookup either directly (connected peer) or through the
    /// exploratory pool with an encrypted tunnel reply.
    fn send_lookup(
        &mut self,
        to: IdentHash,
        key: IdentHash,
        kind: LookupKind,
        excluded: Vec<IdentHash>,
    ) {
        let exploratory = self.tunnels.exploratory_pool_id();
        let reply_route = self.tunnels.pool(exploratory).and_then(|pool| {
            pool.next_inbound(&[], TransportSet::all(), |_| TransportSet::all())
                .and_then(|tunnel| tunnel.hops.first())
                .map(|gw| (gw.ident, gw.receive_tunnel_id))
        });

        let direct = self.transports.is_connected(&to) || reply_route.is_none();
        let lookup = if direct {
            DatabaseLookupMsg {
                key,
                from: self.ident_hash(),
                kind,
                reply_tunnel_id: None,
                excluded,
                reply_key_tag: None,
            }
        } else {
            let (gateway, tunnel_id) = reply_route.expect("checked above");
            let mut reply_key = [0u8; 32];
            let mut reply_tag = [0u8; 8];
            rand::Rng::fill(&mut rand::thread_rng(), &mut reply_key);
            rand::Rng::fill(&mut rand::thread_rng(), &mut reply_tag);
            self.context.garlic.register_one_time_tag(reply_tag, reply_key);
            DatabaseLookupMsg {
                key,
                from: gateway,
                kind,
                reply_tunnel_id: Some(tunnel_id),
                excluded,
                reply_key_tag: Some((reply_key, reply_tag)),
            }
        };

        let msg = I2npMessage::new(
            MessageType::DatabaseLookup,
            garlicnet_core::i2np::random_msg_id(),
            &lookup.to_payload(),
        );
        if direct {
            self.transports.send_message(&to, msg);
        } else {
            let blocks = vec![TunnelMessageBlock {
                delivery: TunnelDelivery::Router { to },
                msg,
            }];
            match self.tunnels.send_blocks(exploratory, blocks, &[]) {
                Ok(outputs) => self.run_tunnel_outputs(outputs),
                Err(e) => debug!("lookup via exploratory failed: {}", e),
            }
        }
    }

    // ---- tunnel output execution ------------------------------------------

    fn run_tunnel_outputs(&mut self, outputs: Vec<TunnelOutput>) {
        for output in outputs {
            match output {
                TunnelOutput::SendDirect { to, msg } => {
                    self.transports.send_message(&to, msg)
                }
                TunnelOutput::DeliverLocal { owner, msg } => match owner {
                    PoolOwner::Exploratory => {
                        let local = self.ident_hash();
                        self.handle_message(local, msg);
                    }
                    PoolOwner::Destination(hash) => self.deliver_to_destination(hash, msg),
                },
                TunnelOutput::LeaseSetChanged { pool_id } => self.on_lease_set_changed(pool_id),
            }
        }
    }

    fn deliver_to_destination(&mut self, dest_hash: IdentHash, msg: I2npMessage) {
        let Some(destination) = self.destinations.get_mut(&dest_hash) else {
            debug!(
                "message for unknown destination {}, dropped",
                hex::encode(&dest_hash[..8])
            );
            return;
        };
        if msg.msg_type() != MessageType::Garlic {
            debug!("non-garlic message for destination, dropped");
            return;
        }
        let pool_id = destination.pool_id;
        let (blocks, events) = destination.handle_garlic(msg.payload());
        self.send_destination_blocks(pool_id, blocks);
        self.run_destination_events(dest_hash, events);
    }

    fn send_destination_blocks(&mut self, pool_id: u32, blocks: Vec<TunnelMessageBlock>) {
        if blocks.is_empty() {
            return;
        }
        match self.tunnels.send_blocks(pool_id, blocks, &[]) {
            Ok(outputs) => self.run_tunnel_outputs(outputs),
            Err(e) => debug!("destination send failed: {}", e),
        }
    }

    fn run_destination_events(&mut self, dest_hash: IdentHash, events: Vec<DestinationEvent>) {
        for event in events {
            match event {
                DestinationEvent::NeedLeaseSet { dest } => {
                    self.request_lease_set(Some(dest_hash), dest)
                }
                DestinationEvent::PublishWanted => self.publish_lease_set(dest_hash),
                DestinationEvent::SendBlocks(blocks) => {
                    if let Some(destination) = self.destinations.get(&dest_hash) {
                        let pool_id = destination.pool_id;
                        self.send_destination_blocks(pool_id, blocks);
                    }
                }
                DestinationEvent::StreamAccepted { stream_id } => {
                    debug!("stream {} accepted", stream_id)
                }
                DestinationEvent::DataReady { .. } => {}
            }
        }
    }

    /// Kick off a netdb lookup; the result is polled during maintenance.
    pub fn request_lease_set(&mut self, waiter: Option<IdentHash>, key: IdentHash) {
        let (tx, rx) = oneshot::channel();
        let events = self.netdb.request_destination(key, LookupKind::LeaseSet, tx);
        self.pending_lookups.push(PendingLookup {
            waiter_dest: waiter,
            rx,
        });
        self.run_netdb_events(events);
    }

    // ---- lease set publication --------------------------------------------

    fn on_lease_set_changed(&mut self, pool_id: u32) {
        let Some(&dest_hash) = self.pool_to_dest.get(&pool_id) else {
            return;
        };
        let leases: Vec<Lease> = self
            .tunnels
            .pool(pool_id)
            .map(|pool| {
                pool.inbound
                    .iter()
                    .filter(|t| t.is_established())
                    .filter_map(|tunnel| {
                        let end_time_ms = tunnel.created_ms + TUNNEL_EXPIRATION_MS;
                        match tunnel.hops.first() {
                            Some(gw) => Some(Lease {
                                tunnel_gateway: gw.ident,
                                tunnel_id: gw.receive_tunnel_id,
                                end_time_ms,
                            }),
                            // zero-hop: we are the gateway
                            None => Some(Lease {
                                tunnel_gateway: self.context.ident_hash(),
                                tunnel_id: tunnel.tunnel_id,
                                end_time_ms,
                            }),
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        if leases.is_empty() {
            return;
        }
        if let Some(destination) = self.destinations.get_mut(&dest_hash) {
            destination.rebuild_lease_set(leases);
            self.publish_lease_set(dest_hash);
        }
    }

    /// Send the current lease set to the closest floodfill, authenticated
    /// with a reply token, through the exploratory pool.
    fn publish_lease_set(&mut self, dest_hash: IdentHash) {
        let Some(destination) = self.destinations.get_mut(&dest_hash) else {
            return;
        };
        let Some(ls) = destination.current_lease_set.clone() else {
            return;
        };
        let Some((token, excluded)) = destination.next_publish_attempt() else {
            return;
        };

        let Some(floodfill) = self
            .netdb
            .closest_floodfills(&dest_hash, 1, &excluded)
            .into_iter()
            .next()
        else {
            debug!("no floodfill to publish to");
            return;
        };
        if let Some(destination) = self.destinations.get_mut(&dest_hash) {
            destination.record_publish_target(floodfill);
        }

        let exploratory = self.tunnels.exploratory_pool_id();
        let reply_tunnel = self.tunnels.pool(exploratory).and_then(|pool| {
            pool.next_inbound(&[], TransportSet::all(), |_| TransportSet::all())
                .and_then(|t| t.hops.first())
                .map(|gw| (gw.receive_tunnel_id, gw.ident))
        });

        let store = DatabaseStoreMsg {
            key: dest_hash,
            store_type: ls.store_type,
            reply_token: token,
            reply_tunnel,
            data: ls.to_bytes(),
        };
        let msg = I2npMessage::new(
            MessageType::DatabaseStore,
            garlicnet_core::i2np::random_msg_id(),
            &store.to_payload(),
        );

        let blocks = vec![TunnelMessageBlock {
            delivery: TunnelDelivery::Router { to: floodfill },
            msg,
        }];
        match self.tunnels.send_blocks(exploratory, blocks, &[]) {
            Ok(outputs) => self.run_tunnel_outputs(outputs),
            Err(_) => {
                // no exploratory tunnel yet: publish directly
                let store = DatabaseStoreMsg {
                    reply_tunnel: None,
                    ..store
                };
                let msg = I2npMessage::new(
                    MessageType::DatabaseStore,
                    garlicnet_core::i2np::random_msg_id(),
                    &store.to_payload(),
                );
                self.transports.send_message(&floodfill, msg);
            }
        }
    }

    /// Publish our RouterInfo: directly when reachable, else through an
    /// exploratory outbound tunnel.
    fn publish_router_info(&mut self) {
        let congestion = self.tunnels.congestion_level();
        let ri = self.context.build_router_info(congestion);
        let hash = ri.hash();
        // our own entry also lives in our netdb
        let _ = self.netdb.add_router_info(ri.clone());

        let Some(floodfill) = self.netdb.closest_floodfills(&hash, 1, &[]).into_iter().next()
        else {
            return;
        };
        let store = DatabaseStoreMsg {
            key: hash,
            store_type: garlicnet_netdb::messages::STORE_TYPE_ROUTER_INFO,
            reply_token: garlicnet_core::i2np::random_msg_id(),
            reply_tunnel: None,
            data: ri.to_bytes(),
        };
        let msg = I2npMessage::new(
            MessageType::DatabaseStore,
            garlicnet_core::i2np::random_msg_id(),
            &store.to_payload(),
        );

        if self.context.is_reachable() || self.transports.is_connected(&floodfill) {
            self.transports.send_message(&floodfill, msg);
        } else {
            let exploratory = self.tunnels.exploratory_pool_id();
            let blocks = vec![TunnelMessageBlock {
                delivery: TunnelDelivery::Router { to: floodfill },
                msg,
            }];
            if let Ok(outputs) = self.tunnels.send_blocks(exploratory, blocks, &[]) {
                self.run_tunnel_outputs(outputs);
            }
        }
        self.context.mark_published();
    }

    // ---- periodic work ----------------------------------------------------

    /// Tunnel-side periodic pass: pools, builds, tests, transit expiry.
    pub fn tunnel_maintenance(&mut self) {
        // a dead first-hop session expires its tunnels right away
        for peer in self.transports.take_dropped_peers() {
            self.tunnels.age_out_peer(&peer);
            self.profiles.record_unreachable(&peer);
        }

        let snapshot = self.snapshot();
        let transports = self.transports.clone();
        let outputs = self
            .tunnels
            .maintenance(&snapshot, |ident| transports.is_connected(ident));
        self.run_tunnel_outputs(outputs);
    }

    /// NetDb periodic pass plus lookup completion polling.
    pub fn netdb_maintenance(&mut self) {
        let events = self.netdb.maintenance();
        self.run_netdb_events(events);
        self.profiles.sweep_and_persist(self.storage.as_ref());
        self.poll_lookups();

        // keep discovering routers while the view is small
        if self.netdb.router_count() < 4 * self.context.config.min_routers {
            let mut key = [0u8; 32];
            rand::Rng::fill(&mut rand::thread_rng(), &mut key[..]);
            let (tx, rx) = oneshot::channel();
            let events =
                self.netdb
                    .request_destination(key, LookupKind::Exploration, tx);
            self.pending_lookups.push(PendingLookup {
                waiter_dest: None,
                rx,
            });
            self.run_netdb_events(events);
        }

        if self.context.publish_due(now_ms()) {
            self.publish_router_info();
        }
    }

    /// Destination periodic pass: stream pumps, publish retries, garlic
    /// cleanup.
    pub fn destination_maintenance(&mut self) {
        let dest_hashes: Vec<IdentHash> = self.destinations.keys().copied().collect();
        for dest_hash in dest_hashes {
            let (blocks, events, publish_due, pool_id) = {
                let destination = self.destinations.get_mut(&dest_hash).expect("present");
                let (blocks, events) = destination.tick();
                (blocks, events, destination.publish_retry_due(), destination.pool_id)
            };
            self.send_destination_blocks(pool_id, blocks);
            self.run_destination_events(dest_hash, events);
            if publish_due {
                self.publish_lease_set(dest_hash);
            }
        }
    }

    fn poll_lookups(&mut self) {
        let mut remaining = Vec::new();
        for mut pending in std::mem::take(&mut self.pending_lookups) {
            match pending.rx.try_recv() {
                Ok(result) => {
                    if let (Some(dest_hash), Some(LookupResult::LeaseSet(ls))) =
                        (pending.waiter_dest, result)
                    {
                        let released = self
                            .destinations
                            .get_mut(&dest_hash)
                            .map(|d| (d.pool_id, d.lease_set_resolved(ls)));
                        if let Some((pool_id, blocks)) = released {
                            self.send_destination_blocks(pool_id, blocks);
                        }
                    }
                }
                Err(oneshot::error::TryRecvError::Empty) => remaining.push(pending),
                Err(oneshot::error::TryRecvError::Closed) => {}
            }
        }
        self.pending_lookups = remaining;
    }
}

/// Commands accepted by a spawned node loop
pub enum NodeCommand {
    /// Message received from a peer (transport upcall)
    Incoming { from: IdentHash, msg: I2npMessage },
    /// Run one maintenance pass (driven by the interval timers)
    TunnelMaintenance,
    NetDbMaintenance,
    DestinationMaintenance,
    Shutdown,
}

/// Handle to a spawned node
pub struct NodeHandle {
    pub ident: IdentHash,
    tx: mpsc::Sender<NodeCommand>,
    build_tx: mpsc::Sender<NodeCommand>,
}

impl NodeHandle {
    /// Deliver an incoming message; build requests go to the build lane.
    pub async fn deliver(&self, from: IdentHash, msg: I2npMessage) {
        let lane = if msg.msg_type() == MessageType::ShortTunnelBuild {
            &self.build_tx
        } else {
            &self.tx
        };
        if lane.send(NodeCommand::Incoming { from, msg }).await.is_err() {
            warn!("node loop gone, message dropped");
        }
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(NodeCommand::Shutdown).await;
    }
}

/// Spawn the node's event loop: a FIFO inbox for the data path, a separate
/// lane for incoming build requests, and interval timers posting
/// maintenance commands.
pub fn spawn_node(mut core: RouterCore) -> NodeHandle {
    let ident = core.ident_hash();
    let (tx, mut rx) = mpsc::channel::<NodeCommand>(1024);
    let (build_tx, mut build_rx) = mpsc::channel::<NodeCommand>(256);

    let timer_tx = tx.clone();
    tokio::spawn(async move {
        let mut tunnel_timer = tokio::time::interval(std::time::Duration::from_millis(
            POOL_MANAGE_INTERVAL_MS,
        ));
        let mut netdb_timer = tokio::time::interval(std::time::Duration::from_millis(
            NETDB_MAINTENANCE_INTERVAL_MS,
        ));
        let mut destination_timer =
            tokio::time::interval(std::time::Duration::from_millis(100));
        loop {
            let cmd = tokio::select! {
                _ = tunnel_timer.tick() => NodeCommand::TunnelMaintenance,
                _ = netdb_timer.tick() => NodeCommand::NetDbMaintenance,
                _ = destination_timer.tick() => NodeCommand::DestinationMaintenance,
            };
            if timer_tx.send(cmd).await.is_err() {
                break;
            }
        }
    });

    tokio::spawn(async move {
        'outer: loop {
            // the data lane wins ties; builds drain when it is idle
            let cmd = tokio::select! {
                biased;
                cmd = rx.recv() => cmd,
                cmd = build_rx.recv() => cmd,
            };
            let Some(cmd) = cmd else { break };
            let mut batch = vec![cmd];
            // drain a bounded batch so bursts are handled in one pass
            while batch.len() < garlicnet_tunnel::service::MAX_BATCH_SIZE {
                match rx.try_recv() {
                    Ok(cmd) => batch.push(cmd),
                    Err(_) => break,
                }
            }
            for cmd in batch {
                match cmd {
                    NodeCommand::Incoming { from, msg } => core.handle_message(from, msg),
                    NodeCommand::TunnelMaintenance => core.tunnel_maintenance(),
                    NodeCommand::NetDbMaintenance => core.netdb_maintenance(),
                    NodeCommand::DestinationMaintenance => core.destination_maintenance(),
                    NodeCommand::Shutdown => break 'outer,
                }
            }
        }
        info!("node loop stopped");
    });

    NodeHandle {
        ident,
        tx,
        build_tx,
    }
}
