//! Local destinations
//!
//! A destination owns a keypair, a tunnel pool, a garlic session owner and
//! a streaming multiplexer. It rebuilds and republishes its lease set when
//! the inbound tunnel set changes, resolves remote lease sets through the
//! netDb, and turns stream packets into garlic-wrapped `Data` messages
//! riding its pool.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use garlicnet_core::{
    now_ms, CoreError, I2npMessage, IdentHash, Lease, LeaseSet, MessageType, PeerIdentity,
    PublicKey,
};
use garlicnet_crypto::Identity;
use garlicnet_garlic::{CloveDelivery, GarlicBlock, GarlicService};
use garlicnet_streaming::{
    unwrap_data_protocol, wrap_data_protocol, StreamingDestination, StreamingEvent,
    PROTOCOL_STREAMING,
};
use garlicnet_tunnel::{TunnelDelivery, TunnelMessageBlock};

use crate::RouterError;

/// Lease-set publication is retried with a fresh floodfill this often
pub const PUBLISH_CONFIRM_TIMEOUT_MS: u64 = 5_000;

/// Publication gives up after this many floodfills
pub const MAX_PUBLISH_ATTEMPTS: u32 = 15;

/// Outputs a destination hands back to the router wiring
#[derive(Debug)]
pub enum DestinationEvent {
    /// Send through this destination's pool
    SendBlocks(Vec<TunnelMessageBlock>),
    /// A remote lease set must be fetched before traffic can flow
    NeedLeaseSet { dest: IdentHash },
    /// The lease set should be (re)published
    PublishWanted,
    /// A new inbound stream appeared
    StreamAccepted { stream_id: u32 },
    /// Bytes became readable
    DataReady { stream_id: u32 },
}

struct PublishState {
    pending_token: Option<u32>,
    confirm: Option<oneshot::Receiver<()>>,
    attempts: u32,
    excluded: Vec<IdentHash>,
    last_attempt_ms: u64,
}

pub struct LocalDestination {
    keys: Identity,
    identity: PeerIdentity,
    dest_hash: IdentHash,
    pub pool_id: u32,
    pub garlic: GarlicService,
    pub streaming: StreamingDestination,
    pub current_lease_set: Option<LeaseSet>,
    publish: PublishState,
    /// Remote destination hash → lease set
    lease_cache: HashMap<IdentHash, Arc<LeaseSet>>,
    /// Stream id → remote destination hash
    stream_routes: HashMap<u32, IdentHash>,
    /// Remote garlic static key → remote destination hash
    session_routes: HashMap<PublicKey, IdentHash>,
    /// Messages parked until their remote lease set resolves; the flag
    /// records whether the message still needs garlic wrapping
    parked: HashMap<IdentHash, Vec<(bool, I2npMessage)>>,
}

impl LocalDestination {
    pub fn new(keys: Identity, pool_id: u32) -> Self {
        let identity = PeerIdentity::new(
            keys.signing.public_key_bytes(),
            keys.encryption.public_key_bytes(),
        );
        let dest_hash = identity.hash();
        let garlic = GarlicService::new(keys.encryption.clone());
        let streaming = StreamingDestination::new(identity.clone(), keys.signing.clone());
        Self {
            keys,
            identity,
            dest_hash,
            pool_id,
            garlic,
            streaming,
            current_lease_set: None,
            publish: PublishState {
                pending_token: None,
                confirm: None,
                attempts: 0,
                excluded: Vec::new(),
                last_attempt_ms: 0,
            },
            lease_cache: HashMap::new(),
            stream_routes: HashMap::new(),
            session_routes: HashMap::new(),
            parked: HashMap::new(),
        }
    }

    pub fn dest_hash(&self) -> IdentHash {
        self.dest_hash
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    // ---- lease set --------------------------------------------------------

    /// Rebuild and sign the lease set from the pool's inbound tunnels.
    pub fn rebuild_lease_set(&mut self, leases: Vec<Lease>) -> &LeaseSet {
        let mut ls = LeaseSet {
            destination: self.identity.clone(),
            encryption_pubkey: self.keys.encryption.public_key_bytes(),
            leases,
            published_ms: now_ms(),
            store_type: 3,
            flags: 0,
            signature: [0u8; 64],
        };
        ls.signature = self.keys.signing.sign(&ls.signable_data());
        info!(
            "destination {}: lease set rebuilt with {} leases",
            hex::encode(&self.dest_hash[..8]),
            ls.leases.len()
        );
        self.current_lease_set = Some(ls);
        // restart the publication cycle
        self.publish.pending_token = None;
        self.publish.confirm = None;
        self.publish.attempts = 0;
        self.publish.excluded.clear();
        self.current_lease_set.as_ref().expect("just set")
    }

    /// Begin (or continue) publication: returns the reply token to embed
    /// and the floodfills already tried, or None when out of attempts.
    pub fn next_publish_attempt(&mut self) -> Option<(u32, Vec<IdentHash>)> {
        if self.publish.attempts >= MAX_PUBLISH_ATTEMPTS {
            warn!(
                "destination {}: lease set publication gave up after {} attempts",
                hex::encode(&self.dest_hash[..8]),
                self.publish.attempts
            );
            return None;
        }
        let token = garlicnet_core::i2np::random_msg_id();
        let (tx, rx) = oneshot::channel();
        self.garlic.expect_delivery(token, tx);
        self.publish.pending_token = Some(token);
        self.publish.confirm = Some(rx);
        self.publish.attempts += 1;
        self.publish.last_attempt_ms = now_ms();
        Some((token, self.publish.excluded.clone()))
    }

    /// Record the floodfill used so retries move on.
    pub fn record_publish_target(&mut self, floodfill: IdentHash) {
        self.publish.excluded.push(floodfill);
    }

    /// True when a new publication attempt should fire.
    pub fn publish_retry_due(&mut self) -> bool {
        if self.current_lease_set.is_none() {
            return false;
        }
        match self.publish.confirm.as_mut() {
            None => self.publish.pending_token.is_none(),
            Some(rx) => match rx.try_recv() {
                Ok(()) => {
                    info!(
                        "destination {}: lease set publication confirmed",
                        hex::encode(&self.dest_hash[..8])
                    );
                    self.publish.confirm = None;
                    // keep pending_token set so no further attempts fire
                    false
                }
                Err(oneshot::error::TryRecvError::Empty) => {
                    self.publish.last_attempt_ms + PUBLISH_CONFIRM_TIMEOUT_MS < now_ms()
                }
                Err(oneshot::error::TryRecvError::Closed) => true,
            },
        }
    }

    // ---- remote lease sets ------------------------------------------------

    /// Feed a resolved remote lease set; parked traffic is released.
    /// Raw garlic frames (handshake replies) go out ahead of messages
    /// that still need wrapping, so the session exists when they land.
    pub fn lease_set_resolved(&mut self, ls: Arc<LeaseSet>) -> Vec<TunnelMessageBlock> {
        let dest = ls.dest_hash();
        self.session_routes
            .insert(ls.encryption_pubkey, dest);
        self.lease_cache.insert(dest, ls);
        let mut parked = self.parked.remove(&dest).unwrap_or_default();
        parked.sort_by_key(|(wrap, _)| *wrap);
        parked
            .into_iter()
            .filter_map(|(wrap, msg)| {
                if wrap {
                    self.block_for(dest, msg).ok().flatten()
                } else {
                    self.wrap_to_lease(dest, msg).ok().flatten()
                }
            })
            .collect()
    }

    fn remote_lease(&self, dest: &IdentHash) -> Option<(&Arc<LeaseSet>, Lease)> {
        let ls = self.lease_cache.get(dest)?;
        let now = now_ms();
        let leases = ls.non_expired_leases(now);
        // freshest lease first
        let lease = leases
            .into_iter()
            .max_by_key(|l| l.end_time_ms)
            .cloned()?;
        Some((ls, lease))
    }

    /// Whether a cached remote lease set needs refreshing before use.
    pub fn lease_needs_refresh(&self, dest: &IdentHash) -> bool {
        match self.lease_cache.get(dest) {
            Some(ls) => ls.needs_refresh(now_ms()),
            None => true,
        }
    }

    // ---- streams ----------------------------------------------------------

    /// Open a stream to a remote destination. Its lease set may still need
    /// resolving; packets park until then.
    pub fn connect(&mut self, remote: &IdentHash) -> u32 {
        let stream_id = self.streaming.connect();
        self.stream_routes.insert(stream_id, *remote);
        stream_id
    }

    /// Queue application bytes on a stream.
    pub fn send(&mut self, stream_id: u32, data: &[u8]) -> Result<(), RouterError> {
        let stream = self
            .streaming
            .stream_mut(stream_id)
            .ok_or(RouterError::UnknownStream(stream_id))?;
        stream.send(data).map_err(RouterError::from)
    }

    /// Read received bytes from a stream.
    pub fn read(&mut self, stream_id: u32, buf: &mut [u8]) -> Result<usize, RouterError> {
        let stream = self
            .streaming
            .stream_mut(stream_id)
            .ok_or(RouterError::UnknownStream(stream_id))?;
        Ok(stream.read(buf))
    }

    pub fn close(&mut self, stream_id: u32) {
        if let Some(stream) = self.streaming.stream_mut(stream_id) {
            stream.close();
        }
    }

    // ---- garlic in/out ----------------------------------------------------

    /// Process an incoming garlic frame addressed to this destination.
    pub fn handle_garlic(&mut self, frame: &[u8]) -> (Vec<TunnelMessageBlock>, Vec<DestinationEvent>) {
        let mut blocks_out = Vec::new();
        let mut events = Vec::new();

        let incoming = match self.garlic.handle_garlic(frame) {
            Ok(incoming) => incoming,
            Err(e) => {
                debug!(
                    "destination {}: garlic frame dropped: {}",
                    hex::encode(&self.dest_hash[..8]),
                    e
                );
                return (blocks_out, events);
            }
        };

        let mut learned_dest: Option<IdentHash> = None;
        for (delivery, inner) in incoming.cloves {
            if delivery != CloveDelivery::Local {
                debug!("ignoring clove with non-local delivery {:?}", delivery);
                continue;
            }
            let Ok(msg) = I2npMessage::parse(&inner, 60_000) else {
                continue;
            };
            match msg.msg_type() {
                MessageType::Data => {
                    match unwrap_data_protocol(msg.payload()) {
                        Ok((payload, _src, _dst, PROTOCOL_STREAMING)) => {
                            for event in self.streaming.handle_packet_bytes(&payload) {
                                self.route_streaming_event(
                                    event,
                                    &mut blocks_out,
                                    &mut events,
                                    &mut learned_dest,
                                );
                            }
                        }
                        Ok((_, _, _, proto)) => {
                            debug!("unsupported data protocol {}", proto)
                        }
                        Err(e) => debug!("bad data message: {}", e),
                    }
                }
                MessageType::DeliveryStatus => {
                    if let Ok((token, _)) =
                        garlicnet_netdb::netdb::parse_delivery_status(msg.payload())
                    {
                        self.garlic.confirm_delivery(token);
                    }
                }
                other => debug!("unexpected clove payload {:?}", other),
            }
        }

        // route handshake replies back to whoever we just learned about
        for (remote_static, reply) in incoming.reply_frames {
            let dest = self
                .session_routes
                .get(&remote_static)
                .copied()
                .or(learned_dest);
            let Some(dest) = dest else {
                debug!("no route for garlic reply, dropped");
                continue;
            };
            self.session_routes.insert(remote_static, dest);
            let msg = I2npMessage::new(
                MessageType::Garlic,
                garlicnet_core::i2np::random_msg_id(),
                &reply,
            );
            match self.wrap_to_lease(dest, msg) {
                Ok(Some(block)) => blocks_out.push(block),
                Ok(None) => events.push(DestinationEvent::NeedLeaseSet { dest }),
                Err(e) => debug!("reply routing failed: {}", e),
            }
        }

        (blocks_out, events)
    }

    fn route_streaming_event(
        &mut self,
        event: StreamingEvent,
        blocks_out: &mut Vec<TunnelMessageBlock>,
        events: &mut Vec<DestinationEvent>,
        learned_dest: &mut Option<IdentHash>,
    ) {
        match event {
            StreamingEvent::StreamAccepted { stream_id } => {
                // learn the remote destination from the SYN's FROM option
                if let Some(identity) = self
                    .streaming
                    .stream(stream_id)
                    .and_then(|s| s.remote_identity.clone())
                {
                    let dest = identity.hash();
                    self.stream_routes.insert(stream_id, dest);
                    *learned_dest = Some(dest);
                }
                events.push(DestinationEvent::StreamAccepted { stream_id });
            }
            StreamingEvent::DataReady { stream_id } => {
                events.push(DestinationEvent::DataReady { stream_id });
            }
            StreamingEvent::PacketOut { stream_id, packet } => {
                match self.packet_to_block(stream_id, packet.to_bytes()) {
                    Ok(Some(block)) => blocks_out.push(block),
                    Ok(None) => {
                        if let Some(dest) = self.stream_routes.get(&stream_id) {
                            events.push(DestinationEvent::NeedLeaseSet { dest: *dest });
                        }
                    }
                    Err(e) => debug!("packet routing failed: {}", e),
                }
            }
            StreamingEvent::StreamClosed { stream_id } => {
                self.stream_routes.remove(&stream_id);
            }
        }
    }

    /// Drive stream pumps and timers; returns blocks for the pool plus
    /// control events.
    pub fn tick(&mut self) -> (Vec<TunnelMessageBlock>, Vec<DestinationEvent>) {
        let mut blocks_out = Vec::new();
        let mut events = Vec::new();
        let mut learned = None;
        for event in self.streaming.tick() {
            self.route_streaming_event(event, &mut blocks_out, &mut events, &mut learned);
        }
        self.garlic.maintenance();
        (blocks_out, events)
    }

    fn packet_to_block(
        &mut self,
        stream_id: u32,
        packet_bytes: Vec<u8>,
    ) -> Result<Option<TunnelMessageBlock>, RouterError> {
        let dest = *self
            .stream_routes
            .get(&stream_id)
            .ok_or(RouterError::UnknownStream(stream_id))?;
        let data = wrap_data_protocol(&packet_bytes, 0, 0, PROTOCOL_STREAMING);
        let msg = I2npMessage::new(
            MessageType::Data,
            garlicnet_core::i2np::random_msg_id(),
            &data,
        );
        self.block_for(dest, msg)
    }

    /// Garlic-wrap an I2NP message for a destination and address it to one
    /// of its leases. None means the lease set is not cached yet.
    fn block_for(
        &mut self,
        dest: IdentHash,
        msg: I2npMessage,
    ) -> Result<Option<TunnelMessageBlock>, RouterError> {
        let Some((ls, lease)) = self.remote_lease(&dest) else {
            self.parked.entry(dest).or_default().push((true, msg));
            return Ok(None);
        };
        let remote_static = ls.encryption_pubkey;
        self.session_routes.insert(remote_static, dest);

        let clove = GarlicBlock::Clove {
            delivery: CloveDelivery::Local,
            msg: msg.as_bytes().to_vec(),
        };
        let frame = self
            .garlic
            .encrypt_for(remote_static, &[clove])
            .map_err(|e| RouterError::Garlic(e.to_string()))?;
        let garlic_msg = I2npMessage::new(
            MessageType::Garlic,
            garlicnet_core::i2np::random_msg_id(),
            &frame,
        );
        Ok(Some(TunnelMessageBlock {
            delivery: TunnelDelivery::Tunnel {
                to: lease.tunnel_gateway,
                tunnel_id: lease.tunnel_id,
            },
            msg: garlic_msg,
        }))
    }

    fn wrap_to_lease(
        &mut self,
        dest: IdentHash,
        msg: I2npMessage,
    ) -> Result<Option<TunnelMessageBlock>, RouterError> {
        let Some((_, lease)) = self.remote_lease(&dest) else {
            self.parked.entry(dest).or_default().push((false, msg));
            return Ok(None);
        };
        Ok(Some(TunnelMessageBlock {
            delivery: TunnelDelivery::Tunnel {
                to: lease.tunnel_gateway,
                tunnel_id: lease.tunnel_id,
            },
            msg,
        }))
    }
}

impl From<garlicnet_streaming::StreamError> for RouterError {
    fn from(e: garlicnet_streaming::StreamError) -> Self {
        RouterError::Streaming(e.to_string())
    }
}

impl From<CoreError> for RouterError {
    fn from(e: CoreError) -> Self {
        RouterError::Core(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_destination() -> LocalDestination {
        LocalDestination::new(Identity::generate(), 7)
    }

    fn lease_set_for(dest: &LocalDestination) -> Arc<LeaseSet> {
        let mut ls = LeaseSet {
            destination: dest.identity.clone(),
            encryption_pubkey: dest.keys.encryption.public_key_bytes(),
            leases: vec![Lease {
                tunnel_gateway: [9u8; 32],
                tunnel_id: 99,
                end_time_ms: now_ms() + 600_000,
            }],
            published_ms: now_ms(),
            store_type: 3,
            flags: 0,
            signature: [0u8; 64],
        };
        ls.signature = dest.keys.signing.sign(&ls.signable_data());
        Arc::new(ls)
    }

    #[test]
    fn test_rebuild_lease_set_signs_and_resets_publication() {
        let mut dest = make_destination();
        let ls = dest.rebuild_lease_set(vec![Lease {
            tunnel_gateway: [1u8; 32],
            tunnel_id: 5,
            end_time_ms: now_ms() + 600_000,
        }]);
        assert!(ls.verify().is_ok());
        assert!(dest.publish_retry_due(), "fresh lease set wants publishing");
    }

    #[test]
    fn test_publish_attempts_capped() {
        let mut dest = make_destination();
        dest.rebuild_lease_set(vec![]);
        for _ in 0..MAX_PUBLISH_ATTEMPTS {
            assert!(dest.next_publish_attempt().is_some());
        }
        assert!(dest.next_publish_attempt().is_none());
    }

    #[test]
    fn test_publish_confirmation_stops_retries() {
        let mut dest = make_destination();
        dest.rebuild_lease_set(vec![]);
        let (token, _) = dest.next_publish_attempt().unwrap();
        assert!(dest.garlic.confirm_delivery(token));
        assert!(!dest.publish_retry_due());
    }

    #[test]
    fn test_connect_parks_until_lease_resolves() {
        let mut alice = make_destination();
        let bob = make_destination();
        let bob_hash = bob.dest_hash();

        let stream_id = alice.connect(&bob_hash);
        alice.send(stream_id, b"hello bob").unwrap();

        let (blocks, events) = alice.tick();
        assert!(blocks.is_empty(), "no lease set yet");
        assert!(events
            .iter()
            .any(|e| matches!(e, DestinationEvent::NeedLeaseSet { dest } if *dest == bob_hash)));

        // resolving the lease set releases the parked packet
        let released = alice.lease_set_resolved(lease_set_for(&bob));
        assert_eq!(released.len(), 1);
        match &released[0].delivery {
            TunnelDelivery::Tunnel { to, tunnel_id } => {
                assert_eq!(*to, [9u8; 32]);
                assert_eq!(*tunnel_id, 99);
            }
            other => panic!("unexpected delivery {:?}", other),
        }
        assert_eq!(released[0].msg.msg_type(), MessageType::Garlic);
    }

    #[test]
    fn test_streaming_end_to_end_through_garlic() {
        let mut alice = make_destination();
        let mut bob = make_destination();
        let bob_hash = bob.dest_hash();
        let alice_hash = alice.dest_hash();

        alice.lease_set_resolved(lease_set_for(&bob));
        bob.lease_set_resolved(lease_set_for(&alice));

        let stream_id = alice.connect(&bob_hash);
        alice.send(stream_id, b"ping").unwrap();

        // shuttle garlic frames between the two for a few rounds
        let mut to_bob: Vec<I2npMessage> = alice.tick().0.into_iter().map(|b| b.msg).collect();
        let mut to_alice: Vec<I2npMessage> = Vec::new();
        let mut accepted = None;
        for _ in 0..6 {
            for msg in to_bob.drain(..) {
                let (blocks, events) = bob.handle_garlic(msg.payload());
                to_alice.extend(blocks.into_iter().map(|b| b.msg));
                for event in events {
                    if let DestinationEvent::StreamAccepted { stream_id } = event {
                        accepted = Some(stream_id);
                    }
                }
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
            let (blocks, _) = bob.tick();
            to_alice.extend(blocks.into_iter().map(|b| b.msg));

            for msg in to_alice.drain(..) {
                let (blocks, _) = alice.handle_garlic(msg.payload());
                to_bob.extend(blocks.into_iter().map(|b| b.msg));
            }
            let (blocks, _) = alice.tick();
            to_bob.extend(blocks.into_iter().map(|b| b.msg));
        }

        let bob_stream = accepted.expect("stream accepted at bob");
        let mut buf = [0u8; 16];
        let n = bob.read(bob_stream, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
    }
}
