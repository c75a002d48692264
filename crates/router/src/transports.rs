//! The transports boundary
//!
//! Transport session protocols are not part of the core; everything above
//! them talks to this trait. Sends are best-effort enqueues with no
//! completion signal. The in-memory implementation backs the integration
//! tests: per-peer bounded queues, with the peer dropped on overflow.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tracing::warn;

use garlicnet_core::{I2npMessage, IdentHash, TransportSet};

/// Per-peer outbound queue cap; beyond it the peer is dropped
pub const MAX_PEER_QUEUE: usize = 150;

pub trait Transports: Send + Sync {
    /// Best-effort enqueue toward a router.
    fn send_message(&self, to: &IdentHash, msg: I2npMessage);

    /// Batched variant.
    fn send_messages(&self, to: &IdentHash, msgs: Vec<I2npMessage>) {
        for msg in msgs {
            self.send_message(to, msg);
        }
    }

    /// A session to the router currently exists.
    fn is_connected(&self, to: &IdentHash) -> bool;

    /// Transports a session to this router could use.
    fn session_to(&self, to: &IdentHash) -> Option<TransportSet>;

    /// Peers whose sessions were torn down since the last call. Tunnels
    /// through them are aged out by the tunnel maintenance pass.
    fn take_dropped_peers(&self) -> Vec<IdentHash> {
        Vec::new()
    }
}

/// In-memory transport fabric for tests and simulations. All routers
/// attached to one fabric can reach each other; messages are pulled out by
/// the test pump.
#[derive(Default)]
pub struct SimTransports {
    local: IdentHash,
    state: Mutex<SimState>,
}

#[derive(Default)]
struct SimState {
    queues: HashMap<IdentHash, VecDeque<I2npMessage>>,
    connected: HashMap<IdentHash, TransportSet>,
    dropped_peers: Vec<IdentHash>,
}

impl SimTransports {
    pub fn new(local: IdentHash) -> Self {
        Self {
            local,
            state: Mutex::default(),
        }
    }

    pub fn local(&self) -> IdentHash {
        self.local
    }

    /// Mark a peer as having a live session.
    pub fn connect(&self, peer: IdentHash, transports: TransportSet) {
        self.state
            .lock()
            .expect("sim transports lock")
            .connected
            .insert(peer, transports);
    }

    /// Pull every queued (destination, message) pair.
    pub fn drain(&self) -> Vec<(IdentHash, I2npMessage)> {
        let mut state = self.state.lock().expect("sim transports lock");
        let mut out = Vec::new();
        for (peer, queue) in state.queues.iter_mut() {
            while let Some(msg) = queue.pop_front() {
                out.push((*peer, msg));
            }
        }
        out
    }

    pub fn dropped_peers(&self) -> Vec<IdentHash> {
        self.state
            .lock()
            .expect("sim transports lock")
            .dropped_peers
            .clone()
    }
}

impl SimTransports {
    fn take_dropped(&self) -> Vec<IdentHash> {
        std::mem::take(
            &mut self
                .state
                .lock()
                .expect("sim transports lock")
                .dropped_peers,
        )
    }
}

impl Transports for SimTransports {
    fn send_message(&self, to: &IdentHash, msg: I2npMessage) {
        let mut state = self.state.lock().expect("sim transports lock");
        let queue = state.queues.entry(*to).or_default();
        if queue.len() >= MAX_PEER_QUEUE {
            warn!(
                "peer {} queue overflow, dropping session",
                hex::encode(&to[..8])
            );
            queue.clear();
            state.connected.remove(to);
            state.dropped_peers.push(*to);
            return;
        }
        queue.push_back(msg);
    }

    fn is_connected(&self, to: &IdentHash) -> bool {
        self.state
            .lock()
            .expect("sim transports lock")
            .connected
            .contains_key(to)
    }

    fn session_to(&self, to: &IdentHash) -> Option<TransportSet> {
        self.state
            .lock()
            .expect("sim transports lock")
            .connected
            .get(to)
            .copied()
    }

    fn take_dropped_peers(&self) -> Vec<IdentHash> {
        self.take_dropped()
    }
}
