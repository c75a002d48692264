//! Owned tunnels
//!
//! A tunnel we built: the ordered hop list with per-hop layer ciphers, the
//! lifecycle state machine and the latency estimate fed by tunnel tests.
//! Inbound and outbound tunnels share the struct; direction decides which
//! end we are and therefore how frames are transformed.

use rand::Rng;

use garlicnet_core::{now_ms, IdentHash, PublicKey, TunnelId};
use garlicnet_crypto::TunnelLayerCipher;

use crate::data::{
    TunnelDelivery, TunnelEndpointRx, TunnelGatewayBuffer, TunnelMessageBlock, TUNNEL_DATA_SIZE,
};

/// Hard lifetime of a tunnel
pub const TUNNEL_EXPIRATION_MS: u64 = 660_000;

/// Age at which a replacement build starts
pub const TUNNEL_RECREATION_MS: u64 = 510_000;

/// Age at which the tunnel stops being handed out for new traffic
pub const TUNNEL_EXPIRING_MS: u64 = 600_000;

/// A pending build gives up after this long
pub const BUILD_TIMEOUT_MS: u64 = 30_000;

/// Longest allowed hop list
pub const MAX_TUNNEL_LENGTH: usize = 8;

/// Per-hop latency above which a tunnel counts as slow, microseconds
pub const HIGH_LATENCY_PER_HOP_US: u32 = 250_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Pending,
    BuildFailed,
    Established,
    TestFailed,
    Failed,
    Expiring,
}

/// One hop of an owned tunnel
pub struct TunnelHop {
    pub ident: IdentHash,
    pub static_key: PublicKey,
    /// The id this hop receives frames under; the first hop's id is what
    /// we address (outbound) or publish in leases (inbound)
    pub receive_tunnel_id: TunnelId,
    pub cipher: TunnelLayerCipher,
}

/// A tunnel this router built and owns.
///
/// Hops are stored in path order away from us for outbound tunnels and in
/// travel order (gateway first) for inbound ones; in both cases the owner
/// transform walks them in reverse.
pub struct Tunnel {
    /// Our receive-side id (inbound) or the first hop's receive id
    /// (outbound; the id we address frames to)
    pub tunnel_id: TunnelId,
    pub is_inbound: bool,
    pub hops: Vec<TunnelHop>,
    pub state: TunnelState,
    pub created_ms: u64,
    /// EWMA latency in microseconds, once a test has completed
    pub latency_us: Option<u32>,
    /// Gateway-side framing queue (outbound tunnels)
    pub gateway: TunnelGatewayBuffer,
    /// Endpoint-side reassembly (inbound tunnels)
    pub endpoint: TunnelEndpointRx,
}

impl Tunnel {
    pub fn new(tunnel_id: TunnelId, is_inbound: bool, hops: Vec<TunnelHop>) -> Self {
        Self {
            tunnel_id,
            is_inbound,
            hops,
            state: TunnelState::Pending,
            created_ms: now_ms(),
            latency_us: None,
            gateway: TunnelGatewayBuffer::new(),
            endpoint: TunnelEndpointRx::new(60_000),
        }
    }

    /// Established tunnels still carry traffic while `TestFailed`.
    pub fn is_established(&self) -> bool {
        matches!(
            self.state,
            TunnelState::Established | TunnelState::TestFailed
        )
    }

    pub fn is_failed(&self) -> bool {
        self.state == TunnelState::Failed
    }

    pub fn age_ms(&self) -> u64 {
        now_ms().saturating_sub(self.created_ms)
    }

    pub fn is_expired(&self) -> bool {
        self.age_ms() > TUNNEL_EXPIRATION_MS
    }

    /// Old enough that a replacement should be building
    pub fn needs_recreation(&self) -> bool {
        self.age_ms() > TUNNEL_RECREATION_MS
    }

    /// Past the point where new traffic should pick it
    pub fn is_expiring(&self) -> bool {
        self.age_ms() > TUNNEL_EXPIRING_MS
    }

    /// Age the tunnel out immediately (first-hop transport drop).
    pub fn age_out(&mut self) {
        self.created_ms = self.created_ms.saturating_sub(TUNNEL_EXPIRATION_MS);
    }

    pub fn num_hops(&self) -> usize {
        self.hops.len()
    }

    /// EWMA update from a tunnel test sample.
    pub fn add_latency_sample(&mut self, sample_us: u32) {
        self.latency_us = Some(match self.latency_us {
            Some(latency) => (latency + sample_us) / 2,
            None => sample_us,
        });
    }

    pub fn is_slow(&self) -> bool {
        match self.latency_us {
            Some(latency) => latency > HIGH_LATENCY_PER_HOP_US * self.hops.len().max(1) as u32,
            None => false,
        }
    }

    /// True when the measured latency (ms) falls inside `[low, high]`.
    pub fn latency_fits(&self, low_ms: u32, high_ms: u32) -> bool {
        match self.latency_us {
            Some(latency) => {
                let ms = latency / 1000;
                ms >= low_ms && ms <= high_ms
            }
            None => false,
        }
    }

    /// The far end of the tunnel: endpoint for outbound, gateway for
    /// inbound. Zero-hop tunnels end at ourselves.
    pub fn far_end(&self) -> Option<&TunnelHop> {
        if self.is_inbound {
            self.hops.first()
        } else {
            self.hops.last()
        }
    }

    /// Owner-side layer transform: wrap (outbound) or unwrap (inbound) a
    /// frame with every hop's cipher, innermost first.
    pub fn owner_transform(&self, frame: &mut [u8; TUNNEL_DATA_SIZE]) {
        for hop in self.hops.iter().rev() {
            hop.cipher.encrypt(frame);
        }
    }

    /// Queue a block on an outbound tunnel's gateway.
    pub fn send_block(&mut self, delivery: TunnelDelivery, msg: garlicnet_core::I2npMessage) {
        self.gateway.put(TunnelMessageBlock { delivery, msg });
    }
}

/// Pick a fresh non-zero tunnel id.
pub fn random_tunnel_id() -> TunnelId {
    loop {
        let id: u32 = rand::thread_rng().gen();
        if id != 0 {
            return id;
        }
    }
}
