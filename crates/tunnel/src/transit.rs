//! Transit tunnels
//!
//! Hops in other routers' tunnels that this router carries: participants
//! strip one layer and forward, inbound gateways frame incoming
//! TunnelGateway messages, outbound endpoints reassemble and dispatch.
//! Admission is capacity- and congestion-gated and refuses to forward
//! toward ourselves or toward a known duplicated router.

use std::sync::Arc;

use rand::Rng;
use tracing::debug;

use garlicnet_core::{now_ms, CongestionLevel, I2npMessage, IdentHash, MessageType, TunnelId};
use garlicnet_crypto::TunnelLayerCipher;
use garlicnet_netdb::ProfileStore;

use crate::data::{TunnelDelivery, TunnelEndpointRx, TunnelGatewayBuffer, TUNNEL_DATA_SIZE};
use crate::TunnelError;

/// Transit tunnels live exactly this long
pub const TRANSIT_TUNNEL_EXPIRATION_MS: u64 = 600_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitRole {
    Participant,
    InboundGateway,
    OutboundEndpoint,
}

/// What a transit hop wants done with a processed message
#[derive(Debug)]
pub enum TransitAction {
    /// Forward to the next router via transports
    SendDirect { to: IdentHash, msg: I2npMessage },
    /// Deliver a reassembled endpoint message locally (netdb, garlic, ...)
    DeliverLocal { msg: I2npMessage },
}

/// One hop of someone else's tunnel
pub struct TransitTunnel {
    pub role: TransitRole,
    pub receive_tunnel_id: TunnelId,
    pub next_tunnel_id: TunnelId,
    pub next_router: IdentHash,
    pub created_ms: u64,
    cipher: TunnelLayerCipher,
    /// Endpoint-role reassembly state
    endpoint: Option<TunnelEndpointRx>,
    /// Gateway-role framing queue
    gateway: Option<TunnelGatewayBuffer>,
}

impl TransitTunnel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        role: TransitRole,
        receive_tunnel_id: TunnelId,
        next_tunnel_id: TunnelId,
        next_router: IdentHash,
        layer_key: &[u8; 32],
        iv_key: &[u8; 32],
        clock_skew_ms: u64,
    ) -> Self {
        Self {
            role,
            receive_tunnel_id,
            next_tunnel_id,
            next_router,
            created_ms: now_ms(),
            cipher: TunnelLayerCipher::new(layer_key, iv_key),
            endpoint: matches!(role, TransitRole::OutboundEndpoint)
                .then(|| TunnelEndpointRx::new(clock_skew_ms)),
            gateway: matches!(role, TransitRole::InboundGateway)
                .then(TunnelGatewayBuffer::new),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.created_ms + TRANSIT_TUNNEL_EXPIRATION_MS < now_ms()
    }

    /// Handle a TunnelData frame addressed to our receive id.
    pub fn handle_tunnel_data(
        &mut self,
        frame: &[u8; TUNNEL_DATA_SIZE],
    ) -> Result<Vec<TransitAction>, TunnelError> {
        let mut frame = *frame;
        self.cipher.decrypt(&mut frame);

        match self.role {
            TransitRole::Participant | TransitRole::InboundGateway => {
                let mut payload = Vec::with_capacity(4 + TUNNEL_DATA_SIZE);
                payload.extend_from_slice(&self.next_tunnel_id.to_be_bytes());
                payload.extend_from_slice(&frame);
                let msg = I2npMessage::new(
                    MessageType::TunnelData,
                    garlicnet_core::i2np::random_msg_id(),
                    &payload,
                );
                Ok(vec![TransitAction::SendDirect {
                    to: self.next_router,
                    msg,
                }])
            }
            TransitRole::OutboundEndpoint => {
                let endpoint = self.endpoint.as_mut().expect("endpoint role");
                let blocks = endpoint.process_frame(&frame)?;
                let mut actions = Vec::with_capacity(blocks.len());
                for block in blocks {
                    match block.delivery {
                        TunnelDelivery::Local => {
                            actions.push(TransitAction::DeliverLocal { msg: block.msg })
                        }
                        TunnelDelivery::Tunnel { to, tunnel_id } => {
                            let wrapped = block
                                .msg
                                .wrap_gateway(tunnel_id, garlicnet_core::i2np::random_msg_id());
                            actions.push(TransitAction::SendDirect { to, msg: wrapped });
                        }
                        TunnelDelivery::Router { to } => {
                            actions.push(TransitAction::SendDirect { to, msg: block.msg })
                        }
                    }
                }
                Ok(actions)
            }
        }
    }

    /// Handle a TunnelGateway message (inbound gateway role): frame the
    /// inner message and forward the resulting tunnel-data frames.
    pub fn handle_tunnel_gateway(
        &mut self,
        inner: I2npMessage,
    ) -> Result<Vec<TransitAction>, TunnelError> {
        let gateway = self
            .gateway
            .as_mut()
            .ok_or(TunnelError::WrongRole("tunnel gateway on non-gateway"))?;
        gateway.put(crate::data::TunnelMessageBlock {
            delivery: TunnelDelivery::Local,
            msg: inner,
        });

        let mut actions = Vec::new();
        for mut frame in gateway.flush() {
            self.cipher.decrypt(&mut frame);
            let mut payload = Vec::with_capacity(4 + TUNNEL_DATA_SIZE);
            payload.extend_from_slice(&self.next_tunnel_id.to_be_bytes());
            payload.extend_from_slice(&frame);
            actions.push(TransitAction::SendDirect {
                to: self.next_router,
                msg: I2npMessage::new(
                    MessageType::TunnelData,
                    garlicnet_core::i2np::random_msg_id(),
                    &payload,
                ),
            });
        }
        Ok(actions)
    }

    /// Periodic housekeeping for endpoint reassembly buffers.
    pub fn sweep(&mut self) {
        if let Some(endpoint) = self.endpoint.as_mut() {
            endpoint.sweep();
        }
    }
}

/// Inputs to the transit admission decision
pub struct AdmissionContext {
    pub accept_tunnels: bool,
    pub current_transit: usize,
    pub max_transit: usize,
    pub local_ident: IdentHash,
    /// Carries the duplicated-router set maintained by the netdb
    pub profiles: Arc<ProfileStore>,
}

impl AdmissionContext {
    pub fn congestion(&self) -> CongestionLevel {
        if self.max_transit == 0 || self.current_transit >= self.max_transit {
            CongestionLevel::Full
        } else if self.current_transit * 10 >= self.max_transit * 9 {
            CongestionLevel::Full
        } else if self.current_transit * 10 >= self.max_transit * 7 {
            CongestionLevel::Medium
        } else {
            CongestionLevel::Low
        }
    }

    /// Accept or decline a build request for the given role.
    pub fn admit(&self, next_router: &IdentHash, is_endpoint: bool) -> bool {
        if !self.accept_tunnels {
            return false;
        }
        if !is_endpoint && *next_router == self.local_ident {
            debug!("declining tunnel looping back to us");
            return false;
        }
        if !is_endpoint && self.profiles.is_duplicated(next_router) {
            debug!("declining tunnel going to duplicated router");
            return false;
        }
        match self.congestion() {
            CongestionLevel::Full => false,
            CongestionLevel::Medium => {
                // probabilistic reject between the medium and full marks
                let span = self.max_transit - self.max_transit * 7 / 10;
                let over = self.current_transit - self.max_transit * 7 / 10;
                let reject_permille = (over * 1000 / span.max(1)) as u32;
                rand::thread_rng().gen_range(0..1000) >= reject_permille
            }
            CongestionLevel::Low => true,
        }
    }
}
