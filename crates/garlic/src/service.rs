//! Garlic session owner
//!
//! One per local destination (and one for the router itself): the map from
//! remote static keys to ratchet sessions, the incoming tag index for the
//! established fast path, one-time reply tags handed out to the netdb and
//! tunnel-test machinery, and the delivery-status table for in-flight
//! confirmations.

use std::collections::HashMap;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use garlicnet_core::{now_ms, PublicKey};
use garlicnet_crypto::{
    aead_decrypt, nonce_from_index, noise_n_decrypt, noise_n_encrypt, EncryptionKeypair,
};

use crate::blocks::{parse_blocks, serialize_blocks, CloveDelivery, GarlicBlock};
use crate::ratchet::{SessionTag, TAGSET_LOOKAHEAD};
use crate::session::{RatchetSession, TagPointer};
use crate::{GarlicError, Result};

/// Tags kept registered ahead per receive tagset
const TAG_WINDOW: usize = 32;

/// Delivery-status entries give up after this long
const DELIVERY_STATUS_TIMEOUT_MS: u64 = 60_000;

/// Where a received tag leads
enum TagRoute {
    /// Established-session tagset member
    Session {
        remote: PublicKey,
        pointer: TagPointer,
    },
    /// Reply tag of a new-session we initiated
    PendingReply { remote: PublicKey },
}

/// Everything a garlic frame produced
#[derive(Default)]
pub struct GarlicIncoming {
    /// Cloves to dispatch: delivery instructions plus inner I2NP bytes
    pub cloves: Vec<(CloveDelivery, Vec<u8>)>,
    /// Frames to send back to the remote (new-session replies, NextKey
    /// answers); routing is the caller's job
    pub reply_frames: Vec<(PublicKey, Vec<u8>)>,
    /// Inner bytes of a one-time-tag frame (netdb reply, tunnel test)
    pub raw: Option<Vec<u8>>,
}

pub struct GarlicService {
    our_static: EncryptionKeypair,
    sessions: HashMap<PublicKey, RatchetSession>,
    tag_index: HashMap<SessionTag, TagRoute>,
    one_time_tags: HashMap<[u8; 8], [u8; 32]>,
    delivery_status: HashMap<u32, (u64, oneshot::Sender<()>)>,
}

impl GarlicService {
    pub fn new(our_static: EncryptionKeypair) -> Self {
        Self {
            our_static,
            sessions: HashMap::new(),
            tag_index: HashMap::new(),
            one_time_tags: HashMap::new(),
            delivery_status: HashMap::new(),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Register a one-time reply tag (netdb lookups, tunnel tests).
    pub fn register_one_time_tag(&mut self, tag: [u8; 8], key: [u8; 32]) {
        self.one_time_tags.insert(tag, key);
    }

    /// Track an outgoing message expecting a DeliveryStatus confirmation.
    pub fn expect_delivery(&mut self, msg_id: u32, confirm: oneshot::Sender<()>) {
        self.delivery_status.insert(msg_id, (now_ms(), confirm));
    }

    /// A DeliveryStatus for `msg_id` arrived; fire the waiter.
    pub fn confirm_delivery(&mut self, msg_id: u32) -> bool {
        match self.delivery_status.remove(&msg_id) {
            Some((_, confirm)) => {
                let _ = confirm.send(());
                true
            }
            None => false,
        }
    }

    /// Encrypt blocks for a remote destination key.
    ///
    /// Uses the established session's tag fast path when available,
    /// otherwise (re)starts a handshake with a fresh new-session message.
    pub fn encrypt_for(
        &mut self,
        remote_static: PublicKey,
        blocks: &[GarlicBlock],
    ) -> Result<Vec<u8>> {
        let payload = serialize_blocks(blocks);

        if let Some(session) = self.sessions.get_mut(&remote_static) {
            if session.is_established() {
                return session.encrypt(&payload);
            }
        }

        // no established session: start (or restart) the handshake
        let (mut session, frame) =
            RatchetSession::new_outbound(&self.our_static, remote_static, &payload)?;
        for (tag, _) in session.nsr_tags() {
            self.tag_index.insert(
                tag,
                TagRoute::PendingReply {
                    remote: remote_static,
                },
            );
        }
        self.sessions.insert(remote_static, session);
        Ok(frame)
    }

    /// Decrypt and process one garlic frame.
    pub fn handle_garlic(&mut self, frame: &[u8]) -> Result<GarlicIncoming> {
        if frame.len() < 8 + 16 {
            return Err(GarlicError::MalformedFrame("short garlic frame"));
        }
        let tag: [u8; 8] = frame[..8].try_into().expect("8 bytes");

        // one-time reply tags carry a bare inner message
        if let Some(key) = self.one_time_tags.remove(&tag) {
            let inner = aead_decrypt(&key, &nonce_from_index(0), &tag, &frame[8..])?;
            return Ok(GarlicIncoming {
                raw: Some(inner),
                ..Default::default()
            });
        }

        match self.tag_index.remove(&tag) {
            Some(TagRoute::Session { remote, pointer }) => {
                let session = self
                    .sessions
                    .get_mut(&remote)
                    .ok_or(GarlicError::NoSession)?;
                let payload = session.decrypt(pointer, &tag, &frame[8..])?;
                self.refill_tags(remote);
                self.process_payload(remote, &payload)
            }
            Some(TagRoute::PendingReply { remote }) => {
                let session = self
                    .sessions
                    .get_mut(&remote)
                    .ok_or(GarlicError::NoSession)?;
                let payload = session.handle_reply(&self.our_static, &frame[8..])?;
                self.drop_pending_tags(&remote);
                self.refill_tags(remote);
                self.process_payload(remote, &payload)
            }
            None => self.handle_new_session(frame),
        }
    }

    /// No tag matched: try the frame as a new-session message addressed to
    /// our static key.
    fn handle_new_session(&mut self, frame: &[u8]) -> Result<GarlicIncoming> {
        let (mut session, payload) = RatchetSession::new_inbound(&self.our_static, frame)?;
        let remote = session.remote_static;

        let reply = session.create_reply(&serialize_blocks(&[GarlicBlock::DateTime {
            seconds: (now_ms() / 1000) as u32,
        }]))?;

        self.sessions.insert(remote, session);
        self.refill_tags(remote);

        let mut incoming = self.process_payload(remote, &payload)?;
        incoming.reply_frames.push((remote, reply));
        Ok(incoming)
    }

    /// Interpret decrypted payload blocks.
    fn process_payload(&mut self, remote: PublicKey, payload: &[u8]) -> Result<GarlicIncoming> {
        let mut incoming = GarlicIncoming::default();
        for block in parse_blocks(payload)? {
            match block {
                GarlicBlock::Clove { delivery, msg } => incoming.cloves.push((delivery, msg)),
                GarlicBlock::NextKey {
                    key_id,
                    reverse,
                    request_reverse,
                    key,
                } => {
                    let Some(session) = self.sessions.get_mut(&remote) else {
                        continue;
                    };
                    match session.handle_next_key(key_id, reverse, request_reverse, key) {
                        Ok(Some(answer)) => {
                            self.refill_tags(remote);
                            if let Some(session) = self.sessions.get_mut(&remote) {
                                if let Ok(frame) =
                                    session.encrypt(&serialize_blocks(&[answer]))
                                {
                                    incoming.reply_frames.push((remote, frame));
                                }
                            }
                        }
                        Ok(None) => {}
                        Err(e) => debug!("next key rejected: {}", e),
                    }
                }
                GarlicBlock::Termination { reason } => {
                    debug!("session terminated by remote (reason {})", reason);
                    self.sessions.remove(&remote);
                }
                GarlicBlock::AckRequest => {
                    // acknowledged implicitly by our next frame
                }
                GarlicBlock::DateTime { .. }
                | GarlicBlock::Options { .. }
                | GarlicBlock::Ack { .. }
                | GarlicBlock::Padding { .. } => {}
            }
        }
        Ok(incoming)
    }

    /// Keep the receive tag window topped up for a session.
    fn refill_tags(&mut self, remote: PublicKey) {
        let Some(session) = self.sessions.get_mut(&remote) else {
            return;
        };
        let registered = self
            .tag_index
            .values()
            .filter(|route| matches!(route, TagRoute::Session { remote: r, .. } if *r == remote))
            .count();
        if registered >= TAG_WINDOW {
            return;
        }
        let needed = (TAG_WINDOW - registered).min(TAGSET_LOOKAHEAD);
        for (tag, pointer) in session.generate_recv_tags(needed) {
            self.tag_index
                .insert(tag, TagRoute::Session { remote, pointer });
        }
    }

    fn drop_pending_tags(&mut self, remote: &PublicKey) {
        self.tag_index.retain(|_, route| {
            !matches!(route, TagRoute::PendingReply { remote: r } if r == remote)
        });
    }

    /// Periodic cleanup: expired sessions, their tags, stale tagsets and
    /// delivery-status entries.
    pub fn maintenance(&mut self) {
        let now = now_ms();

        let expired: Vec<PublicKey> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.is_expired(now))
            .map(|(k, _)| *k)
            .collect();
        for remote in expired {
            debug!("dropping expired garlic session");
            self.sessions.remove(&remote);
            self.tag_index.retain(|_, route| match route {
                TagRoute::Session { remote: r, .. } => *r != remote,
                TagRoute::PendingReply { remote: r } => *r != remote,
            });
        }

        for session in self.sessions.values_mut() {
            session.sweep_tagsets();
        }

        let stale: Vec<u32> = self
            .delivery_status
            .iter()
            .filter(|(_, (created, _))| created + DELIVERY_STATUS_TIMEOUT_MS < now)
            .map(|(id, _)| *id)
            .collect();
        for msg_id in stale {
            warn!("delivery status {} never confirmed", msg_id);
            self.delivery_status.remove(&msg_id);
        }
    }
}

/// Router-addressed garlic: one-shot Noise-N frames for messages sent to
/// the router itself (tunnel build requests and replies after transport
/// delivery). No session state survives a message.
pub struct RouterIncomingSession {
    router_static: EncryptionKeypair,
}

impl RouterIncomingSession {
    pub fn new(router_static: EncryptionKeypair) -> Self {
        Self { router_static }
    }

    /// Decrypt a router-addressed garlic message into payload blocks.
    pub fn decrypt(&self, message: &[u8]) -> Result<Vec<GarlicBlock>> {
        let (payload, _) = noise_n_decrypt(&self.router_static, message)?;
        parse_blocks(&payload)
    }
}

/// Wrap blocks as a router-addressed garlic message.
pub fn wrap_router_garlic(
    remote_router_static: &PublicKey,
    blocks: &[GarlicBlock],
) -> Result<Vec<u8>> {
    let payload = serialize_blocks(blocks);
    let (frame, _) = noise_n_encrypt(remote_router_static, &payload)?;
    Ok(frame)
}
