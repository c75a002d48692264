//! ECIES-X25519-AEAD-Ratchet sessions
//!
//! A Noise-IK style handshake (new-session, new-session-reply) followed by
//! tag-based AEAD frames from forward-secret tagsets. Either side can
//! advance the DH ratchet with a NextKey exchange, rolling both ends onto
//! fresh tagsets while the superseded receive tagset keeps answering for a
//! grace period.

use garlicnet_core::{now_ms, PublicKey};
use garlicnet_crypto::{
    aead_decrypt, aead_encrypt, hkdf_expand, hkdf_extract_expand, nonce_from_index,
    noise::NOISE_IK_PROTOCOL, EncryptionKeypair, NoiseState,
};
use tracing::debug;

use crate::blocks::GarlicBlock;
use crate::ratchet::{RatchetTagSet, SessionTag};
use crate::{GarlicError, Result};

/// Idle sessions are dropped after this long
pub const SESSION_EXPIRATION_MS: u64 = 330_000;

/// A session still waiting for its reply is dropped after this long
pub const SESSION_INCOMPLETE_TIMEOUT_MS: u64 = 30_000;

/// Tags registered ahead for the new-session-reply
pub const NSR_TAG_WINDOW: usize = 12;

/// Initiator state retained between NS and NSR
struct OutboundPending {
    noise: NoiseState,
    ephemeral: EncryptionKeypair,
}

/// Points a received tag back to its tagset and index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagPointer {
    pub tagset_id: u16,
    pub index: u32,
}

pub struct RatchetSession {
    pub remote_static: PublicKey,
    pending: Option<OutboundPending>,
    /// Matches the reply to an NS we sent, or carries the tag for the NSR
    /// we are about to send
    nsr_tagset: Option<RatchetTagSet>,
    /// Responder state between NS receipt and NSR creation
    responder_noise: Option<NoiseState>,
    /// Initiator ephemeral remembered by the responder for the reply DH
    nsr_remote_ephemeral: Option<PublicKey>,
    pub send_tagset: Option<RatchetTagSet>,
    pub recv_tagsets: Vec<RatchetTagSet>,
    root_key: [u8; 32],
    /// Direction keys fixed at handshake; new tagsets re-derive from the
    /// current root key and these
    send_direction_key: [u8; 32],
    recv_direction_key: [u8; 32],
    next_send_tagset_id: u16,
    next_recv_tagset_id: u16,
    /// Our proposed ratchet key awaiting the reverse reply
    pending_next_key: Option<(u16, EncryptionKeypair)>,
    pub last_activity_ms: u64,
}

impl RatchetSession {
    fn base(remote_static: PublicKey) -> Self {
        Self {
            remote_static,
            pending: None,
            nsr_tagset: None,
            responder_noise: None,
            nsr_remote_ephemeral: None,
            send_tagset: None,
            recv_tagsets: Vec::new(),
            root_key: [0u8; 32],
            send_direction_key: [0u8; 32],
            recv_direction_key: [0u8; 32],
            next_send_tagset_id: 1,
            next_recv_tagset_id: 1,
            pending_next_key: None,
            last_activity_ms: now_ms(),
        }
    }

    pub fn is_established(&self) -> bool {
        self.send_tagset.is_some()
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        let timeout = if self.is_established() {
            SESSION_EXPIRATION_MS
        } else {
            SESSION_INCOMPLETE_TIMEOUT_MS
        };
        self.last_activity_ms + timeout < now_ms
    }

    // ---- handshake --------------------------------------------------------

    /// Initiator: create the session and the new-session message
    /// `ephemeral(32) || enc(static)(48) || enc(payload)`.
    pub fn new_outbound(
        our_static: &EncryptionKeypair,
        remote_static: PublicKey,
        payload: &[u8],
    ) -> Result<(Self, Vec<u8>)> {
        let mut noise = NoiseState::new(NOISE_IK_PROTOCOL);
        noise.mix_hash(&remote_static);

        let ephemeral = EncryptionKeypair::generate();
        let eph_pub = ephemeral.public_key_bytes();
        noise.mix_hash(&eph_pub);

        let k1 = noise.mix_key(&ephemeral.diffie_hellman(&remote_static));
        let ct_static = noise.encrypt_and_mix(&k1, &our_static.public_key_bytes())?;

        let k2 = noise.mix_key(&our_static.diffie_hellman(&remote_static));
        let ct_payload = noise.encrypt_and_mix(&k2, payload)?;

        let mut msg = Vec::with_capacity(32 + ct_static.len() + ct_payload.len());
        msg.extend_from_slice(&eph_pub);
        msg.extend_from_slice(&ct_static);
        msg.extend_from_slice(&ct_payload);

        let mut session = Self::base(remote_static);
        session.nsr_tagset = Some(RatchetTagSet::new(0, &noise.ck(), &[0u8; 32]));
        session.pending = Some(OutboundPending { noise, ephemeral });
        Ok((session, msg))
    }

    /// Tags the initiator should register for the expected reply.
    pub fn nsr_tags(&mut self) -> Vec<(SessionTag, TagPointer)> {
        let Some(tagset) = self.nsr_tagset.as_mut() else {
            return Vec::new();
        };
        (0..NSR_TAG_WINDOW)
            .map(|_| {
                let (index, tag) = tagset.next_tag();
                (
                    tag,
                    TagPointer {
                        tagset_id: 0,
                        index,
                    },
                )
            })
            .collect()
    }

    /// Responder: consume a new-session message, yielding the session and
    /// the decrypted payload. The caller sends the reply created by
    /// [`create_reply`](Self::create_reply).
    pub fn new_inbound(
        our_static: &EncryptionKeypair,
        message: &[u8],
    ) -> Result<(Self, Vec<u8>)> {
        if message.len() < 32 + 48 + 16 {
            return Err(GarlicError::MalformedFrame("short new-session"));
        }
        let mut noise = NoiseState::new(NOISE_IK_PROTOCOL);
        noise.mix_hash(&our_static.public_key_bytes());

        let eph_pub: PublicKey = message[..32].try_into().expect("32 bytes");
        noise.mix_hash(&eph_pub);

        let k1 = noise.mix_key(&our_static.diffie_hellman(&eph_pub));
        let remote_static_bytes = noise.decrypt_and_mix(&k1, &message[32..80])?;
        let remote_static: PublicKey = remote_static_bytes
            .as_slice()
            .try_into()
            .map_err(|_| GarlicError::MalformedFrame("static key length"))?;

        let k2 = noise.mix_key(&our_static.diffie_hellman(&remote_static));
        let payload = noise.decrypt_and_mix(&k2, &message[80..])?;

        let mut session = Self::base(remote_static);
        session.responder_noise = Some(noise);
        session.nsr_remote_ephemeral = Some(eph_pub);
        Ok((session, payload))
    }

    /// Responder: build the new-session-reply
    /// `tag(8) || ephemeral(32) || enc(payload)` and establish tagsets.
    pub fn create_reply(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut noise = self
            .responder_noise
            .take()
            .ok_or(GarlicError::NoSession)?;
        let remote_eph = self
            .nsr_remote_ephemeral
            .ok_or(GarlicError::NoSession)?;

        // the reply travels under the first tag of the NS-derived tagset
        let mut nsr_tagset = RatchetTagSet::new(0, &noise.ck(), &[0u8; 32]);
        let (_, tag) = nsr_tagset.next_tag();

        let ephemeral = EncryptionKeypair::generate();
        let eph_pub = ephemeral.public_key_bytes();
        noise.mix_hash(&eph_pub);

        let _k3 = noise.mix_key(&ephemeral.diffie_hellman(&remote_eph));
        let k4 = noise.mix_key(&ephemeral.diffie_hellman(&self.remote_static));
        let ct = noise.encrypt_and_mix(&k4, payload)?;

        self.establish(&noise.ck(), false);

        let mut msg = Vec::with_capacity(8 + 32 + ct.len());
        msg.extend_from_slice(&tag);
        msg.extend_from_slice(&eph_pub);
        msg.extend_from_slice(&ct);
        Ok(msg)
    }

    /// Initiator: consume the reply (after the 8-byte tag) and establish.
    pub fn handle_reply(
        &mut self,
        our_static: &EncryptionKeypair,
        message: &[u8],
    ) -> Result<Vec<u8>> {
        if message.len() < 32 + 16 {
            return Err(GarlicError::MalformedFrame("short reply"));
        }
        let pending = self.pending.take().ok_or(GarlicError::NoSession)?;
        let mut noise = pending.noise;

        let remote_eph: PublicKey = message[..32].try_into().expect("32 bytes");
        noise.mix_hash(&remote_eph);

        let _k3 = noise.mix_key(&pending.ephemeral.diffie_hellman(&remote_eph));
        let k4 = noise.mix_key(&our_static.diffie_hellman(&remote_eph));
        let payload = noise.decrypt_and_mix(&k4, &message[32..])?;

        self.establish(&noise.ck(), true);
        Ok(payload)
    }

    /// Derive root key, direction keys and the initial tagsets.
    fn establish(&mut self, handshake_ck: &[u8; 32], initiator: bool) {
        self.root_key = *handshake_ck;
        let (key_ab, key_ba) = hkdf_expand(&self.root_key, b"SessionDirectionKeys");
        let (send_key, recv_key) = if initiator {
            (key_ab, key_ba)
        } else {
            (key_ba, key_ab)
        };
        self.send_direction_key = send_key;
        self.recv_direction_key = recv_key;
        self.send_tagset = Some(RatchetTagSet::new(0, &self.root_key, &send_key));
        self.recv_tagsets
            .push(RatchetTagSet::new(0, &self.root_key, &recv_key));
        self.nsr_tagset = None;
        self.last_activity_ms = now_ms();
    }

    // ---- established traffic ---------------------------------------------

    /// Encrypt a payload as `tag(8) || AEAD(key_i, nonce=i, ad=tag, ...)`.
    pub fn encrypt(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let tagset = self.send_tagset.as_mut().ok_or(GarlicError::NoSession)?;
        let (index, tag) = tagset.next_tag();
        let key = tagset
            .take_key(index)
            .ok_or(GarlicError::TagConsumed)?;
        let ct = aead_encrypt(&key, &nonce_from_index(index as u64), &tag, payload)?;

        let mut out = Vec::with_capacity(8 + ct.len());
        out.extend_from_slice(&tag);
        out.extend_from_slice(&ct);
        self.last_activity_ms = now_ms();
        Ok(out)
    }

    /// Decrypt an established-session frame whose tag resolved to
    /// `pointer`.
    pub fn decrypt(
        &mut self,
        pointer: TagPointer,
        tag: &SessionTag,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        let tagset = self
            .recv_tagsets
            .iter_mut()
            .find(|ts| ts.tagset_id == pointer.tagset_id)
            .ok_or(GarlicError::NoSession)?;
        let key = tagset
            .take_key(pointer.index)
            .ok_or(GarlicError::TagConsumed)?;
        let payload = aead_decrypt(
            &key,
            &nonce_from_index(pointer.index as u64),
            tag,
            ciphertext,
        )?;
        self.last_activity_ms = now_ms();
        Ok(payload)
    }

    // ---- DH ratchet -------------------------------------------------------

    /// Propose a send-side ratchet step. The block travels in the next
    /// message; the new tagset activates when the reverse key arrives.
    pub fn start_dh_ratchet(&mut self) -> GarlicBlock {
        let keypair = EncryptionKeypair::generate();
        let key_id = self.next_send_tagset_id;
        let block = GarlicBlock::NextKey {
            key_id,
            reverse: false,
            request_reverse: true,
            key: Some(keypair.public_key_bytes()),
        };
        self.pending_next_key = Some((key_id, keypair));
        block
    }

    /// Apply a received NextKey block. May return a block to send back.
    pub fn handle_next_key(
        &mut self,
        key_id: u16,
        reverse: bool,
        request_reverse: bool,
        key: Option<[u8; 32]>,
    ) -> Result<Option<GarlicBlock>> {
        match (reverse, request_reverse, key) {
            // peer ratchets its send side; we roll a new receive tagset and
            // answer with our reverse key
            (false, true, Some(remote_key)) => {
                let keypair = EncryptionKeypair::generate();
                let shared = keypair.diffie_hellman(&remote_key);
                self.root_key =
                    hkdf_extract_expand(&self.root_key, &shared, b"NextRootKey");

                for tagset in &mut self.recv_tagsets {
                    if tagset.expires_ms.is_none() {
                        tagset.retire();
                    }
                }
                let tagset_id = self.next_recv_tagset_id;
                self.next_recv_tagset_id += 1;
                self.recv_tagsets.push(RatchetTagSet::new(
                    tagset_id,
                    &self.root_key,
                    &self.recv_direction_key,
                ));
                debug!("dh ratchet: new receive tagset {}", tagset_id);

                Ok(Some(GarlicBlock::NextKey {
                    key_id,
                    reverse: true,
                    request_reverse: false,
                    key: Some(keypair.public_key_bytes()),
                }))
            }
            // the reverse key completing our request: roll the send tagset
            (true, false, Some(remote_key)) => {
                let (key_id_ours, keypair) = self
                    .pending_next_key
                    .take()
                    .ok_or(GarlicError::MalformedBlock("unsolicited reverse key"))?;
                if key_id_ours != key_id {
                    return Err(GarlicError::MalformedBlock("next key id mismatch"));
                }
                let shared = keypair.diffie_hellman(&remote_key);
                self.root_key =
                    hkdf_extract_expand(&self.root_key, &shared, b"NextRootKey");
                self.next_send_tagset_id += 1;
                self.send_tagset = Some(RatchetTagSet::new(
                    key_id,
                    &self.root_key,
                    &self.send_direction_key,
                ));
                debug!("dh ratchet: new send tagset {}", key_id);
                Ok(None)
            }
            _ => Err(GarlicError::MalformedBlock("next key flags")),
        }
    }

    /// Drop receive tagsets past their grace period.
    pub fn sweep_tagsets(&mut self) {
        let now = now_ms();
        self.recv_tagsets.retain(|ts| !ts.is_expired(now));
    }

    /// Pre-generate receive tags for the lookahead window.
    pub fn generate_recv_tags(&mut self, count: usize) -> Vec<(SessionTag, TagPointer)> {
        let mut tags = Vec::new();
        if let Some(tagset) = self.recv_tagsets.last_mut() {
            for _ in 0..count {
                let (index, tag) = tagset.next_tag();
                tags.push((
                    tag,
                    TagPointer {
                        tagset_id: tagset.tagset_id,
                        index,
                    },
                ));
            }
        }
        tags
    }
}
