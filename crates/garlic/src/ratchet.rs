//! Ratchet tagsets
//!
//! A tagset is a pair of forward-secret HMAC chains seeded from the
//! session's root key: one yields 8-byte session tags, the other the
//! per-message AEAD keys. Both sides advance them in lockstep; the
//! receiver pre-computes a lookahead window of tags so out-of-order
//! messages still find their keys. Keys are retired on use.

use std::collections::HashMap;

use garlicnet_core::now_ms;
use garlicnet_crypto::{hkdf_expand, hkdf_extract_expand, hmac_step};

/// Tags a receiver keeps live ahead of the last consumed index
pub const TAGSET_LOOKAHEAD: usize = 128;

/// A superseded receive tagset answers for this long
pub const OLD_TAGSET_GRACE_MS: u64 = 180_000;

/// 8-byte session tag
pub type SessionTag = [u8; 8];

/// One direction's tag/key chain
pub struct RatchetTagSet {
    pub tagset_id: u16,
    session_tag_ck: [u8; 32],
    symm_key_ck: [u8; 32],
    /// Next index the tag chain will emit
    next_tag_index: u32,
    /// Next index the key chain will emit
    next_key_index: u32,
    /// Keys computed ahead for out-of-order receives
    key_cache: HashMap<u32, [u8; 32]>,
    pub created_ms: u64,
    /// Set when superseded by a DH ratchet step
    pub expires_ms: Option<u64>,
}

impl RatchetTagSet {
    /// Derive a tagset from the session root key and a tagset key.
    pub fn new(tagset_id: u16, root_key: &[u8; 32], tagset_key: &[u8; 32]) -> Self {
        let seed = hkdf_extract_expand(root_key, tagset_key, b"SessionTagAndKeySeed");
        let (session_tag_ck, symm_key_ck) = hkdf_expand(&seed, b"SessionTagAndKeyCks");
        Self {
            tagset_id,
            session_tag_ck,
            symm_key_ck,
            next_tag_index: 0,
            next_key_index: 0,
            key_cache: HashMap::new(),
            created_ms: now_ms(),
            expires_ms: None,
        }
    }

    /// Advance the tag chain one step.
    pub fn next_tag(&mut self) -> (u32, SessionTag) {
        let material = hmac_step(&self.session_tag_ck, b"SessionTagKeyGen");
        self.session_tag_ck = hmac_step(&self.session_tag_ck, b"STInitialization");
        let tag: SessionTag = material[..8].try_into().expect("8 bytes");
        let index = self.next_tag_index;
        self.next_tag_index += 1;
        (index, tag)
    }

    /// The AEAD key for `index`. Indices may be consumed out of order;
    /// each key is handed out exactly once.
    pub fn take_key(&mut self, index: u32) -> Option<[u8; 32]> {
        if let Some(key) = self.key_cache.remove(&index) {
            return Some(key);
        }
        if index < self.next_key_index {
            // already consumed
            return None;
        }
        while self.next_key_index < index {
            let key = hmac_step(&self.symm_key_ck, b"SymmetricKeyGen");
            self.key_cache.insert(self.next_key_index, key);
            self.symm_key_ck = hmac_step(&self.symm_key_ck, b"SKInitialization");
            self.next_key_index += 1;
        }
        let key = hmac_step(&self.symm_key_ck, b"SymmetricKeyGen");
        self.symm_key_ck = hmac_step(&self.symm_key_ck, b"SKInitialization");
        self.next_key_index += 1;
        Some(key)
    }

    /// Mark superseded; it keeps answering for the grace period.
    pub fn retire(&mut self) {
        self.expires_ms = Some(now_ms() + OLD_TAGSET_GRACE_MS);
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        matches!(self.expires_ms, Some(expiry) if expiry < now_ms)
    }

    pub fn cached_keys(&self) -> usize {
        self.key_cache.len()
    }
}
