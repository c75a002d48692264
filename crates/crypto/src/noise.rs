//! Noise symmetric state
//!
//! The minimal MixHash/MixKey core of the Noise protocol framework, enough
//! for the N and IK patterns the router speaks: tunnel build records,
//! garlic new-session messages and router-addressed replies.

use crate::aead::{aead_decrypt, aead_encrypt, AeadError};
use crate::kdf::hkdf_expand;
use crate::keys::{hash, hash2, EncryptionKeypair};
use hkdf::Hkdf;
use sha2::Sha256;

/// Cumulative Noise symmetric state: chaining key + handshake hash.
#[derive(Clone)]
pub struct NoiseState {
    ck: [u8; 32],
    h: [u8; 32],
}

impl NoiseState {
    /// Initialize from a protocol name. `ck = h = SHA256(name)`.
    pub fn new(protocol_name: &[u8]) -> Self {
        let h = hash(protocol_name);
        Self { ck: h, h }
    }

    /// `h = SHA256(h || data)`
    pub fn mix_hash(&mut self, data: &[u8]) {
        self.h = hash2(&self.h, data);
    }

    /// Mix key material into the chaining key, returning the next message key.
    /// `(ck, k) = HKDF(salt = ck, ikm)`
    pub fn mix_key(&mut self, ikm: &[u8; 32]) -> [u8; 32] {
        let hk = Hkdf::<Sha256>::new(Some(&self.ck), ikm);
        let mut prk = [0u8; 32];
        hk.expand(b"", &mut prk).expect("hkdf output length");
        let (ck, k) = hkdf_expand(&prk, b"ck-and-k");
        self.ck = ck;
        k
    }

    /// Current handshake hash, used as associated data.
    pub fn h(&self) -> [u8; 32] {
        self.h
    }

    /// Current chaining key.
    pub fn ck(&self) -> [u8; 32] {
        self.ck
    }

    /// AEAD-encrypt with the given key, nonce 0, `h` as associated data,
    /// then mix the ciphertext into `h`.
    pub fn encrypt_and_mix(
        &mut self,
        key: &[u8; 32],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, AeadError> {
        let ct = aead_encrypt(key, &[0u8; 12], &self.h, plaintext)?;
        self.mix_hash(&ct);
        Ok(ct)
    }

    /// Inverse of [`encrypt_and_mix`](Self::encrypt_and_mix).
    pub fn decrypt_and_mix(
        &mut self,
        key: &[u8; 32],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, AeadError> {
        let pt = aead_decrypt(key, &[0u8; 12], &self.h, ciphertext)?;
        self.mix_hash(ciphertext);
        Ok(pt)
    }
}

/// Protocol name for the build-record and router-garlic Noise-N pattern.
pub const NOISE_N_PROTOCOL: &[u8] = b"Noise_N_25519_ChaChaPoly_SHA256";

/// Protocol name for the garlic ratchet IK handshake.
pub const NOISE_IK_PROTOCOL: &[u8] = b"Noise_IKelg2+hs2_25519_ChaChaPoly_SHA256";

/// One-shot Noise-N encrypt to a static key.
///
/// Output: `ephemeral_pub(32) || AEAD(k, 0, h, plaintext)`. The returned
/// state lets callers continue mixing (tunnel build chains records through
/// the same state).
pub fn noise_n_encrypt(
    remote_static: &[u8; 32],
    plaintext: &[u8],
) -> Result<(Vec<u8>, NoiseState), AeadError> {
    let mut state = NoiseState::new(NOISE_N_PROTOCOL);
    state.mix_hash(remote_static);

    let ephemeral = EncryptionKeypair::generate();
    let eph_pub = ephemeral.public_key_bytes();
    state.mix_hash(&eph_pub);

    let shared = ephemeral.diffie_hellman(remote_static);
    let k = state.mix_key(&shared);
    let ct = state.encrypt_and_mix(&k, plaintext)?;

    let mut out = Vec::with_capacity(32 + ct.len());
    out.extend_from_slice(&eph_pub);
    out.extend_from_slice(&ct);
    Ok((out, state))
}

/// One-shot Noise-N decrypt with our static keypair.
pub fn noise_n_decrypt(
    our_static: &EncryptionKeypair,
    message: &[u8],
) -> Result<(Vec<u8>, NoiseState), AeadError> {
    if message.len() < 32 + 16 {
        return Err(AeadError::DecryptionFailed);
    }
    let mut state = NoiseState::new(NOISE_N_PROTOCOL);
    state.mix_hash(&our_static.public_key_bytes());

    let mut eph_pub = [0u8; 32];
    eph_pub.copy_from_slice(&message[..32]);
    state.mix_hash(&eph_pub);

    let shared = our_static.diffie_hellman(&eph_pub);
    let k = state.mix_key(&shared);
    let pt = state.decrypt_and_mix(&k, &message[32..])?;
    Ok((pt, state))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noise_n_roundtrip() {
        let responder = EncryptionKeypair::generate();
        let (msg, _) = noise_n_encrypt(&responder.public_key_bytes(), b"build record").unwrap();
        let (pt, _) = noise_n_decrypt(&responder, &msg).unwrap();
        assert_eq!(pt, b"build record");
    }

    #[test]
    fn test_noise_n_wrong_key_fails() {
        let responder = EncryptionKeypair::generate();
        let other = EncryptionKeypair::generate();
        let (msg, _) = noise_n_encrypt(&responder.public_key_bytes(), b"record").unwrap();
        assert!(noise_n_decrypt(&other, &msg).is_err());
    }

    #[test]
    fn test_states_agree_after_handshake() {
        let responder = EncryptionKeypair::generate();
        let (msg, init_state) = noise_n_encrypt(&responder.public_key_bytes(), b"x").unwrap();
        let (_, resp_state) = noise_n_decrypt(&responder, &msg).unwrap();
        assert_eq!(init_state.h(), resp_state.h());
        assert_eq!(init_state.ck(), resp_state.ck());
    }

    #[test]
    fn test_mix_hash_order_matters() {
        let mut a = NoiseState::new(b"test");
        let mut b = NoiseState::new(b"test");
        a.mix_hash(b"one");
        a.mix_hash(b"two");
        b.mix_hash(b"two");
        b.mix_hash(b"one");
        assert_ne!(a.h(), b.h());
    }
}
