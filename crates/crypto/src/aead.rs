//! AEAD helpers
//!
//! ChaCha20-Poly1305 with caller-controlled nonces. Tunnel build records,
//! garlic frames and tagset messages all need deterministic nonces (record
//! index, tagset index), so unlike a transport cipher nothing here generates
//! randomness.

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AeadError {
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Invalid key")]
    InvalidKey,
}

/// Build a 12-byte nonce from a u64 counter (low 8 bytes, big-endian)
pub fn nonce_from_index(index: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&index.to_be_bytes());
    nonce
}

/// ChaCha20-Poly1305 encrypt with explicit nonce and associated data
pub fn aead_encrypt(
    key: &[u8; 32],
    nonce: &[u8; 12],
    ad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, AeadError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| AeadError::InvalidKey)?;
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad: ad,
            },
        )
        .map_err(|_| AeadError::EncryptionFailed)
}

/// ChaCha20-Poly1305 decrypt with explicit nonce and associated data
pub fn aead_decrypt(
    key: &[u8; 32],
    nonce: &[u8; 12],
    ad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, AeadError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| AeadError::InvalidKey)?;
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: ad,
            },
        )
        .map_err(|_| AeadError::DecryptionFailed)
}

/// Raw ChaCha20 keystream XOR in place (no authentication).
///
/// Build responders re-encrypt the records not addressed to them with this;
/// the per-record nonce is the record's index so the requester can undo each
/// hop's pass independently.
pub fn chacha20_xor(key: &[u8; 32], nonce: &[u8; 12], buf: &mut [u8]) {
    let mut cipher = ChaCha20::new(key.into(), nonce.into());
    cipher.apply_keystream(buf);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aead_roundtrip() {
        let key = [7u8; 32];
        let nonce = nonce_from_index(42);
        let ad = b"tag";

        let ct = aead_encrypt(&key, &nonce, ad, b"clove bytes").unwrap();
        let pt = aead_decrypt(&key, &nonce, ad, &ct).unwrap();
        assert_eq!(pt, b"clove bytes");
    }

    #[test]
    fn test_aead_wrong_ad_fails() {
        let key = [7u8; 32];
        let nonce = nonce_from_index(0);

        let ct = aead_encrypt(&key, &nonce, b"tag-a", b"data").unwrap();
        assert_eq!(
            aead_decrypt(&key, &nonce, b"tag-b", &ct),
            Err(AeadError::DecryptionFailed)
        );
    }

    #[test]
    fn test_aead_wrong_nonce_fails() {
        let key = [7u8; 32];
        let ct = aead_encrypt(&key, &nonce_from_index(1), b"", b"data").unwrap();
        assert!(aead_decrypt(&key, &nonce_from_index(2), b"", &ct).is_err());
    }

    #[test]
    fn test_chacha20_xor_is_involution() {
        let key = [9u8; 32];
        let nonce = nonce_from_index(3);
        let mut buf = vec![0xAAu8; 218];
        let orig = buf.clone();

        chacha20_xor(&key, &nonce, &mut buf);
        assert_ne!(buf, orig);
        chacha20_xor(&key, &nonce, &mut buf);
        assert_eq!(buf, orig);
    }

    #[test]
    fn test_nonce_from_index_layout() {
        let nonce = nonce_from_index(0x0102030405060708);
        assert_eq!(&nonce[..4], &[0, 0, 0, 0]);
        assert_eq!(&nonce[4..], &[1, 2, 3, 4, 5, 6, 7, 8]);
    }
}
