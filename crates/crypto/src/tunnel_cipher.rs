//! Tunnel layer cipher
//!
//! AES-256 double encryption of 1024-byte tunnel-data payloads: the 16-byte
//! IV is passed through AES-ECB with the hop's IV key, the remaining 1008
//! bytes through AES-CBC with the hop's layer key, then the IV through ECB
//! again. The double IV pass prevents a colluding first and last hop from
//! matching messages by IV.
//!
//! Tunnel owners apply `encrypt` once per hop; transit hops apply `decrypt`
//! exactly once. The two are strict inverses.

use aes::cipher::{
    block_padding::NoPadding, generic_array::GenericArray, BlockDecrypt, BlockDecryptMut,
    BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit,
};
use aes::Aes256;

type CbcEnc = cbc::Encryptor<Aes256>;
type CbcDec = cbc::Decryptor<Aes256>;

/// Size of the encrypted portion of a tunnel data message
pub const TUNNEL_DATA_ENCRYPTED_SIZE: usize = 1024;

/// Per-hop layer cipher state
#[derive(Clone)]
pub struct TunnelLayerCipher {
    layer_key: [u8; 32],
    iv_cipher: Aes256,
}

impl TunnelLayerCipher {
    pub fn new(layer_key: &[u8; 32], iv_key: &[u8; 32]) -> Self {
        Self {
            layer_key: *layer_key,
            iv_cipher: Aes256::new(iv_key.into()),
        }
    }

    /// Add one layer: `buf` is `IV(16) || payload(1008)`.
    pub fn encrypt(&self, buf: &mut [u8; TUNNEL_DATA_ENCRYPTED_SIZE]) {
        let (iv, payload) = buf.split_at_mut(16);
        self.iv_cipher
            .encrypt_block(GenericArray::from_mut_slice(&mut iv[..16]));

        let mut iv_arr = [0u8; 16];
        iv_arr.copy_from_slice(iv);
        CbcEnc::new(&self.layer_key.into(), &iv_arr.into())
            .encrypt_padded_mut::<NoPadding>(payload, payload.len())
            .expect("payload is block aligned");

        self.iv_cipher
            .encrypt_block(GenericArray::from_mut_slice(&mut iv[..16]));
    }

    /// Remove one layer. Inverse of [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, buf: &mut [u8; TUNNEL_DATA_ENCRYPTED_SIZE]) {
        let (iv, payload) = buf.split_at_mut(16);
        self.iv_cipher
            .decrypt_block(GenericArray::from_mut_slice(&mut iv[..16]));

        let mut iv_arr = [0u8; 16];
        iv_arr.copy_from_slice(iv);
        CbcDec::new(&self.layer_key.into(), &iv_arr.into())
            .decrypt_padded_mut::<NoPadding>(payload)
            .expect("payload is block aligned");

        self.iv_cipher
            .decrypt_block(GenericArray::from_mut_slice(&mut iv[..16]));
    }
}
