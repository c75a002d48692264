//! GarlicNet cryptography
//!
//! Key material wrappers, AEAD helpers, the Noise symmetric state used by
//! the tunnel build protocol and garlic handshakes, the HKDF/HMAC chains
//! behind ratchet tagsets, and the AES-CBC layer cipher for tunnel data.
//!
//! Raw primitives come from the dalek / RustCrypto ecosystem; this crate
//! only composes them.

pub mod aead;
pub mod kdf;
pub mod keys;
pub mod noise;
pub mod tunnel_cipher;

pub use aead::{aead_decrypt, aead_encrypt, chacha20_xor, nonce_from_index, AeadError};
pub use kdf::{hkdf_expand, hkdf_extract_expand, hmac_step};
pub use keys::{hash, hash2, verify_signature, EncryptionKeypair, Identity, KeyError, SigningKeypair};
pub use noise::{noise_n_decrypt, noise_n_encrypt, NoiseState, NOISE_IK_PROTOCOL, NOISE_N_PROTOCOL};
pub use tunnel_cipher::{TunnelLayerCipher, TUNNEL_DATA_ENCRYPTED_SIZE};
