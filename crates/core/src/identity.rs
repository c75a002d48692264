//! Peer identities
//!
//! The long-term public identity of a router or destination: an Ed25519
//! signing key, an X25519 encryption key and an opaque certificate blob.
//! The identity hash (SHA-256 over the serialized identity) is the key
//! under which the peer appears everywhere else in the system.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::types::{IdentHash, PublicKey};

/// Public identity of a router or destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    /// Ed25519 verifying key
    pub signing_pubkey: PublicKey,
    /// X25519 static key for garlic / build-record encryption
    pub encryption_pubkey: PublicKey,
    /// Opaque certificate (key type and extensions); empty for default keys
    pub cert: Vec<u8>,
}

impl PeerIdentity {
    pub fn new(signing_pubkey: PublicKey, encryption_pubkey: PublicKey) -> Self {
        Self {
            signing_pubkey,
            encryption_pubkey,
            cert: Vec::new(),
        }
    }

    /// Serialize: `signing(32) || encryption(32) || cert_len(2) || cert`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(66 + self.cert.len());
        out.extend_from_slice(&self.signing_pubkey);
        out.extend_from_slice(&self.encryption_pubkey);
        out.extend_from_slice(&(self.cert.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.cert);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<(Self, usize)> {
        if bytes.len() < 66 {
            return Err(CoreError::Truncated {
                need: 66,
                got: bytes.len(),
            });
        }
        let cert_len = u16::from_be_bytes(bytes[64..66].try_into().expect("2 bytes")) as usize;
        if bytes.len() < 66 + cert_len {
            return Err(CoreError::Truncated {
                need: 66 + cert_len,
                got: bytes.len(),
            });
        }
        let identity = Self {
            signing_pubkey: bytes[..32].try_into().expect("32 bytes"),
            encryption_pubkey: bytes[32..64].try_into().expect("32 bytes"),
            cert: bytes[66..66 + cert_len].to_vec(),
        };
        Ok((identity, 66 + cert_len))
    }

    /// Identity hash: SHA-256 over the serialized identity
    pub fn hash(&self) -> IdentHash {
        garlicnet_crypto::hash(&self.to_bytes())
    }

    /// Verify an Ed25519 signature made by this identity
    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> Result<()> {
        garlicnet_crypto::verify_signature(&self.signing_pubkey, message, signature)
            .map_err(|_| CoreError::InvalidSignature)
    }
}
