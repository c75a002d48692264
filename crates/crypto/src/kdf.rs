//! Key derivation chains
//!
//! HKDF-SHA256 extract/expand plus the single HMAC step used by the ratchet
//! tagset chains. Each tagset keeps two independent chains (tag chain and
//! symmetric-key chain); both advance one HMAC step per index.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// HKDF extract+expand: `HKDF(salt, ikm, info)` truncated to 32 bytes
pub fn hkdf_extract_expand(salt: &[u8], ikm: &[u8], info: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut out = [0u8; 32];
    // expand only fails when the output length exceeds 255*32 bytes
    hk.expand(info, &mut out).expect("hkdf output length");
    out
}

/// HKDF expand two 32-byte outputs from one extract (`key` is the PRK)
pub fn hkdf_expand(prk: &[u8; 32], info: &[u8]) -> ([u8; 32], [u8; 32]) {
    let hk = Hkdf::<Sha256>::from_prk(prk).expect("prk length");
    let mut out = [0u8; 64];
    hk.expand(info, &mut out).expect("hkdf output length");
    let mut a = [0u8; 32];
    let mut b = [0u8; 32];
    a.copy_from_slice(&out[..32]);
    b.copy_from_slice(&out[32..]);
    (a, b)
}

/// One HMAC-SHA256 chain step: `HMAC(chain_key, constant)`
pub fn hmac_step(chain_key: &[u8; 32], constant: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(chain_key).expect("hmac accepts any key length");
    mac.update(constant);
    mac.finalize().into_bytes().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hkdf_deterministic() {
        let a = hkdf_extract_expand(b"salt", b"ikm", b"info");
        let b = hkdf_extract_expand(b"salt", b"ikm", b"info");
        assert_eq!(a, b);
        assert_ne!(a, hkdf_extract_expand(b"salt", b"ikm", b"other"));
    }

    #[test]
    fn test_hkdf_expand_halves_differ() {
        let prk = hkdf_extract_expand(b"", b"root", b"");
        let (a, b) = hkdf_expand(&prk, b"SessionReplyTags");
        assert_ne!(a, b);
    }

    #[test]
    fn test_hmac_chain_advances() {
        let ck0 = [1u8; 32];
        let ck1 = hmac_step(&ck0, b"KDFSessionTagKeys");
        let ck2 = hmac_step(&ck1, b"KDFSessionTagKeys");
        assert_ne!(ck0, ck1);
        assert_ne!(ck1, ck2);
    }
}
