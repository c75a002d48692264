use std::time::{SystemTime, UNIX_EPOCH};

/// 32-byte identity hash (router or destination)
pub type IdentHash = [u8; 32];

/// 32-byte public key
pub type PublicKey = [u8; 32];

/// 64-byte Ed25519 signature
pub type Signature = [u8; 64];

/// Tunnel identifier, unique per receiving router
pub type TunnelId = u32;

/// Milliseconds since the Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_millis() as u64
}

/// Seconds since the Unix epoch
pub fn now_s() -> u64 {
    now_ms() / 1000
}

/// XOR metric between two 32-byte values, as used for netDb closeness
pub fn xor_distance(a: &IdentHash, b: &IdentHash) -> [u8; 32] {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xor_distance_self_is_zero() {
        let a = [0xABu8; 32];
        assert_eq!(xor_distance(&a, &a), [0u8; 32]);
    }

    #[test]
    fn test_xor_distance_symmetric() {
        let a = [1u8; 32];
        let b = [7u8; 32];
        assert_eq!(xor_distance(&a, &b), xor_distance(&b, &a));
        assert_eq!(xor_distance(&a, &b), [6u8; 32]);
    }
}
