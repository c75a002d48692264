//! Short tunnel build protocol
//!
//! A build message is `num_records(1) || ephemeral_pub(32) || records`,
//! each record exactly 218 bytes. A hop finds its record by 16-byte ident
//! prefix, decrypts it with a Noise-N key derived from the shared ephemeral
//! and its static key, writes its one-byte verdict back into the slot under
//! its reply key, and re-encrypts every other slot with raw ChaCha20 keyed
//! by the same reply key (nonce = slot index). The requester pre-applies
//! the inverse of those passes when wrapping, and unwinds them again when
//! the processed record set comes back as the build reply.

use rand::{Rng, RngCore};

use garlicnet_core::{IdentHash, PublicKey, TunnelId};
use garlicnet_crypto::{
    aead_decrypt, aead_encrypt, chacha20_xor, hmac_step, nonce_from_index, noise::NOISE_N_PROTOCOL,
    EncryptionKeypair, NoiseState,
};

use crate::TunnelError;

/// Encrypted record size on the wire
pub const SHORT_RECORD_SIZE: usize = 218;

/// Cleartext record size
pub const SHORT_RECORD_CLEARTEXT_SIZE: usize = 172;

/// AEAD ciphertext of a request record
const REQUEST_CT_SIZE: usize = SHORT_RECORD_CLEARTEXT_SIZE + 16;

/// Random trailer after the request ciphertext
const RECORD_TRAILER_SIZE: usize = SHORT_RECORD_SIZE - 16 - REQUEST_CT_SIZE;

/// Reply record plaintext (fills the whole slot once the MAC is added)
const REPLY_CLEARTEXT_SIZE: usize = SHORT_RECORD_SIZE - 16;

/// Most records a build message may carry
pub const MAX_NUM_RECORDS: usize = 8;

/// Fewest slots a build message carries, real hops or not
pub const STANDARD_NUM_RECORDS: usize = 4;

/// Accepted skew of `request_time_hours`, in hours
const REQUEST_TIME_SKEW_HOURS: u32 = 1;

/// Build verdicts
pub const BUILD_ACCEPT: u8 = 0;
pub const BUILD_REJECT_BANDWIDTH: u8 = 30;

const FLAG_INBOUND_GATEWAY: u8 = 0b0000_0001;
const FLAG_OUTBOUND_ENDPOINT: u8 = 0b0000_0010;

/// Cleartext build record for one hop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequestRecord {
    pub receive_tunnel_id: TunnelId,
    pub our_ident_prefix: [u8; 16],
    pub next_tunnel_id: TunnelId,
    pub next_ident: IdentHash,
    pub layer_key: [u8; 32],
    pub iv_key: [u8; 32],
    pub is_inbound_gateway: bool,
    pub is_outbound_endpoint: bool,
    pub request_time_hours: u32,
    pub send_msg_id: u32,
    pub reply_msg_id: u32,
    pub layer_encryption_type: u8,
}

impl BuildRequestRecord {
    pub fn to_cleartext(&self) -> [u8; SHORT_RECORD_CLEARTEXT_SIZE] {
        let mut out = [0u8; SHORT_RECORD_CLEARTEXT_SIZE];
        out[0..4].copy_from_slice(&self.receive_tunnel_id.to_be_bytes());
        out[4..20].copy_from_slice(&self.our_ident_prefix);
        out[20..24].copy_from_slice(&self.next_tunnel_id.to_be_bytes());
        out[24..56].copy_from_slice(&self.next_ident);
        out[56..88].copy_from_slice(&self.layer_key);
        out[88..120].copy_from_slice(&self.iv_key);
        let mut flag = 0u8;
        if self.is_inbound_gateway {
            flag |= FLAG_INBOUND_GATEWAY;
        }
        if self.is_outbound_endpoint {
            flag |= FLAG_OUTBOUND_ENDPOINT;
        }
        out[120] = flag;
        out[121..125].copy_from_slice(&self.request_time_hours.to_be_bytes());
        out[125..129].copy_from_slice(&self.send_msg_id.to_be_bytes());
        out[129..133].copy_from_slice(&self.reply_msg_id.to_be_bytes());
        out[133] = self.layer_encryption_type;
        rand::thread_rng().fill_bytes(&mut out[134..]);
        out
    }

    pub fn from_cleartext(buf: &[u8; SHORT_RECORD_CLEARTEXT_SIZE]) -> Self {
        Self {
            receive_tunnel_id: u32::from_be_bytes(buf[0..4].try_into().expect("4 bytes")),
            our_ident_prefix: buf[4..20].try_into().expect("16 bytes"),
            next_tunnel_id: u32::from_be_bytes(buf[20..24].try_into().expect("4 bytes")),
            next_ident: buf[24..56].try_into().expect("32 bytes"),
            layer_key: buf[56..88].try_into().expect("32 bytes"),
            iv_key: buf[88..120].try_into().expect("32 bytes"),
            is_inbound_gateway: buf[120] & FLAG_INBOUND_GATEWAY != 0,
            is_outbound_endpoint: buf[120] & FLAG_OUTBOUND_ENDPOINT != 0,
            request_time_hours: u32::from_be_bytes(buf[121..125].try_into().expect("4 bytes")),
            send_msg_id: u32::from_be_bytes(buf[125..129].try_into().expect("4 bytes")),
            reply_msg_id: u32::from_be_bytes(buf[129..133].try_into().expect("4 bytes")),
            layer_encryption_type: buf[133],
        }
    }

    pub fn request_time_in_window(&self, now_ms: u64) -> bool {
        let now_hours = (now_ms / 3_600_000) as u32;
        self.request_time_hours.abs_diff(now_hours) <= REQUEST_TIME_SKEW_HOURS
    }
}

/// Per-hop keys both sides derive from the message ephemeral and the hop's
/// static key.
pub struct HopCrypto {
    /// AEAD key for the request record
    pub record_key: [u8; 32],
    /// Associated data for the request record
    pub record_ad: [u8; 32],
    /// Key for the reply record and the ChaCha20 passes over other slots
    pub reply_key: [u8; 32],
}

/// Derive the per-hop build keys. Requester calls this with each hop's
/// public static key; a hop calls it with its own keypair via
/// [`hop_crypto_responder`].
pub fn hop_crypto_requester(ephemeral: &EncryptionKeypair, hop_static: &PublicKey) -> HopCrypto {
    let shared = ephemeral.diffie_hellman(hop_static);
    derive_hop_crypto(hop_static, &ephemeral.public_key_bytes(), &shared)
}

/// Responder-side variant of [`hop_crypto_requester`].
pub fn hop_crypto_responder(our_static: &EncryptionKeypair, ephemeral_pub: &PublicKey) -> HopCrypto {
    let shared = our_static.diffie_hellman(ephemeral_pub);
    derive_hop_crypto(&our_static.public_key_bytes(), ephemeral_pub, &shared)
}

fn derive_hop_crypto(
    hop_static: &PublicKey,
    ephemeral_pub: &PublicKey,
    shared: &[u8; 32],
) -> HopCrypto {
    let mut state = NoiseState::new(NOISE_N_PROTOCOL);
    state.mix_hash(hop_static);
    state.mix_hash(ephemeral_pub);
    let record_key = state.mix_key(shared);
    HopCrypto {
        record_key,
        record_ad: state.h(),
        reply_key: hmac_step(&state.ck(), b"SMTunnelReplyKey"),
    }
}

/// One hop of a build request being assembled
pub struct BuildHop {
    pub ident: IdentHash,
    pub static_key: PublicKey,
    pub record: BuildRequestRecord,
}

/// Assembled build message plus the requester-side state needed to read
/// the reply.
pub struct BuildRequest {
    /// `num_records || ephemeral_pub || records` payload
    pub payload: Vec<u8>,
    /// Slot index of each hop, in hop order
    pub slots: Vec<usize>,
    /// Reply key of each hop, in hop order
    pub reply_keys: Vec<[u8; 32]>,
    pub reply_msg_id: u32,
}

/// Assemble a short build message for the given hops.
///
/// Hops are in processing order: the first entry is the router the message
/// is sent to.
pub fn create_build_request(hops: &[BuildHop], reply_msg_id: u32) -> BuildRequest {
    let num_records = hops.len().clamp(STANDARD_NUM_RECORDS, MAX_NUM_RECORDS);
    let mut rng = rand::thread_rng();

    // random slot assignment
    let mut slot_order: Vec<usize> = (0..num_records).collect();
    for i in (1..slot_order.len()).rev() {
        slot_order.swap(i, rng.gen_range(0..=i));
    }
    let slots: Vec<usize> = slot_order[..hops.len()].to_vec();

    let ephemeral = EncryptionKeypair::generate();
    let mut records = vec![0u8; num_records * SHORT_RECORD_SIZE];
    rng.fill_bytes(&mut records);

    let mut reply_keys = Vec::with_capacity(hops.len());
    for (hop, &slot) in hops.iter().zip(&slots) {
        let crypto = hop_crypto_requester(&ephemeral, &hop.static_key);
        let ct = aead_encrypt(
            &crypto.record_key,
            &nonce_from_index(0),
            &crypto.record_ad,
            &hop.record.to_cleartext(),
        )
        .expect("aead encrypt");

        let base = slot * SHORT_RECORD_SIZE;
        records[base..base + 16].copy_from_slice(&hop.ident[..16]);
        records[base + 16..base + 16 + REQUEST_CT_SIZE].copy_from_slice(&ct);
        rng.fill_bytes(&mut records[base + 16 + REQUEST_CT_SIZE..base + SHORT_RECORD_SIZE]);
        reply_keys.push(crypto.reply_key);
    }

    // onion wrap backwards: pre-apply each hop's forward ChaCha20 pass to
    // the slots of the hops after it, so those arrive cleanly
    for (i, reply_key) in reply_keys.iter().enumerate().rev() {
        for &slot in &slots[i + 1..] {
            let base = slot * SHORT_RECORD_SIZE;
            chacha20_xor(
                reply_key,
                &nonce_from_index(slot as u64),
                &mut records[base..base + SHORT_RECORD_SIZE],
            );
        }
    }

    let mut payload = Vec::with_capacity(33 + records.len());
    payload.push(num_records as u8);
    payload.extend_from_slice(&ephemeral.public_key_bytes());
    payload.extend_from_slice(&records);

    BuildRequest {
        payload,
        slots,
        reply_keys,
        reply_msg_id,
    }
}

/// A build message as seen by a responding hop
pub struct IncomingBuild {
    pub ephemeral_pub: PublicKey,
    pub records: Vec<u8>,
    pub num_records: usize,
}

impl IncomingBuild {
    pub fn parse(payload: &[u8]) -> Result<Self, TunnelError> {
        if payload.len() < 33 {
            return Err(TunnelError::MalformedBuild("short payload"));
        }
        let num_records = payload[0] as usize;
        if num_records == 0 || num_records > MAX_NUM_RECORDS {
            return Err(TunnelError::MalformedBuild("bad record count"));
        }
        if payload.len() != 33 + num_records * SHORT_RECORD_SIZE {
            return Err(TunnelError::MalformedBuild("bad payload length"));
        }
        Ok(Self {
            ephemeral_pub: payload[1..33].try_into().expect("32 bytes"),
            records: payload[33..].to_vec(),
            num_records,
        })
    }

    /// Locate our record by ident prefix and decrypt it.
    pub fn find_our_record(
        &self,
        our_ident: &IdentHash,
        our_static: &EncryptionKeypair,
    ) -> Option<(usize, BuildRequestRecord, HopCrypto)> {
        for slot in 0..self.num_records {
            let base = slot * SHORT_RECORD_SIZE;
            if self.records[base..base + 16] != our_ident[..16] {
                continue;
            }
            let crypto = hop_crypto_responder(our_static, &self.ephemeral_pub);
            let ct = &self.records[base + 16..base + 16 + REQUEST_CT_SIZE];
            if let Ok(pt) = aead_decrypt(
                &crypto.record_key,
                &nonce_from_index(0),
                &crypto.record_ad,
                ct,
            ) {
                let cleartext: [u8; SHORT_RECORD_CLEARTEXT_SIZE] =
                    pt.as_slice().try_into().expect("fixed cleartext size");
                return Some((slot, BuildRequestRecord::from_cleartext(&cleartext), crypto));
            }
        }
        None
    }

    /// Write our verdict into our slot and re-encrypt every other slot,
    /// leaving the payload ready to forward.
    pub fn write_reply(&mut self, our_slot: usize, reply_key: &[u8; 32], verdict: u8) {
        let mut reply = [0u8; REPLY_CLEARTEXT_SIZE];
        rand::thread_rng().fill_bytes(&mut reply);
        reply[0] = verdict;
        let ct = aead_encrypt(reply_key, &nonce_from_index(our_slot as u64), b"", &reply)
            .expect("aead encrypt");

        let base = our_slot * SHORT_RECORD_SIZE;
        self.records[base..base + SHORT_RECORD_SIZE].copy_from_slice(&ct);

        for slot in 0..self.num_records {
            if slot == our_slot {
                continue;
            }
            let other = slot * SHORT_RECORD_SIZE;
            chacha20_xor(
                reply_key,
                &nonce_from_index(slot as u64),
                &mut self.records[other..other + SHORT_RECORD_SIZE],
            );
        }
    }

    /// Re-serialize for forwarding to the next hop.
    pub fn to_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(33 + self.records.len());
        payload.push(self.num_records as u8);
        payload.extend_from_slice(&self.ephemeral_pub);
        payload.extend_from_slice(&self.records);
        payload
    }
}

/// Per-hop verdicts pulled out of a build reply. In hop order.
pub fn parse_build_reply(
    payload: &[u8],
    request: &BuildRequest,
) -> Result<Vec<u8>, TunnelError> {
    let incoming = IncomingBuild::parse(payload)?;
    let mut records = incoming.records;

    let mut verdicts = vec![0u8; request.slots.len()];
    // unwind from the last hop: its slot carries no later ChaCha20 passes
    for (i, reply_key) in request.reply_keys.iter().enumerate().rev() {
        let slot = request.slots[i];
        let base = slot * SHORT_RECORD_SIZE;
        let pt = aead_decrypt(
            reply_key,
            &nonce_from_index(slot as u64),
            b"",
            &records[base..base + SHORT_RECORD_SIZE],
        )
        .map_err(|_| TunnelError::MalformedBuild("reply record"))?;
        verdicts[i] = pt[0];

        // remove this hop's pass from every earlier slot
        for &earlier in &request.slots[..i] {
            let other = earlier * SHORT_RECORD_SIZE;
            chacha20_xor(
                reply_key,
                &nonce_from_index(earlier as u64),
                &mut records[other..other + SHORT_RECORD_SIZE],
            );
        }
    }
    Ok(verdicts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use garlicnet_core::now_ms;

    fn make_record(prefix: u8, endpoint: bool) -> BuildRequestRecord {
        BuildRequestRecord {
            receive_tunnel_id: 1000 + prefix as u32,
            our_ident_prefix: [prefix; 16],
            next_tunnel_id: 2000 + prefix as u32,
            next_ident: [prefix + 1; 32],
            layer_key: [prefix + 2; 32],
            iv_key: [prefix + 3; 32],
            is_inbound_gateway: false,
            is_outbound_endpoint: endpoint,
            request_time_hours: (now_ms() / 3_600_000) as u32,
            send_msg_id: 77,
            reply_msg_id: 88,
            layer_encryption_type: 0,
        }
    }

    struct SimHop {
        ident: IdentHash,
        keys: EncryptionKeypair,
    }

    fn sim_hops(n: usize) -> Vec<SimHop> {
        (0..n)
            .map(|i| SimHop {
                ident: [(i + 1) as u8 * 10; 32],
                keys: EncryptionKeypair::generate(),
            })
            .collect()
    }

    fn build_for(hops: &[SimHop]) -> (BuildRequest, Vec<BuildRequestRecord>) {
        let records: Vec<BuildRequestRecord> = hops
            .iter()
            .enumerate()
            .map(|(i, _)| make_record(i as u8, i == hops.len() - 1))
            .collect();
        let build_hops: Vec<BuildHop> = hops
            .iter()
            .zip(&records)
            .map(|(hop, record)| BuildHop {
                ident: hop.ident,
                static_key: hop.keys.public_key_bytes(),
                record: record.clone(),
            })
            .collect();
        (create_build_request(&build_hops, 88), records)
    }

    #[test]
    fn test_cleartext_roundtrip() {
        let record = make_record(5, true);
        let restored = BuildRequestRecord::from_cleartext(&record.to_cleartext());
        assert_eq!(restored, record);
    }

    #[test]
    fn test_request_time_window() {
        let mut record = make_record(1, false);
        assert!(record.request_time_in_window(now_ms()));
        record.request_time_hours -= 2;
        assert!(!record.request_time_in_window(now_ms()));
    }

    #[test]
    fn test_three_hop_build_and_reply() {
        let hops = sim_hops(3);
        let (request, originals) = build_for(&hops);
        assert_eq!(request.payload.len(), 33 + 4 * SHORT_RECORD_SIZE);

        // walk the message through each hop
        let mut incoming = IncomingBuild::parse(&request.payload).unwrap();
        for (i, hop) in hops.iter().enumerate() {
            let (slot, record, crypto) = incoming
                .find_our_record(&hop.ident, &hop.keys)
                .unwrap_or_else(|| panic!("hop {} record not found", i));
            assert_eq!(slot, request.slots[i]);
            assert_eq!(record, originals[i]);
            assert!(record.request_time_in_window(now_ms()));
            incoming.write_reply(slot, &crypto.reply_key, BUILD_ACCEPT);
        }

        let verdicts = parse_build_reply(&incoming.to_payload(), &request).unwrap();
        assert_eq!(verdicts, vec![BUILD_ACCEPT; 3]);
    }

    #[test]
    fn test_reject_verdict_visible() {
        let hops = sim_hops(2);
        let (request, _) = build_for(&hops);

        let mut incoming = IncomingBuild::parse(&request.payload).unwrap();
        let (slot0, _, crypto0) = incoming.find_our_record(&hops[0].ident, &hops[0].keys).unwrap();
        incoming.write_reply(slot0, &crypto0.reply_key, BUILD_ACCEPT);
        let (slot1, _, crypto1) = incoming.find_our_record(&hops[1].ident, &hops[1].keys).unwrap();
        incoming.write_reply(slot1, &crypto1.reply_key, BUILD_REJECT_BANDWIDTH);

        let verdicts = parse_build_reply(&incoming.to_payload(), &request).unwrap();
        assert_eq!(verdicts, vec![BUILD_ACCEPT, BUILD_REJECT_BANDWIDTH]);
    }

    #[test]
    fn test_wrong_hop_cannot_find_record() {
        let hops = sim_hops(2);
        let (request, _) = build_for(&hops);
        let incoming = IncomingBuild::parse(&request.payload).unwrap();

        let stranger = EncryptionKeypair::generate();
        // right prefix, wrong static key
        assert!(incoming.find_our_record(&hops[0].ident, &stranger).is_none());
        // unknown ident
        assert!(incoming.find_our_record(&[0xEE; 32], &hops[0].keys).is_none());
    }

    #[test]
    fn test_max_records_enforced() {
        assert!(IncomingBuild::parse(&[9u8; 33]).is_err());
        let mut payload = vec![0u8; 33 + 9 * SHORT_RECORD_SIZE];
        payload[0] = 9;
        assert!(IncomingBuild::parse(&payload).is_err());
    }

    #[test]
    fn test_eight_hop_build() {
        let hops = sim_hops(8);
        let (request, _) = build_for(&hops);
        let mut incoming = IncomingBuild::parse(&request.payload).unwrap();
        for hop in &hops {
            let (slot, _, crypto) = incoming.find_our_record(&hop.ident, &hop.keys).unwrap();
            incoming.write_reply(slot, &crypto.reply_key, BUILD_ACCEPT);
        }
        let verdicts = parse_build_reply(&incoming.to_payload(), &request).unwrap();
        assert_eq!(verdicts, vec![BUILD_ACCEPT; 8]);
    }
}
