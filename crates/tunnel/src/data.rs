//! Tunnel data framing
//!
//! Tunnel-data messages are exactly 1024 bytes after the 4-byte tunnel id:
//! `IV(16) || checksum(4) || nonzero padding || 0x00 || fragment records`.
//! The checksum is the first four bytes of SHA-256 over
//! `fragments || IV`. The gateway packs queued message blocks into as few
//! frames as possible, fragmenting messages across frames; the endpoint
//! reassembles fragments (buffering out-of-order arrivals) and dispatches
//! completed messages by their delivery instructions.

use std::collections::{BTreeMap, HashMap};

use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use garlicnet_core::{now_ms, I2npMessage, IdentHash, TunnelId};

use crate::TunnelError;

/// Encrypted portion of a tunnel data message
pub const TUNNEL_DATA_SIZE: usize = 1024;

/// Bytes available for fragment records per frame
pub const TUNNEL_DATA_MAX_PAYLOAD: usize = 1003;

/// Fragments per message: one first fragment plus 6-bit follow-on numbers
pub const MAX_FRAGMENTS: usize = 64;

/// Incomplete messages are swept after the I2NP expiration window
const FRAGMENT_EXPIRATION_MS: u64 = 8_000;

const FOLLOW_ON_HEADER: usize = 7;

/// Where an endpoint should deliver a reassembled message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelDelivery {
    /// Hand to the tunnel owner
    Local,
    /// Wrap as TunnelGateway for (`to`, `tunnel_id`)
    Tunnel { to: IdentHash, tunnel_id: TunnelId },
    /// Send directly to the router `to`
    Router { to: IdentHash },
}

impl TunnelDelivery {
    fn type_bits(&self) -> u8 {
        match self {
            TunnelDelivery::Local => 0,
            TunnelDelivery::Tunnel { .. } => 1,
            TunnelDelivery::Router { .. } => 2,
        }
    }

    fn field_len(&self) -> usize {
        match self {
            TunnelDelivery::Local => 0,
            TunnelDelivery::Tunnel { .. } => 36,
            TunnelDelivery::Router { .. } => 32,
        }
    }
}

/// One queued message with its delivery instructions
#[derive(Debug, Clone)]
pub struct TunnelMessageBlock {
    pub delivery: TunnelDelivery,
    pub msg: I2npMessage,
}

/// Packs message blocks into 1024-byte tunnel-data frames.
#[derive(Default)]
pub struct TunnelGatewayBuffer {
    queue: Vec<TunnelMessageBlock>,
}

impl TunnelGatewayBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, block: TunnelMessageBlock) {
        self.queue.push(block);
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drain the queue into finished frames, preserving submission order.
    pub fn flush(&mut self) -> Vec<[u8; TUNNEL_DATA_SIZE]> {
        let blocks = std::mem::take(&mut self.queue);
        let mut frames = Vec::new();
        let mut current: Vec<u8> = Vec::with_capacity(TUNNEL_DATA_MAX_PAYLOAD);

        for block in blocks {
            let data = block.msg.as_bytes();
            let header_len = 1 + block.delivery.field_len() + 2;
            let fragmented_header_len = header_len + 4;

            if header_len + data.len() <= TUNNEL_DATA_MAX_PAYLOAD - current.len() {
                // fits whole in the current frame
                write_first_fragment(&mut current, &block.delivery, false, 0, data);
                continue;
            }

            // needs its own space: flush if the current frame is too full to
            // hold a useful first fragment
            if TUNNEL_DATA_MAX_PAYLOAD - current.len() < fragmented_header_len + 16 {
                frames.push(finish_frame(&current));
                current.clear();
            }

            let first_len = (TUNNEL_DATA_MAX_PAYLOAD - current.len() - fragmented_header_len)
                .min(data.len());
            if first_len == data.len() {
                write_first_fragment(&mut current, &block.delivery, false, 0, data);
                continue;
            }

            let follow_capacity = TUNNEL_DATA_MAX_PAYLOAD - FOLLOW_ON_HEADER;
            let follow_count = (data.len() - first_len).div_ceil(follow_capacity);
            if follow_count + 1 > MAX_FRAGMENTS {
                warn!("message of {} bytes exceeds the fragment limit, dropped", data.len());
                continue;
            }

            let msg_id = block.msg.msg_id();
            write_first_fragment(&mut current, &block.delivery, true, msg_id, &data[..first_len]);
            frames.push(finish_frame(&current));
            current.clear();

            let mut offset = first_len;
            let mut fragment_num = 1u8;
            while offset < data.len() {
                let chunk = (data.len() - offset).min(follow_capacity);
                let is_last = offset + chunk == data.len();
                write_follow_on(
                    &mut current,
                    fragment_num,
                    is_last,
                    msg_id,
                    &data[offset..offset + chunk],
                );
                offset += chunk;
                fragment_num += 1;
                if !is_last {
                    frames.push(finish_frame(&current));
                    current.clear();
                }
            }
        }

        if !current.is_empty() {
            frames.push(finish_frame(&current));
        }
        frames
    }
}

fn write_first_fragment(
    out: &mut Vec<u8>,
    delivery: &TunnelDelivery,
    is_fragmented: bool,
    msg_id: u32,
    payload: &[u8],
) {
    let mut flag = delivery.type_bits() << 5;
    if is_fragmented {
        flag |= 0b0000_1000;
    }
    out.push(flag);
    match delivery {
        TunnelDelivery::Local => {}
        TunnelDelivery::Tunnel { to, tunnel_id } => {
            out.extend_from_slice(&tunnel_id.to_be_bytes());
            out.extend_from_slice(to);
        }
        TunnelDelivery::Router { to } => out.extend_from_slice(to),
    }
    if is_fragmented {
        out.extend_from_slice(&msg_id.to_be_bytes());
    }
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
}

fn write_follow_on(out: &mut Vec<u8>, fragment_num: u8, is_last: bool, msg_id: u32, payload: &[u8]) {
    let mut flag = 0b1000_0000 | (fragment_num << 1);
    if is_last {
        flag |= 1;
    }
    out.push(flag);
    out.extend_from_slice(&msg_id.to_be_bytes());
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
}

/// Lay out a finished frame: IV, checksum, non-zero padding, delimiter,
/// fragment records.
fn finish_frame(fragments: &[u8]) -> [u8; TUNNEL_DATA_SIZE] {
    let mut rng = rand::thread_rng();
    let mut frame = [0u8; TUNNEL_DATA_SIZE];
    rng.fill(&mut frame[..16]);

    let mut hasher = Sha256::new();
    hasher.update(fragments);
    hasher.update(&frame[..16]);
    let digest = hasher.finalize();
    frame[16..20].copy_from_slice(&digest[..4]);

    let padding_len = TUNNEL_DATA_MAX_PAYLOAD - fragments.len();
    for byte in frame[20..20 + padding_len].iter_mut() {
        *byte = rng.gen_range(1..=255);
    }
    frame[20 + padding_len] = 0;
    frame[21 + padding_len..].copy_from_slice(fragments);
    frame
}

struct PendingMessage {
    delivery: TunnelDelivery,
    /// First fragment payload
    first: Vec<u8>,
    /// Follow-on fragments by number
    follow_ons: BTreeMap<u8, Vec<u8>>,
    last_fragment: Option<u8>,
    received_ms: u64,
}

impl PendingMessage {
    fn is_complete(&self) -> bool {
        let Some(last) = self.last_fragment else {
            return false;
        };
        (1..=last).all(|n| self.follow_ons.contains_key(&n))
    }

    fn assemble(self) -> Vec<u8> {
        let mut out = self.first;
        for (_, chunk) in self.follow_ons {
            out.extend_from_slice(&chunk);
        }
        out
    }
}

/// Fragment reassembly at a tunnel endpoint.
#[derive(Default)]
pub struct TunnelEndpointRx {
    pending: HashMap<u32, PendingMessage>,
    clock_skew_ms: u64,
}

impl TunnelEndpointRx {
    pub fn new(clock_skew_ms: u64) -> Self {
        Self {
            pending: HashMap::new(),
            clock_skew_ms,
        }
    }

    /// Parse one decrypted frame and return any completed messages.
    pub fn process_frame(
        &mut self,
        frame: &[u8; TUNNEL_DATA_SIZE],
    ) -> Result<Vec<TunnelMessageBlock>, TunnelError> {
        let iv = &frame[..16];
        let checksum = &frame[16..20];
        let zero = frame[20..]
            .iter()
            .position(|b| *b == 0)
            .ok_or(TunnelError::MalformedFrame("no delimiter"))?;
        let fragments = &frame[20 + zero + 1..];

        let mut hasher = Sha256::new();
        hasher.update(fragments);
        hasher.update(iv);
        if hasher.finalize()[..4] != *checksum {
            return Err(TunnelError::MalformedFrame("checksum"));
        }

        let mut completed = Vec::new();
        let mut off = 0usize;
        while off < fragments.len() {
            let flag = fragments[off];
            off += 1;
            if flag & 0b1000_0000 == 0 {
                // first fragment
                let delivery = match (flag >> 5) & 0x03 {
                    0 => TunnelDelivery::Local,
                    1 => {
                        let tunnel_id = read_u32(fragments, &mut off)?;
                        let to = read_hash(fragments, &mut off)?;
                        TunnelDelivery::Tunnel { to, tunnel_id }
                    }
                    2 => TunnelDelivery::Router {
                        to: read_hash(fragments, &mut off)?,
                    },
                    _ => return Err(TunnelError::MalformedFrame("delivery type")),
                };
                let is_fragmented = flag & 0b0000_1000 != 0;
                let msg_id = if is_fragmented {
                    read_u32(fragments, &mut off)?
                } else {
                    0
                };
                let len = read_u16(fragments, &mut off)? as usize;
                let payload = read_slice(fragments, &mut off, len)?;

                if is_fragmented {
                    let entry = self.pending.entry(msg_id).or_insert_with(|| PendingMessage {
                        delivery: delivery.clone(),
                        first: Vec::new(),
                        follow_ons: BTreeMap::new(),
                        last_fragment: None,
                        received_ms: now_ms(),
                    });
                    entry.delivery = delivery;
                    entry.first = payload.to_vec();
                    if let Some(block) = self.try_complete(msg_id)? {
                        completed.push(block);
                    }
                } else if let Some(block) = self.make_block(delivery, payload)? {
                    completed.push(block);
                }
            } else {
                // follow-on fragment
                let fragment_num = (flag >> 1) & 0x3F;
                let is_last = flag & 1 != 0;
                let msg_id = read_u32(fragments, &mut off)?;
                let len = read_u16(fragments, &mut off)? as usize;
                let payload = read_slice(fragments, &mut off, len)?;

                let entry = self.pending.entry(msg_id).or_insert_with(|| PendingMessage {
                    delivery: TunnelDelivery::Local,
                    first: Vec::new(),
                    follow_ons: BTreeMap::new(),
                    last_fragment: None,
                    received_ms: now_ms(),
                });
                entry.follow_ons.insert(fragment_num, payload.to_vec());
                if is_last {
                    entry.last_fragment = Some(fragment_num);
                }
                if let Some(block) = self.try_complete(msg_id)? {
                    completed.push(block);
                }
            }
        }
        Ok(completed)
    }

    fn try_complete(&mut self, msg_id: u32) -> Result<Option<TunnelMessageBlock>, TunnelError> {
        let ready = self
            .pending
            .get(&msg_id)
            .map(|p| p.is_complete() && !p.first.is_empty())
            .unwrap_or(false);
        if !ready {
            return Ok(None);
        }
        let pending = self.pending.remove(&msg_id).expect("checked above");
        let delivery = pending.delivery.clone();
        let bytes = pending.assemble();
        self.make_block(delivery, &bytes)
    }

    fn make_block(
        &self,
        delivery: TunnelDelivery,
        bytes: &[u8],
    ) -> Result<Option<TunnelMessageBlock>, TunnelError> {
        match I2npMessage::parse(bytes, self.clock_skew_ms.max(8_000)) {
            Ok(msg) => Ok(Some(TunnelMessageBlock { delivery, msg })),
            Err(e) => {
                debug!("reassembled message rejected: {}", e);
                Ok(None)
            }
        }
    }

    /// Drop incomplete messages older than the expiration window.
    pub fn sweep(&mut self) {
        let now = now_ms();
        self.pending
            .retain(|_, p| p.received_ms + FRAGMENT_EXPIRATION_MS > now);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

fn read_u32(buf: &[u8], off: &mut usize) -> Result<u32, TunnelError> {
    let slice = read_slice(buf, off, 4)?;
    Ok(u32::from_be_bytes(slice.try_into().expect("4 bytes")))
}

fn read_u16(buf: &[u8], off: &mut usize) -> Result<u16, TunnelError> {
    let slice = read_slice(buf, off, 2)?;
    Ok(u16::from_be_bytes(slice.try_into().expect("2 bytes")))
}

fn read_hash(buf: &[u8], off: &mut usize) -> Result<IdentHash, TunnelError> {
    let slice = read_slice(buf, off, 32)?;
    Ok(slice.try_into().expect("32 bytes"))
}

fn read_slice<'a>(buf: &'a [u8], off: &mut usize, len: usize) -> Result<&'a [u8], TunnelError> {
    if *off + len > buf.len() {
        return Err(TunnelError::MalformedFrame("truncated fragment"));
    }
    let slice = &buf[*off..*off + len];
    *off += len;
    Ok(slice)
}

#[cfg(test)]
mod tests {
    use super::*;
    use garlicnet_core::MessageType;

    fn block(delivery: TunnelDelivery, payload: &[u8]) -> TunnelMessageBlock {
        TunnelMessageBlock {
            delivery,
            msg: I2npMessage::new(MessageType::Data, 99, payload),
        }
    }

    #[test]
    fn test_single_small_message_roundtrip() {
        let mut gateway = TunnelGatewayBuffer::new();
        gateway.put(block(TunnelDelivery::Local, b"hello tunnel"));
        let frames = gateway.flush();
        assert_eq!(frames.len(), 1);

        let mut endpoint = TunnelEndpointRx::new(60_000);
        let out = endpoint.process_frame(&frames[0]).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].delivery, TunnelDelivery::Local);
        assert_eq!(out[0].msg.payload(), b"hello tunnel");
    }

    #[test]
    fn test_padding_is_nonzero_before_delimiter() {
        let frame = finish_frame(b"abc");
        let padding = &frame[20..20 + TUNNEL_DATA_MAX_PAYLOAD - 3];
        assert!(padding.iter().all(|b| *b != 0));
        assert_eq!(frame[20 + padding.len()], 0);
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let mut gateway = TunnelGatewayBuffer::new();
        gateway.put(block(TunnelDelivery::Local, b"payload"));
        let mut frames = gateway.flush();
        frames[0][1023] ^= 0xFF;

        let mut endpoint = TunnelEndpointRx::new(60_000);
        assert!(endpoint.process_frame(&frames[0]).is_err());
    }

    #[test]
    fn test_large_message_fragments_and_reassembles() {
        let payload: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        let mut gateway = TunnelGatewayBuffer::new();
        gateway.put(block(
            TunnelDelivery::Router { to: [7u8; 32] },
            &payload,
        ));
        let frames = gateway.flush();
        assert!(frames.len() > 1);

        let mut endpoint = TunnelEndpointRx::new(60_000);
        let mut out = Vec::new();
        for frame in &frames {
            out.extend(endpoint.process_frame(frame).unwrap());
        }
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].msg.payload(), &payload[..]);
        assert_eq!(out[0].delivery, TunnelDelivery::Router { to: [7u8; 32] });
        assert_eq!(endpoint.pending_count(), 0);
    }

    #[test]
    fn test_out_of_order_fragments() {
        // four frames delivered [first, 2, 1, 3]; must assemble exactly once
        // with bytes in fragment order
        let payload: Vec<u8> = (0..3500u32).map(|i| (i % 241) as u8).collect();
        let mut gateway = TunnelGatewayBuffer::new();
        gateway.put(block(TunnelDelivery::Local, &payload));
        let frames = gateway.flush();
        assert_eq!(frames.len(), 4);

        let order = [0usize, 2, 1, 3];
        let mut endpoint = TunnelEndpointRx::new(60_000);
        let mut out = Vec::new();
        for &i in &order {
            out.extend(endpoint.process_frame(&frames[i]).unwrap());
        }
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].msg.payload(), &payload[..]);
    }

    #[test]
    fn test_multiple_small_messages_share_frame() {
        let mut gateway = TunnelGatewayBuffer::new();
        gateway.put(block(TunnelDelivery::Local, b"one"));
        gateway.put(block(TunnelDelivery::Local, b"two"));
        gateway.put(block(
            TunnelDelivery::Tunnel {
                to: [3u8; 32],
                tunnel_id: 7,
            },
            b"three",
        ));
        let frames = gateway.flush();
        assert_eq!(frames.len(), 1);

        let mut endpoint = TunnelEndpointRx::new(60_000);
        let out = endpoint.process_frame(&frames[0]).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].msg.payload(), b"one");
        assert_eq!(out[2].delivery, TunnelDelivery::Tunnel { to: [3u8; 32], tunnel_id: 7 });
    }

    #[test]
    fn test_sweep_drops_stale_incomplete() {
        let payload = vec![5u8; 3000];
        let mut gateway = TunnelGatewayBuffer::new();
        gateway.put(block(TunnelDelivery::Local, &payload));
        let frames = gateway.flush();

        let mut endpoint = TunnelEndpointRx::new(60_000);
        endpoint.process_frame(&frames[0]).unwrap();
        assert_eq!(endpoint.pending_count(), 1);

        // force-expire
        for pending in endpoint.pending.values_mut() {
            pending.received_ms -= FRAGMENT_EXPIRATION_MS + 1;
        }
        endpoint.sweep();
        assert_eq!(endpoint.pending_count(), 0);
    }

    #[test]
    fn test_oversize_message_dropped_at_gateway() {
        // 64 fragments * ~996 bytes each is the ceiling; far beyond it
        let payload = vec![1u8; 70_000];
        let mut gateway = TunnelGatewayBuffer::new();
        gateway.put(block(TunnelDelivery::Local, &payload));
        // oversize payloads exceed the I2NP envelope too; the frames that
        // do come out must never encode more than 64 fragments
        let frames = gateway.flush();
        assert!(frames.len() <= MAX_FRAGMENTS);
    }
}
