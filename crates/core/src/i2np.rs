//! I2NP message envelope
//!
//! Every inter-router message is a 16-byte header followed by a payload:
//! `type(1) || msg_id(4) || expiration_ms(8) || length(2) || checksum(1)`,
//! all big-endian, checksum = first byte of SHA-256 over the payload.
//!
//! Messages are built into a buffer with reserved headroom before the
//! logical start so that an endpoint can re-wrap a message as a
//! `TunnelGateway` frame by writing a new header into the headroom instead
//! of copying the payload.

use bytes::{Bytes, BytesMut};
use garlicnet_crypto::hash;
use rand::Rng;

use crate::error::{CoreError, Result};
use crate::types::{now_ms, TunnelId};

/// Envelope header size
pub const I2NP_HEADER_SIZE: usize = 16;

/// Headroom reserved before the logical message start; enough for one
/// TunnelGateway re-wrap (16-byte header + 6-byte gateway prefix)
pub const I2NP_HEADROOM: usize = 28;

/// Largest payload the envelope accepts
pub const I2NP_MAX_PAYLOAD: usize = 62 * 1024;

/// Default envelope lifetime
pub const I2NP_MESSAGE_LIFETIME_MS: u64 = 8_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    DatabaseStore = 1,
    DatabaseLookup = 2,
    DatabaseSearchReply = 3,
    DeliveryStatus = 10,
    Garlic = 11,
    TunnelData = 18,
    TunnelGateway = 19,
    Data = 20,
    VariableTunnelBuild = 23,
    VariableTunnelBuildReply = 24,
    ShortTunnelBuild = 25,
    ShortTunnelBuildReply = 26,
    TunnelTest = 27,
}

impl TryFrom<u8> for MessageType {
    type Error = CoreError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            1 => MessageType::DatabaseStore,
            2 => MessageType::DatabaseLookup,
            3 => MessageType::DatabaseSearchReply,
            10 => MessageType::DeliveryStatus,
            11 => MessageType::Garlic,
            18 => MessageType::TunnelData,
            19 => MessageType::TunnelGateway,
            20 => MessageType::Data,
            23 => MessageType::VariableTunnelBuild,
            24 => MessageType::VariableTunnelBuildReply,
            25 => MessageType::ShortTunnelBuild,
            26 => MessageType::ShortTunnelBuildReply,
            27 => MessageType::TunnelTest,
            other => return Err(CoreError::UnknownMessageType(other)),
        })
    }
}

/// Generate a non-zero random message id
pub fn random_msg_id() -> u32 {
    loop {
        let id: u32 = rand::thread_rng().gen();
        if id != 0 {
            return id;
        }
    }
}

/// An I2NP message owning its buffer with headroom for re-framing.
#[derive(Debug, Clone)]
pub struct I2npMessage {
    buf: BytesMut,
    offset: usize,
}

impl I2npMessage {
    /// Build a message with an explicit expiration.
    pub fn with_expiration(
        msg_type: MessageType,
        msg_id: u32,
        expiration_ms: u64,
        payload: &[u8],
    ) -> Self {
        let mut buf = BytesMut::with_capacity(I2NP_HEADROOM + I2NP_HEADER_SIZE + payload.len());
        buf.resize(I2NP_HEADROOM, 0);
        buf.extend_from_slice(&[msg_type as u8]);
        buf.extend_from_slice(&msg_id.to_be_bytes());
        buf.extend_from_slice(&expiration_ms.to_be_bytes());
        buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(&[hash(payload)[0]]);
        buf.extend_from_slice(payload);
        Self {
            buf,
            offset: I2NP_HEADROOM,
        }
    }

    /// Build a message expiring after the default lifetime.
    pub fn new(msg_type: MessageType, msg_id: u32, payload: &[u8]) -> Self {
        Self::with_expiration(
            msg_type,
            msg_id,
            now_ms() + I2NP_MESSAGE_LIFETIME_MS,
            payload,
        )
    }

    /// Parse and validate a wire buffer.
    ///
    /// Rejects envelopes expired more than one skew window ago, expiring
    /// more than three windows in the future, with a length beyond the
    /// buffer, or with a bad payload checksum.
    pub fn parse(bytes: &[u8], clock_skew_ms: u64) -> Result<Self> {
        if bytes.len() < I2NP_HEADER_SIZE {
            return Err(CoreError::Truncated {
                need: I2NP_HEADER_SIZE,
                got: bytes.len(),
            });
        }
        MessageType::try_from(bytes[0])?;

        let expiration = u64::from_be_bytes(bytes[5..13].try_into().expect("8 bytes"));
        let now = now_ms();
        if expiration + clock_skew_ms < now {
            return Err(CoreError::Expired);
        }
        if expiration > now + 3 * clock_skew_ms {
            return Err(CoreError::FromFuture);
        }

        let payload_len = u16::from_be_bytes(bytes[13..15].try_into().expect("2 bytes")) as usize;
        if I2NP_HEADER_SIZE + payload_len > bytes.len() {
            return Err(CoreError::Truncated {
                need: I2NP_HEADER_SIZE + payload_len,
                got: bytes.len(),
            });
        }
        let payload = &bytes[I2NP_HEADER_SIZE..I2NP_HEADER_SIZE + payload_len];
        if hash(payload)[0] != bytes[15] {
            return Err(CoreError::ChecksumMismatch);
        }

        let mut buf = BytesMut::with_capacity(I2NP_HEADROOM + I2NP_HEADER_SIZE + payload_len);
        buf.resize(I2NP_HEADROOM, 0);
        buf.extend_from_slice(&bytes[..I2NP_HEADER_SIZE + payload_len]);
        Ok(Self {
            buf,
            offset: I2NP_HEADROOM,
        })
    }

    fn header(&self) -> &[u8] {
        &self.buf[self.offset..self.offset + I2NP_HEADER_SIZE]
    }

    pub fn msg_type(&self) -> MessageType {
        MessageType::try_from(self.header()[0]).expect("validated on construction")
    }

    pub fn msg_id(&self) -> u32 {
        u32::from_be_bytes(self.header()[1..5].try_into().expect("4 bytes"))
    }

    pub fn set_msg_id(&mut self, msg_id: u32) {
        let start = self.offset + 1;
        self.buf[start..start + 4].copy_from_slice(&msg_id.to_be_bytes());
    }

    pub fn expiration_ms(&self) -> u64 {
        u64::from_be_bytes(self.header()[5..13].try_into().expect("8 bytes"))
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[self.offset + I2NP_HEADER_SIZE..]
    }

    /// Whole envelope as wire bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[self.offset..]
    }

    /// Envelope length on the wire
    pub fn len(&self) -> usize {
        self.buf.len() - self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Freeze into a cheaply clonable wire buffer for the transport layer.
    pub fn freeze(self) -> Bytes {
        let mut buf = self.buf;
        let _ = buf.split_to(self.offset);
        buf.freeze()
    }

    /// Re-wrap this message as a `TunnelGateway` frame addressed to
    /// `tunnel_id`, writing the new header into the reserved headroom.
    ///
    /// The inner envelope is untouched; no payload bytes move.
    pub fn wrap_gateway(mut self, tunnel_id: TunnelId, msg_id: u32) -> I2npMessage {
        let inner_len = self.len();
        let payload_len = 6 + inner_len;

        // gateway prefix directly before the inner envelope
        let gw = self.offset - 6;
        self.buf[gw..gw + 4].copy_from_slice(&tunnel_id.to_be_bytes());
        self.buf[gw + 4..gw + 6].copy_from_slice(&(inner_len as u16).to_be_bytes());

        let chks = hash(&self.buf[gw..])[0];
        let hdr = gw - I2NP_HEADER_SIZE;
        self.buf[hdr] = MessageType::TunnelGateway as u8;
        self.buf[hdr + 1..hdr + 5].copy_from_slice(&msg_id.to_be_bytes());
        self.buf[hdr + 5..hdr + 13]
            .copy_from_slice(&(now_ms() + I2NP_MESSAGE_LIFETIME_MS).to_be_bytes());
        self.buf[hdr + 13..hdr + 15].copy_from_slice(&(payload_len as u16).to_be_bytes());
        self.buf[hdr + 15] = chks;

        I2npMessage {
            buf: self.buf,
            offset: hdr,
        }
    }
}

/// Parse a `TunnelGateway` payload into `(tunnel_id, inner envelope bytes)`.
pub fn parse_gateway_payload(payload: &[u8]) -> Result<(TunnelId, &[u8])> {
    if payload.len() < 6 {
        return Err(CoreError::Truncated {
            need: 6,
            got: payload.len(),
        });
    }
    let tunnel_id = u32::from_be_bytes(payload[..4].try_into().expect("4 bytes"));
    let len = u16::from_be_bytes(payload[4..6].try_into().expect("2 bytes")) as usize;
    if payload.len() < 6 + len {
        return Err(CoreError::Truncated {
            need: 6 + len,
            got: payload.len(),
        });
    }
    Ok((tunnel_id, &payload[6..6 + len]))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SKEW: u64 = 60_000;

    #[test]
    fn test_build_and_parse_roundtrip() {
        let msg = I2npMessage::new(MessageType::DeliveryStatus, 42, b"status payload");
        let parsed = I2npMessage::parse(msg.as_bytes(), SKEW).unwrap();

        assert_eq!(parsed.msg_type(), MessageType::DeliveryStatus);
        assert_eq!(parsed.msg_id(), 42);
        assert_eq!(parsed.payload(), b"status payload");
    }

    #[test]
    fn test_parse_rejects_expired() {
        let msg =
            I2npMessage::with_expiration(MessageType::Data, 1, now_ms() - 2 * SKEW, b"stale");
        assert!(matches!(
            I2npMessage::parse(msg.as_bytes(), SKEW),
            Err(CoreError::Expired)
        ));
    }

    #[test]
    fn test_parse_rejects_far_future() {
        let msg =
            I2npMessage::with_expiration(MessageType::Data, 1, now_ms() + 4 * SKEW, b"early");
        assert!(matches!(
            I2npMessage::parse(msg.as_bytes(), SKEW),
            Err(CoreError::FromFuture)
        ));
    }

    #[test]
    fn test_parse_rejects_bad_checksum() {
        let msg = I2npMessage::new(MessageType::Data, 1, b"payload");
        let mut bytes = msg.as_bytes().to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(
            I2npMessage::parse(&bytes, SKEW),
            Err(CoreError::ChecksumMismatch)
        ));
    }

    #[test]
    fn test_parse_rejects_truncated() {
        let msg = I2npMessage::new(MessageType::Data, 1, b"payload");
        let bytes = &msg.as_bytes()[..msg.len() - 3];
        assert!(matches!(
            I2npMessage::parse(bytes, SKEW),
            Err(CoreError::Truncated { .. })
        ));
    }

    #[test]
    fn test_gateway_wrap_preserves_inner() {
        let inner = I2npMessage::new(MessageType::DeliveryStatus, 42, b"inner payload");
        let inner_bytes = inner.as_bytes().to_vec();

        let wrapped = inner.wrap_gateway(0xDEADBEEF, 7);
        assert_eq!(wrapped.msg_type(), MessageType::TunnelGateway);
        assert_eq!(wrapped.msg_id(), 7);

        let (tunnel_id, inner_again) = parse_gateway_payload(wrapped.payload()).unwrap();
        assert_eq!(tunnel_id, 0xDEADBEEF);
        assert_eq!(inner_again, &inner_bytes[..]);

        // the re-wrapped envelope itself validates
        let reparsed = I2npMessage::parse(wrapped.as_bytes(), SKEW).unwrap();
        assert_eq!(reparsed.msg_type(), MessageType::TunnelGateway);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut msg = I2npMessage::new(MessageType::Data, 1, b"x").as_bytes().to_vec();
        msg[0] = 99;
        assert!(matches!(
            I2npMessage::parse(&msg, SKEW),
            Err(CoreError::UnknownMessageType(99))
        ));
    }

    #[test]
    fn test_random_msg_id_nonzero() {
        for _ in 0..32 {
            assert_ne!(random_msg_id(), 0);
        }
    }
}
