//! NetDb wire messages
//!
//! Payload codecs for `DatabaseStore`, `DatabaseLookup` and
//! `DatabaseSearchReply`. RouterInfo payloads travel gzip-compressed;
//! lease sets travel as-is (they are small and already high-entropy).

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use garlicnet_core::{CoreError, IdentHash, TunnelId};

use crate::netdb::NetDbError;
use crate::Result;

/// What a lookup is asking for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupKind {
    /// Router or lease set, whichever is present
    Any,
    LeaseSet,
    RouterInfo,
    /// Peer-discovery lookup; reply always lists closer floodfills
    Exploration,
}

impl LookupKind {
    fn to_bits(self) -> u8 {
        match self {
            LookupKind::Any => 0,
            LookupKind::LeaseSet => 1,
            LookupKind::RouterInfo => 2,
            LookupKind::Exploration => 3,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            1 => LookupKind::LeaseSet,
            2 => LookupKind::RouterInfo,
            3 => LookupKind::Exploration,
            _ => LookupKind::Any,
        }
    }
}

const FLAG_TUNNEL_REPLY: u8 = 0x01;
const FLAG_ENCRYPTED_REPLY: u8 = 0x02;

/// Store type byte: 0 is a RouterInfo, anything else a lease set variant.
pub const STORE_TYPE_ROUTER_INFO: u8 = 0;
pub const STORE_TYPE_LEASE_SET: u8 = 3;

/// Parsed `DatabaseStore` payload
#[derive(Debug, Clone)]
pub struct DatabaseStoreMsg {
    pub key: IdentHash,
    pub store_type: u8,
    /// Non-zero requests a DeliveryStatus confirmation
    pub reply_token: u32,
    /// Where to send the confirmation, when not directly to the sender
    pub reply_tunnel: Option<(TunnelId, IdentHash)>,
    /// RouterInfo (decompressed) or LeaseSet bytes
    pub data: Vec<u8>,
}

impl DatabaseStoreMsg {
    pub fn to_payload(&self) -> Vec<u8> {
        let data = if self.store_type == STORE_TYPE_ROUTER_INFO {
            compress(&self.data)
        } else {
            self.data.clone()
        };

        let mut out = Vec::with_capacity(73 + data.len());
        out.extend_from_slice(&self.key);
        out.push(self.store_type);
        out.extend_from_slice(&self.reply_token.to_be_bytes());
        if self.reply_token != 0 {
            let (tunnel_id, gateway) = self.reply_tunnel.unwrap_or((0, [0u8; 32]));
            out.extend_from_slice(&tunnel_id.to_be_bytes());
            out.extend_from_slice(&gateway);
        }
        out.extend_from_slice(&data);
        out
    }

    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < 37 {
            return Err(truncated(37, payload.len()));
        }
        let key: IdentHash = payload[..32].try_into().expect("32 bytes");
        let store_type = payload[32];
        let reply_token = u32::from_be_bytes(payload[33..37].try_into().expect("4 bytes"));

        let mut off = 37;
        let reply_tunnel = if reply_token != 0 {
            if payload.len() < off + 36 {
                return Err(truncated(off + 36, payload.len()));
            }
            let tunnel_id =
                u32::from_be_bytes(payload[off..off + 4].try_into().expect("4 bytes"));
            let gateway: IdentHash = payload[off + 4..off + 36].try_into().expect("32 bytes");
            off += 36;
            Some((tunnel_id, gateway))
        } else {
            None
        };

        let data = if store_type == STORE_TYPE_ROUTER_INFO {
            decompress(&payload[off..])?
        } else {
            payload[off..].to_vec()
        };

        Ok(Self {
            key,
            store_type,
            reply_token,
            reply_tunnel,
            data,
        })
    }
}

/// Parsed `DatabaseLookup` payload
#[derive(Debug, Clone)]
pub struct DatabaseLookupMsg {
    pub key: IdentHash,
    /// Replying router or reply-tunnel gateway, depending on flags
    pub from: IdentHash,
    pub kind: LookupKind,
    /// Deliver the reply as a TunnelGateway to (`from`, tunnel id)
    pub reply_tunnel_id: Option<TunnelId>,
    /// Floodfills the requester already tried
    pub excluded: Vec<IdentHash>,
    /// One-time key and tag for an encrypted reply
    pub reply_key_tag: Option<([u8; 32], [u8; 8])>,
}

impl DatabaseLookupMsg {
    pub fn to_payload(&self) -> Vec<u8> {
        let mut flags = self.kind.to_bits() << 2;
        if self.reply_tunnel_id.is_some() {
            flags |= FLAG_TUNNEL_REPLY;
        }
        if self.reply_key_tag.is_some() {
            flags |= FLAG_ENCRYPTED_REPLY;
        }

        let mut out = Vec::with_capacity(67 + self.excluded.len() * 32 + 44);
        out.extend_from_slice(&self.key);
        out.extend_from_slice(&self.from);
        out.push(flags);
        if let Some(tunnel_id) = self.reply_tunnel_id {
            out.extend_from_slice(&tunnel_id.to_be_bytes());
        }
        out.extend_from_slice(&(self.excluded.len() as u16).to_be_bytes());
        for excluded in &self.excluded {
            out.extend_from_slice(excluded);
        }
        if let Some((key, tag)) = &self.reply_key_tag {
            out.extend_from_slice(key);
            out.extend_from_slice(tag);
        }
        out
    }

    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < 67 {
            return Err(truncated(67, payload.len()));
        }
        let key: IdentHash = payload[..32].try_into().expect("32 bytes");
        let from: IdentHash = payload[32..64].try_into().expect("32 bytes");
        let flags = payload[64];
        let kind = LookupKind::from_bits(flags >> 2);

        let mut off = 65;
        let reply_tunnel_id = if flags & FLAG_TUNNEL_REPLY != 0 {
            if payload.len() < off + 4 {
                return Err(truncated(off + 4, payload.len()));
            }
            let id = u32::from_be_bytes(payload[off..off + 4].try_into().expect("4 bytes"));
            off += 4;
            Some(id)
        } else {
            None
        };

        if payload.len() < off + 2 {
            return Err(truncated(off + 2, payload.len()));
        }
        let count = u16::from_be_bytes(payload[off..off + 2].try_into().expect("2 bytes")) as usize;
        off += 2;
        if payload.len() < off + count * 32 {
            return Err(truncated(off + count * 32, payload.len()));
        }
        let mut excluded = Vec::with_capacity(count);
        for _ in 0..count {
            excluded.push(payload[off..off + 32].try_into().expect("32 bytes"));
            off += 32;
        }

        let reply_key_tag = if flags & FLAG_ENCRYPTED_REPLY != 0 {
            if payload.len() < off + 40 {
                return Err(truncated(off + 40, payload.len()));
            }
            let reply_key: [u8; 32] = payload[off..off + 32].try_into().expect("32 bytes");
            let tag: [u8; 8] = payload[off + 32..off + 40].try_into().expect("8 bytes");
            Some((reply_key, tag))
        } else {
            None
        };

        Ok(Self {
            key,
            from,
            kind,
            reply_tunnel_id,
            excluded,
            reply_key_tag,
        })
    }
}

/// Parsed `DatabaseSearchReply` payload
#[derive(Debug, Clone)]
pub struct DatabaseSearchReplyMsg {
    pub key: IdentHash,
    /// Closer floodfills the querier has not excluded
    pub peers: Vec<IdentHash>,
    pub from: IdentHash,
}

impl DatabaseSearchReplyMsg {
    pub fn to_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(65 + self.peers.len() * 32);
        out.extend_from_slice(&self.key);
        out.push(self.peers.len() as u8);
        for peer in &self.peers {
            out.extend_from_slice(peer);
        }
        out.extend_from_slice(&self.from);
        out
    }

    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < 65 {
            return Err(truncated(65, payload.len()));
        }
        let key: IdentHash = payload[..32].try_into().expect("32 bytes");
        let count = payload[32] as usize;
        if payload.len() < 33 + count * 32 + 32 {
            return Err(truncated(33 + count * 32 + 32, payload.len()));
        }
        let mut peers = Vec::with_capacity(count);
        let mut off = 33;
        for _ in 0..count {
            peers.push(payload[off..off + 32].try_into().expect("32 bytes"));
            off += 32;
        }
        let from: IdentHash = payload[off..off + 32].try_into().expect("32 bytes");
        Ok(Self { key, peers, from })
    }
}

fn compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).expect("in-memory write");
    encoder.finish().expect("in-memory finish")
}

fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| NetDbError::Malformed(format!("gzip: {}", e)))?;
    Ok(out)
}

fn truncated(need: usize, got: usize) -> NetDbError {
    NetDbError::Core(CoreError::Truncated { need, got })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_roundtrip_router_info() {
        let msg = DatabaseStoreMsg {
            key: [1u8; 32],
            store_type: STORE_TYPE_ROUTER_INFO,
            reply_token: 42,
            reply_tunnel: Some((7, [2u8; 32])),
            data: b"router descriptor bytes".to_vec(),
        };
        let parsed = DatabaseStoreMsg::parse(&msg.to_payload()).unwrap();
        assert_eq!(parsed.key, msg.key);
        assert_eq!(parsed.reply_token, 42);
        assert_eq!(parsed.reply_tunnel, Some((7, [2u8; 32])));
        assert_eq!(parsed.data, msg.data);
    }

    #[test]
    fn test_store_roundtrip_lease_set_no_reply() {
        let msg = DatabaseStoreMsg {
            key: [3u8; 32],
            store_type: STORE_TYPE_LEASE_SET,
            reply_token: 0,
            reply_tunnel: None,
            data: vec![9u8; 100],
        };
        let parsed = DatabaseStoreMsg::parse(&msg.to_payload()).unwrap();
        assert_eq!(parsed.store_type, STORE_TYPE_LEASE_SET);
        assert!(parsed.reply_tunnel.is_none());
        assert_eq!(parsed.data, msg.data);
    }

    #[test]
    fn test_lookup_roundtrip_full() {
        let msg = DatabaseLookupMsg {
            key: [1u8; 32],
            from: [2u8; 32],
            kind: LookupKind::LeaseSet,
            reply_tunnel_id: Some(99),
            excluded: vec![[3u8; 32], [4u8; 32]],
            reply_key_tag: Some(([5u8; 32], [6u8; 8])),
        };
        let parsed = DatabaseLookupMsg::parse(&msg.to_payload()).unwrap();
        assert_eq!(parsed.kind, LookupKind::LeaseSet);
        assert_eq!(parsed.reply_tunnel_id, Some(99));
        assert_eq!(parsed.excluded, msg.excluded);
        assert_eq!(parsed.reply_key_tag, msg.reply_key_tag);
    }

    #[test]
    fn test_lookup_roundtrip_minimal() {
        let msg = DatabaseLookupMsg {
            key: [1u8; 32],
            from: [2u8; 32],
            kind: LookupKind::RouterInfo,
            reply_tunnel_id: None,
            excluded: vec![],
            reply_key_tag: None,
        };
        let parsed = DatabaseLookupMsg::parse(&msg.to_payload()).unwrap();
        assert_eq!(parsed.kind, LookupKind::RouterInfo);
        assert!(parsed.reply_tunnel_id.is_none());
        assert!(parsed.excluded.is_empty());
    }

    #[test]
    fn test_search_reply_roundtrip() {
        let msg = DatabaseSearchReplyMsg {
            key: [1u8; 32],
            peers: vec![[2u8; 32], [3u8; 32], [4u8; 32]],
            from: [5u8; 32],
        };
        let parsed = DatabaseSearchReplyMsg::parse(&msg.to_payload()).unwrap();
        assert_eq!(parsed.peers.len(), 3);
        assert_eq!(parsed.from, [5u8; 32]);
    }

    #[test]
    fn test_truncated_rejected() {
        assert!(DatabaseStoreMsg::parse(&[0u8; 10]).is_err());
        assert!(DatabaseLookupMsg::parse(&[0u8; 40]).is_err());
        assert!(DatabaseSearchReplyMsg::parse(&[0u8; 33]).is_err());
    }
}
