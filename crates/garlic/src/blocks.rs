//! Garlic payload blocks
//!
//! The plaintext of every ratchet AEAD frame is a sequence of typed
//! blocks: `type(1) || len(2) || data`. Cloves carry a nested I2NP message
//! plus delivery instructions; the control blocks drive the DH ratchet,
//! acknowledgements and session teardown.

use garlicnet_core::{CoreError, IdentHash, TunnelId};

use crate::GarlicError;

pub const BLOCK_DATETIME: u8 = 0;
pub const BLOCK_OPTIONS: u8 = 1;
pub const BLOCK_TERMINATION: u8 = 4;
pub const BLOCK_NEXT_KEY: u8 = 7;
pub const BLOCK_ACK: u8 = 8;
pub const BLOCK_ACK_REQUEST: u8 = 9;
pub const BLOCK_GARLIC_CLOVE: u8 = 11;
pub const BLOCK_PADDING: u8 = 254;

const NEXT_KEY_FLAG_KEY_PRESENT: u8 = 0x01;
const NEXT_KEY_FLAG_REVERSE: u8 = 0x02;
const NEXT_KEY_FLAG_REQUEST_REVERSE: u8 = 0x04;

/// Where a clove's inner message should go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloveDelivery {
    /// The receiving destination or router itself
    Local,
    /// A destination hosted behind the receiver
    Destination { hash: IdentHash },
    /// A router, sent directly
    Router { hash: IdentHash },
    /// A tunnel gateway
    Tunnel { hash: IdentHash, tunnel_id: TunnelId },
}

/// One decoded payload block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GarlicBlock {
    DateTime {
        seconds: u32,
    },
    Options {
        data: Vec<u8>,
    },
    Termination {
        reason: u8,
    },
    NextKey {
        key_id: u16,
        reverse: bool,
        request_reverse: bool,
        key: Option<[u8; 32]>,
    },
    /// Acknowledge (tagset_id, index) pairs
    Ack {
        acks: Vec<(u16, u16)>,
    },
    AckRequest,
    /// A nested I2NP envelope with delivery instructions
    Clove {
        delivery: CloveDelivery,
        /// Raw inner I2NP envelope bytes
        msg: Vec<u8>,
    },
    Padding {
        len: usize,
    },
}

impl GarlicBlock {
    fn write_into(&self, out: &mut Vec<u8>) {
        match self {
            GarlicBlock::DateTime { seconds } => {
                out.push(BLOCK_DATETIME);
                out.extend_from_slice(&4u16.to_be_bytes());
                out.extend_from_slice(&seconds.to_be_bytes());
            }
            GarlicBlock::Options { data } => {
                out.push(BLOCK_OPTIONS);
                out.extend_from_slice(&(data.len() as u16).to_be_bytes());
                out.extend_from_slice(data);
            }
            GarlicBlock::Termination { reason } => {
                out.push(BLOCK_TERMINATION);
                out.extend_from_slice(&1u16.to_be_bytes());
                out.push(*reason);
            }
            GarlicBlock::NextKey {
                key_id,
                reverse,
                request_reverse,
                key,
            } => {
                out.push(BLOCK_NEXT_KEY);
                let len = 3 + if key.is_some() { 32 } else { 0 };
                out.extend_from_slice(&(len as u16).to_be_bytes());
                let mut flags = 0u8;
                if key.is_some() {
                    flags |= NEXT_KEY_FLAG_KEY_PRESENT;
                }
                if *reverse {
                    flags |= NEXT_KEY_FLAG_REVERSE;
                }
                if *request_reverse {
                    flags |= NEXT_KEY_FLAG_REQUEST_REVERSE;
                }
                out.push(flags);
                out.extend_from_slice(&key_id.to_be_bytes());
                if let Some(key) = key {
                    out.extend_from_slice(key);
                }
            }
            GarlicBlock::Ack { acks } => {
                out.push(BLOCK_ACK);
                out.extend_from_slice(&((acks.len() * 4) as u16).to_be_bytes());
                for (tagset_id, index) in acks {
                    out.extend_from_slice(&tagset_id.to_be_bytes());
                    out.extend_from_slice(&index.to_be_bytes());
                }
            }
            GarlicBlock::AckRequest => {
                out.push(BLOCK_ACK_REQUEST);
                out.extend_from_slice(&1u16.to_be_bytes());
                out.push(0);
            }
            GarlicBlock::Clove { delivery, msg } => {
                out.push(BLOCK_GARLIC_CLOVE);
                let delivery_len = match delivery {
                    CloveDelivery::Local => 0,
                    CloveDelivery::Destination { .. } | CloveDelivery::Router { .. } => 32,
                    CloveDelivery::Tunnel { .. } => 36,
                };
                out.extend_from_slice(&((1 + delivery_len + msg.len()) as u16).to_be_bytes());
                match delivery {
                    CloveDelivery::Local => out.push(0 << 5),
                    CloveDelivery::Destination { hash } => {
                        out.push(1 << 5);
                        out.extend_from_slice(hash);
                    }
                    CloveDelivery::Router { hash } => {
                        out.push(2 << 5);
                        out.extend_from_slice(hash);
                    }
                    CloveDelivery::Tunnel { hash, tunnel_id } => {
                        out.push(3 << 5);
                        out.extend_from_slice(&tunnel_id.to_be_bytes());
                        out.extend_from_slice(hash);
                    }
                }
                out.extend_from_slice(msg);
            }
            GarlicBlock::Padding { len } => {
                out.push(BLOCK_PADDING);
                out.extend_from_slice(&(*len as u16).to_be_bytes());
                out.resize(out.len() + len, 0);
            }
        }
    }
}

/// Serialize blocks into an AEAD-ready payload.
pub fn serialize_blocks(blocks: &[GarlicBlock]) -> Vec<u8> {
    let mut out = Vec::new();
    for block in blocks {
        block.write_into(&mut out);
    }
    out
}

/// Parse a decrypted payload into blocks. Unknown block types are skipped.
pub fn parse_blocks(payload: &[u8]) -> Result<Vec<GarlicBlock>, GarlicError> {
    let mut blocks = Vec::new();
    let mut off = 0usize;
    while off + 3 <= payload.len() {
        let block_type = payload[off];
        let len =
            u16::from_be_bytes(payload[off + 1..off + 3].try_into().expect("2 bytes")) as usize;
        off += 3;
        if off + len > payload.len() {
            return Err(GarlicError::Core(CoreError::Truncated {
                need: off + len,
                got: payload.len(),
            }));
        }
        let data = &payload[off..off + len];
        off += len;

        match block_type {
            BLOCK_DATETIME if len >= 4 => blocks.push(GarlicBlock::DateTime {
                seconds: u32::from_be_bytes(data[..4].try_into().expect("4 bytes")),
            }),
            BLOCK_OPTIONS => blocks.push(GarlicBlock::Options {
                data: data.to_vec(),
            }),
            BLOCK_TERMINATION if !data.is_empty() => {
                blocks.push(GarlicBlock::Termination { reason: data[0] })
            }
            BLOCK_NEXT_KEY if len >= 3 => {
                let flags = data[0];
                let key_id = u16::from_be_bytes(data[1..3].try_into().expect("2 bytes"));
                let key = if flags & NEXT_KEY_FLAG_KEY_PRESENT != 0 && len >= 35 {
                    Some(data[3..35].try_into().expect("32 bytes"))
                } else {
                    None
                };
                blocks.push(GarlicBlock::NextKey {
                    key_id,
                    reverse: flags & NEXT_KEY_FLAG_REVERSE != 0,
                    request_reverse: flags & NEXT_KEY_FLAG_REQUEST_REVERSE != 0,
                    key,
                });
            }
            BLOCK_ACK => {
                let mut acks = Vec::with_capacity(len / 4);
                for chunk in data.chunks_exact(4) {
                    acks.push((
                        u16::from_be_bytes(chunk[..2].try_into().expect("2 bytes")),
                        u16::from_be_bytes(chunk[2..].try_into().expect("2 bytes")),
                    ));
                }
                blocks.push(GarlicBlock::Ack { acks });
            }
            BLOCK_ACK_REQUEST => blocks.push(GarlicBlock::AckRequest),
            BLOCK_GARLIC_CLOVE if !data.is_empty() => {
                let flag = data[0];
                let mut doff = 1usize;
                let delivery = match (flag >> 5) & 0x03 {
                    0 => CloveDelivery::Local,
                    1 => {
                        let hash = read_hash(data, &mut doff)?;
                        CloveDelivery::Destination { hash }
                    }
                    2 => {
                        let hash = read_hash(data, &mut doff)?;
                        CloveDelivery::Router { hash }
                    }
                    _ => {
                        let tunnel_id = {
                            if doff + 4 > data.len() {
                                return Err(GarlicError::MalformedBlock("clove tunnel id"));
                            }
                            let id = u32::from_be_bytes(
                                data[doff..doff + 4].try_into().expect("4 bytes"),
                            );
                            doff += 4;
                            id
                        };
                        let hash = read_hash(data, &mut doff)?;
                        CloveDelivery::Tunnel { hash, tunnel_id }
                    }
                };
                blocks.push(GarlicBlock::Clove {
                    delivery,
                    msg: data[doff..].to_vec(),
                });
            }
            BLOCK_PADDING => blocks.push(GarlicBlock::Padding { len }),
            other => {
                tracing::trace!("skipping unknown garlic block type {}", other);
            }
        }
    }
    Ok(blocks)
}

fn read_hash(data: &[u8], off: &mut usize) -> Result<IdentHash, GarlicError> {
    if *off + 32 > data.len() {
        return Err(GarlicError::MalformedBlock("clove hash"));
    }
    let hash = data[*off..*off + 32].try_into().expect("32 bytes");
    *off += 32;
    Ok(hash)
}
