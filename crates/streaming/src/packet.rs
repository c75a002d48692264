//! Streaming packet codec
//!
//! `send_stream_id(4) || recv_stream_id(4) || seq(4) || ack_through(4) ||
//! nack_count(1) || nacks(4n) || resend_delay(1) || flags(2) ||
//! options_size(2) || options || payload`. Option fields appear in flag-bit
//! order; the signature option covers the whole packet with its own field
//! zeroed.

use bitflags::bitflags;

use garlicnet_core::{CoreError, PeerIdentity};

use crate::StreamError;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PacketFlags: u16 {
        const SYN                      = 0x0001;
        const CLOSE                    = 0x0002;
        const RESET                    = 0x0004;
        const SIGNATURE_INCLUDED       = 0x0008;
        const SIGNATURE_REQUESTED      = 0x0010;
        const FROM_INCLUDED            = 0x0020;
        const DELAY_REQUESTED          = 0x0040;
        const MAX_PACKET_SIZE_INCLUDED = 0x0080;
        const NO_ACK                   = 0x0400;
    }
}

#[derive(Debug, Clone, Default)]
pub struct Packet {
    /// The receiver's stream id (0 until the peer has told us theirs)
    pub send_stream_id: u32,
    /// The sender's own stream id
    pub recv_stream_id: u32,
    pub seq: u32,
    pub ack_through: u32,
    pub nacks: Vec<u32>,
    pub resend_delay: u8,
    pub flags: PacketFlags,
    pub delay_requested: Option<u16>,
    pub from: Option<PeerIdentity>,
    pub max_packet_size: Option<u16>,
    pub signature: Option<[u8; 64]>,
    pub payload: Vec<u8>,
}

impl Packet {
    fn options_bytes(&self, zero_signature: bool) -> Vec<u8> {
        let mut out = Vec::new();
        if let Some(delay) = self.delay_requested {
            out.extend_from_slice(&delay.to_be_bytes());
        }
        if let Some(from) = &self.from {
            let bytes = from.to_bytes();
            out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
            out.extend_from_slice(&bytes);
        }
        if let Some(mps) = self.max_packet_size {
            out.extend_from_slice(&mps.to_be_bytes());
        }
        if let Some(signature) = &self.signature {
            if zero_signature {
                out.extend_from_slice(&[0u8; 64]);
            } else {
                out.extend_from_slice(signature);
            }
        }
        out
    }

    fn encode(&self, zero_signature: bool) -> Vec<u8> {
        let options = self.options_bytes(zero_signature);
        let mut out =
            Vec::with_capacity(22 + self.nacks.len() * 4 + options.len() + self.payload.len());
        out.extend_from_slice(&self.send_stream_id.to_be_bytes());
        out.extend_from_slice(&self.recv_stream_id.to_be_bytes());
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.extend_from_slice(&self.ack_through.to_be_bytes());
        out.push(self.nacks.len() as u8);
        for nack in &self.nacks {
            out.extend_from_slice(&nack.to_be_bytes());
        }
        out.push(self.resend_delay);
        out.extend_from_slice(&self.flags.bits().to_be_bytes());
        out.extend_from_slice(&(options.len() as u16).to_be_bytes());
        out.extend_from_slice(&options);
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode(false)
    }

    /// The bytes a signature covers: the packet with the signature field
    /// zeroed.
    pub fn signable_bytes(&self) -> Vec<u8> {
        self.encode(true)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StreamError> {
        if bytes.len() < 22 {
            return Err(truncated(22, bytes.len()));
        }
        let send_stream_id = u32::from_be_bytes(bytes[0..4].try_into().expect("4 bytes"));
        let recv_stream_id = u32::from_be_bytes(bytes[4..8].try_into().expect("4 bytes"));
        let seq = u32::from_be_bytes(bytes[8..12].try_into().expect("4 bytes"));
        let ack_through = u32::from_be_bytes(bytes[12..16].try_into().expect("4 bytes"));
        let nack_count = bytes[16] as usize;

        let mut off = 17;
        if bytes.len() < off + nack_count * 4 + 5 {
            return Err(truncated(off + nack_count * 4 + 5, bytes.len()));
        }
        let mut nacks = Vec::with_capacity(nack_count);
        for _ in 0..nack_count {
            nacks.push(u32::from_be_bytes(
                bytes[off..off + 4].try_into().expect("4 bytes"),
            ));
            off += 4;
        }
        let resend_delay = bytes[off];
        off += 1;
        let flags = PacketFlags::from_bits_truncate(u16::from_be_bytes(
            bytes[off..off + 2].try_into().expect("2 bytes"),
        ));
        off += 2;
        let options_size =
            u16::from_be_bytes(bytes[off..off + 2].try_into().expect("2 bytes")) as usize;
        off += 2;
        if bytes.len() < off + options_size {
            return Err(truncated(off + options_size, bytes.len()));
        }
        let options_end = off + options_size;

        let mut delay_requested = None;
        let mut from = None;
        let mut max_packet_size = None;
        let mut signature = None;

        if flags.contains(PacketFlags::DELAY_REQUESTED) {
            if off + 2 > options_end {
                return Err(StreamError::MalformedPacket("delay option"));
            }
            delay_requested = Some(u16::from_be_bytes(
                bytes[off..off + 2].try_into().expect("2 bytes"),
            ));
            off += 2;
        }
        if flags.contains(PacketFlags::FROM_INCLUDED) {
            if off + 2 > options_end {
                return Err(StreamError::MalformedPacket("from option length"));
            }
            let len =
                u16::from_be_bytes(bytes[off..off + 2].try_into().expect("2 bytes")) as usize;
            off += 2;
            if off + len > options_end {
                return Err(StreamError::MalformedPacket("from option"));
            }
            let (identity, _) = PeerIdentity::from_bytes(&bytes[off..off + len])
                .map_err(|_| StreamError::MalformedPacket("from identity"))?;
            from = Some(identity);
            off += len;
        }
        if flags.contains(PacketFlags::MAX_PACKET_SIZE_INCLUDED) {
            if off + 2 > options_end {
                return Err(StreamError::MalformedPacket("mps option"));
            }
            max_packet_size = Some(u16::from_be_bytes(
                bytes[off..off + 2].try_into().expect("2 bytes"),
            ));
            off += 2;
        }
        if flags.contains(PacketFlags::SIGNATURE_INCLUDED) {
            if off + 64 > options_end {
                return Err(StreamError::MalformedPacket("signature option"));
            }
            signature = Some(bytes[off..off + 64].try_into().expect("64 bytes"));
            off += 64;
        }

        Ok(Self {
            send_stream_id,
            recv_stream_id,
            seq,
            ack_through,
            nacks,
            resend_delay,
            flags,
            delay_requested,
            from,
            max_packet_size,
            signature,
            payload: bytes[options_end..].to_vec(),
        })
    }

    /// Verify an included signature against the sender identity (from the
    /// packet's FROM option or the stream's cached identity).
    pub fn verify_signature(&self, identity: &PeerIdentity) -> Result<(), StreamError> {
        let signature = self
            .signature
            .as_ref()
            .ok_or(StreamError::MalformedPacket("missing signature"))?;
        identity
            .verify(&self.signable_bytes(), signature)
            .map_err(|_| StreamError::BadSignature)
    }
}

fn truncated(need: usize, got: usize) -> StreamError {
    StreamError::Core(CoreError::Truncated { need, got })
}
