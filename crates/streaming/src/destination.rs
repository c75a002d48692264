//! Stream multiplexing within a destination
//!
//! Routes incoming data-protocol payloads to their streams, accepts new
//! streams on SYN, and drives every stream's pump and timers. The
//! data-protocol framing is `payload_len(4) || deflate(payload) ||
//! src_port(2) || dst_port(2) || protocol(1)`; payloads under the
//! compression threshold use stored (level-0) deflate.

use std::collections::HashMap;
use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use rand::Rng;
use tracing::debug;

use garlicnet_core::{now_ms, PeerIdentity};
use garlicnet_crypto::SigningKeypair;

use crate::packet::{Packet, PacketFlags};
use crate::stream::{Stream, StreamStatus};
use crate::StreamError;

pub const PROTOCOL_STREAMING: u8 = 6;
pub const PROTOCOL_DATAGRAM: u8 = 17;
pub const PROTOCOL_RAW: u8 = 18;

/// Payloads at least this long are actually compressed
pub const COMPRESSION_THRESHOLD: usize = 66;

/// Decompressed payloads beyond this are discarded
pub const MAX_DATA_SIZE: usize = 16 * 1024;

/// Wrap a protocol payload for a `Data` message.
pub fn wrap_data_protocol(payload: &[u8], src_port: u16, dst_port: u16, protocol: u8) -> Vec<u8> {
    let level = if payload.len() >= COMPRESSION_THRESHOLD {
        Compression::default()
    } else {
        Compression::none()
    };
    let mut encoder = ZlibEncoder::new(Vec::new(), level);
    encoder.write_all(payload).expect("in-memory write");
    let compressed = encoder.finish().expect("in-memory finish");

    let mut out = Vec::with_capacity(9 + compressed.len());
    out.extend_from_slice(&(compressed.len() as u32).to_be_bytes());
    out.extend_from_slice(&compressed);
    out.extend_from_slice(&src_port.to_be_bytes());
    out.extend_from_slice(&dst_port.to_be_bytes());
    out.push(protocol);
    out
}

/// Inverse of [`wrap_data_protocol`]. Oversize payloads are rejected.
pub fn unwrap_data_protocol(bytes: &[u8]) -> Result<(Vec<u8>, u16, u16, u8), StreamError> {
    if bytes.len() < 9 {
        return Err(StreamError::MalformedPacket("short data message"));
    }
    let compressed_len = u32::from_be_bytes(bytes[..4].try_into().expect("4 bytes")) as usize;
    if bytes.len() < 4 + compressed_len + 5 {
        return Err(StreamError::MalformedPacket("data length"));
    }
    let compressed = &bytes[4..4 + compressed_len];
    let trailer = &bytes[4 + compressed_len..4 + compressed_len + 5];

    let mut decoder = ZlibDecoder::new(compressed).take(MAX_DATA_SIZE as u64 + 1);
    let mut payload = Vec::new();
    decoder
        .read_to_end(&mut payload)
        .map_err(|_| StreamError::MalformedPacket("inflate"))?;
    if payload.len() > MAX_DATA_SIZE {
        return Err(StreamError::OversizePayload(payload.len()));
    }

    let src_port = u16::from_be_bytes(trailer[..2].try_into().expect("2 bytes"));
    let dst_port = u16::from_be_bytes(trailer[2..4].try_into().expect("2 bytes"));
    Ok((payload, src_port, dst_port, trailer[4]))
}

/// Things the owning destination reacts to
#[derive(Debug)]
pub enum StreamingEvent {
    /// A packet to wrap as a `Data` message and send to the remote
    PacketOut { stream_id: u32, packet: Packet },
    /// A new inbound stream was accepted
    StreamAccepted { stream_id: u32 },
    /// Readable bytes appeared on a stream
    DataReady { stream_id: u32 },
    /// A stream reached a terminal state
    StreamClosed { stream_id: u32 },
}

/// All streams of one local destination.
pub struct StreamingDestination {
    local_identity: PeerIdentity,
    signer: SigningKeypair,
    streams: HashMap<u32, Stream>,
}

impl StreamingDestination {
    pub fn new(local_identity: PeerIdentity, signer: SigningKeypair) -> Self {
        Self {
            local_identity,
            signer,
            streams: HashMap::new(),
        }
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn stream(&self, id: u32) -> Option<&Stream> {
        self.streams.get(&id)
    }

    pub fn stream_mut(&mut self, id: u32) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    pub fn stream_ids(&self) -> Vec<u32> {
        self.streams.keys().copied().collect()
    }

    /// Open an outbound stream; the SYN goes out with the first pump.
    pub fn connect(&mut self) -> u32 {
        let id = self.fresh_id();
        let stream = Stream::new_outbound(id, self.local_identity.clone(), self.signer.clone());
        self.streams.insert(id, stream);
        id
    }

    fn fresh_id(&self) -> u32 {
        loop {
            let id: u32 = rand::thread_rng().gen();
            if id != 0 && !self.streams.contains_key(&id) {
                return id;
            }
        }
    }

    /// Handle one unwrapped streaming-protocol payload.
    pub fn handle_packet_bytes(&mut self, bytes: &[u8]) -> Vec<StreamingEvent> {
        let packet = match Packet::from_bytes(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("dropping malformed streaming packet: {}", e);
                return Vec::new();
            }
        };
        let now = now_ms();
        let mut events = Vec::new();

        let stream_id = if packet.send_stream_id != 0 {
            packet.send_stream_id
        } else if packet.flags.contains(PacketFlags::SYN) {
            // new inbound stream
            let id = self.fresh_id();
            let stream = Stream::new_inbound(
                id,
                packet.recv_stream_id,
                packet.from.clone(),
                self.local_identity.clone(),
                self.signer.clone(),
            );
            self.streams.insert(id, stream);
            events.push(StreamingEvent::StreamAccepted { stream_id: id });
            id
        } else {
            debug!("packet for unknown stream, dropped");
            return events;
        };

        let Some(stream) = self.streams.get_mut(&stream_id) else {
            debug!("packet for unknown stream {}, dropped", stream_id);
            return events;
        };

        let had = stream.available();
        for reply in stream.on_packet(packet, now) {
            events.push(StreamingEvent::PacketOut {
                stream_id,
                packet: reply,
            });
        }
        if stream.available() > had {
            events.push(StreamingEvent::DataReady { stream_id });
        }
        if stream.is_terminal() {
            events.push(StreamingEvent::StreamClosed { stream_id });
        }
        events
    }

    /// Pump send windows and fire timers across every stream; terminal
    /// streams are reaped afterwards.
    pub fn tick(&mut self) -> Vec<StreamingEvent> {
        let now = now_ms();
        let mut events = Vec::new();

        for (id, stream) in self.streams.iter_mut() {
            for packet in stream.on_timer(now) {
                events.push(StreamingEvent::PacketOut {
                    stream_id: *id,
                    packet,
                });
            }
            for packet in stream.pump(now) {
                events.push(StreamingEvent::PacketOut {
                    stream_id: *id,
                    packet,
                });
            }
            if stream.is_terminal() {
                events.push(StreamingEvent::StreamClosed { stream_id: *id });
            }
        }

        // reap terminal streams once the application has drained them
        self.streams.retain(|_, stream| {
            !(stream.status == StreamStatus::Reset
                || (stream.status == StreamStatus::Closed && stream.available() == 0))
        });
        events
    }
}
