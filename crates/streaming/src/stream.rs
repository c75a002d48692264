//! Stream state machine
//!
//! A TCP-flavored reliable byte stream: sliding window with slow-start-like
//! growth, smoothed RTT with exponential RTO backoff, NACK-carrying quick
//! ACKs, a 200 ms delayed ACK, and an escalation ladder on retransmission
//! (shrink window, reset RTO, ask for a different tunnel, a different
//! lease, and finally reset the stream).

use std::collections::{BTreeMap, VecDeque};

use tracing::{debug, warn};

use garlicnet_core::{now_ms, PeerIdentity};
use garlicnet_crypto::SigningKeypair;

use crate::packet::{Packet, PacketFlags};
use crate::StreamError;

/// Largest payload per packet
pub const STREAMING_MTU: usize = 1730;

/// Initial window, packets
pub const WINDOW_SIZE: u32 = 6;

pub const MIN_WINDOW_SIZE: u32 = 1;

pub const MAX_WINDOW_SIZE: u32 = 128;

pub const INITIAL_RTO_MS: u64 = 9_000;

pub const MIN_RTO_MS: u64 = 100;

pub const DELAYED_ACK_MS: u64 = 200;

/// Resend attempts before the stream is reset
pub const MAX_RESEND_ATTEMPTS: u32 = 7;

/// A quick-ACK never carries more NACKs than this
pub const MAX_NACKS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    New,
    Open,
    Closing,
    Closed,
    Reset,
}

struct InFlight {
    packet: Packet,
    send_time_ms: u64,
    resends: u32,
}

pub struct Stream {
    /// Our stream id; the peer addresses us with it
    pub our_id: u32,
    /// The peer's stream id; 0 until their first reply
    pub peer_id: u32,
    pub remote_identity: Option<PeerIdentity>,
    pub status: StreamStatus,

    local_identity: PeerIdentity,
    signer: SigningKeypair,

    // send side
    next_seq: u32,
    send_buffer: VecDeque<u8>,
    in_flight: Vec<InFlight>,
    window: f32,
    rtt_ms: Option<f32>,
    rtt_samples: u32,
    rto_ms: u64,
    syn_sent: bool,
    fin_sent: bool,
    fin_seq: Option<u32>,

    // receive side
    /// Highest contiguous sequence consumed; None until the first packet
    last_recv_seq: Option<u32>,
    recv_queue: VecDeque<u8>,
    saved: BTreeMap<u32, Packet>,
    remote_closed: bool,
    delayed_ack_due_ms: Option<u64>,

    /// Escalation requests the owning destination acts on
    pub want_tunnel_switch: bool,
    pub want_lease_switch: bool,
}

impl Stream {
    /// Originate a stream to a remote destination.
    pub fn new_outbound(
        our_id: u32,
        local_identity: PeerIdentity,
        signer: SigningKeypair,
    ) -> Self {
        Self::new_common(our_id, 0, None, local_identity, signer, StreamStatus::New)
    }

    /// Accept a stream from an incoming SYN. The SYN itself must then be
    /// fed through [`on_packet`](Self::on_packet).
    pub fn new_inbound(
        our_id: u32,
        peer_id: u32,
        remote_identity: Option<PeerIdentity>,
        local_identity: PeerIdentity,
        signer: SigningKeypair,
    ) -> Self {
        Self::new_common(
            our_id,
            peer_id,
            remote_identity,
            local_identity,
            signer,
            StreamStatus::Open,
        )
    }

    fn new_common(
        our_id: u32,
        peer_id: u32,
        remote_identity: Option<PeerIdentity>,
        local_identity: PeerIdentity,
        signer: SigningKeypair,
        status: StreamStatus,
    ) -> Self {
        Self {
            our_id,
            peer_id,
            remote_identity,
            status,
            local_identity,
            signer,
            next_seq: 0,
            send_buffer: VecDeque::new(),
            in_flight: Vec::new(),
            window: WINDOW_SIZE as f32,
            rtt_ms: None,
            rtt_samples: 0,
            rto_ms: INITIAL_RTO_MS,
            syn_sent: false,
            fin_sent: false,
            fin_seq: None,
            last_recv_seq: None,
            recv_queue: VecDeque::new(),
            saved: BTreeMap::new(),
            remote_closed: false,
            delayed_ack_due_ms: None,
            want_tunnel_switch: false,
            want_lease_switch: false,
        }
    }

    /// Established once the peer has assigned us its stream id.
    pub fn is_established(&self) -> bool {
        self.peer_id != 0
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, StreamStatus::Closed | StreamStatus::Reset)
    }

    pub fn window(&self) -> u32 {
        self.window as u32
    }

    pub fn rto_ms(&self) -> u64 {
        self.rto_ms
    }

    // ---- application surface ---------------------------------------------

    /// Queue bytes for sending.
    pub fn send(&mut self, data: &[u8]) -> Result<(), StreamError> {
        if self.is_terminal() || self.status == StreamStatus::Closing {
            return Err(StreamError::StreamClosed);
        }
        self.send_buffer.extend(data);
        Ok(())
    }

    /// Read buffered received bytes into `buf`, returning the count.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.recv_queue.len());
        for byte in buf.iter_mut().take(n) {
            *byte = self.recv_queue.pop_front().expect("length checked");
        }
        n
    }

    pub fn available(&self) -> usize {
        self.recv_queue.len()
    }

    /// The peer finished sending and everything was drained.
    pub fn at_eof(&self) -> bool {
        self.remote_closed && self.recv_queue.is_empty() && self.saved.is_empty()
    }

    /// Begin an orderly close: remaining buffered data is flushed, then a
    /// signed FIN goes out.
    pub fn close(&mut self) {
        if !self.is_terminal() {
            self.status = StreamStatus::Closing;
        }
    }

    /// Reset the stream, informing the peer when possible.
    pub fn reset(&mut self) -> Packet {
        warn!("stream {} reset", self.our_id);
        self.status = StreamStatus::Reset;
        self.in_flight.clear();
        self.send_buffer.clear();
        let mut packet = self.base_packet();
        packet.flags |= PacketFlags::RESET | PacketFlags::SIGNATURE_INCLUDED;
        self.sign(&mut packet);
        packet
    }

    // ---- send path --------------------------------------------------------

    /// Emit as many packets as the window allows.
    pub fn pump(&mut self, now_ms: u64) -> Vec<Packet> {
        let mut out = Vec::new();
        if self.is_terminal() {
            return out;
        }

        while (self.in_flight.len() as u32) < self.window.max(MIN_WINDOW_SIZE as f32) as u32 {
            let chunk_len = self.send_buffer.len().min(STREAMING_MTU);
            let sending_fin = self.status == StreamStatus::Closing
                && self.send_buffer.is_empty()
                && !self.fin_sent;
            if chunk_len == 0 && self.syn_sent && !sending_fin {
                break;
            }

            let payload: Vec<u8> = self.send_buffer.drain(..chunk_len).collect();
            let mut packet = self.base_packet();
            packet.seq = self.next_seq;
            packet.payload = payload;

            if !self.syn_sent {
                packet.flags |= PacketFlags::SYN
                    | PacketFlags::FROM_INCLUDED
                    | PacketFlags::SIGNATURE_INCLUDED
                    | PacketFlags::MAX_PACKET_SIZE_INCLUDED;
                packet.from = Some(self.local_identity.clone());
                packet.max_packet_size = Some(STREAMING_MTU as u16);
                self.sign(&mut packet);
                self.syn_sent = true;
            } else if sending_fin {
                packet.flags |= PacketFlags::CLOSE | PacketFlags::SIGNATURE_INCLUDED;
                self.sign(&mut packet);
                self.fin_sent = true;
                self.fin_seq = Some(packet.seq);
            }

            self.next_seq += 1;
            self.in_flight.push(InFlight {
                packet: packet.clone(),
                send_time_ms: now_ms,
                resends: 0,
            });
            out.push(packet);

            if sending_fin {
                break;
            }
        }
        if !out.is_empty() {
            // data packets carry the current ack state implicitly
            self.delayed_ack_due_ms = None;
        }
        out
    }

    fn base_packet(&self) -> Packet {
        let (ack_through, nacks) = self.ack_state();
        let mut flags = PacketFlags::default();
        if self.last_recv_seq.is_none() {
            // nothing received yet; an ack_through of 0 would be a lie
            flags |= PacketFlags::NO_ACK;
        }
        Packet {
            send_stream_id: self.peer_id,
            recv_stream_id: self.our_id,
            ack_through,
            nacks,
            resend_delay: (self.rto_ms / 1000).min(255) as u8,
            flags,
            ..Default::default()
        }
    }

    fn sign(&self, packet: &mut Packet) {
        packet.signature = Some([0u8; 64]);
        packet.signature = Some(self.signer.sign(&packet.signable_bytes()));
    }

    // ---- receive path -----------------------------------------------------

    /// Process one incoming packet; returns packets to send back.
    pub fn on_packet(&mut self, packet: Packet, now_ms: u64) -> Vec<Packet> {
        let mut out = Vec::new();
        if self.is_terminal() {
            return out;
        }

        // learn the peer's id from its first reply
        if self.peer_id == 0 && packet.recv_stream_id != 0 {
            self.peer_id = packet.recv_stream_id;
            debug!("stream {} established with peer id {}", self.our_id, self.peer_id);
        }

        if packet.flags.contains(PacketFlags::RESET) {
            debug!("stream {} reset by peer", self.our_id);
            self.status = StreamStatus::Reset;
            return out;
        }

        // cache the peer identity and verify any signature
        if let Some(from) = &packet.from {
            if self.remote_identity.is_none() {
                self.remote_identity = Some(from.clone());
            }
        }
        if packet.flags.contains(PacketFlags::SIGNATURE_INCLUDED) {
            match &self.remote_identity {
                Some(identity) => {
                    if packet.verify_signature(identity).is_err() {
                        debug!("stream {}: bad packet signature, dropped", self.our_id);
                        return out;
                    }
                }
                None => {
                    debug!("stream {}: signed packet without identity, dropped", self.our_id);
                    return out;
                }
            }
        }

        self.process_acks(&packet, now_ms);

        let sequenced = packet.flags.contains(PacketFlags::SYN)
            || packet.flags.contains(PacketFlags::CLOSE)
            || !packet.payload.is_empty();
        if !sequenced {
            self.update_status_after_ack();
            return out;
        }

        let expected = match self.last_recv_seq {
            None => 0,
            Some(last) => last + 1,
        };

        if packet.seq == expected {
            self.accept_sequenced(&packet);
            // drain contiguous saved packets
            while let Some(last) = self.last_recv_seq {
                match self.saved.remove(&(last + 1)) {
                    Some(saved) => self.accept_sequenced(&saved),
                    None => break,
                }
            }
            if self.delayed_ack_due_ms.is_none() {
                self.delayed_ack_due_ms = Some(now_ms + DELAYED_ACK_MS);
            }
        } else if packet.seq < expected {
            // duplicate: drop payload, ACK immediately
            debug!("stream {}: duplicate seq {}", self.our_id, packet.seq);
            out.push(self.ack_packet());
            self.delayed_ack_due_ms = None;
        } else {
            // gap: buffer and quick-ACK with NACKs
            self.saved.insert(packet.seq, packet);
            out.push(self.ack_packet());
            self.delayed_ack_due_ms = None;
        }

        self.update_status_after_ack();
        out
    }

    fn accept_sequenced(&mut self, packet: &Packet) {
        self.recv_queue.extend(packet.payload.iter());
        self.last_recv_seq = Some(packet.seq);
        if packet.flags.contains(PacketFlags::CLOSE) {
            self.remote_closed = true;
        }
    }

    fn process_acks(&mut self, packet: &Packet, _now_ms: u64) {
        if packet.flags.contains(PacketFlags::NO_ACK) {
            return;
        }
        let before = self.in_flight.len();
        let mut acked_samples: Vec<(u64, u32)> = Vec::new();
        self.in_flight.retain(|in_flight| {
            let acked = in_flight.packet.seq <= packet.ack_through
                && !packet.nacks.contains(&in_flight.packet.seq);
            if acked {
                acked_samples.push((in_flight.send_time_ms, in_flight.resends));
            }
            !acked
        });
        let acked = before - self.in_flight.len();
        if acked == 0 {
            return;
        }

        // RTT from packets never retransmitted
        let now = now_ms();
        for (send_time, resends) in &acked_samples {
            if *resends == 0 {
                let sample = now.saturating_sub(*send_time) as f32;
                let n = self.rtt_samples as f32;
                self.rtt_ms = Some(match self.rtt_ms {
                    Some(rtt) => (rtt * n + sample) / (n + 1.0),
                    None => sample,
                });
                self.rtt_samples += 1;
            }
        }
        if let Some(rtt) = self.rtt_ms {
            self.rto_ms = ((rtt * 1.5) as u64).max(MIN_RTO_MS);
        }

        // window growth: +1 per ACK up to the initial window, then roughly
        // +1 per RTT up to the maximum
        for _ in 0..acked {
            if self.window < WINDOW_SIZE as f32 {
                self.window += 1.0;
            } else if self.window < MAX_WINDOW_SIZE as f32 {
                self.window += 1.0 / self.window;
            }
        }
    }

    fn update_status_after_ack(&mut self) {
        if self.status == StreamStatus::Closing
            && self.fin_sent
            && self.in_flight.is_empty()
            && self.send_buffer.is_empty()
        {
            self.status = StreamStatus::Closed;
        }
        if self.status == StreamStatus::New && self.is_established() {
            self.status = StreamStatus::Open;
        }
    }

    /// Cumulative ACK state: highest seq seen plus NACKs for the holes.
    fn ack_state(&self) -> (u32, Vec<u32>) {
        let last = match self.last_recv_seq {
            Some(last) => last,
            None => return (0, Vec::new()),
        };
        let Some((&highest, _)) = self.saved.iter().next_back() else {
            return (last, Vec::new());
        };

        let mut nacks = Vec::new();
        for seq in last + 1..highest {
            if !self.saved.contains_key(&seq) {
                nacks.push(seq);
            }
        }
        if nacks.len() >= MAX_NACKS {
            // too sparse to describe: ack only through the contiguous part
            return (last, Vec::new());
        }
        (highest, nacks)
    }

    fn ack_packet(&self) -> Packet {
        // pure ACK: unsequenced, no payload
        self.base_packet()
    }

    // ---- timers -----------------------------------------------------------

    /// Fire timers: delayed ACK and retransmissions. Returns packets to
    /// send; a RESET packet is last when the ladder topped out.
    pub fn on_timer(&mut self, now_ms: u64) -> Vec<Packet> {
        let mut out = Vec::new();
        if self.is_terminal() {
            return out;
        }

        if let Some(due) = self.delayed_ack_due_ms {
            if due <= now_ms {
                self.delayed_ack_due_ms = None;
                out.push(self.ack_packet());
            }
        }

        let mut resend: Vec<usize> = Vec::new();
        for (i, in_flight) in self.in_flight.iter().enumerate() {
            if in_flight.send_time_ms + self.rto_ms <= now_ms {
                resend.push(i);
            }
        }
        if resend.is_empty() {
            return out;
        }

        let max_resends = self
            .in_flight
            .iter()
            .map(|p| p.resends)
            .max()
            .unwrap_or(0);
        let attempt = max_resends + 1;
        if attempt >= MAX_RESEND_ATTEMPTS {
            out.push(self.reset());
            return out;
        }

        // congestion ladder
        match attempt {
            1 => {
                self.window = (self.window / 2.0).max(MIN_WINDOW_SIZE as f32);
            }
            2 => self.rto_ms = INITIAL_RTO_MS,
            3 => self.want_tunnel_switch = true,
            4 => self.want_lease_switch = true,
            _ => {}
        }
        self.rto_ms = (self.rto_ms * 2).min(45_000);

        for index in resend {
            let in_flight = &mut self.in_flight[index];
            in_flight.send_time_ms = now_ms;
            in_flight.resends += 1;
            // refresh ack fields on the retransmit
            let (ack_through, nacks) = {
                let last = self.last_recv_seq.unwrap_or(0);
                (last, Vec::new())
            };
            in_flight.packet.ack_through = ack_through;
            in_flight.packet.nacks = nacks;
            out.push(in_flight.packet.clone());
        }
        out
    }

    /// When the next timer wants to run.
    pub fn next_timer_ms(&self) -> Option<u64> {
        let resend = self
            .in_flight
            .iter()
            .map(|p| p.send_time_ms + self.rto_ms)
            .min();
        match (self.delayed_ack_due_ms, resend) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, b) => b,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use garlicnet_crypto::Identity;

    fn make_stream(our_id: u32) -> Stream {
        let keys = Identity::generate();
        let ident = PeerIdentity::new(
            keys.signing.public_key_bytes(),
            keys.encryption.public_key_bytes(),
        );
        Stream::new_outbound(our_id, ident, keys.signing)
    }

    fn connect() -> (Stream, Stream) {
        let mut alice = make_stream(11);
        let keys = Identity::generate();
        let ident = PeerIdentity::new(
            keys.signing.public_key_bytes(),
            keys.encryption.public_key_bytes(),
        );

        let now = now_ms();
        alice.send(b"hello").unwrap();
        let syn = alice.pump(now).remove(0);
        assert!(syn.flags.contains(PacketFlags::SYN));

        let mut bob = Stream::new_inbound(
            22,
            syn.recv_stream_id,
            syn.from.clone(),
            ident,
            keys.signing,
        );
        let acks = bob.on_packet(syn, now);
        // feed the delayed ack back once it fires
        for ack in acks.into_iter().chain(bob.on_timer(now + DELAYED_ACK_MS)) {
            alice.on_packet(ack, now);
        }
        assert!(alice.is_established());
        (alice, bob)
    }

    #[test]
    fn test_connect_and_deliver() {
        let (_, mut bob) = connect();
        let mut buf = [0u8; 16];
        let n = bob.read(&mut buf);
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn test_in_order_delivery_and_ack_clears_in_flight() {
        let (mut alice, mut bob) = connect();
        assert!(alice.in_flight.is_empty(), "SYN acked");

        let now = now_ms();
        alice.send(b"abc").unwrap();
        alice.send(b"def").unwrap();
        let packets = alice.pump(now);
        for packet in packets {
            for ack in bob.on_packet(packet, now).into_iter().chain(bob.on_timer(now + DELAYED_ACK_MS)) {
                alice.on_packet(ack, now + 1);
            }
        }
        let mut buf = [0u8; 16];
        let n = bob.read(&mut buf);
        assert_eq!(&buf[..n], b"abcdef");
        assert!(alice.in_flight.is_empty());
        assert!(alice.rtt_ms.is_some());
    }

    #[test]
    fn test_duplicate_and_out_of_order() {
        // scenario: last_recv at N; packets N+1, dup N+1, N+3, N+2
        let (mut alice, mut bob) = connect();
        let now = now_ms();

        alice.send(b"A").unwrap();
        let p1 = alice.pump(now).remove(0);
        alice.send(b"B").unwrap();
        let p2 = alice.pump(now).remove(0);
        alice.send(b"C").unwrap();
        let p3 = alice.pump(now).remove(0);

        // N+1 arrives
        assert!(bob.on_packet(p1.clone(), now).is_empty(), "no immediate ack");
        // duplicate N+1: immediate ACK with ack_through = N+1
        let acks = bob.on_packet(p1.clone(), now);
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].ack_through, p1.seq);
        assert!(acks[0].nacks.is_empty());

        // N+3 creates a gap: quick-ACK NACKing N+2
        let acks = bob.on_packet(p3.clone(), now);
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].ack_through, p3.seq);
        assert_eq!(acks[0].nacks, vec![p2.seq]);

        // N+2 fills the gap
        bob.on_packet(p2, now);
        let mut buf = [0u8; 8];
        let n = bob.read(&mut buf);
        assert_eq!(&buf[..n], b"ABC");
    }

    #[test]
    fn test_window_halves_on_first_resend() {
        let (mut alice, _bob) = connect();
        let now = now_ms();
        alice.send(&[7u8; 100]).unwrap();
        let sent = alice.pump(now);
        assert!(!sent.is_empty());
        let window_before = alice.window();

        let resent = alice.on_timer(now + alice.rto_ms() + 1);
        assert!(!resent.is_empty(), "retransmission fired");
        assert!(alice.window() <= window_before / 2 + 1);
        assert!(!alice.is_terminal());
    }

    #[test]
    fn test_resend_ladder_reaches_reset() {
        let (mut alice, _bob) = connect();
        let mut now = now_ms();
        alice.send(b"doomed").unwrap();
        alice.pump(now);

        for _ in 0..MAX_RESEND_ATTEMPTS {
            now += alice.rto_ms() + 1;
            let out = alice.on_timer(now);
            if alice.status == StreamStatus::Reset {
                // the last packet is the RESET notification
                assert!(out
                    .last()
                    .map(|p| p.flags.contains(PacketFlags::RESET))
                    .unwrap_or(false));
                break;
            }
        }
        assert_eq!(alice.status, StreamStatus::Reset);
        assert!(alice.want_tunnel_switch);
        assert!(alice.want_lease_switch);
    }

    #[test]
    fn test_close_sends_signed_fin() {
        let (mut alice, mut bob) = connect();
        let now = now_ms();

        alice.send(b"last words").unwrap();
        alice.close();
        let packets = alice.pump(now);
        let fin = packets.last().unwrap();
        assert!(fin.flags.contains(PacketFlags::CLOSE));
        assert!(fin.signature.is_some());

        for packet in packets {
            for ack in bob
                .on_packet(packet, now)
                .into_iter()
                .chain(bob.on_timer(now + DELAYED_ACK_MS))
            {
                alice.on_packet(ack, now);
            }
        }
        assert_eq!(alice.status, StreamStatus::Closed);
        let mut buf = [0u8; 32];
        let n = bob.read(&mut buf);
        assert_eq!(&buf[..n], b"last words");
        assert!(bob.at_eof());
    }

    #[test]
    fn test_peer_reset_terminates() {
        let (mut alice, mut bob) = connect();
        let reset = alice.reset();
        bob.on_packet(reset, now_ms());
        assert_eq!(bob.status, StreamStatus::Reset);
    }

    #[test]
    fn test_delayed_ack_scheduled() {
        let (mut alice, mut bob) = connect();
        let now = now_ms();
        alice.send(b"x").unwrap();
        let packet = alice.pump(now).remove(0);

        assert!(bob.on_packet(packet, now).is_empty());
        assert!(bob.next_timer_ms().is_some());
        let acks = bob.on_timer(now + DELAYED_ACK_MS);
        assert_eq!(acks.len(), 1, "delayed ACK fired");
        assert!(bob.on_timer(now + 2 * DELAYED_ACK_MS).is_empty(), "one shot");
    }
}
