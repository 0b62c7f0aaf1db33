//! Packet framing.
//!
//! Every packet starts with an 8-byte header:
//!
//! | bytes | field                                   |
//! |-------|-----------------------------------------|
//! | 0..4  | total length, header included (u32 BE)  |
//! | 4     | packet type                             |
//! | 5     | flags ([`END_OF_MESSAGE`] on the last)  |
//! | 6..8  | sequence number (u16 BE)                |
//!
//! Messages larger than the negotiated SDU are split across several packets,
//! each carrying the next sequence number for its direction. Marker packets
//! are out-of-band: they carry no sequence number and never interrupt the
//! reassembly of a message in progress.

use std::fmt;
use std::time::Instant;

use tracing::trace;

use crate::error::{Error, Result};
use crate::statistics::TransferCounters;
use crate::transport::{Transport, TransportCloser};

/// Size of the packet header.
pub const HEADER_LEN: usize = 8;

/// Flag set on the terminal packet of a message.
pub const END_OF_MESSAGE: u8 = 0x01;

/// Packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    Accept = 2,
    Refuse = 4,
    Data = 6,
    Marker = 12,
}

impl TryFrom<u8> for PacketType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Connect),
            2 => Ok(Self::Accept),
            4 => Ok(Self::Refuse),
            6 => Ok(Self::Data),
            12 => Ok(Self::Marker),
            other => Err(Error::protocol(format!("unknown packet type {other}"))),
        }
    }
}

/// Out-of-band marker kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MarkerKind {
    /// Server aborted the current call; the client must answer with a reset.
    Break = 1,
    /// Acknowledges a break; the stream is back in sync.
    Reset = 2,
    /// Asynchronous interrupt of a running call.
    Interrupt = 3,
}

impl MarkerKind {
    const PAYLOAD_LEN: usize = 3;

    fn payload(self) -> [u8; Self::PAYLOAD_LEN] {
        [1, 0, self as u8]
    }

    fn parse(payload: &[u8]) -> Result<Self> {
        match payload {
            [1, 0, 1] => Ok(Self::Break),
            [1, 0, 2] => Ok(Self::Reset),
            [1, 0, 3] => Ok(Self::Interrupt),
            other => Err(Error::protocol(format!("malformed marker payload {other:?}"))),
        }
    }
}

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub length: u32,
    pub packet_type: PacketType,
    pub flags: u8,
    pub sequence: u16,
}

impl PacketHeader {
    /// Serialize to wire form.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.length.to_be_bytes());
        out[4] = self.packet_type as u8;
        out[5] = self.flags;
        out[6..8].copy_from_slice(&self.sequence.to_be_bytes());
        out
    }

    /// Parse and validate a header against the largest acceptable packet.
    pub fn parse(bytes: &[u8; HEADER_LEN], max_packet: u32) -> Result<Self> {
        let length = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if (length as usize) < HEADER_LEN {
            return Err(Error::protocol(format!(
                "packet length {length} is shorter than the header"
            )));
        }
        if length > max_packet {
            return Err(Error::protocol(format!(
                "packet length {length} exceeds the negotiated maximum {max_packet}"
            )));
        }
        Ok(Self {
            length,
            packet_type: PacketType::try_from(bytes[4])?,
            flags: bytes[5],
            sequence: u16::from_be_bytes([bytes[6], bytes[7]]),
        })
    }

    /// True on the last packet of a message.
    #[must_use]
    pub const fn is_end_of_message(&self) -> bool {
        self.flags & END_OF_MESSAGE != 0
    }

    const fn payload_len(&self) -> usize {
        self.length as usize - HEADER_LEN
    }
}

/// One received packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Vec<u8>,
}

/// Splits outbound messages into sequenced packets.
#[derive(Debug)]
pub struct PacketWriter {
    sdu: u32,
    next_sequence: u16,
}

impl PacketWriter {
    #[must_use]
    pub const fn new(sdu: u32) -> Self {
        Self {
            sdu,
            next_sequence: 0,
        }
    }

    pub const fn set_sdu(&mut self, sdu: u32) {
        self.sdu = sdu;
    }

    /// Sequence number the next data packet will carry.
    #[must_use]
    pub const fn next_sequence(&self) -> u16 {
        self.next_sequence
    }

    /// Append the packets for `message` to `out` and return how many were
    /// written. An empty message still produces one header-only packet.
    pub fn frame(&mut self, packet_type: PacketType, message: &[u8], out: &mut Vec<u8>) -> usize {
        let max_payload = (self.sdu as usize).saturating_sub(HEADER_LEN).max(1);
        let mut chunks = message.chunks(max_payload).peekable();
        if chunks.peek().is_none() {
            self.push_packet(packet_type, END_OF_MESSAGE, &[], out);
            return 1;
        }

        let mut count = 0;
        while let Some(chunk) = chunks.next() {
            let flags = if chunks.peek().is_none() {
                END_OF_MESSAGE
            } else {
                0
            };
            self.push_packet(packet_type, flags, chunk, out);
            count += 1;
        }
        count
    }

    /// Append a marker packet. Markers carry sequence 0 and do not advance
    /// the counter.
    pub fn frame_marker(kind: MarkerKind, out: &mut Vec<u8>) {
        let payload = kind.payload();
        let header = PacketHeader {
            length: (HEADER_LEN + payload.len()) as u32,
            packet_type: PacketType::Marker,
            flags: END_OF_MESSAGE,
            sequence: 0,
        };
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(&payload);
    }

    fn push_packet(&mut self, packet_type: PacketType, flags: u8, payload: &[u8], out: &mut Vec<u8>) {
        let header = PacketHeader {
            length: (HEADER_LEN + payload.len()) as u32,
            packet_type,
            flags,
            sequence: self.next_sequence,
        };
        self.next_sequence = self.next_sequence.wrapping_add(1);
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(payload);
    }
}

/// Outcome of feeding one packet to the [`Reassembler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// More packets are needed to complete the message.
    Incomplete,
    /// An out-of-band marker.
    Marker(MarkerKind),
    /// A complete message.
    Message {
        packet_type: PacketType,
        payload: Vec<u8>,
    },
}

/// Reassembles inbound packets into messages, enforcing sequence order.
#[derive(Debug, Default)]
pub struct Reassembler {
    expected_sequence: u16,
    partial: Option<(PacketType, Vec<u8>)>,
}

impl Reassembler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept the next packet in arrival order.
    pub fn push(&mut self, packet: Packet) -> Result<Inbound> {
        let Packet { header, payload } = packet;
        if header.packet_type == PacketType::Marker {
            return MarkerKind::parse(&payload).map(Inbound::Marker);
        }

        if header.sequence != self.expected_sequence {
            return Err(Error::protocol(format!(
                "out-of-order packet: expected sequence {}, got {}",
                self.expected_sequence, header.sequence
            )));
        }
        self.expected_sequence = self.expected_sequence.wrapping_add(1);

        if let Some((partial_type, buffer)) = self.partial.as_mut() {
            if *partial_type != header.packet_type {
                return Err(Error::protocol(format!(
                    "packet type changed from {partial_type:?} to {:?} inside a message",
                    header.packet_type
                )));
            }
            buffer.extend_from_slice(&payload);
        } else {
            self.partial = Some((header.packet_type, payload));
        }

        if !header.is_end_of_message() {
            return Ok(Inbound::Incomplete);
        }
        match self.partial.take() {
            Some((packet_type, payload)) => Ok(Inbound::Message {
                packet_type,
                payload,
            }),
            None => Ok(Inbound::Incomplete),
        }
    }

    /// True while a message is partially assembled.
    #[must_use]
    pub const fn in_progress(&self) -> bool {
        self.partial.is_some()
    }
}

/// A reassembled message or a marker, as seen by the session layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Marker(MarkerKind),
    Message {
        packet_type: PacketType,
        payload: Vec<u8>,
    },
}

/// Packet-level connection: a transport plus per-direction sequencing.
pub struct Framer {
    transport: Transport,
    writer: PacketWriter,
    reassembler: Reassembler,
    sdu: u32,
    inbound: Vec<u8>,
    outbound: Vec<u8>,
    counters: TransferCounters,
}

impl fmt::Debug for Framer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Framer")
            .field("transport", &self.transport)
            .field("sdu", &self.sdu)
            .field("next_sequence", &self.writer.next_sequence())
            .finish_non_exhaustive()
    }
}

impl Framer {
    #[must_use]
    pub fn new(transport: Transport, sdu: u32) -> Self {
        Self {
            transport,
            writer: PacketWriter::new(sdu),
            reassembler: Reassembler::new(),
            sdu,
            inbound: Vec::with_capacity(sdu as usize),
            outbound: Vec::with_capacity(sdu as usize),
            counters: TransferCounters::default(),
        }
    }

    /// Switch to the negotiated SDU.
    pub const fn set_sdu(&mut self, sdu: u32) {
        self.sdu = sdu;
        self.writer.set_sdu(sdu);
    }

    #[must_use]
    pub const fn sdu(&self) -> u32 {
        self.sdu
    }

    /// Frame and send a whole message.
    pub fn send_message(&mut self, packet_type: PacketType, message: &[u8]) -> Result<()> {
        self.outbound.clear();
        let packets = self.writer.frame(packet_type, message, &mut self.outbound);
        trace!(?packet_type, bytes = message.len(), packets, "sending message");
        self.transport.send(&self.outbound)?;
        self.counters.record_sent(self.outbound.len(), packets);
        Ok(())
    }

    /// Send an out-of-band marker.
    pub fn send_marker(&mut self, kind: MarkerKind) -> Result<()> {
        self.outbound.clear();
        PacketWriter::frame_marker(kind, &mut self.outbound);
        trace!(?kind, "sending marker");
        self.transport.send(&self.outbound)?;
        self.counters.record_sent(self.outbound.len(), 1);
        Ok(())
    }

    /// Block until a complete message or a marker arrives.
    pub fn receive(&mut self) -> Result<Received> {
        loop {
            let packet = self.read_packet()?;
            match self.reassembler.push(packet)? {
                Inbound::Incomplete => {}
                Inbound::Marker(kind) => {
                    trace!(?kind, "received marker");
                    return Ok(Received::Marker(kind));
                }
                Inbound::Message {
                    packet_type,
                    payload,
                } => {
                    trace!(?packet_type, bytes = payload.len(), "received message");
                    return Ok(Received::Message {
                        packet_type,
                        payload,
                    });
                }
            }
        }
    }

    fn read_packet(&mut self) -> Result<Packet> {
        self.fill(HEADER_LEN)?;
        let mut raw = [0u8; HEADER_LEN];
        raw.copy_from_slice(&self.inbound[..HEADER_LEN]);
        let header = PacketHeader::parse(&raw, self.sdu)?;

        let total = header.length as usize;
        self.fill(total)?;
        let payload = self.inbound[HEADER_LEN..total].to_vec();
        self.inbound.drain(..total);
        self.counters.record_received(total);
        debug_assert_eq!(payload.len(), header.payload_len());
        Ok(Packet { header, payload })
    }

    fn fill(&mut self, needed: usize) -> Result<()> {
        let mut chunk = [0u8; 4096];
        while self.inbound.len() < needed {
            let n = self.transport.receive_into(&mut chunk)?;
            self.inbound.extend_from_slice(&chunk[..n]);
        }
        Ok(())
    }

    /// Byte and packet counters since the framer was created.
    #[must_use]
    pub const fn counters(&self) -> TransferCounters {
        self.counters
    }

    #[must_use]
    pub fn closer(&self) -> TransportCloser {
        self.transport.closer()
    }

    /// Close the underlying transport.
    pub fn close(&mut self) {
        self.transport.close();
    }

    /// Time a round trip: send the message, then wait for the reply.
    pub(crate) fn exchange(
        &mut self,
        packet_type: PacketType,
        message: &[u8],
    ) -> Result<(Received, std::time::Duration)> {
        let started = Instant::now();
        self.send_message(packet_type, message)?;
        let reply = self.receive()?;
        Ok((reply, started.elapsed()))
    }
}
