//! # Cadence Wire Format
//!
//! Fixed-width, big-endian, unpadded packet header followed by the payload.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  Version (8)  |   Role (8)    |     Sequence Number (32) ...  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  ... Sequence |              Block ID (32) ...                |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  ... Block ID |      Position (16)            | Source N (16) |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | ... Source N  |      Repair M (16)            | Payload Len   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | ... Len       |           Timestamp (32, samples) ...         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  ... Timestamp|               Payload ...                     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Every packet carries its block geometry (N, M) so the receiver can size a
//! block from whichever packet arrives first.
//!
//! The timestamp is the last header field, not a trailer: all fixed-width
//! fields sit in the first [`HEADER_LEN`] bytes and the payload always
//! starts at that offset. Nothing follows the payload; bytes past
//! `payload_len` are ignored.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use crate::error::{Result, TransportError};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Header size: 1 + 1 + 4 + 4 + 2 + 2 + 2 + 2 + 4.
pub const HEADER_LEN: usize = 22;

/// Upper bound on N + M, set by the GF(2^8) code.
pub const MAX_BLOCK_PACKETS: usize = 256;

/// Maximum payload in a single packet.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

// ─── Role ────────────────────────────────────────────────────────────────────

/// Whether a packet carries original samples or FEC redundancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Role {
    Source = 0,
    Repair = 1,
}

impl Role {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Role::Source),
            1 => Some(Role::Repair),
            _ => None,
        }
    }
}

// ─── Packet Header ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub role: Role,
    /// Per-stream packet counter, wraps.
    pub sequence: u32,
    /// Block counter, +1 per block, wraps.
    pub block_id: u32,
    /// Index within the block: `0..N` sources, `N..N+M` repairs.
    pub position: u16,
    pub source_count: u16,
    pub repair_count: u16,
    pub payload_len: u16,
    /// Stream position in samples per channel of the first sample. Repair
    /// packets carry the timestamp of their block's first source.
    pub timestamp: u32,
}

impl PacketHeader {
    /// Serialize the header. `buf` must have at least [`HEADER_LEN`] bytes
    /// of room.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.role as u8);
        buf.put_u32(self.sequence);
        buf.put_u32(self.block_id);
        buf.put_u16(self.position);
        buf.put_u16(self.source_count);
        buf.put_u16(self.repair_count);
        buf.put_u16(self.payload_len);
        buf.put_u32(self.timestamp);
    }

    /// Parse and validate a header.
    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < HEADER_LEN {
            return Err(TransportError::MalformedPacket("truncated header"));
        }
        if buf.get_u8() != PROTOCOL_VERSION {
            return Err(TransportError::MalformedPacket("unknown version"));
        }
        let role = Role::from_byte(buf.get_u8())
            .ok_or(TransportError::MalformedPacket("unknown role"))?;
        let header = PacketHeader {
            role,
            sequence: buf.get_u32(),
            block_id: buf.get_u32(),
            position: buf.get_u16(),
            source_count: buf.get_u16(),
            repair_count: buf.get_u16(),
            payload_len: buf.get_u16(),
            timestamp: buf.get_u32(),
        };
        header.validate()?;
        Ok(header)
    }

    fn validate(&self) -> Result<()> {
        if self.source_count == 0 {
            return Err(TransportError::MalformedPacket("empty block"));
        }
        if self.block_len() > MAX_BLOCK_PACKETS {
            return Err(TransportError::MalformedPacket("block too large"));
        }
        if self.position as usize >= self.block_len() {
            return Err(TransportError::MalformedPacket("position outside block"));
        }
        let expected = if self.position < self.source_count {
            Role::Source
        } else {
            Role::Repair
        };
        if self.role != expected {
            return Err(TransportError::MalformedPacket("role does not match position"));
        }
        Ok(())
    }

    /// N + M.
    pub fn block_len(&self) -> usize {
        self.source_count as usize + self.repair_count as usize
    }
}

// ─── Packet ─────────────────────────────────────────────────────────────────

/// A header plus its payload slice. Immutable once built; clones share the
/// payload buffer.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    header: PacketHeader,
    payload: Bytes,
}

impl Packet {
    /// Build a packet. The header's `payload_len` is taken from `payload`.
    pub fn new(mut header: PacketHeader, payload: Bytes) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(TransportError::MalformedPacket("payload too large"));
        }
        header.payload_len = payload.len() as u16;
        header.validate()?;
        Ok(Packet { header, payload })
    }

    /// Decode a datagram. The payload is a zero-copy slice of `data`;
    /// trailing bytes past the declared payload length are ignored.
    pub fn decode(mut data: Bytes) -> Result<Self> {
        let header = PacketHeader::decode(&mut data)?;
        let payload_len = header.payload_len as usize;
        if data.remaining() < payload_len {
            return Err(TransportError::MalformedPacket("truncated payload"));
        }
        let payload = data.split_to(payload_len);
        Ok(Packet { header, payload })
    }

    /// Serialize header and payload into a new buffer.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.header.encode(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    pub fn header(&self) -> &PacketHeader {
        &self.header
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    pub fn sequence(&self) -> u32 {
        self.header.sequence
    }

    pub fn block_id(&self) -> u32 {
        self.header.block_id
    }

    pub fn position(&self) -> u16 {
        self.header.position
    }

    pub fn role(&self) -> Role {
        self.header.role
    }

    pub fn timestamp(&self) -> u32 {
        self.header.timestamp
    }

    pub fn is_source(&self) -> bool {
        self.header.role == Role::Source
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("seq", &self.header.sequence)
            .field("block", &self.header.block_id)
            .field("pos", &self.header.position)
            .field("role", &self.header.role)
            .field("len", &self.payload.len())
            .finish()
    }
}
