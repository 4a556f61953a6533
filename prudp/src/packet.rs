//! Wire-format definitions for PRUDP packets.
//!
//! Every datagram exchanged between peers is a [`Packet`].  This module is
//! responsible for:
//! - Defining the version-0 binary layout (header fields, flags, payload).
//! - Detecting the protocol version from the leading bytes of a buffer.
//! - Serialising a [`Packet`] and computing / verifying its checksum.
//! - Building handshake packets and acknowledgements.
//!
//! No I/O happens here.
//!
//! # Version-0 wire format
//!
//! All multi-byte integers are **little-endian**.
//!
//! ```text
//!  off  size  field
//!  0    1     source channel
//!  1    1     destination channel
//!  2    2     type (low 4 bits) | flags (high 12 bits)
//!  4    1     session id
//!  5    4     packet signature
//!  9    2     sequence id
//!  11   4     connection signature      SYN / CONNECT only
//!  ..   1     fragment id               DATA only
//!  ..   2     payload size              HAS_SIZE only
//!  ..   n     payload                   HAS_SIZE, or DATA without ACK
//!  last 1     checksum
//! ```

use bitflags::bitflags;
use thiserror::Error;

use crate::identity::random_signature;

/// Length of both signatures in a version-0 packet.
pub const SIGNATURE_LEN: usize = 4;

/// Fixed-length signature carried in the packet and connection signature fields.
pub type Signature = [u8; SIGNATURE_LEN];

/// Packet signature written into every DATA acknowledgement.
pub const DATA_ACK_SIGNATURE: Signature = [0x12, 0x34, 0x56, 0x78];

/// Leading bytes of a tagged (version ≥ 1) packet; the version follows them.
const VERSION_TAG: [u8; 2] = [0xEA, 0xD0];

/// Smallest possible version-0 packet: a header with no optional fields.
const V0_MIN_LEN: usize = 12;

const TYPE_MASK: u16 = 0x000F;
const FLAGS_SHIFT: u16 = 4;
const FLAGS_MASK: u16 = 0x0FFF;

// ---------------------------------------------------------------------------
// Packet type and flags
// ---------------------------------------------------------------------------

/// The 4-bit packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Syn,
    Connect,
    Data,
    Disconnect,
    Ping,
    /// A type value this implementation does not know how to handle.
    Unknown(u8),
}

impl PacketType {
    pub fn from_nibble(value: u8) -> Self {
        match value & 0x0F {
            0 => Self::Syn,
            1 => Self::Connect,
            2 => Self::Data,
            3 => Self::Disconnect,
            4 => Self::Ping,
            other => Self::Unknown(other),
        }
    }

    pub fn to_nibble(self) -> u8 {
        match self {
            Self::Syn => 0,
            Self::Connect => 1,
            Self::Data => 2,
            Self::Disconnect => 3,
            Self::Ping => 4,
            Self::Unknown(value) => value & 0x0F,
        }
    }

    /// SYN and CONNECT packets carry a connection signature on the wire.
    pub fn carries_connection_signature(self) -> bool {
        matches!(self, Self::Syn | Self::Connect)
    }
}

bitflags! {
    /// Flag bits stored in the upper 12 bits of the type/flags field.
    ///
    /// Every flag is an independent power of two so that any combination can
    /// be represented unambiguously.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PacketFlags: u16 {
        const ACK = 0x001;
        const RELIABLE = 0x002;
        const NEED_ACK = 0x004;
        const HAS_SIZE = 0x008;
        const MULTI_ACK = 0x200;
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while parsing, serialising, or building packets.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    /// The buffer does not hold a well-formed packet.
    #[error("invalid packet structure: {0}")]
    Parse(&'static str),
    /// The buffer is tagged with a version whose layout is not implemented.
    #[error("unsupported packet version {0}")]
    UnsupportedVersion(u8),
    /// A field has the wrong size or is missing.
    #[error("invalid packet field: {0}")]
    Validation(String),
    /// The requested operation is not defined for this packet.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

// ---------------------------------------------------------------------------
// Version detection
// ---------------------------------------------------------------------------

fn is_v0_channel(byte: u8) -> bool {
    (0xA0..=0xAF).contains(&byte)
}

/// `true` when both leading bytes fall in the version-0 channel range.
pub fn is_version0(buf: &[u8]) -> bool {
    matches!(buf, [a, b, ..] if is_v0_channel(*a) && is_v0_channel(*b))
}

/// Read the protocol version from the leading bytes of `buf`.
pub fn detect_version(buf: &[u8]) -> Result<u8, PacketError> {
    match buf {
        [0xA1, 0xAF, ..] | [0xAF, 0xA1, ..] => Ok(0),
        [a, b, version, ..] if [*a, *b] == VERSION_TAG => Ok(*version),
        _ if is_version0(buf) => Ok(0),
        _ => Err(PacketError::Parse("unrecognized leading bytes")),
    }
}

// ---------------------------------------------------------------------------
// Checksum
// ---------------------------------------------------------------------------

/// Version-0 checksum over `data` (the serialised packet minus its checksum
/// byte) with the one-byte access `key`.
///
/// Complete little-endian 32-bit words are summed modulo 2³²; the bytes of
/// that sum are added to the key and to the 0–3 trailing bytes that do not
/// form a word.
pub fn checksum(data: &[u8], key: u8) -> u8 {
    let words = data.chunks_exact(4);
    let trailing: u32 = words.remainder().iter().map(|&b| u32::from(b)).sum();
    let word_sum = words.fold(0u32, |acc, w| {
        acc.wrapping_add(u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
    });
    let folded: u32 = word_sum.to_le_bytes().iter().map(|&b| u32::from(b)).sum();

    ((u32::from(key) + trailing + folded) & 0xFF) as u8
}

// ---------------------------------------------------------------------------
// Packet
// ---------------------------------------------------------------------------

/// One PRUDP protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub version: u8,
    pub source: u8,
    pub destination: u8,
    pub packet_type: PacketType,
    pub flags: PacketFlags,
    pub session_id: u8,
    pub packet_signature: Signature,
    /// Assigned by the connection at send time for non-ack packets.
    pub sequence_id: u16,
    /// Only meaningful for DATA packets.
    pub fragment_id: u8,
    /// Present on SYN and CONNECT packets only.
    pub connection_signature: Option<Signature>,
    pub payload: Vec<u8>,
    pub checksum: u8,
}

/// Caller-supplied fields for [`Packet::ack`].
#[derive(Debug, Clone, Default)]
pub struct AckOptions {
    pub session_id: Option<u8>,
    pub connection_signature: Option<Vec<u8>>,
    pub packet_signature: Option<Vec<u8>>,
}

impl Packet {
    /// A version-0 packet of `packet_type` with empty flags and zeroed fields.
    pub fn new(packet_type: PacketType, source: u8, destination: u8) -> Self {
        Self {
            version: 0,
            source,
            destination,
            packet_type,
            flags: PacketFlags::empty(),
            session_id: 0,
            packet_signature: [0; SIGNATURE_LEN],
            sequence_id: 0,
            fragment_id: 0,
            connection_signature: packet_type
                .carries_connection_signature()
                .then_some([0; SIGNATURE_LEN]),
            payload: Vec::new(),
            checksum: 0,
        }
    }

    /// Handshake initiation.
    pub fn syn(local_channel: u8, remote_channel: u8) -> Self {
        let mut packet = Self::new(PacketType::Syn, local_channel, remote_channel);
        packet.flags = PacketFlags::NEED_ACK;
        packet
    }

    /// Second leg of the client handshake; always sequence id 1.
    pub fn connect(
        local_channel: u8,
        remote_channel: u8,
        connection_signature: Signature,
        packet_signature: Signature,
    ) -> Self {
        let mut packet = Self::new(PacketType::Connect, local_channel, remote_channel);
        packet.flags = PacketFlags::NEED_ACK | PacketFlags::RELIABLE;
        packet.connection_signature = Some(connection_signature);
        packet.packet_signature = packet_signature;
        packet.sequence_id = 1;
        packet
    }

    /// A single-fragment reliable DATA packet.
    pub fn data(local_channel: u8, remote_channel: u8, payload: Vec<u8>) -> Self {
        let mut packet = Self::new(PacketType::Data, local_channel, remote_channel);
        packet.flags = PacketFlags::NEED_ACK | PacketFlags::RELIABLE;
        packet.payload = payload;
        packet
    }

    pub fn disconnect(local_channel: u8, remote_channel: u8) -> Self {
        let mut packet = Self::new(PacketType::Disconnect, local_channel, remote_channel);
        packet.flags = PacketFlags::NEED_ACK | PacketFlags::RELIABLE;
        packet
    }

    pub fn has_flag(&self, flag: PacketFlags) -> bool {
        self.flags.contains(flag)
    }

    /// `true` for ACK and MULTI_ACK packets, which never get a fresh sequence id.
    pub fn is_ack(&self) -> bool {
        self.flags
            .intersects(PacketFlags::ACK | PacketFlags::MULTI_ACK)
    }

    /// `true` when the packet must sit in the congestion window until acked.
    pub fn requires_tracking(&self) -> bool {
        !self.is_ack()
            && self
                .flags
                .intersects(PacketFlags::NEED_ACK | PacketFlags::RELIABLE)
    }

    /// Version 0 is the only version carrying a checksum byte.
    pub fn implements_checksum(&self) -> bool {
        self.version == 0
    }

    // -----------------------------------------------------------------------
    // Parsing
    // -----------------------------------------------------------------------

    /// Parse a [`Packet`] from a raw datagram.
    ///
    /// The checksum byte is stored but **not** verified; see
    /// [`Packet::verify_checksum`].
    pub fn parse(buf: &[u8]) -> Result<Self, PacketError> {
        match detect_version(buf)? {
            0 => Self::parse_v0(buf),
            version => Err(PacketError::UnsupportedVersion(version)),
        }
    }

    fn parse_v0(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < V0_MIN_LEN {
            return Err(PacketError::Parse("buffer shorter than a header"));
        }
        let mut cursor = Cursor::new(buf);

        let source = cursor.u8()?;
        let destination = cursor.u8()?;
        let type_flags = cursor.u16_le()?;
        let packet_type = PacketType::from_nibble((type_flags & TYPE_MASK) as u8);
        let flags = PacketFlags::from_bits_retain(type_flags >> FLAGS_SHIFT);
        let session_id = cursor.u8()?;
        let packet_signature = cursor.signature()?;
        let sequence_id = cursor.u16_le()?;

        let connection_signature = if packet_type.carries_connection_signature() {
            Some(cursor.signature()?)
        } else {
            None
        };
        let fragment_id = if packet_type == PacketType::Data {
            cursor.u8()?
        } else {
            0
        };

        let payload = if flags.contains(PacketFlags::HAS_SIZE) {
            let size = cursor.u16_le()? as usize;
            cursor.take(size)?.to_vec()
        } else if packet_type == PacketType::Data && !flags.contains(PacketFlags::ACK) {
            let size = cursor
                .remaining()
                .checked_sub(1)
                .ok_or(PacketError::Parse("missing checksum"))?;
            cursor.take(size)?.to_vec()
        } else {
            Vec::new()
        };

        let checksum = cursor.u8()?;
        if cursor.remaining() != 0 {
            return Err(PacketError::Parse("trailing bytes after checksum"));
        }

        Ok(Self {
            version: 0,
            source,
            destination,
            packet_type,
            flags,
            session_id,
            packet_signature,
            sequence_id,
            fragment_id,
            connection_signature,
            payload,
            checksum,
        })
    }

    // -----------------------------------------------------------------------
    // Serialisation
    // -----------------------------------------------------------------------

    /// Serialise every field up to, but excluding, the checksum byte.
    fn encode_body(&self) -> Result<Vec<u8>, PacketError> {
        if self.version != 0 {
            return Err(PacketError::UnsupportedVersion(self.version));
        }

        let mut buf = Vec::with_capacity(V0_MIN_LEN + SIGNATURE_LEN + 3 + self.payload.len());
        buf.push(self.source);
        buf.push(self.destination);
        let type_flags = ((self.flags.bits() & FLAGS_MASK) << FLAGS_SHIFT)
            | u16::from(self.packet_type.to_nibble());
        buf.extend_from_slice(&type_flags.to_le_bytes());
        buf.push(self.session_id);
        buf.extend_from_slice(&self.packet_signature);
        buf.extend_from_slice(&self.sequence_id.to_le_bytes());

        if self.packet_type.carries_connection_signature() {
            let signature = self.connection_signature.ok_or_else(|| {
                PacketError::Validation(format!(
                    "{:?} packet requires a connection signature",
                    self.packet_type
                ))
            })?;
            buf.extend_from_slice(&signature);
        }
        if self.packet_type == PacketType::Data {
            buf.push(self.fragment_id);
        }

        if self.has_flag(PacketFlags::HAS_SIZE) {
            let size = u16::try_from(self.payload.len()).map_err(|_| {
                PacketError::Validation(format!("payload of {} bytes", self.payload.len()))
            })?;
            buf.extend_from_slice(&size.to_le_bytes());
            buf.extend_from_slice(&self.payload);
        } else if self.packet_type == PacketType::Data && !self.has_flag(PacketFlags::ACK) {
            buf.extend_from_slice(&self.payload);
        } else if !self.payload.is_empty() {
            return Err(PacketError::Validation(
                "payload requires the HAS_SIZE flag".into(),
            ));
        }

        Ok(buf)
    }

    /// Serialise the packet with its currently stored checksum byte.
    pub fn to_bytes(&self) -> Result<Vec<u8>, PacketError> {
        let mut buf = self.encode_body()?;
        buf.push(self.checksum);
        Ok(buf)
    }

    /// Checksum of the packet as it would currently be serialised.
    pub fn compute_checksum(&self, key: u8) -> Result<u8, PacketError> {
        Ok(checksum(&self.encode_body()?, key))
    }

    /// Recompute and store the checksum, returning the bytes ready to transmit.
    pub fn seal(&mut self, key: u8) -> Result<Vec<u8>, PacketError> {
        let mut buf = self.encode_body()?;
        self.checksum = checksum(&buf, key);
        buf.push(self.checksum);
        Ok(buf)
    }

    /// `true` when the stored checksum matches a fresh computation.
    pub fn verify_checksum(&self, key: u8) -> bool {
        self.compute_checksum(key)
            .map(|expected| expected == self.checksum)
            .unwrap_or(false)
    }

    // -----------------------------------------------------------------------
    // Acknowledgements
    // -----------------------------------------------------------------------

    /// Build the acknowledgement for this (received) packet.
    ///
    /// Returns `Ok(None)` when the packet did not ask for an ack.  The ack
    /// swaps channels and keeps the acknowledged sequence id.
    pub fn ack(&self, options: &AckOptions) -> Result<Option<Packet>, PacketError> {
        if !self.has_flag(PacketFlags::NEED_ACK) {
            return Ok(None);
        }

        let session_id = match (self.packet_type, options.session_id) {
            (_, Some(id)) => id,
            (PacketType::Syn, None) => 0,
            (other, None) => {
                return Err(PacketError::Protocol(format!(
                    "{other:?} acknowledgement requires a session id"
                )))
            }
        };

        let mut ack = Packet::new(self.packet_type, self.destination, self.source);
        ack.version = self.version;
        ack.flags = PacketFlags::ACK;
        ack.session_id = session_id;
        ack.sequence_id = self.sequence_id;

        match self.packet_type {
            PacketType::Syn => {
                ack.flags |= PacketFlags::HAS_SIZE;
                ack.connection_signature = Some(signature_or_random(
                    options.connection_signature.as_deref(),
                    "connection",
                )?);
                if let Some(signature) = options.packet_signature.as_deref() {
                    ack.packet_signature = to_signature(signature, "packet")?;
                }
            }
            PacketType::Connect => {
                ack.flags |= PacketFlags::HAS_SIZE;
                ack.packet_signature =
                    signature_or_random(options.packet_signature.as_deref(), "packet")?;
                if let Some(signature) = options.connection_signature.as_deref() {
                    ack.connection_signature = Some(to_signature(signature, "connection")?);
                }
            }
            PacketType::Data => {
                ack.flags |= PacketFlags::HAS_SIZE;
                ack.fragment_id = self.fragment_id;
                ack.packet_signature = DATA_ACK_SIGNATURE;
            }
            PacketType::Disconnect => {
                if let Some(signature) = options.packet_signature.as_deref() {
                    ack.packet_signature = to_signature(signature, "packet")?;
                }
            }
            PacketType::Ping => {
                // TODO: decide how PING acknowledgements are signed before
                // answering keep-alive pings.
                return Err(PacketError::Protocol(
                    "PING acknowledgement signature policy is not defined".into(),
                ));
            }
            PacketType::Unknown(value) => {
                return Err(PacketError::Protocol(format!(
                    "cannot acknowledge packet of unknown type {value}"
                )));
            }
        }

        Ok(Some(ack))
    }
}

fn to_signature(bytes: &[u8], field: &str) -> Result<Signature, PacketError> {
    Signature::try_from(bytes).map_err(|_| {
        PacketError::Validation(format!(
            "{field} signature must be {SIGNATURE_LEN} bytes, got {}",
            bytes.len()
        ))
    })
}

fn signature_or_random(bytes: Option<&[u8]>, field: &str) -> Result<Signature, PacketError> {
    match bytes {
        Some(bytes) => to_signature(bytes, field),
        None => Ok(random_signature()),
    }
}

// ---------------------------------------------------------------------------
// Cursor
// ---------------------------------------------------------------------------

/// Bounds-checked reader over a datagram.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], PacketError> {
        if n > self.remaining() {
            return Err(PacketError::Parse("truncated packet"));
        }
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8, PacketError> {
        Ok(self.take(1)?[0])
    }

    fn u16_le(&mut self) -> Result<u16, PacketError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn signature(&mut self) -> Result<Signature, PacketError> {
        let mut signature = [0u8; SIGNATURE_LEN];
        signature.copy_from_slice(self.take(SIGNATURE_LEN)?);
        Ok(signature)
    }
}
