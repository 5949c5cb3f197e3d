//! Wire format for the file transfer protocol.
//!
//! Every datagram is an 11 byte header followed by the payload. All integers
//! are big-endian.
//!
//! ```text
//! offset 0:  type      (1 byte)
//! offset 1:  seq       (4 bytes)
//! offset 5:  length    (2 bytes)
//! offset 7:  checksum  (4 bytes, CRC-32 over the payload only)
//! offset 11: payload   (length bytes)
//! ```

use std::fmt;

use crc_fast::{CrcAlgorithm, checksum};
use thiserror::Error;

/// Size of the fixed header on the wire.
pub const HEADER_LEN: usize = 11;
/// Largest DATA payload, i.e. the chunk size files are split into.
pub const MAX_PAYLOAD: usize = 1024;
/// Receive buffer size. Large enough for a full header plus `MAX_PAYLOAD`.
pub const MAX_DATAGRAM: usize = 1500;
/// Largest payload that still fits a `MAX_DATAGRAM` receive buffer.
pub const MAX_CHUNK: usize = MAX_DATAGRAM - HEADER_LEN;

const OFF_TYPE: usize = 0;
const OFF_SEQ: usize = 1;
const OFF_LENGTH: usize = 5;
const OFF_CHECKSUM: usize = 7;

/// Errors raised while parsing a raw datagram.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Datagram too short: {0} bytes, header needs 11")]
    TooShort(usize),
    #[error("Declared payload length {declared} exceeds the {available} bytes available")]
    TruncatedPayload { declared: usize, available: usize },
    #[error("Unknown message type: {0:#04x}")]
    UnknownType(u8),
}

/// Message kinds carried in the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Client request; payload is the file name.
    Get = 0x01,
    /// One chunk of file content.
    Data = 0x02,
    /// Chunk `seq` passed its checksum.
    Ack = 0x03,
    /// Chunk `seq` failed its checksum.
    Nak = 0x04,
    /// Request failed; payload is a human readable reason.
    Err = 0x05,
    /// Transfer is over; payload is empty or a diagnostic.
    Fin = 0x06,
}

impl TryFrom<u8> for MessageType {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(MessageType::Get),
            0x02 => Ok(MessageType::Data),
            0x03 => Ok(MessageType::Ack),
            0x04 => Ok(MessageType::Nak),
            0x05 => Ok(MessageType::Err),
            0x06 => Ok(MessageType::Fin),
            other => Err(DecodeError::UnknownType(other)),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Get => "GET",
            MessageType::Data => "DATA",
            MessageType::Ack => "ACK",
            MessageType::Nak => "NAK",
            MessageType::Err => "ERR",
            MessageType::Fin => "FIN",
        };
        f.write_str(name)
    }
}

/// Decoded header fields, in host byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: MessageType,
    /// Chunk index for DATA/ACK/NAK, 0 for control-only messages.
    pub seq: u32,
    /// Payload byte count as declared on the wire.
    pub length: u16,
    /// CRC-32 the sender computed over the payload.
    pub checksum: u32,
}

/// A decoded datagram: header plus an owned copy of its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Whether the payload still hashes to the checksum declared in the header.
    pub fn checksum_matches(&self) -> bool {
        crc32(&self.payload) == self.header.checksum
    }

    /// Payload interpreted as text, for GET names and ERR/FIN diagnostics.
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// CRC-32 with the IEEE polynomial (a.k.a. CRC-32/ISO-HDLC, the zlib variant).
pub fn crc32(data: &[u8]) -> u32 {
    checksum(CrcAlgorithm::Crc32IsoHdlc, data) as u32
}

/// Serializes a datagram.
///
/// The length field is 16 bits wide, so payloads must not exceed `u16::MAX`
/// bytes. Peers only read [`MAX_DATAGRAM`] bytes, so anything meant to be
/// decoded stays within [`MAX_CHUNK`].
pub fn encode(kind: MessageType, seq: u32, payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() <= u16::MAX as usize);

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.push(kind as u8);
    buf.extend_from_slice(&seq.to_be_bytes());
    buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    buf.extend_from_slice(&crc32(payload).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Parses a datagram.
///
/// The declared length is checked against the buffer before slicing; any
/// bytes after `HEADER_LEN + length` are ignored. The checksum is not
/// verified here, see [`Packet::checksum_matches`].
pub fn decode(bytes: &[u8]) -> Result<Packet, DecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(DecodeError::TooShort(bytes.len()));
    }

    let kind = MessageType::try_from(bytes[OFF_TYPE])?;
    let seq = u32::from_be_bytes([
        bytes[OFF_SEQ],
        bytes[OFF_SEQ + 1],
        bytes[OFF_SEQ + 2],
        bytes[OFF_SEQ + 3],
    ]);
    let length = u16::from_be_bytes([bytes[OFF_LENGTH], bytes[OFF_LENGTH + 1]]);
    let checksum = u32::from_be_bytes([
        bytes[OFF_CHECKSUM],
        bytes[OFF_CHECKSUM + 1],
        bytes[OFF_CHECKSUM + 2],
        bytes[OFF_CHECKSUM + 3],
    ]);

    let payload = bytes
        .get(HEADER_LEN..HEADER_LEN + length as usize)
        .ok_or(DecodeError::TruncatedPayload {
            declared: length as usize,
            available: bytes.len() - HEADER_LEN,
        })?;

    Ok(Packet {
        header: Header {
            kind,
            seq,
            length,
            checksum,
        },
        payload: payload.to_vec(),
    })
}
