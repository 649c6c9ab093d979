use crate::error::{ParloError, Result};
use bytes::BufMut;
use std::fmt::{Debug, Formatter};

/// Upper bound for a single chunk handed to the processing buffer and for a
/// single send call. Frames on the wire may be up to four bytes longer
/// because of the header.
pub const MAX_PACKET_SIZE: usize = 1024;

/// Header length of a stream frame: id, compressed flag, u16 length.
pub const HEADER_LEN_STANDARD: usize = 4;

/// Header length of the datagram frame variant, which carries an extra
/// reliability flag between the compressed flag and the length.
pub const HEADER_LEN_DATAGRAM: usize = 5;

/// A single framed message. Immutable once constructed; the constructors
/// enforce that the payload is non-empty and that the total frame length
/// fits the 16-bit length field.
///
/// The length field counts the header too, so a frame is self-describing:
/// a receiver that has the header knows exactly how many payload bytes to
/// wait for.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    id: u8,
    compressed: bool,
    /// `Some` marks the datagram variant. Reassembly of that variant is not
    /// part of the stream path; the flag only exists on the wire.
    reliable: Option<bool>,
    payload: Vec<u8>,
}

impl Debug for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Packet{{id:{:#04x},compressed:{},len:{}}}",
            self.id,
            self.compressed,
            self.frame_len(),
        )
    }
}

impl Packet {
    /// Creates a frame for stream transmission (4-byte header).
    pub fn new(id: u8, payload: Vec<u8>, compressed: bool) -> Result<Packet> {
        Self::checked(id, payload, compressed, None, HEADER_LEN_STANDARD)
    }

    /// Creates a frame in the datagram variant (5-byte header with a
    /// reliability flag).
    pub fn new_datagram(id: u8, payload: Vec<u8>, compressed: bool, reliable: bool) -> Result<Packet> {
        Self::checked(id, payload, compressed, Some(reliable), HEADER_LEN_DATAGRAM)
    }

    fn checked(
        id: u8,
        payload: Vec<u8>,
        compressed: bool,
        reliable: Option<bool>,
        header_len: usize,
    ) -> Result<Packet> {
        if payload.is_empty() {
            return Err(ParloError::InvalidArgument("packet payload must not be empty"));
        }
        if header_len + payload.len() > u16::MAX as usize {
            return Err(ParloError::Overflow {
                size: header_len + payload.len(),
                max: u16::MAX as usize,
            });
        }

        Ok(Packet {
            id,
            compressed,
            reliable,
            payload,
        })
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn header_len(&self) -> usize {
        if self.reliable.is_some() {
            HEADER_LEN_DATAGRAM
        }
        else {
            HEADER_LEN_STANDARD
        }
    }

    /// Total frame length including the header, i.e. the value of the wire
    /// length field.
    pub fn frame_len(&self) -> u16 {
        (self.header_len() + self.payload.len()) as u16
    }

    /// Serializes the frame for transmission: id, compressed flag, the
    /// reliability flag for the datagram variant, the little-endian length,
    /// then the payload. Cannot fail - the constructors validated the length.
    pub fn build(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.header_len() + self.payload.len());
        buf.put_u8(self.id);
        buf.put_u8(self.compressed as u8);
        if let Some(reliable) = self.reliable {
            buf.put_u8(reliable as u8);
        }
        buf.put_u16_le(self.frame_len());
        buf.put_slice(&self.payload);
        buf
    }
}
