//! Frame-level wire primitives: message types, flag bits, message numbers,
//! and the per-frame header.
//!
//! Every frame carried by the transport starts with a varint message number
//! followed by a single flags byte; the low three bits of that byte encode
//! the [`MessageType`] and the remaining bits are individual [`FrameFlags`].
//! Varints are little-endian base-128 with the continuation bit in the MSB,
//! at most [`MAX_VARINT_LEN`] bytes for a 64-bit value.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use derive_more::Display;
use integer_encoding::VarInt;

use crate::error::{BlipError, Result};

/// Maximum encoded length of a 64-bit varint.
pub const MAX_VARINT_LEN: usize = 10;

/// Bits of the flags byte that carry the [`MessageType`].
const TYPE_MASK: u8 = 0b0000_0111;

/// Kind of message carried by a frame.
///
/// Values are fixed by the wire protocol; 3, 6 and 7 are unassigned and
/// malformed on receipt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// A request expecting a reply unless flagged no-reply.
    Request = 0,
    /// A successful reply, numbered after its request.
    Response = 1,
    /// An error reply, numbered after its request.
    Error = 2,
    /// Flow-control acknowledgement for a peer request.
    AckRequest = 4,
    /// Flow-control acknowledgement for a peer response.
    AckResponse = 5,
}

impl MessageType {
    /// Decode a type from the low bits of a flags byte.
    pub(crate) fn from_flags_byte(byte: u8) -> Result<Self> {
        match byte & TYPE_MASK {
            0 => Ok(Self::Request),
            1 => Ok(Self::Response),
            2 => Ok(Self::Error),
            4 => Ok(Self::AckRequest),
            5 => Ok(Self::AckResponse),
            _ => Err(BlipError::MalformedFrame),
        }
    }

    /// Whether this is one of the two acknowledgement types.
    #[must_use]
    pub const fn is_ack(self) -> bool {
        matches!(self, Self::AckRequest | Self::AckResponse)
    }

    /// Whether this message travels on the reply side of a request/response
    /// pair. Error replies count as responses.
    #[must_use]
    pub const fn is_response_class(self) -> bool {
        matches!(self, Self::Response | Self::Error)
    }
}

bitflags! {
    /// Flag bits carried alongside the [`MessageType`] in each frame's flags
    /// byte. Bit 7 is reserved and must be zero on the wire.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct FrameFlags: u8 {
        /// Payload is compressed. Reserved: rejected on both paths.
        const COMPRESSED = 0b0000_1000;
        /// Scheduled ahead of normal messages at frame boundaries.
        const URGENT = 0b0001_0000;
        /// The sender does not want a reply.
        const NO_REPLY = 0b0010_0000;
        /// More frames of this message follow.
        const MORE_COMING = 0b0100_0000;
    }
}

/// Identifier of a logical message, assigned monotonically per direction
/// starting at 1. A reply reuses its request's number on the opposite
/// direction. Zero is reserved and invalid on the wire.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("#{_0}")]
pub struct MessageNumber(u64);

impl MessageNumber {
    /// Create a message number.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Return the inner numeric value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Parsed header of one frame: `varint message-number | byte flags`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    /// Message this frame belongs to.
    pub number: MessageNumber,
    /// Message type from the low bits of the flags byte.
    pub ty: MessageType,
    /// Remaining flag bits.
    pub flags: FrameFlags,
}

impl FrameHeader {
    /// Encoded size of this header in bytes.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        self.number.get().required_space() + 1
    }

    /// Append the encoded header to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        put_uvarint(dst, self.number.get());
        dst.put_u8(self.ty as u8 | self.flags.bits());
    }

    /// Parse a header from the front of `frame`, consuming the header bytes.
    ///
    /// # Errors
    ///
    /// Returns [`BlipError::MalformedFrame`] on a truncated varint, a zero
    /// message number, an unassigned type value, or reserved flag bits.
    pub fn decode(frame: &mut Bytes) -> Result<Self> {
        let (number, consumed) = get_uvarint(frame).ok_or(BlipError::MalformedFrame)?;
        if number == 0 {
            return Err(BlipError::MalformedFrame);
        }
        if frame.len() <= consumed {
            return Err(BlipError::MalformedFrame);
        }
        frame.advance(consumed);
        let byte = frame.get_u8();
        let ty = MessageType::from_flags_byte(byte)?;
        let flags =
            FrameFlags::from_bits(byte & !TYPE_MASK).ok_or(BlipError::MalformedFrame)?;
        Ok(Self { number: MessageNumber::new(number), ty, flags })
    }
}

/// Append `value` to `dst` as a varint.
pub fn put_uvarint(dst: &mut BytesMut, value: u64) {
    let mut buf = [0u8; MAX_VARINT_LEN];
    let len = value.encode_var(&mut buf);
    dst.put_slice(&buf[..len]);
}

/// Decode a varint from the front of `src`, returning the value and the
/// number of bytes consumed. `None` if `src` does not hold a complete varint.
#[must_use]
pub fn get_uvarint(src: &[u8]) -> Option<(u64, usize)> {
    u64::decode_var(src)
}
