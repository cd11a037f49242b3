//! Assembles an outbound message's flags, properties, and body into a single
//! payload buffer.
//!
//! The payload layout is `varint propertiesSize | property table | body`.
//! One byte is reserved up front for the size varint; when the properties
//! are closed the reservation is either overwritten in place (the common
//! small-table case, allocation free) or the buffer is re-copied behind a
//! wider varint.

use bytes::{Bytes, BytesMut};
use integer_encoding::VarInt;

use crate::error::{BlipError, Result};
use crate::frame::{put_uvarint, FrameFlags, MessageType, MAX_VARINT_LEN};
use crate::inbound::MessageIn;
use crate::properties::encode_string;

/// Space reserved for the common one-byte properties-size varint.
const SIZE_RESERVED: usize = 1;

/// Builder for one outbound message.
///
/// # Examples
///
/// ```
/// use blip::MessageBuilder;
///
/// let mut builder = MessageBuilder::new();
/// builder.add_property("Profile", "echo")?;
/// builder.write(b"hi");
/// let (_ty, _flags, payload) = builder.finish();
/// assert_eq!(payload[0], 7); // tokenized "Profile", NUL, "echo", NUL
/// # Ok::<(), blip::BlipError>(())
/// ```
#[derive(Debug)]
pub struct MessageBuilder {
    ty: MessageType,
    urgent: bool,
    no_reply: bool,
    compressed: bool,
    out: BytesMut,
    properties_open: bool,
}

impl Default for MessageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBuilder {
    /// Create a builder for a request message.
    #[must_use]
    pub fn new() -> Self {
        let mut out = BytesMut::new();
        out.resize(SIZE_RESERVED, 0);
        Self {
            ty: MessageType::Request,
            urgent: false,
            no_reply: false,
            compressed: false,
            out,
            properties_open: true,
        }
    }

    /// Create a builder for a reply to `request`, inheriting its urgency.
    #[must_use]
    pub fn reply_to(request: &MessageIn) -> Self {
        let mut builder = Self::new();
        builder.ty = MessageType::Response;
        builder.urgent = request.urgent();
        builder
    }

    /// Set the message type. Acknowledgement types are reserved for internal
    /// flow control; a message carrying one is rejected at submission with
    /// [`BlipError::NotAReply`](crate::error::BlipError::NotAReply).
    pub fn message_type(&mut self, ty: MessageType) -> &mut Self {
        self.ty = ty;
        self
    }

    /// Schedule this message ahead of normal-priority messages.
    pub fn urgent(&mut self, urgent: bool) -> &mut Self {
        self.urgent = urgent;
        self
    }

    /// Mark the message as wanting no reply.
    pub fn no_reply(&mut self, no_reply: bool) -> &mut Self {
        self.no_reply = no_reply;
        self
    }

    /// Set the reserved compression flag. Compression is not implemented;
    /// submitting a compressed message is rejected by the connection.
    pub fn compressed(&mut self, compressed: bool) -> &mut Self {
        self.compressed = compressed;
        self
    }

    /// Whether the builder still carries the request type.
    #[must_use]
    pub fn is_request(&self) -> bool {
        self.ty == MessageType::Request
    }

    /// The flags byte this message will carry (without `MORE_COMING`).
    #[must_use]
    pub fn flags(&self) -> FrameFlags {
        let mut flags = FrameFlags::empty();
        if self.urgent {
            flags |= FrameFlags::URGENT;
        }
        if self.no_reply {
            flags |= FrameFlags::NO_REPLY;
        }
        if self.compressed {
            flags |= FrameFlags::COMPRESSED;
        }
        flags
    }

    /// Append one property pair.
    ///
    /// # Errors
    ///
    /// Returns [`BlipError::PropertiesClosed`] once body bytes have been
    /// written, or [`BlipError::InvalidProperty`] for strings that cannot be
    /// represented on the wire.
    pub fn add_property(&mut self, name: &str, value: &str) -> Result<&mut Self> {
        if !self.properties_open {
            return Err(BlipError::PropertiesClosed);
        }
        encode_string(name.as_bytes(), &mut self.out)?;
        encode_string(value.as_bytes(), &mut self.out)?;
        Ok(self)
    }

    /// Append one property pair with an integer value in decimal form.
    ///
    /// # Errors
    ///
    /// As [`add_property`](Self::add_property).
    pub fn add_int_property(&mut self, name: &str, value: i64) -> Result<&mut Self> {
        self.add_property(name, &value.to_string())
    }

    /// Append several property pairs.
    ///
    /// # Errors
    ///
    /// As [`add_property`](Self::add_property).
    pub fn add_properties<'a, I>(&mut self, pairs: I) -> Result<&mut Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        for (name, value) in pairs {
            self.add_property(name, value)?;
        }
        Ok(self)
    }

    /// Turn this message into an error reply carrying the three reserved
    /// error properties.
    ///
    /// # Errors
    ///
    /// As [`add_property`](Self::add_property).
    pub fn make_error(&mut self, domain: &str, code: i64, message: Option<&str>) -> Result<&mut Self> {
        self.ty = MessageType::Error;
        self.add_property("Error-Domain", domain)?;
        self.add_int_property("Error-Code", code)?;
        if let Some(message) = message {
            self.add_property("Error-Message", message)?;
        }
        Ok(self)
    }

    /// Append body bytes, closing the property table on first use.
    pub fn write(&mut self, body: &[u8]) -> &mut Self {
        self.finish_properties();
        self.out.extend_from_slice(body);
        self
    }

    /// Discard all accumulated properties and body, keeping the flags.
    pub fn reset(&mut self) {
        self.out.clear();
        self.out.resize(SIZE_RESERVED, 0);
        self.properties_open = true;
    }

    /// Finalize the message, returning its type, flags, and payload.
    #[must_use]
    pub fn finish(mut self) -> (MessageType, FrameFlags, Bytes) {
        self.finish_properties();
        (self.ty, self.flags(), self.out.freeze())
    }

    /// Stamp the properties-size varint in front of the table.
    fn finish_properties(&mut self) {
        if !self.properties_open {
            return;
        }
        self.properties_open = false;
        let size = (self.out.len() - SIZE_RESERVED) as u64;
        if size.required_space() == SIZE_RESERVED {
            self.out[0] = u8::try_from(size).unwrap_or(0x7f);
        } else {
            // The size varint needs more room than the reservation: re-copy
            // the table behind a correctly sized prefix.
            let mut wider = BytesMut::with_capacity(MAX_VARINT_LEN + self.out.len());
            put_uvarint(&mut wider, size);
            wider.extend_from_slice(&self.out[SIZE_RESERVED..]);
            self.out = wider;
        }
    }
}
