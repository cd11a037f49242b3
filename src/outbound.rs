//! Outbound message state: payload, send cursor, and in-flight accounting.

use bytes::{Bytes, BytesMut};

use crate::frame::{put_uvarint, FrameFlags, MessageNumber, MessageType};

/// An outbound message being cut into frames.
///
/// The payload is immutable after construction; `bytes_sent` only advances
/// and `unacked_bytes` only shrinks on acknowledgement, so a message never
/// re-emits bytes it has already put on the wire.
#[derive(Debug)]
pub struct MessageOut {
    ty: MessageType,
    flags: FrameFlags,
    number: MessageNumber,
    payload: Bytes,
    bytes_sent: usize,
    unacked_bytes: u64,
}

impl MessageOut {
    /// Create an outbound message over a finished payload.
    #[must_use]
    pub fn new(ty: MessageType, flags: FrameFlags, number: MessageNumber, payload: Bytes) -> Self {
        Self {
            ty,
            flags,
            number,
            payload,
            bytes_sent: 0,
            unacked_bytes: 0,
        }
    }

    /// Synthesize a flow-control acknowledgement reporting `bytes_received`
    /// cumulative bytes of message `number`.
    pub(crate) fn ack(ty: MessageType, number: MessageNumber, bytes_received: u64) -> Self {
        debug_assert!(ty.is_ack());
        let mut payload = BytesMut::new();
        put_uvarint(&mut payload, bytes_received);
        Self::new(
            ty,
            FrameFlags::URGENT | FrameFlags::NO_REPLY,
            number,
            payload.freeze(),
        )
    }

    /// Message number shared by every frame of this message.
    #[must_use]
    pub fn number(&self) -> MessageNumber {
        self.number
    }

    /// Message type repeated on every frame.
    #[must_use]
    pub fn ty(&self) -> MessageType {
        self.ty
    }

    /// Whether this message goes out on the urgent band.
    #[must_use]
    pub fn urgent(&self) -> bool {
        self.flags.contains(FrameFlags::URGENT)
    }

    /// Whether this message is a reply (or an ACK of a reply).
    #[must_use]
    pub fn is_response_class(&self) -> bool {
        matches!(
            self.ty,
            MessageType::Response | MessageType::Error | MessageType::AckResponse
        )
    }

    /// Bytes emitted so far.
    #[must_use]
    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent
    }

    /// Bytes on the wire not yet acknowledged by the peer.
    #[must_use]
    pub fn unacked_bytes(&self) -> u64 {
        self.unacked_bytes
    }

    /// Whether every payload byte has been emitted.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.bytes_sent == self.payload.len()
    }

    /// Cut the next frame of up to `max_bytes` payload bytes.
    ///
    /// The returned flags repeat the message's base flags with `MORE_COMING`
    /// set while payload remains.
    pub fn next_frame(&mut self, max_bytes: usize) -> (Bytes, FrameFlags) {
        debug_assert!(max_bytes > 0, "frame budget must be positive");
        let len = max_bytes.min(self.payload.len() - self.bytes_sent);
        let frame = self.payload.slice(self.bytes_sent..self.bytes_sent + len);
        self.bytes_sent += len;
        self.unacked_bytes += len as u64;
        let mut flags = self.flags;
        if self.bytes_sent < self.payload.len() {
            flags |= FrameFlags::MORE_COMING;
        }
        (frame, flags)
    }

    /// Record a peer acknowledgement of `cumulative` bytes received.
    ///
    /// Acknowledgements claiming more than was sent, and stale ones that
    /// would grow the in-flight count, are ignored.
    pub fn received_ack(&mut self, cumulative: u64) {
        let sent = self.bytes_sent as u64;
        if cumulative <= sent {
            self.unacked_bytes = self.unacked_bytes.min(sent - cumulative);
        }
    }
}
