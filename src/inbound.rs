//! Inbound message state machine: frame accumulation, property extraction,
//! completion, and flow-control acknowledgements.

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};

use crate::builder::MessageBuilder;
use crate::connection::{ensure_sendable, Command};
use crate::error::{BlipError, Result};
use crate::frame::{get_uvarint, FrameFlags, MessageNumber, MessageType};
use crate::outbound::MessageOut;
use crate::properties::Properties;

/// Cumulative received bytes after which an ACK is emitted.
pub const ACK_THRESHOLD: u64 = 50_000;

/// Sanity cap on a peer's declared property table size.
pub const MAX_PROPERTIES_SIZE: u64 = 1 << 20;

/// What one received frame did to a message.
#[derive(Debug)]
pub(crate) struct FrameOutcome {
    /// The frame was the message's last and the message is now complete.
    pub complete: bool,
    /// A flow-control acknowledgement to enqueue, if the threshold tripped.
    pub ack: Option<MessageOut>,
}

/// An inbound message, accumulating frames until complete.
///
/// The connection owns a `MessageIn` while frames are arriving; once the
/// final frame lands it is handed to the application: a pending
/// [`ResponseFuture`](crate::connection::ResponseFuture) is fulfilled and
/// the delegate callback is invoked. Properties and body are only populated
/// on a complete message.
#[derive(Debug)]
pub struct MessageIn {
    ty: MessageType,
    flags: FrameFlags,
    number: MessageNumber,
    commands: mpsc::UnboundedSender<Command>,
    buffer: BytesMut,
    properties_size: u64,
    started: bool,
    properties: Option<Properties>,
    body: Option<Bytes>,
    unacked_bytes: u64,
    bytes_received: u64,
    reply: Option<oneshot::Sender<MessageIn>>,
}

impl MessageIn {
    /// Create the accumulator for an inbound message. Type and flags are
    /// placeholders until the first frame arrives.
    pub(crate) fn new(number: MessageNumber, commands: mpsc::UnboundedSender<Command>) -> Self {
        debug_assert!(number.get() > 0);
        Self {
            ty: MessageType::Response,
            flags: FrameFlags::empty(),
            number,
            commands,
            buffer: BytesMut::new(),
            properties_size: 0,
            started: false,
            properties: None,
            body: None,
            unacked_bytes: 0,
            bytes_received: 0,
            reply: None,
        }
    }

    /// Create the pre-allocated reply accumulator for an outbound request,
    /// holding the one-shot slot its future resolves through.
    pub(crate) fn pending_reply(
        number: MessageNumber,
        commands: mpsc::UnboundedSender<Command>,
        reply: oneshot::Sender<MessageIn>,
    ) -> Self {
        let mut message = Self::new(number, commands);
        message.reply = Some(reply);
        message
    }

    /// Feed one received frame into the message.
    ///
    /// Implements the per-frame protocol: record flags and the properties
    /// size on the first frame, accumulate, split off the property table
    /// once enough bytes exist, emit an ACK every [`ACK_THRESHOLD`] bytes,
    /// and complete when `MORE_COMING` is clear.
    ///
    /// # Errors
    ///
    /// Any error returned here is a protocol violation that terminates the
    /// connection.
    pub(crate) fn received_frame(
        &mut self,
        frame: &[u8],
        ty: MessageType,
        flags: FrameFlags,
    ) -> Result<FrameOutcome> {
        let mut frame = frame;
        if !self.started {
            self.started = true;
            self.ty = ty;
            self.flags = flags;
            log::debug!("receiving {ty:?} {}, flags {flags:?}", self.number);
            if flags.contains(FrameFlags::COMPRESSED) {
                return Err(BlipError::UnsupportedFeature("compressed frames"));
            }
            let (size, consumed) = get_uvarint(frame).ok_or(BlipError::FrameTooSmall)?;
            if size > MAX_PROPERTIES_SIZE {
                return Err(BlipError::PropertiesTooLarge {
                    size,
                    limit: MAX_PROPERTIES_SIZE,
                });
            }
            self.properties_size = size;
            frame = &frame[consumed..];
        }

        self.buffer.extend_from_slice(frame);
        if self.properties.is_none() && self.buffer.len() as u64 >= self.properties_size {
            let table = self.buffer.split_to(self.properties_size as usize).freeze();
            if !table.is_empty() && table.last() != Some(&0) {
                return Err(BlipError::MalformedProperties);
            }
            self.properties = Some(Properties::from_raw(table));
        }

        self.bytes_received += frame.len() as u64;
        self.unacked_bytes += frame.len() as u64;
        let ack = if self.unacked_bytes >= ACK_THRESHOLD {
            self.unacked_bytes = 0;
            let ty = if self.ty.is_response_class() {
                MessageType::AckResponse
            } else {
                MessageType::AckRequest
            };
            Some(MessageOut::ack(ty, self.number, self.bytes_received))
        } else {
            None
        };

        if flags.contains(FrameFlags::MORE_COMING) {
            return Ok(FrameOutcome { complete: false, ack });
        }

        if self.properties.is_none() {
            return Err(BlipError::PropertiesTruncated);
        }
        self.body = Some(self.buffer.split().freeze());
        log::debug!("finished receiving {:?} {}", self.ty, self.number);
        Ok(FrameOutcome { complete: true, ack })
    }

    /// Message number, shared with the paired request for replies.
    #[must_use]
    pub fn number(&self) -> MessageNumber {
        self.number
    }

    /// Message type as fixed by the first received frame.
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        self.ty
    }

    /// Whether this is an error reply.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.ty == MessageType::Error
    }

    /// Whether the sender flagged this message urgent.
    #[must_use]
    pub fn urgent(&self) -> bool {
        self.flags.contains(FrameFlags::URGENT)
    }

    /// Whether the sender wants no reply.
    #[must_use]
    pub fn no_reply(&self) -> bool {
        self.flags.contains(FrameFlags::NO_REPLY)
    }

    /// The received property table. Empty until the message is complete.
    #[must_use]
    pub fn properties(&self) -> Option<&Properties> {
        self.properties.as_ref()
    }

    /// Value of the property named `name`.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.as_ref()?.get(name)
    }

    /// Value of `name` parsed as a signed decimal integer.
    #[must_use]
    pub fn int_property(&self, name: &str, default: i64) -> i64 {
        self.properties
            .as_ref()
            .map_or(default, |props| props.get_int(name, default))
    }

    /// The message body. Empty until the message is complete.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        self.body.as_deref().unwrap_or(&[])
    }

    /// Consume the message, returning its body bytes.
    #[must_use]
    pub fn into_body(self) -> Bytes {
        self.body.unwrap_or_default()
    }

    /// `Error-Domain` of an error reply.
    #[must_use]
    pub fn error_domain(&self) -> Option<&str> {
        if !self.is_error() {
            return None;
        }
        self.property("Error-Domain")
    }

    /// `Error-Code` of an error reply, or 0.
    #[must_use]
    pub fn error_code(&self) -> i64 {
        if !self.is_error() {
            return 0;
        }
        self.int_property("Error-Code", 0)
    }

    /// `Error-Message` of an error reply.
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        if !self.is_error() {
            return None;
        }
        self.property("Error-Message")
    }

    /// Send a reply to this request.
    ///
    /// Request-typed builders are coerced to responses; the reply reuses
    /// this message's number.
    ///
    /// # Errors
    ///
    /// Returns [`BlipError::ReplyNotAllowed`] if this message is itself a
    /// reply or was flagged no-reply, [`BlipError::NotAReply`] if the builder
    /// was given an acknowledgement type, and
    /// [`BlipError::ConnectionClosed`] if the connection has shut down.
    pub fn respond(self, mut builder: MessageBuilder) -> Result<()> {
        if self.ty != MessageType::Request || self.no_reply() {
            return Err(BlipError::ReplyNotAllowed);
        }
        if builder.is_request() {
            builder.message_type(MessageType::Response);
        }
        let (ty, flags, payload) = builder.finish();
        ensure_sendable(ty, flags)?;
        self.commands
            .send(Command::SendResponse {
                number: self.number,
                ty,
                flags,
                payload,
            })
            .map_err(|_| BlipError::ConnectionClosed)
    }

    /// Reply with an error carrying the three reserved error properties.
    ///
    /// # Errors
    ///
    /// As [`respond`](Self::respond).
    pub fn respond_with_error(self, domain: &str, code: i64, message: &str) -> Result<()> {
        let mut builder = MessageBuilder::reply_to(&self);
        builder.make_error(domain, code, Some(message))?;
        self.respond(builder)
    }

    /// Take the one-shot reply slot, if this is a pending reply.
    pub(crate) fn take_reply(&mut self) -> Option<oneshot::Sender<MessageIn>> {
        self.reply.take()
    }

    /// A copy of this message for a second delivery path. The reply slot is
    /// not duplicated; payload buffers are shared, not re-allocated.
    pub(crate) fn duplicate(&self) -> MessageIn {
        MessageIn {
            ty: self.ty,
            flags: self.flags,
            number: self.number,
            commands: self.commands.clone(),
            buffer: self.buffer.clone(),
            properties_size: self.properties_size,
            started: self.started,
            properties: self.properties.clone(),
            body: self.body.clone(),
            unacked_bytes: self.unacked_bytes,
            bytes_received: self.bytes_received,
            reply: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::builder::MessageBuilder;
    use crate::frame::get_uvarint;

    use super::*;

    fn commands() -> (
        mpsc::UnboundedSender<Command>,
        mpsc::UnboundedReceiver<Command>,
    ) {
        mpsc::unbounded_channel()
    }

    fn request_payload(props: &[(&str, &str)], body: &[u8]) -> Bytes {
        let mut builder = MessageBuilder::new();
        builder.add_properties(props.iter().copied()).unwrap();
        builder.write(body);
        let (_, _, payload) = builder.finish();
        payload
    }

    #[test]
    fn single_frame_message_completes() {
        let (tx, _rx) = commands();
        let mut msg = MessageIn::new(MessageNumber::new(1), tx);
        let payload = request_payload(&[("Profile", "echo")], b"hi");
        let outcome = msg
            .received_frame(&payload, MessageType::Request, FrameFlags::empty())
            .unwrap();
        assert!(outcome.complete);
        assert!(outcome.ack.is_none());
        assert_eq!(msg.property("Profile"), Some("echo"));
        assert_eq!(msg.body(), b"hi");
    }

    #[test]
    fn properties_split_across_frames() {
        let (tx, _rx) = commands();
        let mut msg = MessageIn::new(MessageNumber::new(1), tx);
        let payload = request_payload(&[("Cache-Control", "must-revalidate")], b"body bytes");

        let mid = 3; // inside the property table
        let outcome = msg
            .received_frame(&payload[..mid], MessageType::Request, FrameFlags::MORE_COMING)
            .unwrap();
        assert!(!outcome.complete);
        assert!(msg.properties().is_none());

        let outcome = msg
            .received_frame(&payload[mid..], MessageType::Request, FrameFlags::empty())
            .unwrap();
        assert!(outcome.complete);
        assert_eq!(msg.property("Cache-Control"), Some("must-revalidate"));
        assert_eq!(msg.body(), b"body bytes");
    }

    #[test]
    fn first_frame_fixes_type_and_flags() {
        let (tx, _rx) = commands();
        let mut msg = MessageIn::new(MessageNumber::new(4), tx);
        assert_eq!(msg.message_type(), MessageType::Response);
        let payload = request_payload(&[("Error-Domain", "HTTP")], b"");
        msg.received_frame(&payload, MessageType::Error, FrameFlags::URGENT)
            .unwrap();
        assert!(msg.is_error());
        assert!(msg.urgent());
        assert_eq!(msg.error_domain(), Some("HTTP"));
    }

    #[test]
    fn acks_are_emitted_every_threshold_bytes() {
        let (tx, _rx) = commands();
        let mut msg = MessageIn::new(MessageNumber::new(1), tx);
        let payload = request_payload(&[], &vec![0xAAu8; 200_000]);

        let mut acks = Vec::new();
        let chunks: Vec<&[u8]> = payload.chunks(16_384).collect();
        let count = chunks.len();
        for (index, chunk) in chunks.into_iter().enumerate() {
            let flags = if index + 1 == count {
                FrameFlags::empty()
            } else {
                FrameFlags::MORE_COMING
            };
            let outcome = msg
                .received_frame(chunk, MessageType::Request, flags)
                .unwrap();
            if let Some(mut ack) = outcome.ack {
                assert_eq!(ack.ty(), MessageType::AckRequest);
                let (frame, _) = ack.next_frame(64);
                let (reported, _) = get_uvarint(&frame).unwrap();
                acks.push(reported);
            }
        }

        assert!(acks.len() >= 3, "expected an ACK per {ACK_THRESHOLD} bytes");
        assert!(acks.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(acks[0] >= ACK_THRESHOLD);
        assert!(acks[0] < ACK_THRESHOLD + 16_384 + 16);
    }

    #[test]
    fn truncated_properties_fail_on_final_frame() {
        let (tx, _rx) = commands();
        let mut msg = MessageIn::new(MessageNumber::new(1), tx);
        // Declares a 100-byte table but the message ends after 3 bytes.
        let mut payload = BytesMut::new();
        payload.extend_from_slice(&[100, b'a', b'b', b'c']);
        assert!(matches!(
            msg.received_frame(&payload, MessageType::Request, FrameFlags::empty()),
            Err(BlipError::PropertiesTruncated)
        ));
    }

    #[test]
    fn missing_table_terminator_is_malformed() {
        let (tx, _rx) = commands();
        let mut msg = MessageIn::new(MessageNumber::new(1), tx);
        let mut payload = BytesMut::new();
        payload.extend_from_slice(&[4, b'a', b'b', b'c', b'd']);
        assert!(matches!(
            msg.received_frame(&payload, MessageType::Request, FrameFlags::empty()),
            Err(BlipError::MalformedProperties)
        ));
    }

    #[test]
    fn empty_first_frame_is_too_small() {
        let (tx, _rx) = commands();
        let mut msg = MessageIn::new(MessageNumber::new(1), tx);
        assert!(matches!(
            msg.received_frame(&[], MessageType::Request, FrameFlags::empty()),
            Err(BlipError::FrameTooSmall)
        ));
    }

    #[test]
    fn oversized_property_table_is_rejected() {
        let (tx, _rx) = commands();
        let mut msg = MessageIn::new(MessageNumber::new(1), tx);
        let mut payload = BytesMut::new();
        crate::frame::put_uvarint(&mut payload, MAX_PROPERTIES_SIZE + 1);
        assert!(matches!(
            msg.received_frame(&payload, MessageType::Request, FrameFlags::MORE_COMING),
            Err(BlipError::PropertiesTooLarge { .. })
        ));
    }

    #[test]
    fn compressed_frames_are_unsupported() {
        let (tx, _rx) = commands();
        let mut msg = MessageIn::new(MessageNumber::new(1), tx);
        let payload = request_payload(&[], b"hi");
        assert!(matches!(
            msg.received_frame(&payload, MessageType::Request, FrameFlags::COMPRESSED),
            Err(BlipError::UnsupportedFeature(_))
        ));
    }

    #[test]
    fn responding_to_a_no_reply_request_is_rejected() {
        let (tx, _rx) = commands();
        let mut msg = MessageIn::new(MessageNumber::new(1), tx);
        let payload = request_payload(&[], b"fire and forget");
        msg.received_frame(&payload, MessageType::Request, FrameFlags::NO_REPLY)
            .unwrap();
        assert!(matches!(
            msg.respond(MessageBuilder::new()),
            Err(BlipError::ReplyNotAllowed)
        ));
    }

    #[test]
    fn responding_to_a_response_is_rejected() {
        let (tx, _rx) = commands();
        let mut msg = MessageIn::new(MessageNumber::new(1), tx);
        let payload = request_payload(&[], b"ok");
        msg.received_frame(&payload, MessageType::Response, FrameFlags::empty())
            .unwrap();
        assert!(matches!(
            msg.respond(MessageBuilder::new()),
            Err(BlipError::ReplyNotAllowed)
        ));
    }

    #[test]
    fn responding_with_an_ack_type_is_rejected() {
        let (tx, _rx) = commands();
        let mut msg = MessageIn::new(MessageNumber::new(1), tx);
        let payload = request_payload(&[], b"ping");
        msg.received_frame(&payload, MessageType::Request, FrameFlags::empty())
            .unwrap();

        let mut reply = MessageBuilder::new();
        reply.message_type(MessageType::AckRequest);
        assert!(matches!(msg.respond(reply), Err(BlipError::NotAReply)));
    }

    #[test]
    fn respond_coerces_requests_and_reuses_the_number() {
        let (tx, mut rx) = commands();
        let mut msg = MessageIn::new(MessageNumber::new(7), tx);
        let payload = request_payload(&[], b"ping");
        msg.received_frame(&payload, MessageType::Request, FrameFlags::empty())
            .unwrap();

        let mut reply = MessageBuilder::new();
        reply.write(b"pong");
        msg.respond(reply).unwrap();

        match rx.try_recv().unwrap() {
            Command::SendResponse { number, ty, .. } => {
                assert_eq!(number, MessageNumber::new(7));
                assert_eq!(ty, MessageType::Response);
            }
            Command::SendRequest { .. } => panic!("expected a response command"),
        }
    }
}
