//! Shared helpers for connection integration tests.
#![allow(dead_code)]

use blip::{
    CloseReason, Delegate, FrameFlags, FrameHeader, MessageBuilder, MessageIn, MessageNumber,
    MessageType,
};
use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;

/// Delegate forwarding every upcall into channels the test can await.
pub struct ChannelDelegate {
    requests: mpsc::UnboundedSender<MessageIn>,
    responses: mpsc::UnboundedSender<MessageIn>,
    closes: mpsc::UnboundedSender<CloseReason>,
}

/// Receiving ends paired with a [`ChannelDelegate`].
pub struct DelegateEvents {
    pub requests: mpsc::UnboundedReceiver<MessageIn>,
    pub responses: mpsc::UnboundedReceiver<MessageIn>,
    pub closes: mpsc::UnboundedReceiver<CloseReason>,
}

/// Build a channel-backed delegate plus the receivers observing it.
pub fn channel_delegate() -> (Box<ChannelDelegate>, DelegateEvents) {
    let (requests_tx, requests) = mpsc::unbounded_channel();
    let (responses_tx, responses) = mpsc::unbounded_channel();
    let (closes_tx, closes) = mpsc::unbounded_channel();
    (
        Box::new(ChannelDelegate {
            requests: requests_tx,
            responses: responses_tx,
            closes: closes_tx,
        }),
        DelegateEvents {
            requests,
            responses,
            closes,
        },
    )
}

impl Delegate for ChannelDelegate {
    fn on_request_received(&mut self, request: MessageIn) {
        let _ = self.requests.send(request);
    }

    fn on_response_received(&mut self, response: MessageIn) {
        let _ = self.responses.send(response);
    }

    fn on_close(&mut self, reason: CloseReason) {
        let _ = self.closes.send(reason);
    }
}

/// Delegate replying to every request with its own body echoed back.
pub struct EchoDelegate;

impl Delegate for EchoDelegate {
    fn on_request_received(&mut self, request: MessageIn) {
        let body = request.body().to_vec();
        let mut reply = MessageBuilder::reply_to(&request);
        reply.write(&body);
        request.respond(reply).expect("echo reply");
    }

    fn on_response_received(&mut self, _response: MessageIn) {}

    fn on_close(&mut self, _reason: CloseReason) {}
}

/// A decoded wire frame as seen by a raw peer.
#[derive(Debug)]
pub struct RawFrame {
    pub number: u64,
    pub ty: MessageType,
    pub flags: FrameFlags,
    pub payload: Bytes,
}

impl RawFrame {
    pub fn more_coming(&self) -> bool {
        self.flags.contains(FrameFlags::MORE_COMING)
    }
}

/// Split a received wire frame into header and payload.
pub fn parse_frame(mut frame: Bytes) -> RawFrame {
    let header = FrameHeader::decode(&mut frame).expect("well-formed frame");
    RawFrame {
        number: header.number.get(),
        ty: header.ty,
        flags: header.flags,
        payload: frame,
    }
}

/// Encode a wire frame the way a peer implementation would.
pub fn encode_frame(number: u64, ty: MessageType, flags: FrameFlags, payload: &[u8]) -> Bytes {
    let header = FrameHeader {
        number: MessageNumber::new(number),
        ty,
        flags,
    };
    let mut wire = BytesMut::new();
    header.encode(&mut wire);
    wire.extend_from_slice(payload);
    wire.freeze()
}

/// The finished payload of a request with the given properties and body.
pub fn request_payload(props: &[(&str, &str)], body: &[u8]) -> Bytes {
    let mut builder = MessageBuilder::new();
    builder
        .add_properties(props.iter().copied())
        .expect("encodable properties");
    builder.write(body);
    let (_, _, payload) = builder.finish();
    payload
}
