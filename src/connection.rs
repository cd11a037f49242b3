//! Connection core: send scheduling, receive dispatch, and shutdown.
//!
//! All per-connection state lives on one actor task driven by [`Connection::run`].
//! Application submissions and replies are marshalled in as commands over a
//! channel, and a small forwarding task drains the transport's receive half,
//! so every piece of message state is touched from a single serial context.
//! The actor suspends only while writing a frame or while waiting for the
//! next command or inbound frame.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::builder::MessageBuilder;
use crate::delegate::Delegate;
use crate::error::{BlipError, CloseReason, Result};
use crate::frame::{FrameFlags, FrameHeader, MessageNumber, MessageType};
use crate::inbound::MessageIn;
use crate::outbound::MessageOut;
use crate::transport::{Transport, TransportRx, TransportTx};

/// Frames buffered between the transport reader task and the actor.
const INBOUND_QUEUE_DEPTH: usize = 32;

/// Tuning knobs for a connection.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConnectionConfig {
    /// Bytes one message may have in flight without acknowledgement before
    /// the scheduler stops picking it. `None` disables the window.
    pub send_window: Option<u64>,
}

/// Work marshalled onto the connection actor.
#[derive(Debug)]
pub(crate) enum Command {
    /// Queue a new outbound request; the actor assigns its number.
    SendRequest {
        ty: MessageType,
        flags: FrameFlags,
        payload: Bytes,
        reply: Option<oneshot::Sender<MessageIn>>,
    },
    /// Queue a reply to a received request, reusing its number.
    SendResponse {
        number: MessageNumber,
        ty: MessageType,
        flags: FrameFlags,
        payload: Bytes,
    },
}

/// Reject messages the application may not put on the wire.
pub(crate) fn ensure_sendable(ty: MessageType, flags: FrameFlags) -> Result<()> {
    if ty.is_ack() {
        return Err(BlipError::NotAReply);
    }
    if flags.contains(FrameFlags::COMPRESSED) {
        return Err(BlipError::UnsupportedFeature("compressed messages"));
    }
    Ok(())
}

/// Outbound messages with unsent frames, split into urgency bands.
///
/// Within a band, messages rotate so each sends one frame per turn; the
/// urgent band always goes first, so urgent messages preempt normal ones at
/// frame boundaries but never mid-frame. A message whose in-flight bytes
/// exceed the send window is skipped until acknowledgements catch up.
#[derive(Debug)]
struct SendQueue {
    urgent: VecDeque<MessageOut>,
    normal: VecDeque<MessageOut>,
    send_window: Option<u64>,
}

impl SendQueue {
    fn new(send_window: Option<u64>) -> Self {
        Self {
            urgent: VecDeque::new(),
            normal: VecDeque::new(),
            send_window,
        }
    }

    fn push(&mut self, message: MessageOut) {
        if message.urgent() {
            self.urgent.push_back(message);
        } else {
            self.normal.push_back(message);
        }
    }

    /// Take the next message eligible to send a frame, if any.
    fn pop_ready(&mut self) -> Option<MessageOut> {
        let window = self.send_window;
        Self::pop_band(&mut self.urgent, window).or_else(|| Self::pop_band(&mut self.normal, window))
    }

    fn pop_band(band: &mut VecDeque<MessageOut>, window: Option<u64>) -> Option<MessageOut> {
        for _ in 0..band.len() {
            let message = band.pop_front()?;
            let blocked = window.is_some_and(|limit| message.unacked_bytes() >= limit);
            if blocked {
                band.push_back(message);
            } else {
                return Some(message);
            }
        }
        None
    }

    /// Route an acknowledgement to the in-queue message it names.
    /// Returns `false` if the message already finished sending.
    fn received_ack(&mut self, number: MessageNumber, response_class: bool, cumulative: u64) -> bool {
        let target = self
            .urgent
            .iter_mut()
            .chain(self.normal.iter_mut())
            .find(|message| {
                !message.ty().is_ack()
                    && message.number() == number
                    && message.is_response_class() == response_class
            });
        match target {
            Some(message) => {
                message.received_ack(cumulative);
                true
            }
            None => false,
        }
    }
}

/// One BLIP connection over a transport.
///
/// Created together with its [`ConnectionHandle`]; [`run`](Self::run) drives
/// it until shutdown.
pub struct Connection<T: Transport> {
    tx: T::Tx,
    rx: Option<T::Rx>,
    max_frame_size: usize,
    delegate: Box<dyn Delegate>,
    commands: mpsc::UnboundedReceiver<Command>,
    command_tx: mpsc::UnboundedSender<Command>,
    commands_open: bool,
    shutdown: CancellationToken,
    queue: SendQueue,
    pending_replies: HashMap<MessageNumber, MessageIn>,
    inbound_requests: HashMap<MessageNumber, MessageIn>,
    next_number: u64,
}

impl<T: Transport> Connection<T> {
    /// Create a connection over `transport`, delivering upcalls to
    /// `delegate`. The returned handle submits requests and shuts the
    /// connection down.
    pub fn new(
        transport: T,
        delegate: Box<dyn Delegate>,
        config: ConnectionConfig,
    ) -> (Self, ConnectionHandle) {
        let max_frame_size = transport.max_frame_size();
        let (tx, rx) = transport.split();
        let (command_tx, commands) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let handle = ConnectionHandle {
            commands: command_tx.clone(),
            shutdown: shutdown.clone(),
        };
        let connection = Self {
            tx,
            rx: Some(rx),
            max_frame_size,
            delegate,
            commands,
            command_tx,
            commands_open: true,
            shutdown,
            queue: SendQueue::new(config.send_window),
            pending_replies: HashMap::new(),
            inbound_requests: HashMap::new(),
            next_number: 0,
        };
        (connection, handle)
    }

    /// Create a connection and drive it on a spawned task.
    pub fn spawn(
        transport: T,
        delegate: Box<dyn Delegate>,
        config: ConnectionConfig,
    ) -> (ConnectionHandle, tokio::task::JoinHandle<Result<()>>) {
        let (connection, handle) = Self::new(transport, delegate, config);
        (handle, tokio::spawn(connection.run()))
    }

    /// Drive the connection until the transport closes, shutdown is
    /// requested, or a protocol violation occurs.
    ///
    /// On any exit path every pending reply future is failed with
    /// [`BlipError::ConnectionClosed`], in-flight inbound messages are
    /// discarded undelivered, and the delegate's `on_close` runs exactly
    /// once.
    ///
    /// # Errors
    ///
    /// Returns the protocol or I/O error that terminated the connection.
    pub async fn run(mut self) -> Result<()> {
        let (in_tx, mut inbound) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        let mut rx = match self.rx.take() {
            Some(rx) => rx,
            None => return Err(BlipError::ConnectionClosed),
        };
        let reader = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(Some(frame)) => {
                        if in_tx.send(Ok(frame)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        let _ = in_tx.send(Err(err)).await;
                        break;
                    }
                }
            }
        });

        let outcome = self.drive(&mut inbound).await;
        reader.abort();
        self.shutdown.cancel();

        let reason = match &outcome {
            Ok(reason) => reason.clone(),
            Err(BlipError::Io(err)) => CloseReason::TransportError(err.to_string()),
            Err(err) => CloseReason::ProtocolError(err.to_string()),
        };
        log::debug!("connection closing: {reason}");
        self.fail_pending();
        self.delegate.on_close(reason);
        outcome.map(|_| ())
    }

    async fn drive(
        &mut self,
        inbound: &mut mpsc::Receiver<io::Result<Bytes>>,
    ) -> Result<CloseReason> {
        loop {
            self.drain_ready(inbound)?;
            if self.shutdown.is_cancelled() {
                return Ok(CloseReason::Requested);
            }
            if let Some(wire) = self.next_wire_frame() {
                self.tx.send(wire).await?;
                continue;
            }
            tokio::select! {
                biased;

                () = self.shutdown.cancelled() => {
                    return Ok(CloseReason::Requested);
                }

                command = self.commands.recv(), if self.commands_open => {
                    match command {
                        Some(command) => self.handle_command(command),
                        None => self.commands_open = false,
                    }
                }

                frame = inbound.recv() => {
                    match frame {
                        Some(Ok(frame)) => self.handle_frame(frame)?,
                        Some(Err(err)) => return Err(BlipError::Io(err)),
                        None => return Ok(CloseReason::TransportClosed),
                    }
                }
            }
        }
    }

    /// Apply everything already queued without suspending, so urgent
    /// submissions take effect at the next frame boundary.
    fn drain_ready(&mut self, inbound: &mut mpsc::Receiver<io::Result<Bytes>>) -> Result<()> {
        while self.commands_open {
            match self.commands.try_recv() {
                Ok(command) => self.handle_command(command),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => self.commands_open = false,
            }
        }
        while let Ok(frame) = inbound.try_recv() {
            match frame {
                Ok(frame) => self.handle_frame(frame)?,
                Err(err) => return Err(BlipError::Io(err)),
            }
        }
        Ok(())
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::SendRequest {
                ty,
                flags,
                payload,
                reply,
            } => {
                let number = self.assign_number();
                if let Some(reply) = reply {
                    let pending = MessageIn::pending_reply(number, self.command_tx.clone(), reply);
                    self.pending_replies.insert(number, pending);
                }
                log::debug!("queueing {ty:?} {number}, {} payload bytes", payload.len());
                self.queue.push(MessageOut::new(ty, flags, number, payload));
            }
            Command::SendResponse {
                number,
                ty,
                flags,
                payload,
            } => {
                log::debug!("queueing {ty:?} {number}, {} payload bytes", payload.len());
                self.queue.push(MessageOut::new(ty, flags, number, payload));
            }
        }
    }

    fn assign_number(&mut self) -> MessageNumber {
        self.next_number += 1;
        MessageNumber::new(self.next_number)
    }

    /// Encode the next scheduled frame, or `None` when nothing is eligible.
    fn next_wire_frame(&mut self) -> Option<Bytes> {
        let mut message = self.queue.pop_ready()?;
        let header_len = FrameHeader {
            number: message.number(),
            ty: message.ty(),
            flags: FrameFlags::empty(),
        }
        .encoded_len();
        let budget = self.max_frame_size.saturating_sub(header_len).max(1);
        let (chunk, flags) = message.next_frame(budget);
        let header = FrameHeader {
            number: message.number(),
            ty: message.ty(),
            flags,
        };
        let mut wire = BytesMut::with_capacity(header_len + chunk.len());
        header.encode(&mut wire);
        wire.extend_from_slice(&chunk);
        if message.is_finished() {
            log::trace!("finished sending {:?} {}", message.ty(), message.number());
        } else {
            self.queue.push(message);
        }
        Some(wire.freeze())
    }

    /// Route one inbound frame.
    fn handle_frame(&mut self, mut frame: Bytes) -> Result<()> {
        let header = FrameHeader::decode(&mut frame)?;
        match header.ty {
            MessageType::AckRequest | MessageType::AckResponse => self.handle_ack(header, &frame),
            MessageType::Request => self.handle_request_frame(header, &frame),
            MessageType::Response | MessageType::Error => self.handle_reply_frame(header, &frame),
        }
    }

    fn handle_ack(&mut self, header: FrameHeader, payload: &[u8]) -> Result<()> {
        let (cumulative, _) =
            crate::frame::get_uvarint(payload).ok_or(BlipError::MalformedFrame)?;
        let response_class = header.ty == MessageType::AckResponse;
        if !self
            .queue
            .received_ack(header.number, response_class, cumulative)
        {
            log::trace!("ACK for finished message {}", header.number);
        }
        Ok(())
    }

    fn handle_request_frame(&mut self, header: FrameHeader, frame: &[u8]) -> Result<()> {
        let message = self
            .inbound_requests
            .entry(header.number)
            .or_insert_with(|| MessageIn::new(header.number, self.command_tx.clone()));
        let outcome = message.received_frame(frame, header.ty, header.flags)?;
        if let Some(ack) = outcome.ack {
            self.queue.push(ack);
        }
        if outcome.complete {
            if let Some(message) = self.inbound_requests.remove(&header.number) {
                self.delegate.on_request_received(message);
            }
        }
        Ok(())
    }

    fn handle_reply_frame(&mut self, header: FrameHeader, frame: &[u8]) -> Result<()> {
        let Some(message) = self.pending_replies.get_mut(&header.number) else {
            log::warn!("dropping frame of unsolicited reply {}", header.number);
            return Ok(());
        };
        let outcome = message.received_frame(frame, header.ty, header.flags)?;
        if let Some(ack) = outcome.ack {
            self.queue.push(ack);
        }
        if outcome.complete {
            if let Some(mut message) = self.pending_replies.remove(&header.number) {
                // Every completed reply fulfils its future, then reaches the
                // delegate.
                if let Some(reply) = message.take_reply() {
                    if let Err(unclaimed) = reply.send(message.duplicate()) {
                        log::trace!(
                            "reply {} arrived after its future was dropped",
                            unclaimed.number()
                        );
                    }
                }
                self.delegate.on_response_received(message);
            }
        }
        Ok(())
    }

    /// Fail every pending reply and drop partially received messages.
    fn fail_pending(&mut self) {
        for (_, mut message) in self.pending_replies.drain() {
            // Dropping the slot resolves the future with ConnectionClosed.
            drop(message.take_reply());
        }
        self.inbound_requests.clear();
    }
}

/// Cloneable application-side handle to a connection.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    commands: mpsc::UnboundedSender<Command>,
    shutdown: CancellationToken,
}

impl ConnectionHandle {
    /// Queue an outbound request.
    ///
    /// Returns a [`ResponseFuture`] resolving to the peer's completed reply,
    /// or `None` when the request is flagged no-reply.
    ///
    /// # Errors
    ///
    /// Returns [`BlipError::NotARequest`] for builders not carrying the
    /// request type, [`BlipError::UnsupportedFeature`] for compressed
    /// messages, and [`BlipError::ConnectionClosed`] once the connection has
    /// shut down.
    pub fn send(&self, builder: MessageBuilder) -> Result<Option<ResponseFuture>> {
        let (ty, flags, payload) = builder.finish();
        if ty != MessageType::Request {
            return Err(BlipError::NotARequest);
        }
        ensure_sendable(ty, flags)?;
        let (reply, future) = if flags.contains(FrameFlags::NO_REPLY) {
            (None, None)
        } else {
            let (reply_tx, reply_rx) = oneshot::channel();
            (Some(reply_tx), Some(ResponseFuture { inner: reply_rx }))
        };
        self.commands
            .send(Command::SendRequest {
                ty,
                flags,
                payload,
                reply,
            })
            .map_err(|_| BlipError::ConnectionClosed)?;
        Ok(future)
    }

    /// Ask the connection to shut down. Pending replies fail with
    /// [`BlipError::ConnectionClosed`]; frames already written cannot be
    /// retracted.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Whether the connection has stopped accepting work.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// One-shot handle resolving to the peer's completed reply.
///
/// Peer error replies resolve as `Ok` messages with
/// [`is_error()`](MessageIn::is_error) set: per-message errors are data.
/// The future fails with [`BlipError::ConnectionClosed`] only when the
/// connection shuts down first.
#[derive(Debug)]
pub struct ResponseFuture {
    inner: oneshot::Receiver<MessageIn>,
}

impl Future for ResponseFuture {
    type Output = Result<MessageIn>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner)
            .poll(cx)
            .map(|reply| reply.map_err(|_| BlipError::ConnectionClosed))
    }
}
