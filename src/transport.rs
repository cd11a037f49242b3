//! Transport seam: ordered, reliable transports that preserve frame
//! boundaries.
//!
//! The message layer assumes the transport delivers whole frames in order
//! (on a WebSocket, one frame per binary message) and advertises the
//! largest frame it will carry. A transport splits into independent send
//! and receive halves so the connection can write frames while a reader
//! task drains the peer's.

use std::io;

use bytes::Bytes;
use tokio::sync::mpsc;

/// An ordered, reliable, frame-boundary-preserving byte transport.
pub trait Transport: Send + 'static {
    /// Sending half.
    type Tx: TransportTx;
    /// Receiving half.
    type Rx: TransportRx;

    /// Largest frame this transport will carry in one send.
    fn max_frame_size(&self) -> usize;

    /// Split into independent halves. Dropping the sending half closes the
    /// transport for the peer.
    fn split(self) -> (Self::Tx, Self::Rx);
}

/// Sending half of a [`Transport`].
pub trait TransportTx: Send + 'static {
    /// Deliver one frame to the peer, preserving its boundary.
    fn send(&mut self, frame: Bytes) -> impl std::future::Future<Output = io::Result<()>> + Send;
}

/// Receiving half of a [`Transport`].
pub trait TransportRx: Send + 'static {
    /// The next frame from the peer, or `Ok(None)` once the peer closed.
    fn recv(&mut self) -> impl std::future::Future<Output = io::Result<Option<Bytes>>> + Send;
}

/// Frames buffered per direction in an in-process pair.
const CHANNEL_DEPTH: usize = 32;

/// In-process transport over crossed channels.
///
/// The reference transport: integration tests (and loopback peers) connect
/// two endpoints without touching a socket.
///
/// # Examples
///
/// ```
/// use blip::transport::{InProcTransport, Transport};
///
/// let (a, b) = InProcTransport::pair(4096);
/// assert_eq!(a.max_frame_size(), b.max_frame_size());
/// ```
#[derive(Debug)]
pub struct InProcTransport {
    max_frame_size: usize,
    tx: mpsc::Sender<Bytes>,
    rx: mpsc::Receiver<Bytes>,
}

impl InProcTransport {
    /// Create two connected endpoints carrying frames of up to
    /// `max_frame_size` bytes.
    #[must_use]
    pub fn pair(max_frame_size: usize) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (b_tx, a_rx) = mpsc::channel(CHANNEL_DEPTH);
        (
            Self {
                max_frame_size,
                tx: a_tx,
                rx: a_rx,
            },
            Self {
                max_frame_size,
                tx: b_tx,
                rx: b_rx,
            },
        )
    }
}

impl Transport for InProcTransport {
    type Tx = InProcTx;
    type Rx = InProcRx;

    fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    fn split(self) -> (Self::Tx, Self::Rx) {
        (InProcTx { tx: self.tx }, InProcRx { rx: self.rx })
    }
}

/// Sending half of an [`InProcTransport`].
#[derive(Debug)]
pub struct InProcTx {
    tx: mpsc::Sender<Bytes>,
}

impl TransportTx for InProcTx {
    async fn send(&mut self, frame: Bytes) -> io::Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer endpoint dropped"))
    }
}

/// Receiving half of an [`InProcTransport`].
#[derive(Debug)]
pub struct InProcRx {
    rx: mpsc::Receiver<Bytes>,
}

impl TransportRx for InProcRx {
    async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        Ok(self.rx.recv().await)
    }
}
