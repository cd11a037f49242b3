//! Bidirectional, multiplexed request/response messaging over ordered,
//! frame-preserving transports.
//!
//! Messages are cut into frames of at most the transport's frame size and
//! interleaved, so short urgent messages are never stuck behind large ones;
//! receivers acknowledge progress so senders can bound bytes in flight.
//! Each message carries a compact property table (with a fixed token
//! dictionary for well-known strings) followed by an arbitrary body.
//!
//! A [`Connection`] owns all per-connection state on a single actor task.
//! Applications build messages with [`MessageBuilder`], submit them through
//! a [`ConnectionHandle`], and receive completed [`MessageIn`]s through a
//! [`Delegate`] or a per-request [`ResponseFuture`].
//!
//! ```no_run
//! use blip::{Connection, ConnectionConfig, MessageBuilder};
//! # use blip::{CloseReason, Delegate, MessageIn};
//! # use blip::transport::InProcTransport;
//! # struct Echo;
//! # impl Delegate for Echo {
//! #     fn on_request_received(&mut self, request: MessageIn) {
//! #         let mut reply = MessageBuilder::reply_to(&request);
//! #         reply.write(&request.body().to_vec());
//! #         let _ = request.respond(reply);
//! #     }
//! #     fn on_response_received(&mut self, _: MessageIn) {}
//! #     fn on_close(&mut self, _: CloseReason) {}
//! # }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> blip::Result<()> {
//! # let (transport, _peer) = InProcTransport::pair(4096);
//! let (handle, _task) = Connection::spawn(
//!     transport,
//!     Box::new(Echo),
//!     ConnectionConfig::default(),
//! );
//!
//! let mut request = MessageBuilder::new();
//! request.add_property("Profile", "echo")?;
//! request.write(b"hi");
//! if let Some(reply) = handle.send(request)? {
//!     let reply = reply.await?;
//!     assert_eq!(reply.body(), b"hi");
//! }
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod connection;
pub mod delegate;
pub mod error;
pub mod frame;
pub mod inbound;
pub mod outbound;
pub mod properties;
pub mod transport;

pub use builder::MessageBuilder;
pub use connection::{Connection, ConnectionConfig, ConnectionHandle, ResponseFuture};
pub use delegate::Delegate;
pub use error::{BlipError, CloseReason, Result};
pub use frame::{FrameFlags, FrameHeader, MessageNumber, MessageType};
pub use inbound::{MessageIn, ACK_THRESHOLD};
pub use outbound::MessageOut;
pub use properties::{Properties, TOKEN_DICTIONARY};
pub use transport::{InProcTransport, Transport, TransportRx, TransportTx};
