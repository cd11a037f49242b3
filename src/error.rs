//! Canonical error and close-reason types for the crate.
//!
//! Protocol-level violations terminate the connection; builder and reply
//! misuse is returned to the caller without touching the wire. Peer error
//! responses are *data* and never appear here: they arrive as completed
//! error-type messages through the normal delivery channels.

use thiserror::Error;

/// Top-level error type exposed by `blip`.
#[derive(Debug, Error)]
pub enum BlipError {
    /// A frame header could not be parsed: truncated number varint, a zero
    /// message number, an unassigned type value, or reserved flag bits set.
    #[error("malformed frame header")]
    MalformedFrame,

    /// The property table was structurally invalid.
    #[error("message properties not null-terminated")]
    MalformedProperties,

    /// The first frame of a message was too small to carry the
    /// properties-size prefix.
    #[error("frame too small to hold the properties size")]
    FrameTooSmall,

    /// The message ended before the end of its declared property table.
    #[error("message ends before end of properties")]
    PropertiesTruncated,

    /// The declared property table size exceeds the sanity cap.
    #[error("property table of {size} bytes exceeds the {limit} byte cap")]
    PropertiesTooLarge {
        /// Size the peer declared.
        size: u64,
        /// Configured cap.
        limit: u64,
    },

    /// A reserved protocol feature was encountered on either path.
    #[error("unsupported protocol feature: {0}")]
    UnsupportedFeature(&'static str),

    /// A property string cannot be encoded: it contains a zero byte or
    /// starts with a control byte, which would collide with the token
    /// dictionary on the wire.
    #[error("property strings must not contain zero bytes or start with a control byte")]
    InvalidProperty,

    /// `add_property` was called after body bytes were written.
    #[error("properties cannot be added once the body has been started")]
    PropertiesClosed,

    /// `respond` was called on a message that does not accept a reply
    /// (a no-reply request, or a message that is itself a reply).
    #[error("message does not accept a reply")]
    ReplyNotAllowed,

    /// A non-request message was submitted through [`ConnectionHandle::send`].
    ///
    /// [`ConnectionHandle::send`]: crate::connection::ConnectionHandle::send
    #[error("only requests can be sent directly; replies go through MessageIn::respond")]
    NotARequest,

    /// A reply was submitted with an acknowledgement type. ACK messages are
    /// synthesized internally for flow control and cannot be sent by the
    /// application.
    #[error("acknowledgements are internal; replies must be responses or errors")]
    NotAReply,

    /// The connection shut down before the operation could complete.
    #[error("connection closed")]
    ConnectionClosed,

    /// The underlying transport failed.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a connection terminated, as reported to [`Delegate::on_close`].
///
/// Rendered to owned text so delegates can forward it through channels.
///
/// [`Delegate::on_close`]: crate::delegate::Delegate::on_close
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The local application requested shutdown.
    Requested,
    /// The peer closed the transport.
    TransportClosed,
    /// A protocol violation terminated the connection.
    ProtocolError(String),
    /// The transport failed mid-connection.
    TransportError(String),
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Requested => f.write_str("closed by local request"),
            Self::TransportClosed => f.write_str("transport closed by peer"),
            Self::ProtocolError(msg) => write!(f, "protocol error: {msg}"),
            Self::TransportError(msg) => write!(f, "transport error: {msg}"),
        }
    }
}

/// Canonical result alias used by `blip` public APIs.
pub type Result<T> = std::result::Result<T, BlipError>;
