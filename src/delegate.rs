//! Upcall surface from a connection to the application.

use crate::error::CloseReason;
use crate::inbound::MessageIn;

/// Callbacks a connection drives as messages complete.
///
/// Methods are invoked from the connection's serial context, so they must
/// not block; forward to channels or spawn work for anything long-running.
pub trait Delegate: Send {
    /// A complete request arrived from the peer. The application must
    /// respond unless the request is flagged no-reply.
    fn on_request_received(&mut self, request: MessageIn);

    /// A complete reply arrived for a prior request. Fires for every
    /// completed reply, after any pending
    /// [`ResponseFuture`](crate::connection::ResponseFuture) has been
    /// fulfilled.
    fn on_response_received(&mut self, response: MessageIn);

    /// The connection terminated. Invoked exactly once, after every pending
    /// reply future has been failed.
    fn on_close(&mut self, reason: CloseReason);
}
