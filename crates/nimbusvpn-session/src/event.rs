//! Typed session events
//!
//! The owner consumes these over a channel instead of registering delegate
//! callbacks; event order is exactly emission order, which makes it
//! testable.

use nimbusvpn_core::{SessionError, SessionStatus};
use nimbusvpn_protocol::PushReply;

/// Events emitted by a [`Session`](crate::Session).
#[derive(Debug)]
pub enum SessionEvent {
    /// The observable status moved
    StatusChanged(SessionStatus),
    /// First negotiation completed; the tunnel is usable
    Started {
        /// Address of the remote the link is bound to
        remote_address: String,
        /// The server's pushed configuration
        reply: PushReply,
    },
    /// The session stopped, fatally or for a reconnect
    Stopped {
        /// Whether the owner should re-establish the session
        should_reconnect: bool,
        /// The error that stopped the session, if any
        reason: Option<SessionError>,
    },
}
