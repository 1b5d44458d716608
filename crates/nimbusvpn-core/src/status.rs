//! Session status

use serde::{Deserialize, Serialize};

/// Observable lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    /// Hard reset sent, waiting for the server
    Connecting,
    /// TLS handshake in progress on the negotiating key
    Handshaking,
    /// Key-material and credential exchange in progress
    Authenticating,
    /// Data plane up; tunnel traffic flows
    Established,
    /// Stop requested or fatal error; no further traffic
    Stopped,
}

impl SessionStatus {
    /// Whether traffic can flow in this status.
    pub fn is_established(&self) -> bool {
        matches!(self, SessionStatus::Established)
    }
}
