//! Session error taxonomy
//!
//! Every way a session can die, and whether the owner should try again.
//! Malformed packets never appear here: they are dropped with a warning at
//! the point of parsing.

use thiserror::Error;

use nimbusvpn_crypto::CryptoError;

/// Result type for session operations
pub type Result<T> = std::result::Result<T, SessionError>;

/// Fatal session errors
#[derive(Debug, Error)]
pub enum SessionError {
    /// A negotiation key exceeded its per-phase deadline
    #[error("negotiation timed out")]
    NegotiationTimeout,

    /// Server rejected the credentials (`AUTH_FAILED`)
    #[error("authentication failed")]
    BadCredentials,

    /// No inbound traffic within the ping timeout
    #[error("peer stopped responding")]
    PingTimeout,

    /// Server sent a hard reset after negotiation had advanced
    #[error("stale session")]
    StaleSession,

    /// Control packet session id diverged from the pinned remote id
    #[error("session id mismatch")]
    SessionMismatch,

    /// Control packet required a pinned remote session id that was never set
    #[error("missing remote session id")]
    MissingSessionId,

    /// Data packet referenced an unknown key id
    #[error("unknown key id {0}")]
    BadKey(u8),

    /// Authenticator prefix bytes did not match
    #[error("wrong control data prefix")]
    WrongControlDataPrefix,

    /// Underlying link I/O error
    #[error("link write failed: {0}")]
    FailedLinkWrite(String),

    /// TLS certificate or EKU verification rejected the peer
    #[error("peer verification failed: {0}")]
    PeerVerificationFailed(String),

    /// Non-retry TLS error
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    /// Cryptographic failure outside the drop-with-warning paths
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Rejected at construction time
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl SessionError {
    /// Whether the owner should re-establish the session.
    ///
    /// A negotiation timeout is upgraded to recoverable by the engine when
    /// it strikes the initial hard reset (the link may simply have changed
    /// under us); from this classifier alone it is fatal.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SessionError::FailedLinkWrite(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(SessionError::FailedLinkWrite("broken pipe".into()).is_recoverable());
        assert!(!SessionError::BadCredentials.is_recoverable());
        assert!(!SessionError::PingTimeout.is_recoverable());
        assert!(!SessionError::NegotiationTimeout.is_recoverable());
    }
}
