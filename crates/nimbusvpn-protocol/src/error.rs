//! Protocol error types

use thiserror::Error;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Protocol errors
///
/// Codec failures (`PacketTooShort`, `UnknownOpcode`) are drop-with-warning
/// conditions at the session level, never fatal.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Invalid packet format
    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    /// Unknown opcode
    #[error("unknown opcode: {0}")]
    UnknownOpcode(u8),

    /// Packet too short
    #[error("packet too short: expected at least {expected}, got {got}")]
    PacketTooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size received
        got: usize,
    },

    /// Authenticator prefix bytes did not match
    #[error("wrong control data prefix")]
    WrongControlDataPrefix,

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(String),

    /// TLS certificate verification rejected the peer
    #[error("peer certificate rejected: {0}")]
    PeerVerification(String),

    /// Peer certificate lacks the TLS Web Server Authentication EKU
    #[error("peer certificate missing server-auth extended key usage")]
    ServerEku,

    /// Cryptographic error
    #[error("crypto error: {0}")]
    Crypto(#[from] nimbusvpn_crypto::CryptoError),
}
