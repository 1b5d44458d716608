//! Session configuration
//!
//! Immutable per session. The fields mirror the subset of OpenVPN client
//! options the engine consumes; everything else in a profile is the
//! owner's business.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use nimbusvpn_crypto::{AuthDigest, DataCipher, SecureBuf};

/// Compression framing negotiated with the server.
///
/// Only the framing byte is handled; no compression is ever performed.
/// Servers configured for active compression are incompatible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CompressionFraming {
    /// No framing byte
    #[default]
    Disabled,
    /// `comp-lzo` framing: a no-compression marker byte precedes the payload
    CompLzo,
    /// `compress` framing (OpenVPN 2.4)
    Compress,
}

impl CompressionFraming {
    /// Parse from the push-reply option word.
    pub fn from_option_name(name: &str) -> Option<Self> {
        match name {
            "comp-lzo" => Some(CompressionFraming::CompLzo),
            "compress" => Some(CompressionFraming::Compress),
            _ => None,
        }
    }
}

/// Control-channel wrapping strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TlsWrapStrategy {
    /// `tls-auth`: HMAC authentication of control packets
    Auth,
    /// `tls-crypt`: AES-256-CTR encryption plus HMAC-SHA256
    Crypt,
}

/// Pre-shared control-channel wrap configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsWrapConfig {
    /// Wrapping strategy
    pub strategy: TlsWrapStrategy,
    /// Body of the `OpenVPN Static key V1` file
    pub key_file: String,
    /// `key-direction` option; 1 is the normal client direction
    pub key_direction: Option<u8>,
}

/// Immutable session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Data-channel cipher
    pub cipher: DataCipher,
    /// HMAC digest for CBC suites and tls-auth (ignored for GCM data)
    pub digest: AuthDigest,
    /// CA anchor for server certificate validation (PEM, required)
    pub ca_pem: String,
    /// Client certificate for mutual TLS (PEM, both-or-neither with the key)
    pub client_certificate_pem: Option<String>,
    /// Client private key for mutual TLS (PEM)
    pub client_key_pem: Option<String>,
    /// Compression framing mode
    pub compression_framing: CompressionFraming,
    /// Optional control-channel wrap
    pub tls_wrap: Option<TlsWrapConfig>,
    /// Keep-alive ping interval; `None` disables (server push overrides)
    pub keep_alive_interval: Option<Duration>,
    /// Soft-renegotiation interval; `None` disables client-initiated rekey
    pub renegotiates_after: Option<Duration>,
    /// PIA-patched hard reset carrying a CA fingerprint payload
    pub uses_pia_patches: bool,
    /// Link MTU hint
    pub mtu: usize,
    /// Control-channel retransmission interval
    pub retransmission_interval: Duration,
    /// Deadline for the initial hard-reset exchange
    pub hard_reset_timeout: Duration,
    /// Deadline for a full negotiation after the hard reset
    pub negotiation_timeout: Duration,
    /// Deadline for a soft-reset renegotiation
    pub soft_negotiation_timeout: Duration,
    /// Shutdown after this long without inbound traffic
    pub ping_timeout: Duration,
}

impl SessionConfig {
    /// Default link MTU hint
    pub const DEFAULT_MTU: usize = 1500;

    /// Build a configuration with protocol defaults for the given CA.
    pub fn new(ca_pem: impl Into<String>) -> Self {
        Self {
            cipher: DataCipher::Aes256Gcm,
            digest: AuthDigest::Sha1,
            ca_pem: ca_pem.into(),
            client_certificate_pem: None,
            client_key_pem: None,
            compression_framing: CompressionFraming::Disabled,
            tls_wrap: None,
            keep_alive_interval: None,
            renegotiates_after: None,
            uses_pia_patches: false,
            mtu: Self::DEFAULT_MTU,
            retransmission_interval: Duration::from_secs(2),
            hard_reset_timeout: Duration::from_secs(10),
            negotiation_timeout: Duration::from_secs(30),
            soft_negotiation_timeout: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(60),
        }
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), String> {
        if self.ca_pem.trim().is_empty() {
            return Err("ca_pem is required".into());
        }
        if self.client_certificate_pem.is_some() != self.client_key_pem.is_some() {
            return Err("client certificate and key must be provided together".into());
        }
        if self.mtu < 576 {
            return Err("mtu below the IPv4 minimum".into());
        }
        Ok(())
    }

    /// Effective keep-alive, treating zero as disabled.
    pub fn keep_alive(&self) -> Option<Duration> {
        self.keep_alive_interval.filter(|d| !d.is_zero())
    }

    /// Effective renegotiation interval, treating zero as disabled.
    pub fn renegotiation(&self) -> Option<Duration> {
        self.renegotiates_after.filter(|d| !d.is_zero())
    }
}

/// Username and password supplied by the credential provider.
///
/// The password lives in a zeroing buffer and never appears in `Debug`
/// output.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    /// Username; empty when the server authenticates by certificate only
    pub username: String,
    /// Password
    pub password: SecureBuf,
}

impl Credentials {
    /// Build from a username/password pair.
    pub fn new(username: impl Into<String>, password: &str) -> Self {
        Self {
            username: username.into(),
            password: SecureBuf::from_slice(password.as_bytes()),
        }
    }

    /// Credentials for certificate-only authentication.
    pub fn empty() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::new("-----BEGIN CERTIFICATE-----");
        config.validate().unwrap();
        assert_eq!(config.retransmission_interval, Duration::from_secs(2));
        assert_eq!(config.ping_timeout, Duration::from_secs(60));
        assert_eq!(config.negotiation_timeout, config.soft_negotiation_timeout);
    }

    #[test]
    fn test_validate_requires_ca() {
        let config = SessionConfig::new("  ");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_cert_key_pairing() {
        let mut config = SessionConfig::new("ca");
        config.client_certificate_pem = Some("cert".into());
        assert!(config.validate().is_err());
        config.client_key_pem = Some("key".into());
        config.validate().unwrap();
    }

    #[test]
    fn test_zero_intervals_disable() {
        let mut config = SessionConfig::new("ca");
        config.keep_alive_interval = Some(Duration::ZERO);
        config.renegotiates_after = Some(Duration::ZERO);
        assert!(config.keep_alive().is_none());
        assert!(config.renegotiation().is_none());

        config.keep_alive_interval = Some(Duration::from_secs(10));
        assert_eq!(config.keep_alive(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let creds = Credentials::new("alice", "hunter2");
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_framing_option_names() {
        assert_eq!(
            CompressionFraming::from_option_name("comp-lzo"),
            Some(CompressionFraming::CompLzo)
        );
        assert_eq!(
            CompressionFraming::from_option_name("compress"),
            Some(CompressionFraming::Compress)
        );
        assert_eq!(CompressionFraming::from_option_name("lz4"), None);
    }
}
