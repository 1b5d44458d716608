//! Key-material and credential exchange
//!
//! Once TLS is up, the client pushes a single plaintext blob carrying the
//! pre-master secret, two client randoms, an options string, credentials,
//! and peer info. The server answers with its own randoms and options,
//! followed by null-terminated control messages (`AUTH_FAILED`,
//! `PUSH_REPLY,...`). The parser is re-entrant: TLS plaintext arrives in
//! arbitrary fragments and is accumulated until each piece is complete.

use tracing::debug;

use nimbusvpn_core::{CompressionFraming, Credentials};
use nimbusvpn_crypto::{
    derive_key_material, random_secure, KeyExpansionInputs, KeyMaterial, SecureBuf,
};

use crate::packet::SessionId;
use crate::{ProtocolError, Result};

/// Fixed zero prefix opening both directions of the exchange
const TLS_PREFIX: [u8; 4] = [0; 4];
/// Pre-master secret length
const PRE_MASTER_LEN: usize = 48;
/// Length of each random
const RANDOM_LEN: usize = 32;
/// Fatal server message
pub const AUTH_FAILED_MESSAGE: &str = "AUTH_FAILED";

/// Builds the outbound key-material blob and incrementally parses the
/// server's reply.
pub struct Authenticator {
    pre_master: SecureBuf,
    random1: SecureBuf,
    random2: SecureBuf,
    username: String,
    password: SecureBuf,
    peer_info: String,

    inbound: SecureBuf,
    header_parsed: bool,
    server_random1: Option<SecureBuf>,
    server_random2: Option<SecureBuf>,
    server_opts: Option<SecureBuf>,
}

impl Authenticator {
    /// Create an authenticator with fresh randoms.
    ///
    /// When `auth_token` is present (from a previous push reply) it is sent
    /// in place of the password, which is how renegotiations avoid
    /// retransmitting the real secret.
    pub fn new(
        credentials: &Credentials,
        auth_token: Option<&str>,
        framing: CompressionFraming,
    ) -> Self {
        let password = match auth_token {
            Some(token) => SecureBuf::from_slice(token.as_bytes()),
            None => credentials.password.clone(),
        };
        Self {
            pre_master: random_secure(PRE_MASTER_LEN),
            random1: random_secure(RANDOM_LEN),
            random2: random_secure(RANDOM_LEN),
            username: credentials.username.clone(),
            password,
            peer_info: build_peer_info(framing),
            inbound: SecureBuf::new(),
            header_parsed: false,
            server_random1: None,
            server_random2: None,
            server_opts: None,
        }
    }

    /// The outbound key-material + credentials blob, pushed as TLS
    /// plaintext right after the handshake completes.
    pub fn write_auth_request(&self) -> SecureBuf {
        let mut out = SecureBuf::with_capacity(256);
        out.append(&TLS_PREFIX);
        out.append(self.pre_master.as_slice());
        out.append(self.random1.as_slice());
        out.append(self.random2.as_slice());
        // Options string: a single terminator byte.
        out.append_length_prefixed(&[0]);
        out.append_length_prefixed(self.username.as_bytes());
        out.append_length_prefixed(self.password.as_slice());
        out.append_length_prefixed(self.peer_info.as_bytes());
        out
    }

    /// Feed server TLS plaintext; returns any newly completed control
    /// messages.
    ///
    /// The fixed header (prefix, server randoms, server options) is parsed
    /// exactly once; everything after it is surfaced as null-terminated
    /// messages.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<String>> {
        self.inbound.append(data);

        if !self.header_parsed {
            // A rejecting server may skip the key-material reply entirely
            // and answer with the failure message alone.
            if self
                .inbound
                .as_slice()
                .starts_with(AUTH_FAILED_MESSAGE.as_bytes())
            {
                return Ok(vec![AUTH_FAILED_MESSAGE.to_string()]);
            }
            match self.try_parse_header()? {
                true => debug!("authenticator header complete"),
                false => return Ok(Vec::new()),
            }
        }

        let mut messages = Vec::new();
        while let Some(message) = self.inbound.null_terminated_string(0) {
            let message = message.to_string();
            self.inbound.truncate_front(message.len() + 1);
            if !message.is_empty() {
                messages.push(message);
            }
        }
        Ok(messages)
    }

    /// Whether the server randoms have been received.
    pub fn server_randoms_ready(&self) -> bool {
        self.header_parsed
    }

    /// Server options string, once the header is parsed.
    pub fn server_options(&self) -> Option<&SecureBuf> {
        self.server_opts.as_ref()
    }

    /// Derive the data-channel key block for this negotiation.
    pub fn derive_data_keys(
        &self,
        local_session_id: &SessionId,
        remote_session_id: &SessionId,
    ) -> Result<KeyMaterial> {
        let (Some(sr1), Some(sr2)) = (&self.server_random1, &self.server_random2) else {
            return Err(ProtocolError::InvalidPacket(
                "server randoms not yet received".into(),
            ));
        };
        let material = derive_key_material(&KeyExpansionInputs {
            pre_master: self.pre_master.as_slice(),
            random1: self.random1.as_slice(),
            random2: self.random2.as_slice(),
            server_random1: sr1.as_slice(),
            server_random2: sr2.as_slice(),
            local_session_id,
            remote_session_id,
        })?;
        Ok(material)
    }

    fn try_parse_header(&mut self) -> Result<bool> {
        let fixed = TLS_PREFIX.len() + 2 * RANDOM_LEN + 2;
        if self.inbound.len() < fixed {
            return Ok(false);
        }
        let bytes = self.inbound.as_slice();
        if bytes[..4] != TLS_PREFIX {
            return Err(ProtocolError::WrongControlDataPrefix);
        }

        let opts_len =
            u16::from_be_bytes(bytes[4 + 64..4 + 64 + 2].try_into().expect("length checked"))
                as usize;
        if self.inbound.len() < fixed + opts_len {
            return Ok(false);
        }

        let bytes = self.inbound.as_slice();
        self.server_random1 = Some(SecureBuf::from_slice(&bytes[4..36]));
        self.server_random2 = Some(SecureBuf::from_slice(&bytes[36..68]));
        self.server_opts = Some(SecureBuf::from_slice(&bytes[70..70 + opts_len]));
        self.inbound.truncate_front(fixed + opts_len);
        self.header_parsed = true;
        Ok(true)
    }
}

/// Peer-info block advertised to the server.
fn build_peer_info(framing: CompressionFraming) -> String {
    let mut info = String::new();
    info.push_str(concat!("IV_VER=", env!("CARGO_PKG_VERSION"), "\n"));
    info.push_str(&format!("IV_PLAT={}\n", std::env::consts::OS));
    info.push_str("IV_PROTO=2\n");
    info.push_str("IV_TCPNL=1\n");
    match framing {
        CompressionFraming::Disabled => {}
        CompressionFraming::CompLzo => info.push_str("IV_LZO_STUB=1\n"),
        CompressionFraming::Compress => {
            info.push_str("IV_COMP_STUB=1\n");
            info.push_str("IV_COMP_STUBv2=1\n");
        }
    }
    info
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authenticator() -> Authenticator {
        Authenticator::new(
            &Credentials::new("alice", "hunter2"),
            None,
            CompressionFraming::Disabled,
        )
    }

    /// Reads one length-prefixed field, returning (bytes, rest).
    fn take_field(data: &[u8]) -> (&[u8], &[u8]) {
        let len = u16::from_be_bytes(data[..2].try_into().unwrap()) as usize;
        (&data[2..2 + len], &data[2 + len..])
    }

    fn server_reply(messages: &[&str]) -> Vec<u8> {
        let mut reply = vec![0u8; 4];
        reply.extend_from_slice(&[0x01; 32]);
        reply.extend_from_slice(&[0x02; 32]);
        reply.extend_from_slice(&2u16.to_be_bytes());
        reply.extend_from_slice(b"V4");
        for message in messages {
            reply.extend_from_slice(message.as_bytes());
            reply.push(0);
        }
        reply
    }

    #[test]
    fn test_request_layout() {
        let auth = authenticator();
        let blob = auth.write_auth_request();
        let bytes = blob.as_slice();

        assert_eq!(&bytes[..4], &[0, 0, 0, 0]);
        let rest = &bytes[4 + 48 + 64..];

        let (opts, rest) = take_field(rest);
        assert_eq!(opts, &[0]);
        let (username, rest) = take_field(rest);
        assert_eq!(username, b"alice");
        let (password, rest) = take_field(rest);
        assert_eq!(password, b"hunter2");
        let (peer_info, rest) = take_field(rest);
        assert!(std::str::from_utf8(peer_info).unwrap().contains("IV_PROTO=2"));
        assert!(rest.is_empty());
    }

    #[test]
    fn test_auth_token_replaces_password() {
        let auth = Authenticator::new(
            &Credentials::new("alice", "hunter2"),
            Some("SESS_token"),
            CompressionFraming::Disabled,
        );
        let blob = auth.write_auth_request();
        let rest = &blob.as_slice()[4 + 48 + 64..];
        let (_opts, rest) = take_field(rest);
        let (_user, rest) = take_field(rest);
        let (password, _) = take_field(rest);
        assert_eq!(password, b"SESS_token");
    }

    #[test]
    fn test_empty_credentials_are_zero_length_fields() {
        let auth = Authenticator::new(
            &Credentials::empty(),
            None,
            CompressionFraming::Disabled,
        );
        let blob = auth.write_auth_request();
        let rest = &blob.as_slice()[4 + 48 + 64..];
        let (_opts, rest) = take_field(rest);
        let (username, rest) = take_field(rest);
        let (password, _) = take_field(rest);
        assert!(username.is_empty());
        assert!(password.is_empty());
    }

    #[test]
    fn test_peer_info_advertises_framing_stub() {
        let auth = Authenticator::new(
            &Credentials::empty(),
            None,
            CompressionFraming::CompLzo,
        );
        assert!(auth.peer_info.contains("IV_LZO_STUB=1"));
    }

    #[test]
    fn test_feed_parses_header_and_messages() {
        let mut auth = authenticator();
        let reply = server_reply(&["PUSH_REPLY,ifconfig 10.8.0.2 255.255.255.0"]);

        let messages = auth.feed(&reply).unwrap();
        assert!(auth.server_randoms_ready());
        assert_eq!(messages.len(), 1);
        assert!(messages[0].starts_with("PUSH_REPLY,"));
        assert_eq!(auth.server_options().unwrap().as_slice(), b"V4");
    }

    #[test]
    fn test_feed_is_reentrant_across_fragments() {
        let mut auth = authenticator();
        let reply = server_reply(&["AUTH_FAILED"]);

        // Dribble the reply in 7-byte fragments.
        let mut all_messages = Vec::new();
        for chunk in reply.chunks(7) {
            all_messages.extend(auth.feed(chunk).unwrap());
        }
        assert!(auth.server_randoms_ready());
        assert_eq!(all_messages, vec!["AUTH_FAILED".to_string()]);
    }

    #[test]
    fn test_partial_message_held_until_terminator() {
        let mut auth = authenticator();
        let mut reply = server_reply(&[]);
        reply.extend_from_slice(b"PUSH_RE");

        assert!(auth.feed(&reply).unwrap().is_empty());
        let messages = auth.feed(b"PLY,ping 10\0").unwrap();
        assert_eq!(messages, vec!["PUSH_REPLY,ping 10".to_string()]);
    }

    #[test]
    fn test_auth_failed_without_header_is_surfaced() {
        let mut auth = authenticator();
        let messages = auth.feed(b"AUTH_FAILED\0").unwrap();
        assert_eq!(messages, vec!["AUTH_FAILED".to_string()]);
        assert!(!auth.server_randoms_ready());
    }

    #[test]
    fn test_bad_prefix_is_fatal() {
        let mut auth = authenticator();
        let mut reply = server_reply(&[]);
        reply[0] = 0xFF;
        assert!(matches!(
            auth.feed(&reply),
            Err(ProtocolError::WrongControlDataPrefix)
        ));
    }

    #[test]
    fn test_derive_requires_server_randoms() {
        let auth = authenticator();
        assert!(auth.derive_data_keys(&[1; 8], &[2; 8]).is_err());
    }

    #[test]
    fn test_derive_after_reply() {
        let mut auth = authenticator();
        auth.feed(&server_reply(&[])).unwrap();
        let material = auth.derive_data_keys(&[1; 8], &[2; 8]).unwrap();
        assert_eq!(material.encrypt_key.len(), 64);
    }
}
