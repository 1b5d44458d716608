//! Push-reply parsing
//!
//! After authentication the server pushes its side of the tunnel
//! configuration as a CSV-encoded `PUSH_REPLY` message. Only the options the
//! client engine consumes are modeled; everything else is preserved
//! verbatim in `options` for the owner.

use serde::{Deserialize, Serialize};
use tracing::debug;

use nimbusvpn_core::CompressionFraming;
use nimbusvpn_crypto::DataCipher;

use crate::{ProtocolError, Result};

/// Message prefix routed to this parser
pub const PUSH_REPLY_PREFIX: &str = "PUSH_REPLY,";

/// Parsed server push reply
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushReply {
    /// Assigned IPv4 address and netmask
    pub ifconfig: Option<(String, String)>,
    /// Assigned IPv6 address
    pub ifconfig_ipv6: Option<String>,
    /// Routes to install (owner's business; engine just parses)
    pub routes: Vec<PushRoute>,
    /// DNS servers
    pub dns: Vec<String>,
    /// DNS search domains
    pub dns_search: Vec<String>,
    /// Redirect default gateway through the tunnel
    pub redirect_gateway: bool,
    /// Server-dictated ping interval (overrides configured keep-alive)
    pub ping: Option<u32>,
    /// Server-dictated ping-restart timeout
    pub ping_restart: Option<u32>,
    /// 24-bit peer id; its presence enables link rebinding
    pub peer_id: Option<u32>,
    /// Renegotiated data-channel cipher
    pub cipher: Option<DataCipher>,
    /// Renegotiated compression framing
    pub compression: Option<CompressionFraming>,
    /// Token to substitute for the password on renegotiation
    pub auth_token: Option<String>,
    /// Tunnel MTU
    pub tun_mtu: Option<usize>,
    /// Options the engine does not consume, kept verbatim
    pub options: Vec<String>,
}

impl PushReply {
    /// Parse a `PUSH_REPLY,...` message.
    pub fn parse(message: &str) -> Result<Self> {
        let body = message
            .strip_prefix(PUSH_REPLY_PREFIX)
            .or_else(|| message.strip_prefix("PUSH_REPLY"))
            .ok_or_else(|| ProtocolError::InvalidPacket("not a push reply".into()))?;

        let mut reply = Self::default();
        for part in body.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let mut tokens = part.split_whitespace();
            match tokens.next() {
                Some("ifconfig") => {
                    let ip = tokens.next().unwrap_or("").to_string();
                    let mask = tokens.next().unwrap_or("").to_string();
                    reply.ifconfig = Some((ip, mask));
                }
                Some("ifconfig-ipv6") => {
                    if let Some(ipv6) = tokens.next() {
                        reply.ifconfig_ipv6 = Some(ipv6.to_string());
                    }
                }
                Some("route") => {
                    if let Ok(route) = PushRoute::parse(part) {
                        reply.routes.push(route);
                    }
                }
                Some("redirect-gateway") => {
                    reply.redirect_gateway = true;
                }
                Some("dhcp-option") => match tokens.next() {
                    Some("DNS") => {
                        if let Some(dns) = tokens.next() {
                            reply.dns.push(dns.to_string());
                        }
                    }
                    Some("DOMAIN") => {
                        if let Some(domain) = tokens.next() {
                            reply.dns_search.push(domain.to_string());
                        }
                    }
                    _ => {}
                },
                Some("ping") => {
                    reply.ping = tokens.next().and_then(|t| t.parse().ok());
                }
                Some("ping-restart") => {
                    reply.ping_restart = tokens.next().and_then(|t| t.parse().ok());
                }
                Some("peer-id") => {
                    reply.peer_id = tokens.next().and_then(|t| t.parse().ok());
                }
                Some("cipher") => {
                    match tokens.next().map(DataCipher::from_option_name) {
                        Some(Ok(cipher)) => reply.cipher = Some(cipher),
                        Some(Err(_)) => {
                            debug!(option = part, "ignoring unsupported pushed cipher");
                            reply.options.push(part.to_string());
                        }
                        None => {}
                    }
                }
                Some("comp-lzo") => {
                    reply.compression = Some(CompressionFraming::CompLzo);
                }
                Some("compress") => {
                    reply.compression = Some(CompressionFraming::Compress);
                }
                Some("auth-token") => {
                    if let Some(token) = tokens.next() {
                        reply.auth_token = Some(token.to_string());
                    }
                }
                Some("tun-mtu") => {
                    reply.tun_mtu = tokens.next().and_then(|t| t.parse().ok());
                }
                Some("topology") => {
                    reply.options.push(part.to_string());
                }
                _ => {
                    reply.options.push(part.to_string());
                }
            }
        }

        Ok(reply)
    }
}

/// Route pushed by the server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRoute {
    /// Network address
    pub network: String,
    /// Netmask
    pub netmask: String,
    /// Gateway; `None` means the VPN gateway
    pub gateway: Option<String>,
    /// Metric
    pub metric: Option<u32>,
}

impl PushRoute {
    /// Parse an OpenVPN `route` directive.
    pub fn parse(s: &str) -> Result<Self> {
        let mut tokens = s.split_whitespace();
        tokens.next(); // skip "route"

        let network = tokens
            .next()
            .ok_or_else(|| ProtocolError::InvalidPacket("missing network in route".into()))?
            .to_string();
        let netmask = tokens
            .next()
            .ok_or_else(|| ProtocolError::InvalidPacket("missing netmask in route".into()))?
            .to_string();
        let gateway = tokens.next().and_then(|g| {
            if g == "vpn_gateway" {
                None
            } else {
                Some(g.to_string())
            }
        });
        let metric = tokens.next().and_then(|m| m.parse().ok());

        Ok(Self {
            network,
            netmask,
            gateway,
            metric,
        })
    }
}
