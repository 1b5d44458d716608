//! NimbusVPN protocol engine
//!
//! The client side of the OpenVPN 2.3+ protocol: bit-exact packet codec,
//! the reliable/ordered/acknowledged control channel with optional
//! pre-shared-key wrapping, the memory-BIO TLS client, the key-material
//! and credential exchange, push-reply parsing, and the per-key data
//! plane.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod auth;
pub mod control;
pub mod data;
pub mod error;
pub mod opcode;
pub mod packet;
pub mod push;
pub mod tls;

pub use auth::{Authenticator, AUTH_FAILED_MESSAGE};
pub use control::{ControlChannel, ControlChannelWrap};
pub use data::{DataPath, PEER_ID_DISABLED, PING_MAGIC};
pub use error::{ProtocolError, Result};
pub use opcode::{KeyId, PacketCode, NUMBER_OF_KEYS};
pub use packet::{ControlPacket, DataPacket, Packet, PacketId, SessionId};
pub use push::{PushReply, PushRoute, PUSH_REPLY_PREFIX};
pub use tls::{load_certs_from_pem, load_key_from_pem, TlsLink};
