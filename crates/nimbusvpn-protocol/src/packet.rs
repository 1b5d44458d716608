//! OpenVPN packet parsing and serialization
//!
//! Bit-exact codec for control and data packets. Network byte order
//! throughout:
//!
//! ```text
//! byte 0:   [code:5][keyid:3]
//!           session id (8 bytes)           control only
//!           ack_len (1 byte)               control only
//!           ack_ids (ack_len x 4 bytes)    control only
//!           ack_remote_session_id (8)      control only, iff ack_len > 0
//!           packet_id (4 bytes)            control, non-ack
//!           payload                        control non-ack
//! ```
//!
//! Data V1: `[code:5][keyid:3] | ciphertext`.
//! Data V2: `[code:5][keyid:3] | peer_id (3 bytes) | ciphertext`.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{KeyId, PacketCode, ProtocolError, Result};

/// Session identifier (8 opaque bytes)
pub type SessionId = [u8; 8];

/// Reliability-layer packet identifier
pub type PacketId = u32;

/// Most acks a single control packet can carry
pub const MAX_ACKS_PER_PACKET: usize = 255;

/// A parsed control-channel packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPacket {
    /// Packet code (one of the control codes)
    pub code: PacketCode,
    /// Key id of the negotiation this packet belongs to
    pub key_id: KeyId,
    /// Sender's session id
    pub session_id: SessionId,
    /// Acknowledged packet ids, at most [`MAX_ACKS_PER_PACKET`]
    pub acks: Vec<PacketId>,
    /// Receiver's session id, present iff `acks` is non-empty
    pub ack_remote_session_id: Option<SessionId>,
    /// Reliability packet id; `None` for pure acks
    pub packet_id: Option<PacketId>,
    /// Payload; TLS record fragments during the handshake phase
    pub payload: Bytes,
}

impl ControlPacket {
    /// Parse a full (unwrapped) control packet.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(ProtocolError::PacketTooShort { expected: 1, got: 0 });
        }
        let code = PacketCode::from_byte(data[0])?;
        if !code.is_control() {
            return Err(ProtocolError::InvalidPacket(format!(
                "{code} is not a control code"
            )));
        }
        let key_id = KeyId::from_byte(data[0]);
        let (session_id, offset) = parse_session_id(data, 1)?;
        let (body, _) = Self::parse_body(code, key_id, session_id, &data[offset..])?;
        Ok(body)
    }

    /// Parse everything after the session id. `body` starts at the ack
    /// count. Returns the packet and the number of bytes consumed.
    ///
    /// Split out so the tls-crypt path can decrypt the body separately from
    /// the cleartext `[byte0, session id]` header.
    pub fn parse_body(
        code: PacketCode,
        key_id: KeyId,
        session_id: SessionId,
        body: &[u8],
    ) -> Result<(Self, usize)> {
        let mut offset = 0;
        if body.is_empty() {
            return Err(ProtocolError::PacketTooShort { expected: 1, got: 0 });
        }
        let ack_count = body[offset] as usize;
        offset += 1;

        let mut acks = Vec::with_capacity(ack_count);
        for _ in 0..ack_count {
            if body.len() < offset + 4 {
                return Err(ProtocolError::PacketTooShort {
                    expected: offset + 4,
                    got: body.len(),
                });
            }
            acks.push(u32::from_be_bytes(
                body[offset..offset + 4].try_into().expect("length checked"),
            ));
            offset += 4;
        }

        let ack_remote_session_id = if ack_count > 0 {
            let (sid, next) = parse_session_id(body, offset)?;
            offset = next;
            Some(sid)
        } else {
            None
        };

        let packet_id = if code.carries_packet_id() {
            if body.len() < offset + 4 {
                return Err(ProtocolError::PacketTooShort {
                    expected: offset + 4,
                    got: body.len(),
                });
            }
            let id = u32::from_be_bytes(body[offset..offset + 4].try_into().expect("length checked"));
            offset += 4;
            Some(id)
        } else {
            None
        };

        let payload = if code.carries_packet_id() && offset < body.len() {
            Bytes::copy_from_slice(&body[offset..])
        } else {
            Bytes::new()
        };
        let consumed = offset + payload.len();

        Ok((
            Self {
                code,
                key_id,
                session_id,
                acks,
                ack_remote_session_id,
                packet_id,
                payload,
            },
            consumed,
        ))
    }

    /// Serialize to wire bytes.
    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        buf.put_u8(self.code.to_byte(self.key_id));
        buf.put_slice(&self.session_id);
        self.serialize_body(&mut buf);
        buf
    }

    /// Serialize the cleartext header and the wrappable body separately.
    pub fn serialize_split(&self) -> (Vec<u8>, Vec<u8>) {
        let mut header = Vec::with_capacity(9);
        header.push(self.code.to_byte(self.key_id));
        header.extend_from_slice(&self.session_id);

        let mut body = BytesMut::with_capacity(self.wire_len() - 9);
        self.serialize_body(&mut body);
        (header, body.to_vec())
    }

    fn serialize_body(&self, buf: &mut BytesMut) {
        debug_assert!(self.acks.len() <= MAX_ACKS_PER_PACKET);
        buf.put_u8(self.acks.len() as u8);
        for ack in &self.acks {
            buf.put_u32(*ack);
        }
        if !self.acks.is_empty() {
            buf.put_slice(&self.ack_remote_session_id.unwrap_or_default());
        }
        if let Some(packet_id) = self.packet_id {
            buf.put_u32(packet_id);
        }
        buf.put_slice(&self.payload);
    }

    fn wire_len(&self) -> usize {
        1 + 8
            + 1
            + self.acks.len() * 4
            + if self.acks.is_empty() { 0 } else { 8 }
            + if self.packet_id.is_some() { 4 } else { 0 }
            + self.payload.len()
    }
}

/// A parsed data-channel packet (still encrypted)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    /// `DataV1` or `DataV2`
    pub code: PacketCode,
    /// Key id selecting the decryption key
    pub key_id: KeyId,
    /// 24-bit peer id; `None` on V1 frames
    pub peer_id: Option<u32>,
    /// Ciphertext
    pub payload: Bytes,
}

impl DataPacket {
    /// Parse a raw data frame.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(ProtocolError::PacketTooShort { expected: 1, got: 0 });
        }
        let code = PacketCode::from_byte(data[0])?;
        if !code.is_data() {
            return Err(ProtocolError::InvalidPacket(format!(
                "{code} is not a data code"
            )));
        }
        let key_id = KeyId::from_byte(data[0]);

        let (peer_id, payload_start) = if code == PacketCode::DataV2 {
            if data.len() < 4 {
                return Err(ProtocolError::PacketTooShort {
                    expected: 4,
                    got: data.len(),
                });
            }
            let pid =
                ((data[1] as u32) << 16) | ((data[2] as u32) << 8) | (data[3] as u32);
            (Some(pid), 4)
        } else {
            (None, 1)
        };

        Ok(Self {
            code,
            key_id,
            peer_id,
            payload: Bytes::copy_from_slice(&data[payload_start..]),
        })
    }

    /// Serialize to wire bytes.
    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(4 + self.payload.len());
        buf.put_u8(self.code.to_byte(self.key_id));
        if self.code == PacketCode::DataV2 {
            let pid = self.peer_id.unwrap_or(0);
            buf.put_u8((pid >> 16) as u8);
            buf.put_u8((pid >> 8) as u8);
            buf.put_u8(pid as u8);
        }
        buf.put_slice(&self.payload);
        buf
    }
}

/// Any parsed packet
#[derive(Debug, Clone)]
pub enum Packet {
    /// Control channel packet
    Control(ControlPacket),
    /// Data channel packet
    Data(DataPacket),
}

impl Packet {
    /// Parse a raw frame into either kind, without control-channel
    /// unwrapping.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(ProtocolError::PacketTooShort { expected: 1, got: 0 });
        }
        if PacketCode::from_byte(data[0])?.is_data() {
            Ok(Packet::Data(DataPacket::parse(data)?))
        } else {
            Ok(Packet::Control(ControlPacket::parse(data)?))
        }
    }
}

fn parse_session_id(data: &[u8], offset: usize) -> Result<(SessionId, usize)> {
    if data.len() < offset + 8 {
        return Err(ProtocolError::PacketTooShort {
            expected: offset + 8,
            got: data.len(),
        });
    }
    let mut sid = [0u8; 8];
    sid.copy_from_slice(&data[offset..offset + 8]);
    Ok((sid, offset + 8))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_control(acks: Vec<u32>, packet_id: Option<u32>, payload: &[u8]) -> ControlPacket {
        ControlPacket {
            code: if packet_id.is_some() {
                PacketCode::ControlV1
            } else {
                PacketCode::AckV1
            },
            key_id: KeyId::new(2),
            session_id: [0x11; 8],
            ack_remote_session_id: if acks.is_empty() { None } else { Some([0x22; 8]) },
            acks,
            packet_id,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    #[test]
    fn test_hard_reset_parse() {
        // P_CONTROL_HARD_RESET_CLIENT_V2 with session id, no acks
        let data = [
            0x38, // code=7, key_id=0
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, // session_id
            0x00, // ack_count = 0
            0x00, 0x00, 0x00, 0x00, // packet_id = 0
        ];

        let packet = ControlPacket::parse(&data).unwrap();
        assert_eq!(packet.code, PacketCode::HardResetClientV2);
        assert_eq!(packet.key_id, KeyId::new(0));
        assert_eq!(packet.session_id, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(packet.packet_id, Some(0));
        assert!(packet.acks.is_empty());
        assert!(packet.payload.is_empty());
    }

    #[test]
    fn test_control_roundtrip() {
        let packet = sample_control(vec![7, 9], Some(3), b"tls fragment");
        let wire = packet.serialize();
        let parsed = ControlPacket::parse(&wire).unwrap();
        assert_eq!(parsed, packet);
    }

    #[test]
    fn test_control_roundtrip_random_fields() {
        // A spread of ack counts and payload sizes, deterministic seeds
        for n_acks in [0usize, 1, 3, 255] {
            let acks: Vec<u32> = (0..n_acks as u32).map(|i| i * 7 + 1).collect();
            let payload: Vec<u8> = (0..97u8).collect();
            let packet = sample_control(acks, Some(0xDEAD_BEEF), &payload);
            let parsed = ControlPacket::parse(&packet.serialize()).unwrap();
            assert_eq!(parsed, packet);
        }
    }

    #[test]
    fn test_ack_roundtrip() {
        let packet = sample_control(vec![1, 2, 3], None, b"");
        let wire = packet.serialize();
        let parsed = ControlPacket::parse(&wire).unwrap();
        assert_eq!(parsed, packet);
        assert_eq!(parsed.packet_id, None);
        assert_eq!(parsed.ack_remote_session_id, Some([0x22; 8]));
    }

    #[test]
    fn test_split_serialization_matches() {
        let packet = sample_control(vec![5], Some(9), b"abc");
        let (header, body) = packet.serialize_split();
        let mut joined = header.clone();
        joined.extend_from_slice(&body);
        assert_eq!(&joined[..], &packet.serialize()[..]);
        assert_eq!(header.len(), 9);
    }

    #[test]
    fn test_truncated_control_rejected() {
        let packet = sample_control(vec![1, 2], Some(4), b"payload");
        let wire = packet.serialize();
        // Every truncation point before the payload must error, not panic.
        for len in 0..wire.len() - 7 {
            assert!(ControlPacket::parse(&wire[..len]).is_err());
        }
    }

    #[test]
    fn test_data_packet_v1_roundtrip() {
        let packet = DataPacket {
            code: PacketCode::DataV1,
            key_id: KeyId::new(1),
            peer_id: None,
            payload: Bytes::from_static(&[1, 2, 3, 4]),
        };
        let parsed = DataPacket::parse(&packet.serialize()).unwrap();
        assert_eq!(parsed, packet);
    }

    #[test]
    fn test_data_packet_v2_roundtrip() {
        let packet = DataPacket {
            code: PacketCode::DataV2,
            key_id: KeyId::new(5),
            peer_id: Some(0x00_AB_CD_EF),
            payload: Bytes::from_static(&[0xDE, 0xAD, 0xBE, 0xEF]),
        };
        let wire = packet.serialize();
        assert_eq!(wire[0], (9 << 3) | 5);
        assert_eq!(&wire[1..4], &[0xAB, 0xCD, 0xEF]);
        let parsed = DataPacket::parse(&wire).unwrap();
        assert_eq!(parsed, packet);
    }

    #[test]
    fn test_unknown_code_is_an_error_not_a_panic() {
        let data = [0x00u8, 1, 2, 3];
        assert!(matches!(
            Packet::parse(&data),
            Err(ProtocolError::UnknownOpcode(0))
        ));
    }
}
