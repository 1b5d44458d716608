//! OpenVPN packet codes
//!
//! The first byte of every packet packs a 5-bit code and a 3-bit key id.

use crate::{ProtocolError, Result};

/// Number of key-id slots; id 0 is reserved for the initial hard reset.
pub const NUMBER_OF_KEYS: u8 = 8;

/// OpenVPN packet code (high 5 bits of the first byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketCode {
    /// Mid-session rekey request (P_CONTROL_SOFT_RESET_V1)
    SoftResetV1 = 3,

    /// Control channel packet under the reliability layer (P_CONTROL_V1)
    ControlV1 = 4,

    /// Acknowledgment packet (P_ACK_V1)
    AckV1 = 5,

    /// Data channel packet (P_DATA_V1)
    DataV1 = 6,

    /// Hard reset from client v2 (P_CONTROL_HARD_RESET_CLIENT_V2)
    HardResetClientV2 = 7,

    /// Hard reset from server v2 (P_CONTROL_HARD_RESET_SERVER_V2)
    HardResetServerV2 = 8,

    /// Data channel v2 with peer-id (P_DATA_V2)
    DataV2 = 9,
}

impl PacketCode {
    /// Parse from the raw first byte (high 5 bits)
    pub fn from_byte(byte: u8) -> Result<Self> {
        let code = byte >> 3;
        match code {
            3 => Ok(PacketCode::SoftResetV1),
            4 => Ok(PacketCode::ControlV1),
            5 => Ok(PacketCode::AckV1),
            6 => Ok(PacketCode::DataV1),
            7 => Ok(PacketCode::HardResetClientV2),
            8 => Ok(PacketCode::HardResetServerV2),
            9 => Ok(PacketCode::DataV2),
            _ => Err(ProtocolError::UnknownOpcode(code)),
        }
    }

    /// Pack into the first byte together with a key id
    pub fn to_byte(self, key_id: KeyId) -> u8 {
        ((self as u8) << 3) | (key_id.0 & 0x07)
    }

    /// Whether this is a control-channel code
    pub fn is_control(&self) -> bool {
        !self.is_data()
    }

    /// Whether this is a data-channel code
    pub fn is_data(&self) -> bool {
        matches!(self, PacketCode::DataV1 | PacketCode::DataV2)
    }

    /// Whether this code carries a reliability-layer packet id
    pub fn carries_packet_id(&self) -> bool {
        self.is_control() && *self != PacketCode::AckV1
    }
}

impl std::fmt::Display for PacketCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PacketCode::SoftResetV1 => write!(f, "P_CONTROL_SOFT_RESET_V1"),
            PacketCode::ControlV1 => write!(f, "P_CONTROL_V1"),
            PacketCode::AckV1 => write!(f, "P_ACK_V1"),
            PacketCode::DataV1 => write!(f, "P_DATA_V1"),
            PacketCode::HardResetClientV2 => write!(f, "P_CONTROL_HARD_RESET_CLIENT_V2"),
            PacketCode::HardResetServerV2 => write!(f, "P_CONTROL_HARD_RESET_SERVER_V2"),
            PacketCode::DataV2 => write!(f, "P_DATA_V2"),
        }
    }
}

/// Key id (low 3 bits of the first byte)
///
/// A 3-bit generation counter threaded through every packet to demultiplex
/// concurrent key epochs during renegotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct KeyId(pub u8);

impl KeyId {
    /// Create a new key id, masked to 3 bits
    pub fn new(id: u8) -> Self {
        Self(id & 0x07)
    }

    /// Parse from the raw first byte (low 3 bits)
    pub fn from_byte(byte: u8) -> Self {
        Self(byte & 0x07)
    }

    /// The id a soft reset allocates after this one.
    ///
    /// Wraps within the 8-slot space but skips 0, which is reserved for the
    /// initial hard reset.
    pub fn next_negotiation(&self) -> Self {
        Self(((self.0 + 1) % NUMBER_OF_KEYS).max(1))
    }
}

impl std::fmt::Display for KeyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
