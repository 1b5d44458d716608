//! Data channel: per-key encryption of IP packets
//!
//! Each connected session key owns a [`DataPath`]. Outbound IP packets get
//! a compression-framing byte, a packet id, and either CBC+HMAC
//! (encrypt-then-MAC) or GCM protection; inbound packets are verified,
//! replay-checked against a 128-entry sliding window, and stripped back to
//! bare IP.

use tracing::warn;

use nimbusvpn_core::CompressionFraming;
use nimbusvpn_crypto::{AuthDigest, CipherCtx, DataCipher, HmacKey, KeyMaterial, SecureBuf};

use crate::packet::{DataPacket, PacketId};
use crate::{KeyId, PacketCode, ProtocolError, Result};

/// Sentinel stamped into data V2 frames when the server pushed no peer id.
pub const PEER_ID_DISABLED: u32 = 0x00FF_FFFF;

/// Payload of an OpenVPN keep-alive ping.
pub const PING_MAGIC: [u8; 16] = [
    0x2A, 0x18, 0x7B, 0xF3, 0x64, 0x1E, 0xB9, 0x4A, 0xB7, 0x17, 0x2D, 0x8E, 0xB1, 0xD9, 0x25,
    0x8D,
];

/// `comp-lzo` framing marker meaning "not compressed"
const LZO_NO_COMPRESS: u8 = 0xFA;
/// `compress` (v2.4) framing marker meaning "not compressed"
const COMPRESS_NO_COMPRESS: u8 = 0xFB;

/// GCM implicit-IV tail taken from the HMAC key slots
const IMPLICIT_IV_LEN: usize = 8;

/// One direction of the data path.
struct DataPathSide {
    ctx: CipherCtx,
    /// CBC suites only
    hmac: Option<HmacKey>,
    /// GCM suites only: packet id (4) plus this tail (8) forms the nonce
    implicit_iv: SecureBuf,
}

impl DataPathSide {
    fn new(
        cipher: DataCipher,
        digest: AuthDigest,
        key_slot: &SecureBuf,
        hmac_slot: &SecureBuf,
    ) -> Result<Self> {
        let ctx = CipherCtx::new(cipher, key_slot.as_slice())?;
        if cipher.is_aead() {
            Ok(Self {
                ctx,
                hmac: None,
                implicit_iv: SecureBuf::from_slice(&hmac_slot.as_slice()[..IMPLICIT_IV_LEN]),
            })
        } else {
            Ok(Self {
                ctx,
                hmac: Some(HmacKey::new(digest, hmac_slot.as_slice())?),
                implicit_iv: SecureBuf::new(),
            })
        }
    }

    fn gcm_nonce(&self, packet_id: PacketId) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(&packet_id.to_be_bytes());
        nonce[4..].copy_from_slice(self.implicit_iv.as_slice());
        nonce
    }
}

/// Per-key data-plane pipeline.
pub struct DataPath {
    cipher: DataCipher,
    framing: CompressionFraming,
    key_id: KeyId,
    peer_id: Option<u32>,
    encrypt_side: DataPathSide,
    decrypt_side: DataPathSide,
    next_packet_id: PacketId,
    replay: ReplayWindow,
}

impl DataPath {
    /// Build the pipeline for one key generation.
    pub fn new(
        cipher: DataCipher,
        digest: AuthDigest,
        material: &KeyMaterial,
        framing: CompressionFraming,
        peer_id: Option<u32>,
        key_id: KeyId,
    ) -> Result<Self> {
        Ok(Self {
            cipher,
            framing,
            key_id,
            peer_id,
            encrypt_side: DataPathSide::new(
                cipher,
                digest,
                &material.encrypt_key,
                &material.encrypt_hmac,
            )?,
            decrypt_side: DataPathSide::new(
                cipher,
                digest,
                &material.decrypt_key,
                &material.decrypt_hmac,
            )?,
            next_packet_id: 1,
            replay: ReplayWindow::new(),
        })
    }

    /// Key id this path encrypts under.
    pub fn key_id(&self) -> KeyId {
        self.key_id
    }

    /// Peer id stamped into outbound frames, if the server assigned one.
    pub fn peer_id(&self) -> Option<u32> {
        self.peer_id
    }

    /// Encrypt an IP packet into a complete data V2 wire frame.
    pub fn encrypt(&mut self, ip_packet: &[u8]) -> Result<Vec<u8>> {
        let packet_id = self.next_packet_id;
        self.next_packet_id = self
            .next_packet_id
            .checked_add(1)
            .ok_or(ProtocolError::InvalidPacket("data packet id exhausted".into()))?;

        let first_byte = PacketCode::DataV2.to_byte(self.key_id);
        let peer = self.peer_id.unwrap_or(PEER_ID_DISABLED);
        let peer_bytes = [(peer >> 16) as u8, (peer >> 8) as u8, peer as u8];

        if self.cipher.is_aead() {
            // Plaintext carries only the framing byte; the id rides in the
            // clear and feeds the nonce.
            let mut plain = SecureBuf::with_capacity(1 + ip_packet.len());
            self.prepend_framing(&mut plain);
            plain.append(ip_packet);

            let nonce = self.encrypt_side.gcm_nonce(packet_id);
            let mut ad = Vec::with_capacity(8);
            ad.push(first_byte);
            ad.extend_from_slice(&peer_bytes);
            ad.extend_from_slice(&packet_id.to_be_bytes());

            let sealed = self.encrypt_side.ctx.seal(&nonce, plain.as_slice(), &ad)?;

            let mut frame = Vec::with_capacity(8 + sealed.len());
            frame.push(first_byte);
            frame.extend_from_slice(&peer_bytes);
            frame.extend_from_slice(&packet_id.to_be_bytes());
            frame.extend_from_slice(&sealed);
            Ok(frame)
        } else {
            // CBC: the packet id is part of the plaintext.
            let mut plain = SecureBuf::with_capacity(5 + ip_packet.len());
            plain.append_u32(packet_id);
            self.prepend_framing(&mut plain);
            plain.append(ip_packet);

            let iv: [u8; DataCipher::CBC_IV_SIZE] = nimbusvpn_crypto::random_bytes();
            let ciphertext = self.encrypt_side.ctx.cbc_encrypt(&iv, plain.as_slice())?;
            let hmac = self
                .encrypt_side
                .hmac
                .as_ref()
                .expect("CBC side always has an HMAC key")
                .sign(&[&iv, &ciphertext]);

            let mut frame =
                Vec::with_capacity(4 + hmac.len() + iv.len() + ciphertext.len());
            frame.push(first_byte);
            frame.extend_from_slice(&peer_bytes);
            frame.extend_from_slice(&hmac);
            frame.extend_from_slice(&iv);
            frame.extend_from_slice(&ciphertext);
            Ok(frame)
        }
    }

    /// Decrypt a data frame.
    ///
    /// Returns `Ok(None)` for packets that are dropped without being fatal:
    /// replays, stale ids, mismatched peer ids, and unexpected compression
    /// markers. MAC failures surface as errors and are dropped by the
    /// caller.
    pub fn decrypt(&mut self, frame: &[u8]) -> Result<Option<SecureBuf>> {
        let packet = DataPacket::parse(frame)?;

        if packet.code == PacketCode::DataV2 {
            let expected = self.peer_id.unwrap_or(PEER_ID_DISABLED);
            if packet.peer_id != Some(expected) {
                warn!(got = ?packet.peer_id, expected, "dropping data packet with foreign peer id");
                return Ok(None);
            }
        }
        let header_len = if packet.code == PacketCode::DataV2 { 4 } else { 1 };

        if self.cipher.is_aead() {
            if packet.payload.len() < 4 + DataCipher::TAG_SIZE {
                return Err(ProtocolError::PacketTooShort {
                    expected: header_len + 4 + DataCipher::TAG_SIZE,
                    got: frame.len(),
                });
            }
            let packet_id = u32::from_be_bytes(
                packet.payload[..4].try_into().expect("length checked"),
            );
            if !self.replay.is_acceptable(packet_id) {
                warn!(packet_id, "dropping replayed or stale data packet");
                return Ok(None);
            }

            let nonce = self.decrypt_side.gcm_nonce(packet_id);
            // AD spans the cleartext prefix: opcode, peer id, packet id.
            let ad = &frame[..header_len + 4];
            let plain = self
                .decrypt_side
                .ctx
                .open(&nonce, &packet.payload[4..], ad)?;
            self.replay.record(packet_id);

            let mut plain = SecureBuf::from_slice(&plain);
            self.strip_framing(&mut plain)
        } else {
            let hmac_key = self
                .decrypt_side
                .hmac
                .as_ref()
                .expect("CBC side always has an HMAC key");
            let tag_len = hmac_key.digest().output_size();
            let min = tag_len + DataCipher::CBC_IV_SIZE;
            if packet.payload.len() < min {
                return Err(ProtocolError::PacketTooShort {
                    expected: header_len + min,
                    got: frame.len(),
                });
            }

            let (tag, rest) = packet.payload.split_at(tag_len);
            let (iv, ciphertext) = rest.split_at(DataCipher::CBC_IV_SIZE);
            hmac_key.verify(&[iv, ciphertext], tag)?;

            let plain = self.decrypt_side.ctx.cbc_decrypt(iv, ciphertext)?;
            let mut plain = SecureBuf::from_slice(&plain);
            if plain.len() < 4 {
                return Err(ProtocolError::PacketTooShort {
                    expected: 4,
                    got: plain.len(),
                });
            }
            let packet_id =
                u32::from_be_bytes(plain.as_slice()[..4].try_into().expect("length checked"));
            plain.truncate_front(4);

            if !self.replay.is_acceptable(packet_id) {
                warn!(packet_id, "dropping replayed or stale data packet");
                return Ok(None);
            }
            self.replay.record(packet_id);

            self.strip_framing(&mut plain)
        }
    }

    fn prepend_framing(&self, plain: &mut SecureBuf) {
        match self.framing {
            CompressionFraming::Disabled => {}
            CompressionFraming::CompLzo => plain.push(LZO_NO_COMPRESS),
            CompressionFraming::Compress => plain.push(COMPRESS_NO_COMPRESS),
        }
    }

    fn strip_framing(&self, plain: &mut SecureBuf) -> Result<Option<SecureBuf>> {
        let expected = match self.framing {
            CompressionFraming::Disabled => return Ok(Some(std::mem::take(plain))),
            CompressionFraming::CompLzo => LZO_NO_COMPRESS,
            CompressionFraming::Compress => COMPRESS_NO_COMPRESS,
        };
        match plain.as_slice().first() {
            Some(&marker) if marker == expected => {
                plain.truncate_front(1);
                Ok(Some(std::mem::take(plain)))
            }
            Some(&marker) => {
                // Active compression is never negotiated; anything else here
                // means a framing mismatch with the server.
                warn!(marker, "dropping data packet with unexpected compression marker");
                Ok(None)
            }
            None => Ok(Some(std::mem::take(plain))),
        }
    }
}

/// Sliding replay-protection window over data-channel packet ids.
///
/// A 128-bit bitmap tracks the most recent ids relative to the highest seen:
/// ids at or below the left edge are stale, ids already marked are replays,
/// new highs advance the window.
struct ReplayWindow {
    highest: u32,
    bitmap: u128,
}

impl ReplayWindow {
    const WINDOW_SIZE: u32 = 128;

    fn new() -> Self {
        Self {
            highest: 0,
            bitmap: 0,
        }
    }

    /// Whether `packet_id` would be accepted, without mutating the window.
    ///
    /// Kept separate from [`record`](Self::record) so the window only
    /// advances after the packet authenticates.
    fn is_acceptable(&self, packet_id: u32) -> bool {
        if packet_id == 0 {
            return false;
        }
        if packet_id > self.highest {
            return true;
        }
        let diff = self.highest - packet_id;
        if diff >= Self::WINDOW_SIZE {
            return false;
        }
        self.bitmap & (1u128 << diff) == 0
    }

    /// Mark `packet_id` as seen.
    fn record(&mut self, packet_id: u32) {
        if packet_id > self.highest {
            let shift = packet_id - self.highest;
            if shift >= Self::WINDOW_SIZE {
                self.bitmap = 1;
            } else {
                self.bitmap = (self.bitmap << shift) | 1;
            }
            self.highest = packet_id;
        } else {
            let diff = self.highest - packet_id;
            if diff < Self::WINDOW_SIZE {
                self.bitmap |= 1u128 << diff;
            }
        }
    }
}
