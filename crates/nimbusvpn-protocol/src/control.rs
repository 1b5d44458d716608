//! Reliability layer for the control channel
//!
//! OpenVPN's control channel is a reliable, ordered, acknowledged
//! sub-protocol running over an unreliable link. This module owns the
//! sliding send queue with retransmission, the inbound reordering buffer,
//! pending acks, and the optional pre-shared-key wrapping of control
//! packets (`tls-auth` / `tls-crypt`).

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, warn};

use nimbusvpn_crypto::{TlsAuthWrapper, TlsCryptWrapper};

use crate::packet::{ControlPacket, PacketId, SessionId, MAX_ACKS_PER_PACKET};
use crate::{KeyId, PacketCode, ProtocolError, Result};

/// Fixed control header: first byte, session id, ack count, packet id.
const CONTROL_HEADER_LEN: usize = 1 + 8 + 1 + 4;
/// Space reserved for piggybacked acks when sizing payload chunks.
const ACK_ALLOWANCE: usize = 8 * 4 + 8;
/// Smallest chunk budget we will ever use, whatever the MTU says.
const MIN_CHUNK: usize = 100;

/// Pre-shared-key wrapping applied to every control packet.
pub enum ControlChannelWrap {
    /// `tls-auth`: trailing HMAC
    Auth(TlsAuthWrapper),
    /// `tls-crypt`: AES-256-CTR + HMAC-SHA256
    Crypt(TlsCryptWrapper),
}

impl ControlChannelWrap {
    fn overhead(&self) -> usize {
        match self {
            ControlChannelWrap::Auth(w) => w.overhead(),
            ControlChannelWrap::Crypt(w) => w.overhead(),
        }
    }
}

/// An outbound control packet awaiting acknowledgment.
struct OutboundSlot {
    packet_id: PacketId,
    code: PacketCode,
    key_id: KeyId,
    payload: Bytes,
    last_sent: Option<Instant>,
    retransmits: u32,
}

/// The control channel: send window, retransmission, ack bookkeeping, and
/// in-order inbound delivery.
pub struct ControlChannel {
    local_session_id: SessionId,
    remote_session_id: Option<SessionId>,
    next_outbound_id: PacketId,
    outbound: VecDeque<OutboundSlot>,
    next_inbound_id: PacketId,
    inbound: BTreeMap<PacketId, ControlPacket>,
    pending_acks: VecDeque<PacketId>,
    wrap: Option<ControlChannelWrap>,
    retransmission_interval: Duration,
}

impl ControlChannel {
    /// Create a channel with no control-packet wrapping.
    pub fn new(local_session_id: SessionId, retransmission_interval: Duration) -> Self {
        Self::with_wrap(local_session_id, retransmission_interval, None)
    }

    /// Create a channel with optional `tls-auth`/`tls-crypt` wrapping.
    pub fn with_wrap(
        local_session_id: SessionId,
        retransmission_interval: Duration,
        wrap: Option<ControlChannelWrap>,
    ) -> Self {
        Self {
            local_session_id,
            remote_session_id: None,
            next_outbound_id: 0,
            outbound: VecDeque::new(),
            next_inbound_id: 0,
            inbound: BTreeMap::new(),
            pending_acks: VecDeque::new(),
            wrap,
            retransmission_interval,
        }
    }

    /// Local session id carried in every outbound packet.
    pub fn local_session_id(&self) -> &SessionId {
        &self.local_session_id
    }

    /// Remote session id, once learned from the server hard reset.
    pub fn remote_session_id(&self) -> Option<&SessionId> {
        self.remote_session_id.as_ref()
    }

    /// Pin the remote session id.
    pub fn set_remote_session_id(&mut self, sid: SessionId) {
        self.remote_session_id = Some(sid);
    }

    /// Whether any outbound packet is still awaiting an ack.
    pub fn has_pending_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Whether acks are waiting to be sent.
    pub fn has_pending_acks(&self) -> bool {
        !self.pending_acks.is_empty()
    }

    /// Queue a logical payload, chunked across MTU-sized control packets
    /// with sequential packet ids.
    pub fn enqueue_outbound(&mut self, code: PacketCode, key_id: KeyId, payload: &[u8], mtu: usize) {
        let budget = self.chunk_budget(mtu);
        let mut chunks: Vec<&[u8]> = payload.chunks(budget).collect();
        if chunks.is_empty() {
            // Resets carry an empty payload but still occupy a packet id.
            chunks.push(&[]);
        }
        for chunk in chunks {
            let packet_id = self.next_outbound_id;
            self.next_outbound_id = self.next_outbound_id.wrapping_add(1);
            self.outbound.push_back(OutboundSlot {
                packet_id,
                code,
                key_id,
                payload: Bytes::copy_from_slice(chunk),
                last_sent: None,
                retransmits: 0,
            });
        }
    }

    /// Serialize everything ready to go.
    ///
    /// Unsent packets always go; sent-but-unacked packets are retransmitted
    /// once per [`retransmission_interval`] unless the link is reliable.
    /// Pending acks piggyback on the first packet of the flight; when no
    /// packet is due they go out as a standalone ack, first in the flight.
    pub fn write_outbound(
        &mut self,
        now: Instant,
        timestamp: u32,
        reliable_link: bool,
    ) -> Result<Vec<Vec<u8>>> {
        let mut flight = Vec::new();
        let mut acks_attached = false;

        let interval = self.retransmission_interval;
        let mut due_ids: Vec<usize> = Vec::new();
        for (idx, slot) in self.outbound.iter().enumerate() {
            let due = match slot.last_sent {
                None => true,
                Some(sent) => !reliable_link && now.duration_since(sent) >= interval,
            };
            if due {
                due_ids.push(idx);
            }
        }

        // Retransmissions go in ascending packet-id order; the queue is
        // already ordered by construction.
        for idx in due_ids {
            let acks = if !acks_attached {
                acks_attached = true;
                self.take_acks()
            } else {
                Vec::new()
            };
            let ack_remote_session_id = if acks.is_empty() {
                None
            } else {
                self.remote_session_id
            };

            let slot = &self.outbound[idx];
            let packet = ControlPacket {
                code: slot.code,
                key_id: slot.key_id,
                session_id: self.local_session_id,
                acks,
                ack_remote_session_id,
                packet_id: Some(slot.packet_id),
                payload: slot.payload.clone(),
            };
            let wire = self.seal(&packet, timestamp)?;
            flight.push(wire);

            let slot = &mut self.outbound[idx];
            if slot.last_sent.is_some() {
                slot.retransmits += 1;
                debug!(packet_id = slot.packet_id, retries = slot.retransmits, "retransmitting control packet");
            }
            slot.last_sent = Some(now);
        }

        if !acks_attached {
            if let Some(ack) = self.write_acks(KeyId::new(0), timestamp)? {
                // Acks take the front slot of the flight.
                flight.insert(0, ack);
            }
        }

        Ok(flight)
    }

    /// Standalone ack packet for everything pending, or `None` when there is
    /// nothing to ack.
    pub fn write_acks(&mut self, key_id: KeyId, timestamp: u32) -> Result<Option<Vec<u8>>> {
        let acks = self.take_acks();
        if acks.is_empty() {
            return Ok(None);
        }
        let packet = ControlPacket {
            code: PacketCode::AckV1,
            key_id,
            session_id: self.local_session_id,
            ack_remote_session_id: self.remote_session_id,
            acks,
            packet_id: None,
            payload: Bytes::new(),
        };
        Ok(Some(self.seal(&packet, timestamp)?))
    }

    /// Remove acked packets from the retransmission set.
    pub fn process_acks(&mut self, acks: &[PacketId]) {
        self.outbound.retain(|slot| !acks.contains(&slot.packet_id));
    }

    /// Parse an inbound control packet, unwrapping first when a tls-wrap key
    /// is configured.
    pub fn read_inbound(&mut self, data: &[u8]) -> Result<ControlPacket> {
        if data.is_empty() {
            return Err(ProtocolError::PacketTooShort { expected: 1, got: 0 });
        }
        let code = PacketCode::from_byte(data[0])?;
        if !code.is_control() {
            return Err(ProtocolError::InvalidPacket(
                "data packet routed to control channel".into(),
            ));
        }

        match &mut self.wrap {
            None => ControlPacket::parse(data),
            Some(ControlChannelWrap::Auth(wrapper)) => {
                let bare = wrapper.unwrap(data)?;
                ControlPacket::parse(&bare)
            }
            Some(ControlChannelWrap::Crypt(wrapper)) => {
                if data.len() < 9 {
                    return Err(ProtocolError::PacketTooShort {
                        expected: 9,
                        got: data.len(),
                    });
                }
                let (header, tail) = data.split_at(9);
                let key_id = KeyId::from_byte(data[0]);
                let mut session_id = [0u8; 8];
                session_id.copy_from_slice(&header[1..9]);

                let body = wrapper.unwrap(header, tail)?;
                let (packet, _) =
                    ControlPacket::parse_body(code, key_id, session_id, body.as_slice())?;
                Ok(packet)
            }
        }
    }

    /// Buffer a packet by id and return the contiguous in-order prefix that
    /// became deliverable. Duplicates are dropped (but still acked).
    pub fn enqueue_inbound(&mut self, packet: ControlPacket) -> Vec<ControlPacket> {
        let Some(packet_id) = packet.packet_id else {
            warn!("control packet without packet id handed to reassembly");
            return Vec::new();
        };

        // Ack everything with an id, duplicates included, so a lost ack
        // does not wedge the peer's window.
        self.queue_ack(packet_id);

        if packet_id < self.next_inbound_id {
            debug!(packet_id, "dropping duplicate control packet below window");
            return Vec::new();
        }
        if self.inbound.contains_key(&packet_id) {
            debug!(packet_id, "dropping duplicate buffered control packet");
            return Vec::new();
        }
        self.inbound.insert(packet_id, packet);

        let mut ready = Vec::new();
        while let Some(next) = self.inbound.remove(&self.next_inbound_id) {
            self.next_inbound_id = self.next_inbound_id.wrapping_add(1);
            ready.push(next);
        }
        ready
    }

    fn queue_ack(&mut self, packet_id: PacketId) {
        if !self.pending_acks.contains(&packet_id) {
            self.pending_acks.push_back(packet_id);
        }
    }

    fn take_acks(&mut self) -> Vec<PacketId> {
        let take = self.pending_acks.len().min(MAX_ACKS_PER_PACKET);
        self.pending_acks.drain(..take).collect()
    }

    fn chunk_budget(&self, mtu: usize) -> usize {
        let overhead = CONTROL_HEADER_LEN
            + ACK_ALLOWANCE
            + self.wrap.as_ref().map_or(0, ControlChannelWrap::overhead);
        mtu.saturating_sub(overhead).max(MIN_CHUNK)
    }

    fn seal(&mut self, packet: &ControlPacket, timestamp: u32) -> Result<Vec<u8>> {
        match &mut self.wrap {
            None => Ok(packet.serialize().to_vec()),
            Some(ControlChannelWrap::Auth(wrapper)) => {
                Ok(wrapper.wrap(&packet.serialize(), timestamp))
            }
            Some(ControlChannelWrap::Crypt(wrapper)) => {
                let (mut header, body) = packet.serialize_split();
                let tail = wrapper.wrap(&header, &body, timestamp)?;
                header.extend_from_slice(&tail);
                Ok(header)
            }
        }
    }
}
