//! Session engine
//!
//! The state machine orchestrating hard reset -> TLS -> authentication ->
//! push -> connected, soft renegotiation, keepalive, and shutdown. The
//! engine is deterministic and I/O free: inbound frames and clock ticks go
//! in, link/tunnel frames and typed events come out, and the async runner
//! shuttles both. Every `now` is injected, so timing behavior is fully
//! unit-testable.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use nimbusvpn_core::{
    Credentials, DataCount, SessionConfig, SessionError, SessionStatus, TlsWrapStrategy,
};
use nimbusvpn_crypto::{md5_hex_of_pem, random_session_id, SecureBuf, StaticKey};
use nimbusvpn_protocol::{
    Authenticator, ControlChannel, ControlChannelWrap, DataPath, KeyId, PacketCode, ProtocolError,
    PushReply, TlsLink, AUTH_FAILED_MESSAGE, NUMBER_OF_KEYS, PING_MAGIC, PUSH_REPLY_PREFIX,
};

use crate::event::SessionEvent;
use crate::io::LinkProperties;
use crate::key::{ControlState, KeyState, SessionKey};

/// The push-request poll message, repeated until the reply lands.
const PUSH_REQUEST: &[u8] = b"PUSH_REQUEST\0";

/// Client side of one OpenVPN session.
pub struct Session {
    config: SessionConfig,
    credentials: Credentials,
    control: ControlChannel,

    keys: [Option<SessionKey>; NUMBER_OF_KEYS as usize],
    current_key: Option<u8>,
    old_key: Option<u8>,
    negotiating_key: Option<u8>,

    link: Option<LinkProperties>,
    status: SessionStatus,
    is_stopping: bool,
    started: bool,

    peer_id: Option<u32>,
    auth_token: Option<String>,
    negotiated_keep_alive: Option<Duration>,
    negotiated_ping_timeout: Option<Duration>,

    last_inbound: Instant,
    last_outbound: Instant,
    last_push_request: Option<Instant>,

    link_out: VecDeque<Vec<u8>>,
    tun_out: VecDeque<Vec<u8>>,
    events: VecDeque<SessionEvent>,
    stats: Arc<DataCount>,
}

impl Session {
    /// Build a session from its immutable configuration.
    pub fn new(config: SessionConfig, credentials: Credentials) -> Result<Self, SessionError> {
        config
            .validate()
            .map_err(SessionError::InvalidConfiguration)?;

        let wrap = match &config.tls_wrap {
            None => None,
            Some(wrap_config) => {
                let mut static_key = StaticKey::from_file_body(&wrap_config.key_file)?;
                // Key files are written from the server's perspective;
                // key-direction 1 (the client norm) mirrors the halves.
                if wrap_config.key_direction != Some(0) {
                    static_key = static_key.inverted();
                }
                Some(match wrap_config.strategy {
                    TlsWrapStrategy::Auth => ControlChannelWrap::Auth(
                        nimbusvpn_crypto::TlsAuthWrapper::new(config.digest, &static_key)?,
                    ),
                    TlsWrapStrategy::Crypt => ControlChannelWrap::Crypt(
                        nimbusvpn_crypto::TlsCryptWrapper::new(&static_key)?,
                    ),
                })
            }
        };

        let now = Instant::now();
        Ok(Self {
            control: ControlChannel::with_wrap(
                random_session_id(),
                config.retransmission_interval,
                wrap,
            ),
            config,
            credentials,
            keys: std::array::from_fn(|_| None),
            current_key: None,
            old_key: None,
            negotiating_key: None,
            link: None,
            status: SessionStatus::Stopped,
            is_stopping: false,
            started: false,
            peer_id: None,
            auth_token: None,
            negotiated_keep_alive: None,
            negotiated_ping_timeout: None,
            last_inbound: now,
            last_outbound: now,
            last_push_request: None,
            link_out: VecDeque::new(),
            tun_out: VecDeque::new(),
            events: VecDeque::new(),
            stats: DataCount::shared(),
        })
    }

    /// Begin negotiating over the given link: emits the client hard reset
    /// on key id 0.
    pub fn start(&mut self, link: LinkProperties, now: Instant) {
        if self.is_stopping {
            return;
        }
        info!(remote = %link.remote_address, "session starting");
        self.link = Some(link);
        self.last_inbound = now;
        self.last_outbound = now;
        self.set_status(SessionStatus::Connecting);

        self.keys[0] = Some(SessionKey::new(KeyId::new(0), now, false));
        self.negotiating_key = Some(0);

        let payload = self.hard_reset_payload();
        let mtu = self.link_mtu();
        self.control
            .enqueue_outbound(PacketCode::HardResetClientV2, KeyId::new(0), &payload, mtu);
        if let Err(e) = self.flush_control(now) {
            self.fail(e);
        }
    }

    /// Observable status.
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Shared traffic counters.
    pub fn stats(&self) -> Arc<DataCount> {
        self.stats.clone()
    }

    /// Whether the session has stopped (fatally or for reconnect).
    pub fn is_stopped(&self) -> bool {
        self.is_stopping
    }

    /// Link rebinding is only permitted once a push reply carried a peer id.
    pub fn can_rebind_link(&self) -> bool {
        self.peer_id.is_some()
    }

    /// Swap the link in place without resetting keys or session ids.
    /// Returns `false` when rebinding is not permitted.
    pub fn rebind_link(&mut self, link: LinkProperties) -> bool {
        if self.is_stopping || !self.can_rebind_link() {
            return false;
        }
        info!(remote = %link.remote_address, "rebinding link");
        self.link = Some(link);
        true
    }

    /// Process one frame received from the link.
    pub fn handle_link_packet(&mut self, data: &[u8], now: Instant) {
        if self.is_stopping {
            return;
        }
        if let Err(e) = self.process_link_packet(data, now) {
            self.fail(e);
        }
    }

    /// Encrypt one IP packet from the tunnel toward the link.
    pub fn handle_tunnel_packet(&mut self, data: &[u8], now: Instant) {
        if self.is_stopping || !self.status.is_established() {
            return;
        }
        let Some(idx) = self.current_key else { return };
        let Some(path) = self.keys[idx as usize]
            .as_mut()
            .and_then(|key| key.data.as_mut())
        else {
            return;
        };
        match path.encrypt(data) {
            Ok(frame) => {
                self.stats.record_out(data.len());
                self.link_out.push_back(frame);
                self.last_outbound = now;
            }
            Err(e) => warn!(error = %e, "dropping outbound packet that failed to encrypt"),
        }
    }

    /// Timer tick: retransmission, negotiation deadlines, push-request
    /// retries, keepalive, renegotiation.
    pub fn handle_tick(&mut self, now: Instant) {
        if self.is_stopping {
            return;
        }
        if let Err(e) = self.tick_inner(now) {
            self.fail(e);
        }
    }

    /// Next frame queued for the link, if any.
    pub fn next_link_packet(&mut self) -> Option<Vec<u8>> {
        self.link_out.pop_front()
    }

    /// Next decrypted IP packet queued for the tunnel, if any.
    pub fn next_tunnel_packet(&mut self) -> Option<Vec<u8>> {
        self.tun_out.pop_front()
    }

    /// Next pending event, if any.
    pub fn poll_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    /// Stop for good. Idempotent.
    pub fn shutdown(&mut self, reason: Option<SessionError>) {
        self.stop(false, reason);
    }

    /// Stop and signal the owner to re-establish. Idempotent.
    pub fn reconnect(&mut self, reason: Option<SessionError>) {
        self.stop(true, reason);
    }

    /// The runner reports link write failures here; they are recoverable.
    pub fn report_link_write_failure(&mut self, detail: String) {
        self.stop(true, Some(SessionError::FailedLinkWrite(detail)));
    }

    // ---- inbound ---------------------------------------------------------

    fn process_link_packet(&mut self, data: &[u8], now: Instant) -> Result<(), SessionError> {
        let Some(first) = data.first() else {
            warn!("dropping empty link frame");
            return Ok(());
        };
        let code = match PacketCode::from_byte(*first) {
            Ok(code) => code,
            Err(ProtocolError::UnknownOpcode(code)) => {
                warn!(code, "dropping packet with unknown opcode");
                return Ok(());
            }
            Err(_) => return Ok(()),
        };

        if code.is_data() {
            self.process_data_packet(data, now)?;
        } else {
            self.process_control_packet(data, now)?;
        }
        self.flush_control(now)
    }

    fn process_control_packet(&mut self, data: &[u8], now: Instant) -> Result<(), SessionError> {
        let packet = match self.control.read_inbound(data) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(error = %e, "dropping malformed control packet");
                return Ok(());
            }
        };
        self.last_inbound = now;

        // Session id discipline: the remote id, once pinned, never changes.
        match self.control.remote_session_id() {
            None => {
                if packet.code != PacketCode::HardResetServerV2 {
                    return Err(SessionError::MissingSessionId);
                }
                self.control.set_remote_session_id(packet.session_id);
            }
            Some(remote) if *remote != packet.session_id => {
                return if packet.code == PacketCode::HardResetServerV2 {
                    // A fresh server session while ours is underway.
                    Err(SessionError::StaleSession)
                } else {
                    Err(SessionError::SessionMismatch)
                };
            }
            Some(_) => {}
        }
        if let Some(ack_sid) = packet.ack_remote_session_id {
            if ack_sid != *self.control.local_session_id() {
                return Err(SessionError::SessionMismatch);
            }
        }
        self.control.process_acks(&packet.acks);

        if packet.code == PacketCode::AckV1 {
            return Ok(());
        }
        for ready in self.control.enqueue_inbound(packet) {
            match ready.code {
                PacketCode::HardResetServerV2 => self.on_hard_reset_server(now)?,
                PacketCode::SoftResetV1 => self.on_soft_reset(ready.key_id, now)?,
                PacketCode::ControlV1 => self.on_control_v1(ready.key_id, &ready.payload, now)?,
                other => warn!(code = %other, "dropping unexpected control packet"),
            }
        }
        Ok(())
    }

    fn on_hard_reset_server(&mut self, now: Instant) -> Result<(), SessionError> {
        let fresh = matches!(
            self.keys[0].as_ref().map(|key| key.state),
            Some(KeyState::HardReset)
        );
        if self.current_key.is_some() || !fresh {
            return Err(SessionError::StaleSession);
        }

        let mut key = self.keys[0].take().expect("state checked above");
        key.state = KeyState::Tls;
        key.tls = Some(self.start_tls()?);
        debug!("remote session pinned, TLS starting on key 0");
        self.set_status(SessionStatus::Handshaking);

        let result = self.advance_key(&mut key, None, now);
        self.keys[0] = Some(key);
        debug_assert!(!matches!(&result, Ok(Some(_))));
        result.map(|_| ())
    }

    fn on_soft_reset(&mut self, key_id: KeyId, now: Instant) -> Result<(), SessionError> {
        if self.negotiating_key == Some(key_id.0) {
            // Echo of a renegotiation already underway.
            return Ok(());
        }
        if key_id.0 == 0 {
            warn!("dropping soft reset on the reserved key id 0");
            return Ok(());
        }
        info!(key_id = key_id.0, "server requested renegotiation");
        self.begin_negotiation(key_id, now, false)
    }

    fn on_control_v1(
        &mut self,
        key_id: KeyId,
        payload: &[u8],
        now: Instant,
    ) -> Result<(), SessionError> {
        let idx = key_id.0 as usize;
        let Some(mut key) = self.keys[idx].take() else {
            warn!(key_id = key_id.0, "dropping control payload for unknown key");
            return Ok(());
        };
        if key.state == KeyState::HardReset {
            self.keys[idx] = Some(key);
            warn!(key_id = key_id.0, "dropping control payload before server reset");
            return Ok(());
        }
        if key.state == KeyState::SoftReset {
            // Server acknowledged our soft reset; the handshake begins now.
            key.state = KeyState::Tls;
            match self.start_tls() {
                Ok(tls) => key.tls = Some(tls),
                Err(e) => {
                    self.keys[idx] = Some(key);
                    return Err(e);
                }
            }
        }

        let result = self.advance_key(&mut key, Some(payload), now);
        self.keys[idx] = Some(key);
        if let Some(reply) = result? {
            self.finish_negotiation(key_id.0, reply);
        }
        Ok(())
    }

    fn process_data_packet(&mut self, data: &[u8], now: Instant) -> Result<(), SessionError> {
        let key_id = data[0] & 0x07;
        let Some(key) = self.keys[key_id as usize].as_mut() else {
            return Err(SessionError::BadKey(key_id));
        };
        let Some(path) = key.data.as_mut() else {
            warn!(key_id, "dropping data packet for a key still negotiating");
            return Ok(());
        };

        match path.decrypt(data) {
            Err(e) => {
                warn!(error = %e, "dropping data packet that failed to authenticate");
                Ok(())
            }
            Ok(None) => Ok(()),
            Ok(Some(plain)) => {
                self.last_inbound = now;
                if plain.as_slice() == PING_MAGIC {
                    debug!("keepalive ping received");
                    return Ok(());
                }
                self.stats.record_in(plain.len());
                self.tun_out.push_back(plain.as_slice().to_vec());
                Ok(())
            }
        }
    }

    // ---- negotiation -----------------------------------------------------

    /// Drive one key's TLS and authentication forward. Returns the push
    /// reply once the negotiation reaches it.
    fn advance_key(
        &mut self,
        key: &mut SessionKey,
        inbound: Option<&[u8]>,
        now: Instant,
    ) -> Result<Option<PushReply>, SessionError> {
        if let Some(data) = inbound {
            let tls = key.tls.as_mut().expect("TLS started before payloads");
            tls.put_cipher_text(data).map_err(map_tls_error)?;
        }
        self.drain_tls(key)?;

        if key.state == KeyState::Tls
            && key.tls.as_ref().expect("in TLS state").is_handshake_complete()
        {
            key.tls
                .as_mut()
                .expect("in TLS state")
                .verify_peer_eku()
                .map_err(map_tls_error)?;
            debug!(key_id = key.id.0, "TLS up, sending key material");
            key.state = KeyState::Authenticating;
            if !self.started {
                // Renegotiations keep the tunnel up; the observable status
                // only walks the ladder on the initial connect.
                self.set_status(SessionStatus::Authenticating);
            }

            let auth = Authenticator::new(
                &self.credentials,
                self.auth_token.as_deref(),
                self.config.compression_framing,
            );
            let request = auth.write_auth_request();
            key.tls
                .as_mut()
                .expect("in TLS state")
                .put_plain_text(request.as_slice())
                .map_err(map_tls_error)?;
            key.auth = Some(auth);
            self.drain_tls(key)?;
        }

        if key.state != KeyState::Authenticating {
            return Ok(None);
        }

        let mut plain = SecureBuf::new();
        key.tls
            .as_mut()
            .expect("authenticating over TLS")
            .pull_plain_text(&mut plain)
            .map_err(map_tls_error)?;
        if plain.is_empty() {
            return Ok(None);
        }

        let auth = key.auth.as_mut().expect("authenticator exists");
        let messages = auth.feed(plain.as_slice()).map_err(|e| match e {
            ProtocolError::WrongControlDataPrefix => SessionError::WrongControlDataPrefix,
            other => SessionError::TlsHandshake(other.to_string()),
        })?;

        if auth.server_randoms_ready() && key.control_state == ControlState::PreAuth {
            key.control_state = ControlState::PreIfConfig;
            self.send_push_request(key, now)?;
        }

        for message in messages {
            if message.starts_with(AUTH_FAILED_MESSAGE) {
                return Err(SessionError::BadCredentials);
            }
            if message.starts_with(PUSH_REPLY_PREFIX) {
                match PushReply::parse(&message) {
                    Ok(reply) => return self.apply_push_reply(key, reply).map(Some),
                    Err(e) => {
                        warn!(error = %e, "dropping unparseable push reply");
                    }
                }
            } else {
                debug!(%message, "ignoring control-channel message");
            }
        }
        Ok(None)
    }

    /// Derive data keys and wire up the data path for a negotiation that
    /// just received its push reply.
    fn apply_push_reply(
        &mut self,
        key: &mut SessionKey,
        reply: PushReply,
    ) -> Result<PushReply, SessionError> {
        let local_sid = *self.control.local_session_id();
        let remote_sid = *self
            .control
            .remote_session_id()
            .ok_or(SessionError::MissingSessionId)?;

        let material = key
            .auth
            .as_ref()
            .expect("authenticator exists")
            .derive_data_keys(&local_sid, &remote_sid)
            .map_err(map_protocol_error)?;

        let cipher = reply.cipher.unwrap_or(self.config.cipher);
        let framing = reply.compression.unwrap_or(self.config.compression_framing);
        if reply.peer_id.is_none() {
            warn!("push reply carried no peer id; data frames will stamp the disabled sentinel");
        }
        key.data = Some(
            DataPath::new(
                cipher,
                self.config.digest,
                &material,
                framing,
                reply.peer_id,
                key.id,
            )
            .map_err(map_protocol_error)?,
        );
        key.state = KeyState::Connected;
        key.control_state = ControlState::Connected;
        info!(key_id = key.id.0, cipher = cipher.option_name(), "negotiation complete");
        Ok(reply)
    }

    /// Ring bookkeeping once a key connects: the previous current becomes
    /// the single old key, and the key before that is destroyed.
    fn finish_negotiation(&mut self, idx: u8, reply: PushReply) {
        if let Some(previous) = self.current_key.take() {
            if previous != idx {
                if let Some(stale) = self.old_key.take() {
                    // Scrubbed on drop.
                    self.keys[stale as usize] = None;
                }
                self.old_key = Some(previous);
            }
        }
        self.current_key = Some(idx);
        self.negotiating_key = None;
        self.last_push_request = None;

        self.peer_id = reply.peer_id;
        if let Some(token) = &reply.auth_token {
            self.auth_token = Some(token.clone());
        }
        if let Some(ping) = reply.ping {
            self.negotiated_keep_alive = Some(Duration::from_secs(ping.into()));
        }
        if let Some(restart) = reply.ping_restart {
            self.negotiated_ping_timeout = Some(Duration::from_secs(restart.into()));
        }

        self.set_status(SessionStatus::Established);
        if !self.started {
            self.started = true;
            let remote_address = self
                .link
                .as_ref()
                .map(|l| l.remote_address.clone())
                .unwrap_or_default();
            self.events.push_back(SessionEvent::Started {
                remote_address,
                reply,
            });
        }
    }

    /// Allocate a negotiation key and start TLS on it. `announce` emits the
    /// client-side soft reset packet.
    fn begin_negotiation(
        &mut self,
        key_id: KeyId,
        now: Instant,
        announce: bool,
    ) -> Result<(), SessionError> {
        let idx = key_id.0 as usize;
        if self.old_key == Some(key_id.0) {
            self.old_key = None;
        }

        let mut key = SessionKey::new(key_id, now, true);
        key.state = KeyState::Tls;
        key.tls = Some(self.start_tls()?);

        if announce {
            let mtu = self.link_mtu();
            self.control
                .enqueue_outbound(PacketCode::SoftResetV1, key_id, &[], mtu);
        }
        let result = self.advance_key(&mut key, None, now);
        self.keys[idx] = Some(key);
        self.negotiating_key = Some(key_id.0);
        result.map(|_| ())
    }

    fn start_tls(&self) -> Result<TlsLink, SessionError> {
        let remote = self
            .link
            .as_ref()
            .map(|l| l.remote_address.clone())
            .unwrap_or_default();
        TlsLink::start(&self.config, &remote).map_err(map_tls_error)
    }

    fn drain_tls(&mut self, key: &mut SessionKey) -> Result<(), SessionError> {
        let mtu = self.link_mtu();
        let tls = key.tls.as_mut().expect("TLS started");
        while let Some(records) = tls.pull_cipher_text().map_err(map_tls_error)? {
            self.control
                .enqueue_outbound(PacketCode::ControlV1, key.id, &records, mtu);
        }
        Ok(())
    }

    fn send_push_request(
        &mut self,
        key: &mut SessionKey,
        now: Instant,
    ) -> Result<(), SessionError> {
        key.tls
            .as_mut()
            .expect("push request rides TLS")
            .put_plain_text(PUSH_REQUEST)
            .map_err(map_tls_error)?;
        self.drain_tls(key)?;
        self.last_push_request = Some(now);
        Ok(())
    }

    // ---- timers ----------------------------------------------------------

    fn tick_inner(&mut self, now: Instant) -> Result<(), SessionError> {
        // Negotiation deadlines
        if let Some(idx) = self.negotiating_key {
            if let Some(key) = self.keys[idx as usize].as_ref() {
                if key.has_timed_out(&self.config, now) {
                    if !key.is_soft && self.current_key.is_none() {
                        // The link may simply have moved under us.
                        self.reconnect(Some(SessionError::NegotiationTimeout));
                    } else {
                        self.shutdown(Some(SessionError::NegotiationTimeout));
                    }
                    return Ok(());
                }
            }
        }

        // Client-initiated soft renegotiation
        if let (Some(interval), Some(current), None) = (
            self.config.renegotiation(),
            self.current_key,
            self.negotiating_key,
        ) {
            let elapsed = self.keys[current as usize]
                .as_ref()
                .map(|key| now.duration_since(key.start_time));
            if elapsed.is_some_and(|e| e > interval) {
                let next = KeyId::new(current).next_negotiation();
                info!(key_id = next.0, "renegotiating session keys");
                self.begin_negotiation(next, now, true)?;
            }
        }

        // Push-request retries while waiting for the reply. On reliable
        // links the time gate is replaced by "no control packet awaiting
        // an ack".
        if let Some(idx) = self.negotiating_key {
            let reliable = self.link.as_ref().is_some_and(|l| l.is_reliable);
            let elapsed = self
                .last_push_request
                .is_some_and(|t| now.duration_since(t) >= self.config.retransmission_interval);
            let due = elapsed && (!reliable || !self.control.has_pending_outbound());
            if due {
                if let Some(mut key) = self.keys[idx as usize].take() {
                    let result = if key.control_state == ControlState::PreIfConfig {
                        self.send_push_request(&mut key, now)
                    } else {
                        Ok(())
                    };
                    self.keys[idx as usize] = Some(key);
                    result?;
                }
            }
        }

        // Liveness
        if self.status.is_established() {
            let timeout = self
                .negotiated_ping_timeout
                .unwrap_or(self.config.ping_timeout);
            if now.duration_since(self.last_inbound) > timeout {
                self.shutdown(Some(SessionError::PingTimeout));
                return Ok(());
            }
            let keep_alive = self.negotiated_keep_alive.or(self.config.keep_alive());
            if let Some(interval) = keep_alive {
                if now.duration_since(self.last_outbound) >= interval {
                    self.send_ping(now);
                }
            }
        }

        self.flush_control(now)
    }

    fn send_ping(&mut self, now: Instant) {
        let Some(idx) = self.current_key else { return };
        let Some(path) = self.keys[idx as usize]
            .as_mut()
            .and_then(|key| key.data.as_mut())
        else {
            return;
        };
        match path.encrypt(&PING_MAGIC) {
            Ok(frame) => {
                debug!("sending keepalive ping");
                self.link_out.push_back(frame);
                self.last_outbound = now;
            }
            Err(e) => warn!(error = %e, "failed to encrypt keepalive ping"),
        }
    }

    // ---- plumbing --------------------------------------------------------

    fn flush_control(&mut self, now: Instant) -> Result<(), SessionError> {
        let reliable = self.link.as_ref().is_some_and(|l| l.is_reliable);
        let flight = self
            .control
            .write_outbound(now, unix_timestamp(), reliable)
            .map_err(map_protocol_error)?;
        if !flight.is_empty() {
            self.last_outbound = now;
            self.link_out.extend(flight);
        }
        Ok(())
    }

    fn hard_reset_payload(&self) -> Vec<u8> {
        if !self.config.uses_pia_patches {
            return Vec::new();
        }
        match md5_hex_of_pem(&self.config.ca_pem) {
            Ok(fingerprint) => format!(
                "{fingerprint}:{}:{}",
                self.config.cipher.option_name(),
                self.config.digest.option_name()
            )
            .into_bytes(),
            Err(e) => {
                warn!(error = %e, "CA fingerprint unavailable; sending plain hard reset");
                Vec::new()
            }
        }
    }

    fn link_mtu(&self) -> usize {
        self.link
            .as_ref()
            .map(|l| l.mtu)
            .unwrap_or(self.config.mtu)
            .min(self.config.mtu)
    }

    fn set_status(&mut self, status: SessionStatus) {
        if self.status != status {
            debug!(?status, "status changed");
            self.status = status;
            self.events.push_back(SessionEvent::StatusChanged(status));
        }
    }

    fn fail(&mut self, error: SessionError) {
        let should_reconnect = error.is_recoverable();
        self.stop(should_reconnect, Some(error));
    }

    fn stop(&mut self, should_reconnect: bool, reason: Option<SessionError>) {
        if self.is_stopping {
            return;
        }
        self.is_stopping = true;
        match &reason {
            Some(error) => warn!(%error, should_reconnect, "session stopping"),
            None => info!(should_reconnect, "session stopping"),
        }
        self.set_status(SessionStatus::Stopped);
        self.events.push_back(SessionEvent::Stopped {
            should_reconnect,
            reason,
        });
        self.cleanup();
    }

    /// Drop every key generation; their secrets scrub on drop. Queued but
    /// unwritten frames are discarded, matching the "ignore late I/O"
    /// cancellation rule.
    fn cleanup(&mut self) {
        for slot in &mut self.keys {
            *slot = None;
        }
        self.current_key = None;
        self.old_key = None;
        self.negotiating_key = None;
        self.link_out.clear();
        self.tun_out.clear();
    }
}

fn unix_timestamp() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

fn map_tls_error(error: ProtocolError) -> SessionError {
    match error {
        ProtocolError::PeerVerification(reason) => SessionError::PeerVerificationFailed(reason),
        ProtocolError::ServerEku => SessionError::PeerVerificationFailed("serverEKU".into()),
        ProtocolError::Crypto(inner) => SessionError::Crypto(inner),
        other => SessionError::TlsHandshake(other.to_string()),
    }
}

fn map_protocol_error(error: ProtocolError) -> SessionError {
    match error {
        ProtocolError::Crypto(inner) => SessionError::Crypto(inner),
        ProtocolError::WrongControlDataPrefix => SessionError::WrongControlDataPrefix,
        other => SessionError::TlsHandshake(other.to_string()),
    }
}
