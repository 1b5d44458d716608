//! End-to-end negotiation scenarios against a scripted OpenVPN server.
//!
//! The mock server speaks the real wire protocol: the control channel's
//! reliability layer, a genuine rustls server handshake, the key-method-2
//! exchange, and a data path derived from the same key expansion. Frames
//! shuttle between client and server synchronously with an injected clock,
//! so every timing rule is deterministic.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rcgen::{BasicConstraints, CertificateParams, ExtendedKeyUsagePurpose, IsCa, KeyPair};
use rustls::pki_types::PrivateKeyDer;
use rustls::{ServerConfig, ServerConnection};

use nimbusvpn_core::{Credentials, SessionConfig, SessionError, SessionStatus};
use nimbusvpn_crypto::{
    derive_key_material, AuthDigest, DataCipher, KeyExpansionInputs, KeyMaterial,
};
use nimbusvpn_protocol::{
    ControlChannel, ControlPacket, DataPath, KeyId, PacketCode, PushReply, PING_MAGIC,
};
use nimbusvpn_session::{LinkProperties, Session, SessionEvent};

const REMOTE: &str = "203.0.113.5";
const MTU: usize = 1400;

// ---------------------------------------------------------------------------
// Test PKI
// ---------------------------------------------------------------------------

struct TestPki {
    ca_pem: String,
    server_config: Arc<ServerConfig>,
}

fn make_pki(with_server_eku: bool) -> TestPki {
    let ca_key = KeyPair::generate().unwrap();
    let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();

    let server_key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(vec!["vpn.test".to_string()]).unwrap();
    if with_server_eku {
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    }
    let server_cert = params.signed_by(&server_key, &ca_cert, &ca_key).unwrap();

    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(
            vec![server_cert.der().clone()],
            PrivateKeyDer::Pkcs8(server_key.serialize_der().into()),
        )
        .unwrap();

    TestPki {
        ca_pem: ca_cert.pem(),
        server_config: Arc::new(server_config),
    }
}

// ---------------------------------------------------------------------------
// Mock server
// ---------------------------------------------------------------------------

struct ParsedAuth {
    pre_master: Vec<u8>,
    random1: Vec<u8>,
    random2: Vec<u8>,
}

struct ServerNeg {
    key_id: KeyId,
    tls: ServerConnection,
    plain: Vec<u8>,
    auth: Option<ParsedAuth>,
    header_sent: bool,
    pushed: bool,
}

struct MockServer {
    control: ControlChannel,
    tls_config: Arc<ServerConfig>,
    neg: Option<ServerNeg>,
    client_sid: Option<[u8; 8]>,
    server_random1: [u8; 32],
    server_random2: [u8; 32],
    push_reply: String,
    auth_failed: bool,
    cipher: DataCipher,
    digest: AuthDigest,
    data: HashMap<u8, DataPath>,
    received: Vec<Vec<u8>>,
    pings: usize,
}

impl MockServer {
    fn new(pki: &TestPki, push_reply: &str, cipher: DataCipher) -> Self {
        Self {
            control: ControlChannel::new([0xEE; 8], Duration::from_secs(2)),
            tls_config: pki.server_config.clone(),
            neg: None,
            client_sid: None,
            server_random1: [0x51; 32],
            server_random2: [0x52; 32],
            push_reply: push_reply.to_string(),
            auth_failed: false,
            cipher,
            digest: AuthDigest::Sha1,
            data: HashMap::new(),
            received: Vec::new(),
            pings: 0,
        }
    }

    fn handle(&mut self, frame: &[u8], now: Instant) -> Vec<Vec<u8>> {
        let code = PacketCode::from_byte(frame[0]).expect("client sent a known code");
        if code.is_data() {
            let key_id = frame[0] & 0x07;
            if let Some(path) = self.data.get_mut(&key_id) {
                if let Ok(Some(plain)) = path.decrypt(frame) {
                    if plain.as_slice() == PING_MAGIC {
                        self.pings += 1;
                    } else {
                        self.received.push(plain.as_slice().to_vec());
                    }
                }
            }
            return Vec::new();
        }

        let packet = self.control.read_inbound(frame).expect("parseable control");
        self.control.process_acks(&packet.acks);
        if packet.code != PacketCode::AckV1 {
            if self.client_sid.is_none() {
                self.client_sid = Some(packet.session_id);
                self.control.set_remote_session_id(packet.session_id);
            }
            for ready in self.control.enqueue_inbound(packet) {
                self.dispatch(ready);
            }
        }
        self.control.write_outbound(now, 0, false).unwrap()
    }

    fn dispatch(&mut self, packet: ControlPacket) {
        match packet.code {
            PacketCode::HardResetClientV2 => {
                self.begin_neg(KeyId::new(0));
                self.control.enqueue_outbound(
                    PacketCode::HardResetServerV2,
                    KeyId::new(0),
                    &[],
                    MTU,
                );
            }
            PacketCode::SoftResetV1 => self.begin_neg(packet.key_id),
            PacketCode::ControlV1 => self.drive_tls(packet.key_id, &packet.payload),
            _ => {}
        }
    }

    fn begin_neg(&mut self, key_id: KeyId) {
        self.neg = Some(ServerNeg {
            key_id,
            tls: ServerConnection::new(self.tls_config.clone()).unwrap(),
            plain: Vec::new(),
            auth: None,
            header_sent: false,
            pushed: false,
        });
    }

    fn drive_tls(&mut self, key_id: KeyId, payload: &[u8]) {
        {
            let Some(neg) = self.neg.as_mut() else { return };
            if neg.key_id != key_id {
                return;
            }
            let mut cursor = payload;
            while !cursor.is_empty() {
                if neg.tls.read_tls(&mut cursor).unwrap() == 0 {
                    break;
                }
            }
            if neg.tls.process_new_packets().is_err() {
                // Client refused our certificate; nothing more to say.
                return;
            }

            if !neg.tls.is_handshaking() {
                let mut buf = [0u8; 4096];
                loop {
                    match neg.tls.reader().read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => neg.plain.extend_from_slice(&buf[..n]),
                        Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                        Err(_) => break,
                    }
                }
            }
        }
        self.progress_auth();
        self.flush_neg_tls();
    }

    fn progress_auth(&mut self) {
        let auth_failed = self.auth_failed;
        let server_random1 = self.server_random1;
        let server_random2 = self.server_random2;
        let push_reply = self.push_reply.clone();
        let mut install = false;

        {
            let Some(neg) = self.neg.as_mut() else { return };

            if neg.auth.is_none() {
                if let Some((auth, consumed)) = parse_client_auth(&neg.plain) {
                    neg.plain.drain(..consumed);
                    neg.auth = Some(auth);

                    if auth_failed {
                        neg.tls.writer().write_all(b"AUTH_FAILED\0").unwrap();
                        return;
                    }
                    let mut header = vec![0u8; 4];
                    header.extend_from_slice(&server_random1);
                    header.extend_from_slice(&server_random2);
                    header.extend_from_slice(&2u16.to_be_bytes());
                    header.extend_from_slice(b"V4");
                    neg.tls.writer().write_all(&header).unwrap();
                    neg.header_sent = true;
                }
            }

            if neg.auth.is_some() && neg.header_sent && !neg.pushed {
                while let Some(message) = take_message(&mut neg.plain) {
                    if message == "PUSH_REQUEST" && !neg.pushed {
                        neg.pushed = true;
                        let reply = format!("{push_reply}\0");
                        neg.tls.writer().write_all(reply.as_bytes()).unwrap();
                        install = true;
                    }
                }
            }
        }
        if install {
            self.install_data_path();
        }
    }

    fn install_data_path(&mut self) {
        let neg = self.neg.as_ref().unwrap();
        let auth = neg.auth.as_ref().unwrap();
        let client_sid = self.client_sid.unwrap();
        let server_sid = *self.control.local_session_id();

        // Same inputs as the client, then mirrored for the server role.
        let material = derive_key_material(&KeyExpansionInputs {
            pre_master: &auth.pre_master,
            random1: &auth.random1,
            random2: &auth.random2,
            server_random1: &self.server_random1,
            server_random2: &self.server_random2,
            local_session_id: &client_sid,
            remote_session_id: &server_sid,
        })
        .unwrap();
        let mirrored = KeyMaterial {
            encrypt_key: material.decrypt_key.clone(),
            decrypt_key: material.encrypt_key.clone(),
            encrypt_hmac: material.decrypt_hmac.clone(),
            decrypt_hmac: material.encrypt_hmac.clone(),
        };

        let reply = PushReply::parse(&self.push_reply).unwrap();
        let path = DataPath::new(
            reply.cipher.unwrap_or(self.cipher),
            self.digest,
            &mirrored,
            reply.compression.unwrap_or_default(),
            reply.peer_id,
            neg.key_id,
        )
        .unwrap();
        self.data.insert(neg.key_id.0, path);
    }

    fn flush_neg_tls(&mut self) {
        let Some(neg) = self.neg.as_mut() else { return };
        let mut out = Vec::new();
        while neg.tls.wants_write() {
            neg.tls.write_tls(&mut out).unwrap();
        }
        if !out.is_empty() {
            let key_id = neg.key_id;
            self.control
                .enqueue_outbound(PacketCode::ControlV1, key_id, &out, MTU);
        }
    }

    fn send_data(&mut self, key_id: u8, payload: &[u8]) -> Vec<u8> {
        self.data
            .get_mut(&key_id)
            .expect("server data path installed")
            .encrypt(payload)
            .unwrap()
    }
}

fn parse_client_auth(plain: &[u8]) -> Option<(ParsedAuth, usize)> {
    const FIXED: usize = 4 + 48 + 32 + 32;
    if plain.len() < FIXED {
        return None;
    }
    assert_eq!(&plain[..4], &[0, 0, 0, 0], "client auth prefix");

    let mut offset = FIXED;
    for _ in 0..4 {
        if plain.len() < offset + 2 {
            return None;
        }
        let len = u16::from_be_bytes([plain[offset], plain[offset + 1]]) as usize;
        if plain.len() < offset + 2 + len {
            return None;
        }
        offset += 2 + len;
    }

    Some((
        ParsedAuth {
            pre_master: plain[4..52].to_vec(),
            random1: plain[52..84].to_vec(),
            random2: plain[84..116].to_vec(),
        },
        offset,
    ))
}

fn take_message(plain: &mut Vec<u8>) -> Option<String> {
    let pos = plain.iter().position(|&b| b == 0)?;
    let message = String::from_utf8(plain[..pos].to_vec()).ok()?;
    plain.drain(..=pos);
    Some(message)
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

fn link_props() -> LinkProperties {
    LinkProperties {
        remote_address: REMOTE.to_string(),
        mtu: MTU,
        is_reliable: false,
    }
}

/// Shuttle all queued frames client -> server -> client. Returns whether
/// anything moved.
fn exchange(session: &mut Session, server: &mut MockServer, now: Instant) -> bool {
    let mut moved = false;
    while let Some(frame) = session.next_link_packet() {
        moved = true;
        for reply in server.handle(&frame, now) {
            session.handle_link_packet(&reply, now);
        }
    }
    moved
}

/// Run rounds of exchange + ticks until the session establishes or stops.
fn settle(session: &mut Session, server: &mut MockServer, now: &mut Instant) {
    for _ in 0..100 {
        let moved = exchange(session, server, *now);
        if session.status() == SessionStatus::Established || session.is_stopped() {
            return;
        }
        if !moved {
            *now += Duration::from_millis(50);
            session.handle_tick(*now);
        }
    }
    panic!("negotiation did not settle");
}

fn drain_events(session: &mut Session) -> Vec<SessionEvent> {
    std::iter::from_fn(|| session.poll_event()).collect()
}

fn stopped_reason(events: &[SessionEvent]) -> Option<(&Option<SessionError>, bool)> {
    events.iter().find_map(|event| match event {
        SessionEvent::Stopped {
            reason,
            should_reconnect,
        } => Some((reason, *should_reconnect)),
        _ => None,
    })
}

/// Send a probe IP packet and return the key id it was encrypted under.
fn probe_data_key(session: &mut Session, server: &mut MockServer, now: Instant) -> u8 {
    session.handle_tunnel_packet(b"probe packet", now);
    let mut key_id = None;
    while let Some(frame) = session.next_link_packet() {
        if frame[0] >> 3 == 9 {
            key_id = Some(frame[0] & 0x07);
        }
        for reply in server.handle(&frame, now) {
            session.handle_link_packet(&reply, now);
        }
    }
    key_id.expect("probe was encrypted and sent")
}

fn standard_session(pki: &TestPki) -> Session {
    let config = SessionConfig::new(pki.ca_pem.clone());
    Session::new(config, Credentials::new("alice", "hunter2")).unwrap()
}

const STANDARD_PUSH: &str =
    "PUSH_REPLY,ifconfig 10.8.0.2 255.255.255.0,peer-id 42,ping 10";

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn test_happy_path_udp_negotiation() {
    let pki = make_pki(true);
    let mut server = MockServer::new(&pki, STANDARD_PUSH, DataCipher::Aes256Gcm);
    let mut session = standard_session(&pki);

    let mut now = Instant::now();
    session.start(link_props(), now);
    settle(&mut session, &mut server, &mut now);
    assert_eq!(session.status(), SessionStatus::Established);

    let events = drain_events(&mut session);
    let statuses: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::StatusChanged(status) => Some(*status),
            _ => None,
        })
        .collect();
    assert_eq!(
        statuses,
        vec![
            SessionStatus::Connecting,
            SessionStatus::Handshaking,
            SessionStatus::Authenticating,
            SessionStatus::Established,
        ]
    );

    let started = events
        .iter()
        .find_map(|e| match e {
            SessionEvent::Started {
                remote_address,
                reply,
            } => Some((remote_address.clone(), reply.clone())),
            _ => None,
        })
        .expect("Started event");
    assert_eq!(started.0, REMOTE);
    assert_eq!(started.1.peer_id, Some(42));
    assert_eq!(
        started.1.ifconfig,
        Some(("10.8.0.2".into(), "255.255.255.0".into()))
    );
    assert!(session.can_rebind_link());
}

#[test]
fn test_happy_path_cbc_suite() {
    let pki = make_pki(true);
    // No pushed cipher: both sides fall back to the configured AES-128-CBC.
    let mut server = MockServer::new(
        &pki,
        "PUSH_REPLY,ifconfig 10.8.0.6 255.255.255.0,peer-id 7",
        DataCipher::Aes128Cbc,
    );
    let mut config = SessionConfig::new(pki.ca_pem.clone());
    config.cipher = DataCipher::Aes128Cbc;
    let mut session = Session::new(config, Credentials::new("alice", "hunter2")).unwrap();

    let mut now = Instant::now();
    session.start(link_props(), now);
    settle(&mut session, &mut server, &mut now);
    assert_eq!(session.status(), SessionStatus::Established);

    // Tunnel -> link -> server
    session.handle_tunnel_packet(b"client ip packet", now);
    exchange(&mut session, &mut server, now);
    assert_eq!(server.received, vec![b"client ip packet".to_vec()]);

    // Server -> link -> tunnel
    let frame = server.send_data(0, b"server ip packet");
    session.handle_link_packet(&frame, now);
    assert_eq!(
        session.next_tunnel_packet(),
        Some(b"server ip packet".to_vec())
    );
}

#[test]
fn test_data_flow_and_counters() {
    let pki = make_pki(true);
    let mut server = MockServer::new(&pki, STANDARD_PUSH, DataCipher::Aes256Gcm);
    let mut session = standard_session(&pki);

    let mut now = Instant::now();
    session.start(link_props(), now);
    settle(&mut session, &mut server, &mut now);

    session.handle_tunnel_packet(b"one", now);
    session.handle_tunnel_packet(b"two", now);
    exchange(&mut session, &mut server, now);
    assert_eq!(server.received, vec![b"one".to_vec(), b"two".to_vec()]);

    let frame = server.send_data(0, b"three");
    session.handle_link_packet(&frame, now);
    assert_eq!(session.next_tunnel_packet(), Some(b"three".to_vec()));

    let stats = session.stats();
    assert_eq!(stats.bytes(), (5, 6));
    assert_eq!(stats.packets(), (1, 2));
}

#[test]
fn test_replayed_data_packet_delivered_once() {
    let pki = make_pki(true);
    let mut server = MockServer::new(&pki, STANDARD_PUSH, DataCipher::Aes256Gcm);
    let mut session = standard_session(&pki);

    let mut now = Instant::now();
    session.start(link_props(), now);
    settle(&mut session, &mut server, &mut now);

    let frame = server.send_data(0, b"exactly once");
    session.handle_link_packet(&frame, now);
    session.handle_link_packet(&frame, now);

    assert_eq!(session.next_tunnel_packet(), Some(b"exactly once".to_vec()));
    assert_eq!(session.next_tunnel_packet(), None);
    assert!(!session.is_stopped());
}

#[test]
fn test_auth_failed_stops_without_reconnect() {
    let pki = make_pki(true);
    let mut server = MockServer::new(&pki, STANDARD_PUSH, DataCipher::Aes256Gcm);
    server.auth_failed = true;
    let mut session = standard_session(&pki);

    let mut now = Instant::now();
    session.start(link_props(), now);
    settle(&mut session, &mut server, &mut now);

    assert!(session.is_stopped());
    let events = drain_events(&mut session);
    let (reason, should_reconnect) = stopped_reason(&events).expect("stopped");
    assert!(matches!(reason, Some(SessionError::BadCredentials)));
    assert!(!should_reconnect);
}

#[test]
fn test_missing_server_eku_fails_peer_verification() {
    let pki = make_pki(false);
    let mut server = MockServer::new(&pki, STANDARD_PUSH, DataCipher::Aes256Gcm);
    let mut session = standard_session(&pki);

    let mut now = Instant::now();
    session.start(link_props(), now);
    settle(&mut session, &mut server, &mut now);

    assert!(session.is_stopped());
    let events = drain_events(&mut session);
    let (reason, should_reconnect) = stopped_reason(&events).expect("stopped");
    assert!(matches!(
        reason,
        Some(SessionError::PeerVerificationFailed(_))
    ));
    assert!(!should_reconnect);
}

#[test]
fn test_soft_reset_rotates_keys_and_retires_old_generation() {
    let pki = make_pki(true);
    let mut server = MockServer::new(&pki, STANDARD_PUSH, DataCipher::Aes256Gcm);
    let mut config = SessionConfig::new(pki.ca_pem.clone());
    config.renegotiates_after = Some(Duration::from_secs(1));
    let mut session = Session::new(config, Credentials::new("alice", "hunter2")).unwrap();

    let mut now = Instant::now();
    session.start(link_props(), now);
    settle(&mut session, &mut server, &mut now);
    assert_eq!(probe_data_key(&mut session, &mut server, now), 0);

    // Past the renegotiation interval the client emits a soft reset on key
    // id 1 and renegotiates without dropping the tunnel.
    now += Duration::from_millis(1200);
    session.handle_tick(now);
    for _ in 0..50 {
        exchange(&mut session, &mut server, now);
        if server.data.contains_key(&1) {
            break;
        }
        now += Duration::from_millis(20);
        session.handle_tick(now);
    }
    assert!(!session.is_stopped());
    assert_eq!(probe_data_key(&mut session, &mut server, now), 1);

    // The old generation still decrypts a late in-flight packet.
    let late = server.send_data(0, b"late but valid");
    session.handle_link_packet(&late, now);
    assert_eq!(session.next_tunnel_packet(), Some(b"late but valid".to_vec()));

    // After the next rotation the old generation is gone for good.
    now += Duration::from_millis(1200);
    session.handle_tick(now);
    for _ in 0..50 {
        exchange(&mut session, &mut server, now);
        if server.data.contains_key(&2) {
            break;
        }
        now += Duration::from_millis(20);
        session.handle_tick(now);
    }
    assert_eq!(probe_data_key(&mut session, &mut server, now), 2);

    let too_late = server.send_data(0, b"zombie generation");
    session.handle_link_packet(&too_late, now);
    assert!(session.is_stopped());
    let events = drain_events(&mut session);
    let (reason, _) = stopped_reason(&events).expect("stopped");
    assert!(matches!(reason, Some(SessionError::BadKey(0))));
}

#[test]
fn test_link_rebind_resumes_without_new_handshake() {
    let pki = make_pki(true);
    let mut server = MockServer::new(&pki, STANDARD_PUSH, DataCipher::Aes256Gcm);
    let mut session = standard_session(&pki);

    let mut now = Instant::now();
    session.start(link_props(), now);
    settle(&mut session, &mut server, &mut now);
    assert!(session.can_rebind_link());

    // Simulated link loss: a fresh link with a different local address.
    let rebound = session.rebind_link(LinkProperties {
        remote_address: "198.51.100.7".to_string(),
        mtu: MTU,
        is_reliable: false,
    });
    assert!(rebound);

    // Data flows with no renegotiation in either direction.
    session.handle_tunnel_packet(b"after rebind", now);
    exchange(&mut session, &mut server, now);
    assert_eq!(server.received, vec![b"after rebind".to_vec()]);

    let frame = server.send_data(0, b"welcome back");
    session.handle_link_packet(&frame, now);
    assert_eq!(session.next_tunnel_packet(), Some(b"welcome back".to_vec()));
    assert_eq!(session.status(), SessionStatus::Established);
}

#[test]
fn test_negotiated_ping_interval_drives_keepalive() {
    let pki = make_pki(true);
    let mut server = MockServer::new(
        &pki,
        "PUSH_REPLY,ifconfig 10.8.0.2 255.255.255.0,peer-id 42,ping 2",
        DataCipher::Aes256Gcm,
    );
    let mut session = standard_session(&pki);

    let mut now = Instant::now();
    session.start(link_props(), now);
    settle(&mut session, &mut server, &mut now);
    assert_eq!(server.pings, 0);

    now += Duration::from_millis(2500);
    session.handle_tick(now);
    exchange(&mut session, &mut server, now);
    assert_eq!(server.pings, 1);
}

#[test]
fn test_silent_server_triggers_ping_timeout() {
    let pki = make_pki(true);
    let mut server = MockServer::new(&pki, STANDARD_PUSH, DataCipher::Aes256Gcm);
    let mut session = standard_session(&pki);

    let mut now = Instant::now();
    session.start(link_props(), now);
    settle(&mut session, &mut server, &mut now);

    now += Duration::from_secs(61);
    session.handle_tick(now);

    assert!(session.is_stopped());
    let events = drain_events(&mut session);
    let (reason, _) = stopped_reason(&events).expect("stopped");
    assert!(matches!(reason, Some(SessionError::PingTimeout)));
}

#[test]
fn test_auth_token_reused_on_renegotiation() {
    let pki = make_pki(true);
    let mut server = MockServer::new(
        &pki,
        "PUSH_REPLY,ifconfig 10.8.0.2 255.255.255.0,peer-id 42,auth-token SESS_xyz",
        DataCipher::Aes256Gcm,
    );
    let mut config = SessionConfig::new(pki.ca_pem.clone());
    config.renegotiates_after = Some(Duration::from_secs(1));
    let mut session = Session::new(config, Credentials::new("alice", "hunter2")).unwrap();

    let mut now = Instant::now();
    session.start(link_props(), now);
    settle(&mut session, &mut server, &mut now);

    now += Duration::from_millis(1200);
    session.handle_tick(now);
    for _ in 0..50 {
        exchange(&mut session, &mut server, now);
        if server.data.contains_key(&1) {
            break;
        }
        now += Duration::from_millis(20);
        session.handle_tick(now);
    }
    assert!(server.data.contains_key(&1), "renegotiation completed");
    assert!(!session.is_stopped());
}
