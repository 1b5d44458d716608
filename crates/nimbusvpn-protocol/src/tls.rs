//! TLS engine for the control channel
//!
//! A memory-BIO style rustls client: ciphertext in/out rides the control
//! channel's reliability layer, plaintext in/out carries the key-material
//! exchange. "Would block" is never an error here, it only means "no bytes
//! now".
//!
//! Verification is anchored on the configured CA alone; hostname matching
//! does not apply to a pinned anchor. After the handshake the peer
//! certificate must additionally assert the TLS Web Server Authentication
//! extended key usage.

use std::io::{ErrorKind, Read, Write};
use std::sync::{Arc, Mutex};

use bytes::{Buf, BytesMut};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{
    CertificateError, ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore,
    SignatureScheme,
};
use tracing::debug;
use x509_cert::der::asn1::ObjectIdentifier;
use x509_cert::der::oid::AssociatedOid;
use x509_cert::der::Decode;
use x509_cert::ext::pkix::ExtendedKeyUsage;
use x509_cert::Certificate;
use zeroize::Zeroize;

use nimbusvpn_core::SessionConfig;
use nimbusvpn_crypto::SecureBuf;

use crate::{ProtocolError, Result};

/// id-kp-serverAuth
const SERVER_AUTH_OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.1");

/// Slot the verifier writes its rejection into, read back by the session.
///
/// The verification callback runs inside rustls and cannot return rich
/// errors through it, so failures travel through this shared cell instead
/// of a process-wide notification.
type FailureSlot = Arc<Mutex<Option<String>>>;

/// Memory-BIO TLS client for one negotiation key.
pub struct TlsLink {
    conn: ClientConnection,
    incoming: BytesMut,
    verify_failure: FailureSlot,
    eku_verified: bool,
}

impl TlsLink {
    /// Create the context, load the CA (and the optional client
    /// certificate), and kick the handshake.
    pub fn start(config: &SessionConfig, server_name: &str) -> Result<Self> {
        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut config.ca_pem.as_bytes()) {
            let cert = cert.map_err(|e| ProtocolError::Tls(format!("bad CA PEM: {e}")))?;
            roots
                .add(cert)
                .map_err(|e| ProtocolError::Tls(format!("unusable CA certificate: {e}")))?;
        }
        if roots.is_empty() {
            return Err(ProtocolError::Tls("no CA certificate configured".into()));
        }

        let webpki = WebPkiServerVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| ProtocolError::Tls(format!("verifier build failed: {e}")))?;
        let verify_failure: FailureSlot = Arc::new(Mutex::new(None));
        let verifier = Arc::new(PinnedCaVerifier {
            inner: webpki,
            failure: verify_failure.clone(),
        });

        let builder = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(verifier);
        let mut tls_config = match (&config.client_certificate_pem, &config.client_key_pem) {
            (Some(cert_pem), Some(key_pem)) => {
                let certs = load_certs_from_pem(cert_pem)?;
                let key = load_key_from_pem(key_pem)?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| ProtocolError::Tls(format!("client certificate rejected: {e}")))?
            }
            _ => builder.with_no_client_auth(),
        };
        // The server is addressed by whatever the link says; no name goes
        // on the wire.
        tls_config.enable_sni = false;

        let name = ServerName::try_from(server_name.to_string())
            .unwrap_or_else(|_| ServerName::try_from("openvpn-server").expect("static name"));
        let conn = ClientConnection::new(Arc::new(tls_config), name)
            .map_err(|e| ProtocolError::Tls(e.to_string()))?;
        debug!("TLS client context started");

        Ok(Self {
            conn,
            incoming: BytesMut::with_capacity(16384),
            verify_failure,
            eku_verified: false,
        })
    }

    /// Feed raw TLS record bytes received from the peer.
    pub fn put_cipher_text(&mut self, data: &[u8]) -> Result<()> {
        self.incoming.extend_from_slice(data);

        while !self.incoming.is_empty() {
            let mut reader = &self.incoming[..];
            match self.conn.read_tls(&mut reader) {
                Ok(0) => break,
                Ok(n) => self.incoming.advance(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(ProtocolError::Tls(e.to_string())),
            }
        }

        if let Err(e) = self.conn.process_new_packets() {
            return Err(self.classify(e));
        }
        Ok(())
    }

    /// Drain TLS records the engine wants to transmit; `None` means none.
    pub fn pull_cipher_text(&mut self) -> Result<Option<Vec<u8>>> {
        if !self.conn.wants_write() {
            return Ok(None);
        }
        let mut out = Vec::with_capacity(4096);
        while self.conn.wants_write() {
            self.conn
                .write_tls(&mut out)
                .map_err(|e| ProtocolError::Tls(e.to_string()))?;
        }
        Ok(if out.is_empty() { None } else { Some(out) })
    }

    /// Write application plaintext to be encrypted.
    pub fn put_plain_text(&mut self, data: &[u8]) -> Result<()> {
        self.conn
            .writer()
            .write_all(data)
            .map_err(|e| ProtocolError::Tls(e.to_string()))
    }

    /// Drain decrypted application plaintext into `out`; returns the number
    /// of bytes appended (zero means "would block").
    pub fn pull_plain_text(&mut self, out: &mut SecureBuf) -> Result<usize> {
        let mut total = 0;
        let mut chunk = [0u8; 4096];
        loop {
            match self.conn.reader().read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    out.append(&chunk[..n]);
                    total += n;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    chunk.zeroize();
                    return Err(ProtocolError::Tls(e.to_string()));
                }
            }
        }
        chunk.zeroize();
        Ok(total)
    }

    /// Whether the handshake has completed.
    pub fn is_handshake_complete(&self) -> bool {
        !self.conn.is_handshaking()
    }

    /// Extended-Key-Usage verification, run once after the handshake.
    ///
    /// The peer certificate must assert TLS Web Server Authentication.
    pub fn verify_peer_eku(&mut self) -> Result<()> {
        if self.eku_verified {
            return Ok(());
        }
        let certs = self
            .conn
            .peer_certificates()
            .ok_or_else(|| ProtocolError::Tls("no peer certificate".into()))?;
        let end_entity = certs
            .first()
            .ok_or_else(|| ProtocolError::Tls("empty peer certificate chain".into()))?;

        let cert = Certificate::from_der(end_entity.as_ref())
            .map_err(|e| ProtocolError::Tls(format!("peer certificate undecodable: {e}")))?;
        let extensions = cert
            .tbs_certificate
            .extensions
            .as_deref()
            .unwrap_or_default();

        for ext in extensions {
            if ext.extn_id != ExtendedKeyUsage::OID {
                continue;
            }
            let eku = ExtendedKeyUsage::from_der(ext.extn_value.as_bytes())
                .map_err(|e| ProtocolError::Tls(format!("bad EKU extension: {e}")))?;
            if eku.0.contains(&SERVER_AUTH_OID) {
                self.eku_verified = true;
                return Ok(());
            }
            return Err(ProtocolError::ServerEku);
        }
        Err(ProtocolError::ServerEku)
    }

    /// The verifier's recorded rejection, if any.
    pub fn take_verify_failure(&self) -> Option<String> {
        self.verify_failure.lock().expect("failure slot poisoned").take()
    }

    fn classify(&self, error: rustls::Error) -> ProtocolError {
        if let Some(reason) = self.take_verify_failure() {
            ProtocolError::PeerVerification(reason)
        } else {
            ProtocolError::Tls(error.to_string())
        }
    }
}

/// Chain validation against the pinned CA, with hostname matching waived.
#[derive(Debug)]
struct PinnedCaVerifier {
    inner: Arc<WebPkiServerVerifier>,
    failure: FailureSlot,
}

impl ServerCertVerifier for PinnedCaVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Ok(verified) => Ok(verified),
            Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForName
                | CertificateError::NotValidForNameContext { .. },
            )) => Ok(ServerCertVerified::assertion()),
            Err(e) => {
                *self.failure.lock().expect("failure slot poisoned") = Some(e.to_string());
                Err(e)
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Load a certificate chain from PEM text.
pub fn load_certs_from_pem(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    let mut certs = Vec::new();
    for cert in rustls_pemfile::certs(&mut pem.as_bytes()) {
        certs.push(cert.map_err(|e| ProtocolError::Tls(format!("failed to parse cert: {e}")))?);
    }
    if certs.is_empty() {
        return Err(ProtocolError::Tls("no certificate found in PEM".into()));
    }
    Ok(certs)
}

/// Load a private key from PEM text.
pub fn load_key_from_pem(pem: &str) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| ProtocolError::Tls(format!("failed to parse key: {e}")))?
        .ok_or_else(|| ProtocolError::Tls("no private key found in PEM".into()))
}
