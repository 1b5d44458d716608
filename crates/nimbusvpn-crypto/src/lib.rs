//! NimbusVPN Cryptographic Primitives
//!
//! The cryptographic foundation for the client engine, using only audited,
//! pure-Rust implementations. No OpenSSL dependency.
//!
//! # Security Principles
//! - All key material lives in [`SecureBuf`], scrubbed on release
//! - Constant-time comparisons for all authentication operations
//! - No custom cryptography - only well-audited implementations

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod cipher;
pub mod error;
pub mod prf;
pub mod secure;
pub mod wrap;

pub use cipher::{aes256_ctr_apply, AuthDigest, CipherCtx, DataCipher, HmacKey};
pub use error::{CryptoError, Result};
pub use prf::{derive_key_material, tls1_prf, KeyExpansionInputs, KeyMaterial};
pub use secure::SecureBuf;
pub use wrap::{StaticKey, TlsAuthWrapper, TlsCryptWrapper};

use md5::{Digest, Md5};

/// Securely generate random bytes
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut buf);
    buf
}

/// Fill a [`SecureBuf`] with `len` random bytes
pub fn random_secure(len: usize) -> SecureBuf {
    let mut buf = SecureBuf::zeroed(len);
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, buf.as_mut_slice());
    buf
}

/// Generate a session identifier
pub fn random_session_id() -> [u8; 8] {
    random_bytes()
}

/// Lowercase hex MD5 of the first certificate in a PEM document.
///
/// Only used by the PIA-patched hard-reset payload, which binds the
/// handshake to a CA fingerprint.
pub fn md5_hex_of_pem(pem_text: &str) -> Result<String> {
    let parsed = pem::parse(pem_text)
        .map_err(|e| CryptoError::InvalidKeyFile(format!("PEM parse failed: {e}")))?;
    let digest = Md5::digest(parsed.contents());
    let mut out = String::with_capacity(32);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    Ok(out)
}
