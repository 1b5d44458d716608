//! Data-channel cipher and digest primitives
//!
//! The data plane speaks the classic OpenVPN suites: AES in CBC mode with an
//! encrypt-then-MAC HMAC, or AES-GCM as an AEAD. Keys arrive as 64-byte
//! subkey slots from key expansion and are truncated here to the size each
//! algorithm wants.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::{Aes128, Aes192, Aes256};
use aes_gcm::aead::consts::U12;
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm, KeyInit, Nonce};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Sha224, Sha256, Sha384, Sha512};
use subtle::ConstantTimeEq;

use crate::{CryptoError, Result, SecureBuf};

type Aes192Gcm = AesGcm<Aes192, U12>;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;
type Aes192CbcEnc = cbc::Encryptor<Aes192>;
type Aes192CbcDec = cbc::Decryptor<Aes192>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Supported data-channel ciphers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataCipher {
    /// AES-128 in CBC mode with HMAC authentication
    Aes128Cbc,
    /// AES-192 in CBC mode with HMAC authentication
    Aes192Cbc,
    /// AES-256 in CBC mode with HMAC authentication
    Aes256Cbc,
    /// AES-128-GCM AEAD
    Aes128Gcm,
    /// AES-192-GCM AEAD
    Aes192Gcm,
    /// AES-256-GCM AEAD
    Aes256Gcm,
}

impl DataCipher {
    /// Authentication tag size for the AEAD suites
    pub const TAG_SIZE: usize = 16;
    /// GCM nonce size
    pub const GCM_IV_SIZE: usize = 12;
    /// CBC initialization vector size
    pub const CBC_IV_SIZE: usize = 16;

    /// Key size in bytes
    pub const fn key_size(&self) -> usize {
        match self {
            DataCipher::Aes128Cbc | DataCipher::Aes128Gcm => 16,
            DataCipher::Aes192Cbc | DataCipher::Aes192Gcm => 24,
            DataCipher::Aes256Cbc | DataCipher::Aes256Gcm => 32,
        }
    }

    /// Whether this suite is an AEAD (GCM) suite
    pub const fn is_aead(&self) -> bool {
        matches!(
            self,
            DataCipher::Aes128Gcm | DataCipher::Aes192Gcm | DataCipher::Aes256Gcm
        )
    }

    /// Parse from the OpenVPN option name (`AES-256-GCM`, ...)
    pub fn from_option_name(name: &str) -> Result<Self> {
        match name.to_ascii_uppercase().as_str() {
            "AES-128-CBC" => Ok(DataCipher::Aes128Cbc),
            "AES-192-CBC" => Ok(DataCipher::Aes192Cbc),
            "AES-256-CBC" => Ok(DataCipher::Aes256Cbc),
            "AES-128-GCM" => Ok(DataCipher::Aes128Gcm),
            "AES-192-GCM" => Ok(DataCipher::Aes192Gcm),
            "AES-256-GCM" => Ok(DataCipher::Aes256Gcm),
            _ => Err(CryptoError::UnknownAlgorithm(name.to_string())),
        }
    }

    /// The OpenVPN option name
    pub const fn option_name(&self) -> &'static str {
        match self {
            DataCipher::Aes128Cbc => "AES-128-CBC",
            DataCipher::Aes192Cbc => "AES-192-CBC",
            DataCipher::Aes256Cbc => "AES-256-CBC",
            DataCipher::Aes128Gcm => "AES-128-GCM",
            DataCipher::Aes192Gcm => "AES-192-GCM",
            DataCipher::Aes256Gcm => "AES-256-GCM",
        }
    }
}

/// Supported HMAC digests for CBC suites and tls-auth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AuthDigest {
    /// HMAC-SHA1
    Sha1,
    /// HMAC-SHA224
    Sha224,
    /// HMAC-SHA256
    #[default]
    Sha256,
    /// HMAC-SHA384
    Sha384,
    /// HMAC-SHA512
    Sha512,
}

impl AuthDigest {
    /// Digest output size in bytes
    pub const fn output_size(&self) -> usize {
        match self {
            AuthDigest::Sha1 => 20,
            AuthDigest::Sha224 => 28,
            AuthDigest::Sha256 => 32,
            AuthDigest::Sha384 => 48,
            AuthDigest::Sha512 => 64,
        }
    }

    /// Parse from the OpenVPN option name (`SHA1`, `SHA256`, ...)
    pub fn from_option_name(name: &str) -> Result<Self> {
        match name.to_ascii_uppercase().as_str() {
            "SHA1" => Ok(AuthDigest::Sha1),
            "SHA224" => Ok(AuthDigest::Sha224),
            "SHA256" => Ok(AuthDigest::Sha256),
            "SHA384" => Ok(AuthDigest::Sha384),
            "SHA512" => Ok(AuthDigest::Sha512),
            _ => Err(CryptoError::UnknownAlgorithm(name.to_string())),
        }
    }

    /// The OpenVPN option name
    pub const fn option_name(&self) -> &'static str {
        match self {
            AuthDigest::Sha1 => "SHA1",
            AuthDigest::Sha224 => "SHA224",
            AuthDigest::Sha256 => "SHA256",
            AuthDigest::Sha384 => "SHA384",
            AuthDigest::Sha512 => "SHA512",
        }
    }
}

/// Keyed HMAC over a configurable digest
///
/// One instance per direction; the key is held in a [`SecureBuf`] and
/// truncated from the 64-byte expansion slot to the digest size.
pub struct HmacKey {
    digest: AuthDigest,
    key: SecureBuf,
}

impl HmacKey {
    /// Create from a key slot, truncating to the digest size.
    pub fn new(digest: AuthDigest, key_slot: &[u8]) -> Result<Self> {
        if key_slot.len() < digest.output_size() {
            return Err(CryptoError::InvalidKeyLength {
                expected: digest.output_size(),
                got: key_slot.len(),
            });
        }
        Ok(Self {
            digest,
            key: SecureBuf::from_slice(&key_slot[..digest.output_size()]),
        })
    }

    /// Digest in use
    pub fn digest(&self) -> AuthDigest {
        self.digest
    }

    /// HMAC over the concatenation of `parts`.
    pub fn sign(&self, parts: &[&[u8]]) -> Vec<u8> {
        macro_rules! run {
            ($d:ty) => {{
                let mut mac = <Hmac<$d> as Mac>::new_from_slice(self.key.as_slice())
                    .expect("HMAC accepts any key size");
                for part in parts {
                    mac.update(part);
                }
                mac.finalize().into_bytes().to_vec()
            }};
        }
        match self.digest {
            AuthDigest::Sha1 => run!(Sha1),
            AuthDigest::Sha224 => run!(Sha224),
            AuthDigest::Sha256 => run!(Sha256),
            AuthDigest::Sha384 => run!(Sha384),
            AuthDigest::Sha512 => run!(Sha512),
        }
    }

    /// Constant-time verification of `tag` against HMAC(`parts`).
    pub fn verify(&self, parts: &[&[u8]], tag: &[u8]) -> Result<()> {
        let computed = self.sign(parts);
        if computed.len() == tag.len() && bool::from(computed.ct_eq(tag)) {
            Ok(())
        } else {
            Err(CryptoError::HmacVerificationFailed)
        }
    }
}

/// One-direction cipher context for the data channel
///
/// CBC contexts keep only the key (a fresh mode instance is cheap and IVs
/// change per packet); GCM contexts cache the AEAD instance.
pub enum CipherCtx {
    /// CBC context: key retained, HMAC handled by the caller
    Cbc {
        /// Cipher identity (one of the CBC suites)
        cipher: DataCipher,
        /// Truncated cipher key
        key: SecureBuf,
    },
    /// GCM context
    Gcm(GcmCtx),
}

/// Cached AEAD instance per key size
pub enum GcmCtx {
    /// AES-128-GCM
    Aes128(Box<Aes128Gcm>),
    /// AES-192-GCM
    Aes192(Box<Aes192Gcm>),
    /// AES-256-GCM
    Aes256(Box<Aes256Gcm>),
}

impl CipherCtx {
    /// Build a context from a 64-byte key-expansion slot.
    pub fn new(cipher: DataCipher, key_slot: &[u8]) -> Result<Self> {
        if key_slot.len() < cipher.key_size() {
            return Err(CryptoError::InvalidKeyLength {
                expected: cipher.key_size(),
                got: key_slot.len(),
            });
        }
        let key = &key_slot[..cipher.key_size()];
        match cipher {
            DataCipher::Aes128Cbc | DataCipher::Aes192Cbc | DataCipher::Aes256Cbc => {
                Ok(CipherCtx::Cbc {
                    cipher,
                    key: SecureBuf::from_slice(key),
                })
            }
            DataCipher::Aes128Gcm => Ok(CipherCtx::Gcm(GcmCtx::Aes128(Box::new(
                Aes128Gcm::new_from_slice(key)
                    .map_err(|_| CryptoError::EncryptionFailed("bad AES-128-GCM key"))?,
            )))),
            DataCipher::Aes192Gcm => Ok(CipherCtx::Gcm(GcmCtx::Aes192(Box::new(
                Aes192Gcm::new_from_slice(key)
                    .map_err(|_| CryptoError::EncryptionFailed("bad AES-192-GCM key"))?,
            )))),
            DataCipher::Aes256Gcm => Ok(CipherCtx::Gcm(GcmCtx::Aes256(Box::new(
                Aes256Gcm::new_from_slice(key)
                    .map_err(|_| CryptoError::EncryptionFailed("bad AES-256-GCM key"))?,
            )))),
        }
    }

    /// AEAD seal: `iv` is 12 bytes, returns ciphertext with the 16-byte tag
    /// appended. Only valid on GCM contexts.
    pub fn seal(&self, iv: &[u8], plaintext: &[u8], ad: &[u8]) -> Result<Vec<u8>> {
        let CipherCtx::Gcm(gcm) = self else {
            return Err(CryptoError::EncryptionFailed("seal on non-AEAD context"));
        };
        if iv.len() != DataCipher::GCM_IV_SIZE {
            return Err(CryptoError::EncryptionFailed("bad GCM nonce length"));
        }
        let payload = Payload {
            msg: plaintext,
            aad: ad,
        };
        let sealed = match gcm {
            GcmCtx::Aes128(c) => c.encrypt(Nonce::from_slice(iv), payload),
            GcmCtx::Aes192(c) => c.encrypt(Nonce::from_slice(iv), payload),
            GcmCtx::Aes256(c) => c.encrypt(Nonce::from_slice(iv), payload),
        };
        sealed.map_err(|_| CryptoError::EncryptionFailed("AEAD seal failed"))
    }

    /// AEAD open: verifies the trailing tag, returns the plaintext.
    pub fn open(&self, iv: &[u8], ciphertext: &[u8], ad: &[u8]) -> Result<Vec<u8>> {
        let CipherCtx::Gcm(gcm) = self else {
            return Err(CryptoError::DecryptionFailed);
        };
        if iv.len() != DataCipher::GCM_IV_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }
        let payload = Payload {
            msg: ciphertext,
            aad: ad,
        };
        let opened = match gcm {
            GcmCtx::Aes128(c) => c.decrypt(Nonce::from_slice(iv), payload),
            GcmCtx::Aes192(c) => c.decrypt(Nonce::from_slice(iv), payload),
            GcmCtx::Aes256(c) => c.decrypt(Nonce::from_slice(iv), payload),
        };
        opened.map_err(|_| CryptoError::DecryptionFailed)
    }

    /// CBC encrypt with PKCS#7 padding. `iv` is 16 bytes.
    pub fn cbc_encrypt(&self, iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let CipherCtx::Cbc { cipher, key } = self else {
            return Err(CryptoError::EncryptionFailed("cbc_encrypt on AEAD context"));
        };
        let key = key.as_slice();
        let out = match cipher {
            DataCipher::Aes128Cbc => Aes128CbcEnc::new_from_slices(key, iv)
                .map_err(|_| CryptoError::EncryptionFailed("bad CBC key/iv"))?
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
            DataCipher::Aes192Cbc => Aes192CbcEnc::new_from_slices(key, iv)
                .map_err(|_| CryptoError::EncryptionFailed("bad CBC key/iv"))?
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
            DataCipher::Aes256Cbc => Aes256CbcEnc::new_from_slices(key, iv)
                .map_err(|_| CryptoError::EncryptionFailed("bad CBC key/iv"))?
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
            _ => unreachable!("CBC variant checked above"),
        };
        Ok(out)
    }

    /// CBC decrypt, stripping PKCS#7 padding.
    pub fn cbc_decrypt(&self, iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let CipherCtx::Cbc { cipher, key } = self else {
            return Err(CryptoError::DecryptionFailed);
        };
        let key = key.as_slice();
        let out = match cipher {
            DataCipher::Aes128Cbc => Aes128CbcDec::new_from_slices(key, iv)
                .map_err(|_| CryptoError::DecryptionFailed)?
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
            DataCipher::Aes192Cbc => Aes192CbcDec::new_from_slices(key, iv)
                .map_err(|_| CryptoError::DecryptionFailed)?
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
            DataCipher::Aes256Cbc => Aes256CbcDec::new_from_slices(key, iv)
                .map_err(|_| CryptoError::DecryptionFailed)?
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
            _ => unreachable!("CBC variant checked above"),
        };
        out.map_err(|_| CryptoError::DecryptionFailed)
    }
}

/// AES-256-CTR transform used by tls-crypt control-channel wrapping.
///
/// CTR is its own inverse, so one function serves both directions.
pub fn aes256_ctr_apply(key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<()> {
    use aes::cipher::StreamCipher;
    let mut ctr = ctr::Ctr128BE::<Aes256>::new_from_slices(key, iv).map_err(|_| {
        CryptoError::InvalidKeyLength {
            expected: 32,
            got: key.len(),
        }
    })?;
    ctr.apply_keystream(data);
    Ok(())
}
