//! OpenVPN key-method-2 key expansion
//!
//! The data-plane keys come out of the TLS 1.0 pseudo-random function
//! (RFC 2246 section 5): the secret is split in half and fed through
//! P_MD5 and P_SHA1, whose outputs are XORed. OpenVPN applies it twice,
//! first to turn the pre-master into a 48-byte master secret, then to
//! expand the master into a 256-byte key block.

use hmac::{Hmac, Mac};
use md5::Md5;
use sha1::Sha1;

use crate::{CryptoError, Result, SecureBuf};

const MASTER_LABEL: &[u8] = b"OpenVPN master secret";
const EXPANSION_LABEL: &[u8] = b"OpenVPN key expansion";

/// Master secret length
pub const MASTER_SECRET_LEN: usize = 48;
/// Expanded key block length
pub const KEY_BLOCK_LEN: usize = 256;
/// Size of each of the four subkey slots
pub const KEY_SLOT_LEN: usize = 64;

/// Inputs to key expansion, all supplied by the session once the
/// authenticator has seen the server randoms.
pub struct KeyExpansionInputs<'a> {
    /// 48-byte pre-master secret generated by the client
    pub pre_master: &'a [u8],
    /// First client random (master-secret derivation)
    pub random1: &'a [u8],
    /// Second client random (key-block derivation)
    pub random2: &'a [u8],
    /// First server random
    pub server_random1: &'a [u8],
    /// Second server random
    pub server_random2: &'a [u8],
    /// Local (client) session id
    pub local_session_id: &'a [u8; 8],
    /// Remote (server) session id
    pub remote_session_id: &'a [u8; 8],
}

/// The four 64-byte subkeys carved out of the 256-byte key block, in wire
/// order: encrypt key, decrypt key, encrypt HMAC key, decrypt HMAC key.
pub struct KeyMaterial {
    /// Outbound cipher key slot
    pub encrypt_key: SecureBuf,
    /// Inbound cipher key slot
    pub decrypt_key: SecureBuf,
    /// Outbound HMAC key slot
    pub encrypt_hmac: SecureBuf,
    /// Inbound HMAC key slot
    pub decrypt_hmac: SecureBuf,
}

impl KeyMaterial {
    fn from_block(block: &SecureBuf) -> Self {
        let b = block.as_slice();
        Self {
            encrypt_key: SecureBuf::from_slice(&b[0..64]),
            decrypt_key: SecureBuf::from_slice(&b[64..128]),
            encrypt_hmac: SecureBuf::from_slice(&b[128..192]),
            decrypt_hmac: SecureBuf::from_slice(&b[192..256]),
        }
    }
}

/// Derive the 256-byte data-channel key block.
///
/// Deterministic: identical inputs produce an identical block, which is what
/// lets both peers agree on keys without sending them.
pub fn derive_key_material(inputs: &KeyExpansionInputs<'_>) -> Result<KeyMaterial> {
    if inputs.pre_master.len() != MASTER_SECRET_LEN {
        return Err(CryptoError::KeyDerivationFailed("pre-master must be 48 bytes"));
    }

    let mut master_seed = SecureBuf::with_capacity(128);
    master_seed.append(MASTER_LABEL);
    master_seed.append(inputs.random1);
    master_seed.append(inputs.server_random1);
    let master = tls1_prf(inputs.pre_master, master_seed.as_slice(), MASTER_SECRET_LEN);

    let mut block_seed = SecureBuf::with_capacity(128);
    block_seed.append(EXPANSION_LABEL);
    block_seed.append(inputs.random2);
    block_seed.append(inputs.server_random2);
    block_seed.append(inputs.local_session_id);
    block_seed.append(inputs.remote_session_id);
    let block = tls1_prf(master.as_slice(), block_seed.as_slice(), KEY_BLOCK_LEN);

    Ok(KeyMaterial::from_block(&block))
}

/// TLS 1.0 PRF: P_MD5 over the first half of the secret XOR P_SHA1 over the
/// second half. Odd-length secrets share their middle byte between halves.
pub fn tls1_prf(secret: &[u8], seed: &[u8], output_len: usize) -> SecureBuf {
    let half = secret.len().div_ceil(2);
    let s1 = &secret[..half];
    let s2 = &secret[secret.len() - half..];

    let mut out = SecureBuf::zeroed(output_len);
    p_md5(s1, seed, out.as_mut_slice());

    let mut sha_part = SecureBuf::zeroed(output_len);
    p_sha1(s2, seed, sha_part.as_mut_slice());

    for (o, s) in out.as_mut_slice().iter_mut().zip(sha_part.as_slice()) {
        *o ^= s;
    }
    out
}

fn p_md5(secret: &[u8], seed: &[u8], out: &mut [u8]) {
    type M = Hmac<Md5>;
    let mut a = {
        let mut mac = M::new_from_slice(secret).expect("HMAC accepts any key size");
        mac.update(seed);
        mac.finalize().into_bytes()
    };

    let mut written = 0;
    while written < out.len() {
        let mut mac = M::new_from_slice(secret).expect("HMAC accepts any key size");
        mac.update(&a);
        mac.update(seed);
        let chunk = mac.finalize().into_bytes();

        let take = chunk.len().min(out.len() - written);
        out[written..written + take].copy_from_slice(&chunk[..take]);
        written += take;

        let mut mac = M::new_from_slice(secret).expect("HMAC accepts any key size");
        mac.update(&a);
        a = mac.finalize().into_bytes();
    }
}

fn p_sha1(secret: &[u8], seed: &[u8], out: &mut [u8]) {
    type M = Hmac<Sha1>;
    let mut a = {
        let mut mac = M::new_from_slice(secret).expect("HMAC accepts any key size");
        mac.update(seed);
        mac.finalize().into_bytes()
    };

    let mut written = 0;
    while written < out.len() {
        let mut mac = M::new_from_slice(secret).expect("HMAC accepts any key size");
        mac.update(&a);
        mac.update(seed);
        let chunk = mac.finalize().into_bytes();

        let take = chunk.len().min(out.len() - written);
        out[written..written + take].copy_from_slice(&chunk[..take]);
        written += take;

        let mut mac = M::new_from_slice(secret).expect("HMAC accepts any key size");
        mac.update(&a);
        a = mac.finalize().into_bytes();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hmac::{Hmac, Mac};
    use sha1::Sha1;

    fn inputs<'a>(
        pre_master: &'a [u8; 48],
        lsid: &'a [u8; 8],
        rsid: &'a [u8; 8],
    ) -> KeyExpansionInputs<'a> {
        KeyExpansionInputs {
            pre_master,
            random1: &[0x01; 32],
            random2: &[0x02; 32],
            server_random1: &[0x03; 32],
            server_random2: &[0x04; 32],
            local_session_id: lsid,
            remote_session_id: rsid,
        }
    }

    #[test]
    fn test_prf_first_block_matches_rfc2246_definition() {
        // P_SHA1(secret, seed)[..20] must equal HMAC(secret, A(1) || seed)
        // with A(1) = HMAC(secret, seed); the second half of an even secret
        // drives P_SHA1, so XORing out an independently-computed P_MD5 over
        // the first half recovers it.
        let secret = b"0123456789abcdef";
        let seed = b"prf structural check";
        let out = tls1_prf(secret, seed, 16);

        type HS = Hmac<Sha1>;
        let (s1, s2) = (&secret[..8], &secret[8..]);

        let mut mac = HS::new_from_slice(s2).unwrap();
        mac.update(seed);
        let a1 = mac.finalize().into_bytes();
        let mut mac = HS::new_from_slice(s2).unwrap();
        mac.update(&a1);
        mac.update(seed);
        let sha_block = mac.finalize().into_bytes();

        type HM = Hmac<md5::Md5>;
        let mut mac = HM::new_from_slice(s1).unwrap();
        mac.update(seed);
        let a1 = mac.finalize().into_bytes();
        let mut mac = HM::new_from_slice(s1).unwrap();
        mac.update(&a1);
        mac.update(seed);
        let md5_block = mac.finalize().into_bytes();

        let expected: Vec<u8> = md5_block
            .iter()
            .zip(sha_block.iter())
            .map(|(m, s)| m ^ s)
            .take(16)
            .collect();
        assert_eq!(out.as_slice(), expected.as_slice());
    }

    #[test]
    fn test_prf_output_length() {
        let out = tls1_prf(b"secret", b"seed", 104);
        assert_eq!(out.len(), 104);
    }

    #[test]
    fn test_key_material_deterministic() {
        let pm = [0x42u8; 48];
        let lsid = [0x10u8; 8];
        let rsid = [0x20u8; 8];

        let a = derive_key_material(&inputs(&pm, &lsid, &rsid)).unwrap();
        let b = derive_key_material(&inputs(&pm, &lsid, &rsid)).unwrap();

        assert_eq!(a.encrypt_key, b.encrypt_key);
        assert_eq!(a.decrypt_key, b.decrypt_key);
        assert_eq!(a.encrypt_hmac, b.encrypt_hmac);
        assert_eq!(a.decrypt_hmac, b.decrypt_hmac);
    }

    #[test]
    fn test_key_material_slots_differ() {
        let pm = [0x42u8; 48];
        let lsid = [0x10u8; 8];
        let rsid = [0x20u8; 8];
        let material = derive_key_material(&inputs(&pm, &lsid, &rsid)).unwrap();

        assert_eq!(material.encrypt_key.len(), KEY_SLOT_LEN);
        assert_ne!(material.encrypt_key, material.decrypt_key);
        assert_ne!(material.encrypt_hmac, material.decrypt_hmac);
        assert_ne!(material.encrypt_key, material.encrypt_hmac);
    }

    #[test]
    fn test_session_id_changes_material() {
        let pm = [0x42u8; 48];
        let lsid = [0x10u8; 8];
        let a = derive_key_material(&inputs(&pm, &lsid, &[0x20u8; 8])).unwrap();
        let b = derive_key_material(&inputs(&pm, &lsid, &[0x21u8; 8])).unwrap();
        assert_ne!(a.encrypt_key, b.encrypt_key);
    }

    #[test]
    fn test_rejects_short_pre_master() {
        let pm = [0u8; 48];
        let lsid = [0u8; 8];
        let rsid = [0u8; 8];
        let mut bad = inputs(&pm, &lsid, &rsid);
        bad.pre_master = &pm[..32];
        assert!(derive_key_material(&bad).is_err());
    }
}
