//! Cryptographic performance benchmarks
//!
//! Measures the data-plane ciphers and the key expansion PRF across common
//! VPN packet sizes.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use nimbusvpn_crypto::{
    derive_key_material, tls1_prf, AuthDigest, CipherCtx, DataCipher, HmacKey,
    KeyExpansionInputs,
};

fn bench_gcm(c: &mut Criterion) {
    let mut group = c.benchmark_group("gcm");

    let key = [0x42u8; 64];
    let iv = [0u8; 12];
    let ad = [0x48u8, 0, 0, 1, 0, 0, 0, 1];

    for size in [64usize, 256, 1400] {
        let plaintext = vec![0xABu8; size];

        for cipher in [DataCipher::Aes128Gcm, DataCipher::Aes256Gcm] {
            let ctx = CipherCtx::new(cipher, &key).unwrap();
            group.throughput(Throughput::Bytes(size as u64));
            group.bench_with_input(
                BenchmarkId::new(cipher.option_name(), size),
                &size,
                |b, _| {
                    b.iter(|| ctx.seal(black_box(&iv), black_box(&plaintext), black_box(&ad)));
                },
            );
        }
    }

    group.finish();
}

fn bench_cbc_hmac(c: &mut Criterion) {
    let mut group = c.benchmark_group("cbc_hmac");

    let ctx = CipherCtx::new(DataCipher::Aes256Cbc, &[0x42u8; 64]).unwrap();
    let hmac = HmacKey::new(AuthDigest::Sha1, &[0x24u8; 64]).unwrap();
    let iv = [0u8; 16];

    for size in [64usize, 1400] {
        let plaintext = vec![0xABu8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("encrypt_then_mac", size), &size, |b, _| {
            b.iter(|| {
                let ciphertext = ctx
                    .cbc_encrypt(black_box(&iv), black_box(&plaintext))
                    .unwrap();
                hmac.sign(&[&iv, &ciphertext])
            });
        });
    }

    group.finish();
}

fn bench_key_expansion(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_expansion");

    let pre_master = [0x42u8; 48];
    let lsid = [0x10u8; 8];
    let rsid = [0x20u8; 8];

    group.bench_function("derive_key_material", |b| {
        b.iter(|| {
            derive_key_material(black_box(&KeyExpansionInputs {
                pre_master: &pre_master,
                random1: &[0x01; 32],
                random2: &[0x02; 32],
                server_random1: &[0x03; 32],
                server_random2: &[0x04; 32],
                local_session_id: &lsid,
                remote_session_id: &rsid,
            }))
        });
    });

    group.bench_function("tls1_prf_256", |b| {
        b.iter(|| tls1_prf(black_box(&pre_master), black_box(b"seed material"), 256));
    });

    group.finish();
}

criterion_group!(benches, bench_gcm, bench_cbc_hmac, bench_key_expansion);
criterion_main!(benches);
