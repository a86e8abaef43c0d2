//! Performance benchmarks for veil-crypto.
//!
//! Run with: `cargo bench -p veil-crypto`
//!
//! Every datagram passes through one encrypt or decrypt, so per-suite
//! throughput at MTU-sized buffers bounds session throughput.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use rand::RngCore;
use rand_core::OsRng;
use veil_crypto::{CipherSuite, ConvIdGenerator, derive_key};

// ============================================================================
// Cipher Benchmarks
// ============================================================================

fn bench_suite_encrypt(c: &mut Criterion) {
    let mut group = c.benchmark_group("suite_encrypt");

    let size = 1400;
    let mut datagram = vec![0u8; size];
    OsRng.fill_bytes(&mut datagram);

    for &suite in CipherSuite::all() {
        let Ok(Some(crypt)) = suite.build("bench-seed") else {
            continue;
        };
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(suite), &suite, |b, _| {
            let mut buf = datagram.clone();
            b.iter(|| crypt.encrypt(black_box(&mut buf)))
        });
    }

    group.finish();
}

fn bench_aes_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("aes128_decrypt");

    let crypt = match CipherSuite::Aes128.build("bench-seed") {
        Ok(Some(crypt)) => crypt,
        _ => return,
    };

    for size in [64, 256, 576, 1400] {
        let mut buf = vec![0xAAu8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| crypt.decrypt(black_box(&mut buf)))
        });
    }

    group.finish();
}

// ============================================================================
// Key Derivation / Id Benchmarks
// ============================================================================

fn bench_derive_key(c: &mut Criterion) {
    c.bench_function("derive_key_32", |b| {
        b.iter(|| derive_key(black_box("bench-seed"), 32))
    });
}

fn bench_conv_id(c: &mut Criterion) {
    let generator = ConvIdGenerator::new();
    c.bench_function("conv_id_next", |b| b.iter(|| generator.next()));
}

criterion_group!(cipher_benches, bench_suite_encrypt, bench_aes_sizes);

criterion_group!(setup_benches, bench_derive_key, bench_conv_id);

criterion_main!(cipher_benches, setup_benches);
