//! Performance benchmarks for the AS2 envelope codec.
//!
//! Run with: cargo bench

use chrono::{Duration, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use as2_gateway::as2::{parse_mdn, Disposition, Mdn};
use as2_gateway::crypto::{
    compute_mic, decode, encode, issue_certificate, AlgorithmPolicy, CertificateTemplate,
    EncodeOptions, EncryptionKeyPair, RecipientIdentity, SenderIdentity, SigningKeyPair,
};
use as2_gateway::domain::{Certificate, CertificateOwner, EncryptionAlgorithm, MicAlgorithm};

const SIZES: [usize; 4] = [1024, 16 * 1024, 256 * 1024, 1024 * 1024];

/// X12-looking payload of roughly `size` bytes
fn edi_payload(size: usize) -> Vec<u8> {
    let segment = b"IT1*1*10*EA*9.99**VP*SKU-0001~";
    segment.iter().copied().cycle().take(size).collect()
}

fn certificate(serial: &str, encryption: &EncryptionKeyPair, signing: &SigningKeyPair) -> Certificate {
    let now = Utc::now();
    issue_certificate(
        CertificateTemplate {
            serial: serial.to_string(),
            subject_dn: format!("CN={serial}"),
            issuer_dn: format!("CN={serial}"),
            valid_from: now - Duration::days(1),
            valid_to: now + Duration::days(365),
            owner: CertificateOwner::Own,
        },
        Some(encryption),
        Some(signing),
        now,
    )
    .expect("issue certificate")
}

struct Parties {
    sender: SenderIdentity,
    sender_cert: Certificate,
    recipient: RecipientIdentity,
    recipient_cert: Certificate,
}

fn parties() -> Parties {
    let sender_signing = SigningKeyPair::generate();
    let sender_cert = certificate("BENCH-SENDER", &EncryptionKeyPair::generate(), &sender_signing);
    let recipient_encryption = EncryptionKeyPair::generate();
    let recipient_cert = certificate(
        "BENCH-RECIPIENT",
        &recipient_encryption,
        &SigningKeyPair::generate(),
    );

    Parties {
        sender: SenderIdentity {
            signing_key: sender_signing,
            certificate_fingerprint: sender_cert.fingerprint.clone(),
        },
        sender_cert,
        recipient: RecipientIdentity {
            encryption_key: recipient_encryption,
            certificate_fingerprint: recipient_cert.fingerprint.clone(),
        },
        recipient_cert,
    }
}

fn options(compress: bool) -> EncodeOptions {
    EncodeOptions {
        cipher: EncryptionAlgorithm::Aes256Gcm,
        mic_algorithm: MicAlgorithm::Sha256,
        compress,
    }
}

/// Benchmark MIC computation
fn bench_mic(c: &mut Criterion) {
    let mut group = c.benchmark_group("mic");

    for size in SIZES {
        let payload = edi_payload(size);
        group.throughput(Throughput::Bytes(size as u64));
        for alg in [MicAlgorithm::Sha1, MicAlgorithm::Sha256] {
            group.bench_with_input(BenchmarkId::new(alg.as_str(), size), &payload, |b, payload| {
                b.iter(|| black_box(compute_mic(alg, payload)));
            });
        }
    }

    group.finish();
}

/// Benchmark signing and encrypting an outbound payload
fn bench_encode(c: &mut Criterion) {
    let parties = parties();
    let policy = AlgorithmPolicy::default();
    let mut group = c.benchmark_group("envelope_encode");

    for size in SIZES {
        let payload = edi_payload(size);
        group.throughput(Throughput::Bytes(size as u64));
        for compress in [false, true] {
            let name = if compress { "compressed" } else { "plain" };
            group.bench_with_input(BenchmarkId::new(name, size), &payload, |b, payload| {
                b.iter(|| {
                    black_box(
                        encode(
                            payload,
                            "application/edi-x12",
                            options(compress),
                            &parties.sender,
                            &parties.recipient_cert,
                            &policy,
                        )
                        .expect("encode"),
                    )
                });
            });
        }
    }

    group.finish();
}

/// Benchmark opening and verifying an inbound envelope
fn bench_decode(c: &mut Criterion) {
    let parties = parties();
    let policy = AlgorithmPolicy::default();
    let mut group = c.benchmark_group("envelope_decode");

    for size in SIZES {
        let encoded = encode(
            &edi_payload(size),
            "application/edi-x12",
            options(true),
            &parties.sender,
            &parties.recipient_cert,
            &policy,
        )
        .expect("encode");

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &encoded.bytes, |b, bytes| {
            b.iter(|| {
                black_box(
                    decode(bytes, &parties.recipient, &parties.sender_cert, &policy)
                        .expect("decode"),
                )
            });
        });
    }

    group.finish();
}

/// Benchmark MDN rendering and parsing
fn bench_mdn(c: &mut Criterion) {
    let mdn = Mdn {
        message_id: Some("<mdn-1@globex>".to_string()),
        reporting_ua: "as2-gateway".to_string(),
        original_recipient: Some("GLOBEX".to_string()),
        final_recipient: "GLOBEX".to_string(),
        original_message_id: "<msg-1@acme>".to_string(),
        received_content_mic: Some("q6Hx0Jt8y3xYQ9t0j7h6Ww==, sha256".to_string()),
        disposition: Disposition::processed(),
    };
    let key = SigningKeyPair::generate();
    let rendered = mdn.render_signed(&key, "bench-fingerprint");

    c.bench_function("mdn_render_signed", |b| {
        b.iter(|| black_box(mdn.render_signed(&key, "bench-fingerprint")));
    });
    c.bench_function("mdn_parse", |b| {
        b.iter(|| black_box(parse_mdn(&rendered).expect("parse")));
    });
}

criterion_group!(benches, bench_mic, bench_encode, bench_decode, bench_mdn);
criterion_main!(benches);
