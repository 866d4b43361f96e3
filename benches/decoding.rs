use base64::Engine;
use bytes::Bytes;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use futures::TryStreamExt;
use std::path::Path;

use mailstash::model::structure::TransferEncoding;
use mailstash::parser::decode;

/// 1 MiB of base64, wrapped at 76 columns like a real MIME body.
fn encoded_body() -> Bytes {
    let payload: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();
    let encoded = base64::engine::general_purpose::STANDARD.encode(&payload);
    let mut wrapped = Vec::with_capacity(encoded.len() + encoded.len() / 38);
    for line in encoded.as_bytes().chunks(76) {
        wrapped.extend_from_slice(line);
        wrapped.extend_from_slice(b"\r\n");
    }
    Bytes::from(wrapped)
}

fn bench_base64_stream(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let body = encoded_body();

    let mut group = c.benchmark_group("base64_stream");
    group.throughput(Throughput::Bytes(body.len() as u64));
    for chunk_size in [1024usize, 16 * 1024, 256 * 1024] {
        group.bench_with_input(
            BenchmarkId::from_parameter(chunk_size),
            &chunk_size,
            |b, &chunk_size| {
                b.to_async(&runtime).iter(|| {
                    let raw = decode::chunked(body.clone(), chunk_size);
                    async move {
                        decode::wrap(raw, &TransferEncoding::Base64)
                            .try_fold(0usize, |n, chunk| async move { Ok(n + chunk.len()) })
                            .await
                            .unwrap()
                    }
                })
            },
        );
    }
    group.finish();
}

fn bench_locate_fixture(c: &mut Criterion) {
    let fixture_path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join("statement.eml");
    let message = mailstash::parser::eml::read_eml(&fixture_path).unwrap();

    c.bench_function("locate_statement", |b| {
        b.iter(|| mailstash::parser::locate::locate(&message.root, message.date))
    });
}

criterion_group!(benches, bench_base64_stream, bench_locate_fixture);
criterion_main!(benches);
