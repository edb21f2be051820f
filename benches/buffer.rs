use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use angelreactor::Buffer;

const SMALL: &[u8] = b"PING\r\n";
const MEDIUM: &[u8] = &[b'x'; 4096];
const LARGE: &[u8] = &[b'x'; 65536 + 4096];

fn append_retrieve(c: &mut Criterion) {
    let inputs = [SMALL, MEDIUM, LARGE];

    let mut group = c.benchmark_group("append_retrieve");
    for &input in inputs.iter() {
        group.throughput(Throughput::Bytes(input.len() as u64));
        group.bench_with_input(BenchmarkId::new("roundtrip", input.len() as u64), input, |b, i| {
            b.iter(|| {
                let mut buf = Buffer::new();
                buf.append(i);
                buf.retrieve(i.len());
            })
        });
    }
    group.finish();
}

fn find_crlf(c: &mut Criterion) {
    let mut group = c.benchmark_group("find_crlf");
    for &input in [SMALL, MEDIUM].iter() {
        let mut buf = Buffer::new();
        buf.append(input);
        buf.append(b"\r\n");
        group.throughput(Throughput::Bytes(input.len() as u64));
        group.bench_with_input(BenchmarkId::new("scan", input.len() as u64), &buf, |b, buf| {
            b.iter(|| buf.find_crlf())
        });
    }
    group.finish();
}

criterion_group!(benches, append_retrieve, find_crlf);
criterion_main!(benches);
