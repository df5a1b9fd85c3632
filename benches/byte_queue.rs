use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mill_conn::{buffer_pool::BufferPool, ByteQueue, LengthPrefix};

fn fragmented_lines(lines: usize, fragment: usize) -> Vec<Bytes> {
    let mut stream = Vec::new();
    for i in 0..lines {
        stream.extend_from_slice(format!("GET /resource/{i} HTTP/1.1\r\n").as_bytes());
    }
    stream.chunks(fragment).map(Bytes::copy_from_slice).collect()
}

fn bench_read_by_delimiter(c: &mut Criterion) {
    let mut group = c.benchmark_group("read_by_delimiter");

    for fragment in [16, 256, 4096] {
        let fragments = fragmented_lines(1000, fragment);
        let total: usize = fragments.iter().map(Bytes::len).sum();
        group.throughput(Throughput::Bytes(total as u64));
        group.bench_with_input(BenchmarkId::from_parameter(fragment), &fragments, |b, fragments| {
            b.iter(|| {
                let mut queue = ByteQueue::new();
                for fragment in fragments {
                    queue.append(fragment.clone());
                }
                while let Ok(line) = queue.read_bytes_by_delimiter(b"\r\n", None) {
                    black_box(line);
                }
            });
        });
    }
    group.finish();
}

fn bench_read_length_prefixed(c: &mut Criterion) {
    let mut group = c.benchmark_group("read_length_prefixed");

    for payload in [32usize, 1024, 16 * 1024] {
        let mut frame = Vec::with_capacity(4 + payload);
        frame.extend_from_slice(&(payload as u32).to_be_bytes());
        frame.resize(4 + payload, 0xAB);
        let frame = Bytes::from(frame);

        group.throughput(Throughput::Bytes(frame.len() as u64 * 100));
        group.bench_with_input(BenchmarkId::from_parameter(payload), &frame, |b, frame| {
            b.iter(|| {
                let mut queue = ByteQueue::new();
                for _ in 0..100 {
                    queue.append(frame.clone());
                }
                while let Ok(body) = queue.read_length_prefixed(LengthPrefix::U32, None) {
                    black_box(body);
                }
            });
        });
    }
    group.finish();
}

fn bench_buffer_pool(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer_pool");

    for read_size in [64usize, 1500, 16 * 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(read_size), &read_size, |b, &n| {
            let mut pool = BufferPool::default();
            b.iter(|| {
                let buffer = pool.acquire(pool.min_buffer_size());
                let used = n.min(buffer.len());
                black_box(pool.extract_used_and_recycle_remainder(buffer, used));
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_read_by_delimiter,
    bench_read_length_prefixed,
    bench_buffer_pool
);
criterion_main!(benches);
