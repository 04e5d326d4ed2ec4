use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use streamexec::{HostBuffer, PlatformRegistry, host};

fn bench_round_trip(c: &mut Criterion) {
    let registry = PlatformRegistry::new();
    host::register_default(&registry).unwrap();
    let executor = registry.lookup("host").unwrap().executor(0).unwrap();
    let stream = executor.create_stream().unwrap();

    let mut group = c.benchmark_group("round_trip");
    for size in [64usize, 4096, 1 << 20] {
        let device = executor.allocate_scoped(size as u64).unwrap();
        let data = vec![0xabu8; size];
        let readback = HostBuffer::new(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                stream
                    .init()
                    .then_memcpy_h2d(&device, black_box(&data))
                    .then_memcpy_d2h(&readback, &device)
                    .block_host_until_done()
                    .unwrap()
            })
        });
    }
    group.finish();
}

fn bench_empty_chain(c: &mut Criterion) {
    let registry = PlatformRegistry::new();
    host::register_default(&registry).unwrap();
    let executor = registry.lookup("host").unwrap().executor(0).unwrap();
    let stream = executor.create_stream().unwrap();

    c.bench_function("callback_sync", |b| {
        b.iter(|| {
            stream
                .init()
                .then_do_host_callback(|| {})
                .block_host_until_done()
                .unwrap()
        })
    });
}

criterion_group!(benches, bench_round_trip, bench_empty_chain);
criterion_main!(benches);
