//! Multi-threaded use of one executor

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use streamexec::host::{self, HostConfig, KernelLibrary};
use streamexec::{
    BlockDim, CodeFormat, Executor, HostBuffer, KernelArgs, KernelHandle, KernelLoaderSpec,
    PlatformRegistry, ThreadDim,
};

fn slow_executor(latency_us: u64) -> (PlatformRegistry, Executor) {
    let registry = PlatformRegistry::new();
    host::register(
        &registry,
        HostConfig {
            device_count: 1,
            memory_per_device: 64 << 20,
            latency_us,
        },
        KernelLibrary::builtin(),
    )
    .unwrap();
    let executor = registry.lookup("host").unwrap().executor(0).unwrap();
    (registry, executor)
}

fn load_saxpy(executor: &Executor) -> KernelHandle {
    let mut spec = KernelLoaderSpec::new();
    spec.add_in_memory("host", CodeFormat::HostSymbol, "saxpy", 4, b"saxpy".to_vec());
    let mut handle = KernelHandle::new();
    executor.get_kernel(&spec, &mut handle).unwrap();
    handle
}

/// Allocate, upload, launch saxpy, read back and check, `rounds` times.
fn round_trips(executor: &Executor, seed: u8, rounds: usize) {
    const N: usize = 64;
    let saxpy = load_saxpy(executor);
    let stream = executor.create_stream().unwrap();
    for round in 0..rounds {
        let scale = f32::from(seed) + round as f32;
        let x: Vec<f32> = (0..N).map(|i| (i ^ usize::from(seed)) as f32).collect();
        let y: Vec<f32> = (0..N).map(|i| (i + round) as f32).collect();
        let dx = executor.allocate_scoped((N * 4) as u64).unwrap();
        let dy = executor.allocate_scoped((N * 4) as u64).unwrap();
        let readback = HostBuffer::new(N * 4);
        let args = KernelArgs::new()
            .arg(N as u32)
            .arg(scale)
            .arg(&*dx)
            .arg(&*dy);

        stream
            .init()
            .then_memcpy_h2d(&dx, bytemuck::cast_slice(&x))
            .then_memcpy_h2d(&dy, bytemuck::cast_slice(&y))
            .then_launch(ThreadDim::new(N as u32, 1, 1), BlockDim::new(1, 1, 1), &saxpy, &args)
            .then_memcpy_d2h(&readback, &dy)
            .block_host_until_done()
            .unwrap();

        let result: Vec<f32> = readback
            .to_vec()
            .chunks_exact(4)
            .map(bytemuck::pod_read_unaligned::<f32>)
            .collect();
        let expected: Vec<f32> = x.iter().zip(&y).map(|(x, y)| scale * x + y).collect();
        assert_eq!(result, expected, "seed {} round {}", seed, round);
    }
}

#[test]
fn test_two_threads_share_an_executor() {
    let (_registry, executor) = slow_executor(500);
    thread::scope(|s| {
        let a = s.spawn(|| round_trips(&executor, 0x5a, 20));
        let b = s.spawn(|| round_trips(&executor, 0xa5, 20));
        a.join().unwrap();
        b.join().unwrap();
    });
    assert_eq!(executor.live_allocations(), 0);
}

#[test]
fn test_enqueue_does_not_wait_for_device() {
    let (_registry, executor) = slow_executor(20_000);
    let device = executor.allocate_scoped(4).unwrap();
    let stream = executor.create_stream().unwrap();

    let start = Instant::now();
    let mut chain = stream.init();
    for _ in 0..10 {
        chain = chain.then_memzero(&device);
    }
    let enqueue_time = start.elapsed();
    chain.block_host_until_done().unwrap();

    // Ten commands at 20ms each take 200ms to run
    assert!(start.elapsed() >= Duration::from_millis(200));
    assert!(enqueue_time < Duration::from_millis(100), "enqueue took {:?}", enqueue_time);
}

#[test]
fn test_streams_progress_independently() {
    let (_registry, executor) = slow_executor(0);
    let gate = Arc::new(Barrier::new(2));
    let blocked = executor.create_stream().unwrap();
    let free = executor.create_stream().unwrap();
    let ran = Arc::new(AtomicUsize::new(0));

    // `blocked` parks on the barrier until the test thread passes it
    let parked = Arc::clone(&gate);
    blocked
        .init()
        .then_do_host_callback(move || {
            parked.wait();
        })
        .finish();

    let counter = Arc::clone(&ran);
    free.init()
        .then_do_host_callback(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .block_host_until_done()
        .unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 1);

    gate.wait();
    blocked.block_host_until_done().unwrap();
}

#[test]
fn test_many_threads_many_streams() {
    let (_registry, executor) = slow_executor(50);
    let completed = AtomicUsize::new(0);
    thread::scope(|s| {
        for seed in 0..8u8 {
            let executor = &executor;
            let completed = &completed;
            s.spawn(move || {
                round_trips(executor, seed, 5);
                completed.fetch_add(1, Ordering::SeqCst);
            });
        }
    });
    assert_eq!(completed.load(Ordering::SeqCst), 8);
    executor.synchronize_all_activity().unwrap();
}
