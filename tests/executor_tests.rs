//! Executor tests: devices, memory, kernel loading and plugins

use std::sync::Arc;
use streamexec::host::{self, HostConfig, KernelLibrary};
use streamexec::{
    BlockDim, CannedPlugin, CodeFormat, DeviceDescription, Error, ErrorKind, Executor,
    ExecutorConfig, KernelArgs, KernelHandle, KernelLoaderSpec, PluginChoice, PluginFactory,
    PluginKind, PlatformRegistry, ThreadDim,
};

fn small_host(memory: u64) -> PlatformRegistry {
    let registry = PlatformRegistry::new();
    host::register(
        &registry,
        HostConfig {
            device_count: 2,
            memory_per_device: memory,
            latency_us: 0,
        },
        KernelLibrary::builtin(),
    )
    .unwrap();
    registry
}

fn executor(registry: &PlatformRegistry) -> Executor {
    registry.lookup("host").unwrap().executor(0).unwrap()
}

fn saxpy_spec() -> KernelLoaderSpec {
    let mut spec = KernelLoaderSpec::new();
    spec.add_in_memory("host", CodeFormat::HostSymbol, "saxpy", 4, b"saxpy".to_vec());
    spec
}

// === Devices ===

#[test]
fn test_init_in_range() {
    let registry = small_host(1 << 20);
    let platform = registry.lookup("host").unwrap();
    for ordinal in 0..platform.device_count() {
        let executor = platform.executor(ordinal).unwrap();
        assert_eq!(executor.device_ordinal(), ordinal);
        assert_eq!(executor.description().ordinal, ordinal);
    }
}

#[test]
fn test_init_out_of_range() {
    let registry = small_host(1 << 20);
    let err = registry.lookup("host").unwrap().executor(2).unwrap_err();
    assert_eq!(
        err,
        Error::DeviceNotFound {
            platform: "host".into(),
            ordinal: 2,
            count: 2,
        }
    );
}

#[test]
fn test_executors_have_distinct_ids() {
    let registry = small_host(1 << 20);
    let platform = registry.lookup("host").unwrap();
    let a = platform.executor(0).unwrap();
    let b = platform.executor(0).unwrap();
    assert_ne!(a.id(), b.id());
}

// === Memory ===

#[test]
fn test_allocate_and_deallocate() {
    let registry = small_host(4096);
    let executor = executor(&registry);

    let a = executor.allocate(1024).unwrap();
    let b = executor.allocate(2048).unwrap();
    assert_eq!(a.size(), 1024);
    assert!(!a.is_null());
    assert_ne!(a.address(), b.address());
    assert_eq!(executor.allocated_bytes(), 3072);
    assert_eq!(executor.live_allocations(), 2);
    assert_eq!(executor.memory_usage(), Some((1024, 4096)));

    executor.deallocate(a);
    assert_eq!(executor.allocated_bytes(), 2048);

    // Reallocation after release succeeds
    let c = executor.allocate(2048).unwrap();
    executor.deallocate(b);
    executor.deallocate(c);
    assert_eq!(executor.allocated_bytes(), 0);
    assert_eq!(executor.memory_usage(), Some((4096, 4096)));
}

#[test]
fn test_allocate_zero_is_null() {
    let registry = small_host(4096);
    let executor = executor(&registry);
    let memory = executor.allocate(0).unwrap();
    assert!(memory.is_null());
    assert_eq!(executor.live_allocations(), 0);
    executor.deallocate(memory);
}

#[test]
fn test_out_of_memory() {
    let registry = small_host(4096);
    let executor = executor(&registry);
    let err = executor.allocate(8192).unwrap_err();
    assert_eq!(
        err,
        Error::OutOfMemory {
            requested: 8192,
            available: 4096,
        }
    );
}

#[test]
fn test_deallocate_twice_only_warns() {
    let registry = small_host(4096);
    let executor = executor(&registry);
    let memory = executor.allocate(64).unwrap();
    executor.deallocate(memory);
    executor.deallocate(memory);
    assert_eq!(executor.allocated_bytes(), 0);
}

fn fails_after_allocating(executor: &Executor) -> Result<(), Error> {
    let _scratch = executor.allocate_scoped(1024)?;
    executor.allocate(1 << 30)?;
    Ok(())
}

#[test]
fn test_scoped_memory_released_on_early_return() {
    let registry = small_host(4096);
    let executor = executor(&registry);

    let err = fails_after_allocating(&executor).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfMemory);
    assert_eq!(executor.live_allocations(), 0);
}

#[test]
fn test_scoped_memory_release() {
    let registry = small_host(4096);
    let executor = executor(&registry);

    let scoped = executor.allocate_scoped(512).unwrap();
    let memory = scoped.release();
    assert_eq!(executor.live_allocations(), 1);

    executor.deallocate(memory);
    assert_eq!(executor.live_allocations(), 0);
}

#[test]
fn test_scoped_memory_reset() {
    let registry = small_host(4096);
    let executor = executor(&registry);

    let mut scoped = executor.allocate_scoped(512).unwrap();
    let replacement = executor.allocate(256).unwrap();
    scoped.reset(replacement);
    assert_eq!(executor.allocated_bytes(), 256);
    assert_eq!(*scoped.get(), replacement);

    drop(scoped);
    assert_eq!(executor.allocated_bytes(), 0);
}

#[test]
fn test_synchronous_copies() {
    let registry = small_host(1 << 20);
    let executor = executor(&registry);
    let a = executor.allocate_scoped(8).unwrap();
    let b = executor.allocate_scoped(8).unwrap();

    executor
        .synchronous_memcpy_h2d(&a, &[1, 2, 3, 4, 5, 6, 7, 8])
        .unwrap();
    executor.synchronous_memcpy_d2d(&b, &a).unwrap();

    let mut out = [0u8; 8];
    executor.synchronous_memcpy_d2h(&mut out, &b).unwrap();
    assert_eq!(out, [1, 2, 3, 4, 5, 6, 7, 8]);

    // Partial read from the start of the buffer
    let mut head = [0u8; 3];
    executor.synchronous_memcpy_d2h(&mut head, &b).unwrap();
    assert_eq!(head, [1, 2, 3]);
}

#[test]
fn test_synchronous_copy_too_large() {
    let registry = small_host(1 << 20);
    let executor = executor(&registry);
    let a = executor.allocate_scoped(4).unwrap();
    let err = executor
        .synchronous_memcpy_h2d(&a, &[0u8; 16])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CopyFailed);
}

// === Kernels ===

#[test]
fn test_get_kernel_binds_handle() {
    let registry = small_host(1 << 20);
    let executor = executor(&registry);

    let mut handle = KernelHandle::new();
    assert!(!handle.is_bound());
    executor.get_kernel(&saxpy_spec(), &mut handle).unwrap();

    assert!(handle.is_bound());
    assert_eq!(handle.name(), Some("saxpy"));
    assert_eq!(handle.arity(), Some(4));
    assert_eq!(handle.format(), Some(CodeFormat::HostSymbol));
    assert_eq!(handle.executor(), Some(executor.id()));
    assert_eq!(executor.loaded_kernels(), 1);

    // Rebinding unloads the previous code
    executor.get_kernel(&saxpy_spec(), &mut handle).unwrap();
    assert_eq!(executor.loaded_kernels(), 1);

    executor.unload_kernel(&mut handle);
    assert!(!handle.is_bound());
    assert_eq!(executor.loaded_kernels(), 0);
}

#[test]
fn test_no_matching_entry() {
    // A host-backed stand-in for a CUDA platform
    let registry = PlatformRegistry::new();
    host::register_as(&registry, "cuda", HostConfig::default(), KernelLibrary::builtin()).unwrap();
    let executor = registry.lookup("cuda").unwrap().executor(0).unwrap();

    let mut spec = KernelLoaderSpec::new();
    spec.add_in_memory(
        "opencl",
        CodeFormat::OpenClSource,
        "saxpy",
        4,
        b"__kernel void saxpy() {}".to_vec(),
    );
    let mut handle = KernelHandle::new();
    let err = executor.get_kernel(&spec, &mut handle).unwrap_err();
    assert_eq!(
        err,
        Error::NoMatchingEntry {
            kernel: "saxpy".into(),
            platform: "cuda".into(),
        }
    );
    assert!(!handle.is_bound());
}

#[test]
fn test_unbound_kernel_launch() {
    let registry = small_host(1 << 20);
    let executor = executor(&registry);
    let stream = executor.create_stream().unwrap();

    let err = stream
        .init()
        .then_launch(
            ThreadDim::new(1, 1, 1),
            BlockDim::new(1, 1, 1),
            &KernelHandle::new(),
            &KernelArgs::new(),
        )
        .block_host_until_done()
        .unwrap_err();
    assert_eq!(err, Error::UnboundKernel);
}

#[test]
fn test_argument_count_mismatch() {
    let registry = small_host(1 << 20);
    let executor = executor(&registry);
    let mut handle = KernelHandle::new();
    executor.get_kernel(&saxpy_spec(), &mut handle).unwrap();

    let stream = executor.create_stream().unwrap();
    let err = stream
        .init()
        .then_launch(
            ThreadDim::new(1, 1, 1),
            BlockDim::new(1, 1, 1),
            &handle,
            &KernelArgs::new().arg(1u32).arg(2.0f32),
        )
        .block_host_until_done()
        .unwrap_err();
    assert_eq!(
        err,
        Error::ArgumentCountMismatch {
            kernel: "saxpy".into(),
            expected: 4,
            found: 2,
        }
    );
}

#[test]
fn test_foreign_kernel_handle() {
    let registry = small_host(1 << 20);
    let platform = registry.lookup("host").unwrap();
    let owner = platform.executor(0).unwrap();
    let other = platform.executor(1).unwrap();

    let mut handle = KernelHandle::new();
    owner.get_kernel(&saxpy_spec(), &mut handle).unwrap();

    let x = other.allocate_scoped(16).unwrap();
    let args = KernelArgs::new().arg(4u32).arg(1.0f32).arg(&*x).arg(&*x);
    let stream = other.create_stream().unwrap();
    let err = stream
        .init()
        .then_launch(ThreadDim::new(4, 1, 1), BlockDim::new(1, 1, 1), &handle, &args)
        .block_host_until_done()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidHandle);

    // Unloading through the wrong executor leaves the handle alone
    other.unload_kernel(&mut handle);
    assert!(handle.is_bound());
}

#[test]
fn test_launch_exceeding_device_limits() {
    let registry = small_host(1 << 20);
    let executor = executor(&registry);
    let mut handle = KernelHandle::new();
    executor.get_kernel(&saxpy_spec(), &mut handle).unwrap();

    let x = executor.allocate_scoped(16).unwrap();
    let args = KernelArgs::new().arg(4u32).arg(1.0f32).arg(&*x).arg(&*x);
    let stream = executor.create_stream().unwrap();
    let err = stream
        .init()
        .then_launch(ThreadDim::new(2048, 1, 1), BlockDim::new(1, 1, 1), &handle, &args)
        .block_host_until_done()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LaunchFailed);
}

// === Plugins ===

#[derive(Debug)]
struct NamedPlugin {
    kind: PluginKind,
    name: String,
}

impl CannedPlugin for NamedPlugin {
    fn kind(&self) -> PluginKind {
        self.kind
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn plugin_factory(kind: PluginKind, name: &str) -> PluginFactory {
    let name = name.to_string();
    Arc::new(move |_: &DeviceDescription| {
        Ok(Arc::new(NamedPlugin {
            kind,
            name: name.clone(),
        }) as Arc<dyn CannedPlugin>)
    })
}

#[test]
fn test_plugin_selection() {
    let registry = small_host(1 << 20);
    let plugins = registry.plugins();
    plugins
        .register("host", PluginKind::Blas, "ref-blas", plugin_factory(PluginKind::Blas, "ref-blas"))
        .unwrap();
    plugins
        .register("host", PluginKind::Blas, "fast-blas", plugin_factory(PluginKind::Blas, "fast-blas"))
        .unwrap();
    plugins
        .register("host", PluginKind::Rng, "philox", plugin_factory(PluginKind::Rng, "philox"))
        .unwrap();
    plugins.set_default("host", PluginKind::Blas, "ref-blas").unwrap();
    plugins.set_default("host", PluginKind::Rng, "philox").unwrap();

    let platform = registry.lookup("host").unwrap();

    let defaults = platform.executor(0).unwrap();
    assert_eq!(defaults.plugin(PluginKind::Blas).unwrap().name(), "ref-blas");
    assert_eq!(defaults.plugin(PluginKind::Rng).unwrap().name(), "philox");
    assert!(defaults.plugin(PluginKind::Fft).is_none());

    let mut config = ExecutorConfig::new(1);
    config
        .plugins
        .set(PluginKind::Blas, PluginChoice::Named("fast-blas".into()))
        .set(PluginKind::Rng, PluginChoice::None);
    let chosen = platform.executor_with_config(&config).unwrap();
    assert_eq!(chosen.plugin(PluginKind::Blas).unwrap().name(), "fast-blas");
    assert!(chosen.plugin(PluginKind::Rng).is_none());
}

#[test]
fn test_missing_named_plugin_fails_acquisition() {
    let registry = small_host(1 << 20);
    let mut config = ExecutorConfig::new(0);
    config
        .plugins
        .set(PluginKind::Dnn, PluginChoice::Named("cudnn".into()));

    let err = registry
        .lookup("host")
        .unwrap()
        .executor_with_config(&config)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InitializationFailed);
}
