//! Integration tests for the full configuration-to-result path

use pretty_assertions::assert_eq;
use std::collections::HashMap;
use streamexec::host::{self, KernelLibrary};
use streamexec::{
    BlockDim, ErrorKind, HostBuffer, KernelArgs, KernelHandle, PlatformRegistry, RuntimeConfig,
    ThreadDim,
};

const CONFIG: &str = r#"
[executor]
ordinal = 1

[executor.plugins]
blas = "none"

[host]
device_count = 2
memory_per_device = 1048576

[[kernels]]
name = "vadd"
arity = 3

[[kernels.entries]]
platform = "cuda"
format = "ptx"
inline = ".visible .entry vadd()"

[[kernels.entries]]
platform = "host"
format = "host-symbol"
inline = "vector_add_f32"

[[kernels]]
name = "fill"
arity = 2

[[kernels.entries]]
platform = "host"
format = "host-symbol"
inline = "fill_u32"
"#;

fn setup(source: &str) -> (RuntimeConfig, PlatformRegistry) {
    let config = RuntimeConfig::from_toml_str(source).expect("Config parse failed");
    let registry = PlatformRegistry::new();
    host::register(&registry, config.host.clone(), KernelLibrary::builtin())
        .expect("Registration failed");
    (config, registry)
}

#[test]
fn test_config_driven_pipeline() {
    let (config, registry) = setup(CONFIG);
    let executor = registry
        .lookup("host")
        .unwrap()
        .executor_with_config(&config.executor)
        .expect("Executor acquisition failed");
    assert_eq!(executor.device_ordinal(), 1);
    assert_eq!(executor.description().total_memory, 1048576);

    let mut kernels = HashMap::new();
    for (name, spec) in config.loader_specs().unwrap() {
        let mut handle = KernelHandle::new();
        executor.get_kernel(&spec, &mut handle).unwrap();
        kernels.insert(name, handle);
    }
    assert_eq!(executor.loaded_kernels(), 2);

    const N: usize = 64;
    let a: Vec<f32> = (0..N).map(|i| i as f32).collect();
    let da = executor.allocate_scoped((N * 4) as u64).unwrap();
    let db = executor.allocate_scoped((N * 4) as u64).unwrap();
    let dout = executor.allocate_scoped((N * 4) as u64).unwrap();
    let out = HostBuffer::new(N * 4);

    let stream = executor.create_stream().unwrap();
    stream
        .init()
        .then_memcpy_h2d(&da, bytemuck::cast_slice(&a))
        .then_launch(
            ThreadDim::new(64, 1, 1),
            BlockDim::new(1, 1, 1),
            &kernels["fill"],
            &KernelArgs::new().arg(&*db).arg(1.5f32.to_bits()),
        )
        .then_launch(
            ThreadDim::new(64, 1, 1),
            BlockDim::new(1, 1, 1),
            &kernels["vadd"],
            &KernelArgs::new().arg(&*da).arg(&*db).arg(&*dout),
        )
        .then_memcpy_d2h(&out, &dout)
        .block_host_until_done()
        .unwrap();

    let result: Vec<f32> = out
        .to_vec()
        .chunks_exact(4)
        .map(bytemuck::pod_read_unaligned::<f32>)
        .collect();
    let expected: Vec<f32> = a.iter().map(|x| x + 1.5).collect();
    assert_eq!(result, expected);
}

#[test]
fn test_config_file_on_disk() {
    let path = std::env::temp_dir().join(format!("streamexec-config-{}.toml", std::process::id()));
    std::fs::write(&path, CONFIG).unwrap();
    let loaded = RuntimeConfig::load(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(loaded, RuntimeConfig::from_toml_str(CONFIG).unwrap());
    assert_eq!(loaded.kernels.len(), 2);
}

#[test]
fn test_missing_config_file() {
    let err = RuntimeConfig::load(std::path::Path::new("/nonexistent/streamexec.toml")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
}

#[test]
fn test_configured_ordinal_out_of_range() {
    let (mut config, registry) = setup(CONFIG);
    config.executor.ordinal = 5;
    let err = registry
        .lookup("host")
        .unwrap()
        .executor_with_config(&config.executor)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceNotFound);
}

#[test]
fn test_diagnostic_codes() {
    use miette::Diagnostic;

    let (_, registry) = setup("");
    let err = registry.lookup("rocm").unwrap_err();
    assert_eq!(
        err.code().map(|c| c.to_string()),
        Some("streamexec::registry::not_found".to_string())
    );
}
