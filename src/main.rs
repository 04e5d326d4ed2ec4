//! StreamExecutor CLI
//!
//! Main entry point for the `sx` command.

use clap::{Parser, Subcommand};
use miette::Result;
use std::path::{Path, PathBuf};
use streamexec::host::{self, KernelLibrary};
use streamexec::{
    BlockDim, DeviceDescription, Executor, ExecutorConfig, HostBuffer, KernelArgs, KernelHandle,
    PlatformRegistry, RuntimeConfig, ThreadDim,
};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "sx")]
#[command(author = "Demetrios Chiuratto Agourakis, Dionisio Chiuratto Agourakis")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Inspect and exercise StreamExecutor platforms", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Runtime configuration file (TOML)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List platforms and their devices
    Info {
        /// Print device descriptions as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run transfer and chain checks on the host platform
    Selftest,

    /// Show which loader entry each platform selects for a kernel manifest
    Kernels {
        /// Manifest file with `[[kernels]]` tables
        #[arg(value_name = "FILE")]
        manifest: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    let config = match &cli.config {
        Some(path) => RuntimeConfig::load(path)?,
        None => RuntimeConfig::default(),
    };
    let registry = PlatformRegistry::new();
    host::register(&registry, config.host.clone(), KernelLibrary::builtin())?;

    match cli.command {
        Commands::Info { json } => info(&registry, json),
        Commands::Selftest => selftest(&registry, &config.executor),
        Commands::Kernels { manifest } => kernels(&registry, &config.executor, &manifest),
    }
}

fn info(registry: &PlatformRegistry, json: bool) -> Result<()> {
    let mut devices: Vec<DeviceDescription> = Vec::new();
    for name in registry.platforms() {
        let platform = registry.lookup(&name)?;
        for ordinal in 0..platform.device_count() {
            devices.push(platform.description(ordinal)?);
        }
    }

    if json {
        let json = serde_json::to_string_pretty(&devices)
            .map_err(|e| miette::miette!("Failed to serialize devices: {}", e))?;
        println!("{}", json);
        return Ok(());
    }

    println!("StreamExecutor {}", streamexec::VERSION);
    println!();
    for name in registry.platforms() {
        println!("Platform `{}`:", name);
        for device in devices.iter().filter(|d| d.platform == name) {
            println!(
                "  [{}] {}: {} MiB, {} threads/block, warp {}",
                device.ordinal,
                device.name,
                device.total_memory / (1024 * 1024),
                device.max_threads_per_block,
                device.warp_size
            );
        }
    }
    Ok(())
}

fn selftest(registry: &PlatformRegistry, config: &ExecutorConfig) -> Result<()> {
    let platform = registry.lookup(host::PLATFORM_NAME)?;
    let executor = platform.executor_with_config(config)?;
    tracing::info!("Self-test on {:?}", executor);

    for size in [0usize, 1, 4096, 1 << 20] {
        round_trip(&executor, size)?;
        println!("  round trip {:>8} bytes ... ok", size);
    }

    unbound_launch(&executor)?;
    println!("  skip-on-error chain    ... ok");

    saxpy(&executor)?;
    println!("  saxpy                  ... ok");

    executor.synchronize_all_activity()?;
    println!("Self-test passed on {} device {}", platform.name(), config.ordinal);
    Ok(())
}

fn round_trip(executor: &Executor, size: usize) -> Result<()> {
    let pattern: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    let device = executor.allocate_scoped(size as u64)?;
    let readback = HostBuffer::new(size);

    let stream = executor.create_stream()?;
    stream
        .init()
        .then_memcpy_h2d(&device, &pattern)
        .then_memcpy_d2h(&readback, &device)
        .block_host_until_done()?;

    if readback.to_vec() != pattern {
        return Err(miette::miette!("round trip of {} bytes returned different data", size));
    }
    Ok(())
}

fn unbound_launch(executor: &Executor) -> Result<()> {
    let stream = executor.create_stream()?;
    let unbound = KernelHandle::new();
    let result = stream
        .init()
        .then_launch(
            ThreadDim::new(1, 1, 1),
            BlockDim::new(1, 1, 1),
            &unbound,
            &KernelArgs::new(),
        )
        .block_host_until_done();
    if result.is_ok() {
        return Err(miette::miette!("launching an unbound kernel succeeded"));
    }

    // Observed: the stream accepts work again
    stream.init().block_host_until_done()?;
    Ok(())
}

fn saxpy(executor: &Executor) -> Result<()> {
    const N: usize = 1024;
    let mut spec = streamexec::KernelLoaderSpec::new();
    spec.add_in_memory(
        host::PLATFORM_NAME,
        streamexec::CodeFormat::HostSymbol,
        "saxpy",
        4,
        b"saxpy".to_vec(),
    );
    let mut kernel = KernelHandle::new();
    executor.get_kernel(&spec, &mut kernel)?;

    let x: Vec<f32> = (0..N).map(|i| i as f32).collect();
    let y = vec![1.0f32; N];
    let bytes = (N * 4) as u64;
    let dx = executor.allocate_scoped(bytes)?;
    let dy = executor.allocate_scoped(bytes)?;
    let out = HostBuffer::new(N * 4);
    let args = KernelArgs::new()
        .arg(N as u32)
        .arg(2.0f32)
        .arg(&*dx)
        .arg(&*dy);

    let stream = executor.create_stream()?;
    stream
        .init()
        .then_memcpy_h2d(&dx, bytemuck::cast_slice(&x))
        .then_memcpy_h2d(&dy, bytemuck::cast_slice(&y))
        .then_launch(
            ThreadDim::new(256, 1, 1),
            BlockDim::new(4, 1, 1),
            &kernel,
            &args,
        )
        .then_memcpy_d2h(&out, &dy)
        .block_host_until_done()?;

    let result: Vec<f32> = out
        .to_vec()
        .chunks_exact(4)
        .map(bytemuck::pod_read_unaligned::<f32>)
        .collect();
    let expected: Vec<f32> = x.iter().map(|xi| 2.0 * xi + 1.0).collect();
    if result != expected {
        return Err(miette::miette!("saxpy produced wrong values"));
    }
    Ok(())
}

fn kernels(registry: &PlatformRegistry, config: &ExecutorConfig, manifest: &Path) -> Result<()> {
    let manifest = RuntimeConfig::load(manifest)?;
    let specs = manifest.loader_specs()?;
    if specs.is_empty() {
        println!("No kernels in manifest");
        return Ok(());
    }

    for name in registry.platforms() {
        let executor = registry.lookup(&name)?.executor_with_config(config)?;
        println!("Platform `{}`:", name);
        for (kernel, spec) in &specs {
            match spec.select(&name, executor.kernel_preference()) {
                Ok(entry) => println!(
                    "  {:<20} {} ({})",
                    kernel,
                    entry.format,
                    entry.locator.storage()
                ),
                Err(e) => println!("  {:<20} -- {}", kernel, e),
            }
        }
    }

    Ok(())
}
