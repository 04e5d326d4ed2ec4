//! In-process reference backend
//!
//! The `host` platform simulates a device in host RAM. Every stream is a
//! worker thread draining its own command queue, so enqueueing never waits
//! on device work and streams progress independently. Kernels are Rust
//! functions from a [`KernelLibrary`], selected by the loader entry's symbol
//! name.
//!
//! ```
//! use streamexec::host::{self, HostConfig, KernelLibrary};
//! use streamexec::PlatformRegistry;
//!
//! let registry = PlatformRegistry::new();
//! let config = HostConfig {
//!     device_count: 1,
//!     ..HostConfig::default()
//! };
//! host::register(&registry, config, KernelLibrary::builtin()).unwrap();
//! assert_eq!(registry.lookup("host").unwrap().device_count(), 1);
//! ```

mod heap;
mod kernels;
mod worker;

pub use kernels::{HostKernelFn, KernelContext, KernelLibrary};

use crate::backend::{Backend, HostCallback, KernelToken, Pattern, StreamToken, TimerToken};
use crate::device::DeviceDescription;
use crate::error::{Error, Result};
use crate::kernel::KernelArgs;
use crate::launch::{Dim3, LaunchConfig};
use crate::loader::{CodeFormat, Encoding, LoaderEntry, StorageKind};
use crate::memory::{DeviceAddress, DeviceMemory, HostBuffer};
use crate::platform::{BackendFactory, Platform, PlatformRegistry};
use heap::DeviceHeap;
use kernels::HostKernel;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use worker::{Command, Edge, Progress, StreamWorker, TimerSlot};

pub const PLATFORM_NAME: &str = "host";

const PREFERENCE: &[Encoding] = &[
    (CodeFormat::HostSymbol, StorageKind::InMemory),
    (CodeFormat::HostSymbol, StorageKind::OnDisk),
];

/// Shape of the simulated devices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub device_count: usize,
    /// Bytes of simulated memory on each device
    pub memory_per_device: u64,
    /// Artificial delay before every stream command, in microseconds
    pub latency_us: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            device_count: 2,
            memory_per_device: 256 * 1024 * 1024,
            latency_us: 0,
        }
    }
}

struct LoadedKernel {
    name: String,
    kernel: HostKernel,
}

/// One simulated device
pub struct HostBackend {
    platform_name: String,
    config: HostConfig,
    library: Arc<KernelLibrary>,
    ordinal: usize,
    heap: Arc<Mutex<DeviceHeap>>,
    kernels: Mutex<FxHashMap<KernelToken, LoadedKernel>>,
    streams: Mutex<FxHashMap<StreamToken, StreamWorker>>,
    timers: Mutex<FxHashMap<TimerToken, Arc<TimerSlot>>>,
    next_token: AtomicU64,
}

impl HostBackend {
    pub fn new(config: HostConfig, library: Arc<KernelLibrary>) -> Self {
        let heap = DeviceHeap::new(config.memory_per_device);
        Self {
            platform_name: PLATFORM_NAME.to_string(),
            config,
            library,
            ordinal: 0,
            heap: Arc::new(Mutex::new(heap)),
            kernels: Mutex::new(FxHashMap::default()),
            streams: Mutex::new(FxHashMap::default()),
            timers: Mutex::new(FxHashMap::default()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Serve under another platform name, e.g. to stand in for real hardware
    /// in tests.
    pub fn with_platform_name(mut self, name: impl Into<String>) -> Self {
        self.platform_name = name.into();
        self
    }

    fn next_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    fn enqueue(&self, stream: StreamToken, command: Command) -> Result<()> {
        let streams = self.streams.lock();
        let worker = streams.get(&stream).ok_or_else(|| unknown_stream(stream))?;
        worker.enqueue(command)
    }

    fn progress(&self, stream: StreamToken) -> Result<Arc<Progress>> {
        self.streams
            .lock()
            .get(&stream)
            .map(|w| Arc::clone(w.progress()))
            .ok_or_else(|| unknown_stream(stream))
    }

    fn timer(&self, timer: TimerToken) -> Result<Arc<TimerSlot>> {
        self.timers
            .lock()
            .get(&timer)
            .cloned()
            .ok_or_else(|| Error::invalid_handle(format!("unknown timer {:?}", timer)))
    }

    fn record_time(&self, stream: StreamToken, timer: TimerToken, edge: Edge) -> Result<()> {
        let timer = self.timer(timer)?;
        self.enqueue(stream, Command::RecordTime { timer, edge })
    }
}

fn unknown_stream(stream: StreamToken) -> Error {
    Error::invalid_handle(format!("unknown stream {:?}", stream))
}

impl Backend for HostBackend {
    fn platform_name(&self) -> &str {
        &self.platform_name
    }

    fn device_count(&self) -> usize {
        self.config.device_count
    }

    fn init(&mut self, ordinal: usize) -> Result<()> {
        if ordinal >= self.config.device_count {
            return Err(Error::DeviceNotFound {
                platform: self.platform_name.clone(),
                ordinal,
                count: self.config.device_count,
            });
        }
        self.ordinal = ordinal;
        Ok(())
    }

    fn description(&self) -> DeviceDescription {
        DeviceDescription::simulated(self.platform_name.clone(), self.ordinal)
            .with_total_memory(self.config.memory_per_device)
    }

    fn kernel_preference(&self) -> &[Encoding] {
        PREFERENCE
    }

    fn load_kernel(&self, entry: &LoaderEntry) -> Result<KernelToken> {
        let load_failed = |reason: String| Error::LoadFailed {
            kernel: entry.kernel_name.clone(),
            reason,
        };
        let bytes = entry
            .locator
            .load_bytes()
            .map_err(|e| load_failed(e.to_string()))?;
        let symbol = std::str::from_utf8(&bytes)
            .map_err(|e| load_failed(format!("symbol is not UTF-8: {}", e)))?
            .trim();
        let kernel = self
            .library
            .get(symbol)
            .ok_or_else(|| load_failed(format!("no host kernel named `{}`", symbol)))?;
        if kernel.arity != entry.arity {
            return Err(load_failed(format!(
                "`{}` takes {} argument(s) but the loader entry declares {}",
                symbol, kernel.arity, entry.arity
            )));
        }

        let token = KernelToken(self.next_token());
        self.kernels.lock().insert(
            token,
            LoadedKernel {
                name: entry.kernel_name.clone(),
                kernel: kernel.clone(),
            },
        );
        Ok(token)
    }

    fn unload_kernel(&self, kernel: KernelToken) {
        self.kernels.lock().remove(&kernel);
    }

    fn allocate(&self, size: u64) -> Result<DeviceAddress> {
        self.heap.lock().allocate(size)
    }

    fn deallocate(&self, address: DeviceAddress) {
        if self.heap.lock().free(address).is_none() {
            tracing::warn!("Host device {} has no allocation at {}", self.ordinal, address);
        }
    }

    fn memory_usage(&self) -> Option<(u64, u64)> {
        Some(self.heap.lock().usage())
    }

    fn create_stream(&self) -> Result<StreamToken> {
        let token = StreamToken(self.next_token());
        let worker = StreamWorker::spawn(
            format!("{}{}-stream{}", self.platform_name, self.ordinal, token.0),
            Arc::clone(&self.heap),
            Duration::from_micros(self.config.latency_us),
        )?;
        self.streams.lock().insert(token, worker);
        Ok(token)
    }

    fn destroy_stream(&self, stream: StreamToken) {
        // Joined outside the map lock: draining may take a while.
        let worker = self.streams.lock().remove(&stream);
        if let Some(worker) = worker {
            worker.shutdown();
        }
    }

    fn launch(
        &self,
        stream: StreamToken,
        config: &LaunchConfig,
        kernel: KernelToken,
        args: &KernelArgs,
    ) -> Result<()> {
        let (name, body) = {
            let kernels = self.kernels.lock();
            let loaded = kernels
                .get(&kernel)
                .ok_or_else(|| Error::invalid_handle(format!("kernel {:?} is not loaded", kernel)))?;
            (loaded.name.clone(), Arc::clone(&loaded.kernel.body))
        };
        let unit = Dim3::new(1, 1, 1);
        self.enqueue(
            stream,
            Command::Launch {
                kernel: name,
                body,
                config: config.resolve(unit, unit),
                args: args.as_slice().to_vec(),
            },
        )
    }

    fn memcpy_h2d(&self, stream: StreamToken, dst: DeviceMemory, src: Vec<u8>) -> Result<()> {
        self.enqueue(stream, Command::CopyToDevice { dst, data: src })
    }

    fn memcpy_d2h(&self, stream: StreamToken, dst: HostBuffer, src: DeviceMemory) -> Result<()> {
        self.enqueue(stream, Command::CopyToHost { dst, src })
    }

    fn memcpy_d2d(
        &self,
        stream: StreamToken,
        dst: DeviceMemory,
        src: DeviceMemory,
    ) -> Result<()> {
        self.enqueue(stream, Command::CopyOnDevice { dst, src })
    }

    fn memset(&self, stream: StreamToken, dst: DeviceMemory, pattern: Pattern) -> Result<()> {
        self.enqueue(stream, Command::Fill { dst, pattern })
    }

    fn sync_memcpy_h2d(&self, dst: DeviceMemory, src: &[u8]) -> Result<()> {
        self.heap
            .lock()
            .write(dst, src)
            .map_err(|e| Error::copy_failed(e.to_string()))
    }

    fn sync_memcpy_d2h(&self, dst: &mut [u8], src: DeviceMemory) -> Result<()> {
        let heap = self.heap.lock();
        let bytes = heap
            .resolve(src)
            .map_err(|e| Error::copy_failed(e.to_string()))?;
        dst.copy_from_slice(bytes);
        Ok(())
    }

    fn sync_memcpy_d2d(&self, dst: DeviceMemory, src: DeviceMemory) -> Result<()> {
        self.heap
            .lock()
            .copy(dst, src)
            .map_err(|e| Error::copy_failed(e.to_string()))
    }

    fn block_host_until_done(&self, stream: StreamToken) -> Result<()> {
        self.progress(stream)?.wait_and_take_error()
    }

    fn synchronize_all_activity(&self) -> Result<()> {
        let progress: Vec<_> = self
            .streams
            .lock()
            .values()
            .map(|w| Arc::clone(w.progress()))
            .collect();
        for p in &progress {
            p.wait_idle();
        }
        let failed = progress.iter().filter(|p| p.has_error()).count();
        if failed > 0 {
            return Err(Error::SynchronizationFailed {
                reason: format!("{} stream(s) hold an unobserved error", failed),
            });
        }
        Ok(())
    }

    fn host_callback(&self, stream: StreamToken, callback: HostCallback) -> Result<()> {
        self.enqueue(stream, Command::Callback(callback))
    }

    fn wait_for(&self, stream: StreamToken, other: StreamToken) -> Result<()> {
        if stream == other {
            return Ok(());
        }
        let other = self.progress(other)?;
        let target = other.enqueued();
        self.enqueue(stream, Command::WaitFor { other, target })
    }

    fn create_timer(&self) -> Result<TimerToken> {
        let token = TimerToken(self.next_token());
        self.timers.lock().insert(token, Arc::default());
        Ok(token)
    }

    fn destroy_timer(&self, timer: TimerToken) {
        self.timers.lock().remove(&timer);
    }

    fn start_timer(&self, stream: StreamToken, timer: TimerToken) -> Result<()> {
        self.record_time(stream, timer, Edge::Start)
    }

    fn stop_timer(&self, stream: StreamToken, timer: TimerToken) -> Result<()> {
        self.record_time(stream, timer, Edge::Stop)
    }

    fn timer_elapsed(&self, timer: TimerToken) -> Option<Duration> {
        self.timers.lock().get(&timer)?.elapsed()
    }
}

impl Drop for HostBackend {
    fn drop(&mut self) {
        let streams: Vec<_> = self.streams.get_mut().drain().collect();
        if !streams.is_empty() {
            tracing::warn!(
                "Host device {} dropped with {} open stream(s)",
                self.ordinal,
                streams.len()
            );
        }
        for (_, worker) in streams {
            worker.shutdown();
        }
    }
}

/// Register the host platform under its usual name.
pub fn register(
    registry: &PlatformRegistry,
    config: HostConfig,
    library: KernelLibrary,
) -> Result<Arc<Platform>> {
    register_as(registry, PLATFORM_NAME, config, library)
}

/// Register a host-backed platform under `name`.
pub fn register_as(
    registry: &PlatformRegistry,
    name: &str,
    config: HostConfig,
    library: KernelLibrary,
) -> Result<Arc<Platform>> {
    let library = Arc::new(library);
    let name_owned = name.to_string();
    let factory: BackendFactory = Arc::new(move || {
        Box::new(
            HostBackend::new(config.clone(), Arc::clone(&library))
                .with_platform_name(name_owned.clone()),
        ) as Box<dyn Backend>
    });
    registry.register(name, factory)
}

/// Register the host platform with default devices and the builtin kernels.
pub fn register_default(registry: &PlatformRegistry) -> Result<Arc<Platform>> {
    register(registry, HostConfig::default(), KernelLibrary::builtin())
}
