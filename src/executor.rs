//! The device-owning executor
//!
//! An [`Executor`] binds one backend instance to one device and is the only
//! component that allocates, loads, copies, launches and synchronizes. It
//! performs the backend-independent checks (bound kernels, argument counts,
//! transfer sizes) before delegating, so every backend sees the same contract.
//!
//! Streams and timers borrow their executor, so they cannot outlive it.

use crate::backend::{Backend, KernelToken, Pattern, StreamToken};
use crate::config::ExecutorConfig;
use crate::device::DeviceDescription;
use crate::error::{Error, Result};
use crate::kernel::{Binding, KernelArgs, KernelHandle};
use crate::launch::LaunchConfig;
use crate::loader::{Encoding, KernelLoaderSpec};
use crate::memory::{DeviceAddress, DeviceMemory, HostBuffer, ScopedDeviceMemory};
use crate::plugin::{CannedPlugin, PluginKind, PluginRegistry};
use crate::stream::{ErrorSlot, Stream};
use crate::timer::Timer;
use indexmap::IndexMap;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_EXECUTOR_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique executor identity, used to tie handles to their owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExecutorId(u64);

impl fmt::Display for ExecutorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "executor#{}", self.0)
    }
}

pub struct Executor {
    id: ExecutorId,
    backend: Box<dyn Backend>,
    description: DeviceDescription,
    config: ExecutorConfig,

    /// Live allocations: address -> size
    allocations: Mutex<FxHashMap<DeviceAddress, u64>>,

    /// Loaded kernels: token -> kernel name
    kernels: Mutex<FxHashMap<KernelToken, String>>,

    /// Live streams and their recorded-error slots
    streams: Mutex<FxHashMap<StreamToken, ErrorSlot>>,

    plugins: IndexMap<PluginKind, Arc<dyn CannedPlugin>>,
}

impl Executor {
    /// Wrap an initialized backend. Plugin choices in `config` are resolved
    /// against `registry` now; naming an unregistered plugin fails.
    pub fn new(
        backend: Box<dyn Backend>,
        config: &ExecutorConfig,
        registry: &PluginRegistry,
    ) -> Result<Self> {
        let description = backend.description();
        let platform = backend.platform_name().to_string();

        let mut plugins = IndexMap::new();
        for kind in PluginKind::ALL {
            if let Some(factory) = registry.resolve(&platform, kind, config.plugins.choice(kind))?
            {
                let plugin = factory(&description)?;
                tracing::debug!("Executor on `{}` uses {} plugin `{}`", platform, kind, plugin.name());
                plugins.insert(kind, plugin);
            }
        }

        Ok(Self {
            id: ExecutorId(NEXT_EXECUTOR_ID.fetch_add(1, Ordering::Relaxed)),
            backend,
            description,
            config: config.clone(),
            allocations: Mutex::new(FxHashMap::default()),
            kernels: Mutex::new(FxHashMap::default()),
            streams: Mutex::new(FxHashMap::default()),
            plugins,
        })
    }

    pub fn id(&self) -> ExecutorId {
        self.id
    }

    pub fn platform_name(&self) -> &str {
        self.backend.platform_name()
    }

    /// Get the device ordinal
    pub fn device_ordinal(&self) -> usize {
        self.config.ordinal
    }

    /// Get device properties
    pub fn description(&self) -> &DeviceDescription {
        &self.description
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// The plugin servicing `kind` on this executor, if any.
    pub fn plugin(&self, kind: PluginKind) -> Option<Arc<dyn CannedPlugin>> {
        self.plugins.get(&kind).cloned()
    }

    // === Memory ===

    /// Allocate device memory. Zero bytes yields the null descriptor.
    pub fn allocate(&self, size: u64) -> Result<DeviceMemory> {
        if size == 0 {
            return Ok(DeviceMemory::null());
        }
        let address = self.backend.allocate(size)?;
        self.allocations.lock().insert(address, size);
        tracing::debug!("Allocated {} bytes at {} on {}", size, address, self.id);
        Ok(DeviceMemory::new(address, size))
    }

    /// Allocate memory that is released when the returned guard drops.
    pub fn allocate_scoped(&self, size: u64) -> Result<ScopedDeviceMemory<'_>> {
        Ok(ScopedDeviceMemory::new(self, self.allocate(size)?))
    }

    /// Release memory returned by [`allocate`](Self::allocate).
    ///
    /// Releasing memory that queued work still uses is the caller's problem.
    pub fn deallocate(&self, memory: DeviceMemory) {
        if memory.is_null() {
            return;
        }
        match self.allocations.lock().remove(&memory.address()) {
            Some(size) => {
                self.backend.deallocate(memory.address());
                tracing::debug!("Deallocated {} bytes at {} on {}", size, memory.address(), self.id);
            }
            None => tracing::warn!(
                "Deallocate of {} which is not a live allocation on {}",
                memory.address(),
                self.id
            ),
        }
    }

    /// Bytes currently allocated through this executor.
    pub fn allocated_bytes(&self) -> u64 {
        self.allocations.lock().values().sum()
    }

    pub fn live_allocations(&self) -> usize {
        self.allocations.lock().len()
    }

    /// `(free, total)` device bytes, if the backend reports them.
    pub fn memory_usage(&self) -> Option<(u64, u64)> {
        self.backend.memory_usage()
    }

    // === Kernels ===

    /// Bind `handle` to the entry of `spec` best suited to this platform.
    pub fn get_kernel(&self, spec: &KernelLoaderSpec, handle: &mut KernelHandle) -> Result<()> {
        let entry = spec.select(self.platform_name(), self.backend.kernel_preference())?;
        let token = self.backend.load_kernel(entry)?;

        self.unload_kernel(handle);
        self.kernels.lock().insert(token, entry.kernel_name.clone());
        handle.bind(Binding {
            executor: self.id,
            token,
            name: entry.kernel_name.clone(),
            format: entry.format,
            arity: entry.arity,
        });
        tracing::debug!(
            "Loaded kernel `{}` ({}, {}) on {}",
            entry.kernel_name,
            entry.format,
            entry.locator.storage(),
            self.id
        );
        Ok(())
    }

    /// Unload the code behind `handle` and leave it unbound.
    pub fn unload_kernel(&self, handle: &mut KernelHandle) {
        if handle.executor() != Some(self.id) {
            return;
        }
        if let Some(binding) = handle.unbind() {
            if self.kernels.lock().remove(&binding.token).is_some() {
                self.backend.unload_kernel(binding.token);
            }
        }
    }

    /// Encodings the backend can load, most preferred first.
    pub fn kernel_preference(&self) -> &[Encoding] {
        self.backend.kernel_preference()
    }

    pub fn loaded_kernels(&self) -> usize {
        self.kernels.lock().len()
    }

    // === Streams and timers ===

    pub fn create_stream(&self) -> Result<Stream<'_>> {
        Stream::new(self)
    }

    pub fn create_timer(&self) -> Result<Timer<'_>> {
        Timer::new(self)
    }

    // === Synchronous transfers ===

    /// Blocking host-to-device copy into the start of `dst`.
    pub fn synchronous_memcpy_h2d(&self, dst: &DeviceMemory, src: &[u8]) -> Result<()> {
        match copy_region(dst, src.len() as u64, "host-to-device")? {
            Some(dst) => self.backend.sync_memcpy_h2d(dst, src),
            None => Ok(()),
        }
    }

    /// Blocking device-to-host copy of `dst.len()` bytes from the start of `src`.
    pub fn synchronous_memcpy_d2h(&self, dst: &mut [u8], src: &DeviceMemory) -> Result<()> {
        match copy_region(src, dst.len() as u64, "device-to-host")? {
            Some(src) => self.backend.sync_memcpy_d2h(dst, src),
            None => Ok(()),
        }
    }

    /// Blocking device-to-device copy of all of `src` into `dst`.
    pub fn synchronous_memcpy_d2d(&self, dst: &DeviceMemory, src: &DeviceMemory) -> Result<()> {
        match copy_region(dst, src.size(), "device-to-device")? {
            Some(dst) => self.backend.sync_memcpy_d2d(dst, *src),
            None => Ok(()),
        }
    }

    /// Block until every stream on the device is idle.
    ///
    /// Fails if any stream holds an unobserved error, whether recorded while
    /// enqueueing or hit by the backend. The error stays on its stream.
    pub fn synchronize_all_activity(&self) -> Result<()> {
        let executed = self.backend.synchronize_all_activity();
        let recorded = self
            .streams
            .lock()
            .values()
            .filter(|slot| slot.lock().is_some())
            .count();
        if recorded > 0 {
            return Err(Error::SynchronizationFailed {
                reason: format!("{} stream(s) hold an unobserved error", recorded),
            });
        }
        executed
    }

    // === Stream operations (called by `Stream`) ===

    pub(crate) fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub(crate) fn track_stream(&self, token: StreamToken, slot: ErrorSlot) {
        self.streams.lock().insert(token, slot);
    }

    pub(crate) fn forget_stream(&self, token: StreamToken) {
        self.streams.lock().remove(&token);
    }

    pub(crate) fn launch(
        &self,
        stream: StreamToken,
        config: &LaunchConfig,
        kernel: &KernelHandle,
        args: &KernelArgs,
    ) -> Result<()> {
        let binding = kernel.binding().ok_or(Error::UnboundKernel)?;
        if binding.executor != self.id {
            return Err(Error::invalid_handle(format!(
                "kernel `{}` was loaded on {}, not {}",
                binding.name, binding.executor, self.id
            )));
        }
        if args.len() != binding.arity {
            return Err(Error::ArgumentCountMismatch {
                kernel: binding.name.clone(),
                expected: binding.arity,
                found: args.len(),
            });
        }
        config
            .validate(&self.description)
            .map_err(|e| Error::LaunchFailed {
                kernel: binding.name.clone(),
                reason: e.to_string(),
            })?;

        tracing::trace!("Launching `{}` {} on {}", binding.name, config, self.id);
        self.backend.launch(stream, config, binding.token, args)
    }

    pub(crate) fn memcpy_h2d(&self, stream: StreamToken, dst: &DeviceMemory, src: &[u8]) -> Result<()> {
        match copy_region(dst, src.len() as u64, "host-to-device")? {
            Some(dst) => self.backend.memcpy_h2d(stream, dst, src.to_vec()),
            None => Ok(()),
        }
    }

    pub(crate) fn memcpy_d2h(&self, stream: StreamToken, dst: &HostBuffer, src: &DeviceMemory) -> Result<()> {
        if dst.len() < src.size() as usize {
            return Err(Error::copy_failed(format!(
                "device-to-host copy of {} bytes into a {} byte host buffer",
                src.size(),
                dst.len()
            )));
        }
        if src.size() == 0 {
            return Ok(());
        }
        self.backend.memcpy_d2h(stream, dst.clone(), *src)
    }

    pub(crate) fn memcpy_d2d(
        &self,
        stream: StreamToken,
        dst: &DeviceMemory,
        src: &DeviceMemory,
    ) -> Result<()> {
        match copy_region(dst, src.size(), "device-to-device")? {
            Some(dst) => self.backend.memcpy_d2d(stream, dst, *src),
            None => Ok(()),
        }
    }

    pub(crate) fn memset(&self, stream: StreamToken, dst: &DeviceMemory, pattern: Pattern) -> Result<()> {
        if let Pattern::Word(_) = pattern {
            if dst.size() % 4 != 0 {
                return Err(Error::invalid_argument(format!(
                    "32-bit memset of {} bytes is not a multiple of 4",
                    dst.size()
                )));
            }
        }
        if dst.size() == 0 {
            return Ok(());
        }
        self.backend.memset(stream, *dst, pattern)
    }
}

/// The first `len` bytes of `buffer`, or `None` when there is nothing to copy.
fn copy_region(buffer: &DeviceMemory, len: u64, direction: &str) -> Result<Option<DeviceMemory>> {
    if len > buffer.size() {
        return Err(Error::copy_failed(format!(
            "{} copy of {} bytes exceeds {} byte device buffer",
            direction,
            len,
            buffer.size()
        )));
    }
    if len == 0 {
        return Ok(None);
    }
    buffer.slice(0, len).map(Some)
}

impl Drop for Executor {
    fn drop(&mut self) {
        let leaked: Vec<_> = self.allocations.get_mut().drain().collect();
        if !leaked.is_empty() {
            tracing::warn!(
                "{} dropped with {} live allocation(s); releasing them",
                self.id,
                leaked.len()
            );
        }
        for (address, _) in leaked {
            self.backend.deallocate(address);
        }
        for (token, _) in self.kernels.get_mut().drain() {
            self.backend.unload_kernel(token);
        }
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("id", &self.id)
            .field("platform", &self.platform_name())
            .field("ordinal", &self.config.ordinal)
            .field("plugins", &self.plugins.keys().collect::<Vec<_>>())
            .finish()
    }
}
