//! Backend plugin contract
//!
//! A platform is any type implementing [`Backend`]. The generic layers
//! ([`Executor`](crate::Executor), [`Stream`](crate::Stream)) only ever hold the
//! opaque tokens defined here; what a token refers to is the backend's business.
//!
//! Argument validation (bound kernels, arity, copy sizes) happens in the
//! executor before a backend method is called, so implementations can assume
//! well-formed requests.

use crate::device::DeviceDescription;
use crate::error::Result;
use crate::kernel::KernelArgs;
use crate::launch::LaunchConfig;
use crate::loader::{Encoding, LoaderEntry};
use crate::memory::{DeviceAddress, DeviceMemory, HostBuffer};
use std::time::Duration;

/// Backend-side stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamToken(pub u64);

/// Backend-side loaded kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelToken(pub u64);

/// Backend-side timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(pub u64);

/// Fill pattern for device memsets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    Byte(u8),
    Word(u32),
}

/// Work scheduled on a host thread once a stream reaches it.
pub type HostCallback = Box<dyn FnOnce() + Send + 'static>;

/// The operations every hardware backend implements.
pub trait Backend: Send + Sync {
    /// Name of the platform this backend serves.
    fn platform_name(&self) -> &str;

    /// Number of devices this backend can manage. Valid before `init`.
    fn device_count(&self) -> usize;

    /// Bind this instance to one physical device.
    fn init(&mut self, ordinal: usize) -> Result<()>;

    fn description(&self) -> DeviceDescription;

    /// Encodings this backend can load, most preferred first.
    fn kernel_preference(&self) -> &[Encoding];

    /// Load the code an entry points to. Every call yields a fresh instance.
    fn load_kernel(&self, entry: &LoaderEntry) -> Result<KernelToken>;

    fn unload_kernel(&self, kernel: KernelToken);

    fn allocate(&self, size: u64) -> Result<DeviceAddress>;

    fn deallocate(&self, address: DeviceAddress);

    /// `(free, total)` bytes, if the backend tracks them.
    fn memory_usage(&self) -> Option<(u64, u64)> {
        None
    }

    fn create_stream(&self) -> Result<StreamToken>;

    /// Drain and release a stream.
    fn destroy_stream(&self, stream: StreamToken);

    fn launch(
        &self,
        stream: StreamToken,
        config: &LaunchConfig,
        kernel: KernelToken,
        args: &KernelArgs,
    ) -> Result<()>;

    fn memcpy_h2d(&self, stream: StreamToken, dst: DeviceMemory, src: Vec<u8>) -> Result<()>;

    fn memcpy_d2h(&self, stream: StreamToken, dst: HostBuffer, src: DeviceMemory) -> Result<()>;

    fn memcpy_d2d(&self, stream: StreamToken, dst: DeviceMemory, src: DeviceMemory)
    -> Result<()>;

    fn memset(&self, stream: StreamToken, dst: DeviceMemory, pattern: Pattern) -> Result<()>;

    /// Blocking copy outside any stream.
    fn sync_memcpy_h2d(&self, dst: DeviceMemory, src: &[u8]) -> Result<()>;

    /// Blocking copy outside any stream.
    fn sync_memcpy_d2h(&self, dst: &mut [u8], src: DeviceMemory) -> Result<()>;

    /// Blocking copy outside any stream.
    fn sync_memcpy_d2d(&self, dst: DeviceMemory, src: DeviceMemory) -> Result<()>;

    /// Wait for everything enqueued on `stream` so far; returns and clears the
    /// first error the stream hit while executing.
    fn block_host_until_done(&self, stream: StreamToken) -> Result<()>;

    /// Wait until every stream on the device is idle.
    fn synchronize_all_activity(&self) -> Result<()>;

    fn host_callback(&self, stream: StreamToken, callback: HostCallback) -> Result<()>;

    /// Make later work on `stream` wait for work already enqueued on `other`.
    fn wait_for(&self, stream: StreamToken, other: StreamToken) -> Result<()>;

    fn create_timer(&self) -> Result<TimerToken>;

    fn destroy_timer(&self, timer: TimerToken);

    fn start_timer(&self, stream: StreamToken, timer: TimerToken) -> Result<()>;

    fn stop_timer(&self, stream: StreamToken, timer: TimerToken) -> Result<()>;

    /// Time between start and stop, once both have executed.
    fn timer_elapsed(&self, timer: TimerToken) -> Option<Duration>;
}
