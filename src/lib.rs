//! StreamExecutor: a host-side runtime for accelerator work
//!
//! Application code enqueues data-parallel kernels, memory transfers and host
//! callbacks onto ordered streams of a device, while the hardware specifics
//! live behind a pluggable [`Backend`]:
//! - Platforms registered by name in an explicit [`PlatformRegistry`]
//! - One [`Executor`] per device: memory, kernel loading, synchronous copies
//! - [`Stream`]s driven through a fluent [`Chain`] with deferred errors
//! - Kernel loader specs choosing the best code encoding per platform
//! - An in-process `host` reference backend
//!
//! # Architecture
//!
//! ```text
//! PlatformRegistry → Platform → Executor ─┬─ Stream → Chain → Backend
//!                                         ├─ Timer
//!                                         └─ DeviceMemory / KernelHandle
//! ```
//!
//! # Example
//!
//! ```
//! use streamexec::{host, KernelArgs, KernelHandle, KernelLoaderSpec, CodeFormat};
//! use streamexec::{BlockDim, HostBuffer, PlatformRegistry, ThreadDim};
//!
//! let registry = PlatformRegistry::new();
//! host::register_default(&registry).unwrap();
//! let executor = registry.lookup("host").unwrap().executor(0).unwrap();
//!
//! let mut spec = KernelLoaderSpec::new();
//! spec.add_in_memory("host", CodeFormat::HostSymbol, "fill_u32", 2, b"fill_u32".to_vec());
//! let mut fill = KernelHandle::new();
//! executor.get_kernel(&spec, &mut fill).unwrap();
//!
//! let buffer = executor.allocate_scoped(16).unwrap();
//! let readback = HostBuffer::new(16);
//! let args = KernelArgs::new().arg(&*buffer).arg(7u32);
//!
//! let stream = executor.create_stream().unwrap();
//! stream
//!     .init()
//!     .then_launch(ThreadDim::new(4, 1, 1), BlockDim::new(1, 1, 1), &fill, &args)
//!     .then_memcpy_d2h(&readback, &buffer)
//!     .block_host_until_done()
//!     .unwrap();
//! assert_eq!(readback.to_vec()[..4], 7u32.to_ne_bytes());
//! ```

pub mod backend;
pub mod config;
pub mod device;
pub mod error;
pub mod executor;
pub mod host;
pub mod kernel;
pub mod launch;
pub mod loader;
pub mod memory;
pub mod platform;
pub mod plugin;
pub mod stream;
pub mod timer;

// Re-exports for convenience
pub use backend::{Backend, HostCallback, KernelToken, Pattern, StreamToken, TimerToken};
pub use config::{ExecutorConfig, RuntimeConfig};
pub use device::DeviceDescription;
pub use error::{Error, ErrorKind, Result};
pub use executor::{Executor, ExecutorId};
pub use kernel::{KernelArg, KernelArgs, KernelHandle};
pub use launch::{BlockDim, Dim3, LaunchConfig, ThreadDim};
pub use loader::{CodeFormat, CodeLocator, Encoding, KernelLoaderSpec, LoaderEntry, StorageKind};
pub use memory::{DeviceAddress, DeviceMemory, HostBuffer, ScopedDeviceMemory};
pub use platform::{BackendFactory, Platform, PlatformRegistry};
pub use plugin::{
    CannedPlugin, PluginChoice, PluginConfig, PluginFactory, PluginKind, PluginRegistry,
};
pub use stream::{Chain, Stream};
pub use timer::Timer;

/// Runtime version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
