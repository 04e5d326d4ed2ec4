//! Launch geometry

use crate::device::DeviceDescription;
use crate::error::{Error, Result};
use std::fmt;

/// Three-dimensional extent. All zeros means "backend default".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim3 {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    pub fn is_zero(&self) -> bool {
        self.x == 0 && self.y == 0 && self.z == 0
    }

    pub fn volume(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }

    /// Replace an all-zero extent with `default`.
    pub fn or(self, default: Dim3) -> Dim3 {
        if self.is_zero() { default } else { self }
    }
}

impl From<(u32, u32, u32)> for Dim3 {
    fn from((x, y, z): (u32, u32, u32)) -> Self {
        Self::new(x, y, z)
    }
}

impl fmt::Display for Dim3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Threads per block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ThreadDim(pub Dim3);

/// Blocks per grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockDim(pub Dim3);

impl ThreadDim {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self(Dim3::new(x, y, z))
    }

    pub const fn linear(x: u32) -> Self {
        Self(Dim3::new(x, 1, 1))
    }
}

impl BlockDim {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self(Dim3::new(x, y, z))
    }

    pub const fn linear(x: u32) -> Self {
        Self(Dim3::new(x, 1, 1))
    }
}

/// Launch configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LaunchConfig {
    /// Threads per block
    pub threads: ThreadDim,

    /// Grid dimensions (blocks)
    pub blocks: BlockDim,

    /// Dynamic shared memory size
    pub shared_mem: u32,
}

impl LaunchConfig {
    pub fn new(threads: ThreadDim, blocks: BlockDim) -> Self {
        Self {
            threads,
            blocks,
            shared_mem: 0,
        }
    }

    /// Create a 1D launch configuration
    pub fn new_1d(grid_size: u32, block_size: u32) -> Self {
        Self::new(ThreadDim::linear(block_size), BlockDim::linear(grid_size))
    }

    pub fn with_shared_mem(mut self, size: u32) -> Self {
        self.shared_mem = size;
        self
    }

    /// Substitute backend defaults for all-zero extents.
    pub fn resolve(self, default_threads: Dim3, default_blocks: Dim3) -> Self {
        Self {
            threads: ThreadDim(self.threads.0.or(default_threads)),
            blocks: BlockDim(self.blocks.0.or(default_blocks)),
            shared_mem: self.shared_mem,
        }
    }

    pub fn total_threads(&self) -> u64 {
        self.total_blocks() * self.threads_per_block()
    }

    pub fn total_blocks(&self) -> u64 {
        self.blocks.0.volume()
    }

    pub fn threads_per_block(&self) -> u64 {
        self.threads.0.volume()
    }

    /// Validate the launch configuration against device limits
    pub fn validate(&self, device: &DeviceDescription) -> Result<()> {
        let threads = self.threads_per_block();
        if threads > device.max_threads_per_block as u64 {
            return Err(Error::invalid_argument(format!(
                "threads per block ({}) exceeds maximum ({})",
                threads, device.max_threads_per_block
            )));
        }

        let t = self.threads.0;
        let max = device.max_thread_dim;
        if t.x > max.x || t.y > max.y || t.z > max.z {
            return Err(Error::invalid_argument(format!(
                "thread extent {} exceeds per-axis maximum {}",
                t, max
            )));
        }

        if self.shared_mem > device.shared_mem_per_block {
            return Err(Error::invalid_argument(format!(
                "shared memory ({}) exceeds maximum ({})",
                self.shared_mem, device.shared_mem_per_block
            )));
        }

        Ok(())
    }
}

impl fmt::Display for LaunchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<<<{}, {}>>>", self.blocks.0, self.threads.0)
    }
}
