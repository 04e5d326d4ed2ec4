//! Device memory handles
//!
//! [`DeviceMemory`] is a plain descriptor: copying it does not copy or own the
//! allocation. Ownership is opt-in through [`ScopedDeviceMemory`], which hands
//! the allocation back to its executor when dropped.

use crate::error::{Error, Result};
use crate::executor::Executor;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// Backend-defined token standing in for a device pointer. Zero is null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DeviceAddress(pub u64);

impl DeviceAddress {
    pub const NULL: DeviceAddress = DeviceAddress(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn offset(self, bytes: u64) -> DeviceAddress {
        DeviceAddress(self.0 + bytes)
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Device buffer descriptor: address token and byte length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DeviceMemory {
    address: DeviceAddress,
    size: u64,
}

impl DeviceMemory {
    pub fn new(address: DeviceAddress, size: u64) -> Self {
        Self { address, size }
    }

    /// The descriptor returned for zero-byte allocations.
    pub fn null() -> Self {
        Self::default()
    }

    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    /// Get the size of the buffer in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_null(&self) -> bool {
        self.address.is_null()
    }

    /// Number of whole `T` elements that fit in the buffer.
    pub fn element_count<T>(&self) -> u64 {
        match std::mem::size_of::<T>() as u64 {
            0 => 0,
            n => self.size / n,
        }
    }

    /// Describe `len` bytes starting `offset` bytes into this buffer.
    pub fn slice(&self, offset: u64, len: u64) -> Result<DeviceMemory> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| Error::invalid_argument("slice range overflows"))?;
        if end > self.size {
            return Err(Error::invalid_argument(format!(
                "slice {}..{} outside buffer of {} bytes",
                offset, end, self.size
            )));
        }
        if len == 0 {
            return Ok(DeviceMemory::null());
        }
        Ok(DeviceMemory::new(self.address.offset(offset), len))
    }
}

/// Owning wrapper that deallocates on drop
///
/// The allocation is released exactly once: on drop, on every exit path,
/// unless [`release`](Self::release) transfers it back to the caller first.
pub struct ScopedDeviceMemory<'e> {
    executor: &'e Executor,
    memory: Option<DeviceMemory>,
}

impl<'e> ScopedDeviceMemory<'e> {
    /// Take ownership of an allocation made on `executor`.
    pub fn new(executor: &'e Executor, memory: DeviceMemory) -> Self {
        Self {
            executor,
            memory: Some(memory),
        }
    }

    pub fn get(&self) -> &DeviceMemory {
        self.deref()
    }

    /// Give up ownership without deallocating.
    pub fn release(mut self) -> DeviceMemory {
        self.memory.take().unwrap_or_default()
    }

    /// Deallocate now and take ownership of `memory` instead.
    pub fn reset(&mut self, memory: DeviceMemory) {
        if let Some(old) = self.memory.replace(memory) {
            self.executor.deallocate(old);
        }
    }
}

impl Deref for ScopedDeviceMemory<'_> {
    type Target = DeviceMemory;

    fn deref(&self) -> &DeviceMemory {
        // Only `release` empties the slot, and it consumes `self`.
        self.memory.as_ref().unwrap_or(&NULL_MEMORY)
    }
}

static NULL_MEMORY: DeviceMemory = DeviceMemory {
    address: DeviceAddress::NULL,
    size: 0,
};

impl Drop for ScopedDeviceMemory<'_> {
    fn drop(&mut self) {
        if let Some(memory) = self.memory.take() {
            self.executor.deallocate(memory);
        }
    }
}

impl fmt::Debug for ScopedDeviceMemory<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedDeviceMemory")
            .field("executor", &self.executor.id())
            .field("memory", &self.memory)
            .finish()
    }
}

/// Host staging buffer that asynchronous device-to-host copies write into
///
/// Clones share storage, so the stream can complete the copy after the
/// enqueuing call has returned. Read it after synchronizing the stream.
#[derive(Clone, Default)]
pub struct HostBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl HostBuffer {
    /// Zero-filled buffer of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self::from(vec![0u8; len])
    }

    pub fn len(&self) -> usize {
        self.bytes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.bytes.lock()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl From<Vec<u8>> for HostBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(bytes)),
        }
    }
}

impl fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuffer").field("len", &self.len()).finish()
    }
}
