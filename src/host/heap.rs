//! Simulated device memory

use crate::backend::Pattern;
use crate::error::{Error, Result};
use crate::memory::{DeviceAddress, DeviceMemory};
use std::collections::BTreeMap;

const BASE_ADDRESS: u64 = 0x1000_0000;
const ALIGNMENT: u64 = 256;

/// Device allocations keyed by base address
///
/// Addresses come from a bump pointer and are never reused, so a stale
/// descriptor fails to resolve instead of aliasing a newer allocation.
#[derive(Debug)]
pub(crate) struct DeviceHeap {
    blocks: BTreeMap<u64, Vec<u8>>,
    next_address: u64,
    in_use: u64,
    capacity: u64,
}

impl DeviceHeap {
    pub(crate) fn new(capacity: u64) -> Self {
        Self {
            blocks: BTreeMap::new(),
            next_address: BASE_ADDRESS,
            in_use: 0,
            capacity,
        }
    }

    pub(crate) fn allocate(&mut self, size: u64) -> Result<DeviceAddress> {
        let available = self.capacity - self.in_use;
        if size > available {
            return Err(Error::OutOfMemory {
                requested: size,
                available,
            });
        }
        let address = self.next_address;
        self.next_address += size.div_ceil(ALIGNMENT).max(1) * ALIGNMENT;
        self.blocks.insert(address, vec![0u8; size as usize]);
        self.in_use += size;
        Ok(DeviceAddress(address))
    }

    /// Release a block; returns its size, or `None` for an unknown address.
    pub(crate) fn free(&mut self, address: DeviceAddress) -> Option<u64> {
        let block = self.blocks.remove(&address.0)?;
        let size = block.len() as u64;
        self.in_use -= size;
        Some(size)
    }

    /// `(free, total)` bytes
    pub(crate) fn usage(&self) -> (u64, u64) {
        (self.capacity - self.in_use, self.capacity)
    }

    fn locate(&self, memory: DeviceMemory) -> Result<(u64, usize)> {
        let address = memory.address().0;
        let (&base, block) = self
            .blocks
            .range(..=address)
            .next_back()
            .ok_or_else(|| unmapped(memory))?;
        let offset = (address - base) as usize;
        if offset + memory.size() as usize > block.len() {
            return Err(unmapped(memory));
        }
        Ok((base, offset))
    }

    pub(crate) fn resolve(&self, memory: DeviceMemory) -> Result<&[u8]> {
        if memory.size() == 0 {
            return Ok(&[]);
        }
        let (base, offset) = self.locate(memory)?;
        let len = memory.size() as usize;
        Ok(&self.blocks[&base][offset..offset + len])
    }

    pub(crate) fn resolve_mut(&mut self, memory: DeviceMemory) -> Result<&mut [u8]> {
        if memory.size() == 0 {
            return Ok(&mut []);
        }
        let (base, offset) = self.locate(memory)?;
        let len = memory.size() as usize;
        let block = self
            .blocks
            .get_mut(&base)
            .ok_or_else(|| unmapped(memory))?;
        Ok(&mut block[offset..offset + len])
    }

    pub(crate) fn write(&mut self, dst: DeviceMemory, src: &[u8]) -> Result<()> {
        self.resolve_mut(dst)?.copy_from_slice(src);
        Ok(())
    }

    /// Copy `src` into the first `src.size()` bytes of `dst`.
    pub(crate) fn copy(&mut self, dst: DeviceMemory, src: DeviceMemory) -> Result<()> {
        // Staged through a temporary: the ranges may overlap within one block.
        let bytes = self.resolve(src)?.to_vec();
        let dst = DeviceMemory::new(dst.address(), bytes.len() as u64);
        self.write(dst, &bytes)
    }

    pub(crate) fn fill(&mut self, dst: DeviceMemory, pattern: Pattern) -> Result<()> {
        let bytes = self.resolve_mut(dst)?;
        match pattern {
            Pattern::Byte(value) => bytes.fill(value),
            Pattern::Word(value) => {
                for chunk in bytes.chunks_exact_mut(4) {
                    chunk.copy_from_slice(bytemuck::bytes_of(&value));
                }
            }
        }
        Ok(())
    }
}

fn unmapped(memory: DeviceMemory) -> Error {
    Error::invalid_handle(format!(
        "{} bytes at {} are not inside a live allocation",
        memory.size(),
        memory.address()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_free() {
        let mut heap = DeviceHeap::new(1024);
        let a = heap.allocate(512).unwrap();
        assert_eq!(heap.usage(), (512, 1024));

        let err = heap.allocate(600).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::OutOfMemory);

        assert_eq!(heap.free(a), Some(512));
        assert_eq!(heap.free(a), None);
        assert!(heap.allocate(1024).is_ok());
    }

    #[test]
    fn test_sub_range_access() {
        let mut heap = DeviceHeap::new(1024);
        let base = heap.allocate(16).unwrap();
        let whole = DeviceMemory::new(base, 16);

        heap.write(whole.slice(4, 4).unwrap(), &[9, 9, 9, 9]).unwrap();
        assert_eq!(heap.resolve(whole).unwrap()[..8], [0, 0, 0, 0, 9, 9, 9, 9]);

        // Past the end of the block
        assert!(heap.resolve(DeviceMemory::new(base.offset(8), 16)).is_err());
    }

    #[test]
    fn test_overlapping_copy() {
        let mut heap = DeviceHeap::new(1024);
        let base = heap.allocate(8).unwrap();
        let whole = DeviceMemory::new(base, 8);
        heap.write(whole, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();

        heap.copy(whole.slice(2, 6).unwrap(), whole.slice(0, 6).unwrap())
            .unwrap();
        assert_eq!(heap.resolve(whole).unwrap(), &[1, 2, 1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_fill_word() {
        let mut heap = DeviceHeap::new(64);
        let base = heap.allocate(8).unwrap();
        let whole = DeviceMemory::new(base, 8);
        heap.fill(whole, Pattern::Word(0xdead_beef)).unwrap();
        let bytes = heap.resolve(whole).unwrap();
        assert_eq!(&bytes[..4], bytemuck::bytes_of(&0xdead_beefu32));
        assert_eq!(&bytes[4..], bytemuck::bytes_of(&0xdead_beefu32));
    }
}
