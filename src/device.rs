//! Device properties

use crate::launch::Dim3;
use serde::Serialize;

/// Device information
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceDescription {
    pub name: String,
    pub platform: String,
    pub ordinal: usize,
    pub total_memory: u64,
    pub multiprocessors: u32,
    pub max_threads_per_block: u32,
    #[serde(serialize_with = "serialize_dim")]
    pub max_thread_dim: Dim3,
    pub warp_size: u32,
    pub shared_mem_per_block: u32,
    pub clock_rate_khz: u32,
}

impl DeviceDescription {
    /// Limits of the in-process simulated device.
    pub fn simulated(platform: impl Into<String>, ordinal: usize) -> Self {
        Self {
            name: format!("Simulated GPU {}", ordinal),
            platform: platform.into(),
            ordinal,
            total_memory: 1024 * 1024 * 1024, // 1 GB
            multiprocessors: 1,
            max_threads_per_block: 1024,
            max_thread_dim: Dim3::new(1024, 1024, 64),
            warp_size: 32,
            shared_mem_per_block: 48 * 1024,
            clock_rate_khz: 1000000,
        }
    }

    pub fn with_total_memory(mut self, bytes: u64) -> Self {
        self.total_memory = bytes;
        self
    }
}

fn serialize_dim<S: serde::Serializer>(dim: &Dim3, s: S) -> Result<S::Ok, S::Error> {
    [dim.x, dim.y, dim.z].serialize(s)
}
