//! Kernel loader specs
//!
//! A [`KernelLoaderSpec`] lists every known location of one kernel's device
//! code, keyed by platform, code format and storage kind. The executor picks
//! one entry for its platform using the backend's preference order.

use crate::error::{Error, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Encoding of device code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CodeFormat {
    /// NVIDIA PTX assembly
    Ptx,
    /// NVIDIA native binary
    Cubin,
    OpenClSource,
    OpenClBinary,
    SpirV,
    /// Name of a function in a host backend's kernel library
    HostSymbol,
}

impl CodeFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            CodeFormat::Ptx => "ptx",
            CodeFormat::Cubin => "cubin",
            CodeFormat::OpenClSource => "open-cl-source",
            CodeFormat::OpenClBinary => "open-cl-binary",
            CodeFormat::SpirV => "spir-v",
            CodeFormat::HostSymbol => "host-symbol",
        }
    }
}

impl fmt::Display for CodeFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the code lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKind {
    InMemory,
    OnDisk,
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageKind::InMemory => write!(f, "in-memory"),
            StorageKind::OnDisk => write!(f, "on-disk"),
        }
    }
}

/// A (format, storage) pair a backend knows how to load.
pub type Encoding = (CodeFormat, StorageKind);

/// Code locator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeLocator {
    InMemory(Arc<[u8]>),
    File(PathBuf),
}

impl CodeLocator {
    pub fn storage(&self) -> StorageKind {
        match self {
            CodeLocator::InMemory(_) => StorageKind::InMemory,
            CodeLocator::File(_) => StorageKind::OnDisk,
        }
    }

    /// Fetch the code bytes, reading from disk if needed.
    pub fn load_bytes(&self) -> std::io::Result<Arc<[u8]>> {
        match self {
            CodeLocator::InMemory(bytes) => Ok(Arc::clone(bytes)),
            CodeLocator::File(path) => Ok(Arc::from(std::fs::read(path)?)),
        }
    }
}

/// One way to obtain a kernel on one platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderEntry {
    pub platform: String,
    pub format: CodeFormat,
    pub locator: CodeLocator,
    pub kernel_name: String,
    /// Declared argument count; informational, not verified by the runtime.
    pub arity: usize,
}

impl LoaderEntry {
    pub fn encoding(&self) -> Encoding {
        (self.format, self.locator.storage())
    }
}

/// Every known encoding and location of a kernel's device code
#[derive(Debug, Clone, Default)]
pub struct KernelLoaderSpec {
    entries: IndexMap<String, Vec<LoaderEntry>>,
}

impl KernelLoaderSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_entry(&mut self, entry: LoaderEntry) -> &mut Self {
        self.entries
            .entry(entry.platform.clone())
            .or_default()
            .push(entry);
        self
    }

    pub fn add_in_memory(
        &mut self,
        platform: &str,
        format: CodeFormat,
        kernel_name: &str,
        arity: usize,
        code: impl Into<Arc<[u8]>>,
    ) -> &mut Self {
        self.add_entry(LoaderEntry {
            platform: platform.to_string(),
            format,
            locator: CodeLocator::InMemory(code.into()),
            kernel_name: kernel_name.to_string(),
            arity,
        })
    }

    pub fn add_file(
        &mut self,
        platform: &str,
        format: CodeFormat,
        kernel_name: &str,
        arity: usize,
        path: impl Into<PathBuf>,
    ) -> &mut Self {
        self.add_entry(LoaderEntry {
            platform: platform.to_string(),
            format,
            locator: CodeLocator::File(path.into()),
            kernel_name: kernel_name.to_string(),
            arity,
        })
    }

    /// All entries, grouped by platform in first-seen order.
    pub fn entries(&self) -> impl Iterator<Item = &LoaderEntry> {
        self.entries.values().flatten()
    }

    pub fn entries_for(&self, platform: &str) -> &[LoaderEntry] {
        self.entries.get(platform).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn platforms(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Name used in diagnostics: the first entry's kernel name.
    pub fn display_name(&self) -> &str {
        self.entries()
            .next()
            .map(|e| e.kernel_name.as_str())
            .unwrap_or("<empty spec>")
    }

    /// Pick the entry for `platform` that ranks earliest in `preference`.
    ///
    /// Ties keep insertion order; entries whose encoding is absent from
    /// `preference` are never chosen.
    pub fn select(&self, platform: &str, preference: &[Encoding]) -> Result<&LoaderEntry> {
        self.entries_for(platform)
            .iter()
            .filter_map(|entry| {
                preference
                    .iter()
                    .position(|enc| *enc == entry.encoding())
                    .map(|rank| (rank, entry))
            })
            .min_by_key(|(rank, _)| *rank)
            .map(|(_, entry)| entry)
            .ok_or_else(|| Error::NoMatchingEntry {
                kernel: self.display_name().to_string(),
                platform: platform.to_string(),
            })
    }
}
