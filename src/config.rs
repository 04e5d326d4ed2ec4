//! Runtime configuration
//!
//! Configuration is read from TOML. Every section is optional:
//!
//! ```toml
//! [executor]
//! ordinal = 0
//!
//! [executor.plugins]
//! blas = "default"
//! rng = "none"
//!
//! [host]
//! device_count = 2
//! memory_per_device = 268435456
//! latency_us = 0
//!
//! [[kernels]]
//! name = "saxpy"
//! arity = 4
//!
//! [[kernels.entries]]
//! platform = "host"
//! format = "host-symbol"
//! inline = "saxpy"
//! ```

use crate::error::{Error, Result};
use crate::host::HostConfig;
use crate::loader::{CodeFormat, KernelLoaderSpec};
use crate::plugin::PluginConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub executor: ExecutorConfig,
    pub host: HostConfig,
    pub kernels: Vec<KernelManifest>,
}

impl RuntimeConfig {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        Ok(toml::from_str(source)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path).map_err(|e| Error::Config {
            reason: format!("failed to read {}: {}", path.display(), e),
        })?;
        Self::from_toml_str(&source)
    }

    /// Loader specs for every kernel in the manifest, in file order.
    pub fn loader_specs(&self) -> Result<Vec<(String, KernelLoaderSpec)>> {
        self.kernels
            .iter()
            .map(|k| Ok((k.name.clone(), k.to_loader_spec()?)))
            .collect()
    }
}

/// Executor acquisition parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub ordinal: usize,
    pub plugins: PluginConfig,
}

impl ExecutorConfig {
    pub fn new(ordinal: usize) -> Self {
        Self {
            ordinal,
            ..Self::default()
        }
    }
}

/// One kernel and where its code lives on each platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelManifest {
    pub name: String,
    pub arity: usize,
    #[serde(default)]
    pub entries: Vec<EntryManifest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryManifest {
    pub platform: String,
    pub format: CodeFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl KernelManifest {
    pub fn to_loader_spec(&self) -> Result<KernelLoaderSpec> {
        let mut spec = KernelLoaderSpec::new();
        for entry in &self.entries {
            match (&entry.inline, &entry.path) {
                (Some(code), None) => {
                    spec.add_in_memory(
                        &entry.platform,
                        entry.format,
                        &self.name,
                        self.arity,
                        code.as_bytes().to_vec(),
                    );
                }
                (None, Some(path)) => {
                    spec.add_file(
                        &entry.platform,
                        entry.format,
                        &self.name,
                        self.arity,
                        path.clone(),
                    );
                }
                _ => {
                    return Err(Error::Config {
                        reason: format!(
                            "entry for `{}` on `{}` needs exactly one of `inline` or `path`",
                            self.name, entry.platform
                        ),
                    });
                }
            }
        }
        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::StorageKind;
    use crate::plugin::{PluginChoice, PluginKind};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_config() {
        let config = RuntimeConfig::from_toml_str("").unwrap();
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn test_parse_full_config() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            [executor]
            ordinal = 1

            [executor.plugins]
            blas = "null-blas"
            rng = "none"

            [host]
            device_count = 3
            memory_per_device = 1048576

            [[kernels]]
            name = "saxpy"
            arity = 4

            [[kernels.entries]]
            platform = "host"
            format = "host-symbol"
            inline = "saxpy"

            [[kernels.entries]]
            platform = "cuda"
            format = "ptx"
            path = "kernels/saxpy.ptx"
        "#,
        )
        .unwrap();

        assert_eq!(config.executor.ordinal, 1);
        assert_eq!(
            config.executor.plugins.choice(PluginKind::Blas),
            &PluginChoice::Named("null-blas".into())
        );
        assert_eq!(config.executor.plugins.choice(PluginKind::Rng), &PluginChoice::None);
        assert_eq!(config.executor.plugins.choice(PluginKind::Fft), &PluginChoice::Default);
        assert_eq!(config.host.device_count, 3);
        assert_eq!(config.host.memory_per_device, 1048576);

        let specs = config.loader_specs().unwrap();
        assert_eq!(specs.len(), 1);
        let (name, spec) = &specs[0];
        assert_eq!(name, "saxpy");
        assert_eq!(spec.entries_for("host")[0].locator.storage(), StorageKind::InMemory);
        assert_eq!(spec.entries_for("cuda")[0].locator.storage(), StorageKind::OnDisk);
        assert_eq!(spec.entries_for("cuda")[0].arity, 4);
    }

    #[test]
    fn test_entry_needs_one_locator() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            [[kernels]]
            name = "k"
            arity = 0

            [[kernels.entries]]
            platform = "host"
            format = "host-symbol"
        "#,
        )
        .unwrap();
        let err = config.loader_specs().unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Config);
    }

    #[test]
    fn test_bad_toml() {
        let err = RuntimeConfig::from_toml_str("[executor\nordinal = 0").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Config);
    }
}
