//! Platforms and the platform registry
//!
//! A [`PlatformRegistry`] is an ordinary value: create it, register every
//! backend you want available, then hand it (by reference) to whatever needs
//! to look platforms up. Nothing registers behind your back.
//!
//! ```
//! use streamexec::{host, PlatformRegistry};
//!
//! let registry = PlatformRegistry::new();
//! host::register_default(&registry).unwrap();
//!
//! let platform = registry.lookup("host").unwrap();
//! let executor = platform.executor(0).unwrap();
//! assert_eq!(executor.platform_name(), "host");
//! ```

use crate::backend::Backend;
use crate::config::ExecutorConfig;
use crate::device::DeviceDescription;
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::plugin::PluginRegistry;
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Creates uninitialized backend instances, one per executor.
pub type BackendFactory = Arc<dyn Fn() -> Box<dyn Backend> + Send + Sync>;

/// A named backend family
pub struct Platform {
    name: String,
    factory: BackendFactory,
    plugins: Arc<PluginRegistry>,
    device_count: OnceLock<usize>,
}

impl Platform {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of devices the backend reports, probed once.
    pub fn device_count(&self) -> usize {
        *self
            .device_count
            .get_or_init(|| (self.factory)().device_count())
    }

    /// Acquire an executor for `ordinal` with default plugin selection.
    pub fn executor(&self, ordinal: usize) -> Result<Executor> {
        self.executor_with_config(&ExecutorConfig {
            ordinal,
            ..ExecutorConfig::default()
        })
    }

    pub fn executor_with_config(&self, config: &ExecutorConfig) -> Result<Executor> {
        let mut backend = (self.factory)();
        backend.init(config.ordinal)?;
        tracing::debug!(
            "Initialized `{}` device {} ({})",
            self.name,
            config.ordinal,
            backend.description().name
        );
        Executor::new(backend, config, &self.plugins)
    }

    /// Describe a device without keeping an executor around.
    pub fn description(&self, ordinal: usize) -> Result<DeviceDescription> {
        let mut backend = (self.factory)();
        backend.init(ordinal)?;
        Ok(backend.description())
    }
}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform")
            .field("name", &self.name)
            .field("device_count", &self.device_count.get())
            .finish()
    }
}

/// Name-keyed table of registered platforms
#[derive(Default)]
pub struct PlatformRegistry {
    platforms: RwLock<IndexMap<String, Arc<Platform>>>,
    plugins: Arc<PluginRegistry>,
}

impl PlatformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate `name` with a backend factory.
    pub fn register(&self, name: &str, factory: BackendFactory) -> Result<Arc<Platform>> {
        let mut platforms = self.platforms.write();
        if platforms.contains_key(name) {
            return Err(Error::AlreadyRegistered {
                name: name.to_string(),
            });
        }
        let platform = Arc::new(Platform {
            name: name.to_string(),
            factory,
            plugins: Arc::clone(&self.plugins),
            device_count: OnceLock::new(),
        });
        platforms.insert(name.to_string(), Arc::clone(&platform));
        tracing::debug!("Registered platform `{}`", name);
        Ok(platform)
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<Platform>> {
        self.platforms
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                what: "platform",
                name: name.to_string(),
            })
    }

    /// Registered names, in registration order.
    pub fn platforms(&self) -> Vec<String> {
        self.platforms.read().keys().cloned().collect()
    }

    pub fn plugins(&self) -> &PluginRegistry {
        &self.plugins
    }
}

impl fmt::Debug for PlatformRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformRegistry")
            .field("platforms", &self.platforms())
            .finish()
    }
}
