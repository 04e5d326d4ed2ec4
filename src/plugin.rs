//! Canned-operation plugin selection
//!
//! The runtime does not implement BLAS, DNN, FFT or RNG routines. It only
//! records which plugin instance services each class on an executor, so that
//! libraries layered on top can find them.

use crate::device::DeviceDescription;
use crate::error::{Error, Result};
use indexmap::IndexMap;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Operation class a plugin services
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    Blas,
    Dnn,
    Fft,
    Rng,
}

impl PluginKind {
    pub const ALL: [PluginKind; 4] = [
        PluginKind::Blas,
        PluginKind::Dnn,
        PluginKind::Fft,
        PluginKind::Rng,
    ];
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginKind::Blas => write!(f, "blas"),
            PluginKind::Dnn => write!(f, "dnn"),
            PluginKind::Fft => write!(f, "fft"),
            PluginKind::Rng => write!(f, "rng"),
        }
    }
}

/// Which plugin to use for one class
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PluginChoice {
    /// The platform's default plugin, if one is set
    #[default]
    Default,
    None,
    Named(String),
}

impl From<String> for PluginChoice {
    fn from(s: String) -> Self {
        match s.as_str() {
            "default" => PluginChoice::Default,
            "none" => PluginChoice::None,
            _ => PluginChoice::Named(s),
        }
    }
}

impl From<PluginChoice> for String {
    fn from(choice: PluginChoice) -> Self {
        match choice {
            PluginChoice::Default => "default".to_string(),
            PluginChoice::None => "none".to_string(),
            PluginChoice::Named(name) => name,
        }
    }
}

/// Per-class plugin selection for one executor
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    pub blas: PluginChoice,
    pub dnn: PluginChoice,
    pub fft: PluginChoice,
    pub rng: PluginChoice,
}

impl PluginConfig {
    pub fn choice(&self, kind: PluginKind) -> &PluginChoice {
        match kind {
            PluginKind::Blas => &self.blas,
            PluginKind::Dnn => &self.dnn,
            PluginKind::Fft => &self.fft,
            PluginKind::Rng => &self.rng,
        }
    }

    pub fn set(&mut self, kind: PluginKind, choice: PluginChoice) -> &mut Self {
        match kind {
            PluginKind::Blas => self.blas = choice,
            PluginKind::Dnn => self.dnn = choice,
            PluginKind::Fft => self.fft = choice,
            PluginKind::Rng => self.rng = choice,
        }
        self
    }
}

/// A canned-operation library instance bound to one executor.
pub trait CannedPlugin: Send + Sync + fmt::Debug {
    fn kind(&self) -> PluginKind;

    fn name(&self) -> &str;
}

pub type PluginFactory =
    Arc<dyn Fn(&DeviceDescription) -> Result<Arc<dyn CannedPlugin>> + Send + Sync>;

type FactoryKey = (String, PluginKind, String);

/// Named plugin factories, per platform and class
#[derive(Default)]
pub struct PluginRegistry {
    factories: RwLock<IndexMap<FactoryKey, PluginFactory>>,
    defaults: RwLock<FxHashMap<(String, PluginKind), String>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        platform: &str,
        kind: PluginKind,
        name: &str,
        factory: PluginFactory,
    ) -> Result<()> {
        let key = (platform.to_string(), kind, name.to_string());
        let mut factories = self.factories.write();
        if factories.contains_key(&key) {
            return Err(Error::AlreadyRegistered {
                name: format!("{}/{}/{}", platform, kind, name),
            });
        }
        tracing::debug!("Registered {} plugin `{}` for platform `{}`", kind, name, platform);
        factories.insert(key, factory);
        Ok(())
    }

    /// Make `name` the plugin used when a config says `default`.
    pub fn set_default(&self, platform: &str, kind: PluginKind, name: &str) -> Result<()> {
        let key = (platform.to_string(), kind, name.to_string());
        if !self.factories.read().contains_key(&key) {
            return Err(Error::NotFound {
                what: "plugin",
                name: format!("{}/{}/{}", platform, kind, name),
            });
        }
        self.defaults
            .write()
            .insert((platform.to_string(), kind), name.to_string());
        Ok(())
    }

    pub fn default_name(&self, platform: &str, kind: PluginKind) -> Option<String> {
        self.defaults
            .read()
            .get(&(platform.to_string(), kind))
            .cloned()
    }

    /// Names registered for a platform and class, in registration order.
    pub fn names(&self, platform: &str, kind: PluginKind) -> Vec<String> {
        self.factories
            .read()
            .keys()
            .filter(|(p, k, _)| p == platform && *k == kind)
            .map(|(_, _, name)| name.clone())
            .collect()
    }

    /// Resolve a choice to a factory. `Ok(None)` means no plugin for this class.
    pub fn resolve(
        &self,
        platform: &str,
        kind: PluginKind,
        choice: &PluginChoice,
    ) -> Result<Option<PluginFactory>> {
        let name = match choice {
            PluginChoice::None => return Ok(None),
            PluginChoice::Default => match self.default_name(platform, kind) {
                Some(name) => name,
                None => return Ok(None),
            },
            PluginChoice::Named(name) => name.clone(),
        };
        let key = (platform.to_string(), kind, name);
        match self.factories.read().get(&key) {
            Some(factory) => Ok(Some(Arc::clone(factory))),
            None => Err(Error::InitializationFailed {
                reason: format!(
                    "no {} plugin named `{}` registered for platform `{}`",
                    kind, key.2, platform
                ),
            }),
        }
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<_> = self.factories.read().keys().cloned().collect();
        f.debug_struct("PluginRegistry")
            .field("factories", &keys)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct NullBlas;

    impl CannedPlugin for NullBlas {
        fn kind(&self) -> PluginKind {
            PluginKind::Blas
        }

        fn name(&self) -> &str {
            "null-blas"
        }
    }

    fn null_blas() -> PluginFactory {
        Arc::new(|_: &DeviceDescription| {
            Ok(Arc::new(NullBlas) as Arc<dyn CannedPlugin>)
        })
    }

    #[test]
    fn test_choice_from_string() {
        assert_eq!(PluginChoice::from("default".to_string()), PluginChoice::Default);
        assert_eq!(PluginChoice::from("none".to_string()), PluginChoice::None);
        assert_eq!(
            PluginChoice::from("cublas".to_string()),
            PluginChoice::Named("cublas".into())
        );
    }

    #[test]
    fn test_resolve() {
        let registry = PluginRegistry::new();
        registry
            .register("host", PluginKind::Blas, "null-blas", null_blas())
            .unwrap();

        // No default set yet
        let none = registry
            .resolve("host", PluginKind::Blas, &PluginChoice::Default)
            .unwrap();
        assert!(none.is_none());

        registry
            .set_default("host", PluginKind::Blas, "null-blas")
            .unwrap();
        let found = registry
            .resolve("host", PluginKind::Blas, &PluginChoice::Default)
            .unwrap();
        assert!(found.is_some());

        let missing = registry
            .resolve("host", PluginKind::Blas, &PluginChoice::Named("mkl".into()))
            .err()
            .unwrap();
        assert_eq!(missing.kind(), crate::ErrorKind::InitializationFailed);
    }

    #[test]
    fn test_duplicate_registration() {
        let registry = PluginRegistry::new();
        registry
            .register("host", PluginKind::Rng, "philox", null_blas())
            .unwrap();
        let err = registry
            .register("host", PluginKind::Rng, "philox", null_blas())
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::AlreadyRegistered);
    }
}
