// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Engine configuration and its storage port.
//!
//! [`EngineConfig`] carries every tunable limit of the engine. It is stored as
//! JSON under [`EngineConfig::KEY`] through a [`ConfigService`], which
//! delegates persistence to any [`ConfigStore`]. Missing keys and missing
//! members fall back to defaults.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

/// Tunable limits of the engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Parsed templates kept in the LRU.
    pub template_cache_capacity: usize,
    /// Changesets examined per leaf in the first ancestor search window.
    pub ancestor_window: usize,
    /// Factor the ancestor window grows by after each miss.
    pub ancestor_window_growth: usize,
    /// Passes the action engine may take before giving up.
    pub max_action_passes: usize,
    /// Commit attempts a merge may spend on uniquify repairs.
    pub max_uniquify_rounds: usize,
    /// Length of generated values when the template does not say.
    pub generator_length: usize,
    /// Candidates a generator may draw before giving up.
    pub generator_attempts: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            template_cache_capacity: 32,
            ancestor_window: 10,
            ancestor_window_growth: 4,
            max_action_passes: 64,
            max_uniquify_rounds: 16,
            generator_length: 8,
            generator_attempts: 1000,
        }
    }
}

impl EngineConfig {
    /// Config key the engine settings are stored under.
    pub const KEY: &'static str = "engine";

    /// Loads the engine settings, falling back to defaults when none are
    /// stored.
    ///
    /// # Errors
    ///
    /// Store or JSON failures other than a missing key.
    pub fn load<S: ConfigStore>(service: &ConfigService<S>) -> Result<Self, ConfigError> {
        Ok(service.load(Self::KEY)?.unwrap_or_default())
    }

    /// Persists these settings.
    ///
    /// # Errors
    ///
    /// Store or JSON failures.
    pub fn save<S: ConfigStore>(&self, service: &ConfigService<S>) -> Result<(), ConfigError> {
        service.save(Self::KEY, self)
    }
}

/// Storage port for raw config blobs (keyed by logical name).
pub trait ConfigStore {
    /// Load a raw config blob. Returns `NotFound` when missing.
    ///
    /// # Errors
    ///
    /// [`ConfigError::NotFound`] or a store-specific failure.
    fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError>;

    /// Persist a raw config blob.
    ///
    /// # Errors
    ///
    /// Store-specific failure.
    fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError>;
}

/// Error type for config operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Key not present in store.
    #[error("not found")]
    NotFound,
    /// I/O error while reading/writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization/deserialization failure.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    /// Catch-all error variant.
    #[error("other: {0}")]
    Other(String),
}

/// Serializes config values as JSON and delegates storage to a `ConfigStore`.
pub struct ConfigService<S> {
    store: S,
}

impl<S> ConfigService<S> {
    /// Create a new service using the given store.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Consume the service and return the inner store.
    pub fn into_inner(self) -> S {
        self.store
    }
}

impl<S> ConfigService<S>
where
    S: ConfigStore,
{
    /// Load and deserialize a config value for `key`. `Ok(None)` if missing
    /// or empty.
    ///
    /// # Errors
    ///
    /// Store failures other than `NotFound`, and JSON errors.
    pub fn load<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: DeserializeOwned,
    {
        match self.store.load_raw(key) {
            Ok(bytes) if bytes.is_empty() => Ok(None),
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(ConfigError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Serialize and persist a config value for `key`.
    ///
    /// # Errors
    ///
    /// JSON or store failures.
    pub fn save<T>(&self, key: &str, value: &T) -> Result<(), ConfigError>
    where
        T: Serialize,
    {
        let data = serde_json::to_vec_pretty(value)?;
        self.store.save_raw(key, &data)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Scratch(RefCell<HashMap<String, Vec<u8>>>);

    impl ConfigStore for Scratch {
        fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError> {
            self.0.borrow().get(key).cloned().ok_or(ConfigError::NotFound)
        }

        fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError> {
            self.0.borrow_mut().insert(key.to_owned(), data.to_vec());
            Ok(())
        }
    }

    #[test]
    fn missing_key_yields_defaults() {
        let service = ConfigService::new(Scratch::default());
        assert_eq!(EngineConfig::load(&service).unwrap(), EngineConfig::default());
    }

    #[test]
    fn partial_documents_fill_in_defaults() {
        let store = Scratch::default();
        store
            .save_raw(EngineConfig::KEY, br#"{ "max_action_passes": 3 }"#)
            .unwrap();
        let config = EngineConfig::load(&ConfigService::new(store)).unwrap();
        assert_eq!(config.max_action_passes, 3);
        assert_eq!(config.ancestor_window, 10);
    }

    #[test]
    fn save_then_load() {
        let service = ConfigService::new(Scratch::default());
        let config = EngineConfig {
            template_cache_capacity: 2,
            ..EngineConfig::default()
        };
        config.save(&service).unwrap();
        assert_eq!(EngineConfig::load(&service).unwrap(), config);
    }

    #[test]
    fn malformed_json_is_an_error() {
        let store = Scratch::default();
        store.save_raw(EngineConfig::KEY, b"{ nope").unwrap();
        assert!(matches!(
            EngineConfig::load(&ConfigService::new(store)),
            Err(ConfigError::Serde(_))
        ));
    }
}
