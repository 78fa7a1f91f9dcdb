// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! In-memory config store fake for testing without filesystem I/O.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use zing_core::{ConfigError, ConfigStore, EngineConfig};

/// In-memory implementation of [`ConfigStore`] for testing.
///
/// Clones share state, so a test can keep a handle while the
/// [`ConfigService`](zing_core::ConfigService) owns another.
///
/// # Example
///
/// ```
/// use zing_dry_tests::InMemoryConfigStore;
/// use zing_core::{ConfigService, EngineConfig};
///
/// let store = InMemoryConfigStore::new();
/// let service = ConfigService::new(store.clone());
///
/// EngineConfig::default().save(&service).unwrap();
/// assert_eq!(store.save_count(), 1);
/// assert!(store.contains_key(EngineConfig::KEY));
/// ```
#[derive(Clone, Default)]
pub struct InMemoryConfigStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    data: BTreeMap<String, Vec<u8>>,
    load_count: usize,
    save_count: usize,
    fail_on_load: bool,
}

impl InMemoryConfigStore {
    /// Create a new empty in-memory config store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store holding `config` under [`EngineConfig::KEY`].
    pub fn with_engine_config(config: &EngineConfig) -> Result<Self, ConfigError> {
        let store = Self::new();
        store.save_raw(EngineConfig::KEY, &serde_json::to_vec(config)?)?;
        store.lock().save_count = 0;
        Ok(store)
    }

    /// Configure the store to fail on load operations.
    pub fn set_fail_on_load(&self, fail: bool) {
        self.lock().fail_on_load = fail;
    }

    /// Number of `load_raw` calls, failed ones included.
    pub fn load_count(&self) -> usize {
        self.lock().load_count
    }

    /// Number of `save_raw` calls.
    pub fn save_count(&self) -> usize {
        self.lock().save_count
    }

    /// Check if a key exists in the store.
    pub fn contains_key(&self, key: &str) -> bool {
        self.lock().data.contains_key(key)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ConfigStore for InMemoryConfigStore {
    fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError> {
        let mut inner = self.lock();
        inner.load_count += 1;
        if inner.fail_on_load {
            return Err(ConfigError::Other("simulated load failure".into()));
        }
        inner.data.get(key).cloned().ok_or(ConfigError::NotFound)
    }

    fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError> {
        let mut inner = self.lock();
        inner.save_count += 1;
        inner.data.insert(key.to_owned(), data.to_vec());
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use zing_core::ConfigService;

    #[test]
    fn clone_shares_state_between_instances() {
        let a = InMemoryConfigStore::new();
        let b = a.clone();
        a.save_raw("k", b"v").unwrap();
        assert_eq!(b.load_raw("k").unwrap(), b"v");
        assert_eq!(b.save_count(), 1);
        assert_eq!(a.load_count(), 1);
    }

    #[test]
    fn seeded_engine_config_loads_back() {
        let config = EngineConfig {
            max_uniquify_rounds: 2,
            ..EngineConfig::default()
        };
        let store = InMemoryConfigStore::with_engine_config(&config).unwrap();
        assert_eq!(store.save_count(), 0);
        let service = ConfigService::new(store);
        assert_eq!(EngineConfig::load(&service).unwrap(), config);
    }

    #[test]
    fn fail_on_load_surfaces_through_the_service() {
        let store = InMemoryConfigStore::new();
        store.set_fail_on_load(true);
        let service = ConfigService::new(store.clone());
        assert!(matches!(EngineConfig::load(&service), Err(ConfigError::Other(_))));
        assert_eq!(store.load_count(), 1);
    }
}
