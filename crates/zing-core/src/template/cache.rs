// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Bounded LRU of parsed templates keyed by blob hash.
use std::sync::Arc;

use indexmap::IndexMap;
use zing_cas::BlobHash;

use super::{SchemaError, Template};

/// Least-recently-used cache of parsed templates.
///
/// Entries are ordered oldest-first; a hit moves the entry to the back and an
/// insert beyond capacity evicts the front. Capacity is clamped to at least 1.
#[derive(Debug)]
pub struct TemplateCache {
    capacity: usize,
    entries: IndexMap<BlobHash, Arc<Template>>,
}

impl TemplateCache {
    /// Empty cache holding at most `capacity` templates.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: IndexMap::new(),
        }
    }

    /// Maximum number of templates retained.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of cached templates.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the cached template and marks it most recently used.
    pub fn get(&mut self, hash: &BlobHash) -> Option<Arc<Template>> {
        let template = self.entries.shift_remove(hash)?;
        self.entries.insert(*hash, Arc::clone(&template));
        Some(template)
    }

    /// Caches `template` under its own hash.
    pub fn insert(&mut self, template: Arc<Template>) {
        let hash = template.hash();
        self.entries.shift_remove(&hash);
        self.entries.insert(hash, template);
        while self.entries.len() > self.capacity {
            self.entries.shift_remove_index(0);
        }
    }

    /// Cached template for `hash`, parsing `raw()` on a miss.
    ///
    /// # Errors
    ///
    /// Propagates loader and parse errors; nothing is cached on failure.
    pub fn get_or_parse<F, E>(&mut self, hash: &BlobHash, raw: F) -> Result<Arc<Template>, E>
    where
        F: FnOnce() -> Result<Arc<[u8]>, E>,
        E: From<SchemaError>,
    {
        if let Some(hit) = self.get(hash) {
            return Ok(hit);
        }
        let bytes = raw()?;
        let template = Arc::new(Template::parse(&bytes)?);
        self.insert(Arc::clone(&template));
        Ok(template)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn template(rectype: &str) -> Arc<Template> {
        let raw = format!(r#"{{ "rectypes": {{ "{rectype}": {{ "fields": {{}} }} }} }}"#);
        Arc::new(Template::parse(raw.as_bytes()).unwrap())
    }

    #[test]
    fn evicts_least_recently_used() {
        let mut cache = TemplateCache::new(2);
        let (a, b, c) = (template("a"), template("b"), template("c"));
        cache.insert(Arc::clone(&a));
        cache.insert(Arc::clone(&b));
        assert!(cache.get(&a.hash()).is_some());
        cache.insert(Arc::clone(&c));
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&b.hash()).is_none());
        assert!(cache.get(&a.hash()).is_some());
        assert!(cache.get(&c.hash()).is_some());
    }

    #[test]
    fn get_or_parse_skips_loader_on_hit() {
        let mut cache = TemplateCache::new(4);
        let a = template("a");
        cache.insert(Arc::clone(&a));
        let hit = cache
            .get_or_parse::<_, SchemaError>(&a.hash(), || panic!("loader must not run"))
            .unwrap();
        assert!(Arc::ptr_eq(&hit, &a));
    }
}
