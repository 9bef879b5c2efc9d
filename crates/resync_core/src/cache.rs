//! Per-resource-type cache filled by bulk enumeration.
//!
//! Exporting thousands of resources would otherwise issue one read per
//! resource after the listing already returned every body. Entries are
//! only ever written by a listing and removed by a delete.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Concurrent id → entity map.
#[derive(Debug)]
pub struct ResourceCache<T> {
    entries: RwLock<HashMap<String, T>>,
}

impl<T> Default for ResourceCache<T> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<T: Clone> ResourceCache<T> {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an entity, replacing any previous one.
    pub fn set(&self, id: impl Into<String>, entity: T) {
        self.entries.write().insert(id.into(), entity);
    }

    /// Returns a copy of the cached entity.
    pub fn get(&self, id: &str) -> Option<T> {
        self.entries.read().get(id).cloned()
    }

    /// Removes an entity. Returns true if it was cached.
    pub fn delete(&self, id: &str) -> bool {
        self.entries.write().remove(id).is_some()
    }

    /// Stores many entities under one lock. Returns how many were stored.
    pub fn populate<I>(&self, entries: I) -> usize
    where
        I: IntoIterator<Item = (String, T)>,
    {
        let mut map = self.entries.write();
        let before = map.len();
        map.extend(entries);
        let added = map.len() - before;
        debug!(added, total = map.len(), "cache populated");
        added
    }

    /// Returns true if the id is cached.
    pub fn contains(&self, id: &str) -> bool {
        self.entries.read().contains_key(id)
    }

    /// Number of cached entities.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Cached ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.entries.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// One JSON cache per resource type, created on first use.
#[derive(Debug, Default)]
pub struct CacheRegistry {
    caches: RwLock<HashMap<String, Arc<ResourceCache<Value>>>>,
}

impl CacheRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cache for `resource_type`.
    pub fn for_type(&self, resource_type: &str) -> Arc<ResourceCache<Value>> {
        if let Some(cache) = self.caches.read().get(resource_type) {
            return Arc::clone(cache);
        }
        let mut caches = self.caches.write();
        Arc::clone(caches.entry(resource_type.to_string()).or_default())
    }

    /// Resource types with a cache.
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.caches.read().keys().cloned().collect();
        types.sort();
        types
    }

    /// Clears every cache.
    pub fn clear_all(&self) {
        for cache in self.caches.read().values() {
            cache.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::thread;

    #[test]
    fn set_get_delete() {
        let cache = ResourceCache::new();
        cache.set("a", 1);
        assert_eq!(cache.get("a"), Some(1));
        assert!(cache.delete("a"));
        assert!(!cache.delete("a"));
        assert_eq!(cache.get("a"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn populate_replaces_and_counts() {
        let cache = ResourceCache::new();
        cache.set("a", 0);
        let added = cache.populate(vec![("a".to_string(), 1), ("b".to_string(), 2)]);
        assert_eq!(added, 1);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.ids(), vec!["a", "b"]);

        cache.clear();
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn concurrent_readers_and_writers() {
        let cache = Arc::new(ResourceCache::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for i in 0..100 {
                        let id = format!("{t}-{i}");
                        cache.set(id.clone(), i);
                        assert_eq!(cache.get(&id), Some(i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 400);
    }

    #[test]
    fn registry_shares_cache_per_type() {
        let registry = CacheRegistry::new();
        registry.for_type("queue").set("q-1", json!({"name": "support"}));

        assert_eq!(registry.for_type("queue").len(), 1);
        assert!(registry.for_type("user").is_empty());
        assert_eq!(registry.types(), vec!["queue", "user"]);

        registry.clear_all();
        assert!(registry.for_type("queue").is_empty());
    }
}
