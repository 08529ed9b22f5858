//! Filecache: keyed map from canonicalized path to a cached parsed object.
//!
//! Payloads are held weakly: a stored entry whose payload has already been
//! dropped elsewhere returns `None` on [`Filecache::get`] and is pruned on
//! next access. Concurrent lookups are frequent and structural mutation is
//! rare, so the backing map is a `dashmap` rather than a mutex-guarded
//! `HashMap`.

use std::sync::{Arc, Weak};

use dashmap::DashMap;

/// Filecache keyed map. `V` is typically an `Arc<Archive>` or `Arc<ZCache>`.
pub struct Filecache<V: ?Sized> {
    entries: DashMap<String, Weak<V>>,
}

impl<V: ?Sized> Default for Filecache<V> {
    fn default() -> Self {
        Filecache { entries: DashMap::new() }
    }
}

impl<V: ?Sized> Filecache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// `set(key, obj)`: associate `key` with `obj`, replacing any prior
    /// association.
    pub fn set(&self, key: impl Into<String>, obj: &Arc<V>) {
        self.entries.insert(key.into(), Arc::downgrade(obj));
    }

    /// `get(key)`: return a new strong ref or `None`. Entries whose
    /// payload has already been destroyed are pruned on access.
    pub fn get(&self, key: &str) -> Option<Arc<V>> {
        match self.entries.get(key).and_then(|w| w.upgrade()) {
            Some(v) => Some(v),
            None => {
                self.entries.remove(key);
                None
            }
        }
    }

    /// Explicitly drop a key, used when a base file's signature no
    /// longer matches the cached payload and a
    /// fresh parse is about to replace it.
    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Build the composite filecache key: base file's canonical path + `#` +
/// handler name, e.g. `/home/u/a.tar.gz#ugz`.
pub fn compose_key(canonical_base_path: &str, handler_name: &str) -> String {
    format!("{canonical_base_path}#{handler_name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_key_joins_with_hash() {
        assert_eq!(compose_key("/home/u/a.tar.gz", "ugz"), "/home/u/a.tar.gz#ugz");
    }

    #[test]
    fn set_then_get_returns_same_object() {
        let cache: Filecache<i32> = Filecache::new();
        let obj = Arc::new(42);
        cache.set("k", &obj);
        let got = cache.get("k").unwrap();
        assert_eq!(*got, 42);
    }

    #[test]
    fn dropped_payload_is_pruned_on_next_get() {
        let cache: Filecache<i32> = Filecache::new();
        {
            let obj = Arc::new(7);
            cache.set("k", &obj);
        }
        assert!(cache.get("k").is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn set_replaces_existing_key() {
        let cache: Filecache<i32> = Filecache::new();
        let a = Arc::new(1);
        let b = Arc::new(2);
        cache.set("k", &a);
        cache.set("k", &b);
        assert_eq!(*cache.get("k").unwrap(), 2);
    }

    #[test]
    fn invalidate_drops_the_mapping_even_if_payload_alive() {
        let cache: Filecache<i32> = Filecache::new();
        let obj = Arc::new(1);
        cache.set("k", &obj);
        cache.invalidate("k");
        assert!(cache.get("k").is_none());
    }
}
