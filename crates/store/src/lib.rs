//! kubelive store: last-known objects of one resource kind, keyed by identity.

#![forbid(unsafe_code)]

use kubelive_core::{ObjectKey, ResourceKind, ResourceSnapshot};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::debug;

/// Mapping from identity to snapshot for a single kind.
///
/// Mutated by one list-watch driver; `list` may be called concurrently from anywhere.
pub struct ResourceStore {
    kind: ResourceKind,
    items: RwLock<FxHashMap<ObjectKey, ResourceSnapshot>>,
}

impl ResourceStore {
    pub fn new(kind: ResourceKind) -> Self {
        Self { kind, items: RwLock::new(FxHashMap::default()) }
    }

    pub fn kind(&self) -> ResourceKind { self.kind }

    /// Insert or overwrite; returns the snapshot previously stored under `key`.
    pub fn put(&self, key: ObjectKey, snapshot: ResourceSnapshot) -> Option<ResourceSnapshot> {
        let (prev, len) = {
            let mut items = self.items.write();
            let prev = items.insert(key, snapshot);
            (prev, items.len())
        };
        self.record(len);
        prev
    }

    /// Remove if present; a missing key is a no-op that still returns `None`.
    pub fn remove(&self, key: &ObjectKey) -> Option<ResourceSnapshot> {
        let (prev, len) = {
            let mut items = self.items.write();
            let prev = items.remove(key);
            (prev, items.len())
        };
        if prev.is_some() {
            self.record(len);
        }
        prev
    }

    /// Replace the whole content, as after a full list. Nameless objects are skipped.
    pub fn replace<I>(&self, snapshots: I)
    where
        I: IntoIterator<Item = ResourceSnapshot>,
    {
        let mut next = FxHashMap::default();
        for s in snapshots {
            match ObjectKey::of(&s) {
                Some(key) => {
                    next.insert(key, s);
                }
                None => debug!(kind = %self.kind, "skipping nameless object in list"),
            }
        }
        let len = next.len();
        *self.items.write() = next;
        self.record(len);
    }

    pub fn get(&self, key: &ObjectKey) -> Option<ResourceSnapshot> { self.items.read().get(key).cloned() }

    /// Point-in-time copy of every entry, ordered by identity.
    pub fn list(&self) -> Vec<(ObjectKey, ResourceSnapshot)> {
        let mut out: Vec<_> = self.items.read().iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn len(&self) -> usize { self.items.read().len() }

    pub fn is_empty(&self) -> bool { self.items.read().is_empty() }

    fn record(&self, len: usize) {
        metrics::gauge!("store_objects", len as f64, "kind" => self.kind.plural());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Pod;

    fn pod(name: &str, rv: &str) -> ResourceSnapshot {
        let mut p = Pod::default();
        p.metadata.name = Some(name.to_string());
        p.metadata.namespace = Some("default".to_string());
        p.metadata.resource_version = Some(rv.to_string());
        p.into()
    }

    fn key(name: &str) -> ObjectKey { ObjectKey::new(ResourceKind::Pods, Some("default"), name) }

    #[test]
    fn put_returns_previous_snapshot() {
        let store = ResourceStore::new(ResourceKind::Pods);
        assert!(store.put(key("a"), pod("a", "1")).is_none());
        let prev = store.put(key("a"), pod("a", "2")).expect("previous");
        assert_eq!(prev.resource_version(), Some("1"));
        assert_eq!(store.get(&key("a")).and_then(|s| s.resource_version().map(str::to_string)), Some("2".into()));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn remove_missing_is_noop() {
        let store = ResourceStore::new(ResourceKind::Pods);
        store.put(key("a"), pod("a", "1"));
        assert!(store.remove(&key("b")).is_none());
        assert_eq!(store.len(), 1);
        assert!(store.remove(&key("a")).is_some());
        assert!(store.remove(&key("a")).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn replace_drops_everything_not_relisted() {
        let store = ResourceStore::new(ResourceKind::Pods);
        store.put(key("a"), pod("a", "1"));
        store.put(key("b"), pod("b", "1"));
        store.replace(vec![pod("b", "5"), pod("c", "5")]);
        let names: Vec<_> = store.list().into_iter().map(|(k, _)| k.name).collect();
        assert_eq!(names, vec!["b", "c"]);
        assert_eq!(store.get(&key("b")).and_then(|s| s.resource_version().map(str::to_string)), Some("5".into()));
    }
}
