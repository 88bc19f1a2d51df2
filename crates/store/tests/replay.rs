#![forbid(unsafe_code)]

use k8s_openapi::api::core::v1::Pod;
use kubelive_core::{ObjectKey, ResourceKind, ResourceSnapshot};
use kubelive_store::ResourceStore;

fn obj(name: &str, label: &str) -> ResourceSnapshot {
    let mut p = Pod::default();
    p.metadata.name = Some(name.to_string());
    p.metadata.namespace = Some("ns".to_string());
    p.metadata.labels = Some([("v".to_string(), label.to_string())].into_iter().collect());
    p.into()
}

fn key(name: &str) -> ObjectKey { ObjectKey::new(ResourceKind::Pods, Some("ns"), name) }

fn label(store: &ResourceStore, name: &str) -> Option<String> {
    store.get(&key(name)).and_then(|s| s.metadata().labels.as_ref()?.get("v").cloned())
}

#[test]
fn replay_basic_sequence() {
    let store = ResourceStore::new(ResourceKind::Pods);

    // add a
    store.put(key("a"), obj("a", "1"));
    // duplicate add overwrites to the same value
    store.put(key("a"), obj("a", "1"));
    assert_eq!(store.len(), 1);
    assert_eq!(label(&store, "a").as_deref(), Some("1"));

    // add b, update a, delete b
    store.put(key("b"), obj("b", "1"));
    store.put(key("a"), obj("a", "2"));
    store.remove(&key("b"));
    // delete-after-delete is a no-op
    store.remove(&key("b"));

    let listed = store.list();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].0.name, "a");
    assert_eq!(label(&store, "a").as_deref(), Some("2"));
}

#[test]
fn list_is_a_point_in_time_copy() {
    let store = ResourceStore::new(ResourceKind::Pods);
    store.put(key("a"), obj("a", "1"));
    let before = store.list();
    store.put(key("a"), obj("a", "2"));
    store.remove(&key("a"));
    assert_eq!(before.len(), 1);
    assert_eq!(before[0].1.metadata().labels.as_ref().and_then(|l| l.get("v")).map(String::as_str), Some("1"));
    assert!(store.is_empty());
}

#[test]
fn concurrent_readers_see_consistent_copies() {
    use std::sync::Arc;
    let store = Arc::new(ResourceStore::new(ResourceKind::Pods));
    let writer = {
        let store = Arc::clone(&store);
        std::thread::spawn(move || {
            for i in 0..500 {
                let name = format!("p{}", i % 20);
                if i % 3 == 0 {
                    store.remove(&key(&name));
                } else {
                    store.put(key(&name), obj(&name, &i.to_string()));
                }
            }
        })
    };
    for _ in 0..200 {
        let snap = store.list();
        assert!(snap.len() <= 20);
        assert!(snap.iter().all(|(k, v)| v.name() == Some(k.name.as_str())));
    }
    writer.join().expect("writer thread");
}
