//! kubelive core types: resource kinds, identities and typed snapshots.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

pub mod event;
pub mod wire;

pub use event::{normalize, Change, ChangeEvent, ChangeType, RawChange};
pub use wire::{decode_envelope, encode_event, encode_synced, WireError};

/// The only namespace this service operates on.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Fixed set of resource kinds known to kubelive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Pods,
    Deployments,
    Services,
    ConfigMaps,
    Secrets,
    ReplicaSets,
    DaemonSets,
}

impl ResourceKind {
    /// Kinds that get a list-watch driver.
    pub const WATCHED: [ResourceKind; 6] = [
        ResourceKind::Pods,
        ResourceKind::Deployments,
        ResourceKind::Services,
        ResourceKind::ConfigMaps,
        ResourceKind::Secrets,
        ResourceKind::ReplicaSets,
    ];

    pub const ALL: [ResourceKind; 7] = [
        ResourceKind::Pods,
        ResourceKind::Deployments,
        ResourceKind::Services,
        ResourceKind::ConfigMaps,
        ResourceKind::Secrets,
        ResourceKind::ReplicaSets,
        ResourceKind::DaemonSets,
    ];

    /// Plural name used in wire type tags, logs and metric labels.
    pub fn plural(self) -> &'static str {
        match self {
            ResourceKind::Pods => "pods",
            ResourceKind::Deployments => "deployments",
            ResourceKind::Services => "services",
            ResourceKind::ConfigMaps => "configmaps",
            ResourceKind::Secrets => "secrets",
            ResourceKind::ReplicaSets => "replicasets",
            ResourceKind::DaemonSets => "daemonsets",
        }
    }

    pub fn is_watched(self) -> bool { Self::WATCHED.contains(&self) }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.plural()) }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown resource kind: {0}")]
pub struct UnknownKind(pub String);

impl FromStr for ResourceKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceKind::ALL
            .iter()
            .copied()
            .find(|k| k.plural() == s)
            .ok_or_else(|| UnknownKind(s.to_string()))
    }
}

/// Stable identity of one object: (kind, namespace, name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub kind: ResourceKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: ResourceKind, namespace: Option<&str>, name: &str) -> Self {
        Self { kind, namespace: namespace.map(str::to_string), name: name.to_string() }
    }

    /// Identity of a snapshot; `None` when the object carries no name.
    pub fn of(snapshot: &ResourceSnapshot) -> Option<Self> {
        let meta = snapshot.metadata();
        let name = meta.name.as_deref()?;
        Some(Self::new(snapshot.kind(), meta.namespace.as_deref(), name))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// Full current representation of one object, one variant per kind.
///
/// Serializes as the raw object. Decoding needs the kind, see [`ResourceSnapshot::from_value`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResourceSnapshot {
    Pod(Pod),
    Deployment(Deployment),
    Service(Service),
    ConfigMap(ConfigMap),
    Secret(Secret),
    ReplicaSet(ReplicaSet),
    DaemonSet(DaemonSet),
}

impl ResourceSnapshot {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceSnapshot::Pod(_) => ResourceKind::Pods,
            ResourceSnapshot::Deployment(_) => ResourceKind::Deployments,
            ResourceSnapshot::Service(_) => ResourceKind::Services,
            ResourceSnapshot::ConfigMap(_) => ResourceKind::ConfigMaps,
            ResourceSnapshot::Secret(_) => ResourceKind::Secrets,
            ResourceSnapshot::ReplicaSet(_) => ResourceKind::ReplicaSets,
            ResourceSnapshot::DaemonSet(_) => ResourceKind::DaemonSets,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            ResourceSnapshot::Pod(o) => &o.metadata,
            ResourceSnapshot::Deployment(o) => &o.metadata,
            ResourceSnapshot::Service(o) => &o.metadata,
            ResourceSnapshot::ConfigMap(o) => &o.metadata,
            ResourceSnapshot::Secret(o) => &o.metadata,
            ResourceSnapshot::ReplicaSet(o) => &o.metadata,
            ResourceSnapshot::DaemonSet(o) => &o.metadata,
        }
    }

    pub fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            ResourceSnapshot::Pod(o) => &mut o.metadata,
            ResourceSnapshot::Deployment(o) => &mut o.metadata,
            ResourceSnapshot::Service(o) => &mut o.metadata,
            ResourceSnapshot::ConfigMap(o) => &mut o.metadata,
            ResourceSnapshot::Secret(o) => &mut o.metadata,
            ResourceSnapshot::ReplicaSet(o) => &mut o.metadata,
            ResourceSnapshot::DaemonSet(o) => &mut o.metadata,
        }
    }

    /// Drop `metadata.managedFields`; large and of no use to live viewers.
    pub fn strip_managed_fields(&mut self) { self.metadata_mut().managed_fields = None; }

    pub fn name(&self) -> Option<&str> { self.metadata().name.as_deref() }

    pub fn resource_version(&self) -> Option<&str> { self.metadata().resource_version.as_deref() }

    /// Decode a raw object of a known kind.
    pub fn from_value(kind: ResourceKind, value: serde_json::Value) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            ResourceKind::Pods => ResourceSnapshot::Pod(serde_json::from_value(value)?),
            ResourceKind::Deployments => ResourceSnapshot::Deployment(serde_json::from_value(value)?),
            ResourceKind::Services => ResourceSnapshot::Service(serde_json::from_value(value)?),
            ResourceKind::ConfigMaps => ResourceSnapshot::ConfigMap(serde_json::from_value(value)?),
            ResourceKind::Secrets => ResourceSnapshot::Secret(serde_json::from_value(value)?),
            ResourceKind::ReplicaSets => ResourceSnapshot::ReplicaSet(serde_json::from_value(value)?),
            ResourceKind::DaemonSets => ResourceSnapshot::DaemonSet(serde_json::from_value(value)?),
        })
    }
}

macro_rules! impl_snapshot_from {
    ($($ty:ident),* $(,)?) => {
        $(impl From<$ty> for ResourceSnapshot {
            fn from(o: $ty) -> Self { ResourceSnapshot::$ty(o) }
        })*
    };
}

impl_snapshot_from!(Pod, Deployment, Service, ConfigMap, Secret, ReplicaSet, DaemonSet);

/// Receiver of normalized events. The broadcast hub implements this; drivers only see the trait.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: ChangeEvent);

    /// Called after every successful full list of `kind`. Default: nothing is announced.
    fn synced(&self, _kind: ResourceKind, _items: &[ResourceSnapshot]) {}
}

impl<T: EventSink + ?Sized> EventSink for std::sync::Arc<T> {
    fn publish(&self, event: ChangeEvent) { (**self).publish(event) }
    fn synced(&self, kind: ResourceKind, items: &[ResourceSnapshot]) { (**self).synced(kind, items) }
}

pub mod prelude {
    pub use super::{
        Change, ChangeEvent, ChangeType, EventSink, ObjectKey, RawChange, ResourceKind, ResourceSnapshot,
        DEFAULT_NAMESPACE,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(ns: Option<&str>, name: Option<&str>) -> ResourceSnapshot {
        let mut p = Pod::default();
        p.metadata.namespace = ns.map(str::to_string);
        p.metadata.name = name.map(str::to_string);
        p.into()
    }

    #[test]
    fn plural_names_round_trip_through_from_str() {
        for k in ResourceKind::ALL {
            assert_eq!(k.plural().parse::<ResourceKind>().expect("known kind"), k);
        }
        assert!("deamonsets".parse::<ResourceKind>().is_err());
    }

    #[test]
    fn daemonsets_are_not_watched() {
        assert!(!ResourceKind::DaemonSets.is_watched());
        assert!(ResourceKind::WATCHED.iter().all(|k| k.is_watched()));
    }

    #[test]
    fn key_requires_a_name() {
        assert!(ObjectKey::of(&pod(Some("default"), None)).is_none());
        let key = ObjectKey::of(&pod(Some("default"), Some("a"))).expect("named");
        assert_eq!(key, ObjectKey::new(ResourceKind::Pods, Some("default"), "a"));
        assert_eq!(key.to_string(), "pods/default/a");
    }

    #[test]
    fn snapshot_serializes_as_raw_object() {
        let v = serde_json::to_value(pod(Some("default"), Some("a"))).expect("serialize");
        assert_eq!(v["metadata"]["name"], "a");
        assert_eq!(v["kind"], "Pod");
        let back = ResourceSnapshot::from_value(ResourceKind::Pods, v).expect("decode");
        assert_eq!(back.name(), Some("a"));
        assert_eq!(back.kind(), ResourceKind::Pods);
    }
}
