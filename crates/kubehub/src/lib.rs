//! kubelive kubehub: the cluster API seam and the per-kind list-watch drivers.

#![forbid(unsafe_code)]

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::autoscaling::v1::Scale;
use kubelive_core::{ResourceKind, ResourceSnapshot};

pub mod backoff;
pub mod client;
pub mod driver;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use backoff::Backoff;
pub use client::KubeClient;
pub use driver::{spawn_driver, DriverHandle, DriverSet, DriverState, ListWatch, WatchConfig};

/// Opaque resume position (the API server's resourceVersion).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatchCursor(String);

impl WatchCursor {
    pub fn new(v: impl Into<String>) -> Self { Self(v.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for WatchCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// Result of a full list: every object plus the cursor to watch from.
#[derive(Debug, Clone)]
pub struct ListPage {
    pub items: Vec<ResourceSnapshot>,
    pub cursor: WatchCursor,
}

/// One notification from a watch stream.
#[derive(Debug, Clone)]
pub enum WatchDelta {
    Added(ResourceSnapshot),
    Modified(ResourceSnapshot),
    Deleted(ResourceSnapshot),
    /// Progress marker without an object change.
    Bookmark(WatchCursor),
}

impl WatchDelta {
    /// Cursor position after this delta, if it carries one.
    pub fn cursor(&self) -> Option<WatchCursor> {
        match self {
            WatchDelta::Added(o) | WatchDelta::Modified(o) | WatchDelta::Deleted(o) => {
                o.resource_version().map(WatchCursor::new)
            }
            WatchDelta::Bookmark(c) => Some(c.clone()),
        }
    }
}

pub type DeltaStream = BoxStream<'static, Result<WatchDelta, ClusterError>>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ClusterError {
    /// The watch cursor is too old; a full relist is required.
    #[error("watch cursor expired: {0}")]
    CursorExpired(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("api error {code}: {message}")]
    Api { code: u16, message: String },
    #[error("transport: {0}")]
    Transport(String),
    #[error("decode: {0}")]
    Decode(String),
}

impl ClusterError {
    /// Classify an API status (as carried by HTTP errors and in-stream watch errors).
    pub fn from_status(code: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            410 => ClusterError::CursorExpired(message),
            409 => ClusterError::Conflict(message),
            404 => ClusterError::NotFound(message),
            _ => ClusterError::Api { code, message },
        }
    }
}

impl From<kube::Error> for ClusterError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) => ClusterError::from_status(ae.code, ae.message),
            kube::Error::SerdeError(e) => ClusterError::Decode(e.to_string()),
            other => ClusterError::Transport(other.to_string()),
        }
    }
}

/// The primitives kubelive needs from the control plane, scoped to one namespace.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    fn namespace(&self) -> &str;

    async fn list(&self, kind: ResourceKind) -> Result<ListPage, ClusterError>;

    /// Open a watch positioned after `from`. Stream end and cursor expiry are distinct signals:
    /// the stream returning `None` vs. yielding `ClusterError::CursorExpired`.
    async fn watch(&self, kind: ResourceKind, from: &WatchCursor) -> Result<DeltaStream, ClusterError>;

    async fn get_scale(&self, deployment: &str) -> Result<Scale, ClusterError>;

    /// Submit `scale` as-is; its resourceVersion makes this an optimistic-concurrency write.
    async fn replace_scale(&self, deployment: &str, scale: &Scale) -> Result<Scale, ClusterError>;

    async fn delete_pod(&self, name: &str) -> Result<(), ClusterError>;
}
