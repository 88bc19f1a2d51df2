//! kubelive public API facade (in-process).
//!
//! Query and mutation calls the HTTP layer depends on. Reads go straight to the cluster on
//! every call and never consult the watch stores.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use k8s_openapi::api::autoscaling::v1::{Scale, ScaleSpec};
use kubelive_core::{ResourceKind, ResourceSnapshot};
use kubelive_kubehub::{ClusterClient, ClusterError};
use kubelive_ops::{ClusterOps, LiveOps, OpsError};
use metrics::histogram;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// API errors, shaped for transport to HTTP clients.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ApiError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    /// The cluster API failed or could not be reached.
    #[error("cluster: {0}")]
    Cluster(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl ApiError {
    /// Short machine-readable tag.
    pub fn tag(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "validation",
            ApiError::NotFound(_) => "not_found",
            ApiError::Conflict(_) => "conflict",
            ApiError::Cluster(_) => "cluster",
            ApiError::Internal(_) => "internal",
        }
    }
}

impl From<ClusterError> for ApiError {
    fn from(e: ClusterError) -> Self {
        match e {
            ClusterError::Conflict(m) => ApiError::Conflict(m),
            ClusterError::NotFound(m) => ApiError::NotFound(m),
            ClusterError::Api { code: 400 | 422, message } => ApiError::Validation(message),
            other => ApiError::Cluster(other.to_string()),
        }
    }
}

impl From<OpsError> for ApiError {
    fn from(e: OpsError) -> Self {
        match e {
            OpsError::Validation(m) => ApiError::Validation(m),
            OpsError::Cluster(c) => c.into(),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Query/mutation surface.
#[async_trait::async_trait]
pub trait LiveApi: Send + Sync {
    /// Fresh list of every object of `kind` in the operating namespace.
    async fn list(&self, kind: ResourceKind) -> ApiResult<Vec<ResourceSnapshot>>;

    /// Optimistic-concurrency scale of a deployment; returns the stored scale object.
    async fn scale_deployment(&self, name: &str, replicas: i32) -> ApiResult<Scale>;

    async fn delete_pod(&self, name: &str) -> ApiResult<()>;
}

// ----------------- In-process implementation -----------------

/// In-process implementation over the shared cluster client.
pub struct InProcApi {
    client: Arc<dyn ClusterClient>,
    ops: Arc<dyn LiveOps>,
}

impl InProcApi {
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        let ops: Arc<dyn LiveOps> = Arc::new(ClusterOps::new(Arc::clone(&client)));
        Self { client, ops }
    }
}

fn record(op: &'static str, t0: Instant) -> u128 {
    let ms = t0.elapsed().as_millis();
    histogram!("api_request_ms", ms as f64, "op" => op);
    ms
}

#[async_trait::async_trait]
impl LiveApi for InProcApi {
    async fn list(&self, kind: ResourceKind) -> ApiResult<Vec<ResourceSnapshot>> {
        let t0 = Instant::now();
        info!(kind = %kind, ns = %self.client.namespace(), "api: list start");
        match self.client.list(kind).await {
            Ok(page) => {
                info!(kind = %kind, items = page.items.len(), took_ms = %record("list", t0), "api: list ok");
                Ok(page.items)
            }
            Err(e) => {
                warn!(kind = %kind, error = %e, took_ms = %record("list", t0), "api: list failed");
                Err(e.into())
            }
        }
    }

    async fn scale_deployment(&self, name: &str, replicas: i32) -> ApiResult<Scale> {
        let t0 = Instant::now();
        info!(deployment = %name, replicas, "api: scale start");
        let res = self.ops.scale_deployment(name, replicas).await.map_err(ApiError::from);
        info!(deployment = %name, ok = res.is_ok(), took_ms = %record("scale", t0), "api: scale done");
        res
    }

    async fn delete_pod(&self, name: &str) -> ApiResult<()> {
        let t0 = Instant::now();
        let res = self.ops.delete_pod(name).await.map_err(ApiError::from);
        info!(pod = %name, ok = res.is_ok(), took_ms = %record("delete_pod", t0), "api: delete_pod done");
        res
    }
}

// ----------------- Mock implementation -----------------

/// Simple in-memory mock implementation for tests.
#[derive(Default)]
pub struct MockApi {
    pub objects: Mutex<FxHashMap<ResourceKind, Vec<ResourceSnapshot>>>,
    pub scales: Mutex<FxHashMap<String, i32>>,
    pub pods: Mutex<Vec<String>>,
    /// Returned (once) by the next call instead of its normal result.
    pub fail_next: Mutex<Option<ApiError>>,
}

impl MockApi {
    pub fn new() -> Self { Self::default() }

    pub fn with_objects(self, kind: ResourceKind, items: Vec<ResourceSnapshot>) -> Self {
        self.objects.lock().insert(kind, items);
        self
    }

    pub fn with_deployment(self, name: &str, replicas: i32) -> Self {
        self.scales.lock().insert(name.to_string(), replicas);
        self
    }

    pub fn with_pod(self, name: &str) -> Self {
        self.pods.lock().push(name.to_string());
        self
    }

    pub fn fail_next(&self, e: ApiError) { *self.fail_next.lock() = Some(e); }

    fn take_failure(&self) -> ApiResult<()> {
        match self.fail_next.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl LiveApi for MockApi {
    async fn list(&self, kind: ResourceKind) -> ApiResult<Vec<ResourceSnapshot>> {
        self.take_failure()?;
        Ok(self.objects.lock().get(&kind).cloned().unwrap_or_default())
    }

    async fn scale_deployment(&self, name: &str, replicas: i32) -> ApiResult<Scale> {
        self.take_failure()?;
        if replicas < 0 {
            return Err(ApiError::Validation(format!("replicas must be >= 0 (got {replicas})")));
        }
        let mut scales = self.scales.lock();
        let slot = scales.get_mut(name).ok_or_else(|| ApiError::NotFound(format!("deployment {name}")))?;
        *slot = replicas;
        let mut scale = Scale::default();
        scale.metadata.name = Some(name.to_string());
        scale.spec = Some(ScaleSpec { replicas: Some(replicas) });
        Ok(scale)
    }

    async fn delete_pod(&self, name: &str) -> ApiResult<()> {
        self.take_failure()?;
        let mut pods = self.pods.lock();
        let idx = pods.iter().position(|p| p == name).ok_or_else(|| ApiError::NotFound(format!("pod {name}")))?;
        pods.remove(idx);
        Ok(())
    }
}
