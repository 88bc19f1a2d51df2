//! kubelive ops: imperative operations against the operating namespace.
//!
//! Scaling is a single read-modify-write of the deployment's scale subresource. The write
//! carries the resourceVersion that was read, so a concurrent writer makes it fail with a
//! conflict; nothing here retries.

#![forbid(unsafe_code)]

use std::sync::Arc;

use k8s_openapi::api::autoscaling::v1::{Scale, ScaleSpec};
use kubelive_kubehub::{ClusterClient, ClusterError};
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum OpsError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// Imperative ops trait.
#[async_trait::async_trait]
pub trait LiveOps: Send + Sync {
    /// Set `spec.replicas` of a deployment's scale subresource and return the stored result.
    async fn scale_deployment(&self, name: &str, replicas: i32) -> Result<Scale, OpsError>;

    async fn delete_pod(&self, name: &str) -> Result<(), OpsError>;
}

/// Default implementation over a shared cluster client.
#[derive(Clone)]
pub struct ClusterOps {
    client: Arc<dyn ClusterClient>,
}

impl ClusterOps {
    pub fn new(client: Arc<dyn ClusterClient>) -> Self { Self { client } }
}

#[async_trait::async_trait]
impl LiveOps for ClusterOps {
    async fn scale_deployment(&self, name: &str, replicas: i32) -> Result<Scale, OpsError> {
        if replicas < 0 {
            return Err(OpsError::Validation(format!("replicas must be >= 0 (got {replicas})")));
        }
        let mut scale = self.client.get_scale(name).await?;
        let from = scale.spec.as_ref().and_then(|s| s.replicas);
        let rv = scale.metadata.resource_version.clone();
        scale.spec.get_or_insert_with(ScaleSpec::default).replicas = Some(replicas);
        match self.client.replace_scale(name, &scale).await {
            Ok(updated) => {
                info!(ns = %self.client.namespace(), deployment = %name, ?from, to = replicas, "scaled");
                Ok(updated)
            }
            Err(e) => {
                warn!(ns = %self.client.namespace(), deployment = %name, rv = ?rv, error = %e, "scale rejected");
                Err(e.into())
            }
        }
    }

    async fn delete_pod(&self, name: &str) -> Result<(), OpsError> {
        self.client.delete_pod(name).await?;
        info!(ns = %self.client.namespace(), pod = %name, "pod deleted");
        Ok(())
    }
}
