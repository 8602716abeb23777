//! Cluster resource gateway
//!
//! Typed existence, create, delete, patch and apply operations with uniform
//! not-found handling. Nothing here retries; callers that need to wait for
//! convergence wrap gateway calls in [`poll_until_ready`](crate::retry::poll_until_ready).

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info};

use crate::kube_utils::{KubeApi, PatchKind, ResourceDescriptor, ResourceKind};
use crate::Error;

/// Idempotent access to cluster objects on top of a [`KubeApi`]
#[derive(Clone)]
pub struct ClusterResourceGateway {
    api: Arc<dyn KubeApi>,
}

impl ClusterResourceGateway {
    /// Create a gateway over the given API implementation
    pub fn new(api: Arc<dyn KubeApi>) -> Self {
        Self { api }
    }

    /// Whether the object exists. Not-found yields `false`; other failures propagate.
    pub async fn exists(
        &self,
        descriptor: &ResourceDescriptor,
        namespace: &str,
    ) -> Result<bool, Error> {
        match self.api.get(descriptor, namespace).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => {
                debug!(resource = %descriptor, namespace = %namespace, "resource not found");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Fetch the object, `None` when it does not exist
    pub async fn get(
        &self,
        descriptor: &ResourceDescriptor,
        namespace: &str,
    ) -> Result<Option<Value>, Error> {
        match self.api.get(descriptor, namespace).await {
            Ok(obj) => Ok(Some(obj)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// List objects of a kind matching an optional label selector
    pub async fn list(
        &self,
        kind: ResourceKind,
        namespace: &str,
        label_selector: Option<&str>,
    ) -> Result<Vec<Value>, Error> {
        self.api
            .list(kind, namespace, label_selector.map(str::to_string))
            .await
    }

    /// Create an object. Conflicts and every other failure propagate.
    pub async fn create(
        &self,
        kind: ResourceKind,
        namespace: &str,
        object: Value,
    ) -> Result<Value, Error> {
        let created = self.api.create(kind, namespace, object).await?;
        debug!(kind = %kind, namespace = %namespace, "resource created");
        Ok(created)
    }

    /// Delete the object. Deleting something that is already gone succeeds.
    pub async fn delete(&self, descriptor: &ResourceDescriptor, namespace: &str) -> Result<(), Error> {
        match self.api.delete(descriptor, namespace).await {
            Ok(()) => {
                info!(resource = %descriptor, namespace = %namespace, "resource deleted");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(resource = %descriptor, namespace = %namespace, "resource already absent");
                Ok(())
            }
            Err(e) => {
                error!(
                    resource = %descriptor,
                    namespace = %namespace,
                    error = %e,
                    "failed to delete resource"
                );
                Err(e)
            }
        }
    }

    /// Patch the object. Not-found is reported to the caller unchanged.
    pub async fn patch(
        &self,
        descriptor: &ResourceDescriptor,
        namespace: &str,
        body: Value,
        patch_kind: PatchKind,
    ) -> Result<(), Error> {
        self.api.patch(descriptor, namespace, body, patch_kind).await
    }

    /// Server-side apply a manifest
    pub async fn apply(&self, kind: ResourceKind, namespace: &str, object: Value) -> Result<(), Error> {
        self.api.apply(kind, namespace, object).await
    }
}
