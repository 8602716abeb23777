//! Shared Kubernetes utilities using kube-rs
//!
//! Every object the engine manages is addressed through a [`ResourceKind`]
//! (a static group/version/kind/plural/scope record) and accessed as a
//! `DynamicObject`, so built-in kinds and Velero's custom resources go through
//! the same code path.
//!
//! The [`KubeApi`] trait is the mockable seam over the API server. It performs
//! raw calls and surfaces not-found as a 404 [`Error::ClusterApi`]; the
//! idempotency rules live one layer up in
//! [`ClusterResourceGateway`](crate::gateway::ClusterResourceGateway).

use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DeploymentCondition;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::core::GroupVersionKind;
use kube::discovery::ApiResource;
use kube::Client;
use serde_json::Value;
use tracing::trace;

#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;

use crate::Error;

// =============================================================================
// Resource kinds
// =============================================================================

/// Whether a kind lives inside a namespace or at cluster scope
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceScope {
    /// Namespaced resource (Deployment, Secret, BackupStorageLocation, ...)
    Namespaced,
    /// Cluster-scoped resource (ClusterRoleBinding, CustomResourceDefinition)
    Cluster,
}

/// Static description of a Kubernetes resource kind.
///
/// Carries everything needed to build an `ApiResource` without API discovery.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ResourceKind {
    /// API group ("" for the core group)
    pub group: &'static str,
    /// API version within the group
    pub version: &'static str,
    /// Kind name
    pub kind: &'static str,
    /// Lowercase plural used in REST paths
    pub plural: &'static str,
    /// Scope of objects of this kind
    pub scope: ResourceScope,
}

impl ResourceKind {
    /// apps/v1 Deployment
    pub const DEPLOYMENT: Self = Self::namespaced("apps", "v1", "Deployment", "deployments");
    /// apps/v1 DaemonSet
    pub const DAEMON_SET: Self = Self::namespaced("apps", "v1", "DaemonSet", "daemonsets");
    /// v1 Pod
    pub const POD: Self = Self::namespaced("", "v1", "Pod", "pods");
    /// v1 ServiceAccount
    pub const SERVICE_ACCOUNT: Self =
        Self::namespaced("", "v1", "ServiceAccount", "serviceaccounts");
    /// v1 Service
    pub const SERVICE: Self = Self::namespaced("", "v1", "Service", "services");
    /// v1 Secret
    pub const SECRET: Self = Self::namespaced("", "v1", "Secret", "secrets");
    /// rbac.authorization.k8s.io/v1 ClusterRoleBinding
    pub const CLUSTER_ROLE_BINDING: Self = Self::cluster(
        "rbac.authorization.k8s.io",
        "v1",
        "ClusterRoleBinding",
        "clusterrolebindings",
    );
    /// apiextensions.k8s.io/v1 CustomResourceDefinition
    pub const CUSTOM_RESOURCE_DEFINITION: Self = Self::cluster(
        "apiextensions.k8s.io",
        "v1",
        "CustomResourceDefinition",
        "customresourcedefinitions",
    );
    /// velero.io/v1 BackupStorageLocation
    pub const BACKUP_STORAGE_LOCATION: Self = Self::namespaced(
        "velero.io",
        "v1",
        "BackupStorageLocation",
        "backupstoragelocations",
    );
    /// velero.io/v1 VolumeSnapshotLocation
    pub const VOLUME_SNAPSHOT_LOCATION: Self = Self::namespaced(
        "velero.io",
        "v1",
        "VolumeSnapshotLocation",
        "volumesnapshotlocations",
    );
    /// velero.io/v1 Backup
    pub const BACKUP: Self = Self::namespaced("velero.io", "v1", "Backup", "backups");
    /// velero.io/v1 Restore
    pub const RESTORE: Self = Self::namespaced("velero.io", "v1", "Restore", "restores");

    const fn namespaced(
        group: &'static str,
        version: &'static str,
        kind: &'static str,
        plural: &'static str,
    ) -> Self {
        Self {
            group,
            version,
            kind,
            plural,
            scope: ResourceScope::Namespaced,
        }
    }

    const fn cluster(
        group: &'static str,
        version: &'static str,
        kind: &'static str,
        plural: &'static str,
    ) -> Self {
        Self {
            group,
            version,
            kind,
            plural,
            scope: ResourceScope::Cluster,
        }
    }

    /// Full apiVersion string ("apps/v1", or "v1" for the core group)
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.to_string()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Build the `ApiResource` used for `DynamicObject` access
    pub fn api_resource(&self) -> ApiResource {
        ApiResource::from_gvk_with_plural(
            &GroupVersionKind::gvk(self.group, self.version, self.kind),
            self.plural,
        )
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind)
    }
}

/// Trait for typed resources whose kind is known at compile time.
///
/// # Example
/// ```ignore
/// impl HasResourceKind for Backup {
///     const RESOURCE_KIND: ResourceKind = ResourceKind::BACKUP;
/// }
/// ```
pub trait HasResourceKind {
    /// The kind this type serializes as
    const RESOURCE_KIND: ResourceKind;
}

/// Identifies one manageable cluster object.
///
/// The scope tag is copied from the kind at construction and is the only
/// thing consulted when choosing a namespaced or cluster-wide API.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceDescriptor {
    name: String,
    kind: ResourceKind,
    scope: ResourceScope,
}

impl ResourceDescriptor {
    /// Describe the object `name` of the given kind
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            scope: kind.scope,
        }
    }

    /// Object name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Object kind
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Object scope
    pub fn scope(&self) -> ResourceScope {
        self.scope
    }
}

impl fmt::Display for ResourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind.kind.to_lowercase(), self.name)
    }
}

// =============================================================================
// Conditions
// =============================================================================

/// The "Available" condition type for deployments
pub const CONDITION_AVAILABLE: &str = "Available";
/// The "True" status value for conditions
pub const STATUS_TRUE: &str = "True";

/// Trait for types that have condition-like fields (type and status)
pub trait HasConditionFields {
    /// Get the condition type field value
    fn type_field(&self) -> &str;
    /// Get the condition status field value
    fn status_field(&self) -> &str;
}

impl HasConditionFields for DeploymentCondition {
    fn type_field(&self) -> &str {
        &self.type_
    }
    fn status_field(&self) -> &str {
        &self.status
    }
}

/// Find the condition of the given type
pub fn find_condition<'a, T>(conditions: Option<&'a [T]>, condition_type: &str) -> Option<&'a T>
where
    T: HasConditionFields,
{
    conditions?
        .iter()
        .find(|c| c.type_field() == condition_type)
}

/// Check if a Kubernetes condition of the given type has status "True"
pub fn has_condition<T>(conditions: Option<&[T]>, condition_type: &str) -> bool
where
    T: HasConditionFields,
{
    find_condition(conditions, condition_type)
        .map(|c| c.status_field() == STATUS_TRUE)
        .unwrap_or(false)
}

// =============================================================================
// KubeApi
// =============================================================================

/// Patch strategies supported by [`KubeApi::patch`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatchKind {
    /// Kubernetes strategic merge patch
    Strategic,
    /// RFC 7386 JSON merge patch
    Merge,
    /// RFC 6902 JSON patch; the body must be an array of operations
    Json,
}

/// Trait abstracting the Kubernetes API server
///
/// This trait allows mocking the cluster in tests while using the real
/// client in production. Objects travel as JSON values; not-found is reported
/// as `Error::ClusterApi` with code 404. For cluster-scoped kinds the
/// namespace argument is ignored.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait KubeApi: Send + Sync {
    /// Fetch one object
    async fn get(&self, descriptor: &ResourceDescriptor, namespace: &str) -> Result<Value, Error>;

    /// List objects of a kind, optionally filtered by a label selector
    async fn list(
        &self,
        kind: ResourceKind,
        namespace: &str,
        label_selector: Option<String>,
    ) -> Result<Vec<Value>, Error>;

    /// Create an object, returning what the server stored
    async fn create(&self, kind: ResourceKind, namespace: &str, object: Value)
        -> Result<Value, Error>;

    /// Delete one object
    async fn delete(&self, descriptor: &ResourceDescriptor, namespace: &str) -> Result<(), Error>;

    /// Patch one object
    async fn patch(
        &self,
        descriptor: &ResourceDescriptor,
        namespace: &str,
        body: Value,
        patch_kind: PatchKind,
    ) -> Result<(), Error>;

    /// Server-side apply an object (name taken from `metadata.name`)
    async fn apply(&self, kind: ResourceKind, namespace: &str, object: Value) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClient {
    client: Client,
    field_manager: String,
}

impl KubeClient {
    /// Wrap a kube client; `field_manager` owns server-side applied fields
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn api(&self, kind: ResourceKind, scope: ResourceScope, namespace: &str) -> Api<DynamicObject> {
        let ar = kind.api_resource();
        match scope {
            ResourceScope::Namespaced => Api::namespaced_with(self.client.clone(), namespace, &ar),
            ResourceScope::Cluster => Api::all_with(self.client.clone(), &ar),
        }
    }

    fn api_for(&self, descriptor: &ResourceDescriptor, namespace: &str) -> Api<DynamicObject> {
        self.api(descriptor.kind(), descriptor.scope(), namespace)
    }
}

#[async_trait]
impl KubeApi for KubeClient {
    async fn get(&self, descriptor: &ResourceDescriptor, namespace: &str) -> Result<Value, Error> {
        trace!(resource = %descriptor, namespace = %namespace, "get");
        let obj = self.api_for(descriptor, namespace).get(descriptor.name()).await?;
        Ok(serde_json::to_value(obj)?)
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: &str,
        label_selector: Option<String>,
    ) -> Result<Vec<Value>, Error> {
        let mut params = ListParams::default();
        if let Some(selector) = label_selector.as_deref() {
            params = params.labels(selector);
        }
        let list = self.api(kind, kind.scope, namespace).list(&params).await?;
        list.items
            .into_iter()
            .map(|obj| serde_json::to_value(obj).map_err(Error::from))
            .collect()
    }

    async fn create(
        &self,
        kind: ResourceKind,
        namespace: &str,
        object: Value,
    ) -> Result<Value, Error> {
        let obj: DynamicObject = serde_json::from_value(object)?;
        let created = self
            .api(kind, kind.scope, namespace)
            .create(&PostParams::default(), &obj)
            .await?;
        Ok(serde_json::to_value(created)?)
    }

    async fn delete(&self, descriptor: &ResourceDescriptor, namespace: &str) -> Result<(), Error> {
        self.api_for(descriptor, namespace)
            .delete(descriptor.name(), &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn patch(
        &self,
        descriptor: &ResourceDescriptor,
        namespace: &str,
        body: Value,
        patch_kind: PatchKind,
    ) -> Result<(), Error> {
        let patch: Patch<Value> = match patch_kind {
            PatchKind::Strategic => Patch::Strategic(body),
            PatchKind::Merge => Patch::Merge(body),
            PatchKind::Json => Patch::Json(serde_json::from_value::<json_patch::Patch>(body)?),
        };
        self.api_for(descriptor, namespace)
            .patch(descriptor.name(), &PatchParams::default(), &patch)
            .await?;
        Ok(())
    }

    async fn apply(&self, kind: ResourceKind, namespace: &str, object: Value) -> Result<(), Error> {
        let name = object
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::invalid_argument(format!("{} manifest has no metadata.name", kind))
            })?
            .to_string();
        let params = PatchParams::apply(&self.field_manager).force();
        self.api(kind, kind.scope, namespace)
            .patch(&name, &params, &Patch::Apply(&object))
            .await?;
        Ok(())
    }
}
