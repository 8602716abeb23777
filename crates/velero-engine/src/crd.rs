//! Velero resource types
//!
//! Typed structs for the Velero custom resources the engine creates and
//! reads (Backup, Restore). These implement `HasResourceKind` so the gateway
//! addresses them the same way it addresses built-in kinds.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

use velero_common::kube_utils::{HasResourceKind, ResourceKind};

/// Phase Velero reports for a successful backup or restore
pub const PHASE_COMPLETED: &str = "Completed";
/// Terminal failure phases for backups and restores
pub const FAILED_PHASES: &[&str] = &["Failed", "PartiallyFailed"];
/// Phase of a usable BackupStorageLocation
pub const PHASE_AVAILABLE: &str = "Available";

/// Outcome of one look at a backup or restore phase
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PhaseOutcome {
    /// Finished successfully
    Completed,
    /// Finished unsuccessfully
    Failed(String),
    /// No phase yet, or still running
    InProgress(Option<String>),
}

impl PhaseOutcome {
    /// Classify a reported phase
    pub fn from_phase(phase: Option<&str>) -> Self {
        match phase {
            Some(PHASE_COMPLETED) => Self::Completed,
            Some(p) if FAILED_PHASES.contains(&p) => Self::Failed(p.to_string()),
            other => Self::InProgress(other.map(str::to_string)),
        }
    }
}

/// Status subresource shared by Backup and Restore
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperationStatus {
    /// Current phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// RFC 3339 start time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<String>,
    /// RFC 3339 completion time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_timestamp: Option<String>,
}

// =============================================================================
// Backup
// =============================================================================

/// Velero Backup resource
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Backup {
    /// API version
    #[serde(default = "Backup::default_api_version")]
    pub api_version: String,
    /// Resource kind
    #[serde(default = "Backup::default_kind")]
    pub kind: String,
    /// Resource metadata
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Backup specification
    #[serde(default)]
    pub spec: BackupTemplate,
    /// Backup status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<OperationStatus>,
}

impl HasResourceKind for Backup {
    const RESOURCE_KIND: ResourceKind = ResourceKind::BACKUP;
}

impl Backup {
    fn default_api_version() -> String {
        Self::RESOURCE_KIND.api_version()
    }
    fn default_kind() -> String {
        Self::RESOURCE_KIND.kind.to_string()
    }

    /// Create a Backup whose name is generated by the server from `name_prefix`
    pub fn generated(
        name_prefix: impl Into<String>,
        namespace: impl Into<String>,
        spec: BackupTemplate,
    ) -> Self {
        Self {
            api_version: Self::default_api_version(),
            kind: Self::default_kind(),
            metadata: ObjectMeta {
                generate_name: Some(name_prefix.into()),
                namespace: Some(namespace.into()),
                ..Default::default()
            },
            spec,
            status: None,
        }
    }
}

/// Backup spec
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupTemplate {
    /// Storage location name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_location: Option<String>,
    /// Volume snapshot location names
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_snapshot_locations: Vec<String>,
    /// Included namespaces
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included_namespaces: Vec<String>,
    /// Excluded namespaces
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_namespaces: Vec<String>,
    /// Included resources
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included_resources: Vec<String>,
    /// Excluded resources
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_resources: Vec<String>,
    /// TTL for the backup (e.g. "720h0m0s")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
    /// Whether to include cluster-scoped resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_cluster_resources: Option<bool>,
    /// Label selector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<LabelSelector>,
    /// Default volumes to file-system backup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_volumes_to_fs_backup: Option<bool>,
}

/// Label selector for backup filtering
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    /// Match labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
}

// =============================================================================
// Restore
// =============================================================================

/// What a restore does with objects that already exist in the cluster
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExistingResourcePolicy {
    /// Leave existing objects untouched
    #[default]
    None,
    /// Update existing objects from the backup
    Update,
}

/// Velero Restore resource
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Restore {
    /// API version
    #[serde(default = "Restore::default_api_version")]
    pub api_version: String,
    /// Resource kind
    #[serde(default = "Restore::default_kind")]
    pub kind: String,
    /// Resource metadata
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Restore specification
    pub spec: RestoreSpec,
    /// Restore status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<OperationStatus>,
}

impl HasResourceKind for Restore {
    const RESOURCE_KIND: ResourceKind = ResourceKind::RESTORE;
}

impl Restore {
    fn default_api_version() -> String {
        Self::RESOURCE_KIND.api_version()
    }
    fn default_kind() -> String {
        Self::RESOURCE_KIND.kind.to_string()
    }

    /// Create a Restore of `backup_name`, named by the server after the backup
    pub fn from_backup(
        backup_name: impl Into<String>,
        namespace: impl Into<String>,
        existing_resource_policy: ExistingResourcePolicy,
    ) -> Self {
        let backup_name = backup_name.into();
        Self {
            api_version: Self::default_api_version(),
            kind: Self::default_kind(),
            metadata: ObjectMeta {
                generate_name: Some(backup_name.clone()),
                namespace: Some(namespace.into()),
                ..Default::default()
            },
            spec: RestoreSpec {
                backup_name,
                existing_resource_policy: Some(existing_resource_policy),
            },
            status: None,
        }
    }
}

/// Restore spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSpec {
    /// Name of the Velero Backup to restore from
    pub backup_name: String,
    /// Policy for objects that already exist
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_resource_policy: Option<ExistingResourcePolicy>,
}
