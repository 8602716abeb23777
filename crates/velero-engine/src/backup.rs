//! On-demand backups and restores
//!
//! Backups always target the default storage and snapshot locations. Both
//! operations block until Velero reports a terminal phase or the operation
//! budget runs out.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::info;

use velero_common::kube_utils::{HasResourceKind, ResourceDescriptor};
use velero_common::retry::poll_until_ready;
use velero_common::Error;

use crate::crd::{
    Backup, BackupTemplate, ExistingResourcePolicy, LabelSelector, OperationStatus, Restore,
};
use crate::readiness;
use crate::resources::{BACKUP_LOCATION_NAME, VOLUME_SNAPSHOT_LOCATION_NAME};
use crate::VeleroEngine;

/// What to put in a backup
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackupSpec {
    /// Namespaces to include (empty means all)
    pub included_namespaces: Vec<String>,
    /// Namespaces to exclude
    pub excluded_namespaces: Vec<String>,
    /// Resources to include (empty means all)
    pub included_resources: Vec<String>,
    /// Resources to exclude
    pub excluded_resources: Vec<String>,
    /// Retention, as a Go duration string
    pub ttl: Option<String>,
    /// Whether cluster-scoped resources are backed up
    pub include_cluster_resources: Option<bool>,
    /// Only back up objects carrying all of these labels
    pub label_selector: BTreeMap<String, String>,
}

impl BackupSpec {
    fn template(&self, default_volumes_to_fs_backup: bool) -> BackupTemplate {
        BackupTemplate {
            storage_location: Some(BACKUP_LOCATION_NAME.to_string()),
            volume_snapshot_locations: vec![VOLUME_SNAPSHOT_LOCATION_NAME.to_string()],
            included_namespaces: self.included_namespaces.clone(),
            excluded_namespaces: self.excluded_namespaces.clone(),
            included_resources: self.included_resources.clone(),
            excluded_resources: self.excluded_resources.clone(),
            ttl: self.ttl.clone(),
            include_cluster_resources: self.include_cluster_resources,
            label_selector: (!self.label_selector.is_empty()).then(|| LabelSelector {
                match_labels: self.label_selector.clone(),
            }),
            default_volumes_to_fs_backup: Some(default_volumes_to_fs_backup),
        }
    }
}

/// Summary of a Backup that has started
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackupInfo {
    /// Server-assigned UID
    pub uid: String,
    /// Server-generated name
    pub name: String,
    /// Labels on the Backup object
    pub labels: BTreeMap<String, String>,
    /// Annotations on the Backup object
    pub annotations: BTreeMap<String, String>,
    /// Current phase
    pub phase: String,
    /// RFC 3339 start time
    pub start_timestamp: String,
    /// RFC 3339 completion time, once finished
    pub completion_timestamp: Option<String>,
}

impl BackupInfo {
    /// Summarise a Backup; `None` when it has no identity, no labels or
    /// annotations, or has not started yet
    pub fn from_backup(backup: Backup) -> Option<Self> {
        let meta = backup.metadata;
        let OperationStatus {
            phase,
            start_timestamp,
            completion_timestamp,
        } = backup.status?;
        Some(Self {
            uid: meta.uid?,
            name: meta.name?,
            labels: meta.labels?,
            annotations: meta.annotations?,
            phase: phase?,
            start_timestamp: start_timestamp?,
            completion_timestamp,
        })
    }
}

/// Render a label filter as a Kubernetes selector. A key without a value
/// matches any object carrying that key.
fn label_selector(labels: &BTreeMap<String, Option<String>>) -> Option<String> {
    if labels.is_empty() {
        return None;
    }
    Some(
        labels
            .iter()
            .map(|(k, v)| match v {
                Some(v) => format!("{}={}", k, v),
                None => k.clone(),
            })
            .collect::<Vec<_>>()
            .join(","),
    )
}

fn created_name(created: &Value, kind: &str) -> Result<String, Error> {
    created
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::operation_failed(kind, "server returned an object without a name"))
}

impl VeleroEngine {
    async fn wait_for_operation(&self, descriptor: &ResourceDescriptor) -> Result<(), Error> {
        poll_until_ready(
            &self.config.operations.poll_config(),
            &descriptor.to_string(),
            || readiness::check_operation(&self.gateway, self.namespace(), descriptor),
        )
        .await
    }

    /// Create a Backup and wait for it to complete. Returns the generated name.
    pub async fn create_backup(
        &self,
        name_prefix: &str,
        spec: &BackupSpec,
        default_volumes_to_fs_backup: bool,
        labels: BTreeMap<String, String>,
        annotations: BTreeMap<String, String>,
    ) -> Result<String, Error> {
        let mut backup = Backup::generated(
            name_prefix,
            self.namespace(),
            spec.template(default_volumes_to_fs_backup),
        );
        backup.metadata.labels = Some(labels);
        backup.metadata.annotations = Some(annotations);

        let created = self
            .gateway
            .create(Backup::RESOURCE_KIND, self.namespace(), serde_json::to_value(&backup)?)
            .await?;
        let name = created_name(&created, "backup")?;
        info!(backup = %name, "backup created, waiting for completion");

        self.wait_for_operation(&ResourceDescriptor::new(Backup::RESOURCE_KIND, name.clone()))
            .await?;
        info!(backup = %name, "backup completed");
        Ok(name)
    }

    /// Restore the Backup with UID `backup_uid` and wait for the restore to
    /// complete. Returns the generated restore name.
    pub async fn create_restore(
        &self,
        backup_uid: &str,
        existing_resource_policy: ExistingResourcePolicy,
        labels: BTreeMap<String, String>,
        annotations: BTreeMap<String, String>,
    ) -> Result<String, Error> {
        let backup_name = self
            .gateway
            .list(Backup::RESOURCE_KIND, self.namespace(), None)
            .await?
            .into_iter()
            .find(|b| b.pointer("/metadata/uid").and_then(Value::as_str) == Some(backup_uid))
            .and_then(|b| {
                b.pointer("/metadata/name")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .ok_or_else(|| {
                Error::operation_failed(
                    format!("backup/{}", backup_uid),
                    "no backup with this uid",
                )
            })?;

        let mut restore = Restore::from_backup(
            backup_name.clone(),
            self.namespace(),
            existing_resource_policy,
        );
        restore.metadata.labels = Some(labels);
        restore.metadata.annotations = Some(annotations);
        let created = self
            .gateway
            .create(Restore::RESOURCE_KIND, self.namespace(), serde_json::to_value(&restore)?)
            .await?;
        let name = created_name(&created, "restore")?;
        info!(restore = %name, backup = %backup_name, "restore created, waiting for completion");

        self.wait_for_operation(&ResourceDescriptor::new(Restore::RESOURCE_KIND, name.clone()))
            .await?;
        info!(restore = %name, "restore completed");
        Ok(name)
    }

    /// Backups matching `labels`, skipping any that have not started
    pub async fn list_backups(
        &self,
        labels: &BTreeMap<String, Option<String>>,
    ) -> Result<Vec<BackupInfo>, Error> {
        let selector = label_selector(labels);
        let items = self
            .gateway
            .list(Backup::RESOURCE_KIND, self.namespace(), selector.as_deref())
            .await?;

        let mut backups = Vec::with_capacity(items.len());
        for item in items {
            let backup: Backup = serde_json::from_value(item)?;
            if let Some(info) = BackupInfo::from_backup(backup) {
                backups.push(info);
            }
        }
        Ok(backups)
    }
}
