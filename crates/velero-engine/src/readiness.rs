//! Readiness checks
//!
//! Each `check_*` function performs exactly one observation and returns
//! `Ok(())`, a retryable [`Error::NotReady`], or a terminal error. The
//! engine hands them to [`poll_until_ready`] with the configured budget.
//!
//! [`poll_until_ready`]: velero_common::retry::poll_until_ready

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use velero_common::kube_utils::{
    find_condition, ResourceDescriptor, ResourceKind, CONDITION_AVAILABLE, STATUS_TRUE,
};
use velero_common::{ClusterResourceGateway, Error};

use crate::crd::{PhaseOutcome, PHASE_AVAILABLE};

const NOT_AVAILABLE: &str = "Not Available";

async fn fetch<T: DeserializeOwned>(
    gateway: &ClusterResourceGateway,
    descriptor: &ResourceDescriptor,
    namespace: &str,
) -> Result<T, Error> {
    let obj = gateway
        .get(descriptor, namespace)
        .await?
        .ok_or_else(|| Error::not_ready(descriptor.to_string(), "not found"))?;
    Ok(serde_json::from_value(obj)?)
}

/// One observation of a Deployment's `Available` condition.
///
/// When the Deployment is not available the reason is taken from the first
/// useful source: waiting/terminated reasons of non-ready containers in its
/// pods, then the condition message, then "Not Available".
pub async fn check_deployment(
    gateway: &ClusterResourceGateway,
    namespace: &str,
    name: &str,
) -> Result<(), Error> {
    let descriptor = ResourceDescriptor::new(ResourceKind::DEPLOYMENT, name);
    let deployment: Deployment = fetch(gateway, &descriptor, namespace).await?;
    let not_ready = |reason: &str| Error::not_ready(descriptor.to_string(), reason);

    let status = deployment.status.as_ref().ok_or_else(|| not_ready("No status"))?;
    let conditions = status
        .conditions
        .as_deref()
        .filter(|c| !c.is_empty())
        .ok_or_else(|| not_ready("No conditions"))?;
    let available = find_condition(Some(conditions), CONDITION_AVAILABLE)
        .ok_or_else(|| not_ready("No Available condition"))?;

    if available.status == STATUS_TRUE {
        return Ok(());
    }

    let pod_reason = container_failure_reason(gateway, &deployment, namespace).await?;
    let reason = pod_reason
        .or_else(|| available.message.clone())
        .unwrap_or_else(|| NOT_AVAILABLE.to_string());
    Err(not_ready(&reason))
}

fn match_labels_selector(deployment: &Deployment) -> Option<String> {
    let labels = deployment.spec.as_ref()?.selector.match_labels.as_ref()?;
    if labels.is_empty() {
        return None;
    }
    Some(
        labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(","),
    )
}

/// Reason reported by the last non-ready container across the Deployment's pods
async fn container_failure_reason(
    gateway: &ClusterResourceGateway,
    deployment: &Deployment,
    namespace: &str,
) -> Result<Option<String>, Error> {
    let Some(selector) = match_labels_selector(deployment) else {
        return Ok(None);
    };

    let mut reason = None;
    for value in gateway
        .list(ResourceKind::POD, namespace, Some(&selector))
        .await?
    {
        let pod: Pod = serde_json::from_value(value)?;
        for status in pod_container_statuses(&pod) {
            if status.ready {
                continue;
            }
            let Some(state) = status.state.as_ref() else {
                continue;
            };
            if let Some(r) = state.waiting.as_ref().and_then(|w| w.reason.clone()) {
                reason = Some(r);
            }
            if let Some(r) = state.terminated.as_ref().and_then(|t| t.reason.clone()) {
                reason = Some(r);
            }
        }
    }
    Ok(reason)
}

fn pod_container_statuses(pod: &Pod) -> impl Iterator<Item = &ContainerStatus> {
    let status = pod.status.as_ref();
    let containers = status.and_then(|s| s.container_statuses.as_deref());
    let init = status.and_then(|s| s.init_container_statuses.as_deref());
    containers
        .unwrap_or_default()
        .iter()
        .chain(init.unwrap_or_default())
}

/// One observation of a DaemonSet: every scheduled pod must be available
pub async fn check_daemon_set(
    gateway: &ClusterResourceGateway,
    namespace: &str,
    name: &str,
) -> Result<(), Error> {
    let descriptor = ResourceDescriptor::new(ResourceKind::DAEMON_SET, name);
    let daemon_set: DaemonSet = fetch(gateway, &descriptor, namespace).await?;
    let status = daemon_set
        .status
        .ok_or_else(|| Error::not_ready(descriptor.to_string(), "No status"))?;

    let available = status.number_available.unwrap_or(0);
    if available != status.desired_number_scheduled {
        return Err(Error::not_ready(
            descriptor.to_string(),
            format!(
                "Not all pods are available ({}/{})",
                available, status.desired_number_scheduled
            ),
        ));
    }
    Ok(())
}

/// One observation of a BackupStorageLocation: phase must be `Available`
pub async fn check_backup_storage_location(
    gateway: &ClusterResourceGateway,
    namespace: &str,
    name: &str,
) -> Result<(), Error> {
    let descriptor = ResourceDescriptor::new(ResourceKind::BACKUP_STORAGE_LOCATION, name);
    let bsl: Value = fetch(gateway, &descriptor, namespace).await?;

    match bsl.pointer("/status/phase").and_then(Value::as_str) {
        Some(PHASE_AVAILABLE) => Ok(()),
        Some(phase) => Err(Error::not_ready(
            descriptor.to_string(),
            format!("BackupStorageLocation is unavailable (phase {})", phase),
        )),
        None => Err(Error::not_ready(
            descriptor.to_string(),
            "BackupStorageLocation has no status",
        )),
    }
}

/// One observation of a Backup or Restore phase.
///
/// `Completed` succeeds, `Failed`/`PartiallyFailed` are terminal
/// [`Error::OperationFailed`], anything else is still in progress.
pub async fn check_operation(
    gateway: &ClusterResourceGateway,
    namespace: &str,
    descriptor: &ResourceDescriptor,
) -> Result<(), Error> {
    let obj: Value = fetch(gateway, descriptor, namespace).await?;
    let phase = obj.pointer("/status/phase").and_then(Value::as_str);

    match PhaseOutcome::from_phase(phase) {
        PhaseOutcome::Completed => Ok(()),
        PhaseOutcome::Failed(phase) => Err(Error::operation_failed(
            descriptor.to_string(),
            format!("Status is '{}'", phase),
        )),
        PhaseOutcome::InProgress(Some(phase)) => {
            debug!(resource = %descriptor, phase = %phase, "still in progress");
            Err(Error::not_ready(
                descriptor.to_string(),
                format!("still in progress: '{}'", phase),
            ))
        }
        PhaseOutcome::InProgress(None) => Err(Error::not_ready(
            descriptor.to_string(),
            "No status or phase present",
        )),
    }
}
