//! The fixed set of objects a Velero installation consists of

use velero_common::kube_utils::{ResourceDescriptor, ResourceKind};
use velero_common::yaml::{documents_of_kind, parse_yaml_multi};
use velero_common::Error;

/// Velero server Deployment and its main container
pub const DEPLOYMENT_NAME: &str = "velero";
/// Node agent DaemonSet and its container
pub const NODE_AGENT_NAME: &str = "node-agent";
/// ServiceAccount created by `velero install`
pub const SERVICE_ACCOUNT_NAME: &str = "velero";
/// Base name of the ClusterRoleBinding created by `velero install`
pub const CLUSTER_ROLE_BINDING_NAME: &str = "velero";
/// ClusterIP Service exposing server metrics
pub const METRICS_SERVICE_NAME: &str = "velero-metrics";
/// Port the Velero server serves metrics on
pub const METRICS_PORT: i32 = 8085;
/// Secret holding the storage credentials file
pub const SECRET_NAME: &str = "cloud-credentials";
/// Key of the credentials file inside [`SECRET_NAME`]
pub const SECRET_KEY: &str = "creds";
/// Name of the default BackupStorageLocation
pub const BACKUP_LOCATION_NAME: &str = "default";
/// Name of the default VolumeSnapshotLocation
pub const VOLUME_SNAPSHOT_LOCATION_NAME: &str = "default";

/// Name of the ClusterRoleBinding for an installation in `namespace`.
///
/// `velero install` names it plain "velero" in the "velero" namespace and
/// appends the namespace everywhere else.
pub fn cluster_role_binding_name(namespace: &str) -> String {
    if namespace == "velero" {
        CLUSTER_ROLE_BINDING_NAME.to_string()
    } else {
        format!("{}-{}", CLUSTER_ROLE_BINDING_NAME, namespace)
    }
}

/// Deployment, DaemonSet, ServiceAccount, metrics Service and ClusterRoleBinding
pub fn core_resources(namespace: &str) -> Vec<ResourceDescriptor> {
    vec![
        ResourceDescriptor::new(ResourceKind::DEPLOYMENT, DEPLOYMENT_NAME),
        ResourceDescriptor::new(ResourceKind::DAEMON_SET, NODE_AGENT_NAME),
        ResourceDescriptor::new(ResourceKind::SERVICE_ACCOUNT, SERVICE_ACCOUNT_NAME),
        ResourceDescriptor::new(ResourceKind::SERVICE, METRICS_SERVICE_NAME),
        ResourceDescriptor::new(
            ResourceKind::CLUSTER_ROLE_BINDING,
            cluster_role_binding_name(namespace),
        ),
    ]
}

/// Credentials Secret plus the default backup and snapshot locations
pub fn storage_resources() -> Vec<ResourceDescriptor> {
    vec![
        ResourceDescriptor::new(ResourceKind::SECRET, SECRET_NAME),
        ResourceDescriptor::new(ResourceKind::BACKUP_STORAGE_LOCATION, BACKUP_LOCATION_NAME),
        ResourceDescriptor::new(
            ResourceKind::VOLUME_SNAPSHOT_LOCATION,
            VOLUME_SNAPSHOT_LOCATION_NAME,
        ),
    ]
}

/// CustomResourceDefinition manifests in a `velero install --dry-run` stream,
/// in declaration order
pub fn crd_manifests(install_output: &str) -> Result<Vec<serde_json::Value>, Error> {
    let docs = parse_yaml_multi(install_output)?;
    Ok(documents_of_kind(docs, ResourceKind::CUSTOM_RESOURCE_DEFINITION.kind))
}

/// CRD descriptors in deletion order (last declared first)
pub fn crd_resources(install_output: &str) -> Result<Vec<ResourceDescriptor>, Error> {
    Ok(crd_manifests(install_output)?
        .iter()
        .rev()
        .filter_map(|crd| crd.pointer("/metadata/name").and_then(|n| n.as_str()))
        .map(|name| ResourceDescriptor::new(ResourceKind::CUSTOM_RESOURCE_DEFINITION, name))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use velero_common::kube_utils::ResourceScope;

    #[test]
    fn crb_name_depends_on_namespace() {
        assert_eq!(cluster_role_binding_name("velero"), "velero");
        assert_eq!(cluster_role_binding_name("backups"), "velero-backups");
    }

    #[test]
    fn core_set_contents() {
        let core = core_resources("ops");
        let names: Vec<_> = core.iter().map(|d| d.to_string()).collect();
        assert_eq!(
            names,
            vec![
                "deployment/velero",
                "daemonset/node-agent",
                "serviceaccount/velero",
                "service/velero-metrics",
                "clusterrolebinding/velero-ops",
            ]
        );
        assert_eq!(core[4].scope(), ResourceScope::Cluster);
    }

    #[test]
    fn storage_set_is_namespaced() {
        let storage = storage_resources();
        assert_eq!(storage.len(), 3);
        assert!(storage
            .iter()
            .all(|d| d.scope() == ResourceScope::Namespaced));
    }

    #[test]
    fn crds_are_reversed_and_filtered() {
        let output = r#"
apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: a.velero.io
---
apiVersion: v1
kind: Namespace
metadata:
  name: velero
---
apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: b.velero.io
---
apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: c.velero.io
"#;
        let crds = crd_resources(output).unwrap();
        let names: Vec<_> = crds.iter().map(|d| d.name()).collect();
        assert_eq!(names, vec!["c.velero.io", "b.velero.io", "a.velero.io"]);
        assert!(crds.iter().all(|d| d.scope() == ResourceScope::Cluster));
    }

    #[test]
    fn crd_without_name_is_skipped() {
        let output = "apiVersion: apiextensions.k8s.io/v1\nkind: CustomResourceDefinition\nmetadata: {}\n";
        assert!(crd_resources(output).unwrap().is_empty());
    }
}
