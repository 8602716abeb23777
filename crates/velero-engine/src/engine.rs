//! The Velero lifecycle engine
//!
//! Drives a Velero installation from absent to ready and back:
//!
//! ```text
//! Absent -> Installed (+ node agent) -> StorageConfigured -> Ready
//!    ^                                                         |
//!    +------------------------ remove_all ---------------------+
//! ```
//!
//! The engine keeps no state between calls. Every query reads the cluster,
//! and every mutation is a sequence of velero invocations and API calls that
//! stops at the first failure without rolling back.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{error, info, warn};

use velero_common::command::{CommandOutput, CommandRunner, VeleroCli};
use velero_common::kube_utils::{
    KubeApi, KubeClient, PatchKind, ResourceDescriptor, ResourceKind,
};
use velero_common::retry::poll_until_ready;
use velero_common::{ClusterResourceGateway, Error, COMPONENT_LABEL};
use velero_storage::{StorageBackend, StorageProvider};

use crate::config::VeleroConfig;
use crate::readiness;
use crate::resources::{
    self, BACKUP_LOCATION_NAME, DEPLOYMENT_NAME, METRICS_PORT, METRICS_SERVICE_NAME,
    NODE_AGENT_NAME, SECRET_KEY, SECRET_NAME, VOLUME_SNAPSHOT_LOCATION_NAME,
};

const FS_BACKUP_FLAG: &str = "--default-volumes-to-fs-backup=";

/// Settings for `velero install`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstallOptions {
    /// Velero server image
    pub image: String,
    /// Deploy the node agent DaemonSet
    pub use_node_agent: bool,
    /// Back up pod volumes with the file-system uploader by default
    pub default_volumes_to_fs_backup: bool,
}

/// Installs, configures, verifies and removes Velero in one namespace
pub struct VeleroEngine {
    pub(crate) config: VeleroConfig,
    pub(crate) gateway: ClusterResourceGateway,
    cli: Arc<dyn CommandRunner>,
}

impl VeleroEngine {
    /// Create an engine over explicit collaborators
    pub fn new(config: VeleroConfig, api: Arc<dyn KubeApi>, cli: Arc<dyn CommandRunner>) -> Self {
        Self {
            config,
            gateway: ClusterResourceGateway::new(api),
            cli,
        }
    }

    /// Create an engine talking to a real cluster and the configured velero binary
    pub fn from_client(config: VeleroConfig, client: kube::Client) -> Result<Self, Error> {
        config.validate()?;
        let api = Arc::new(KubeClient::new(client, config.field_manager.clone()));
        let cli = Arc::new(VeleroCli::new(config.binary_path.clone()));
        Ok(Self::new(config, api, cli))
    }

    /// Namespace this engine manages
    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    fn namespace_flag(&self) -> String {
        format!("--namespace={}", self.config.namespace)
    }

    async fn velero<I, S>(&self, args: I) -> Result<CommandOutput, Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cli
            .run(args.into_iter().map(Into::into).collect())
            .await
    }

    // =========================================================================
    // Install
    // =========================================================================

    /// Run `velero install` and provision the metrics Service.
    ///
    /// The installation never creates a default backup location, secret or
    /// snapshot location; those are managed by [`configure_storage_locations`].
    ///
    /// [`configure_storage_locations`]: Self::configure_storage_locations
    pub async fn install(&self, options: &InstallOptions) -> Result<(), Error> {
        info!(
            namespace = %self.namespace(),
            image = %options.image,
            node_agent = options.use_node_agent,
            fs_backup = options.default_volumes_to_fs_backup,
            "installing velero"
        );

        self.velero([
            "install".to_string(),
            format!("--image={}", options.image),
            self.namespace_flag(),
            "--no-default-backup-location".to_string(),
            "--no-secret".to_string(),
            "--use-volume-snapshots=false".to_string(),
            format!("--use-node-agent={}", options.use_node_agent),
            format!(
                "{}{}",
                FS_BACKUP_FLAG, options.default_volumes_to_fs_backup
            ),
        ])
        .await?;

        self.ensure_metrics_service().await
    }

    async fn ensure_metrics_service(&self) -> Result<(), Error> {
        let (label_key, label_value) = COMPONENT_LABEL;
        let service = json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {
                "name": METRICS_SERVICE_NAME,
                "namespace": self.namespace(),
                "labels": { label_key: label_value }
            },
            "spec": {
                "type": "ClusterIP",
                "selector": { "deploy": "velero" },
                "ports": [{
                    "name": "metrics",
                    "port": METRICS_PORT,
                    "targetPort": METRICS_PORT,
                    "protocol": "TCP"
                }]
            }
        });

        match self
            .gateway
            .create(ResourceKind::SERVICE, self.namespace(), service)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_conflict() => {
                warn!(service = METRICS_SERVICE_NAME, "metrics service already exists");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "failed to create metrics service");
                Err(e)
            }
        }
    }

    /// Whether every core object exists. The node agent is only required
    /// (and only queried) when `use_node_agent` is set.
    pub async fn is_installed(&self, use_node_agent: bool) -> Result<bool, Error> {
        for descriptor in resources::core_resources(self.namespace()) {
            if !use_node_agent && descriptor.kind() == ResourceKind::DAEMON_SET {
                continue;
            }
            if !self.gateway.exists(&descriptor, self.namespace()).await? {
                info!(resource = %descriptor, "velero not installed");
                return Ok(false);
            }
        }
        Ok(true)
    }

    // =========================================================================
    // Storage
    // =========================================================================

    /// Create the credentials Secret, add the provider plugin and create the
    /// default backup and snapshot locations, in that order.
    ///
    /// Stops at the first failure; call [`remove_storage_locations`] to
    /// clean up a partial configuration.
    ///
    /// [`remove_storage_locations`]: Self::remove_storage_locations
    pub async fn configure_storage_locations(
        &self,
        provider: &StorageProvider,
    ) -> Result<(), Error> {
        info!(
            namespace = %self.namespace(),
            provider = %provider.plugin(),
            plugin_image = %provider.plugin_image(),
            bucket = %provider.bucket(),
            "configuring velero storage"
        );

        self.create_storage_secret(provider).await?;
        self.velero([
            "plugin".to_string(),
            "add".to_string(),
            provider.plugin_image().to_string(),
            "--confirm".to_string(),
            self.namespace_flag(),
        ])
        .await?;
        self.velero(self.backup_location_args(provider)).await?;
        self.velero(self.snapshot_location_args(provider)).await?;

        info!(namespace = %self.namespace(), "velero storage configured");
        Ok(())
    }

    async fn create_storage_secret(&self, provider: &StorageProvider) -> Result<(), Error> {
        let (label_key, label_value) = COMPONENT_LABEL;
        let secret = json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "type": "Opaque",
            "metadata": {
                "name": SECRET_NAME,
                "namespace": self.namespace(),
                "labels": { label_key: label_value }
            },
            "data": { SECRET_KEY: provider.secret_payload() }
        });
        self.gateway
            .create(ResourceKind::SECRET, self.namespace(), secret)
            .await
            .map(|_| ())
            .inspect_err(|e| {
                error!(provider = %provider.plugin(), error = %e, "failed to create storage secret")
            })
    }

    fn backup_location_args(&self, provider: &StorageProvider) -> Vec<String> {
        let mut args = vec![
            "backup-location".to_string(),
            "create".to_string(),
            BACKUP_LOCATION_NAME.to_string(),
            format!("--provider={}", provider.plugin()),
        ];
        if let Some(prefix) = provider.path() {
            args.extend(["--prefix".to_string(), prefix.to_string()]);
        }
        args.extend(["--bucket".to_string(), provider.bucket().to_string()]);
        args.extend(config_flag(&provider.backup_location_config()));
        args.extend([
            credential_flag(),
            "--default".to_string(),
            self.namespace_flag(),
            "--labels".to_string(),
            component_label(),
        ]);
        args
    }

    fn snapshot_location_args(&self, provider: &StorageProvider) -> Vec<String> {
        let mut args = vec![
            "snapshot-location".to_string(),
            "create".to_string(),
            VOLUME_SNAPSHOT_LOCATION_NAME.to_string(),
            format!("--provider={}", provider.plugin()),
        ];
        args.extend(config_flag(&provider.volume_snapshot_location_config()));
        args.extend([
            credential_flag(),
            self.namespace_flag(),
            "--labels".to_string(),
            component_label(),
        ]);
        args
    }

    /// Whether the credentials Secret and both default locations exist
    pub async fn is_storage_configured(&self) -> Result<bool, Error> {
        for descriptor in resources::storage_resources() {
            if !self.gateway.exists(&descriptor, self.namespace()).await? {
                info!(resource = %descriptor, "velero storage not configured");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Delete the storage objects and strip the provider plugin init
    /// containers from the server Deployment. The Deployment must exist.
    pub async fn remove_storage_locations(&self) -> Result<(), Error> {
        info!(namespace = %self.namespace(), "removing velero storage");
        for descriptor in resources::storage_resources() {
            self.gateway.delete(&descriptor, self.namespace()).await?;
        }

        let deployment = ResourceDescriptor::new(ResourceKind::DEPLOYMENT, DEPLOYMENT_NAME);
        let patch = json!({"spec": {"template": {"spec": {"initContainers": []}}}});
        self.gateway
            .patch(&deployment, self.namespace(), patch, PatchKind::Merge)
            .await
            .inspect_err(|e| {
                error!(resource = %deployment, error = %e, "failed to remove plugin init containers")
            })
    }

    /// Delete the node agent DaemonSet
    pub async fn remove_node_agent(&self) -> Result<(), Error> {
        info!(namespace = %self.namespace(), "removing velero node agent");
        self.gateway
            .delete(
                &ResourceDescriptor::new(ResourceKind::DAEMON_SET, NODE_AGENT_NAME),
                self.namespace(),
            )
            .await
    }

    // =========================================================================
    // Updates
    // =========================================================================

    async fn patch_ignoring_absent(
        &self,
        descriptor: &ResourceDescriptor,
        body: Value,
        patch_kind: PatchKind,
    ) -> Result<(), Error> {
        match self
            .gateway
            .patch(descriptor, self.namespace(), body, patch_kind)
            .await
        {
            Ok(()) => {
                info!(resource = %descriptor, "patched");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                warn!(resource = %descriptor, "not found, skipping patch");
                Ok(())
            }
            Err(e) => {
                error!(resource = %descriptor, error = %e, "patch failed");
                Err(e)
            }
        }
    }

    /// Set the server image, recreating the pod
    pub async fn update_deployment_image(&self, image: &str) -> Result<(), Error> {
        self.patch_ignoring_absent(
            &ResourceDescriptor::new(ResourceKind::DEPLOYMENT, DEPLOYMENT_NAME),
            recreate_patch(json!({"name": DEPLOYMENT_NAME, "image": image})),
            PatchKind::Strategic,
        )
        .await
    }

    /// Set the node agent image
    pub async fn update_node_agent_image(&self, image: &str) -> Result<(), Error> {
        self.patch_ignoring_absent(
            &ResourceDescriptor::new(ResourceKind::DAEMON_SET, NODE_AGENT_NAME),
            recreate_patch(json!({"name": NODE_AGENT_NAME, "image": image})),
            PatchKind::Strategic,
        )
        .await
    }

    /// Set the image of the first init container (the provider plugin)
    pub async fn update_plugin_image(&self, image: &str) -> Result<(), Error> {
        let patch = json!([{
            "op": "replace",
            "path": "/spec/template/spec/initContainers/0/image",
            "value": image
        }]);
        self.patch_ignoring_absent(
            &ResourceDescriptor::new(ResourceKind::DEPLOYMENT, DEPLOYMENT_NAME),
            patch,
            PatchKind::Json,
        )
        .await
    }

    /// Rewrite the server's `--default-volumes-to-fs-backup` argument
    pub async fn update_deployment_flags(
        &self,
        default_volumes_to_fs_backup: bool,
    ) -> Result<(), Error> {
        let descriptor = ResourceDescriptor::new(ResourceKind::DEPLOYMENT, DEPLOYMENT_NAME);
        let Some(deployment) = self.gateway.get(&descriptor, self.namespace()).await? else {
            warn!(resource = %descriptor, "not found, skipping flag update");
            return Ok(());
        };

        let containers = deployment
            .pointer("/spec/template/spec/containers")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                Error::operation_failed(descriptor.to_string(), "Deployment has no valid spec")
            })?;
        let args = containers
            .iter()
            .find(|c| c.get("name").and_then(Value::as_str) == Some(DEPLOYMENT_NAME))
            .and_then(|c| c.get("args"))
            .and_then(Value::as_array)
            .filter(|a| !a.is_empty())
            .ok_or_else(|| {
                Error::operation_failed(descriptor.to_string(), "velero container has no arguments")
            })?;

        let mut new_args: Vec<String> = args
            .iter()
            .filter_map(Value::as_str)
            .filter(|a| !a.starts_with(FS_BACKUP_FLAG))
            .map(str::to_string)
            .collect();
        new_args.push(format!("{}{}", FS_BACKUP_FLAG, default_volumes_to_fs_backup));

        let patch = recreate_patch(json!({"name": DEPLOYMENT_NAME, "args": new_args}));
        self.patch_ignoring_absent(&descriptor, patch, PatchKind::Strategic)
            .await
    }

    // =========================================================================
    // CRDs, teardown and passthrough
    // =========================================================================

    async fn crd_install_output(&self) -> Result<String, Error> {
        Ok(self
            .velero(["install", "--crds-only", "--dry-run", "-o", "yaml"])
            .await?
            .stdout)
    }

    /// CRDs the installed binary would create, last-declared first
    pub async fn discover_crds(&self) -> Result<Vec<ResourceDescriptor>, Error> {
        resources::crd_resources(&self.crd_install_output().await?)
    }

    /// Server-side apply the CRDs shipped with the current binary
    pub async fn upgrade_crds(&self) -> Result<(), Error> {
        info!("upgrading velero CRDs");
        let manifests = resources::crd_manifests(&self.crd_install_output().await?)?;
        for crd in manifests {
            match self
                .gateway
                .apply(ResourceKind::CUSTOM_RESOURCE_DEFINITION, self.namespace(), crd)
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    warn!(error = %e, "CRD apply returned not found, skipping");
                }
                Err(e) => {
                    error!(error = %e, "failed to upgrade velero CRDs");
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Best-effort removal of storage objects, CRDs and core objects.
    ///
    /// Failures are logged and never returned.
    pub async fn remove_all(&self) {
        let crds = self.discover_crds().await.unwrap_or_else(|e| {
            error!(error = %e, "could not discover velero CRDs, leaving them in place");
            Vec::new()
        });

        let all = resources::storage_resources()
            .into_iter()
            .chain(crds)
            .chain(resources::core_resources(self.namespace()));

        info!(namespace = %self.namespace(), "removing velero");
        for descriptor in all {
            if let Err(e) = self.gateway.delete(&descriptor, self.namespace()).await {
                warn!(resource = %descriptor, error = %e, "ignoring failed removal");
            }
        }
    }

    /// Run an arbitrary velero subcommand in this namespace, returning trimmed stdout
    pub async fn run_cli_command(&self, args: &[String]) -> Result<String, Error> {
        if args.is_empty() {
            return Err(Error::invalid_argument("command cannot be empty"));
        }
        let mut full = args.to_vec();
        full.push(self.namespace_flag());
        Ok(self.velero(full).await?.stdout.trim().to_string())
    }

    // =========================================================================
    // Readiness
    // =========================================================================

    /// Wait for the server Deployment to be stably available
    pub async fn check_deployment(&self) -> Result<(), Error> {
        info!("checking velero deployment readiness");
        poll_until_ready(
            &self.config.readiness.poll_config(),
            "deployment/velero",
            || readiness::check_deployment(&self.gateway, self.namespace(), DEPLOYMENT_NAME),
        )
        .await
    }

    /// Wait for every node agent pod to be available
    pub async fn check_node_agent(&self) -> Result<(), Error> {
        info!("checking velero node agent readiness");
        poll_until_ready(
            &self.config.readiness.poll_config(),
            "daemonset/node-agent",
            || readiness::check_daemon_set(&self.gateway, self.namespace(), NODE_AGENT_NAME),
        )
        .await
    }

    /// Wait for the default BackupStorageLocation to become `Available`, then
    /// confirm the default VolumeSnapshotLocation exists
    pub async fn check_storage_locations(&self) -> Result<(), Error> {
        info!("checking velero storage location readiness");
        poll_until_ready(
            &self.config.readiness.poll_config(),
            "backupstoragelocation/default",
            || {
                readiness::check_backup_storage_location(
                    &self.gateway,
                    self.namespace(),
                    BACKUP_LOCATION_NAME,
                )
            },
        )
        .await?;

        let vsl = ResourceDescriptor::new(
            ResourceKind::VOLUME_SNAPSHOT_LOCATION,
            VOLUME_SNAPSHOT_LOCATION_NAME,
        );
        if self.gateway.exists(&vsl, self.namespace()).await? {
            Ok(())
        } else {
            Err(Error::not_ready(vsl.to_string(), "not found"))
        }
    }
}

/// Strategic patch merging one container by name and switching to the
/// `Recreate` strategy
fn recreate_patch(container: Value) -> Value {
    json!({
        "spec": {
            "template": {"spec": {"containers": [container]}},
            "strategy": {"type": "Recreate", "rollingUpdate": null}
        }
    })
}

fn credential_flag() -> String {
    format!("--credential={}={}", SECRET_NAME, SECRET_KEY)
}

fn component_label() -> String {
    let (key, value) = COMPONENT_LABEL;
    format!("{}={}", key, value)
}

/// `["--config", "k1=v1,k2=v2"]`, or nothing for an empty config
fn config_flag(config: &BTreeMap<String, String>) -> Vec<String> {
    if config.is_empty() {
        return Vec::new();
    }
    let joined = config
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",");
    vec!["--config".to_string(), joined]
}

#[cfg(test)]
mod tests {
    use super::*;

    use mockall::predicate::eq;
    use velero_common::command::MockCommandRunner;
    use velero_common::kube_utils::MockKubeApi;
    use velero_common::ErrorKind;

    use crate::config::CheckBudget;

    fn config() -> VeleroConfig {
        VeleroConfig {
            readiness: CheckBudget {
                attempts: 3,
                delay_secs: 0,
                observations: 0,
            },
            ..VeleroConfig::default()
        }
    }

    fn engine(api: MockKubeApi, cli: MockCommandRunner) -> VeleroEngine {
        VeleroEngine::new(config(), Arc::new(api), Arc::new(cli))
    }

    fn s3() -> StorageProvider {
        let config = [
            ("bucket", "b"),
            ("region", "r"),
            ("access-key", "ak"),
            ("secret-key", "sk"),
            ("path", "cluster-a"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        StorageProvider::s3(&config, "velero/velero-plugin-for-aws:v1.10.0").unwrap()
    }

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn install_runs_cli_then_creates_metrics_service() {
        let mut cli = MockCommandRunner::new();
        cli.expect_run()
            .with(eq(strings(&[
                "install",
                "--image=velero/velero:v1.16.0",
                "--namespace=velero",
                "--no-default-backup-location",
                "--no-secret",
                "--use-volume-snapshots=false",
                "--use-node-agent=true",
                "--default-volumes-to-fs-backup=false",
            ])))
            .times(1)
            .returning(|_| Ok(CommandOutput::default()));

        let mut api = MockKubeApi::new();
        api.expect_create()
            .withf(|kind, ns, obj| {
                *kind == ResourceKind::SERVICE
                    && ns == "velero"
                    && obj["metadata"]["name"] == "velero-metrics"
                    && obj["spec"]["ports"][0]["port"] == 8085
                    && obj["spec"]["selector"]["deploy"] == "velero"
                    && obj["metadata"]["labels"]["component"] == "velero"
            })
            .times(1)
            .returning(|_, _, obj| Ok(obj));

        engine(api, cli)
            .install(&InstallOptions {
                image: "velero/velero:v1.16.0".to_string(),
                use_node_agent: true,
                default_volumes_to_fs_backup: false,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn install_tolerates_existing_metrics_service() {
        let mut cli = MockCommandRunner::new();
        cli.expect_run().returning(|_| Ok(CommandOutput::default()));
        let mut api = MockKubeApi::new();
        api.expect_create()
            .returning(|_, _, _| Err(Error::cluster_api(409, "already exists")));

        let options = InstallOptions {
            image: "velero/velero:v1.16.0".to_string(),
            use_node_agent: false,
            default_volumes_to_fs_backup: true,
        };
        engine(api, cli).install(&options).await.unwrap();
    }

    #[tokio::test]
    async fn install_failure_is_cli_error_and_skips_service() {
        let mut cli = MockCommandRunner::new();
        cli.expect_run()
            .returning(|_| Err(Error::cli("velero install", Some(1), "", "no cluster")));
        let mut api = MockKubeApi::new();
        api.expect_create().never();

        let options = InstallOptions {
            image: "velero/velero:v1.16.0".to_string(),
            use_node_agent: false,
            default_volumes_to_fs_backup: false,
        };
        let err = engine(api, cli).install(&options).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cli);
    }

    #[tokio::test]
    async fn is_installed_skips_daemon_set_without_node_agent() {
        let mut api = MockKubeApi::new();
        api.expect_get()
            .withf(|d, _| d.kind() == ResourceKind::DAEMON_SET)
            .never();
        api.expect_get()
            .returning(|_, _| Ok(json!({"metadata": {}})));

        let engine = engine(api, MockCommandRunner::new());
        assert!(engine.is_installed(false).await.unwrap());
    }

    #[tokio::test]
    async fn is_installed_false_when_any_core_resource_missing() {
        for missing in [
            ResourceKind::DEPLOYMENT,
            ResourceKind::DAEMON_SET,
            ResourceKind::SERVICE_ACCOUNT,
            ResourceKind::SERVICE,
            ResourceKind::CLUSTER_ROLE_BINDING,
        ] {
            let mut api = MockKubeApi::new();
            api.expect_get()
                .withf(move |d, _| d.kind() == missing)
                .returning(|d, _| Err(Error::not_found(format!("{} not found", d))));
            api.expect_get()
                .returning(|_, _| Ok(json!({"metadata": {}})));

            let engine = engine(api, MockCommandRunner::new());
            assert!(
                !engine.is_installed(true).await.unwrap(),
                "{} missing should mean not installed",
                missing
            );
        }
    }

    #[tokio::test]
    async fn remove_storage_locations_requires_deployment() {
        let mut api = MockKubeApi::new();
        api.expect_delete().times(3).returning(|_, _| Ok(()));
        api.expect_patch()
            .withf(|d, _, body, kind| {
                d.kind() == ResourceKind::DEPLOYMENT
                    && *kind == PatchKind::Merge
                    && body["spec"]["template"]["spec"]["initContainers"] == json!([])
            })
            .times(1)
            .returning(|_, _, _, _| Err(Error::not_found("deployments \"velero\" not found")));

        let err = engine(api, MockCommandRunner::new())
            .remove_storage_locations()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ClusterApi);
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn configure_storage_runs_steps_in_order() {
        let mut seq = mockall::Sequence::new();
        let mut api = MockKubeApi::new();
        let mut cli = MockCommandRunner::new();

        api.expect_create()
            .withf(|kind, _, obj| {
                *kind == ResourceKind::SECRET
                    && obj["metadata"]["name"] == "cloud-credentials"
                    && obj["data"]["creds"].is_string()
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, obj| Ok(obj));
        cli.expect_run()
            .with(eq(strings(&[
                "plugin",
                "add",
                "velero/velero-plugin-for-aws:v1.10.0",
                "--confirm",
                "--namespace=velero",
            ])))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(CommandOutput::default()));
        cli.expect_run()
            .with(eq(strings(&[
                "backup-location",
                "create",
                "default",
                "--provider=aws",
                "--prefix",
                "cluster-a",
                "--bucket",
                "b",
                "--config",
                "region=r",
                "--credential=cloud-credentials=creds",
                "--default",
                "--namespace=velero",
                "--labels",
                "component=velero",
            ])))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(CommandOutput::default()));
        cli.expect_run()
            .with(eq(strings(&[
                "snapshot-location",
                "create",
                "default",
                "--provider=aws",
                "--config",
                "region=r",
                "--credential=cloud-credentials=creds",
                "--namespace=velero",
                "--labels",
                "component=velero",
            ])))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(CommandOutput::default()));

        engine(api, cli)
            .configure_storage_locations(&s3())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn configure_storage_stops_at_first_failure() {
        let mut api = MockKubeApi::new();
        api.expect_create().returning(|_, _, obj| Ok(obj));
        let mut cli = MockCommandRunner::new();
        cli.expect_run()
            .times(1)
            .returning(|_| Err(Error::cli("velero plugin add", Some(1), "", "bad image")));

        let err = engine(api, cli)
            .configure_storage_locations(&s3())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cli);
    }

    #[tokio::test]
    async fn update_image_on_missing_deployment_is_noop() {
        let mut api = MockKubeApi::new();
        api.expect_patch()
            .returning(|_, _, _, _| Err(Error::not_found("deployments \"velero\" not found")));
        engine(api, MockCommandRunner::new())
            .update_deployment_image("velero/velero:v1.17.0")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn update_image_propagates_other_errors() {
        let mut api = MockKubeApi::new();
        api.expect_patch()
            .returning(|_, _, _, _| Err(Error::cluster_api(422, "invalid")));
        let err = engine(api, MockCommandRunner::new())
            .update_deployment_image("velero/velero:v1.17.0")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ClusterApi);
        assert_eq!(err.status_code(), Some(422));
    }

    #[tokio::test]
    async fn update_image_patch_shape() {
        let mut api = MockKubeApi::new();
        api.expect_patch()
            .withf(|d, ns, body, kind| {
                d.name() == "velero"
                    && ns == "velero"
                    && *kind == PatchKind::Strategic
                    && body["spec"]["template"]["spec"]["containers"][0]["image"] == "img:2"
                    && body["spec"]["strategy"]["type"] == "Recreate"
                    && body["spec"]["strategy"]["rollingUpdate"].is_null()
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        engine(api, MockCommandRunner::new())
            .update_deployment_image("img:2")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn update_plugin_image_uses_json_patch() {
        let mut api = MockKubeApi::new();
        api.expect_patch()
            .withf(|d, _, body, kind| {
                d.kind() == ResourceKind::DEPLOYMENT
                    && *kind == PatchKind::Json
                    && body[0]["op"] == "replace"
                    && body[0]["path"] == "/spec/template/spec/initContainers/0/image"
                    && body[0]["value"] == "plugin:2"
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        engine(api, MockCommandRunner::new())
            .update_plugin_image("plugin:2")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn update_node_agent_image_targets_daemon_set() {
        let mut api = MockKubeApi::new();
        api.expect_patch()
            .withf(|d, _, body, _| {
                d.to_string() == "daemonset/node-agent"
                    && body["spec"]["template"]["spec"]["containers"][0]["name"] == "node-agent"
                    && body["spec"]["strategy"]["type"] == "Recreate"
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        engine(api, MockCommandRunner::new())
            .update_node_agent_image("velero/velero:v1.17.0")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn update_deployment_flags_replaces_existing_flag() {
        let mut api = MockKubeApi::new();
        api.expect_get().returning(|_, _| {
            Ok(json!({
                "spec": {"template": {"spec": {"containers": [{
                    "name": "velero",
                    "args": ["server", "--uploader-type=kopia", "--default-volumes-to-fs-backup=false"]
                }]}}}
            }))
        });
        api.expect_patch()
            .withf(|_, _, body, kind| {
                *kind == PatchKind::Strategic
                    && body["spec"]["template"]["spec"]["containers"][0]["args"]
                        == json!([
                            "server",
                            "--uploader-type=kopia",
                            "--default-volumes-to-fs-backup=true"
                        ])
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        engine(api, MockCommandRunner::new())
            .update_deployment_flags(true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn update_deployment_flags_requires_container_args() {
        let mut api = MockKubeApi::new();
        api.expect_get().returning(|_, _| {
            Ok(json!({"spec": {"template": {"spec": {"containers": [{"name": "velero"}]}}}}))
        });
        let err = engine(api, MockCommandRunner::new())
            .update_deployment_flags(true)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OperationFailed);
    }

    #[tokio::test]
    async fn run_cli_command_rejects_empty() {
        let mut cli = MockCommandRunner::new();
        cli.expect_run().never();
        let err = engine(MockKubeApi::new(), cli)
            .run_cli_command(&[])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn run_cli_command_appends_namespace_and_trims() {
        let mut cli = MockCommandRunner::new();
        cli.expect_run()
            .with(eq(strings(&["backup", "get", "--namespace=velero"])))
            .returning(|_| Ok(CommandOutput::stdout("NAME  STATUS\nnightly  Completed\n\n")));
        let out = engine(MockKubeApi::new(), cli)
            .run_cli_command(&strings(&["backup", "get"]))
            .await
            .unwrap();
        assert_eq!(out, "NAME  STATUS\nnightly  Completed");
    }

    #[tokio::test]
    async fn remove_all_swallows_every_failure() {
        let mut cli = MockCommandRunner::new();
        cli.expect_run()
            .returning(|_| Err(Error::cli("velero install", Some(1), "", "boom")));
        let mut api = MockKubeApi::new();
        api.expect_delete()
            .times(8)
            .returning(|_, _| Err(Error::cluster_api(500, "boom")));
        engine(api, cli).remove_all().await;
    }

    #[tokio::test]
    async fn check_storage_locations_requires_snapshot_location() {
        let mut api = MockKubeApi::new();
        api.expect_get()
            .withf(|d, _| d.kind() == ResourceKind::BACKUP_STORAGE_LOCATION)
            .returning(|_, _| Ok(json!({"status": {"phase": "Available"}})));
        api.expect_get()
            .withf(|d, _| d.kind() == ResourceKind::VOLUME_SNAPSHOT_LOCATION)
            .returning(|_, _| Err(Error::not_found("missing")));
        let err = engine(api, MockCommandRunner::new())
            .check_storage_locations()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotReady);
    }

    #[tokio::test]
    async fn check_deployment_gives_up_after_budget() {
        let mut api = MockKubeApi::new();
        api.expect_get()
            .times(3)
            .returning(|_, _| Err(Error::not_found("missing")));
        let err = engine(api, MockCommandRunner::new())
            .check_deployment()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotReady);
        assert_eq!(err.reason(), Some("not found"));
    }

    #[test]
    fn config_flag_joins_sorted_pairs() {
        let mut config = BTreeMap::new();
        config.insert("region".to_string(), "r".to_string());
        config.insert("s3Url".to_string(), "http://minio".to_string());
        assert_eq!(
            config_flag(&config),
            strings(&["--config", "region=r,s3Url=http://minio"])
        );
        assert!(config_flag(&BTreeMap::new()).is_empty());
    }
}
