//! Azure Blob storage
//!
//! Two credential modes are supported and exactly one must be configured:
//! a storage account shared key, or a service principal (subscription,
//! tenant, client id and secret) authenticating through Azure AD.

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use velero_common::Error;

use crate::{optional, parse_raw, require, StorageBackend};

const PROVIDER: &str = "azure";
const CLOUD_NAME: &str = "AzurePublicCloud";
const ACCOUNT_KEY_ENV_VAR: &str = "AZURE_STORAGE_ACCOUNT_ACCESS_KEY";

const SERVICE_PRINCIPAL_FIELDS: [&str; 4] =
    ["subscription-id", "tenant-id", "client-id", "client-secret"];

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawAzureConfig {
    container: Option<String>,
    storage_account: Option<String>,
    path: Option<String>,
    secret_key: Option<String>,
    subscription_id: Option<String>,
    tenant_id: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
}

/// How Velero authenticates against the storage account
#[derive(Clone, PartialEq, Eq)]
pub enum AzureCredentials {
    /// Storage account access key
    SharedKey {
        /// The account key
        secret_key: String,
    },
    /// Azure AD service principal
    ServicePrincipal {
        /// Subscription id
        subscription_id: String,
        /// Tenant id
        tenant_id: String,
        /// Application (client) id
        client_id: String,
        /// Client secret
        client_secret: String,
    },
}

impl fmt::Debug for AzureCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AzureCredentials::SharedKey { .. } => f.write_str("SharedKey"),
            AzureCredentials::ServicePrincipal {
                subscription_id,
                tenant_id,
                client_id,
                ..
            } => f
                .debug_struct("ServicePrincipal")
                .field("subscription_id", subscription_id)
                .field("tenant_id", tenant_id)
                .field("client_id", client_id)
                .finish_non_exhaustive(),
        }
    }
}

/// Validated Azure backend configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AzureProvider {
    plugin_image: String,
    container: String,
    storage_account: String,
    path: Option<String>,
    credentials: AzureCredentials,
}

impl AzureProvider {
    /// Validate `config` (keys: `container`, `storage-account`, optional
    /// `path`, and either `secret-key` or all of `subscription-id`,
    /// `tenant-id`, `client-id`, `client-secret`)
    pub fn from_config(
        config: &BTreeMap<String, String>,
        plugin_image: impl Into<String>,
    ) -> Result<Self, Error> {
        let raw: RawAzureConfig = parse_raw(PROVIDER, config)?;
        let mut problems = Vec::new();

        let container = require("container", raw.container, &mut problems);
        let storage_account = require("storage-account", raw.storage_account, &mut problems);
        let credentials = resolve_credentials(
            optional(raw.secret_key),
            [
                optional(raw.subscription_id),
                optional(raw.tenant_id),
                optional(raw.client_id),
                optional(raw.client_secret),
            ],
            &mut problems,
        );

        match (container, storage_account, credentials) {
            (Some(container), Some(storage_account), Some(credentials)) if problems.is_empty() => {
                Ok(Self {
                    plugin_image: plugin_image.into(),
                    container,
                    storage_account,
                    path: optional(raw.path),
                    credentials,
                })
            }
            _ => Err(Error::config_validation(PROVIDER, problems)),
        }
    }

    /// Storage account name
    pub fn storage_account(&self) -> &str {
        &self.storage_account
    }

    /// Credential mode in use
    pub fn credentials(&self) -> &AzureCredentials {
        &self.credentials
    }
}

fn resolve_credentials(
    secret_key: Option<String>,
    principal: [Option<String>; 4],
    problems: &mut Vec<String>,
) -> Option<AzureCredentials> {
    let any_principal = principal.iter().any(Option::is_some);

    match (secret_key, any_principal) {
        (Some(_), true) => {
            problems.push(
                "'secret-key' and service principal fields are mutually exclusive".to_string(),
            );
            None
        }
        (Some(secret_key), false) => Some(AzureCredentials::SharedKey { secret_key }),
        (None, true) => {
            let missing: Vec<&str> = SERVICE_PRINCIPAL_FIELDS
                .iter()
                .zip(principal.iter())
                .filter(|(_, v)| v.is_none())
                .map(|(name, _)| *name)
                .collect();
            if !missing.is_empty() {
                problems.push(format!(
                    "incomplete service principal, missing: {}",
                    missing.join(", ")
                ));
                return None;
            }
            let [subscription_id, tenant_id, client_id, client_secret] = principal;
            Some(AzureCredentials::ServicePrincipal {
                subscription_id: subscription_id?,
                tenant_id: tenant_id?,
                client_id: client_id?,
                client_secret: client_secret?,
            })
        }
        (None, false) => {
            problems.push(
                "no credentials: set 'secret-key' or 'subscription-id', 'tenant-id', \
                 'client-id' and 'client-secret'"
                    .to_string(),
            );
            None
        }
    }
}

impl StorageBackend for AzureProvider {
    fn plugin(&self) -> &str {
        "azure"
    }

    fn plugin_image(&self) -> &str {
        &self.plugin_image
    }

    fn bucket(&self) -> &str {
        &self.container
    }

    fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    fn credentials_file(&self) -> String {
        match &self.credentials {
            AzureCredentials::ServicePrincipal {
                subscription_id,
                tenant_id,
                client_id,
                client_secret,
            } => format!(
                "AZURE_SUBSCRIPTION_ID={subscription_id}\n\
                 AZURE_TENANT_ID={tenant_id}\n\
                 AZURE_CLIENT_ID={client_id}\n\
                 AZURE_CLIENT_SECRET={client_secret}\n\
                 AZURE_CLOUD_NAME={CLOUD_NAME}\n"
            ),
            AzureCredentials::SharedKey { secret_key } => {
                format!("{ACCOUNT_KEY_ENV_VAR}={secret_key}\nAZURE_CLOUD_NAME={CLOUD_NAME}\n")
            }
        }
    }

    fn backup_location_config(&self) -> BTreeMap<String, String> {
        let mut config = BTreeMap::new();
        config.insert("storageAccount".to_string(), self.storage_account.clone());
        match self.credentials {
            AzureCredentials::ServicePrincipal { .. } => {
                config.insert("useAAD".to_string(), "true".to_string());
            }
            AzureCredentials::SharedKey { .. } => {
                config.insert(
                    "storageAccountKeyEnvVar".to_string(),
                    ACCOUNT_KEY_ENV_VAR.to_string(),
                );
            }
        }
        config
    }

    fn volume_snapshot_location_config(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}
