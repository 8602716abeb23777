//! Storage backends for Velero
//!
//! A backend validates its configuration once at construction and then
//! derives everything the engine needs to wire it into the cluster:
//!
//! - the credentials file stored in the `cloud-credentials` Secret
//! - the object-store plugin name and image
//! - `--config` flags for the default backup and snapshot locations
//!
//! [`StorageProvider`] is the closed set of supported backends.

#![deny(missing_docs)]

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::DeserializeOwned;
use velero_common::Error;

pub mod azure;
pub mod s3;

pub use azure::{AzureCredentials, AzureProvider};
pub use s3::{S3Provider, S3UriStyle};

/// Base64-encode a credentials file for transport in a Secret
pub fn encode_secret(credentials: &str) -> String {
    STANDARD.encode(credentials)
}

/// Capabilities every storage backend provides
pub trait StorageBackend {
    /// Velero provider name (`aws`, `azure`)
    fn plugin(&self) -> &str;

    /// Plugin image added with `velero plugin add`
    fn plugin_image(&self) -> &str;

    /// Bucket or container name
    fn bucket(&self) -> &str;

    /// Prefix within the bucket, if any
    fn path(&self) -> Option<&str>;

    /// Credentials file contents, unencoded
    fn credentials_file(&self) -> String;

    /// Credentials file as stored in the Secret (base64)
    fn secret_payload(&self) -> String {
        encode_secret(&self.credentials_file())
    }

    /// Config for the default BackupStorageLocation
    fn backup_location_config(&self) -> BTreeMap<String, String>;

    /// Config for the default VolumeSnapshotLocation
    fn volume_snapshot_location_config(&self) -> BTreeMap<String, String>;
}

/// Supported storage backends
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageProvider {
    /// S3-compatible object storage
    S3(S3Provider),
    /// Azure Blob storage
    Azure(AzureProvider),
}

impl StorageProvider {
    /// Build an S3 backend from its key/value configuration
    pub fn s3(
        config: &BTreeMap<String, String>,
        plugin_image: impl Into<String>,
    ) -> Result<Self, Error> {
        S3Provider::from_config(config, plugin_image).map(Self::S3)
    }

    /// Build an Azure backend from its key/value configuration
    pub fn azure(
        config: &BTreeMap<String, String>,
        plugin_image: impl Into<String>,
    ) -> Result<Self, Error> {
        AzureProvider::from_config(config, plugin_image).map(Self::Azure)
    }

    /// Build a backend by name (`s3` or `azure`)
    pub fn from_config(
        backend: &str,
        config: &BTreeMap<String, String>,
        plugin_image: impl Into<String>,
    ) -> Result<Self, Error> {
        match backend {
            "s3" => Self::s3(config, plugin_image),
            "azure" => Self::azure(config, plugin_image),
            other => Err(Error::invalid_argument(format!(
                "unknown storage backend '{}', expected 's3' or 'azure'",
                other
            ))),
        }
    }

    fn backend(&self) -> &dyn StorageBackend {
        match self {
            StorageProvider::S3(p) => p,
            StorageProvider::Azure(p) => p,
        }
    }
}

impl StorageBackend for StorageProvider {
    fn plugin(&self) -> &str {
        self.backend().plugin()
    }
    fn plugin_image(&self) -> &str {
        self.backend().plugin_image()
    }
    fn bucket(&self) -> &str {
        self.backend().bucket()
    }
    fn path(&self) -> Option<&str> {
        self.backend().path()
    }
    fn credentials_file(&self) -> String {
        self.backend().credentials_file()
    }
    fn backup_location_config(&self) -> BTreeMap<String, String> {
        self.backend().backup_location_config()
    }
    fn volume_snapshot_location_config(&self) -> BTreeMap<String, String> {
        self.backend().volume_snapshot_location_config()
    }
}

// =============================================================================
// Validation helpers
// =============================================================================

/// Deserialize a key/value map into a backend's raw (all-optional) config.
///
/// Unknown keys are ignored.
pub(crate) fn parse_raw<T: DeserializeOwned>(
    provider: &str,
    config: &BTreeMap<String, String>,
) -> Result<T, Error> {
    let value = serde_json::to_value(config)?;
    serde_json::from_value(value)
        .map_err(|e| Error::config_validation(provider, vec![e.to_string()]))
}

/// Take a required field, recording a problem when it is missing or blank
pub(crate) fn require(
    field: &str,
    value: Option<String>,
    problems: &mut Vec<String>,
) -> Option<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Some(v),
        Some(_) => {
            problems.push(format!("field '{}' must not be empty", field));
            None
        }
        None => {
            problems.push(format!("missing required field '{}'", field));
            None
        }
    }
}

/// Drop blank optional values
pub(crate) fn optional(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use velero_common::ErrorKind;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_encode_secret_is_standard_base64() {
        assert_eq!(encode_secret("creds"), "Y3JlZHM=");
    }

    #[test]
    fn test_from_config_dispatches_by_name() {
        let s3 = StorageProvider::from_config(
            "s3",
            &map(&[("bucket", "b"), ("access-key", "ak"), ("secret-key", "sk")]),
            "velero/velero-plugin-for-aws:v1.10.0",
        )
        .unwrap();
        assert_eq!(s3.plugin(), "aws");
        assert_eq!(s3.bucket(), "b");

        let azure = StorageProvider::from_config(
            "azure",
            &map(&[
                ("container", "c"),
                ("storage-account", "acct"),
                ("secret-key", "key"),
            ]),
            "velero/velero-plugin-for-microsoft-azure:v1.10.0",
        )
        .unwrap();
        assert_eq!(azure.plugin(), "azure");
        assert_eq!(
            azure.plugin_image(),
            "velero/velero-plugin-for-microsoft-azure:v1.10.0"
        );
    }

    #[test]
    fn test_from_config_rejects_unknown_backend() {
        let err = StorageProvider::from_config("gcs", &BTreeMap::new(), "img").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_require_reports_missing_and_blank() {
        let mut problems = Vec::new();
        assert!(require("bucket", None, &mut problems).is_none());
        assert!(require("region", Some("  ".into()), &mut problems).is_none());
        assert_eq!(require("x", Some("v".into()), &mut problems).as_deref(), Some("v"));
        assert_eq!(
            problems,
            vec![
                "missing required field 'bucket'".to_string(),
                "field 'region' must not be empty".to_string(),
            ]
        );
    }
}
