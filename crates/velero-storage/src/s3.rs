//! S3-compatible object storage (AWS, MinIO, Ceph RGW, ...)

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use velero_common::Error;

use crate::{optional, parse_raw, require, StorageBackend};

const PROVIDER: &str = "s3";

/// Addressing style for S3 requests
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum S3UriStyle {
    /// `https://endpoint/bucket/key`
    Path,
    /// `https://bucket.endpoint/key`
    Virtual,
}

impl S3UriStyle {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "path" => Some(Self::Path),
            "virtual" => Some(Self::Virtual),
            _ => None,
        }
    }
}

impl fmt::Display for S3UriStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            S3UriStyle::Path => f.write_str("path"),
            S3UriStyle::Virtual => f.write_str("virtual"),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawS3Config {
    bucket: Option<String>,
    region: Option<String>,
    endpoint: Option<String>,
    path: Option<String>,
    s3_uri_style: Option<String>,
    access_key: Option<String>,
    secret_key: Option<String>,
}

/// Validated S3 backend configuration
#[derive(Clone, PartialEq, Eq)]
pub struct S3Provider {
    plugin_image: String,
    bucket: String,
    region: Option<String>,
    endpoint: Option<String>,
    path: Option<String>,
    uri_style: Option<S3UriStyle>,
    access_key: String,
    secret_key: String,
}

// Keeps the secret key out of logs.
impl fmt::Debug for S3Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Provider")
            .field("plugin_image", &self.plugin_image)
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("path", &self.path)
            .field("uri_style", &self.uri_style)
            .finish_non_exhaustive()
    }
}

impl S3Provider {
    /// Validate `config` (keys: `bucket`, `access-key`, `secret-key`, and
    /// optionally `region`, `endpoint`, `path`, `s3-uri-style`)
    pub fn from_config(
        config: &BTreeMap<String, String>,
        plugin_image: impl Into<String>,
    ) -> Result<Self, Error> {
        let raw: RawS3Config = parse_raw(PROVIDER, config)?;
        let mut problems = Vec::new();

        let bucket = require("bucket", raw.bucket, &mut problems);
        let access_key = require("access-key", raw.access_key, &mut problems);
        let secret_key = require("secret-key", raw.secret_key, &mut problems);

        let uri_style = match optional(raw.s3_uri_style) {
            None => None,
            Some(style) => match S3UriStyle::parse(&style) {
                Some(s) => Some(s),
                None => {
                    problems.push(format!(
                        "field 's3-uri-style' must be 'path' or 'virtual', got '{}'",
                        style
                    ));
                    None
                }
            },
        };

        match (bucket, access_key, secret_key) {
            (Some(bucket), Some(access_key), Some(secret_key)) if problems.is_empty() => {
                Ok(Self {
                    plugin_image: plugin_image.into(),
                    bucket,
                    region: optional(raw.region),
                    endpoint: optional(raw.endpoint),
                    path: optional(raw.path),
                    uri_style,
                    access_key,
                    secret_key,
                })
            }
            _ => Err(Error::config_validation(PROVIDER, problems)),
        }
    }

    /// Configured region
    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    /// Configured addressing style
    pub fn uri_style(&self) -> Option<S3UriStyle> {
        self.uri_style
    }
}

impl StorageBackend for S3Provider {
    fn plugin(&self) -> &str {
        "aws"
    }

    fn plugin_image(&self) -> &str {
        &self.plugin_image
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    fn credentials_file(&self) -> String {
        format!(
            "[default]\naws_access_key_id={}\naws_secret_access_key={}\n",
            self.access_key, self.secret_key
        )
    }

    fn backup_location_config(&self) -> BTreeMap<String, String> {
        let mut config = BTreeMap::new();
        if let Some(endpoint) = &self.endpoint {
            config.insert("s3Url".to_string(), endpoint.clone());
        }
        if let Some(region) = &self.region {
            config.insert("region".to_string(), region.clone());
        }
        if self.uri_style == Some(S3UriStyle::Path) {
            config.insert("s3ForcePathStyle".to_string(), "true".to_string());
        }
        config
    }

    fn volume_snapshot_location_config(&self) -> BTreeMap<String, String> {
        self.region
            .iter()
            .map(|r| ("region".to_string(), r.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use velero_common::ErrorKind;

    const IMAGE: &str = "velero/velero-plugin-for-aws:v1.10.0";

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn minimal() -> BTreeMap<String, String> {
        map(&[
            ("bucket", "b"),
            ("region", "r"),
            ("access-key", "ak"),
            ("secret-key", "sk"),
        ])
    }

    #[test]
    fn secret_payload_decodes_to_aws_profile() {
        let provider = S3Provider::from_config(&minimal(), IMAGE).unwrap();
        let decoded = STANDARD.decode(provider.secret_payload()).unwrap();
        assert_eq!(
            String::from_utf8(decoded).unwrap(),
            "[default]\naws_access_key_id=ak\naws_secret_access_key=sk\n"
        );
    }

    #[test]
    fn region_only_config() {
        let provider = S3Provider::from_config(&minimal(), IMAGE).unwrap();
        assert_eq!(provider.backup_location_config(), map(&[("region", "r")]));
        assert_eq!(
            provider.volume_snapshot_location_config(),
            map(&[("region", "r")])
        );
        assert_eq!(provider.plugin(), "aws");
        assert_eq!(provider.plugin_image(), IMAGE);
        assert_eq!(provider.path(), None);
    }

    #[test]
    fn endpoint_and_path_style() {
        let mut config = minimal();
        config.insert("endpoint".into(), "https://minio.local:9000".into());
        config.insert("s3-uri-style".into(), "path".into());
        config.insert("path".into(), "cluster-a".into());

        let provider = S3Provider::from_config(&config, IMAGE).unwrap();
        assert_eq!(
            provider.backup_location_config(),
            map(&[
                ("region", "r"),
                ("s3ForcePathStyle", "true"),
                ("s3Url", "https://minio.local:9000"),
            ])
        );
        assert_eq!(provider.path(), Some("cluster-a"));
        assert_eq!(provider.uri_style(), Some(S3UriStyle::Path));
    }

    #[test]
    fn virtual_style_does_not_force_path_style() {
        let mut config = minimal();
        config.insert("s3-uri-style".into(), "virtual".into());
        let provider = S3Provider::from_config(&config, IMAGE).unwrap();
        assert!(!provider
            .backup_location_config()
            .contains_key("s3ForcePathStyle"));
    }

    #[test]
    fn no_region_means_empty_snapshot_config() {
        let config = map(&[("bucket", "b"), ("access-key", "ak"), ("secret-key", "sk")]);
        let provider = S3Provider::from_config(&config, IMAGE).unwrap();
        assert!(provider.volume_snapshot_location_config().is_empty());
        assert!(provider.backup_location_config().is_empty());
    }

    #[test]
    fn validation_lists_every_problem() {
        let config = map(&[("region", "r"), ("s3-uri-style", "sideways"), ("secret-key", "")]);
        let err = S3Provider::from_config(&config, IMAGE).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigValidation);
        match err {
            Error::ConfigValidation { provider, problems } => {
                assert_eq!(provider, "s3");
                assert_eq!(problems.len(), 4);
                let all = problems.join("\n");
                assert!(all.contains("'bucket'"));
                assert!(all.contains("'access-key'"));
                assert!(all.contains("'secret-key' must not be empty"));
                assert!(all.contains("sideways"));
            }
            other => panic!("expected ConfigValidation, got {:?}", other),
        }
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let mut config = minimal();
        config.insert("storage-class".into(), "GLACIER".into());
        assert!(S3Provider::from_config(&config, IMAGE).is_ok());
    }

    #[test]
    fn debug_hides_credentials() {
        let mut config = minimal();
        config.insert("access-key".into(), "AKIAEXAMPLE".into());
        config.insert("secret-key".into(), "wJalrXUtnSECRET".into());
        let provider = S3Provider::from_config(&config, IMAGE).unwrap();
        let debug = format!("{:?}", provider);
        assert!(debug.contains("S3Provider"));
        assert!(!debug.contains("AKIAEXAMPLE"));
        assert!(!debug.contains("wJalrXUtnSECRET"));
    }
}
