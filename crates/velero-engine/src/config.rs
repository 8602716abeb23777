//! Engine configuration
//!
//! Everything that used to be a process-wide constant (binary path,
//! namespace, poll budgets) is carried here and passed into the engine.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use velero_common::retry::{self, PollConfig};
use velero_common::{Error, ErrorKind};

/// Default location of the velero binary
pub const DEFAULT_BINARY_PATH: &str = "./velero";
/// Default namespace Velero is installed into
pub const DEFAULT_NAMESPACE: &str = "velero";
/// Default server-side apply field manager
pub const DEFAULT_FIELD_MANAGER: &str = "velero-operator";

/// Attempt/delay/observation budget for one kind of poll
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct CheckBudget {
    /// Maximum number of checks
    pub attempts: u32,
    /// Seconds between checks
    pub delay_secs: u64,
    /// Extra clean observations required after the first success
    pub observations: u32,
}

impl Default for CheckBudget {
    fn default() -> Self {
        Self {
            attempts: retry::DEFAULT_ATTEMPTS,
            delay_secs: retry::DEFAULT_DELAY.as_secs(),
            observations: retry::DEFAULT_MIN_CONSECUTIVE_SUCCESSES,
        }
    }
}

impl CheckBudget {
    /// Budget for backup and restore completion
    pub fn operations() -> Self {
        Self {
            attempts: 120,
            delay_secs: 5,
            observations: 0,
        }
    }

    /// Convert to a poller configuration retrying not-ready and API errors
    pub fn poll_config(&self) -> PollConfig {
        PollConfig {
            attempts: self.attempts,
            delay: Duration::from_secs(self.delay_secs),
            min_consecutive_successes: self.observations,
            retry_on: vec![ErrorKind::NotReady, ErrorKind::ClusterApi],
        }
    }
}

/// Configuration for [`VeleroEngine`](crate::VeleroEngine)
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct VeleroConfig {
    /// Path to the velero binary
    pub binary_path: PathBuf,
    /// Namespace Velero lives in
    pub namespace: String,
    /// Field manager for server-side apply
    pub field_manager: String,
    /// Budget for deployment, node agent and storage location readiness
    pub readiness: CheckBudget,
    /// Budget for backup and restore completion
    pub operations: CheckBudget,
}

impl Default for VeleroConfig {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::from(DEFAULT_BINARY_PATH),
            namespace: DEFAULT_NAMESPACE.to_string(),
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
            readiness: CheckBudget::default(),
            operations: CheckBudget::operations(),
        }
    }
}

impl VeleroConfig {
    /// Default configuration targeting `namespace`
    pub fn for_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// Parse a JSON configuration document; missing fields take defaults
    pub fn from_json(input: &str) -> Result<Self, Error> {
        let config: Self = serde_json::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations no operation could run with
    pub fn validate(&self) -> Result<(), Error> {
        if self.namespace.trim().is_empty() {
            return Err(Error::invalid_argument("namespace must not be empty"));
        }
        if self.readiness.attempts == 0 || self.operations.attempts == 0 {
            return Err(Error::invalid_argument("poll attempts must be at least 1"));
        }
        Ok(())
    }
}
