//! Common plumbing for the Velero lifecycle engine: errors, cluster access,
//! readiness polling and velero binary invocation

#![deny(missing_docs)]

pub mod command;
pub mod error;
pub mod gateway;
pub mod kube_utils;
pub mod retry;
pub mod yaml;

pub use error::{Error, ErrorKind};
pub use gateway::ClusterResourceGateway;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Label key/value Velero puts on every object it owns
pub const COMPONENT_LABEL: (&str, &str) = ("component", "velero");
