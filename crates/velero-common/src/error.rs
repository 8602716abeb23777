//! Error types for the Velero lifecycle engine
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the context an operator needs to act on it: the
//! offending provider fields, the failed command and its output, or the
//! resource that never became ready.

use thiserror::Error;

/// Main error type for Velero lifecycle operations
#[derive(Debug, Error)]
pub enum Error {
    /// Storage provider configuration failed validation
    #[error("invalid {provider} storage configuration: {}", .problems.join("; "))]
    ConfigValidation {
        /// Storage backend the configuration was meant for (s3, azure)
        provider: String,
        /// Every missing or malformed field, in a human-readable form
        problems: Vec<String>,
    },

    /// Kubernetes API error
    #[error("cluster API error{}: {message}", .code.map(|c| format!(" ({c})")).unwrap_or_default())]
    ClusterApi {
        /// HTTP status code returned by the API server, if any
        code: Option<u16>,
        /// Description of what failed
        message: String,
    },

    /// External velero binary exited unsuccessfully
    #[error("command `{command}` failed{}: {stderr}", .exit_code.map(|c| format!(" with exit code {c}")).unwrap_or_default())]
    Cli {
        /// The command line that was run
        command: String,
        /// Process exit code (None when killed, timed out or never spawned)
        exit_code: Option<i32>,
        /// Captured standard output
        stdout: String,
        /// Captured standard error
        stderr: String,
    },

    /// A resource was observed but is not (yet) ready
    #[error("{resource} not ready: {reason}")]
    NotReady {
        /// Resource being checked (e.g., "deployment/velero")
        resource: String,
        /// Last observed reason
        reason: String,
    },

    /// A backup, restore or resource reached a terminal failed state
    #[error("{resource} failed: {reason}")]
    OperationFailed {
        /// Resource that failed
        resource: String,
        /// Description of the failure
        reason: String,
    },

    /// Caller passed arguments that violate an operation's contract
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },
}

/// Coarse classification of [`Error`] used to decide what is retryable
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// [`Error::ConfigValidation`]
    ConfigValidation,
    /// [`Error::ClusterApi`]
    ClusterApi,
    /// [`Error::Cli`]
    Cli,
    /// [`Error::NotReady`]
    NotReady,
    /// [`Error::OperationFailed`]
    OperationFailed,
    /// [`Error::InvalidArgument`]
    InvalidArgument,
    /// [`Error::Serialization`]
    Serialization,
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) => Self::ClusterApi {
                code: Some(ae.code),
                message: ae.message,
            },
            other => Self::ClusterApi {
                code: None,
                message: other.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

impl Error {
    /// Create a configuration validation error
    pub fn config_validation(provider: impl Into<String>, problems: Vec<String>) -> Self {
        Self::ConfigValidation {
            provider: provider.into(),
            problems,
        }
    }

    /// Create a cluster API error with an HTTP status code
    pub fn cluster_api(code: u16, msg: impl Into<String>) -> Self {
        Self::ClusterApi {
            code: Some(code),
            message: msg.into(),
        }
    }

    /// Create a not-found cluster API error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::cluster_api(404, msg)
    }

    /// Create a CLI error from a failed invocation
    pub fn cli(
        command: impl Into<String>,
        exit_code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) -> Self {
        Self::Cli {
            command: command.into(),
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    /// Create a not-ready error for a resource
    pub fn not_ready(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NotReady {
            resource: resource.into(),
            reason: reason.into(),
        }
    }

    /// Create an operation-failed error for a resource
    pub fn operation_failed(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::OperationFailed {
            resource: resource.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ConfigValidation { .. } => ErrorKind::ConfigValidation,
            Error::ClusterApi { .. } => ErrorKind::ClusterApi,
            Error::Cli { .. } => ErrorKind::Cli,
            Error::NotReady { .. } => ErrorKind::NotReady,
            Error::OperationFailed { .. } => ErrorKind::OperationFailed,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::Serialization { .. } => ErrorKind::Serialization,
        }
    }

    /// HTTP status code of a cluster API error
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::ClusterApi { code, .. } => *code,
            _ => None,
        }
    }

    /// Whether this is a cluster API "not found" (404)
    pub fn is_not_found(&self) -> bool {
        self.status_code() == Some(404)
    }

    /// Whether this is a cluster API "already exists" conflict (409)
    pub fn is_conflict(&self) -> bool {
        self.status_code() == Some(409)
    }

    /// The reason text of a not-ready or failed resource
    pub fn reason(&self) -> Option<&str> {
        match self {
            Error::NotReady { reason, .. } | Error::OperationFailed { reason, .. } => Some(reason),
            _ => None,
        }
    }
}
