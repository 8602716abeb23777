//! Velero lifecycle engine
//!
//! Installs Velero with its own binary, wires a storage backend into it,
//! verifies readiness, performs upgrades and tears everything down again:
//!
//! - **engine**: [`VeleroEngine`] and the install/configure/remove/update operations
//! - **readiness**: single-observation checks for the Deployment, node agent
//!   DaemonSet, storage location and backup/restore phases
//! - **backup**: on-demand backups, restores and backup listing
//! - **resources**: the fixed object set of an installation
//! - **crd**: typed Velero Backup and Restore resources
//! - **config**: [`VeleroConfig`] and poll budgets

#![deny(missing_docs)]

pub mod backup;
pub mod config;
pub mod crd;
pub mod engine;
pub mod readiness;
pub mod resources;

pub use backup::{BackupInfo, BackupSpec};
pub use config::{CheckBudget, VeleroConfig};
pub use crd::ExistingResourcePolicy;
pub use engine::{InstallOptions, VeleroEngine};
pub use velero_storage::StorageProvider;
