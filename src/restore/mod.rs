//! Restore Gateway and the external restore subsystem it drives.

#![allow(missing_docs)]

pub mod gateway;
pub mod memory;
pub mod velero;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::errors::Result;
use crate::model::RestoreState;

pub use gateway::{RestoreGateway, RestoreTarget};
pub use memory::InMemoryRestoreSubsystem;
pub use velero::KubectlRestoreSubsystem;

/// Phase of a backup as reported by the subsystem.
pub const BACKUP_COMPLETED: &str = "Completed";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupInfo {
    pub name: String,
    pub phase: String,
    /// Namespaces captured by the backup; empty means cluster-wide.
    pub included_namespaces: Vec<String>,
}

/// Everything needed to create one restore object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreRequest {
    pub name: String,
    pub namespace: String,
    pub backup_name: String,
    pub restore_pvs: bool,
    pub restore_status: bool,
    pub namespace_mapping: BTreeMap<String, String>,
    pub included_namespaces: Vec<String>,
    pub excluded_namespaces: Vec<String>,
    pub included_resources: Vec<String>,
    pub excluded_resources: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestoreStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    PartiallyFailed,
}

impl RestoreStatus {
    /// Map a subsystem phase string. Unknown phases read as in progress.
    #[must_use]
    pub fn from_external(raw: &str) -> Self {
        match raw {
            "" | "New" => Self::Pending,
            "Completed" => Self::Completed,
            "PartiallyFailed" => Self::PartiallyFailed,
            "Failed" | "FailedValidation" => Self::Failed,
            _ => Self::InProgress,
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::PartiallyFailed)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::InProgress => "InProgress",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::PartiallyFailed => "PartiallyFailed",
        }
    }
}

impl fmt::Display for RestoreStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a restore object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalRestore {
    pub name: String,
    pub status: RestoreStatus,
    /// Phase string exactly as the subsystem reported it.
    pub raw_phase: String,
    pub items_attempted: u64,
    pub items_restored: u64,
    pub error_count: u64,
    pub warning_count: u64,
    pub warnings: Vec<String>,
    pub failure_reason: Option<String>,
}

impl ExternalRestore {
    /// Copy the observation onto the persisted restore state.
    pub fn apply_to(&self, state: &mut RestoreState) {
        state.restore_id = Some(self.name.clone());
        state.external_phase = Some(self.raw_phase.clone());
        state.items_attempted = self.items_attempted;
        state.items_restored = self.items_restored;
        state.error_count = self.error_count;
        state.warning_count = self.warning_count;
        for warning in &self.warnings {
            if !state.warnings.contains(warning) {
                state.warnings.push(warning.clone());
            }
        }
    }
}

/// The external restore subsystem. Implementations never retry; callers do.
pub trait RestoreSubsystem: Send + Sync {
    /// `Ok(None)` when no such backup exists.
    fn get_backup(&self, namespace: &str, name: &str) -> Result<Option<BackupInfo>>;
    /// `AlreadyExists` when a restore with the same name is present.
    fn create_restore(&self, request: &RestoreRequest) -> Result<()>;
    /// `Ok(None)` when no such restore exists.
    fn get_restore(&self, namespace: &str, name: &str) -> Result<Option<ExternalRestore>>;
    /// `Ok(false)` when the restore was already gone.
    fn delete_restore(&self, namespace: &str, name: &str) -> Result<bool>;
}
