//! Cleanup/TTL Manager: removal of a test's ephemeral resources.

#![allow(missing_docs)]

pub mod kubectl;
pub mod manager;
pub mod memory;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::errors::Result;
use crate::restore::gateway::{LABEL_BACKUP, LABEL_TEST, LABEL_TEST_NAME};

pub use kubectl::KubectlCleaner;
pub use manager::{CleanupManager, CleanupPolicy, CleanupProgress};
pub use memory::InMemoryCleaner;

pub const LABEL_MANAGED_BY: &str = "lazarus.io/managed-by";
pub const MANAGED_BY: &str = "lazarus";

/// Labels stamped on a namespace created for `test`.
#[must_use]
pub fn test_namespace_labels(test: &str, backup: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_TEST.to_string(), "true".to_string()),
        (LABEL_BACKUP.to_string(), backup.to_string()),
        (LABEL_TEST_NAME.to_string(), test.to_string()),
        (LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string()),
    ])
}

/// Whether a namespace carrying `labels` was created for `test`.
#[must_use]
pub fn namespace_owned_by(labels: &BTreeMap<String, String>, test: &str) -> bool {
    labels.get(LABEL_MANAGED_BY).map(String::as_str) == Some(MANAGED_BY)
        && labels.get(LABEL_TEST_NAME).map(String::as_str) == Some(test)
}

/// Result of deleting one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deletion {
    Deleted,
    /// Nothing to delete; counts as success.
    Absent,
    /// Exists but is not ours; left in place.
    Skipped,
}

/// A resource owned by a test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resource {
    Namespace { name: String },
    Restore { namespace: String, name: String },
    Secret { namespace: String, name: String },
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Namespace { name } => write!(f, "namespace/{name}"),
            Self::Restore { namespace, name } => write!(f, "restore/{namespace}/{name}"),
            Self::Secret { namespace, name } => write!(f, "secret/{namespace}/{name}"),
        }
    }
}

/// Creates test namespaces and deletes cluster resources. Deleting something
/// already gone is `Absent`, never an error.
pub trait ResourceCleaner: Send + Sync {
    /// Labels of namespace `name`; `None` when it does not exist.
    fn namespace_labels(&self, name: &str) -> Result<Option<BTreeMap<String, String>>>;

    /// `AlreadyExists` when a namespace called `name` is present.
    fn create_namespace(&self, name: &str, labels: &BTreeMap<String, String>) -> Result<()>;

    fn delete(&self, resource: &Resource) -> Result<Deletion>;
}

/// Summary of one cleanup run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupOutcome {
    pub success: bool,
    pub deleted: Vec<String>,
    pub already_absent: Vec<String>,
    /// Resources found but not owned by the test.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<String>,
    pub errors: Vec<String>,
}
