//! The RestoreTest record: identity, immutable spec, append-style status.

#![allow(missing_docs)]

pub mod phase;
pub mod spec;
pub mod status;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::naming::short_hash;

pub use phase::Phase;
pub use spec::{CleanupSpec, NotificationSpec, NotifyRoute, RestoreFilters, RestoreTestSpec, SecretTarget};
pub use status::{CleanupResolution, CleanupState, Condition, RestoreState, RestoreTestStatus, TestResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub name: String,
    /// Distinguishes re-creations under the same name.
    pub uid: String,
    /// Optimistic-concurrency token; bumped by every status write.
    pub resource_version: u64,
    pub creation_timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_requested_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreTest {
    pub metadata: Metadata,
    pub spec: RestoreTestSpec,
    #[serde(default)]
    pub status: RestoreTestStatus,
}

impl RestoreTest {
    /// A fresh record in `Pending`.
    #[must_use]
    pub fn new(name: impl Into<String>, spec: RestoreTestSpec, created_at: DateTime<Utc>) -> Self {
        let name = name.into();
        let stamp = created_at.timestamp_nanos_opt().unwrap_or_default();
        let uid = format!(
            "{}{}",
            short_hash(&format!("{name}/{stamp}")),
            short_hash(&format!("{stamp}/{name}"))
        );
        Self {
            metadata: Metadata {
                name,
                uid,
                resource_version: 0,
                creation_timestamp: created_at,
                deletion_requested_at: None,
            },
            spec,
            status: RestoreTestStatus::default(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    #[must_use]
    pub const fn is_deleting(&self) -> bool {
        self.metadata.deletion_requested_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_records_start_pending_with_stable_uid() {
        let at = Utc::now();
        let a = RestoreTest::new("nightly", RestoreTestSpec::for_backup("b"), at);
        let b = RestoreTest::new("nightly", RestoreTestSpec::for_backup("b"), at);
        assert_eq!(a.status.phase, Phase::Pending);
        assert_eq!(a.metadata.uid, b.metadata.uid);
        assert_eq!(a.metadata.uid.len(), 16);
        assert!(!a.is_deleting());
    }

    #[test]
    fn record_round_trips_through_json() {
        let test = RestoreTest::new("t", RestoreTestSpec::for_backup("b"), Utc::now());
        let json = serde_json::to_string(&test).unwrap();
        let back: RestoreTest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, test);
    }
}
