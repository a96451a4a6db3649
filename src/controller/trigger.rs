//! Creation contract for whatever decides that a backup should be tested.
//!
//! Triggers deliver at least once, so creation is idempotent: asking again
//! for the same backup under the same name returns the stored record.

#![allow(missing_docs)]

use std::time::Duration;

use crate::core::clock::Clock;
use crate::core::errors::{LzrError, Result};
use crate::core::naming::{format_duration, is_dns_label, sanitize_resource_name};
use crate::model::{RestoreTest, RestoreTestSpec};
use crate::store::TestStore;

/// Names derived from a backup leave room for a suffix.
const DERIVED_NAME_LEN: usize = 52;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerRequest {
    /// Record name; derived from the backup when absent.
    pub name: Option<String>,
    pub backup_reference: String,
    pub backup_namespace: Option<String>,
    pub restore_namespace: Option<String>,
    pub ttl: Option<Duration>,
}

impl TriggerRequest {
    #[must_use]
    pub fn for_backup(backup_reference: impl Into<String>) -> Self {
        Self {
            backup_reference: backup_reference.into(),
            ..Self::default()
        }
    }

    /// The record name this request resolves to.
    pub fn resolved_name(&self) -> Result<String> {
        let name = match &self.name {
            Some(name) => name.clone(),
            None => {
                let derived = sanitize_resource_name(
                    &format!("restore-test-{}", self.backup_reference),
                    DERIVED_NAME_LEN,
                );
                if derived.is_empty() {
                    return Err(LzrError::validation(format!(
                        "cannot derive a test name from backup {:?}",
                        self.backup_reference
                    )));
                }
                derived
            }
        };
        if !is_dns_label(&name) {
            return Err(LzrError::validation(format!(
                "test name {name:?} is not a DNS-1123 label"
            )));
        }
        Ok(name)
    }

    #[must_use]
    pub fn to_spec(&self) -> RestoreTestSpec {
        let mut spec = RestoreTestSpec::for_backup(self.backup_reference.clone());
        spec.backup_namespace.clone_from(&self.backup_namespace);
        spec.restore_namespace.clone_from(&self.restore_namespace);
        spec.ttl = self.ttl.map(format_duration);
        spec
    }
}

/// Create the record for `request`, or return the existing one if it was
/// already created for the same backup. Spec problems are not rejected here;
/// the reconciler records them as a failed outcome.
pub fn create_test(store: &dyn TestStore, clock: &dyn Clock, request: &TriggerRequest) -> Result<RestoreTest> {
    let name = request.resolved_name()?;
    create_from_spec(store, clock, &name, request.to_spec())
}

/// Same contract as [`create_test`] for a fully specified record.
pub fn create_from_spec(
    store: &dyn TestStore,
    clock: &dyn Clock,
    name: &str,
    spec: RestoreTestSpec,
) -> Result<RestoreTest> {
    let backup = spec.backup_name.clone();
    match store.create(RestoreTest::new(name, spec, clock.now())) {
        Ok(created) => {
            tracing::info!(test = %name, backup = %backup, "restore test created");
            Ok(created)
        }
        Err(err @ LzrError::AlreadyExists { .. }) => {
            let existing = store.get(name)?;
            if existing.spec.backup_name == backup && !existing.is_deleting() {
                tracing::debug!(test = %name, "restore test already exists for this backup");
                Ok(existing)
            } else {
                Err(err)
            }
        }
        Err(e) => Err(e),
    }
}

/// Ask for `name` to be torn down. Safe to repeat.
pub fn request_deletion(store: &dyn TestStore, clock: &dyn Clock, name: &str) -> Result<RestoreTest> {
    let test = store.request_deletion(name, clock.now())?;
    tracing::info!(test = %name, phase = %test.status.phase, "deletion requested");
    Ok(test)
}
