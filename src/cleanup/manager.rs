//! TTL scheduling and idempotent cleanup runs.
//!
//! All timing lives on the test record (`status.cleanup`), so whether a test
//! is due can be recomputed from persisted state after a restart.

#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::cleanup::{
    CleanupOutcome, Deletion, Resource, ResourceCleaner, namespace_owned_by, test_namespace_labels,
};
use crate::core::clock::add_duration;
use crate::core::config::CleanupConfig;
use crate::core::errors::{LzrError, Result};
use crate::model::{CleanupResolution, CleanupSpec, CleanupState, RestoreTest};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupPolicy {
    pub enabled: bool,
    pub on_success: bool,
    pub on_failure: bool,
    pub default_ttl: Duration,
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl CleanupPolicy {
    pub fn from_config(config: &CleanupConfig) -> Result<Self> {
        Ok(Self {
            enabled: config.enabled,
            on_success: config.on_success,
            on_failure: config.on_failure,
            default_ttl: config.default_ttl()?,
            max_attempts: config.max_attempts.max(1),
            retry_delay: Duration::from_secs(config.retry_delay_secs),
        })
    }

    /// Whether resources of a finished test are deleted once its TTL lapses.
    #[must_use]
    pub fn deletes(&self, spec: &CleanupSpec, success: bool) -> bool {
        let per_outcome = if success {
            spec.on_success.unwrap_or(self.on_success)
        } else {
            spec.on_failure.unwrap_or(self.on_failure)
        };
        spec.enabled.unwrap_or(self.enabled) && per_outcome
    }
}

/// What happened to the cleanup bookkeeping after one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupProgress {
    Done,
    RetryAt(DateTime<Utc>),
    Abandoned,
}

pub struct CleanupManager {
    cleaner: Arc<dyn ResourceCleaner>,
    restore_object_namespace: String,
    policy: CleanupPolicy,
}

impl CleanupManager {
    /// `restore_object_namespace` is where restore objects live.
    pub fn new(
        cleaner: Arc<dyn ResourceCleaner>,
        restore_object_namespace: impl Into<String>,
        policy: CleanupPolicy,
    ) -> Self {
        Self {
            cleaner,
            restore_object_namespace: restore_object_namespace.into(),
            policy,
        }
    }

    #[must_use]
    pub const fn policy(&self) -> &CleanupPolicy {
        &self.policy
    }

    /// Create the test's target namespace with ownership labels, or accept
    /// the one a previous pass created. A namespace that exists without
    /// belonging to this test is rejected and never restored into.
    pub fn ensure_namespace(&self, test: &RestoreTest, namespace: &str) -> Result<()> {
        let labels = test_namespace_labels(test.name(), &test.spec.backup_name);
        match self.cleaner.create_namespace(namespace, &labels) {
            Ok(()) => {
                tracing::info!(test = %test.name(), namespace, "test namespace created");
                Ok(())
            }
            Err(LzrError::AlreadyExists { .. }) => match self.cleaner.namespace_labels(namespace)? {
                Some(found) if namespace_owned_by(&found, test.name()) => {
                    tracing::debug!(test = %test.name(), namespace, "test namespace already exists");
                    Ok(())
                }
                Some(_) => Err(LzrError::validation(format!(
                    "namespace {namespace} already exists and is not owned by restore test {}",
                    test.name()
                ))),
                None => Err(LzrError::transient(
                    "cluster",
                    format!("namespace {namespace} vanished while being created"),
                )),
            },
            Err(e) => Err(e),
        }
    }

    /// Persist the deadline (or the decision to retain) on the record.
    /// A test that already has either is left untouched.
    pub fn schedule_cleanup(
        &self,
        test: &mut RestoreTest,
        completion: DateTime<Utc>,
        success: bool,
    ) -> Result<()> {
        let state = &mut test.status.cleanup;
        if state.deadline.is_some() || state.retained {
            return Ok(());
        }
        if self.policy.deletes(&test.spec.cleanup, success) {
            let ttl = test.spec.ttl_or(self.policy.default_ttl)?;
            state.deadline = Some(add_duration(completion, ttl));
        } else {
            state.retained = true;
        }
        Ok(())
    }

    /// When cleanup may next run; `None` while retained or unscheduled.
    #[must_use]
    pub fn due_at(&self, test: &RestoreTest) -> Option<DateTime<Utc>> {
        let state = &test.status.cleanup;
        if state.outcome.is_some() {
            return None;
        }
        let base = if let Some(requested) = test.metadata.deletion_requested_at {
            requested
        } else if state.retained {
            return None;
        } else {
            state.deadline?
        };
        Some(state.next_attempt_at.map_or(base, |next| next.max(base)))
    }

    #[must_use]
    pub fn is_due(&self, test: &RestoreTest, now: DateTime<Utc>) -> bool {
        self.due_at(test).is_some_and(|due| now >= due)
    }

    /// Everything the test owns, in deletion order.
    #[must_use]
    pub fn resources(&self, test: &RestoreTest) -> Vec<Resource> {
        let mut resources = Vec::new();
        if let Some(restore_id) = &test.status.restore_state.restore_id {
            resources.push(Resource::Restore {
                namespace: self.restore_object_namespace.clone(),
                name: restore_id.clone(),
            });
        }
        let target = test.status.restore_namespace.as_deref();
        for secret in &test.spec.cleanup.secrets {
            if let Some(namespace) = secret.namespace.as_deref().or(target) {
                resources.push(Resource::Secret {
                    namespace: namespace.to_string(),
                    name: secret.name.clone(),
                });
            }
        }
        if let Some(namespace) = target {
            resources.push(Resource::Namespace {
                name: namespace.to_string(),
            });
        }
        resources
    }

    /// Delete every owned resource. Already-absent resources count as
    /// success, so repeated runs after a full cleanup still succeed.
    /// Namespaces not labelled as this test's are left alone.
    #[must_use]
    pub fn run_cleanup(&self, test: &RestoreTest) -> CleanupOutcome {
        let mut outcome = CleanupOutcome::default();
        for resource in self.resources(test) {
            match self.delete_owned(test, &resource) {
                Ok(Deletion::Deleted) => outcome.deleted.push(resource.to_string()),
                Ok(Deletion::Absent) => outcome.already_absent.push(resource.to_string()),
                Ok(Deletion::Skipped) => {
                    tracing::warn!(test = %test.name(), resource = %resource, "not owned by the test, left in place");
                    outcome.skipped.push(resource.to_string());
                }
                Err(e) => {
                    tracing::warn!(test = %test.name(), resource = %resource, error = %e, "cleanup failed");
                    outcome.errors.push(format!("{resource}: {e}"));
                }
            }
        }
        outcome.success = outcome.errors.is_empty();
        outcome
    }

    fn delete_owned(&self, test: &RestoreTest, resource: &Resource) -> Result<Deletion> {
        if let Resource::Namespace { name } = resource {
            match self.cleaner.namespace_labels(name) {
                Ok(None) => return Ok(Deletion::Absent),
                Ok(Some(labels)) if !namespace_owned_by(&labels, test.name()) => {
                    return Ok(Deletion::Skipped);
                }
                Ok(Some(_)) => {}
                Err(e) => {
                    return Err(LzrError::Cleanup {
                        resource: resource.to_string(),
                        details: e.to_string(),
                    });
                }
            }
        }
        self.cleaner.delete(resource)
    }

    /// Fold one run into the persisted bookkeeping.
    pub fn record(
        &self,
        state: &mut CleanupState,
        outcome: &CleanupOutcome,
        now: DateTime<Utc>,
    ) -> CleanupProgress {
        state.attempts = state.attempts.saturating_add(1);
        if outcome.success {
            state.last_error = None;
            state.next_attempt_at = None;
            state.completed_at = Some(now);
            state.outcome = Some(CleanupResolution::Completed);
            return CleanupProgress::Done;
        }
        state.last_error = Some(outcome.errors.join("; "));
        if state.attempts >= self.policy.max_attempts {
            state.completed_at = Some(now);
            state.outcome = Some(CleanupResolution::Abandoned);
            return CleanupProgress::Abandoned;
        }
        let next = add_duration(now, self.policy.retry_delay);
        state.next_attempt_at = Some(next);
        CleanupProgress::RetryAt(next)
    }
}
