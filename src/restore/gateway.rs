//! Idempotent wrapper over the restore subsystem.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::controller::exponential_backoff;
use crate::core::cancel::CancelToken;
use crate::core::errors::{LzrError, Result};
use crate::core::naming::restore_id_for;
use crate::model::RestoreFilters;
use crate::restore::{
    BACKUP_COMPLETED, BackupInfo, ExternalRestore, RestoreRequest, RestoreSubsystem,
};

pub const LABEL_TEST: &str = "lazarus.io/test";
pub const LABEL_BACKUP: &str = "lazarus.io/backup";
pub const LABEL_TEST_NAME: &str = "lazarus.io/test-name";

/// Identity and placement of one restore.
#[derive(Debug, Clone, Copy)]
pub struct RestoreTarget<'a> {
    pub test_name: &'a str,
    pub uid: &'a str,
    pub backup_name: &'a str,
    pub backup_namespace: Option<&'a str>,
    pub target_namespace: &'a str,
    pub filters: &'a RestoreFilters,
}

pub struct RestoreGateway {
    subsystem: Arc<dyn RestoreSubsystem>,
    namespace: String,
    always_excluded: Vec<String>,
    poll_interval: Duration,
    /// Ceiling for the poll interval while the subsystem keeps erroring.
    max_poll_interval: Duration,
}

impl RestoreGateway {
    /// `namespace` is where restore objects live; `always_excluded` is
    /// merged into every request's exclusions.
    pub fn new(
        subsystem: Arc<dyn RestoreSubsystem>,
        namespace: impl Into<String>,
        always_excluded: Vec<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            subsystem,
            namespace: namespace.into(),
            always_excluded,
            poll_interval,
            max_poll_interval: poll_interval,
        }
    }

    /// Let the blocking wait back off up to `max` under sustained poll errors.
    #[must_use]
    pub fn with_max_poll_interval(mut self, max: Duration) -> Self {
        self.max_poll_interval = max.max(self.poll_interval);
        self
    }

    /// Delay before the next poll after `consecutive_errors` failed polls in
    /// a row. Matches the requeue delays of the non-blocking path.
    #[must_use]
    pub fn poll_delay(&self, consecutive_errors: u32) -> Duration {
        if consecutive_errors == 0 {
            return self.poll_interval;
        }
        exponential_backoff(
            self.poll_interval,
            self.max_poll_interval,
            consecutive_errors.saturating_add(1),
        )
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[must_use]
    pub fn subsystem(&self) -> &Arc<dyn RestoreSubsystem> {
        &self.subsystem
    }

    /// Restore identifier for a test; the same identity always maps to the
    /// same id.
    #[must_use]
    pub fn restore_id(target: &RestoreTarget<'_>) -> String {
        restore_id_for(target.test_name, target.uid)
    }

    /// The backup must exist and be `Completed`.
    pub fn verify_backup(&self, namespace: Option<&str>, backup: &str) -> Result<BackupInfo> {
        let namespace = namespace.unwrap_or(&self.namespace);
        match self.subsystem.get_backup(namespace, backup)? {
            None => Err(LzrError::BackupNotFound {
                backup: backup.to_string(),
                details: format!("no backup in namespace {namespace}"),
            }),
            Some(info) if info.phase != BACKUP_COMPLETED => Err(LzrError::BackupNotFound {
                backup: backup.to_string(),
                details: format!("backup phase is {:?}, not {BACKUP_COMPLETED}", info.phase),
            }),
            Some(info) => Ok(info),
        }
    }

    /// Shape the request: every explicitly included namespace (from the
    /// filters, else from the backup) maps onto the target namespace.
    pub fn build_request(&self, target: &RestoreTarget<'_>, backup: &BackupInfo) -> Result<RestoreRequest> {
        let mut sources = target.filters.explicit_namespaces();
        if sources.is_empty() {
            sources = backup
                .included_namespaces
                .iter()
                .filter(|ns| ns.as_str() != "*")
                .cloned()
                .collect();
        }
        if sources.is_empty() {
            return Err(LzrError::validation(format!(
                "backup {} covers the whole cluster; name the namespaces to restore in restore.includedNamespaces",
                backup.name
            )));
        }
        let target_ns = target.target_namespace;
        if sources.iter().chain(&backup.included_namespaces).any(|ns| ns == target_ns)
            || target.filters.mentions_namespace(target_ns)
        {
            return Err(LzrError::validation(format!(
                "restore namespace {target_ns} is a source namespace of backup {}; restoring into it would overwrite live resources",
                backup.name
            )));
        }

        let mut excluded: Vec<String> = self.always_excluded.clone();
        for ns in &target.filters.excluded_namespaces {
            if !excluded.contains(ns) {
                excluded.push(ns.clone());
            }
        }
        sources.retain(|ns| !excluded.contains(ns));
        if sources.is_empty() {
            return Err(LzrError::validation(
                "every included namespace is also excluded",
            ));
        }

        let namespace_mapping: BTreeMap<String, String> = sources
            .iter()
            .map(|ns| (ns.clone(), target.target_namespace.to_string()))
            .collect();
        let labels = BTreeMap::from([
            (LABEL_TEST.to_string(), "true".to_string()),
            (LABEL_BACKUP.to_string(), target.backup_name.to_string()),
            (LABEL_TEST_NAME.to_string(), target.test_name.to_string()),
        ]);
        Ok(RestoreRequest {
            name: Self::restore_id(target),
            namespace: self.namespace.clone(),
            backup_name: target.backup_name.to_string(),
            restore_pvs: target.filters.restore_pvs,
            restore_status: target.filters.restore_status,
            namespace_mapping,
            included_namespaces: sources,
            excluded_namespaces: excluded,
            included_resources: target.filters.included_resources.clone(),
            excluded_resources: target.filters.excluded_resources.clone(),
            labels,
        })
    }

    /// Verify the backup and shape the request without touching the cluster.
    pub fn prepare(&self, target: &RestoreTarget<'_>) -> Result<RestoreRequest> {
        let backup = self.verify_backup(target.backup_namespace, target.backup_name)?;
        self.build_request(target, &backup)
    }

    /// Create the restore for `target`, or accept the one already there.
    pub fn create_restore(&self, target: &RestoreTarget<'_>) -> Result<String> {
        let request = self.prepare(target)?;
        self.submit(request)
    }

    /// Create a prepared restore; `AlreadyExists` counts as success.
    pub fn submit(&self, request: RestoreRequest) -> Result<String> {
        match self.subsystem.create_restore(&request) {
            Ok(()) => {
                tracing::info!(restore = %request.name, backup = %request.backup_name, "restore created");
                Ok(request.name)
            }
            Err(LzrError::AlreadyExists { .. }) => {
                tracing::debug!(restore = %request.name, "restore already exists");
                Ok(request.name)
            }
            Err(e) => Err(e),
        }
    }

    /// Single non-blocking read. A restore that has vanished is a failure.
    pub fn poll_status(&self, restore_id: &str) -> Result<ExternalRestore> {
        self.subsystem
            .get_restore(&self.namespace, restore_id)?
            .ok_or_else(|| LzrError::RestoreFailed {
                restore_id: restore_id.to_string(),
                details: "restore object no longer exists".to_string(),
            })
    }

    /// Poll at the configured interval until terminal, `timeout` or cancel.
    /// Transient poll errors are retried until the deadline, backing off
    /// while they persist.
    pub fn wait_until_terminal(
        &self,
        restore_id: &str,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<ExternalRestore> {
        let deadline = Instant::now() + timeout;
        let mut errors = 0_u32;
        loop {
            match self.poll_status(restore_id) {
                Ok(observed) if observed.status.is_terminal() => return Ok(observed),
                Ok(_) => errors = 0,
                Err(e) if e.is_retryable() => {
                    errors = errors.saturating_add(1);
                    tracing::warn!(restore = %restore_id, error = %e, consecutive = errors, "restore poll failed");
                }
                Err(e) => return Err(e),
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(LzrError::RestoreTimeout {
                    restore_id: restore_id.to_string(),
                    timeout_secs: timeout.as_secs(),
                });
            }
            if cancel.wait_timeout(self.poll_delay(errors).min(remaining)) {
                return Err(LzrError::Cancelled {
                    component: "restore-wait",
                });
            }
        }
    }

    /// Delete the restore object; absent is success.
    pub fn delete_restore(&self, restore_id: &str) -> Result<bool> {
        self.subsystem.delete_restore(&self.namespace, restore_id)
    }
}
