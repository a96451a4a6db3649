//! Scriptable in-process restore subsystem.

#![allow(missing_docs)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::core::errors::{LzrError, Result};
use crate::restore::{BackupInfo, ExternalRestore, RestoreRequest, RestoreStatus, RestoreSubsystem};

struct ScriptedRestore {
    request: RestoreRequest,
    pending: VecDeque<RestoreStatus>,
    current: RestoreStatus,
}

/// Restores advance one scripted status per `get_restore`; the last status
/// sticks. Failures can be injected per operation.
pub struct InMemoryRestoreSubsystem {
    backups: Mutex<HashMap<String, BackupInfo>>,
    restores: Mutex<HashMap<String, ScriptedRestore>>,
    progression: Mutex<Vec<RestoreStatus>>,
    items: Mutex<(u64, u64)>,
    create_failures: AtomicU32,
    poll_failures: AtomicU32,
    pub create_calls: AtomicU32,
    pub poll_calls: AtomicU32,
    pub backup_calls: AtomicU32,
    pub delete_calls: AtomicU32,
}

impl Default for InMemoryRestoreSubsystem {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRestoreSubsystem {
    #[must_use]
    pub fn new() -> Self {
        Self {
            backups: Mutex::new(HashMap::new()),
            restores: Mutex::new(HashMap::new()),
            progression: Mutex::new(vec![RestoreStatus::InProgress, RestoreStatus::Completed]),
            items: Mutex::new((42, 42)),
            create_failures: AtomicU32::new(0),
            poll_failures: AtomicU32::new(0),
            create_calls: AtomicU32::new(0),
            poll_calls: AtomicU32::new(0),
            backup_calls: AtomicU32::new(0),
            delete_calls: AtomicU32::new(0),
        }
    }

    pub fn add_backup(&self, name: &str, phase: &str, namespaces: &[&str]) {
        self.backups.lock().insert(
            name.to_string(),
            BackupInfo {
                name: name.to_string(),
                phase: phase.to_string(),
                included_namespaces: namespaces.iter().map(|s| (*s).to_string()).collect(),
            },
        );
    }

    /// Statuses returned by successive polls of restores created from now on.
    pub fn set_progression(&self, statuses: Vec<RestoreStatus>) {
        *self.progression.lock() = statuses;
    }

    /// `(attempted, restored)` item counts reported by every restore.
    pub fn set_items(&self, attempted: u64, restored: u64) {
        *self.items.lock() = (attempted, restored);
    }

    /// The next `count` creates fail with a transient error.
    pub fn fail_next_creates(&self, count: u32) {
        self.create_failures.store(count, Ordering::SeqCst);
    }

    /// The next `count` polls fail with a transient error.
    pub fn fail_next_polls(&self, count: u32) {
        self.poll_failures.store(count, Ordering::SeqCst);
    }

    #[must_use]
    pub fn restore_count(&self) -> usize {
        self.restores.lock().len()
    }

    #[must_use]
    pub fn requests(&self) -> Vec<RestoreRequest> {
        self.restores
            .lock()
            .values()
            .map(|r| r.request.clone())
            .collect()
    }

    #[must_use]
    pub fn calls(&self, counter: &AtomicU32) -> u32 {
        counter.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl RestoreSubsystem for InMemoryRestoreSubsystem {
    fn get_backup(&self, _namespace: &str, name: &str) -> Result<Option<BackupInfo>> {
        self.backup_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.backups.lock().get(name).cloned())
    }

    fn create_restore(&self, request: &RestoreRequest) -> Result<()> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.create_failures) {
            return Err(LzrError::transient("restore-subsystem", "injected create failure"));
        }
        let mut restores = self.restores.lock();
        if restores.contains_key(&request.name) {
            return Err(LzrError::AlreadyExists {
                kind: "restore",
                name: request.name.clone(),
            });
        }
        restores.insert(
            request.name.clone(),
            ScriptedRestore {
                request: request.clone(),
                pending: self.progression.lock().iter().copied().collect(),
                current: RestoreStatus::Pending,
            },
        );
        Ok(())
    }

    fn get_restore(&self, _namespace: &str, name: &str) -> Result<Option<ExternalRestore>> {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.poll_failures) {
            return Err(LzrError::transient("restore-subsystem", "injected poll failure"));
        }
        let (attempted, restored) = *self.items.lock();
        let mut restores = self.restores.lock();
        let Some(restore) = restores.get_mut(name) else {
            return Ok(None);
        };
        if let Some(next) = restore.pending.pop_front() {
            restore.current = next;
        }
        let status = restore.current;
        let (items_restored, error_count) = match status {
            RestoreStatus::Completed => (restored, 0),
            RestoreStatus::PartiallyFailed => (restored / 2, 1),
            RestoreStatus::Failed => (0, 1),
            RestoreStatus::Pending | RestoreStatus::InProgress => (restored / 2, 0),
        };
        Ok(Some(ExternalRestore {
            name: name.to_string(),
            status,
            raw_phase: match status {
                RestoreStatus::Pending => "New".to_string(),
                other => other.as_str().to_string(),
            },
            items_attempted: attempted,
            items_restored,
            error_count,
            warning_count: 0,
            warnings: Vec::new(),
            failure_reason: (status == RestoreStatus::Failed).then(|| "scripted failure".to_string()),
        }))
    }

    fn delete_restore(&self, _namespace: &str, name: &str) -> Result<bool> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.restores.lock().remove(name).is_some())
    }
}
