//! In-process store for tests and single-process runs.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use crossbeam_channel::Receiver;
use parking_lot::Mutex;

use crate::core::errors::{LzrError, Result};
use crate::model::{RestoreTest, RestoreTestStatus};
use crate::store::{EventFeed, StoreEvent, TestStore};

#[derive(Debug, Default)]
pub struct InMemoryTestStore {
    records: Mutex<BTreeMap<String, RestoreTest>>,
    feed: EventFeed,
    /// Successful status writes.
    pub status_writes: AtomicU32,
    fail_next_updates: AtomicU32,
}

impl InMemoryTestStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` status writes fail with `Conflict` even when the
    /// version matches.
    pub fn conflict_next_updates(&self, n: u32) {
        self.fail_next_updates.store(n, Ordering::SeqCst);
    }

    #[must_use]
    pub fn writes(&self) -> u32 {
        self.status_writes.load(Ordering::SeqCst)
    }

    fn take_forced_conflict(&self) -> bool {
        self.fail_next_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn not_found(name: &str) -> LzrError {
    LzrError::NotFound {
        kind: "restore test",
        name: name.to_string(),
    }
}

impl TestStore for InMemoryTestStore {
    fn create(&self, mut test: RestoreTest) -> Result<RestoreTest> {
        let name = test.name().to_string();
        {
            let mut records = self.records.lock();
            if records.contains_key(&name) {
                return Err(LzrError::AlreadyExists {
                    kind: "restore test",
                    name,
                });
            }
            test.metadata.resource_version = 1;
            records.insert(name.clone(), test.clone());
        }
        self.feed.publish(&StoreEvent::Created(name));
        Ok(test)
    }

    fn get(&self, name: &str) -> Result<RestoreTest> {
        self.records
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| not_found(name))
    }

    fn list(&self) -> Result<Vec<RestoreTest>> {
        Ok(self.records.lock().values().cloned().collect())
    }

    fn update_status(&self, name: &str, expected_version: u64, status: &RestoreTestStatus) -> Result<u64> {
        let mut records = self.records.lock();
        let record = records.get_mut(name).ok_or_else(|| not_found(name))?;
        let found = record.metadata.resource_version;
        if found != expected_version || self.take_forced_conflict() {
            return Err(LzrError::Conflict {
                name: name.to_string(),
                expected: expected_version,
                found,
            });
        }
        record.status = status.clone();
        record.metadata.resource_version = found + 1;
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        Ok(found + 1)
    }

    fn request_deletion(&self, name: &str, at: DateTime<Utc>) -> Result<RestoreTest> {
        let updated = {
            let mut records = self.records.lock();
            let record = records.get_mut(name).ok_or_else(|| not_found(name))?;
            if record.metadata.deletion_requested_at.is_none() {
                record.metadata.deletion_requested_at = Some(at);
                record.metadata.resource_version += 1;
            }
            record.clone()
        };
        self.feed
            .publish(&StoreEvent::DeletionRequested(name.to_string()));
        Ok(updated)
    }

    fn remove(&self, name: &str) -> Result<bool> {
        let existed = self.records.lock().remove(name).is_some();
        if existed {
            self.feed.publish(&StoreEvent::Removed(name.to_string()));
        }
        Ok(existed)
    }

    fn subscribe(&self) -> Option<Receiver<StoreEvent>> {
        Some(self.feed.subscribe())
    }
}
