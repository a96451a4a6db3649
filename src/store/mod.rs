//! Persistence for restore-test records.
//!
//! The store behaves like a document store: whole records keyed by name,
//! status writes guarded by a version token, and a change feed that tells
//! the daemon which names to look at again.

#![allow(missing_docs)]

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::core::errors::Result;
use crate::model::{RestoreTest, RestoreTestStatus};

pub use memory::InMemoryTestStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteTestStore;

/// A change the reconciler did not make itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Created(String),
    DeletionRequested(String),
    Removed(String),
}

impl StoreEvent {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Created(name) | Self::DeletionRequested(name) | Self::Removed(name) => name,
        }
    }
}

pub trait TestStore: Send + Sync {
    /// Insert a new record at version 1. `AlreadyExists` if the name is taken.
    fn create(&self, test: RestoreTest) -> Result<RestoreTest>;

    /// `NotFound` when absent.
    fn get(&self, name: &str) -> Result<RestoreTest>;

    /// Every record, ordered by name.
    fn list(&self) -> Result<Vec<RestoreTest>>;

    /// Replace the status if the stored version still equals
    /// `expected_version`; returns the new version, or `Conflict`.
    fn update_status(&self, name: &str, expected_version: u64, status: &RestoreTestStatus) -> Result<u64>;

    /// Mark the record for deletion. Bumps the version so in-flight status
    /// writes conflict and re-read. The first request time wins.
    fn request_deletion(&self, name: &str, at: DateTime<Utc>) -> Result<RestoreTest>;

    /// Drop the record. Returns whether it existed.
    fn remove(&self, name: &str) -> Result<bool>;

    /// Names of records with a pending deletion request, ordered by name.
    fn deleting(&self) -> Result<Vec<String>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(RestoreTest::is_deleting)
            .map(|test| test.metadata.name)
            .collect())
    }

    /// Push feed of external changes, where the backend can offer one.
    /// Backends shared across processes return `None` and rely on resync.
    fn subscribe(&self) -> Option<Receiver<StoreEvent>> {
        None
    }
}

/// Fan-out of store events to any number of subscribers. Disconnected
/// subscribers are pruned on the next publish.
#[derive(Debug, Default)]
pub struct EventFeed {
    subscribers: Mutex<Vec<Sender<StoreEvent>>>,
}

impl EventFeed {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn subscribe(&self) -> Receiver<StoreEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn publish(&self, event: &StoreEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_prunes_dropped_subscribers() {
        let feed = EventFeed::new();
        let kept = feed.subscribe();
        drop(feed.subscribe());
        feed.publish(&StoreEvent::Created("a".to_string()));
        assert_eq!(feed.subscribers.lock().len(), 1);
        assert_eq!(kept.try_recv().unwrap().name(), "a");
    }
}
