//! In-process cleaner backed by a set of live resources.

#![allow(missing_docs)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::cleanup::{Deletion, Resource, ResourceCleaner};
use crate::core::errors::{LzrError, Result};

#[derive(Default)]
pub struct InMemoryCleaner {
    live: Mutex<BTreeSet<String>>,
    /// Labels of every live namespace.
    namespaces: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
    failures: AtomicU32,
    pub delete_calls: AtomicU32,
    pub namespace_creates: AtomicU32,
}

impl InMemoryCleaner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `resource` live. A namespace added this way has no labels unless
    /// it was created through [`ResourceCleaner::create_namespace`].
    pub fn add(&self, resource: &Resource) {
        if let Resource::Namespace { name } = resource {
            self.namespaces.lock().entry(name.clone()).or_default();
        }
        self.live.lock().insert(resource.to_string());
    }

    #[must_use]
    pub fn exists(&self, resource: &Resource) -> bool {
        self.live.lock().contains(&resource.to_string())
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    /// The next `count` deletions fail.
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }
}

impl ResourceCleaner for InMemoryCleaner {
    fn namespace_labels(&self, name: &str) -> Result<Option<BTreeMap<String, String>>> {
        Ok(self.namespaces.lock().get(name).cloned())
    }

    fn create_namespace(&self, name: &str, labels: &BTreeMap<String, String>) -> Result<()> {
        self.namespace_creates.fetch_add(1, Ordering::SeqCst);
        let mut namespaces = self.namespaces.lock();
        if namespaces.contains_key(name) {
            return Err(LzrError::AlreadyExists {
                kind: "namespace",
                name: name.to_string(),
            });
        }
        namespaces.insert(name.to_string(), labels.clone());
        self.live.lock().insert(
            Resource::Namespace {
                name: name.to_string(),
            }
            .to_string(),
        );
        Ok(())
    }

    fn delete(&self, resource: &Resource) -> Result<Deletion> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(LzrError::Cleanup {
                resource: resource.to_string(),
                details: "injected failure".to_string(),
            });
        }
        if let Resource::Namespace { name } = resource {
            self.namespaces.lock().remove(name);
        }
        if self.live.lock().remove(&resource.to_string()) {
            Ok(Deletion::Deleted)
        } else {
            Ok(Deletion::Absent)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanup::test_namespace_labels;

    #[test]
    fn created_namespace_keeps_its_labels() {
        let cleaner = InMemoryCleaner::new();
        let labels = test_namespace_labels("drill", "nightly");
        cleaner.create_namespace("lazarus-test-x", &labels).unwrap();
        assert_eq!(cleaner.namespace_labels("lazarus-test-x").unwrap(), Some(labels.clone()));

        let err = cleaner.create_namespace("lazarus-test-x", &labels).unwrap_err();
        assert!(matches!(err, LzrError::AlreadyExists { .. }));

        let ns = Resource::Namespace {
            name: "lazarus-test-x".to_string(),
        };
        assert_eq!(cleaner.delete(&ns).unwrap(), Deletion::Deleted);
        assert_eq!(cleaner.namespace_labels("lazarus-test-x").unwrap(), None);
    }

    #[test]
    fn added_namespace_is_unlabelled() {
        let cleaner = InMemoryCleaner::new();
        cleaner.add(&Resource::Namespace {
            name: "shop".to_string(),
        });
        assert_eq!(cleaner.namespace_labels("shop").unwrap(), Some(BTreeMap::new()));
    }
}
