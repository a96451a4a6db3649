//! Namespace provisioning and resource deletion through `kubectl`.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};
use std::time::Duration;

use serde_json::{Value, json};

use crate::cleanup::{Deletion, Resource, ResourceCleaner};
use crate::core::errors::{LzrError, Result};
use crate::restore::velero::{is_already_exists, is_not_found};

const COMPONENT: &str = "cluster";

pub struct KubectlCleaner {
    kubectl: PathBuf,
    request_timeout: Duration,
}

impl KubectlCleaner {
    pub fn new(kubectl: impl Into<PathBuf>, request_timeout: Duration) -> Self {
        Self {
            kubectl: kubectl.into(),
            request_timeout,
        }
    }

    fn run(&self, args: &[String], stdin: Option<&[u8]>) -> std::io::Result<Output> {
        let mut child = Command::new(&self.kubectl)
            .arg(format!("--request-timeout={}s", self.request_timeout.as_secs().max(1)))
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(bytes)?;
        }
        child.wait_with_output()
    }

    fn spawn_error(&self, e: &std::io::Error) -> LzrError {
        LzrError::transient(COMPONENT, format!("run {}: {e}", self.kubectl.display()))
    }
}

/// `kubectl` arguments deleting `resource` without waiting for finalizers.
#[must_use]
pub fn delete_args(resource: &Resource) -> Vec<String> {
    let mut args = vec!["delete".to_string()];
    match resource {
        Resource::Namespace { name } => {
            args.extend(["namespace".to_string(), name.clone()]);
        }
        Resource::Restore { namespace, name } => {
            args.extend([
                "restores.velero.io".to_string(),
                name.clone(),
                "-n".to_string(),
                namespace.clone(),
            ]);
        }
        Resource::Secret { namespace, name } => {
            args.extend([
                "secret".to_string(),
                name.clone(),
                "-n".to_string(),
                namespace.clone(),
            ]);
        }
    }
    args.extend(["--ignore-not-found".to_string(), "--wait=false".to_string()]);
    args
}

/// The Namespace object created for a test.
#[must_use]
pub fn namespace_manifest(name: &str, labels: &BTreeMap<String, String>) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": { "name": name, "labels": labels },
    })
}

/// `metadata.labels` of a fetched object; missing labels read as empty.
#[must_use]
pub fn object_labels(object: &Value) -> BTreeMap<String, String> {
    object["metadata"]["labels"]
        .as_object()
        .map(|labels| {
            labels
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

impl ResourceCleaner for KubectlCleaner {
    fn namespace_labels(&self, name: &str) -> Result<Option<BTreeMap<String, String>>> {
        let args = ["get", "namespace", name, "-o", "json"].map(String::from);
        let output = self.run(&args, None).map_err(|e| self.spawn_error(&e))?;
        if output.status.success() {
            let object: Value = serde_json::from_slice(&output.stdout)?;
            return Ok(Some(object_labels(&object)));
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_not_found(&stderr) {
            return Ok(None);
        }
        Err(LzrError::transient(
            COMPONENT,
            format!("get namespace {name}: {}", stderr.trim()),
        ))
    }

    fn create_namespace(&self, name: &str, labels: &BTreeMap<String, String>) -> Result<()> {
        let manifest = serde_json::to_vec(&namespace_manifest(name, labels))?;
        let args = ["create", "-f", "-"].map(String::from);
        let output = self
            .run(&args, Some(&manifest))
            .map_err(|e| self.spawn_error(&e))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_already_exists(&stderr) {
            return Err(LzrError::AlreadyExists {
                kind: "namespace",
                name: name.to_string(),
            });
        }
        Err(LzrError::transient(
            COMPONENT,
            format!("create namespace {name}: {}", stderr.trim()),
        ))
    }

    fn delete(&self, resource: &Resource) -> Result<Deletion> {
        let output = self
            .run(&delete_args(resource), None)
            .map_err(|e| LzrError::Cleanup {
                resource: resource.to_string(),
                details: format!("spawn {}: {e}", self.kubectl.display()),
            })?;
        if !output.status.success() {
            return Err(LzrError::Cleanup {
                resource: resource.to_string(),
                details: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        // With --ignore-not-found, kubectl prints nothing for absent objects.
        if output.stdout.iter().all(u8::is_ascii_whitespace) {
            Ok(Deletion::Absent)
        } else {
            Ok(Deletion::Deleted)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanup::{LABEL_MANAGED_BY, test_namespace_labels};

    #[test]
    fn namespace_delete_is_idempotent_and_async() {
        let args = delete_args(&Resource::Namespace {
            name: "lazarus-test-x".to_string(),
        });
        assert_eq!(args[..3], ["delete", "namespace", "lazarus-test-x"]);
        assert!(args.contains(&"--ignore-not-found".to_string()));
        assert!(args.contains(&"--wait=false".to_string()));
    }

    #[test]
    fn secret_delete_is_namespaced() {
        let args = delete_args(&Resource::Secret {
            namespace: "lazarus-test-x".to_string(),
            name: "db-creds".to_string(),
        });
        assert_eq!(args[1..5], ["secret", "db-creds", "-n", "lazarus-test-x"]);
    }

    #[test]
    fn namespace_manifest_carries_ownership_labels() {
        let manifest = namespace_manifest("lazarus-test-x", &test_namespace_labels("drill", "nightly"));
        assert_eq!(manifest["kind"], "Namespace");
        assert_eq!(manifest["metadata"]["labels"][LABEL_MANAGED_BY], "lazarus");
        assert_eq!(manifest["metadata"]["labels"]["lazarus.io/backup"], "nightly");
        assert_eq!(object_labels(&manifest), test_namespace_labels("drill", "nightly"));
    }

    #[test]
    fn unlabelled_object_has_no_labels() {
        let object = json!({"metadata": {"name": "shop"}});
        assert!(object_labels(&object).is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn missing_binary_is_a_cleanup_error() {
        let cleaner = KubectlCleaner::new("/nonexistent/kubectl", Duration::from_secs(5));
        let err = cleaner
            .delete(&Resource::Namespace { name: "x".to_string() })
            .expect_err("no binary");
        assert!(err.is_retryable());
        assert_eq!(err.code(), "LZR-2201");
    }

    #[cfg(unix)]
    #[test]
    fn missing_binary_blocks_namespace_creation_transiently() {
        let cleaner = KubectlCleaner::new("/nonexistent/kubectl", Duration::from_secs(5));
        let err = cleaner
            .create_namespace("x", &test_namespace_labels("drill", "nightly"))
            .expect_err("no binary");
        assert!(err.is_retryable());
        assert_eq!(err.reason(), "TransientInfraError");
    }
}
