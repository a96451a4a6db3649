//! The immutable part of a restore test: what to restore and how to judge it.

#![allow(missing_docs)]

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{LzrError, Result};
use crate::core::naming::{MAX_NAME_LEN, is_dns_label, parse_duration};
use crate::health::probe::HealthCheckSpec;

const fn default_true() -> bool {
    true
}

fn default_included_namespaces() -> Vec<String> {
    vec!["*".to_string()]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreTestSpec {
    /// Backup to restore from.
    pub backup_name: String,
    /// Namespace the backup object lives in; the subsystem namespace when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_namespace: Option<String>,
    /// Fixed target namespace; generated when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_namespace: Option<String>,
    #[serde(default)]
    pub restore: RestoreFilters,
    /// Retention after completion, e.g. `24h`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
    #[serde(default)]
    pub health_checks: HealthCheckSpec,
    #[serde(default)]
    pub notifications: NotificationSpec,
    #[serde(default)]
    pub cleanup: CleanupSpec,
}

/// Inclusion and exclusion filters passed to the restore subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreFilters {
    #[serde(default = "default_included_namespaces")]
    pub included_namespaces: Vec<String>,
    #[serde(default)]
    pub excluded_namespaces: Vec<String>,
    #[serde(default)]
    pub included_resources: Vec<String>,
    #[serde(default)]
    pub excluded_resources: Vec<String>,
    #[serde(default = "default_true", rename = "restorePVs")]
    pub restore_pvs: bool,
    #[serde(default)]
    pub restore_status: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

impl Default for RestoreFilters {
    fn default() -> Self {
        Self {
            included_namespaces: default_included_namespaces(),
            excluded_namespaces: Vec::new(),
            included_resources: Vec::new(),
            excluded_resources: Vec::new(),
            restore_pvs: true,
            restore_status: false,
            timeout_seconds: None,
        }
    }
}

impl RestoreFilters {
    /// Explicitly named namespaces (everything except the `*` wildcard).
    #[must_use]
    pub fn explicit_namespaces(&self) -> Vec<String> {
        self.included_namespaces
            .iter()
            .filter(|ns| ns.as_str() != "*")
            .cloned()
            .collect()
    }

    /// Whether `namespace` appears in the include or exclude lists.
    #[must_use]
    pub fn mentions_namespace(&self, namespace: &str) -> bool {
        self.included_namespaces
            .iter()
            .chain(&self.excluded_namespaces)
            .any(|ns| ns == namespace)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_success: Option<NotifyRoute>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<NotifyRoute>,
}

/// Where one outcome is announced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyRoute {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mention: Option<String>,
}

/// Per-test cleanup overrides; unset fields fall back to configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<bool>,
    /// Secrets created for the test that go with it.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<SecretTarget>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretTarget {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl RestoreTestSpec {
    /// A spec for `backup_name` with every other field defaulted.
    #[must_use]
    pub fn for_backup(backup_name: impl Into<String>) -> Self {
        Self {
            backup_name: backup_name.into(),
            backup_namespace: None,
            restore_namespace: None,
            restore: RestoreFilters::default(),
            ttl: None,
            health_checks: HealthCheckSpec::default(),
            notifications: NotificationSpec::default(),
            cleanup: CleanupSpec::default(),
        }
    }

    /// Structural checks that need no external lookups.
    pub fn validate(&self) -> Result<()> {
        let backup = self.backup_name.trim();
        if backup.is_empty() {
            return Err(LzrError::validation("backupName must not be empty"));
        }
        if backup.len() > MAX_NAME_LEN || backup.chars().any(char::is_whitespace) {
            return Err(LzrError::validation(format!(
                "backupName {backup:?} is not a valid resource name"
            )));
        }
        if let Some(ns) = &self.backup_namespace {
            if !is_dns_label(ns) {
                return Err(LzrError::validation(format!(
                    "backupNamespace {ns:?} is not a DNS-1123 label"
                )));
            }
        }
        if let Some(ns) = &self.restore_namespace {
            if !is_dns_label(ns) {
                return Err(LzrError::validation(format!(
                    "restoreNamespace {ns:?} is not a DNS-1123 label"
                )));
            }
        }
        if self.restore.included_namespaces.is_empty() {
            return Err(LzrError::validation(
                "restore.includedNamespaces must not be empty",
            ));
        }
        if self.restore.timeout_seconds == Some(0) {
            return Err(LzrError::validation("restore.timeoutSeconds must be > 0"));
        }
        if let Some(raw) = &self.ttl {
            parse_duration(raw)?;
        }
        for secret in &self.cleanup.secrets {
            if !is_dns_label(&secret.name) {
                return Err(LzrError::validation(format!(
                    "cleanup secret {:?} is not a valid name",
                    secret.name
                )));
            }
        }
        Ok(())
    }

    /// TTL from the spec, else `default`.
    pub fn ttl_or(&self, default: Duration) -> Result<Duration> {
        self.ttl.as_deref().map_or(Ok(default), parse_duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_document_gets_defaults() {
        let spec: RestoreTestSpec =
            serde_json::from_str(r#"{"backupName": "nightly-2025-12-31"}"#).unwrap();
        assert_eq!(spec.restore.included_namespaces, vec!["*".to_string()]);
        assert!(spec.restore.restore_pvs);
        assert!(!spec.restore.restore_status);
        assert!(spec.health_checks.enabled);
        spec.validate().unwrap();
    }

    #[test]
    fn restore_pvs_uses_upper_case_acronym() {
        let spec: RestoreTestSpec =
            serde_json::from_str(r#"{"backupName": "b", "restore": {"restorePVs": false}}"#).unwrap();
        assert!(!spec.restore.restore_pvs);
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["restore"]["restorePVs"], serde_json::json!(false));
    }

    #[test]
    fn empty_backup_is_invalid() {
        let err = RestoreTestSpec::for_backup("  ").validate().expect_err("empty");
        assert_eq!(err.reason(), "ValidationError");
    }

    #[test]
    fn bad_ttl_is_invalid() {
        let mut spec = RestoreTestSpec::for_backup("b");
        spec.ttl = Some("tomorrow".to_string());
        assert!(spec.validate().is_err());
        spec.ttl = Some("2h".to_string());
        assert_eq!(
            spec.ttl_or(Duration::from_secs(1)).unwrap(),
            Duration::from_secs(7200)
        );
    }

    #[test]
    fn explicit_namespaces_skip_wildcard() {
        let filters = RestoreFilters {
            included_namespaces: vec!["*".to_string(), "shop".to_string()],
            ..RestoreFilters::default()
        };
        assert_eq!(filters.explicit_namespaces(), vec!["shop".to_string()]);
    }

    #[test]
    fn bad_restore_namespace_is_invalid() {
        let mut spec = RestoreTestSpec::for_backup("b");
        spec.restore_namespace = Some("Not_Valid".to_string());
        assert!(spec.validate().is_err());
    }
}
