//! Velero restore subsystem driven through `kubectl`.

#![allow(missing_docs)]

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};
use std::time::Duration;

use serde_json::{Value, json};

use crate::core::errors::{LzrError, Result};
use crate::restore::{BackupInfo, ExternalRestore, RestoreRequest, RestoreStatus, RestoreSubsystem};

const COMPONENT: &str = "restore-subsystem";
const MAX_WARNINGS: usize = 20;

pub struct KubectlRestoreSubsystem {
    kubectl: PathBuf,
    request_timeout: Duration,
}

impl KubectlRestoreSubsystem {
    pub fn new(kubectl: impl Into<PathBuf>, request_timeout: Duration) -> Self {
        Self {
            kubectl: kubectl.into(),
            request_timeout,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.kubectl);
        cmd.arg(format!("--request-timeout={}s", self.request_timeout.as_secs().max(1)));
        cmd
    }

    fn run(&self, mut cmd: Command, stdin: Option<&[u8]>) -> Result<Output> {
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() });
        let mut child = cmd
            .spawn()
            .map_err(|e| LzrError::transient(COMPONENT, format!("spawn {}: {e}", self.kubectl.display())))?;
        if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(bytes)
                .map_err(|e| LzrError::transient(COMPONENT, format!("write manifest: {e}")))?;
        }
        child
            .wait_with_output()
            .map_err(|e| LzrError::transient(COMPONENT, format!("wait for kubectl: {e}")))
    }

    fn get_json(&self, kind: &str, namespace: &str, name: &str) -> Result<Option<Value>> {
        let mut cmd = self.command();
        cmd.args(["get", kind, name, "-n", namespace, "-o", "json"]);
        let output = self.run(cmd, None)?;
        if output.status.success() {
            return Ok(Some(serde_json::from_slice(&output.stdout)?));
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_not_found(&stderr) {
            return Ok(None);
        }
        Err(LzrError::transient(COMPONENT, format!("get {kind}/{name}: {}", stderr.trim())))
    }
}

pub(crate) fn is_not_found(stderr: &str) -> bool {
    stderr.contains("NotFound") || stderr.contains("not found")
}

pub(crate) fn is_already_exists(stderr: &str) -> bool {
    stderr.contains("AlreadyExists") || stderr.contains("already exists")
}

impl RestoreSubsystem for KubectlRestoreSubsystem {
    fn get_backup(&self, namespace: &str, name: &str) -> Result<Option<BackupInfo>> {
        Ok(self
            .get_json("backups.velero.io", namespace, name)?
            .map(|object| parse_backup_object(name, &object)))
    }

    fn create_restore(&self, request: &RestoreRequest) -> Result<()> {
        let manifest = serde_json::to_vec(&restore_manifest(request))?;
        let mut cmd = self.command();
        cmd.args(["create", "-f", "-"]);
        let output = self.run(cmd, Some(&manifest))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_already_exists(&stderr) {
            return Err(LzrError::AlreadyExists {
                kind: "restore",
                name: request.name.clone(),
            });
        }
        Err(LzrError::transient(COMPONENT, format!("create restore {}: {}", request.name, stderr.trim())))
    }

    fn get_restore(&self, namespace: &str, name: &str) -> Result<Option<ExternalRestore>> {
        Ok(self
            .get_json("restores.velero.io", namespace, name)?
            .map(|object| parse_restore_object(name, &object)))
    }

    fn delete_restore(&self, namespace: &str, name: &str) -> Result<bool> {
        let mut cmd = self.command();
        cmd.args(["delete", "restores.velero.io", name, "-n", namespace, "--wait=false"]);
        let output = self.run(cmd, None)?;
        if output.status.success() {
            return Ok(true);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_not_found(&stderr) {
            return Ok(false);
        }
        Err(LzrError::transient(COMPONENT, format!("delete restore {name}: {}", stderr.trim())))
    }
}

/// The Restore custom resource for `request`.
#[must_use]
pub fn restore_manifest(request: &RestoreRequest) -> Value {
    let mut spec = json!({
        "backupName": request.backup_name,
        "restorePVs": request.restore_pvs,
        "includedNamespaces": request.included_namespaces,
        "excludedNamespaces": request.excluded_namespaces,
        "namespaceMapping": request.namespace_mapping,
    });
    if !request.included_resources.is_empty() {
        spec["includedResources"] = json!(request.included_resources);
    }
    if !request.excluded_resources.is_empty() {
        spec["excludedResources"] = json!(request.excluded_resources);
    }
    if request.restore_status {
        spec["restoreStatus"] = json!({ "includedResources": ["*"] });
    }
    json!({
        "apiVersion": "velero.io/v1",
        "kind": "Restore",
        "metadata": {
            "name": request.name,
            "namespace": request.namespace,
            "labels": request.labels,
        },
        "spec": spec,
    })
}

fn string_list(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

#[must_use]
pub fn parse_backup_object(name: &str, object: &Value) -> BackupInfo {
    BackupInfo {
        name: name.to_string(),
        phase: object["status"]["phase"].as_str().unwrap_or_default().to_string(),
        included_namespaces: string_list(&object["spec"]["includedNamespaces"]),
    }
}

/// Translate a Restore object's status block.
#[must_use]
pub fn parse_restore_object(name: &str, object: &Value) -> ExternalRestore {
    let status = &object["status"];
    let raw_phase = status["phase"].as_str().unwrap_or_default().to_string();
    let mut warnings = string_list(&status["validationErrors"]);
    if let Some(reason) = status["failureReason"].as_str().filter(|r| !r.is_empty()) {
        warnings.push(reason.to_string());
    }
    warnings.truncate(MAX_WARNINGS);
    ExternalRestore {
        name: name.to_string(),
        status: RestoreStatus::from_external(&raw_phase),
        raw_phase,
        items_attempted: status["progress"]["totalItems"].as_u64().unwrap_or_default(),
        items_restored: status["progress"]["itemsRestored"].as_u64().unwrap_or_default(),
        error_count: status["errors"].as_u64().unwrap_or_default(),
        warning_count: status["warnings"].as_u64().unwrap_or_default(),
        warnings,
        failure_reason: status["failureReason"].as_str().map(String::from),
    }
}
