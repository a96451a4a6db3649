//! Credential resolution for database probes.
//!
//! Connection strings are resolved by reference at probe time and never
//! written to the test record.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::core::errors::{LzrError, Result};
use crate::health::probe::ConnectionSource;

/// Reference to one key of a named secret.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretRef {
    pub name: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Resolves secret references to plaintext values.
pub trait SecretSource: Send + Sync {
    /// Short label for diagnostics.
    fn name(&self) -> &'static str;
    /// Resolve `reference`; `NotFound` when this source has no such entry.
    fn resolve(&self, reference: &SecretRef) -> Result<String>;
}

/// Resolve the connection string for a database probe.
pub fn resolve_connection(source: &ConnectionSource, secrets: &dyn SecretSource) -> Result<String> {
    match (&source.secret_ref, &source.value) {
        (Some(reference), _) => secrets.resolve(reference),
        (None, Some(value)) => Ok(value.clone()),
        (None, None) => Err(LzrError::validation("database connection has no source")),
    }
}

fn not_found(reference: &SecretRef) -> LzrError {
    LzrError::NotFound {
        kind: "secret",
        name: format!("{}/{}", reference.name, reference.key),
    }
}

/// Secrets mounted as files: `<root>/<name>/<key>`, or
/// `<root>/<namespace>/<name>/<key>` when the reference names a namespace.
#[derive(Debug, Clone)]
pub struct DirectorySecretSource {
    root: PathBuf,
}

impl DirectorySecretSource {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl SecretSource for DirectorySecretSource {
    fn name(&self) -> &'static str {
        "directory"
    }

    fn resolve(&self, reference: &SecretRef) -> Result<String> {
        let mut candidates = Vec::with_capacity(2);
        if let Some(ns) = &reference.namespace {
            candidates.push(self.root.join(ns).join(&reference.name).join(&reference.key));
        }
        candidates.push(self.root.join(&reference.name).join(&reference.key));

        for path in candidates {
            match fs::read_to_string(&path) {
                Ok(raw) => return Ok(raw.trim_end_matches(['\n', '\r']).to_string()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(LzrError::io(&path, e)),
            }
        }
        Err(not_found(reference))
    }
}

/// Secrets passed as environment variables: `LAZARUS_SECRET_<NAME>_<KEY>`,
/// upper-cased with non-alphanumerics mapped to `_`.
#[derive(Debug, Clone, Default)]
pub struct EnvSecretSource;

impl EnvSecretSource {
    #[must_use]
    pub fn variable_name(reference: &SecretRef) -> String {
        let norm = |s: &str| -> String {
            s.chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() {
                        c.to_ascii_uppercase()
                    } else {
                        '_'
                    }
                })
                .collect()
        };
        format!(
            "LAZARUS_SECRET_{}_{}",
            norm(&reference.name),
            norm(&reference.key)
        )
    }
}

impl SecretSource for EnvSecretSource {
    fn name(&self) -> &'static str {
        "env"
    }

    fn resolve(&self, reference: &SecretRef) -> Result<String> {
        std::env::var(Self::variable_name(reference)).map_err(|_| not_found(reference))
    }
}

/// In-memory secrets, keyed by `(name, key)`.
#[derive(Debug, Default)]
pub struct MemorySecretSource {
    values: RwLock<HashMap<(String, String), String>>,
}

impl MemorySecretSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: &str, key: &str, value: &str) {
        self.values
            .write()
            .insert((name.to_string(), key.to_string()), value.to_string());
    }
}

impl SecretSource for MemorySecretSource {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn resolve(&self, reference: &SecretRef) -> Result<String> {
        self.values
            .read()
            .get(&(reference.name.clone(), reference.key.clone()))
            .cloned()
            .ok_or_else(|| not_found(reference))
    }
}

/// Tries each source in order; the first hit wins.
pub struct ChainedSecretSource {
    sources: Vec<Box<dyn SecretSource>>,
}

impl ChainedSecretSource {
    #[must_use]
    pub fn new(sources: Vec<Box<dyn SecretSource>>) -> Self {
        Self { sources }
    }
}

impl SecretSource for ChainedSecretSource {
    fn name(&self) -> &'static str {
        "chain"
    }

    fn resolve(&self, reference: &SecretRef) -> Result<String> {
        for source in &self.sources {
            match source.resolve(reference) {
                Ok(value) => return Ok(value),
                Err(LzrError::NotFound { .. }) => {}
                Err(other) => return Err(other),
            }
        }
        Err(not_found(reference))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(name: &str, key: &str) -> SecretRef {
        SecretRef {
            name: name.to_string(),
            key: key.to_string(),
            namespace: None,
        }
    }

    #[test]
    fn directory_source_reads_mounted_key() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("db-creds")).unwrap();
        fs::write(dir.path().join("db-creds").join("url"), "postgres://u:p@db/app\n").unwrap();
        let source = DirectorySecretSource::new(dir.path());
        assert_eq!(
            source.resolve(&reference("db-creds", "url")).unwrap(),
            "postgres://u:p@db/app"
        );
        let err = source.resolve(&reference("db-creds", "missing")).unwrap_err();
        assert!(matches!(err, LzrError::NotFound { kind: "secret", .. }));
    }

    #[test]
    fn env_variable_name_is_normalized() {
        assert_eq!(
            EnvSecretSource::variable_name(&reference("db-creds", "connection.url")),
            "LAZARUS_SECRET_DB_CREDS_CONNECTION_URL"
        );
    }

    #[test]
    fn chain_falls_through_not_found() {
        let first = MemorySecretSource::new();
        let second = MemorySecretSource::new();
        second.insert("db", "url", "sqlite:///tmp/x.db");
        let chain = ChainedSecretSource::new(vec![Box::new(first), Box::new(second)]);
        assert_eq!(chain.resolve(&reference("db", "url")).unwrap(), "sqlite:///tmp/x.db");
        assert!(chain.resolve(&reference("db", "other")).is_err());
    }

    #[test]
    fn inline_value_bypasses_secrets() {
        let source = ConnectionSource {
            secret_ref: None,
            value: Some("sqlite:///tmp/inline.db".to_string()),
        };
        let secrets = MemorySecretSource::new();
        assert_eq!(
            resolve_connection(&source, &secrets).unwrap(),
            "sqlite:///tmp/inline.db"
        );
    }
}
