//! LZR-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, LzrError>;

/// Top-level error type for lazarus.
#[derive(Debug, Error)]
pub enum LzrError {
    #[error("[LZR-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[LZR-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[LZR-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[LZR-1101] invalid restore test: {details}")]
    Validation { details: String },

    #[error("[LZR-2001] backup {backup} not usable: {details}")]
    BackupNotFound { backup: String, details: String },

    #[error("[LZR-2002] transient failure talking to {component}: {details}")]
    TransientInfra {
        component: &'static str,
        details: String,
    },

    #[error("[LZR-2003] restore {restore_id} did not finish within {timeout_secs}s")]
    RestoreTimeout {
        restore_id: String,
        timeout_secs: u64,
    },

    #[error("[LZR-2004] restore {restore_id} failed: {details}")]
    RestoreFailed { restore_id: String, details: String },

    #[error("[LZR-2005] {kind} {name} already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("[LZR-2101] health checks timed out: {details}")]
    HealthCheckTimeout { details: String },

    #[error("[LZR-2102] health checks failed: {details}")]
    HealthCheckFailed { details: String },

    #[error("[LZR-2201] cleanup of {resource} failed: {details}")]
    Cleanup { resource: String, details: String },

    #[error("[LZR-2301] {kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("[LZR-2302] version conflict on {name}: expected {expected}, found {found}")]
    Conflict {
        name: String,
        expected: u64,
        found: u64,
    },

    #[error("[LZR-2303] illegal phase transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("[LZR-2401] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[LZR-2402] SQL failure in {context}: {details}")]
    Sql {
        context: &'static str,
        details: String,
    },

    #[error("[LZR-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[LZR-3003] channel closed in component {component}")]
    ChannelClosed { component: &'static str },

    #[error("[LZR-3004] wait cancelled in {component}")]
    Cancelled { component: &'static str },

    #[error("[LZR-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl LzrError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "LZR-1001",
            Self::MissingConfig { .. } => "LZR-1002",
            Self::ConfigParse { .. } => "LZR-1003",
            Self::Validation { .. } => "LZR-1101",
            Self::BackupNotFound { .. } => "LZR-2001",
            Self::TransientInfra { .. } => "LZR-2002",
            Self::RestoreTimeout { .. } => "LZR-2003",
            Self::RestoreFailed { .. } => "LZR-2004",
            Self::AlreadyExists { .. } => "LZR-2005",
            Self::HealthCheckTimeout { .. } => "LZR-2101",
            Self::HealthCheckFailed { .. } => "LZR-2102",
            Self::Cleanup { .. } => "LZR-2201",
            Self::NotFound { .. } => "LZR-2301",
            Self::Conflict { .. } => "LZR-2302",
            Self::InvalidTransition { .. } => "LZR-2303",
            Self::Serialization { .. } => "LZR-2401",
            Self::Sql { .. } => "LZR-2402",
            Self::Io { .. } => "LZR-3002",
            Self::ChannelClosed { .. } => "LZR-3003",
            Self::Cancelled { .. } => "LZR-3004",
            Self::Runtime { .. } => "LZR-3900",
        }
    }

    /// Whether retrying might resolve the failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientInfra { .. }
                | Self::Conflict { .. }
                | Self::Cleanup { .. }
                | Self::Io { .. }
                | Self::ChannelClosed { .. }
                | Self::Sql { .. }
                | Self::Runtime { .. }
        )
    }

    /// Short reason string used on conditions and in result messages.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::Validation { .. } | Self::InvalidConfig { .. } => "ValidationError",
            Self::BackupNotFound { .. } => "BackupNotFound",
            Self::TransientInfra { .. } => "TransientInfraError",
            Self::RestoreTimeout { .. } => "RestoreTimeout",
            Self::RestoreFailed { .. } => "RestoreFailed",
            Self::HealthCheckTimeout { .. } => "HealthCheckTimeout",
            Self::HealthCheckFailed { .. } => "HealthCheckFailed",
            Self::Cleanup { .. } => "CleanupError",
            Self::Cancelled { .. } => "Cancelled",
            _ => "InternalError",
        }
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Convenience constructor for transient collaborator failures.
    #[must_use]
    pub fn transient(component: &'static str, details: impl Into<String>) -> Self {
        Self::TransientInfra {
            component,
            details: details.into(),
        }
    }

    /// Convenience constructor for spec validation failures.
    #[must_use]
    pub fn validation(details: impl Into<String>) -> Self {
        Self::Validation {
            details: details.into(),
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for LzrError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sql {
            context: "rusqlite",
            details: value.to_string(),
        }
    }
}

impl From<serde_json::Error> for LzrError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for LzrError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_of_each() -> Vec<LzrError> {
        vec![
            LzrError::InvalidConfig {
                details: String::new(),
            },
            LzrError::MissingConfig {
                path: PathBuf::new(),
            },
            LzrError::ConfigParse {
                context: "",
                details: String::new(),
            },
            LzrError::validation(""),
            LzrError::BackupNotFound {
                backup: String::new(),
                details: String::new(),
            },
            LzrError::transient("", ""),
            LzrError::RestoreTimeout {
                restore_id: String::new(),
                timeout_secs: 0,
            },
            LzrError::RestoreFailed {
                restore_id: String::new(),
                details: String::new(),
            },
            LzrError::AlreadyExists {
                kind: "",
                name: String::new(),
            },
            LzrError::HealthCheckTimeout {
                details: String::new(),
            },
            LzrError::HealthCheckFailed {
                details: String::new(),
            },
            LzrError::Cleanup {
                resource: String::new(),
                details: String::new(),
            },
            LzrError::NotFound {
                kind: "",
                name: String::new(),
            },
            LzrError::Conflict {
                name: String::new(),
                expected: 0,
                found: 0,
            },
            LzrError::InvalidTransition {
                from: String::new(),
                to: String::new(),
            },
            LzrError::Serialization {
                context: "",
                details: String::new(),
            },
            LzrError::Sql {
                context: "",
                details: String::new(),
            },
            LzrError::io("", std::io::Error::other("test")),
            LzrError::ChannelClosed { component: "" },
            LzrError::Cancelled { component: "" },
            LzrError::Runtime {
                details: String::new(),
            },
        ]
    }

    #[test]
    fn error_codes_are_unique_and_prefixed() {
        let errors = one_of_each();
        let codes: Vec<&str> = errors.iter().map(LzrError::code).collect();
        let unique: std::collections::HashSet<&&str> = codes.iter().collect();
        assert_eq!(
            codes.len(),
            unique.len(),
            "error codes must be unique: {codes:?}"
        );
        for code in codes {
            assert!(code.starts_with("LZR-"), "code {code} must start with LZR-");
        }
    }

    #[test]
    fn error_display_includes_code() {
        let err = LzrError::validation("backup name is empty");
        let msg = err.to_string();
        assert!(msg.contains("LZR-1101"), "display should contain code: {msg}");
        assert!(msg.contains("backup name is empty"));
    }

    #[test]
    fn retryable_errors_are_correct() {
        assert!(LzrError::transient("restore", "connection reset").is_retryable());
        assert!(
            LzrError::Conflict {
                name: "t".to_string(),
                expected: 1,
                found: 2,
            }
            .is_retryable()
        );
        assert!(
            LzrError::Cleanup {
                resource: "namespace/x".to_string(),
                details: String::new(),
            }
            .is_retryable()
        );

        assert!(!LzrError::validation("bad").is_retryable());
        assert!(
            !LzrError::BackupNotFound {
                backup: "b".to_string(),
                details: String::new(),
            }
            .is_retryable()
        );
        assert!(
            !LzrError::RestoreTimeout {
                restore_id: "r".to_string(),
                timeout_secs: 1,
            }
            .is_retryable()
        );
    }

    #[test]
    fn reasons_follow_taxonomy() {
        assert_eq!(LzrError::validation("x").reason(), "ValidationError");
        assert_eq!(LzrError::transient("x", "y").reason(), "TransientInfraError");
        assert_eq!(
            LzrError::BackupNotFound {
                backup: String::new(),
                details: String::new(),
            }
            .reason(),
            "BackupNotFound"
        );
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn from_rusqlite_error() {
        let sql_err =
            rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(1), Some("test".to_string()));
        let err: LzrError = sql_err.into();
        assert_eq!(err.code(), "LZR-2402");
    }

    #[test]
    fn from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: LzrError = json_err.into();
        assert_eq!(err.code(), "LZR-2401");
    }

    #[test]
    fn from_toml_error() {
        let toml_err = toml::from_str::<toml::Value>("= invalid").unwrap_err();
        let err: LzrError = toml_err.into();
        assert_eq!(err.code(), "LZR-1003");
    }
}
