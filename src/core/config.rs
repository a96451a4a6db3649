//! Configuration system: TOML file + `LAZARUS_*` env overrides + defaults.

#![allow(missing_docs)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{LzrError, Result};
use crate::core::naming::{is_dns_label, parse_duration};
use crate::daemon::notifications::NotificationConfig;

/// Full lazarus configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    pub operator: OperatorConfig,
    pub restore: RestoreConfig,
    pub health: HealthConfig,
    pub cleanup: CleanupConfig,
    pub daemon: DaemonConfig,
    pub paths: PathsConfig,
    pub notifications: NotificationConfig,
}

/// Identity of the controller and naming of the namespaces it creates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OperatorConfig {
    /// Namespace the controller itself runs in; never restored into.
    pub namespace: String,
    /// Prefix for generated restore namespaces.
    pub test_namespace_prefix: String,
    /// `tracing` filter directive used when `RUST_LOG` is unset.
    pub log_level: String,
}

/// Restore subsystem access and the create/poll policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RestoreConfig {
    /// Namespace holding backup and restore objects.
    pub subsystem_namespace: String,
    /// Upper bound on waiting for a restore to become terminal.
    pub timeout_secs: u64,
    /// Fixed polling cadence while a restore is in progress.
    pub poll_interval_secs: u64,
    /// Ceiling for the poll interval when the subsystem keeps erroring.
    pub max_poll_interval_secs: u64,
    /// Attempts at creating the restore before giving up.
    pub create_attempts: u32,
    pub create_backoff_base_secs: u64,
    pub create_backoff_cap_secs: u64,
    /// Block inside a pass until the restore is terminal instead of requeueing.
    pub blocking_wait: bool,
    /// Always excluded in addition to the operator and subsystem namespaces.
    pub excluded_namespaces: Vec<String>,
    /// `kubectl` binary used by the cluster adapters.
    pub kubectl_path: String,
    /// Per-request timeout handed to `kubectl`.
    pub request_timeout_secs: u64,
}

/// Health-check defaults applied when a test spec leaves them unset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HealthConfig {
    /// Overall budget for all probes of one test.
    pub timeout_secs: u64,
    /// Per-attempt timeout for a single probe.
    pub probe_timeout_secs: u64,
    /// Attempts per probe (first try included).
    pub attempts: u32,
    pub retry_delay_secs: u64,
    /// Concurrent probe workers per test.
    pub max_parallel_probes: usize,
    /// Pause between restore completion and the first probe.
    pub settle_delay_secs: u64,
}

/// Cleanup and retention policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CleanupConfig {
    pub enabled: bool,
    /// Retention after completion, e.g. `24h`.
    pub default_ttl: String,
    pub on_success: bool,
    /// When false, failed tests keep their resources until explicitly deleted.
    pub on_failure: bool,
    /// Cleanup attempts before the resources are reported as leaked.
    pub max_attempts: u32,
    pub retry_delay_secs: u64,
}

/// Worker pool and resync cadence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Concurrent reconcile workers (one test per worker at a time).
    pub workers: usize,
    pub resync_interval_secs: u64,
    /// How often a store without a change feed is checked for deletion
    /// requests made by other processes.
    pub deletion_poll_ms: u64,
    pub error_backoff_base_ms: u64,
    pub error_backoff_cap_secs: u64,
}

/// Filesystem locations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    /// SQLite database holding restore-test records.
    pub store_db: PathBuf,
    pub jsonl_log: PathBuf,
    /// Mounted secrets laid out as `<dir>/<secret>/<key>`.
    pub secrets_dir: PathBuf,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: "lazarus-system".to_string(),
            test_namespace_prefix: "lazarus-test".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            subsystem_namespace: "velero".to_string(),
            timeout_secs: 600,
            poll_interval_secs: 10,
            max_poll_interval_secs: 60,
            create_attempts: 5,
            create_backoff_base_secs: 2,
            create_backoff_cap_secs: 60,
            blocking_wait: false,
            excluded_namespaces: vec!["kube-system".to_string()],
            kubectl_path: "kubectl".to_string(),
            request_timeout_secs: 30,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 600,
            probe_timeout_secs: 30,
            attempts: 3,
            retry_delay_secs: 5,
            max_parallel_probes: 8,
            settle_delay_secs: 0,
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl: "24h".to_string(),
            on_success: true,
            on_failure: false,
            max_attempts: 5,
            retry_delay_secs: 30,
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            resync_interval_secs: 60,
            deletion_poll_ms: 1000,
            error_backoff_base_ms: 500,
            error_backoff_cap_secs: 60,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home_dir = env::var_os("HOME").map_or_else(
            || {
                eprintln!("[LZR-CONFIG] WARNING: HOME not set, falling back to /tmp for data paths");
                PathBuf::from("/tmp")
            },
            PathBuf::from,
        );
        let data = home_dir.join(".local").join("share").join("lazarus");
        Self {
            config_file: home_dir.join(".config").join("lazarus").join("config.toml"),
            store_db: data.join("tests.sqlite3"),
            jsonl_log: data.join("activity.jsonl"),
            secrets_dir: PathBuf::from("/var/run/secrets/lazarus"),
        }
    }
}

impl RestoreConfig {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl CleanupConfig {
    /// Parsed default TTL.
    pub fn default_ttl(&self) -> Result<Duration> {
        parse_duration(&self.default_ttl)
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| LzrError::Io {
                path: path_buf.clone(),
                source,
            })?;
            toml::from_str::<Self>(&raw)?
        } else if is_explicit_path {
            return Err(LzrError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides_from(env_var)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Deterministic hash of the effective config for the startup log line.
    ///
    /// FNV-1a keeps the value stable across processes and toolchains.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        // operator
        set_string(&mut lookup, "LAZARUS_NAMESPACE", &mut self.operator.namespace);
        set_string(
            &mut lookup,
            "LAZARUS_TEST_NAMESPACE_PREFIX",
            &mut self.operator.test_namespace_prefix,
        );
        set_string(&mut lookup, "LAZARUS_LOG_LEVEL", &mut self.operator.log_level);

        // restore
        set_string(
            &mut lookup,
            "LAZARUS_VELERO_NAMESPACE",
            &mut self.restore.subsystem_namespace,
        );
        set_u64(&mut lookup, "LAZARUS_RESTORE_TIMEOUT_SECS", &mut self.restore.timeout_secs)?;
        set_u64(
            &mut lookup,
            "LAZARUS_RESTORE_POLL_INTERVAL_SECS",
            &mut self.restore.poll_interval_secs,
        )?;
        set_u32(
            &mut lookup,
            "LAZARUS_RESTORE_CREATE_ATTEMPTS",
            &mut self.restore.create_attempts,
        )?;
        set_bool(&mut lookup, "LAZARUS_RESTORE_BLOCKING_WAIT", &mut self.restore.blocking_wait)?;
        set_string(&mut lookup, "LAZARUS_KUBECTL", &mut self.restore.kubectl_path);

        // health
        set_u64(&mut lookup, "LAZARUS_HEALTH_TIMEOUT_SECS", &mut self.health.timeout_secs)?;
        set_u64(
            &mut lookup,
            "LAZARUS_HEALTH_PROBE_TIMEOUT_SECS",
            &mut self.health.probe_timeout_secs,
        )?;
        set_u32(&mut lookup, "LAZARUS_HEALTH_ATTEMPTS", &mut self.health.attempts)?;
        set_usize(
            &mut lookup,
            "LAZARUS_HEALTH_MAX_PARALLEL",
            &mut self.health.max_parallel_probes,
        )?;

        // cleanup
        set_bool(&mut lookup, "LAZARUS_CLEANUP_ENABLED", &mut self.cleanup.enabled)?;
        set_bool(&mut lookup, "LAZARUS_CLEANUP_ON_SUCCESS", &mut self.cleanup.on_success)?;
        set_bool(&mut lookup, "LAZARUS_CLEANUP_ON_FAILURE", &mut self.cleanup.on_failure)?;
        set_string(&mut lookup, "LAZARUS_DEFAULT_TTL", &mut self.cleanup.default_ttl);

        // daemon
        set_usize(&mut lookup, "LAZARUS_WORKERS", &mut self.daemon.workers)?;
        set_usize(&mut lookup, "LAZARUS_RECONCILE_WORKERS", &mut self.daemon.workers)?;
        set_u64(
            &mut lookup,
            "LAZARUS_RECONCILE_INTERVAL_SECS",
            &mut self.daemon.resync_interval_secs,
        )?;
        set_u64(&mut lookup, "LAZARUS_DELETION_POLL_MS", &mut self.daemon.deletion_poll_ms)?;

        // paths
        set_path(&mut lookup, "LAZARUS_STORE_DB", &mut self.paths.store_db);
        set_path(&mut lookup, "LAZARUS_JSONL_LOG", &mut self.paths.jsonl_log);
        set_path(&mut lookup, "LAZARUS_SECRETS_DIR", &mut self.paths.secrets_dir);

        // notifications
        if let Some(url) = lookup("LAZARUS_SLACK_WEBHOOK_URL") {
            self.notifications.webhook.url = url;
            self.notifications.webhook.enabled = true;
            if !self.notifications.channels.iter().any(|c| c == "webhook") {
                self.notifications.channels.push("webhook".to_string());
            }
        }
        set_string(
            &mut lookup,
            "LAZARUS_SLACK_CHANNEL",
            &mut self.notifications.webhook.default_channel,
        );

        Ok(())
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        for (field, ns) in [
            ("operator.namespace", &self.operator.namespace),
            ("restore.subsystem_namespace", &self.restore.subsystem_namespace),
        ] {
            if !is_dns_label(ns) {
                return Err(LzrError::InvalidConfig {
                    details: format!("{field} {ns:?} is not a valid namespace name"),
                });
            }
        }
        // Prefix + "-" + 14-digit timestamp + hash must still fit in a label.
        if !is_dns_label(&self.operator.test_namespace_prefix)
            || self.operator.test_namespace_prefix.len() > 38
        {
            return Err(LzrError::InvalidConfig {
                details: format!(
                    "operator.test_namespace_prefix {:?} must be a DNS label of at most 38 chars",
                    self.operator.test_namespace_prefix
                ),
            });
        }

        if self.restore.timeout_secs == 0 {
            return Err(LzrError::InvalidConfig {
                details: "restore.timeout_secs must be > 0".to_string(),
            });
        }
        if self.restore.poll_interval_secs == 0
            || self.restore.poll_interval_secs > self.restore.max_poll_interval_secs
        {
            return Err(LzrError::InvalidConfig {
                details: format!(
                    "restore.poll_interval_secs ({}) must be in 1..=max_poll_interval_secs ({})",
                    self.restore.poll_interval_secs, self.restore.max_poll_interval_secs
                ),
            });
        }
        if self.restore.create_attempts == 0 {
            return Err(LzrError::InvalidConfig {
                details: "restore.create_attempts must be >= 1".to_string(),
            });
        }
        if self.restore.create_backoff_base_secs > self.restore.create_backoff_cap_secs {
            return Err(LzrError::InvalidConfig {
                details: "restore.create_backoff_base_secs must not exceed the cap".to_string(),
            });
        }

        if self.health.timeout_secs == 0 || self.health.probe_timeout_secs == 0 {
            return Err(LzrError::InvalidConfig {
                details: "health timeouts must be > 0".to_string(),
            });
        }
        if self.health.attempts == 0 {
            return Err(LzrError::InvalidConfig {
                details: "health.attempts must be >= 1".to_string(),
            });
        }
        if self.health.max_parallel_probes == 0 {
            return Err(LzrError::InvalidConfig {
                details: "health.max_parallel_probes must be >= 1".to_string(),
            });
        }

        self.cleanup
            .default_ttl()
            .map_err(|e| LzrError::InvalidConfig {
                details: format!("cleanup.default_ttl: {e}"),
            })?;
        if self.cleanup.max_attempts == 0 {
            return Err(LzrError::InvalidConfig {
                details: "cleanup.max_attempts must be >= 1".to_string(),
            });
        }

        if self.daemon.workers == 0 {
            return Err(LzrError::InvalidConfig {
                details: "daemon.workers must be >= 1".to_string(),
            });
        }
        if self.daemon.resync_interval_secs == 0 {
            return Err(LzrError::InvalidConfig {
                details: "daemon.resync_interval_secs must be > 0".to_string(),
            });
        }
        if self.daemon.deletion_poll_ms == 0 {
            return Err(LzrError::InvalidConfig {
                details: "daemon.deletion_poll_ms must be > 0".to_string(),
            });
        }

        if self.notifications.webhook.enabled && self.notifications.webhook.url.trim().is_empty() {
            return Err(LzrError::InvalidConfig {
                details: "notifications.webhook.url is required when the webhook is enabled"
                    .to_string(),
            });
        }
        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn set_string<F>(lookup: &mut F, name: &str, slot: &mut String)
where
    F: FnMut(&str) -> Option<String>,
{
    if let Some(raw) = lookup(name) {
        *slot = raw;
    }
}

fn set_path<F>(lookup: &mut F, name: &str, slot: &mut PathBuf)
where
    F: FnMut(&str) -> Option<String>,
{
    if let Some(raw) = lookup(name) {
        *slot = PathBuf::from(raw);
    }
}

fn set_u64<F>(lookup: &mut F, name: &str, slot: &mut u64) -> Result<()>
where
    F: FnMut(&str) -> Option<String>,
{
    if let Some(raw) = lookup(name) {
        *slot = parse_env(name, &raw)?;
    }
    Ok(())
}

fn set_u32<F>(lookup: &mut F, name: &str, slot: &mut u32) -> Result<()>
where
    F: FnMut(&str) -> Option<String>,
{
    if let Some(raw) = lookup(name) {
        *slot = parse_env(name, &raw)?;
    }
    Ok(())
}

fn set_usize<F>(lookup: &mut F, name: &str, slot: &mut usize) -> Result<()>
where
    F: FnMut(&str) -> Option<String>,
{
    if let Some(raw) = lookup(name) {
        *slot = parse_env(name, &raw)?;
    }
    Ok(())
}

fn set_bool<F>(lookup: &mut F, name: &str, slot: &mut bool) -> Result<()>
where
    F: FnMut(&str) -> Option<String>,
{
    if let Some(raw) = lookup(name) {
        *slot = parse_env(name, &raw)?;
    }
    Ok(())
}

fn parse_env<T>(name: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|error| LzrError::ConfigParse {
        context: "env",
        details: format!("{name}={raw:?}: {error}"),
    })
}

#[cfg(test)]
mod tests {
    use super::{Config, LzrError};
    use std::collections::HashMap;
    use std::path::Path;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(name, value)| ((*name).to_string(), (*value).to_string()))
            .collect()
    }

    fn with_env(pairs: &[(&str, &str)]) -> crate::core::errors::Result<Config> {
        let env = vars(pairs);
        let mut cfg = Config::default();
        cfg.apply_env_overrides_from(|name| env.get(name).cloned())?;
        cfg.validate()?;
        Ok(cfg)
    }

    #[test]
    fn default_config_is_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.restore.subsystem_namespace, "velero");
        assert_eq!(cfg.operator.test_namespace_prefix, "lazarus-test");
        assert!(!cfg.cleanup.on_failure);
    }

    #[test]
    fn env_overrides_apply() {
        let cfg = with_env(&[
            ("LAZARUS_RESTORE_TIMEOUT_SECS", "1200"),
            ("LAZARUS_WORKERS", "2"),
            ("LAZARUS_CLEANUP_ON_FAILURE", "true"),
            ("LAZARUS_DEFAULT_TTL", "2h"),
        ])
        .expect("overrides should apply");
        assert_eq!(cfg.restore.timeout_secs, 1200);
        assert_eq!(cfg.daemon.workers, 2);
        assert!(cfg.cleanup.on_failure);
        assert_eq!(cfg.cleanup.default_ttl, "2h");
    }

    #[test]
    fn env_invalid_number_rejected() {
        let err = with_env(&[("LAZARUS_WORKERS", "many")]).expect_err("should fail");
        assert!(matches!(err, LzrError::ConfigParse { context: "env", .. }));
        assert!(err.to_string().contains("LAZARUS_WORKERS"));
    }

    #[test]
    fn slack_webhook_env_enables_channel() {
        let cfg = with_env(&[
            ("LAZARUS_SLACK_WEBHOOK_URL", "https://hooks.example.test/abc"),
            ("LAZARUS_SLACK_CHANNEL", "#dr-drills"),
        ])
        .expect("webhook env");
        assert!(cfg.notifications.webhook.enabled);
        assert!(cfg.notifications.channels.iter().any(|c| c == "webhook"));
        assert_eq!(cfg.notifications.webhook.default_channel, "#dr-drills");
    }

    #[test]
    fn poll_interval_must_not_exceed_ceiling() {
        let mut cfg = Config::default();
        cfg.restore.poll_interval_secs = cfg.restore.max_poll_interval_secs + 1;
        let err = cfg.validate().expect_err("expected validation error");
        assert!(err.to_string().contains("poll_interval_secs"));
    }

    #[test]
    fn invalid_ttl_rejected() {
        let mut cfg = Config::default();
        cfg.cleanup.default_ttl = "forever".to_string();
        let err = cfg.validate().expect_err("expected validation error");
        assert_eq!(err.code(), "LZR-1001");
    }

    #[test]
    fn bad_namespace_rejected() {
        let mut cfg = Config::default();
        cfg.operator.namespace = "Not_A_Namespace".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_workers_rejected() {
        let mut cfg = Config::default();
        cfg.daemon.workers = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn load_returns_error_for_explicit_missing_path() {
        let err = Config::load(Some(Path::new("/definitely/not/here/lazarus.toml")))
            .expect_err("missing explicit path");
        assert!(matches!(err, LzrError::MissingConfig { .. }));
    }

    #[test]
    fn load_parses_partial_toml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[restore]\ntimeout_secs = 900\n\n[cleanup]\ndefault_ttl = \"6h\"\n",
        )
        .expect("write config");
        let cfg = Config::load(Some(&path)).expect("load");
        assert_eq!(cfg.restore.timeout_secs, 900);
        assert_eq!(cfg.restore.poll_interval_secs, 10);
        assert_eq!(cfg.cleanup.default_ttl, "6h");
        assert_eq!(cfg.paths.config_file, path);
    }

    #[test]
    fn stable_hash_tracks_changes() {
        let cfg = Config::default();
        let h1 = cfg.stable_hash().expect("hash");
        assert_eq!(h1, cfg.stable_hash().expect("hash"));
        let mut modified = Config::default();
        modified.health.attempts += 1;
        assert_ne!(h1, modified.stable_hash().expect("hash"));
    }
}
