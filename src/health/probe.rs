//! Health-check configuration as written on a test, and the flattened probe plan.
//!
//! Probes are a closed set of variants: each carries only the fields its
//! category needs. [`HealthCheckSpec::plan`] validates the configuration and
//! resolves per-probe timeout and retry policy against the defaults.

#![allow(missing_docs)]

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::errors::{LzrError, Result};
use crate::health::secrets::SecretRef;

const fn default_true() -> bool {
    true
}

const fn default_expected_status() -> u16 {
    200
}

// ──────────────────── spec (user-facing) ────────────────────

/// `spec.healthChecks` on a restore test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckSpec {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Overall budget for every probe of this test.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseChecks>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpChecks>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<CustomChecks>,
}

impl Default for HealthCheckSpec {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_seconds: None,
            attempts: None,
            retry_delay_seconds: None,
            database: None,
            http: None,
            custom: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbEngine {
    Postgres,
    Sqlite,
    Mysql,
    /// `sql` holds a JSON command document, e.g. `{"ping": 1}`.
    Mongodb,
}

/// Where a database connection string comes from. Exactly one field is set.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseChecks {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub engine: Option<DbEngine>,
    pub connection: ConnectionSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(default)]
    pub queries: Vec<QuerySpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RangeExpectation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

/// One query; exactly one expectation must be configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySpec {
    pub name: String,
    pub sql: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_range: Option<RangeExpectation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_columns: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpChecks {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(default)]
    pub endpoints: Vec<EndpointSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Head,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BodyExpectation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contains: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSpec {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default = "default_expected_status")]
    pub expected_status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_body: Option<BodyExpectation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomChecks {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(default)]
    pub probes: Vec<CustomProbeSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomProbeSpec {
    pub name: String,
    /// Program followed by its arguments.
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
}

// ──────────────────── plan (engine-facing) ────────────────────

/// Probe category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Database,
    Http,
    Custom,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Database => "database",
            Self::Http => "http",
            Self::Custom => "custom",
        })
    }
}

/// Validation applied to the first row of a query result.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryCheck {
    Range { min: f64, max: f64 },
    Columns { expected: Vec<String> },
    Recency { max_age: Duration },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseProbe {
    pub engine: Option<DbEngine>,
    pub connection: ConnectionSource,
    pub sql: String,
    pub check: QueryCheck,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpProbe {
    pub url: String,
    pub method: HttpMethod,
    pub expected_status: u16,
    pub body_contains: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomProbe {
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeKind {
    Database(DatabaseProbe),
    Http(HttpProbe),
    Custom(CustomProbe),
}

/// A single named probe with its resolved retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct Probe {
    pub name: String,
    pub category: Category,
    /// Per-attempt timeout.
    pub timeout: Duration,
    pub attempts: u32,
    pub retry_delay: Duration,
    pub kind: ProbeKind,
}

/// Defaults used where the spec is silent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeDefaults {
    pub overall_timeout: Duration,
    pub probe_timeout: Duration,
    pub attempts: u32,
    pub retry_delay: Duration,
}

impl Default for ProbeDefaults {
    fn default() -> Self {
        Self {
            overall_timeout: Duration::from_secs(600),
            probe_timeout: Duration::from_secs(30),
            attempts: 3,
            retry_delay: Duration::from_secs(5),
        }
    }
}

/// Everything the engine needs for one test.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HealthPlan {
    pub enabled: BTreeSet<Category>,
    pub probes: Vec<Probe>,
    pub overall_timeout: Duration,
}

impl HealthCheckSpec {
    /// Validate and flatten into a probe plan.
    pub fn plan(&self, defaults: &ProbeDefaults) -> Result<HealthPlan> {
        let overall_timeout = self
            .timeout_seconds
            .map_or(defaults.overall_timeout, Duration::from_secs);
        let mut plan = HealthPlan {
            overall_timeout,
            ..HealthPlan::default()
        };
        if !self.enabled {
            return Ok(plan);
        }
        if overall_timeout.is_zero() {
            return Err(LzrError::validation("healthChecks.timeoutSeconds must be > 0"));
        }

        let base_attempts = self.attempts.unwrap_or(defaults.attempts);
        let retry_delay = self
            .retry_delay_seconds
            .map_or(defaults.retry_delay, Duration::from_secs);
        let policy = |timeout: Option<u64>, attempts: Option<u32>| -> Result<(Duration, u32)> {
            let timeout = timeout.map_or(defaults.probe_timeout, Duration::from_secs);
            let attempts = attempts.unwrap_or(base_attempts);
            if timeout.is_zero() {
                return Err(LzrError::validation("probe timeoutSeconds must be > 0"));
            }
            if attempts == 0 {
                return Err(LzrError::validation("probe attempts must be >= 1"));
            }
            Ok((timeout, attempts))
        };

        if let Some(db) = self.database.as_ref().filter(|db| db.enabled) {
            plan.enabled.insert(Category::Database);
            validate_connection(&db.connection)?;
            let (timeout, attempts) = policy(db.timeout_seconds, db.attempts)?;
            for query in &db.queries {
                if query.sql.trim().is_empty() {
                    return Err(LzrError::validation(format!(
                        "database query {:?} has empty sql",
                        query.name
                    )));
                }
                plan.probes.push(Probe {
                    name: query.name.clone(),
                    category: Category::Database,
                    timeout,
                    attempts,
                    retry_delay,
                    kind: ProbeKind::Database(DatabaseProbe {
                        engine: db.engine,
                        connection: db.connection.clone(),
                        sql: query.sql.clone(),
                        check: query.check()?,
                    }),
                });
            }
        }

        if let Some(http) = self.http.as_ref().filter(|http| http.enabled) {
            plan.enabled.insert(Category::Http);
            for endpoint in &http.endpoints {
                reqwest::Url::parse(&endpoint.url).map_err(|e| {
                    LzrError::validation(format!(
                        "endpoint {:?} has invalid url {:?}: {e}",
                        endpoint.name, endpoint.url
                    ))
                })?;
                if !(100..=599).contains(&endpoint.expected_status) {
                    return Err(LzrError::validation(format!(
                        "endpoint {:?} expects impossible status {}",
                        endpoint.name, endpoint.expected_status
                    )));
                }
                let (timeout, attempts) = policy(
                    endpoint.timeout_seconds.or(http.timeout_seconds),
                    endpoint.attempts.or(http.attempts),
                )?;
                plan.probes.push(Probe {
                    name: endpoint.name.clone(),
                    category: Category::Http,
                    timeout,
                    attempts,
                    retry_delay,
                    kind: ProbeKind::Http(HttpProbe {
                        url: endpoint.url.clone(),
                        method: endpoint.method,
                        expected_status: endpoint.expected_status,
                        body_contains: endpoint
                            .expected_body
                            .as_ref()
                            .and_then(|b| b.contains.clone()),
                    }),
                });
            }
        }

        if let Some(custom) = self.custom.as_ref().filter(|custom| custom.enabled) {
            plan.enabled.insert(Category::Custom);
            for probe in &custom.probes {
                if probe.command.first().is_none_or(|program| program.trim().is_empty()) {
                    return Err(LzrError::validation(format!(
                        "custom probe {:?} has no command",
                        probe.name
                    )));
                }
                let (timeout, attempts) = policy(
                    probe.timeout_seconds.or(custom.timeout_seconds),
                    probe.attempts.or(custom.attempts),
                )?;
                plan.probes.push(Probe {
                    name: probe.name.clone(),
                    category: Category::Custom,
                    timeout,
                    attempts,
                    retry_delay,
                    kind: ProbeKind::Custom(CustomProbe {
                        command: probe.command.clone(),
                        env: probe.env.clone(),
                    }),
                });
            }
        }

        let mut seen = HashSet::new();
        for probe in &plan.probes {
            if probe.name.trim().is_empty() {
                return Err(LzrError::validation("probe names must not be empty"));
            }
            if !seen.insert(probe.name.as_str()) {
                return Err(LzrError::validation(format!(
                    "probe name {:?} is used more than once",
                    probe.name
                )));
            }
        }
        Ok(plan)
    }
}

impl QuerySpec {
    /// The single configured expectation.
    pub fn check(&self) -> Result<QueryCheck> {
        let configured = usize::from(self.expected_range.is_some())
            + usize::from(self.expected_columns.is_some())
            + usize::from(self.max_age_seconds.is_some());
        if configured != 1 {
            return Err(LzrError::validation(format!(
                "query {:?} must set exactly one of expectedRange, expectedColumns, maxAgeSeconds (found {configured})",
                self.name
            )));
        }
        if let Some(range) = self.expected_range {
            let min = range.min.unwrap_or(f64::NEG_INFINITY);
            let max = range.max.unwrap_or(f64::INFINITY);
            if min > max || min.is_nan() || max.is_nan() {
                return Err(LzrError::validation(format!(
                    "query {:?} has empty range [{min}, {max}]",
                    self.name
                )));
            }
            return Ok(QueryCheck::Range { min, max });
        }
        if let Some(expected) = &self.expected_columns {
            if expected.is_empty() {
                return Err(LzrError::validation(format!(
                    "query {:?} expects an empty column set",
                    self.name
                )));
            }
            return Ok(QueryCheck::Columns {
                expected: expected.clone(),
            });
        }
        let max_age = self.max_age_seconds.unwrap_or_default();
        Ok(QueryCheck::Recency {
            max_age: Duration::from_secs(max_age),
        })
    }
}

fn validate_connection(source: &ConnectionSource) -> Result<()> {
    match (&source.secret_ref, &source.value) {
        (Some(secret), None) if !secret.name.is_empty() && !secret.key.is_empty() => Ok(()),
        (None, Some(value)) if !value.trim().is_empty() => Ok(()),
        _ => Err(LzrError::validation(
            "database connection must set exactly one of secretRef {name, key} or value",
        )),
    }
}

// ──────────────────── results ────────────────────

/// Outcome of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeStatus {
    Passed,
    Failed,
    Timeout,
}

impl fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Passed => "Passed",
            Self::Failed => "Failed",
            Self::Timeout => "Timeout",
        })
    }
}

/// Write-once record of a probe's final attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResult {
    pub name: String,
    pub category: Category,
    pub status: ProbeStatus,
    pub detail: String,
    pub duration_seconds: f64,
    /// Retries consumed beyond the first attempt.
    pub retry_count: u32,
    /// Data age seen by a recency check; feeds RPO.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_age_seconds: Option<f64>,
    pub completed_at: DateTime<Utc>,
}
