//! Mutable, append-style status of a restore test.
//!
//! `conditions` and `healthCheckResults` are event logs: entries are only
//! appended, and "has this step already run" is answered by scanning them.

#![allow(missing_docs)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::errors::{LzrError, Result};
use crate::health::probe::HealthCheckResult;
use crate::model::phase::Phase;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreTestStatus {
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
    /// Namespace the backup is restored into; fixed on the first pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_namespace: Option<String>,
    #[serde(default)]
    pub restore_state: RestoreState,
    #[serde(default)]
    pub health_check_results: Vec<HealthCheckResult>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TestResult>,
    #[serde(default)]
    pub cleanup: CleanupState,
}

/// What the external restore subsystem last told us.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_phase: Option<String>,
    #[serde(default)]
    pub items_restored: u64,
    #[serde(default)]
    pub items_attempted: u64,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub error_count: u64,
    #[serde(default)]
    pub warning_count: u64,
    /// `createRestore` calls that failed transiently.
    #[serde(default)]
    pub create_attempts: u32,
    /// Consecutive poll failures; drives poll backoff.
    #[serde(default)]
    pub poll_errors: u32,
    /// Earliest time the next create or poll may run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
}

/// Transition audit record. Never mutated once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: Phase,
    pub status: bool,
    pub transition_time: DateTime<Utc>,
    pub reason: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub success: bool,
    pub rto_seconds: f64,
    pub rpo_seconds: f64,
    /// False when no recency check fed `rpoSeconds`.
    pub rpo_measured: bool,
    pub message: String,
    pub resources_recovered: u64,
    pub resources_failed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CleanupResolution {
    Completed,
    /// Gave up after the configured number of attempts.
    Abandoned,
}

/// Cleanup bookkeeping; the only part of status written after the outcome.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupState {
    /// When resources become eligible for deletion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    /// Kept for debugging until the test itself is deleted.
    #[serde(default)]
    pub retained: bool,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Retry gate after a failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<CleanupResolution>,
}

impl RestoreTestStatus {
    #[must_use]
    pub fn condition(&self, phase: Phase) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.kind == phase)
    }

    #[must_use]
    pub fn has_condition(&self, phase: Phase) -> bool {
        self.condition(phase).is_some()
    }

    /// When the test entered `phase`, if it has.
    #[must_use]
    pub fn entered_at(&self, phase: Phase) -> Option<DateTime<Utc>> {
        self.condition(phase).map(|c| c.transition_time)
    }

    /// Move along one graph edge and record it.
    ///
    /// A condition already present for `to` is kept as is; only the phase
    /// moves. Any edge outside the graph is rejected.
    pub fn transition(
        &mut self,
        to: Phase,
        reason: &str,
        message: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        if !self.phase.can_transition_to(to) {
            return Err(LzrError::InvalidTransition {
                from: self.phase.to_string(),
                to: to.to_string(),
            });
        }
        self.record(to, true, reason, message.into(), at);
        Ok(())
    }

    /// Deletion jump straight to `CleaningUp` from any earlier phase.
    pub fn fast_forward_to_cleanup(
        &mut self,
        reason: &str,
        message: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        if !self.phase.can_fast_forward() {
            return Err(LzrError::InvalidTransition {
                from: self.phase.to_string(),
                to: Phase::CleaningUp.to_string(),
            });
        }
        self.record(Phase::CleaningUp, true, reason, message.into(), at);
        Ok(())
    }

    fn record(&mut self, to: Phase, status: bool, reason: &str, message: String, at: DateTime<Utc>) {
        if !self.has_condition(to) {
            self.conditions.push(Condition {
                kind: to,
                status,
                transition_time: at,
                reason: reason.to_string(),
                message,
            });
        }
        self.phase = to;
    }

    /// Append a probe result unless one with that name is already stored.
    /// Returns whether it was appended.
    pub fn push_health_result(&mut self, result: HealthCheckResult) -> bool {
        if self
            .health_check_results
            .iter()
            .any(|existing| existing.name == result.name)
        {
            return false;
        }
        self.health_check_results.push(result);
        true
    }

    /// Set the result the first time only. Returns whether it was set.
    pub fn set_result_once(&mut self, result: TestResult) -> bool {
        if self.result.is_some() {
            return false;
        }
        self.result = Some(result);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::probe::{Category, ProbeStatus};

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_767_139_200 + secs, 0).unwrap()
    }

    #[test]
    fn transitions_append_one_condition_each() {
        let mut status = RestoreTestStatus::default();
        status
            .transition(Phase::RestoreRequested, "Validated", "ok", at(0))
            .unwrap();
        status
            .transition(Phase::RestoreInProgress, "RestoreCreated", "r-1", at(5))
            .unwrap();
        assert_eq!(status.phase, Phase::RestoreInProgress);
        assert_eq!(status.conditions.len(), 2);
        assert_eq!(status.entered_at(Phase::RestoreInProgress), Some(at(5)));
    }

    #[test]
    fn illegal_edge_is_rejected_and_leaves_status_alone() {
        let mut status = RestoreTestStatus::default();
        let err = status
            .transition(Phase::Succeeded, "Skip", "", at(0))
            .expect_err("skip");
        assert!(matches!(err, LzrError::InvalidTransition { .. }));
        assert_eq!(status.phase, Phase::Pending);
        assert!(status.conditions.is_empty());
    }

    #[test]
    fn fast_forward_only_before_cleanup() {
        let mut status = RestoreTestStatus::default();
        status
            .transition(Phase::RestoreRequested, "Validated", "", at(0))
            .unwrap();
        status
            .fast_forward_to_cleanup("Deleted", "user request", at(1))
            .unwrap();
        assert_eq!(status.phase, Phase::CleaningUp);
        assert!(status.fast_forward_to_cleanup("Deleted", "", at(2)).is_err());
    }

    #[test]
    fn health_results_are_write_once_per_name() {
        let mut status = RestoreTestStatus::default();
        let result = HealthCheckResult {
            name: "record-count".to_string(),
            category: Category::Database,
            status: ProbeStatus::Failed,
            detail: "value 500".to_string(),
            duration_seconds: 0.2,
            retry_count: 2,
            observed_age_seconds: None,
            completed_at: at(0),
        };
        assert!(status.push_health_result(result.clone()));
        let mut second = result;
        second.status = ProbeStatus::Passed;
        assert!(!status.push_health_result(second));
        assert_eq!(status.health_check_results[0].status, ProbeStatus::Failed);
    }

    #[test]
    fn condition_serializes_kind_as_type() {
        let cond = Condition {
            kind: Phase::RestoreFailed,
            status: true,
            transition_time: at(0),
            reason: "RestoreTimeout".to_string(),
            message: "gave up".to_string(),
        };
        let json = serde_json::to_value(&cond).unwrap();
        assert_eq!(json["type"], "RestoreFailed");
        assert!(json.get("transitionTime").is_some());
    }
}
