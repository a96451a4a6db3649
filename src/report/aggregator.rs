//! RTO/RPO and overall success for a finished test.

#![allow(missing_docs)]
#![allow(clippy::cast_precision_loss)]

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::core::clock::elapsed_between;
use crate::health::probe::{Category, HealthCheckResult, ProbeStatus};
use crate::health::verdict::{Verdict, verdict};
use crate::model::{RestoreState, TestResult};
use crate::restore::RestoreStatus;

/// Everything the aggregator reads.
#[derive(Debug, Clone, Copy)]
pub struct ResultInputs<'a> {
    pub restore_state: &'a RestoreState,
    pub enabled: &'a BTreeSet<Category>,
    pub health_results: &'a [HealthCheckResult],
    pub start_time: DateTime<Utc>,
    pub completion_time: DateTime<Utc>,
    /// Set when the test failed before health checks ran.
    pub failure: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResultAggregator;

impl ResultAggregator {
    /// RTO is wall-clock from start to completion. RPO is the largest data
    /// age seen by a recency probe, or zero with `rpo_measured = false`.
    #[must_use]
    pub fn compute_result(&self, inputs: &ResultInputs<'_>) -> TestResult {
        let rto = elapsed_between(inputs.start_time, inputs.completion_time).as_secs_f64();
        let rpo = inputs
            .health_results
            .iter()
            .filter_map(|r| r.observed_age_seconds)
            .fold(None, |acc: Option<f64>, age| Some(acc.map_or(age, |m| m.max(age))));

        let restore_completed = inputs
            .restore_state
            .external_phase
            .as_deref()
            .map(RestoreStatus::from_external)
            == Some(RestoreStatus::Completed);
        let health = verdict(inputs.enabled, inputs.health_results);
        let success = inputs.failure.is_none() && restore_completed && health == Verdict::Passed;

        let message = if success {
            format!(
                "restore verified: {} of {} items restored, {} health checks passed",
                inputs.restore_state.items_restored,
                inputs.restore_state.items_attempted,
                inputs.health_results.len()
            )
        } else if let Some(reason) = inputs.failure {
            reason.to_string()
        } else if !restore_completed {
            format!(
                "restore ended in phase {}",
                inputs.restore_state.external_phase.as_deref().unwrap_or("unknown")
            )
        } else {
            let failing: Vec<String> = inputs
                .health_results
                .iter()
                .filter(|r| r.status != ProbeStatus::Passed && inputs.enabled.contains(&r.category))
                .map(|r| format!("{} ({}): {}", r.name, r.status, r.detail))
                .collect();
            format!("health checks failed: {}", failing.join("; "))
        };

        TestResult {
            success,
            rto_seconds: rto,
            rpo_seconds: rpo.unwrap_or(0.0),
            rpo_measured: rpo.is_some(),
            message,
            resources_recovered: inputs.restore_state.items_restored,
            resources_failed: inputs.restore_state.error_count,
        }
    }
}
