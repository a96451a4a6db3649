//! Metric samples emitted when a test reaches an outcome, and the sinks
//! that receive them.

#![allow(missing_docs)]
#![allow(clippy::cast_precision_loss)]

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::clock::elapsed_between;
use crate::health::probe::ProbeStatus;
use crate::model::{Phase, RestoreTest, TestResult};

pub const RESTORE_DURATION_SECONDS: &str = "restore_duration_seconds";
pub const HEALTH_CHECK_DURATION_SECONDS: &str = "health_check_duration_seconds";
pub const TEST_SUCCESS_TOTAL: &str = "test_success_total";
pub const TEST_FAILURE_TOTAL: &str = "test_failure_total";
pub const RECOVERED_RESOURCES: &str = "recovered_resources";
pub const TEST_RTO_SECONDS: &str = "test_rto_seconds";
pub const TEST_RPO_SECONDS: &str = "test_rpo_seconds";
pub const HEALTH_CHECK_TOTAL: &str = "health_check_total";
pub const CLEANUP_TOTAL: &str = "cleanup_total";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Histogram,
    Gauge,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub name: String,
    pub kind: MetricKind,
    pub value: f64,
    pub labels: BTreeMap<String, String>,
}

impl MetricSample {
    fn new(name: &str, kind: MetricKind, value: f64, labels: &BTreeMap<String, String>) -> Self {
        Self {
            name: name.to_string(),
            kind,
            value,
            labels: labels.clone(),
        }
    }
}

/// Append-only destination for metric samples.
pub trait MetricsSink: Send + Sync {
    fn record(&self, sample: MetricSample);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMetricsSink;

impl MetricsSink for NullMetricsSink {
    fn record(&self, _sample: MetricSample) {}
}

/// Keeps samples in memory for inspection.
#[derive(Debug, Default)]
pub struct MemoryMetricsSink {
    samples: Mutex<Vec<MetricSample>>,
}

impl MemoryMetricsSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn samples(&self) -> Vec<MetricSample> {
        self.samples.lock().clone()
    }

    #[must_use]
    pub fn named(&self, name: &str) -> Vec<MetricSample> {
        self.samples
            .lock()
            .iter()
            .filter(|s| s.name == name)
            .cloned()
            .collect()
    }
}

impl MetricsSink for MemoryMetricsSink {
    fn record(&self, sample: MetricSample) {
        self.samples.lock().push(sample);
    }
}

fn base_labels(test: &RestoreTest) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("backup".to_string(), test.spec.backup_name.clone()),
        ("test".to_string(), test.name().to_string()),
    ])
}

/// Samples for one outcome transition.
#[must_use]
pub fn outcome_samples(test: &RestoreTest, result: &TestResult) -> Vec<MetricSample> {
    let labels = base_labels(test);
    let status = &test.status;
    let mut samples = Vec::new();

    let restore_started = status.entered_at(Phase::RestoreInProgress);
    let restore_ended = status
        .entered_at(Phase::RestoreCompleted)
        .or_else(|| status.entered_at(Phase::RestoreFailed));
    if let (Some(start), Some(end)) = (restore_started, restore_ended) {
        samples.push(MetricSample::new(
            RESTORE_DURATION_SECONDS,
            MetricKind::Histogram,
            elapsed_between(start, end).as_secs_f64(),
            &labels,
        ));
    }
    if let (Some(start), Some(end)) = (
        status.entered_at(Phase::HealthCheckInProgress),
        status.completion_time,
    ) {
        samples.push(MetricSample::new(
            HEALTH_CHECK_DURATION_SECONDS,
            MetricKind::Histogram,
            elapsed_between(start, end).as_secs_f64(),
            &labels,
        ));
    }

    let counter = if result.success {
        TEST_SUCCESS_TOTAL
    } else {
        TEST_FAILURE_TOTAL
    };
    samples.push(MetricSample::new(counter, MetricKind::Counter, 1.0, &labels));
    samples.push(MetricSample::new(
        RECOVERED_RESOURCES,
        MetricKind::Gauge,
        result.resources_recovered as f64,
        &labels,
    ));
    samples.push(MetricSample::new(
        TEST_RTO_SECONDS,
        MetricKind::Gauge,
        result.rto_seconds,
        &labels,
    ));
    samples.push(MetricSample::new(
        TEST_RPO_SECONDS,
        MetricKind::Gauge,
        result.rpo_seconds,
        &labels,
    ));

    for probe in &status.health_check_results {
        let mut probe_labels = labels.clone();
        probe_labels.insert("probe".to_string(), probe.name.clone());
        probe_labels.insert("category".to_string(), probe.category.to_string());
        let outcome = if probe.status == ProbeStatus::Passed { "pass" } else { "fail" };
        probe_labels.insert("result".to_string(), outcome.to_string());
        samples.push(MetricSample::new(HEALTH_CHECK_TOTAL, MetricKind::Counter, 1.0, &probe_labels));
    }
    samples
}

/// Sample for one finished cleanup.
#[must_use]
pub fn cleanup_sample(test: &RestoreTest, success: bool) -> MetricSample {
    let mut labels = base_labels(test);
    labels.insert(
        "result".to_string(),
        if success { "success" } else { "failure" }.to_string(),
    );
    MetricSample::new(CLEANUP_TOTAL, MetricKind::Counter, 1.0, &labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::probe::{Category, HealthCheckResult};
    use crate::model::RestoreTestSpec;
    use chrono::{DateTime, Utc};

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_767_139_200 + secs, 0).unwrap()
    }

    fn finished() -> RestoreTest {
        let mut test = RestoreTest::new("nightly-test", RestoreTestSpec::for_backup("nightly"), at(0));
        let s = &mut test.status;
        s.transition(Phase::RestoreRequested, "Validated", "", at(0)).unwrap();
        s.transition(Phase::RestoreInProgress, "RestoreCreated", "", at(1)).unwrap();
        s.transition(Phase::RestoreCompleted, "RestoreCompleted", "", at(61)).unwrap();
        s.transition(Phase::HealthCheckInProgress, "ProbesStarted", "", at(62)).unwrap();
        s.push_health_result(HealthCheckResult {
            name: "api".to_string(),
            category: Category::Http,
            status: ProbeStatus::Passed,
            detail: String::new(),
            duration_seconds: 0.1,
            retry_count: 0,
            observed_age_seconds: None,
            completed_at: at(70),
        });
        s.transition(Phase::Succeeded, "AllChecksPassed", "", at(72)).unwrap();
        s.completion_time = Some(at(72));
        test
    }

    fn result(success: bool) -> TestResult {
        TestResult {
            success,
            rto_seconds: 72.0,
            rpo_seconds: 0.0,
            rpo_measured: false,
            message: String::new(),
            resources_recovered: 42,
            resources_failed: 0,
        }
    }

    #[test]
    fn outcome_emits_named_samples_labeled_by_backup() {
        let samples = outcome_samples(&finished(), &result(true));
        let names: Vec<&str> = samples.iter().map(|s| s.name.as_str()).collect();
        for expected in [
            RESTORE_DURATION_SECONDS,
            HEALTH_CHECK_DURATION_SECONDS,
            TEST_SUCCESS_TOTAL,
            RECOVERED_RESOURCES,
            TEST_RTO_SECONDS,
            TEST_RPO_SECONDS,
            HEALTH_CHECK_TOTAL,
        ] {
            assert!(names.contains(&expected), "missing {expected}");
        }
        assert!(!names.contains(&TEST_FAILURE_TOTAL));
        assert!(samples.iter().all(|s| s.labels["backup"] == "nightly"));
        let restore = samples.iter().find(|s| s.name == RESTORE_DURATION_SECONDS).unwrap();
        assert!((restore.value - 60.0).abs() < f64::EPSILON);
    }

    #[test]
    fn failure_counter_on_failed_outcome() {
        let sink = MemoryMetricsSink::new();
        for sample in outcome_samples(&finished(), &result(false)) {
            sink.record(sample);
        }
        assert_eq!(sink.named(TEST_FAILURE_TOTAL).len(), 1);
        assert!(sink.named(TEST_SUCCESS_TOTAL).is_empty());
    }

    #[test]
    fn cleanup_sample_labels_result() {
        let sample = cleanup_sample(&finished(), false);
        assert_eq!(sample.name, CLEANUP_TOTAL);
        assert_eq!(sample.labels["result"], "failure");
    }
}
