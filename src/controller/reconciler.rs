//! The restore-test state machine.
//!
//! A pass re-reads the record, performs one step, and commits the resulting
//! status with a version check before looking at the record again. Conditions
//! double as the log of finished steps: when the condition for a successor
//! phase is already recorded the step is not performed a second time.
//!
//! Side effects that must not repeat (metrics, notifications) run only after
//! the commit that records them, so a conflicting writer can never cause a
//! duplicate.

#![allow(missing_docs)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::cleanup::{CleanupManager, CleanupProgress};
use crate::controller::{ReconcileAction, exponential_backoff};
use crate::core::cancel::CancelToken;
use crate::core::clock::{Clock, add_duration, elapsed_between};
use crate::core::config::Config;
use crate::core::errors::{LzrError, Result};
use crate::core::naming::{generate_test_namespace, is_dns_label, restore_id_for};
use crate::health::probe::{Category, HealthCheckResult, HealthPlan, ProbeDefaults, ProbeStatus};
use crate::health::verdict::{Verdict, verdict};
use crate::health::HealthCheckEngine;
use crate::logger::{ActivityEvent, ActivityLoggerHandle};
use crate::model::{Phase, RestoreTest, RestoreTestStatus, TestResult};
use crate::report::metrics::{cleanup_sample, outcome_samples};
use crate::report::notify::outcome_message;
use crate::report::{MetricsSink, NotificationSink, ResultAggregator, ResultInputs};
use crate::restore::{ExternalRestore, RestoreGateway, RestoreStatus, RestoreTarget};
use crate::store::TestStore;

/// Upper bound on store round trips in one pass.
const MAX_STEPS_PER_PASS: usize = 16;

// ──────────────────── settings ────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerSettings {
    pub test_namespace_prefix: String,
    /// Namespaces a test may never restore into.
    pub protected_namespaces: Vec<String>,
    pub restore_timeout: Duration,
    pub poll_interval: Duration,
    /// Poll backoff ceiling while the subsystem keeps erroring.
    pub max_poll_interval: Duration,
    pub create_attempts: u32,
    pub create_backoff_base: Duration,
    pub create_backoff_cap: Duration,
    /// Block inside one pass until the restore is terminal instead of
    /// requeueing per poll.
    pub blocking_wait: bool,
    pub probe_defaults: ProbeDefaults,
    /// Pause between restore completion and the first probe.
    pub settle_delay: Duration,
    /// Notification channel for routes that do not name one.
    pub default_channel: String,
}

impl ReconcilerSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let mut protected = config.restore.excluded_namespaces.clone();
        for ns in [&config.operator.namespace, &config.restore.subsystem_namespace] {
            if !protected.contains(ns) {
                protected.push(ns.clone());
            }
        }
        Self {
            test_namespace_prefix: config.operator.test_namespace_prefix.clone(),
            protected_namespaces: protected,
            restore_timeout: config.restore.timeout(),
            poll_interval: config.restore.poll_interval(),
            max_poll_interval: Duration::from_secs(config.restore.max_poll_interval_secs),
            create_attempts: config.restore.create_attempts.max(1),
            create_backoff_base: Duration::from_secs(config.restore.create_backoff_base_secs),
            create_backoff_cap: Duration::from_secs(config.restore.create_backoff_cap_secs),
            blocking_wait: config.restore.blocking_wait,
            probe_defaults: ProbeDefaults {
                overall_timeout: Duration::from_secs(config.health.timeout_secs),
                probe_timeout: Duration::from_secs(config.health.probe_timeout_secs),
                attempts: config.health.attempts.max(1),
                retry_delay: Duration::from_secs(config.health.retry_delay_secs),
            },
            settle_delay: Duration::from_secs(config.health.settle_delay_secs),
            default_channel: config.notifications.webhook.default_channel.clone(),
        }
    }
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

// ──────────────────── reconciler ────────────────────

/// Everything the reconciler talks to.
pub struct Collaborators {
    pub store: Arc<dyn TestStore>,
    pub gateway: RestoreGateway,
    pub health: HealthCheckEngine,
    pub cleanup: CleanupManager,
    pub metrics: Arc<dyn MetricsSink>,
    pub notifier: Arc<dyn NotificationSink>,
    pub clock: Arc<dyn Clock>,
}

pub struct Reconciler {
    store: Arc<dyn TestStore>,
    gateway: RestoreGateway,
    health: HealthCheckEngine,
    cleanup: CleanupManager,
    aggregator: ResultAggregator,
    metrics: Arc<dyn MetricsSink>,
    notifier: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    settings: ReconcilerSettings,
    activity: Option<ActivityLoggerHandle>,
}

/// How a step wants the pass to continue.
enum Next {
    /// Status changed; look at the record again.
    Continue,
    After(Duration),
    Idle,
}

impl Reconciler {
    #[must_use]
    pub fn new(parts: Collaborators, settings: ReconcilerSettings) -> Self {
        Self {
            store: parts.store,
            gateway: parts.gateway,
            health: parts.health,
            cleanup: parts.cleanup,
            aggregator: ResultAggregator,
            metrics: parts.metrics,
            notifier: parts.notifier,
            clock: parts.clock,
            settings,
            activity: None,
        }
    }

    /// Mirror transitions, probe results and cleanup attempts into the audit log.
    #[must_use]
    pub fn with_activity_log(mut self, handle: ActivityLoggerHandle) -> Self {
        self.activity = Some(handle);
        self
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn TestStore> {
        &self.store
    }

    #[must_use]
    pub const fn settings(&self) -> &ReconcilerSettings {
        &self.settings
    }

    /// Drive `name` as far as it can go right now.
    ///
    /// `cancel` interrupts the blocking waits (restore completion, probes);
    /// an interrupted pass keeps whatever the probes reported and asks to be
    /// requeued immediately. A record that no longer exists is `Done`.
    /// Version conflicts are retried within the pass; probe results from a
    /// conflicting write are carried onto the re-read record.
    pub fn reconcile(&self, name: &str, cancel: &CancelToken) -> Result<ReconcileAction> {
        let mut carried = Vec::new();
        for _ in 0..MAX_STEPS_PER_PASS {
            let test = match self.store.get(name) {
                Ok(test) => test,
                Err(LzrError::NotFound { .. }) => return Ok(ReconcileAction::Done),
                Err(e) => return Err(e),
            };
            if let Some(action) = self.step(test, cancel, &mut carried)? {
                return Ok(action);
            }
        }
        Ok(ReconcileAction::RequeueAfter(Duration::ZERO))
    }

    fn step(
        &self,
        mut test: RestoreTest,
        cancel: &CancelToken,
        carried: &mut Vec<HealthCheckResult>,
    ) -> Result<Option<ReconcileAction>> {
        let now = self.clock.now();
        let before = test.status.clone();
        if test.status.phase.rank() <= Phase::HealthCheckInProgress.rank() && test.status.result.is_none() {
            for result in carried.drain(..) {
                test.status.push_health_result(result);
            }
        }
        carried.clear();

        let next = if replay_recorded(&mut test.status) {
            Next::Continue
        } else if test.is_deleting() && test.status.phase.rank() < Phase::Succeeded.rank() {
            self.fast_forward(&mut test, now)?;
            Next::Continue
        } else {
            match test.status.phase {
                Phase::Pending => self.admit(&mut test, now)?,
                Phase::RestoreRequested => self.request_restore(&mut test, now)?,
                Phase::RestoreInProgress => self.track_restore(&mut test, now, cancel)?,
                Phase::RestoreCompleted => self.begin_health_checks(&mut test, now)?,
                Phase::RestoreFailed => self.conclude_restore_failure(&mut test, now)?,
                Phase::HealthCheckInProgress => self.run_health_checks(&mut test, now, cancel)?,
                Phase::Succeeded | Phase::Failed => self.schedule_cleanup(&mut test, now)?,
                Phase::CleaningUp => self.clean_up(&mut test, now)?,
                Phase::Expired => return self.expired(&test),
            }
        };

        if test.status != before {
            match self
                .store
                .update_status(test.name(), test.metadata.resource_version, &test.status)
            {
                Ok(version) => {
                    test.metadata.resource_version = version;
                    self.after_commit(&before, &test);
                }
                Err(err @ LzrError::Conflict { .. }) => {
                    tracing::debug!(test = %test.name(), error = %err, "status write conflicted, re-reading");
                    carried.extend(
                        test.status
                            .health_check_results
                            .into_iter()
                            .skip(before.health_check_results.len()),
                    );
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(match next {
            Next::Continue => None,
            Next::After(delay) => Some(ReconcileAction::RequeueAfter(delay)),
            Next::Idle => Some(ReconcileAction::Done),
        })
    }

    // ──────────────────── phases ────────────────────

    fn admit(&self, test: &mut RestoreTest, now: DateTime<Utc>) -> Result<Next> {
        test.status.start_time.get_or_insert(now);
        match self.admission(test, now) {
            Ok(namespace) => {
                let message = format!("restoring {} into {namespace}", test.spec.backup_name);
                test.status.restore_namespace = Some(namespace);
                test.status
                    .transition(Phase::RestoreRequested, "Validated", message, now)?;
                Ok(Next::Continue)
            }
            Err(e) => {
                self.fail_outcome(test, e.reason(), &e.to_string(), now)?;
                Ok(Next::After(Duration::ZERO))
            }
        }
    }

    /// Spec checks plus resolution of the target namespace.
    fn admission(&self, test: &RestoreTest, now: DateTime<Utc>) -> Result<String> {
        test.spec.validate()?;
        self.plan(test)?;
        let namespace = test
            .status
            .restore_namespace
            .clone()
            .or_else(|| test.spec.restore_namespace.clone())
            .unwrap_or_else(|| {
                generate_test_namespace(&self.settings.test_namespace_prefix, &test.spec.backup_name, now)
            });
        if !is_dns_label(&namespace) {
            return Err(LzrError::validation(format!(
                "restore namespace {namespace:?} is not a DNS-1123 label"
            )));
        }
        if self.settings.protected_namespaces.contains(&namespace) {
            return Err(LzrError::validation(format!(
                "restore namespace {namespace} is protected"
            )));
        }
        if test.spec.restore.mentions_namespace(&namespace) {
            return Err(LzrError::validation(format!(
                "restore namespace {namespace} is also named in the restore filters"
            )));
        }
        Ok(namespace)
    }

    fn request_restore(&self, test: &mut RestoreTest, now: DateTime<Utc>) -> Result<Next> {
        if let Some(at) = test.status.restore_state.next_attempt_at {
            if now < at {
                return Ok(Next::After(elapsed_between(now, at)));
            }
        }
        let Some(namespace) = test.status.restore_namespace.clone() else {
            self.fail_restore(test, "ValidationError", "restore namespace was never assigned", now)?;
            return Ok(Next::Continue);
        };

        let created = {
            let target = RestoreTarget {
                test_name: &test.metadata.name,
                uid: &test.metadata.uid,
                backup_name: &test.spec.backup_name,
                backup_namespace: test.spec.backup_namespace.as_deref(),
                target_namespace: &namespace,
                filters: &test.spec.restore,
            };
            self.gateway.prepare(&target).and_then(|request| {
                self.cleanup.ensure_namespace(test, &namespace)?;
                self.gateway.submit(request)
            })
        };

        match created {
            Ok(restore_id) => {
                let state = &mut test.status.restore_state;
                state.restore_id = Some(restore_id.clone());
                state.next_attempt_at = None;
                test.status.transition(
                    Phase::RestoreInProgress,
                    "RestoreCreated",
                    format!("restore {restore_id} created"),
                    now,
                )?;
                Ok(Next::Continue)
            }
            Err(e) if e.is_retryable() => {
                let state = &mut test.status.restore_state;
                state.create_attempts = state.create_attempts.saturating_add(1);
                let attempts = state.create_attempts;
                if attempts >= self.settings.create_attempts {
                    let message = format!("gave up creating the restore after {attempts} attempts: {e}");
                    self.fail_restore(test, e.reason(), &message, now)?;
                    return Ok(Next::Continue);
                }
                let delay = exponential_backoff(
                    self.settings.create_backoff_base,
                    self.settings.create_backoff_cap,
                    attempts,
                );
                state.next_attempt_at = Some(add_duration(now, delay));
                tracing::warn!(test = %test.name(), attempt = attempts, error = %e, "restore create failed, backing off");
                Ok(Next::After(delay))
            }
            Err(e) => {
                self.fail_restore(test, e.reason(), &e.to_string(), now)?;
                Ok(Next::Continue)
            }
        }
    }

    fn track_restore(&self, test: &mut RestoreTest, now: DateTime<Utc>, cancel: &CancelToken) -> Result<Next> {
        let Some(restore_id) = test.status.restore_state.restore_id.clone() else {
            self.fail_restore(test, "InternalError", "restore id missing from status", now)?;
            return Ok(Next::Continue);
        };
        let timeout = test
            .spec
            .restore
            .timeout_seconds
            .map_or(self.settings.restore_timeout, Duration::from_secs);
        let entered = test
            .status
            .entered_at(Phase::RestoreInProgress)
            .or(test.status.start_time)
            .unwrap_or(now);
        let deadline = add_duration(entered, timeout);
        let remaining = elapsed_between(now, deadline);

        if let Some(at) = test.status.restore_state.next_attempt_at {
            if now < at {
                if remaining.is_zero() {
                    self.fail_timeout(test, &restore_id, timeout, now)?;
                    return Ok(Next::Continue);
                }
                return Ok(Next::After(elapsed_between(now, at).min(remaining)));
            }
        }

        if self.settings.blocking_wait && !remaining.is_zero() {
            return match self.gateway.wait_until_terminal(&restore_id, remaining, cancel) {
                Ok(observed) => {
                    let now = self.clock.now();
                    self.absorb_poll(test, &observed, now, elapsed_between(now, deadline), timeout)
                }
                Err(LzrError::Cancelled { .. }) => Ok(Next::After(Duration::ZERO)),
                Err(LzrError::RestoreTimeout { .. }) => {
                    self.fail_timeout(test, &restore_id, timeout, self.clock.now())?;
                    Ok(Next::Continue)
                }
                Err(e) => {
                    self.fail_restore(test, e.reason(), &e.to_string(), self.clock.now())?;
                    Ok(Next::Continue)
                }
            };
        }

        match self.gateway.poll_status(&restore_id) {
            Ok(observed) => self.absorb_poll(test, &observed, now, remaining, timeout),
            Err(e) if e.is_retryable() => {
                if remaining.is_zero() {
                    self.fail_timeout(test, &restore_id, timeout, now)?;
                    return Ok(Next::Continue);
                }
                let state = &mut test.status.restore_state;
                state.poll_errors = state.poll_errors.saturating_add(1);
                let delay = exponential_backoff(
                    self.settings.poll_interval,
                    self.settings.max_poll_interval.max(self.settings.poll_interval),
                    state.poll_errors.saturating_add(1),
                )
                .min(remaining);
                state.next_attempt_at = Some(add_duration(now, delay));
                tracing::warn!(test = %test.name(), restore = %restore_id, error = %e, "restore poll failed, backing off");
                Ok(Next::After(delay))
            }
            Err(e) => {
                self.fail_restore(test, e.reason(), &e.to_string(), now)?;
                Ok(Next::Continue)
            }
        }
    }

    fn absorb_poll(
        &self,
        test: &mut RestoreTest,
        observed: &ExternalRestore,
        now: DateTime<Utc>,
        remaining: Duration,
        timeout: Duration,
    ) -> Result<Next> {
        let state = &mut test.status.restore_state;
        observed.apply_to(state);
        state.poll_errors = 0;
        state.next_attempt_at = None;

        match observed.status {
            RestoreStatus::Completed => {
                let message = format!(
                    "{} of {} items restored",
                    observed.items_restored, observed.items_attempted
                );
                test.status
                    .transition(Phase::RestoreCompleted, "RestoreCompleted", message, now)?;
                Ok(Next::Continue)
            }
            RestoreStatus::Failed | RestoreStatus::PartiallyFailed => {
                let err = LzrError::RestoreFailed {
                    restore_id: observed.name.clone(),
                    details: observed.failure_reason.clone().map_or_else(
                        || format!("restore ended in phase {}", observed.raw_phase),
                        |reason| format!("restore ended in phase {}: {reason}", observed.raw_phase),
                    ),
                };
                self.fail_restore(test, err.reason(), &err.to_string(), now)?;
                Ok(Next::Continue)
            }
            RestoreStatus::Pending | RestoreStatus::InProgress => {
                if remaining.is_zero() {
                    self.fail_timeout(test, &observed.name, timeout, now)?;
                    return Ok(Next::Continue);
                }
                Ok(Next::After(self.settings.poll_interval.min(remaining)))
            }
        }
    }

    fn begin_health_checks(&self, test: &mut RestoreTest, now: DateTime<Utc>) -> Result<Next> {
        let completed = test.status.entered_at(Phase::RestoreCompleted).unwrap_or(now);
        let ready_at = add_duration(completed, self.settings.settle_delay);
        if now < ready_at {
            return Ok(Next::After(elapsed_between(now, ready_at)));
        }
        let probes = self.plan(test).map_or(0, |plan| plan.probes.len());
        test.status.transition(
            Phase::HealthCheckInProgress,
            "ProbesStarted",
            format!("{probes} probes scheduled"),
            now,
        )?;
        Ok(Next::Continue)
    }

    fn run_health_checks(&self, test: &mut RestoreTest, now: DateTime<Utc>, cancel: &CancelToken) -> Result<Next> {
        let plan = match self.plan(test) {
            Ok(plan) => plan,
            Err(e) => {
                self.fail_outcome(test, e.reason(), &e.to_string(), now)?;
                return Ok(Next::After(Duration::ZERO));
            }
        };
        let started = test.status.entered_at(Phase::HealthCheckInProgress).unwrap_or(now);
        let remaining = plan
            .overall_timeout
            .saturating_sub(elapsed_between(started, now));
        let pending: Vec<_> = plan
            .probes
            .iter()
            .filter(|probe| {
                !test
                    .status
                    .health_check_results
                    .iter()
                    .any(|r| r.name == probe.name)
            })
            .cloned()
            .collect();

        if !pending.is_empty() {
            if remaining.is_zero() {
                for probe in &pending {
                    test.status.push_health_result(HealthCheckResult {
                        name: probe.name.clone(),
                        category: probe.category,
                        status: ProbeStatus::Timeout,
                        detail: "overall health-check timeout elapsed before the probe ran".to_string(),
                        duration_seconds: 0.0,
                        retry_count: 0,
                        observed_age_seconds: None,
                        completed_at: now,
                    });
                }
            } else {
                let report = self.health.run(&pending, remaining, cancel);
                for result in report.results {
                    test.status.push_health_result(result);
                }
                if report.cancelled {
                    tracing::info!(test = %test.name(), "health checks interrupted, keeping partial results");
                    return Ok(Next::After(Duration::ZERO));
                }
            }
        }

        let finished = self.clock.now();
        let results = &test.status.health_check_results;
        if verdict(&plan.enabled, results) == Verdict::Passed {
            let message = format!("{} health checks passed", results.len());
            test.status
                .transition(Phase::Succeeded, "AllChecksPassed", message, finished)?;
            test.status.completion_time.get_or_insert(finished);
            let result = self.compute_result(test, None, finished);
            test.status.set_result_once(result);
        } else {
            let err = health_failure(&plan.enabled, results);
            self.fail_outcome(test, err.reason(), &err.to_string(), finished)?;
        }
        Ok(Next::After(Duration::ZERO))
    }

    fn conclude_restore_failure(&self, test: &mut RestoreTest, now: DateTime<Utc>) -> Result<Next> {
        let (reason, message) = test
            .status
            .condition(Phase::RestoreFailed)
            .map_or_else(
                || ("RestoreFailed".to_string(), "restore failed".to_string()),
                |c| (c.reason.clone(), c.message.clone()),
            );
        self.fail_outcome(test, &reason, &message, now)?;
        Ok(Next::After(Duration::ZERO))
    }

    fn schedule_cleanup(&self, test: &mut RestoreTest, now: DateTime<Utc>) -> Result<Next> {
        let success = test.status.phase == Phase::Succeeded;
        let completion = *test.status.completion_time.get_or_insert(now);
        if test.status.result.is_none() {
            let failure = (!success).then(|| "outcome recorded without a result".to_string());
            let result = self.compute_result(test, failure.as_deref(), completion);
            test.status.set_result_once(result);
        }
        self.cleanup.schedule_cleanup(test, completion, success)?;
        let message = test.status.cleanup.deadline.map_or_else(
            || "resources retained until the test is deleted".to_string(),
            |deadline| format!("cleanup due at {}", deadline.to_rfc3339()),
        );
        test.status
            .transition(Phase::CleaningUp, "CleanupScheduled", message, now)?;
        Ok(Next::Continue)
    }

    fn clean_up(&self, test: &mut RestoreTest, now: DateTime<Utc>) -> Result<Next> {
        if test.status.cleanup.outcome.is_some() {
            test.status
                .transition(Phase::Expired, "CleanupCompleted", "cleanup already recorded", now)?;
            return Ok(Next::Continue);
        }
        let Some(due) = self.cleanup.due_at(test) else {
            return Ok(Next::Idle);
        };
        if now < due {
            return Ok(Next::After(elapsed_between(now, due)));
        }

        let outcome = self.cleanup.run_cleanup(test);
        match self.cleanup.record(&mut test.status.cleanup, &outcome, now) {
            CleanupProgress::Done => {
                let message = format!(
                    "deleted {}, already absent {}",
                    outcome.deleted.len(),
                    outcome.already_absent.len()
                );
                test.status
                    .transition(Phase::Expired, "CleanupCompleted", message, now)?;
                Ok(Next::Continue)
            }
            CleanupProgress::Abandoned => {
                let message = format!(
                    "gave up after {} attempts: {}",
                    test.status.cleanup.attempts,
                    outcome.errors.join("; ")
                );
                test.status
                    .transition(Phase::Expired, "CleanupAbandoned", message, now)?;
                Ok(Next::Continue)
            }
            CleanupProgress::RetryAt(at) => Ok(Next::After(elapsed_between(now, at))),
        }
    }

    fn expired(&self, test: &RestoreTest) -> Result<Option<ReconcileAction>> {
        if test.is_deleting() && self.store.remove(test.name())? {
            tracing::info!(test = %test.name(), "deleted restore test removed from store");
        }
        Ok(Some(ReconcileAction::Done))
    }

    /// Deletion before an outcome: record a failed result and jump to cleanup.
    fn fast_forward(&self, test: &mut RestoreTest, now: DateTime<Utc>) -> Result<()> {
        let phase = test.status.phase;
        if phase != Phase::Pending && test.status.restore_state.restore_id.is_none() {
            test.status.restore_state.restore_id = Some(restore_id_for(test.name(), &test.metadata.uid));
        }
        let completion = *test.status.completion_time.get_or_insert(now);
        let message = format!("test deleted during {phase}");
        if test.status.result.is_none() {
            let result = self.compute_result(test, Some(&message), completion);
            test.status.set_result_once(result);
        }
        test.status.fast_forward_to_cleanup("Deleted", message, now)
    }

    // ──────────────────── helpers ────────────────────

    fn plan(&self, test: &RestoreTest) -> Result<HealthPlan> {
        test.spec.health_checks.plan(&self.settings.probe_defaults)
    }

    fn compute_result(&self, test: &RestoreTest, failure: Option<&str>, completion: DateTime<Utc>) -> TestResult {
        let enabled = self.plan(test).map(|plan| plan.enabled).unwrap_or_default();
        self.aggregator.compute_result(&ResultInputs {
            restore_state: &test.status.restore_state,
            enabled: &enabled,
            health_results: &test.status.health_check_results,
            start_time: test.status.start_time.unwrap_or(completion),
            completion_time: completion,
            failure,
        })
    }

    fn fail_outcome(&self, test: &mut RestoreTest, reason: &str, message: &str, now: DateTime<Utc>) -> Result<()> {
        test.status.transition(Phase::Failed, reason, message, now)?;
        let completion = *test.status.completion_time.get_or_insert(now);
        let failure = test
            .status
            .health_check_results
            .is_empty()
            .then_some(message);
        let result = self.compute_result(test, failure, completion);
        test.status.set_result_once(result);
        Ok(())
    }

    fn fail_restore(&self, test: &mut RestoreTest, reason: &str, message: &str, now: DateTime<Utc>) -> Result<()> {
        let state = &mut test.status.restore_state;
        if !state.warnings.iter().any(|w| w == message) {
            state.warnings.push(message.to_string());
        }
        state.next_attempt_at = None;
        test.status.transition(Phase::RestoreFailed, reason, message, now)
    }

    fn fail_timeout(&self, test: &mut RestoreTest, restore_id: &str, timeout: Duration, now: DateTime<Utc>) -> Result<()> {
        let err = LzrError::RestoreTimeout {
            restore_id: restore_id.to_string(),
            timeout_secs: timeout.as_secs(),
        };
        self.fail_restore(test, err.reason(), &err.to_string(), now)
    }

    // ──────────────────── post-commit effects ────────────────────

    fn after_commit(&self, before: &RestoreTestStatus, test: &RestoreTest) {
        let status = &test.status;
        let name = test.name();

        if before.phase != status.phase {
            let (reason, message) = status
                .condition(status.phase)
                .map(|c| (c.reason.clone(), c.message.clone()))
                .unwrap_or_default();
            tracing::info!(test = %name, from = %before.phase, to = %status.phase, reason = %reason, "phase transition");
            self.log(ActivityEvent::PhaseTransition {
                test: name.to_string(),
                backup: test.spec.backup_name.clone(),
                from: before.phase.to_string(),
                to: status.phase.to_string(),
                reason,
                message,
            });
        }

        if before.phase == Phase::RestoreRequested && status.phase == Phase::RestoreInProgress {
            if let Some(restore_id) = &status.restore_state.restore_id {
                self.log(ActivityEvent::RestoreCreated {
                    test: name.to_string(),
                    backup: test.spec.backup_name.clone(),
                    restore_id: restore_id.clone(),
                });
            }
        }

        for result in status
            .health_check_results
            .iter()
            .skip(before.health_check_results.len())
        {
            tracing::info!(test = %name, probe = %result.name, status = %result.status, retries = result.retry_count, "probe finished");
            self.log(ActivityEvent::ProbeCompleted {
                test: name.to_string(),
                probe: result.name.clone(),
                category: result.category.to_string(),
                status: result.status.to_string(),
                duration_ms: duration_ms(result.duration_seconds),
                retries: result.retry_count,
                detail: result.detail.clone(),
            });
        }

        if status.cleanup.attempts > before.cleanup.attempts {
            let ok = status.cleanup.last_error.is_none();
            self.metrics.record(cleanup_sample(test, ok));
            if !ok {
                tracing::warn!(test = %name, attempt = status.cleanup.attempts, error = ?status.cleanup.last_error, "cleanup attempt failed");
            }
            self.log(ActivityEvent::CleanupAttempt {
                test: name.to_string(),
                ok,
                attempt: status.cleanup.attempts,
                details: status.cleanup.last_error.clone().unwrap_or_default(),
            });
        }

        if before.phase.is_outcome()
            && status.phase == Phase::CleaningUp
            && !before.has_condition(Phase::CleaningUp)
        {
            self.emit_outcome(test);
        }
    }

    /// Metrics and notification for a decided outcome. Runs once, after the
    /// commit that moves the test into cleanup.
    fn emit_outcome(&self, test: &RestoreTest) {
        let Some(result) = &test.status.result else {
            return;
        };
        for sample in outcome_samples(test, result) {
            self.metrics.record(sample);
        }
        self.log(ActivityEvent::Outcome {
            test: test.name().to_string(),
            backup: test.spec.backup_name.clone(),
            success: result.success,
            rto_seconds: result.rto_seconds,
            message: result.message.clone(),
        });

        let Some(message) = outcome_message(test, result, &self.settings.default_channel) else {
            return;
        };
        let sent = self.notifier.send(&message);
        if let Err(e) = &sent {
            tracing::warn!(test = %test.name(), channel = %message.channel, error = %e, "notification failed");
        }
        self.log(ActivityEvent::NotificationSent {
            test: test.name().to_string(),
            channel: message.channel,
            ok: sent.is_ok(),
            error: sent.err().map(|e| e.to_string()),
        });
    }

    fn log(&self, event: ActivityEvent) {
        if let Some(handle) = &self.activity {
            handle.send(event);
        }
    }
}

/// Move `phase` forward along conditions that are already recorded.
fn replay_recorded(status: &mut RestoreTestStatus) -> bool {
    let mut moved = false;
    loop {
        let current = status.phase;
        let Some(next) = status
            .conditions
            .iter()
            .map(|c| c.kind)
            .find(|kind| current.can_transition_to(*kind))
        else {
            break;
        };
        status.phase = next;
        moved = true;
    }
    moved
}

fn health_failure(enabled: &BTreeSet<Category>, results: &[HealthCheckResult]) -> LzrError {
    let failing: Vec<&HealthCheckResult> = results
        .iter()
        .filter(|r| enabled.contains(&r.category) && r.status != ProbeStatus::Passed)
        .collect();
    let details = failing
        .iter()
        .map(|r| format!("{} ({})", r.name, r.status))
        .collect::<Vec<_>>()
        .join(", ");
    if failing.iter().any(|r| r.status == ProbeStatus::Timeout) {
        LzrError::HealthCheckTimeout { details }
    } else {
        LzrError::HealthCheckFailed { details }
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn duration_ms(seconds: f64) -> u64 {
    (seconds.max(0.0) * 1000.0).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Condition;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_767_139_200 + secs, 0).unwrap()
    }

    fn condition(kind: Phase, secs: i64) -> Condition {
        Condition {
            kind,
            status: true,
            transition_time: at(secs),
            reason: "Recorded".to_string(),
            message: String::new(),
        }
    }

    #[test]
    fn replay_follows_recorded_conditions() {
        let mut status = RestoreTestStatus::default();
        status.conditions = vec![
            condition(Phase::RestoreRequested, 0),
            condition(Phase::RestoreInProgress, 1),
        ];
        assert!(replay_recorded(&mut status));
        assert_eq!(status.phase, Phase::RestoreInProgress);
        assert!(!replay_recorded(&mut status));
    }

    #[test]
    fn replay_never_moves_backwards() {
        let mut status = RestoreTestStatus::default();
        status.phase = Phase::CleaningUp;
        status.conditions = vec![condition(Phase::RestoreRequested, 0), condition(Phase::CleaningUp, 5)];
        assert!(!replay_recorded(&mut status));
        assert_eq!(status.phase, Phase::CleaningUp);
    }

    #[test]
    fn timeout_outranks_plain_failure() {
        let result = |name: &str, status| HealthCheckResult {
            name: name.to_string(),
            category: Category::Http,
            status,
            detail: String::new(),
            duration_seconds: 1.0,
            retry_count: 0,
            observed_age_seconds: None,
            completed_at: at(0),
        };
        let enabled = BTreeSet::from([Category::Http]);
        let err = health_failure(
            &enabled,
            &[result("a", ProbeStatus::Failed), result("b", ProbeStatus::Timeout)],
        );
        assert_eq!(err.reason(), "HealthCheckTimeout");
        assert!(err.to_string().contains("a (Failed)"));
    }
}
