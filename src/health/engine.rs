//! Concurrent probe execution under one overall deadline.
//!
//! Probes are pulled from a shared queue by a bounded set of workers. Each
//! attempt runs on its own thread so a wedged driver call cannot outlive
//! the attempt's timeout; the worker records `Timeout` and moves on. When
//! the overall deadline passes, every probe that has not finished is
//! recorded as `Timeout`, so the report always holds one result per probe.

#![allow(missing_docs)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;
use parking_lot::Mutex;

use crate::core::cancel::CancelToken;
use crate::core::clock::Clock;
use crate::health::custom::{self, ProbeRunner};
use crate::health::probe::{HealthCheckResult, Probe, ProbeKind, ProbeStatus};
use crate::health::secrets::SecretSource;
use crate::health::{database, http};

/// Slack given to an attempt beyond its own timeout before it is abandoned.
const ATTEMPT_GRACE: Duration = Duration::from_millis(500);

/// Outcome of a single attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptOutcome {
    pub status: ProbeStatus,
    pub detail: String,
    pub observed_age_seconds: Option<f64>,
}

impl AttemptOutcome {
    pub fn passed(detail: impl Into<String>) -> Self {
        Self::with_status(ProbeStatus::Passed, detail)
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self::with_status(ProbeStatus::Failed, detail)
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::with_status(ProbeStatus::Timeout, detail)
    }

    fn with_status(status: ProbeStatus, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
            observed_age_seconds: None,
        }
    }
}

/// Runs one attempt of one probe.
pub trait ProbeExecutor: Send + Sync {
    fn execute(&self, probe: &Probe, timeout: Duration, cancel: &CancelToken) -> AttemptOutcome;
}

/// Dispatches to the database, HTTP and command probe implementations.
pub struct StandardExecutor {
    secrets: Arc<dyn SecretSource>,
    runner: Arc<dyn ProbeRunner>,
    clock: Arc<dyn Clock>,
}

impl StandardExecutor {
    pub fn new(
        secrets: Arc<dyn SecretSource>,
        runner: Arc<dyn ProbeRunner>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            secrets,
            runner,
            clock,
        }
    }
}

impl ProbeExecutor for StandardExecutor {
    fn execute(&self, probe: &Probe, timeout: Duration, cancel: &CancelToken) -> AttemptOutcome {
        match &probe.kind {
            ProbeKind::Database(db) => {
                database::run_attempt(db, self.secrets.as_ref(), timeout, || self.clock.now())
            }
            ProbeKind::Http(endpoint) => http::run_attempt(endpoint, timeout),
            ProbeKind::Custom(command) => {
                custom::run_attempt(command, self.runner.as_ref(), timeout, cancel)
            }
        }
    }
}

/// Everything one engine run produced.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HealthReport {
    /// One entry per input probe, in input order.
    pub results: Vec<HealthCheckResult>,
    /// The caller's token fired before every probe finished.
    pub cancelled: bool,
    /// The overall deadline cut at least one probe short.
    pub timed_out: bool,
}

pub struct HealthCheckEngine {
    executor: Arc<dyn ProbeExecutor>,
    clock: Arc<dyn Clock>,
    max_parallel: usize,
}

impl HealthCheckEngine {
    pub fn new(executor: Arc<dyn ProbeExecutor>, clock: Arc<dyn Clock>, max_parallel: usize) -> Self {
        Self {
            executor,
            clock,
            max_parallel: max_parallel.max(1),
        }
    }

    /// Run `probes` concurrently; returns once every probe has a result or
    /// the overall deadline (plus a short grace) has passed.
    pub fn run(&self, probes: &[Probe], overall: Duration, cancel: &CancelToken) -> HealthReport {
        if probes.is_empty() {
            return HealthReport::default();
        }
        let deadline = Instant::now() + overall;
        let scope_token = cancel.child();
        let slots: Mutex<Vec<Option<HealthCheckResult>>> = Mutex::new(vec![None; probes.len()]);
        let timed_out = Mutex::new(false);

        let (job_tx, job_rx) = crossbeam_channel::unbounded::<usize>();
        for index in 0..probes.len() {
            let _ = job_tx.send(index);
        }
        drop(job_tx);

        let workers = self.max_parallel.min(probes.len());
        thread::scope(|scope| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let slots = &slots;
                let timed_out = &timed_out;
                let scope_token = &scope_token;
                scope.spawn(move || {
                    while let Ok(index) = job_rx.recv() {
                        let probe = &probes[index];
                        let result = self.run_probe(probe, deadline, scope_token);
                        if result.status == ProbeStatus::Timeout && Instant::now() >= deadline {
                            *timed_out.lock() = true;
                        }
                        tracing::debug!(
                            probe = %probe.name,
                            category = %probe.category,
                            status = %result.status,
                            retries = result.retry_count,
                            "probe finished"
                        );
                        slots.lock()[index] = Some(result);
                    }
                });
            }
        });
        scope_token.cancel();

        let cancelled = cancel.is_cancelled();
        let now = self.clock.now();
        let results = slots
            .into_inner()
            .into_iter()
            .zip(probes)
            .map(|(slot, probe)| {
                slot.unwrap_or_else(|| HealthCheckResult {
                    name: probe.name.clone(),
                    category: probe.category,
                    status: ProbeStatus::Timeout,
                    detail: "overall health-check timeout elapsed before the probe ran".to_string(),
                    duration_seconds: 0.0,
                    retry_count: 0,
                    observed_age_seconds: None,
                    completed_at: now,
                })
            })
            .collect();
        HealthReport {
            results,
            cancelled,
            timed_out: timed_out.into_inner(),
        }
    }

    fn run_probe(&self, probe: &Probe, deadline: Instant, cancel: &CancelToken) -> HealthCheckResult {
        let started = Instant::now();
        let mut attempts_made = 0_u32;
        let mut outcome = AttemptOutcome::timeout("overall health-check timeout elapsed before the probe ran");

        while attempts_made < probe.attempts {
            if cancel.is_cancelled() {
                outcome = AttemptOutcome::timeout("cancelled before completion");
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                if attempts_made > 0 {
                    outcome.status = ProbeStatus::Timeout;
                    outcome.detail = format!(
                        "overall health-check timeout elapsed; last attempt: {}",
                        outcome.detail
                    );
                }
                break;
            }
            attempts_made += 1;
            outcome = self.attempt(probe, probe.timeout.min(remaining), cancel);
            if outcome.status == ProbeStatus::Passed || attempts_made >= probe.attempts {
                break;
            }
            let wait = probe
                .retry_delay
                .min(deadline.saturating_duration_since(Instant::now()));
            if cancel.wait_timeout(wait) {
                break;
            }
        }

        HealthCheckResult {
            name: probe.name.clone(),
            category: probe.category,
            status: outcome.status,
            detail: outcome.detail,
            duration_seconds: started.elapsed().as_secs_f64(),
            retry_count: attempts_made.saturating_sub(1),
            observed_age_seconds: outcome.observed_age_seconds,
            completed_at: self.clock.now(),
        }
    }

    fn attempt(&self, probe: &Probe, timeout: Duration, cancel: &CancelToken) -> AttemptOutcome {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let executor = Arc::clone(&self.executor);
        let owned = probe.clone();
        let attempt_token = cancel.child();
        let worker_token = attempt_token.clone();
        let spawned = thread::Builder::new()
            .name(format!("lzr-probe-{}", probe.name))
            .spawn(move || {
                let outcome = executor.execute(&owned, timeout, &worker_token);
                let _ = tx.send(outcome);
            });
        if let Err(e) = spawned {
            return AttemptOutcome::failed(format!("could not start probe thread: {e}"));
        }

        let outcome = match rx.recv_timeout(timeout + ATTEMPT_GRACE) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => AttemptOutcome::timeout(format!(
                "no result within {}s",
                timeout.as_secs_f64()
            )),
            Err(RecvTimeoutError::Disconnected) => {
                AttemptOutcome::failed("probe thread exited without a result")
            }
        };
        // Stops command probes that are still running.
        attempt_token.cancel();
        outcome
    }
}
