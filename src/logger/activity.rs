//! Background audit logger.
//!
//! A dedicated thread owns the `JsonlWriter`. Everything else holds a
//! cloneable `ActivityLoggerHandle` and sends `ActivityEvent`s through a
//! bounded crossbeam channel with `try_send`, so reconcile workers are never
//! blocked by logging back-pressure. Dropped events are counted and reported
//! in the log itself.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};

use crate::core::errors::{LzrError, Result};
use crate::logger::jsonl::{EventType, JsonlConfig, JsonlWriter, LogEntry, Severity};
use crate::report::metrics::{MetricSample, MetricsSink};

const CHANNEL_CAPACITY: usize = 1024;
const RECOVERY_INTERVAL: Duration = Duration::from_secs(60);

// ──────────────────── events ────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum ActivityEvent {
    DaemonStarted {
        version: String,
        config_hash: String,
        workers: usize,
    },
    DaemonStopped {
        reason: String,
        uptime_secs: u64,
    },
    TestCreated {
        test: String,
        backup: String,
    },
    PhaseTransition {
        test: String,
        backup: String,
        from: String,
        to: String,
        reason: String,
        message: String,
    },
    RestoreCreated {
        test: String,
        backup: String,
        restore_id: String,
    },
    ProbeCompleted {
        test: String,
        probe: String,
        category: String,
        status: String,
        duration_ms: u64,
        retries: u32,
        detail: String,
    },
    Outcome {
        test: String,
        backup: String,
        success: bool,
        rto_seconds: f64,
        message: String,
    },
    CleanupAttempt {
        test: String,
        ok: bool,
        attempt: u32,
        details: String,
    },
    NotificationSent {
        test: String,
        channel: String,
        ok: bool,
        error: Option<String>,
    },
    Metric(MetricSample),
    Error {
        test: Option<String>,
        code: String,
        message: String,
    },
    /// Asks the logger thread to flush and exit.
    Shutdown,
}

// ──────────────────── handle ────────────────────

/// Cheap to clone; `send` never blocks.
#[derive(Debug, Clone)]
pub struct ActivityLoggerHandle {
    tx: Sender<ActivityEvent>,
    dropped_events: Arc<AtomicU64>,
}

impl ActivityLoggerHandle {
    /// A handle plus the raw receiving end, for callers that consume events
    /// themselves.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, Receiver<ActivityEvent>) {
        let (tx, rx) = bounded(capacity);
        (
            Self {
                tx,
                dropped_events: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Queue an event. A full channel drops it and bumps the counter; a
    /// disconnected one (during shutdown) drops it silently.
    pub fn send(&self, event: ActivityEvent) {
        if let Err(TrySendError::Full(_)) = self.tx.try_send(event) {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Ask the logger thread to stop; join its handle to wait for the flush.
    pub fn shutdown(&self) {
        let _ = self.tx.send(ActivityEvent::Shutdown);
    }
}

impl MetricsSink for ActivityLoggerHandle {
    fn record(&self, sample: MetricSample) {
        self.send(ActivityEvent::Metric(sample));
    }
}

// ──────────────────── spawn ────────────────────

pub struct ActivityLoggerConfig {
    pub jsonl: JsonlConfig,
    pub channel_capacity: usize,
}

impl ActivityLoggerConfig {
    #[must_use]
    pub const fn new(jsonl: JsonlConfig) -> Self {
        Self {
            jsonl,
            channel_capacity: CHANNEL_CAPACITY,
        }
    }
}

/// Start the logger thread. It runs until `shutdown()` or until every
/// handle is dropped.
pub fn spawn_logger(config: ActivityLoggerConfig) -> Result<(ActivityLoggerHandle, thread::JoinHandle<()>)> {
    let (handle, rx) = ActivityLoggerHandle::channel(config.channel_capacity.max(1));
    let dropped = Arc::clone(&handle.dropped_events);
    let jsonl = config.jsonl;
    let join = thread::Builder::new()
        .name("lazarus-logger".to_string())
        .spawn(move || logger_thread_main(&rx, jsonl, &dropped))
        .map_err(|e| LzrError::Runtime {
            details: format!("failed to spawn logger thread: {e}"),
        })?;
    Ok((handle, join))
}

fn logger_thread_main(rx: &Receiver<ActivityEvent>, config: JsonlConfig, dropped: &AtomicU64) {
    let mut jsonl = JsonlWriter::open(config);
    let mut last_recovery = Instant::now();

    loop {
        let event = match rx.recv_timeout(RECOVERY_INTERVAL) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => {
                jsonl.flush();
                jsonl.try_recover();
                last_recovery = Instant::now();
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let lost = dropped.swap(0, Ordering::Relaxed);
        if lost > 0 {
            let mut warn = LogEntry::new(EventType::Error, Severity::Warning);
            warn.details = Some(format!("{lost} activity events dropped due to back-pressure"));
            jsonl.write_entry(&warn);
        }

        if matches!(event, ActivityEvent::Shutdown) {
            break;
        }
        jsonl.write_entry(&to_log_entry(&event));

        if last_recovery.elapsed() >= RECOVERY_INTERVAL {
            jsonl.try_recover();
            last_recovery = Instant::now();
        }
    }

    jsonl.flush();
    jsonl.fsync();
}

// ──────────────────── conversion ────────────────────

#[allow(clippy::too_many_lines)]
fn to_log_entry(event: &ActivityEvent) -> LogEntry {
    match event {
        ActivityEvent::DaemonStarted {
            version,
            config_hash,
            workers,
        } => {
            let mut e = LogEntry::new(EventType::DaemonStart, Severity::Info);
            e.details = Some(format!("version={version} config_hash={config_hash} workers={workers}"));
            e.ok = Some(true);
            e
        }
        ActivityEvent::DaemonStopped { reason, uptime_secs } => {
            let mut e = LogEntry::new(EventType::DaemonStop, Severity::Info);
            e.details = Some(format!("reason={reason} uptime={uptime_secs}s"));
            e.ok = Some(true);
            e
        }
        ActivityEvent::TestCreated { test, backup } => {
            let mut e = LogEntry::new(EventType::TestCreated, Severity::Info).for_test(test);
            e.backup = Some(backup.clone());
            e
        }
        ActivityEvent::PhaseTransition {
            test,
            backup,
            from,
            to,
            reason,
            message,
        } => {
            let severity = if to == "Failed" || to == "RestoreFailed" {
                Severity::Warning
            } else {
                Severity::Info
            };
            let mut e = LogEntry::new(EventType::PhaseTransition, severity).for_test(test);
            e.backup = Some(backup.clone());
            e.phase = Some(format!("{from}->{to}"));
            e.reason = Some(reason.clone());
            if !message.is_empty() {
                e.details = Some(message.clone());
            }
            e
        }
        ActivityEvent::RestoreCreated {
            test,
            backup,
            restore_id,
        } => {
            let mut e = LogEntry::new(EventType::RestoreCreated, Severity::Info).for_test(test);
            e.backup = Some(backup.clone());
            e.restore_id = Some(restore_id.clone());
            e.ok = Some(true);
            e
        }
        ActivityEvent::ProbeCompleted {
            test,
            probe,
            category,
            status,
            duration_ms,
            retries,
            detail,
        } => {
            let passed = status == "Passed";
            let severity = if passed { Severity::Info } else { Severity::Warning };
            let mut e = LogEntry::new(EventType::ProbeCompleted, severity).for_test(test);
            e.probe = Some(format!("{category}/{probe}"));
            e.status = Some(status.clone());
            e.duration_ms = Some(*duration_ms);
            e.ok = Some(passed);
            e.details = Some(format!("retries={retries} {detail}"));
            e
        }
        ActivityEvent::Outcome {
            test,
            backup,
            success,
            rto_seconds,
            message,
        } => {
            let severity = if *success { Severity::Info } else { Severity::Critical };
            let mut e = LogEntry::new(EventType::Outcome, severity).for_test(test);
            e.backup = Some(backup.clone());
            e.ok = Some(*success);
            e.value = Some(*rto_seconds);
            e.details = Some(message.clone());
            e
        }
        ActivityEvent::CleanupAttempt {
            test,
            ok,
            attempt,
            details,
        } => {
            let severity = if *ok { Severity::Info } else { Severity::Warning };
            let mut e = LogEntry::new(EventType::CleanupAttempt, severity).for_test(test);
            e.ok = Some(*ok);
            e.details = Some(format!("attempt={attempt} {details}"));
            e
        }
        ActivityEvent::NotificationSent {
            test,
            channel,
            ok,
            error,
        } => {
            let severity = if *ok { Severity::Info } else { Severity::Warning };
            let mut e = LogEntry::new(EventType::Notification, severity).for_test(test);
            e.ok = Some(*ok);
            e.details = Some(format!("channel={channel}"));
            e.error_message.clone_from(error);
            e
        }
        ActivityEvent::Metric(sample) => {
            let mut e = LogEntry::new(EventType::Metric, Severity::Info);
            e.test = sample.labels.get("test").cloned();
            e.backup = sample.labels.get("backup").cloned();
            e.metric = Some(sample.name.clone());
            e.value = Some(sample.value);
            let extra: Vec<String> = sample
                .labels
                .iter()
                .filter(|(k, _)| k.as_str() != "test" && k.as_str() != "backup")
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            if !extra.is_empty() {
                e.details = Some(extra.join(" "));
            }
            e
        }
        ActivityEvent::Error { test, code, message } => {
            let mut e = LogEntry::new(EventType::Error, Severity::Warning);
            e.test.clone_from(test);
            e.error_code = Some(code.clone());
            e.error_message = Some(message.clone());
            e
        }
        ActivityEvent::Shutdown => LogEntry::new(EventType::DaemonStop, Severity::Info),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::report::metrics::MetricKind;

    fn config(dir: &std::path::Path, capacity: usize) -> ActivityLoggerConfig {
        ActivityLoggerConfig {
            jsonl: JsonlConfig {
                path: dir.join("activity.jsonl"),
                fallback_path: None,
                max_size_bytes: 10 * 1024 * 1024,
                max_rotated_files: 3,
                fsync_interval_secs: 60,
            },
            channel_capacity: capacity,
        }
    }

    fn read_lines(dir: &std::path::Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(dir.join("activity.jsonl"))
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn spawn_log_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, join) = spawn_logger(config(dir.path(), 64)).unwrap();
        handle.send(ActivityEvent::DaemonStarted {
            version: "0.3.0".to_string(),
            config_hash: "abc".to_string(),
            workers: 4,
        });
        handle.send(ActivityEvent::PhaseTransition {
            test: "nightly".to_string(),
            backup: "nightly-2025-12-31".to_string(),
            from: "RestoreInProgress".to_string(),
            to: "RestoreFailed".to_string(),
            reason: "RestoreTimeout".to_string(),
            message: "no terminal status within 3600s".to_string(),
        });
        handle.shutdown();
        join.join().unwrap();

        let lines = read_lines(dir.path());
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "daemon_start");
        assert_eq!(lines[1]["phase"], "RestoreInProgress->RestoreFailed");
        assert_eq!(lines[1]["severity"], "warning");
    }

    #[test]
    fn metrics_sink_writes_metric_lines() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, join) = spawn_logger(config(dir.path(), 64)).unwrap();
        let sink: &dyn MetricsSink = &handle;
        sink.record(MetricSample {
            name: "test_rto_seconds".to_string(),
            kind: MetricKind::Gauge,
            value: 754.0,
            labels: BTreeMap::from([
                ("backup".to_string(), "nightly".to_string()),
                ("test".to_string(), "t".to_string()),
            ]),
        });
        handle.shutdown();
        join.join().unwrap();

        let lines = read_lines(dir.path());
        assert_eq!(lines[0]["metric"], "test_rto_seconds");
        assert_eq!(lines[0]["backup"], "nightly");
    }

    #[test]
    fn full_channel_counts_drops() {
        let (handle, _rx) = ActivityLoggerHandle::channel(1);
        for _ in 0..3 {
            handle.send(ActivityEvent::TestCreated {
                test: "t".to_string(),
                backup: "b".to_string(),
            });
        }
        assert_eq!(handle.dropped_events(), 2);
    }

    #[test]
    fn clones_share_one_thread() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, join) = spawn_logger(config(dir.path(), 64)).unwrap();
        let other = handle.clone();
        std::thread::spawn(move || {
            other.send(ActivityEvent::Error {
                test: None,
                code: "LZR-2002".to_string(),
                message: "api hiccup".to_string(),
            });
        })
        .join()
        .unwrap();
        handle.shutdown();
        join.join().unwrap();
        assert!(std::fs::read_to_string(dir.path().join("activity.jsonl"))
            .unwrap()
            .contains("LZR-2002"));
    }
}
