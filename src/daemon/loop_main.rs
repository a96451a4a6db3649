//! Reconcile daemon: worker pool, change feed, resync, graceful shutdown.
//!
//! Threads:
//! - **Main loop**: watches signals, drains the store change feed (or, for
//!   stores shared with other processes, polls for deletion requests), and
//!   re-queues every record on the resync interval.
//! - **Workers** (`daemon.workers`): take keys from the [`WorkQueue`] and run
//!   one reconcile pass each. The queue guarantees a key is held by at most
//!   one worker.
//! - **Logger thread**: writes the JSONL activity log.
//!
//! Deleting a test cancels its in-flight pass so blocking waits return early.

#![allow(missing_docs)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use parking_lot::Mutex;

use crate::cleanup::{CleanupManager, CleanupPolicy, KubectlCleaner};
use crate::controller::{Collaborators, ReconcileAction, Reconciler, ReconcilerSettings, exponential_backoff};
use crate::core::cancel::CancelToken;
use crate::core::clock::{Clock, SystemClock};
use crate::core::config::Config;
use crate::core::errors::{LzrError, Result};
use crate::daemon::notifications::NotificationManager;
use crate::daemon::queue::WorkQueue;
use crate::daemon::signals::SignalHandler;
use crate::health::custom::CommandProbeRunner;
use crate::health::secrets::{ChainedSecretSource, DirectorySecretSource, EnvSecretSource};
use crate::health::{HealthCheckEngine, StandardExecutor};
use crate::logger::{ActivityEvent, ActivityLoggerConfig, ActivityLoggerHandle, JsonlConfig, spawn_logger};
use crate::report::MetricsSink;
use crate::restore::{KubectlRestoreSubsystem, RestoreGateway};
use crate::store::{SqliteTestStore, StoreEvent, TestStore};

/// How long the main loop sleeps between signal checks.
const TICK: Duration = Duration::from_millis(250);
/// Workers re-check for shutdown at least this often.
const WORKER_POLL: Duration = Duration::from_millis(500);
const LOGGER_CHANNEL_CAP: usize = 1024;

// ──────────────────── wiring ────────────────────

/// Collaborators backed by the cluster CLIs and the SQLite store.
pub fn production_collaborators(config: &Config, metrics: Arc<dyn MetricsSink>) -> Result<Collaborators> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let request_timeout = Duration::from_secs(config.restore.request_timeout_secs);

    let store: Arc<dyn TestStore> = Arc::new(SqliteTestStore::open(&config.paths.store_db)?);

    let subsystem = Arc::new(KubectlRestoreSubsystem::new(
        config.restore.kubectl_path.clone(),
        request_timeout,
    ));
    let settings = ReconcilerSettings::from_config(config);
    let gateway = RestoreGateway::new(
        subsystem,
        config.restore.subsystem_namespace.clone(),
        settings.protected_namespaces.clone(),
        config.restore.poll_interval(),
    )
    .with_max_poll_interval(settings.max_poll_interval);

    let secrets = ChainedSecretSource::new(vec![
        Box::new(DirectorySecretSource::new(config.paths.secrets_dir.clone())),
        Box::new(EnvSecretSource),
    ]);
    let executor = StandardExecutor::new(Arc::new(secrets), Arc::new(CommandProbeRunner), Arc::clone(&clock));
    let health = HealthCheckEngine::new(
        Arc::new(executor),
        Arc::clone(&clock),
        config.health.max_parallel_probes,
    );

    let cleaner = Arc::new(KubectlCleaner::new(config.restore.kubectl_path.clone(), request_timeout));
    let cleanup = CleanupManager::new(
        cleaner,
        config.restore.subsystem_namespace.clone(),
        CleanupPolicy::from_config(&config.cleanup)?,
    );

    Ok(Collaborators {
        store,
        gateway,
        health,
        cleanup,
        metrics,
        notifier: Arc::new(NotificationManager::from_config(&config.notifications)),
        clock,
    })
}

// ──────────────────── cancellation registry ────────────────────

/// Cancel tokens of passes currently running, by test name.
#[derive(Debug, Default)]
pub struct CancelRegistry {
    tokens: Mutex<HashMap<String, CancelToken>>,
}

impl CancelRegistry {
    fn begin(&self, key: &str, parent: &CancelToken) -> CancelToken {
        let token = parent.child();
        self.tokens.lock().insert(key.to_string(), token.clone());
        token
    }

    fn end(&self, key: &str) {
        self.tokens.lock().remove(key);
    }

    /// Cancel the running pass for `key`, if any.
    pub fn cancel(&self, key: &str) -> bool {
        self.tokens.lock().get(key).is_some_and(|token| {
            token.cancel();
            true
        })
    }
}

// ──────────────────── daemon ────────────────────

#[derive(Debug, Clone, Default)]
pub struct DaemonArgs {
    /// Overrides `daemon.workers`.
    pub workers: Option<usize>,
}

pub struct ReconcileDaemon {
    reconciler: Arc<Reconciler>,
    queue: Arc<WorkQueue>,
    inflight: Arc<CancelRegistry>,
    root_cancel: CancelToken,
    signal_handler: SignalHandler,
    logger_handle: Option<ActivityLoggerHandle>,
    logger_join: Option<thread::JoinHandle<()>>,
    workers: usize,
    resync_interval: Duration,
    deletion_poll: Duration,
    /// Deletion requests already acted on by the poll.
    seen_deletions: HashSet<String>,
    error_backoff_base: Duration,
    error_backoff_cap: Duration,
    config_hash: String,
    start_time: Instant,
}

impl ReconcileDaemon {
    /// Build the daemon with production collaborators, the activity logger
    /// and OS signal hooks.
    pub fn init(config: &Config, args: &DaemonArgs) -> Result<Self> {
        let (logger_handle, logger_join) = spawn_logger(ActivityLoggerConfig {
            jsonl: JsonlConfig::at(config.paths.jsonl_log.clone()),
            channel_capacity: LOGGER_CHANNEL_CAP,
        })?;
        let parts = production_collaborators(config, Arc::new(logger_handle.clone()))?;
        let reconciler = Reconciler::new(parts, ReconcilerSettings::from_config(config))
            .with_activity_log(logger_handle.clone());

        let mut daemon = Self::with_reconciler(config, reconciler, SignalHandler::new());
        if let Some(workers) = args.workers {
            daemon.workers = workers.max(1);
        }
        daemon.logger_handle = Some(logger_handle);
        daemon.logger_join = Some(logger_join);
        Ok(daemon)
    }

    /// Build around an existing reconciler; no logger thread is started.
    #[must_use]
    pub fn with_reconciler(config: &Config, reconciler: Reconciler, signal_handler: SignalHandler) -> Self {
        Self {
            reconciler: Arc::new(reconciler),
            queue: Arc::new(WorkQueue::new()),
            inflight: Arc::new(CancelRegistry::default()),
            root_cancel: CancelToken::new(),
            signal_handler,
            logger_handle: None,
            logger_join: None,
            workers: config.daemon.workers.max(1),
            resync_interval: Duration::from_secs(config.daemon.resync_interval_secs.max(1)),
            deletion_poll: Duration::from_millis(config.daemon.deletion_poll_ms.max(1)),
            seen_deletions: HashSet::new(),
            error_backoff_base: Duration::from_millis(config.daemon.error_backoff_base_ms.max(1)),
            error_backoff_cap: Duration::from_secs(config.daemon.error_backoff_cap_secs.max(1)),
            config_hash: config.stable_hash().unwrap_or_default(),
            start_time: Instant::now(),
        }
    }

    #[must_use]
    pub fn signal_handler(&self) -> &SignalHandler {
        &self.signal_handler
    }

    /// Run until shutdown is requested.
    pub fn run(&mut self) -> Result<()> {
        self.log(ActivityEvent::DaemonStarted {
            version: env!("CARGO_PKG_VERSION").to_string(),
            config_hash: self.config_hash.clone(),
            workers: self.workers,
        });
        tracing::info!(workers = self.workers, resync_secs = self.resync_interval.as_secs(), "daemon started");

        let feed = self.reconciler.store().subscribe();
        if feed.is_none() {
            tracing::info!(poll_ms = self.deletion_poll.as_millis(), "store offers no change feed, polling for deletions");
        }

        let mut handles = Vec::with_capacity(self.workers);
        for index in 0..self.workers {
            match self.spawn_worker(index) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    self.queue.shutdown();
                    self.root_cancel.cancel();
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(e);
                }
            }
        }

        self.resync();
        let mut last_resync = Instant::now();
        let mut last_sweep = Instant::now();

        loop {
            if self.signal_handler.should_shutdown() {
                tracing::info!("shutdown requested");
                break;
            }
            if self.signal_handler.should_resync() || last_resync.elapsed() >= self.resync_interval {
                self.resync();
                last_resync = Instant::now();
            }
            match &feed {
                Some(feed) => self.drain_feed(feed),
                None if last_sweep.elapsed() >= self.deletion_poll => {
                    self.sweep_deletions();
                    last_sweep = Instant::now();
                }
                None => {}
            }
            thread::sleep(TICK.min(self.deletion_poll));
        }

        self.shutdown(handles);
        Ok(())
    }

    fn drain_feed(&self, feed: &Receiver<StoreEvent>) {
        while let Ok(event) = feed.try_recv() {
            match &event {
                StoreEvent::DeletionRequested(name) => {
                    if self.inflight.cancel(name) {
                        tracing::info!(test = %name, "cancelled in-flight pass for deleted test");
                    }
                    self.queue.add(name);
                }
                StoreEvent::Created(name) => self.queue.add(name),
                StoreEvent::Removed(_) => {}
            }
        }
    }

    /// Act once on each deletion request written by another process:
    /// cancel the pass holding the test, if any, and queue it.
    fn sweep_deletions(&mut self) {
        let names = match self.reconciler.store().deleting() {
            Ok(names) => names,
            Err(e) => {
                tracing::warn!(error = %e, "deletion poll failed");
                return;
            }
        };
        for name in &names {
            if !self.seen_deletions.insert(name.clone()) {
                continue;
            }
            if self.inflight.cancel(name) {
                tracing::info!(test = %name, "cancelled in-flight pass for deleted test");
            }
            self.queue.add(name);
        }
        self.seen_deletions.retain(|name| names.contains(name));
    }

    /// Queue every stored record.
    fn resync(&self) {
        match self.reconciler.store().list() {
            Ok(tests) => {
                tracing::debug!(count = tests.len(), "resync");
                for test in tests {
                    self.queue.add(test.name());
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "resync listing failed");
                self.log(ActivityEvent::Error {
                    test: None,
                    code: e.code().to_string(),
                    message: format!("resync failed: {e}"),
                });
            }
        }
    }

    fn spawn_worker(&self, index: usize) -> Result<thread::JoinHandle<()>> {
        let worker = Worker {
            reconciler: Arc::clone(&self.reconciler),
            queue: Arc::clone(&self.queue),
            inflight: Arc::clone(&self.inflight),
            root_cancel: self.root_cancel.clone(),
            logger: self.logger_handle.clone(),
            failures: HashMap::new(),
            error_backoff_base: self.error_backoff_base,
            error_backoff_cap: self.error_backoff_cap,
        };
        thread::Builder::new()
            .name(format!("lazarus-worker-{index}"))
            .spawn(move || worker.run())
            .map_err(|source| LzrError::Runtime {
                details: format!("failed to spawn reconcile worker: {source}"),
            })
    }

    fn shutdown(&mut self, handles: Vec<thread::JoinHandle<()>>) {
        let uptime_secs = self.start_time.elapsed().as_secs();

        self.queue.shutdown();
        self.root_cancel.cancel();
        for handle in handles {
            if handle.join().is_err() {
                eprintln!("[LZR-DAEMON] reconcile worker panicked");
            }
        }

        self.log(ActivityEvent::DaemonStopped {
            reason: "clean shutdown".to_string(),
            uptime_secs,
        });
        if let Some(handle) = &self.logger_handle {
            handle.shutdown();
        }
        if let Some(join) = self.logger_join.take() {
            let _ = join.join();
        }
        tracing::info!(uptime_secs, "daemon stopped");
    }

    fn log(&self, event: ActivityEvent) {
        if let Some(handle) = &self.logger_handle {
            handle.send(event);
        }
    }
}

// ──────────────────── worker ────────────────────

struct Worker {
    reconciler: Arc<Reconciler>,
    queue: Arc<WorkQueue>,
    inflight: Arc<CancelRegistry>,
    root_cancel: CancelToken,
    logger: Option<ActivityLoggerHandle>,
    /// Consecutive failed passes per test, for error backoff.
    failures: HashMap<String, u32>,
    error_backoff_base: Duration,
    error_backoff_cap: Duration,
}

impl Worker {
    fn run(mut self) {
        while !self.queue.is_shutdown() {
            let Some(key) = self.queue.get(WORKER_POLL) else {
                continue;
            };
            let cancel = self.inflight.begin(&key, &self.root_cancel);
            let outcome = self.reconciler.reconcile(&key, &cancel);
            self.inflight.end(&key);
            self.queue.done(&key);
            self.handle(&key, outcome);
        }
    }

    fn handle(&mut self, key: &str, outcome: Result<ReconcileAction>) {
        match outcome {
            Ok(ReconcileAction::Done) => {
                self.failures.remove(key);
            }
            Ok(ReconcileAction::RequeueAfter(delay)) => {
                self.failures.remove(key);
                self.queue.add_after(key, delay);
            }
            Err(e) => {
                let attempt = self.failures.entry(key.to_string()).or_insert(0);
                *attempt = attempt.saturating_add(1);
                let delay = exponential_backoff(self.error_backoff_base, self.error_backoff_cap, *attempt);
                tracing::warn!(test = %key, error = %e, retry_in_ms = delay.as_millis(), "reconcile pass failed");
                if let Some(logger) = &self.logger {
                    logger.send(ActivityEvent::Error {
                        test: Some(key.to_string()),
                        code: e.code().to_string(),
                        message: e.to_string(),
                    });
                }
                self.queue.add_after(key, delay);
            }
        }
    }
}
