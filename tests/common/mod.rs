#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;

use lazarus::cleanup::{CleanupManager, CleanupPolicy, InMemoryCleaner};
use lazarus::controller::{Collaborators, ReconcileAction, Reconciler, ReconcilerSettings};
use lazarus::core::cancel::CancelToken;
use lazarus::core::clock::{Clock, ManualClock};
use lazarus::health::{AttemptOutcome, HealthCheckEngine, Probe, ProbeDefaults, ProbeExecutor, ProbeStatus};
use lazarus::model::{RestoreTest, RestoreTestSpec};
use lazarus::report::{MemoryMetricsSink, RecordingNotifier};
use lazarus::restore::{InMemoryRestoreSubsystem, RestoreGateway};
use lazarus::store::{InMemoryTestStore, TestStore};

pub const RESTORE_NS: &str = "velero";

pub fn epoch() -> DateTime<Utc> {
    DateTime::from_timestamp(1_767_139_200, 0).expect("valid timestamp")
}

// ──────────────────── scripted probes ────────────────────

/// Answers each probe by name; unknown probes pass. A `Timeout` entry blocks
/// until the attempt timeout or cancellation.
#[derive(Default)]
pub struct ScriptedProbes {
    answers: Mutex<HashMap<String, ProbeStatus>>,
    pub executions: AtomicU32,
}

impl ScriptedProbes {
    pub fn answer(&self, probe: &str, status: ProbeStatus) {
        self.answers.lock().insert(probe.to_string(), status);
    }

    pub fn runs(&self) -> u32 {
        self.executions.load(Ordering::SeqCst)
    }
}

impl ProbeExecutor for ScriptedProbes {
    fn execute(&self, probe: &Probe, timeout: Duration, cancel: &CancelToken) -> AttemptOutcome {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let status = self
            .answers
            .lock()
            .get(&probe.name)
            .copied()
            .unwrap_or(ProbeStatus::Passed);
        match status {
            ProbeStatus::Passed => AttemptOutcome::passed("scripted pass"),
            ProbeStatus::Failed => AttemptOutcome::failed("scripted failure"),
            ProbeStatus::Timeout => {
                let _ = cancel.wait_timeout(timeout);
                AttemptOutcome::timeout("scripted hang")
            }
        }
    }
}

// ──────────────────── reconciler harness ────────────────────

pub struct Harness {
    pub store: Arc<InMemoryTestStore>,
    pub subsystem: Arc<InMemoryRestoreSubsystem>,
    pub cleaner: Arc<InMemoryCleaner>,
    pub metrics: Arc<MemoryMetricsSink>,
    pub notifier: Arc<RecordingNotifier>,
    pub clock: Arc<ManualClock>,
    pub probes: Arc<ScriptedProbes>,
    pub reconciler: Reconciler,
}

pub fn settings() -> ReconcilerSettings {
    ReconcilerSettings {
        test_namespace_prefix: "restore-test".to_string(),
        protected_namespaces: vec!["lazarus-system".to_string(), RESTORE_NS.to_string()],
        restore_timeout: Duration::from_secs(600),
        poll_interval: Duration::from_secs(5),
        max_poll_interval: Duration::from_secs(60),
        create_attempts: 3,
        create_backoff_base: Duration::from_secs(2),
        create_backoff_cap: Duration::from_secs(30),
        blocking_wait: false,
        probe_defaults: ProbeDefaults {
            overall_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(2),
            attempts: 1,
            retry_delay: Duration::ZERO,
        },
        settle_delay: Duration::ZERO,
        default_channel: "#dr-alerts".to_string(),
    }
}

pub fn policy() -> CleanupPolicy {
    CleanupPolicy {
        enabled: true,
        on_success: true,
        on_failure: false,
        default_ttl: Duration::from_secs(3600),
        max_attempts: 3,
        retry_delay: Duration::from_secs(30),
    }
}

/// In-memory collaborators around a caller-chosen store.
pub struct Fixtures {
    pub subsystem: Arc<InMemoryRestoreSubsystem>,
    pub cleaner: Arc<InMemoryCleaner>,
    pub metrics: Arc<MemoryMetricsSink>,
    pub notifier: Arc<RecordingNotifier>,
    pub clock: Arc<ManualClock>,
    pub probes: Arc<ScriptedProbes>,
}

impl Fixtures {
    pub fn new() -> Self {
        let subsystem = Arc::new(InMemoryRestoreSubsystem::new());
        subsystem.add_backup("nightly", "Completed", &["shop"]);
        Self {
            subsystem,
            cleaner: Arc::new(InMemoryCleaner::new()),
            metrics: Arc::new(MemoryMetricsSink::new()),
            notifier: Arc::new(RecordingNotifier::new()),
            clock: Arc::new(ManualClock::new(epoch())),
            probes: Arc::new(ScriptedProbes::default()),
        }
    }

    pub fn reconciler(
        &self,
        store: Arc<dyn TestStore>,
        settings: ReconcilerSettings,
        policy: CleanupPolicy,
    ) -> Reconciler {
        let gateway = RestoreGateway::new(
            self.subsystem.clone(),
            RESTORE_NS,
            Vec::new(),
            Duration::from_millis(5),
        );
        let parts = Collaborators {
            store,
            gateway,
            health: HealthCheckEngine::new(self.probes.clone(), self.clock.clone(), 4),
            cleanup: CleanupManager::new(self.cleaner.clone(), RESTORE_NS, policy),
            metrics: self.metrics.clone(),
            notifier: self.notifier.clone(),
            clock: self.clock.clone(),
        };
        Reconciler::new(parts, settings)
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with(settings(), policy())
    }

    pub fn with(settings: ReconcilerSettings, policy: CleanupPolicy) -> Self {
        let store = Arc::new(InMemoryTestStore::new());
        let fixtures = Fixtures::new();
        let reconciler = fixtures.reconciler(store.clone(), settings, policy);
        let Fixtures {
            subsystem,
            cleaner,
            metrics,
            notifier,
            clock,
            probes,
        } = fixtures;
        Self {
            store,
            subsystem,
            cleaner,
            metrics,
            notifier,
            clock,
            probes,
            reconciler,
        }
    }

    pub fn create(&self, name: &str, spec: RestoreTestSpec) -> RestoreTest {
        self.store
            .create(RestoreTest::new(name, spec, self.clock.now()))
            .expect("create test")
    }

    pub fn get(&self, name: &str) -> RestoreTest {
        self.store.get(name).expect("test exists")
    }

    pub fn pass(&self, name: &str) -> ReconcileAction {
        self.reconciler
            .reconcile(name, &CancelToken::new())
            .expect("reconcile pass")
    }

    /// Run passes, advancing the clock by every requested delay, until the
    /// reconciler is idle or `max_passes` is spent.
    pub fn drive(&self, name: &str, max_passes: usize) -> ReconcileAction {
        let mut last = ReconcileAction::RequeueAfter(Duration::ZERO);
        for _ in 0..max_passes {
            last = self.pass(name);
            match last {
                ReconcileAction::Done => return last,
                ReconcileAction::RequeueAfter(delay) => self.clock.advance(delay),
            }
        }
        last
    }
}

pub fn spec(value: Value) -> RestoreTestSpec {
    serde_json::from_value(value).expect("valid spec json")
}

// ──────────────────── CLI runner ────────────────────

pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub log_path: PathBuf,
}

impl CmdResult {
    /// The last stdout line parsed as JSON.
    pub fn json(&self) -> Value {
        let line = self
            .stdout
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or_else(|| panic!("no stdout; see {}", self.log_path.display()));
        serde_json::from_str(line)
            .unwrap_or_else(|e| panic!("stdout is not JSON ({e}); see {}", self.log_path.display()))
    }
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn resolve_bin_path() -> PathBuf {
    if let Some(path) = option_env!("CARGO_BIN_EXE_lazarus") {
        return PathBuf::from(path);
    }
    let exe_name = if cfg!(windows) { "lazarus.exe" } else { "lazarus" };
    let fallback = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .and_then(|deps| deps.parent().map(PathBuf::from))
        .map(|debug_dir| debug_dir.join(exe_name));
    match fallback {
        Some(path) if path.exists() => path,
        _ => panic!("unable to resolve lazarus binary path for integration test"),
    }
}

/// Write a config that keeps every path inside `dir`.
pub fn write_config(dir: &Path) -> PathBuf {
    let path = dir.join("lazarus.toml");
    let body = format!(
        "[operator]\nlog_level = \"warn\"\n\n[restore]\nkubectl_path = \"/nonexistent/kubectl\"\n\n[paths]\nstore_db = {:?}\njsonl_log = {:?}\nsecrets_dir = {:?}\n\n[notifications]\nenabled = false\n",
        dir.join("tests.sqlite3").display().to_string(),
        dir.join("activity.jsonl").display().to_string(),
        dir.join("secrets").display().to_string(),
    );
    fs::write(&path, body).expect("write config");
    path
}

pub fn run_cli_case(case_name: &str, args: &[&str]) -> CmdResult {
    let root = std::env::temp_dir().join("lazarus-test-logs");
    fs::create_dir_all(&root).expect("create temp test log dir");

    let log_path = root.join(format!("{}-{}.log", sanitize(case_name), now_millis()));
    let bin_path = resolve_bin_path();

    let output = Command::new(&bin_path)
        .args(args)
        .env("RUST_BACKTRACE", "1")
        .env("NO_COLOR", "1")
        .env_remove("LAZARUS_OUTPUT_FORMAT")
        .env_remove("LAZARUS_STORE_DB")
        .output()
        .expect("execute lazarus command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    let mut log_content = String::new();
    log_content.push_str(&format!("case={case_name}\n"));
    log_content.push_str(&format!("bin={}\n", bin_path.display()));
    log_content.push_str(&format!("args={args:?}\n"));
    log_content.push_str(&format!("status={}\n", output.status));
    log_content.push_str("----- stdout -----\n");
    log_content.push_str(&stdout);
    log_content.push('\n');
    log_content.push_str("----- stderr -----\n");
    log_content.push_str(&stderr);
    log_content.push('\n');
    fs::write(&log_path, log_content).expect("write test log");

    CmdResult {
        status: output.status,
        stdout,
        stderr,
        log_path,
    }
}
