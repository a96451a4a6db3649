//! JSONL audit log: one self-contained JSON object per line.
//!
//! A line is built in memory and handed to `write_all` in one call so a
//! tailing reader never sees half an event.
//!
//! When the primary file cannot be written the writer steps down, in order,
//! to the fallback file, to stderr (`[LZR-JSONL]` prefix), and finally to
//! discarding. Losing audit lines must never take the daemon down.

#![allow(missing_docs)]

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::core::errors::{LzrError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    DaemonStart,
    DaemonStop,
    TestCreated,
    PhaseTransition,
    RestoreCreated,
    ProbeCompleted,
    Outcome,
    CleanupAttempt,
    Notification,
    Metric,
    Error,
}

/// One audit line. Only `ts`, `event` and `severity` are always present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// RFC 3339 UTC, millisecond precision.
    pub ts: String,
    pub event: EventType,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<String>,
    /// `From->To` for transitions, the current phase otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl LogEntry {
    /// Empty entry stamped with the current UTC time.
    #[must_use]
    pub fn new(event: EventType, severity: Severity) -> Self {
        Self {
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            event,
            severity,
            test: None,
            backup: None,
            phase: None,
            reason: None,
            restore_id: None,
            probe: None,
            status: None,
            duration_ms: None,
            ok: None,
            metric: None,
            value: None,
            error_code: None,
            error_message: None,
            details: None,
        }
    }

    #[must_use]
    pub fn for_test(mut self, test: &str) -> Self {
        self.test = Some(test.to_string());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sink {
    Primary,
    Fallback,
    Stderr,
    Discard,
}

#[derive(Debug, Clone)]
pub struct JsonlConfig {
    pub path: PathBuf,
    /// Used when `path` cannot be opened or written.
    pub fallback_path: Option<PathBuf>,
    /// Rotate once the current file would grow past this.
    pub max_size_bytes: u64,
    /// `<path>.1` is the newest rotated file, `<path>.<n>` the oldest kept.
    pub max_rotated_files: u32,
    pub fsync_interval_secs: u64,
}

impl JsonlConfig {
    /// Defaults rooted at `path`, with a fallback in the temp directory.
    #[must_use]
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            fallback_path: Some(std::env::temp_dir().join("lazarus-activity.jsonl")),
            max_size_bytes: 50 * 1024 * 1024,
            max_rotated_files: 5,
            fsync_interval_secs: 10,
        }
    }
}

pub struct JsonlWriter {
    config: JsonlConfig,
    file: Option<BufWriter<File>>,
    sink: Sink,
    bytes_written: u64,
    last_fsync: Instant,
}

impl JsonlWriter {
    /// Open the primary file, stepping down the chain if that fails.
    #[must_use]
    pub fn open(config: JsonlConfig) -> Self {
        let mut writer = Self {
            config,
            file: None,
            sink: Sink::Discard,
            bytes_written: 0,
            last_fsync: Instant::now(),
        };
        let primary = writer.config.path.clone();
        if !writer.attach(&primary, Sink::Primary) {
            writer.step_down_from(Sink::Primary);
        }
        writer
    }

    pub fn write_entry(&mut self, entry: &LogEntry) {
        match serde_json::to_string(entry) {
            Ok(mut line) => {
                line.push('\n');
                self.write_line(&line);
            }
            Err(e) => {
                let _ = writeln!(io::stderr(), "[LZR-JSONL] serialize error: {e}");
            }
        }
    }

    pub fn flush(&mut self) {
        if let Some(file) = self.file.as_mut() {
            let _ = file.flush();
        }
    }

    pub fn fsync(&mut self) {
        if let Some(file) = self.file.as_mut() {
            let _ = file.flush();
            let _ = file.get_ref().sync_data();
        }
        self.last_fsync = Instant::now();
    }

    #[must_use]
    pub const fn state(&self) -> &'static str {
        match self.sink {
            Sink::Primary => "normal",
            Sink::Fallback => "fallback",
            Sink::Stderr => "stderr",
            Sink::Discard => "discard",
        }
    }

    /// Reattach to the primary path after a step down.
    pub fn try_recover(&mut self) {
        if self.sink == Sink::Primary {
            return;
        }
        let primary = self.config.path.clone();
        if self.attach(&primary, Sink::Primary) {
            let _ = writeln!(
                io::stderr(),
                "[LZR-JSONL] recovered to primary path: {}",
                primary.display()
            );
        }
    }

    // ──────────────────── internals ────────────────────

    fn current_path(&self) -> Option<PathBuf> {
        match self.sink {
            Sink::Primary => Some(self.config.path.clone()),
            Sink::Fallback => self.config.fallback_path.clone(),
            Sink::Stderr | Sink::Discard => None,
        }
    }

    fn attach(&mut self, path: &Path, sink: Sink) -> bool {
        match open_append(path) {
            Ok((file, size)) => {
                self.file = Some(BufWriter::with_capacity(64 * 1024, file));
                self.sink = sink;
                self.bytes_written = size;
                true
            }
            Err(_) => false,
        }
    }

    fn step_down_from(&mut self, failed: Sink) {
        self.file = None;
        if failed == Sink::Primary {
            if let Some(fallback) = self.config.fallback_path.clone() {
                if self.attach(&fallback, Sink::Fallback) {
                    let _ = writeln!(
                        io::stderr(),
                        "[LZR-JSONL] primary path failed, using fallback: {}",
                        fallback.display()
                    );
                    return;
                }
            }
        }
        self.sink = match failed {
            Sink::Primary | Sink::Fallback => {
                let _ = writeln!(io::stderr(), "[LZR-JSONL] log files unwritable, using stderr");
                Sink::Stderr
            }
            Sink::Stderr | Sink::Discard => Sink::Discard,
        };
    }

    fn write_line(&mut self, line: &str) {
        let len = line.len() as u64;
        if self.file.is_some() && self.bytes_written + len > self.config.max_size_bytes {
            self.rotate();
        }
        match self.sink {
            Sink::Primary | Sink::Fallback => {
                let written = self
                    .file
                    .as_mut()
                    .is_some_and(|file| file.write_all(line.as_bytes()).is_ok());
                if written {
                    self.bytes_written += len;
                    if self.last_fsync.elapsed().as_secs() >= self.config.fsync_interval_secs {
                        self.fsync();
                    }
                } else {
                    self.step_down_from(self.sink);
                    self.write_line(line);
                }
            }
            Sink::Stderr => {
                if write!(io::stderr(), "[LZR-JSONL] {line}").is_err() {
                    self.sink = Sink::Discard;
                }
            }
            Sink::Discard => {}
        }
    }

    fn rotate(&mut self) {
        let Some(base) = self.current_path() else {
            return;
        };
        self.flush();
        self.file = None;

        let _ = fs::remove_file(rotated_name(&base, self.config.max_rotated_files));
        for index in (1..self.config.max_rotated_files).rev() {
            let _ = fs::rename(rotated_name(&base, index), rotated_name(&base, index + 1));
        }
        if self.config.max_rotated_files > 0 {
            let _ = fs::rename(&base, rotated_name(&base, 1));
        } else {
            let _ = fs::remove_file(&base);
        }

        let sink = self.sink;
        if !self.attach(&base, sink) {
            self.step_down_from(sink);
        }
    }
}

// ──────────────────── helpers ────────────────────

/// Open for append, creating parents. Returns the file and its current size.
fn open_append(path: &Path) -> Result<(File, u64)> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| LzrError::io(parent, e))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| LzrError::io(path, e))?;
    let size = file.metadata().map_or(0, |m| m.len());
    Ok((file, size))
}

/// `audit.jsonl` -> `audit.jsonl.3`.
fn rotated_name(base: &Path, index: u32) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

// ──────────────────── tests ────────────────────
