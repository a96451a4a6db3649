//! Custom probes: an external command run under a deadline.

#![allow(missing_docs)]

use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::core::cancel::CancelToken;
use crate::core::errors::{LzrError, Result};
use crate::health::engine::AttemptOutcome;
use crate::health::probe::CustomProbe;

/// Captured output kept per run.
pub const MAX_LOG_BYTES: usize = 4096;
const POLL_INTERVAL: Duration = Duration::from_millis(50);
const DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Result of one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRun {
    /// `None` when the process was killed or died by signal.
    pub exit_code: Option<i32>,
    pub log: String,
    pub timed_out: bool,
}

/// Executes custom probes.
pub trait ProbeRunner: Send + Sync {
    fn run(&self, probe: &CustomProbe, timeout: Duration, cancel: &CancelToken) -> Result<ProbeRun>;
}

/// Runs the probe as a local child process.
#[derive(Debug, Clone, Default)]
pub struct CommandProbeRunner;

impl ProbeRunner for CommandProbeRunner {
    fn run(&self, probe: &CustomProbe, timeout: Duration, cancel: &CancelToken) -> Result<ProbeRun> {
        let Some((program, args)) = probe.command.split_first() else {
            return Err(LzrError::validation("custom probe has no command"));
        };
        let mut child = Command::new(program)
            .args(args)
            .envs(&probe.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| LzrError::io(program, e))?;

        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let deadline = Instant::now() + timeout;
        let mut timed_out = false;
        let status = loop {
            if let Some(status) = child.try_wait().map_err(|e| LzrError::io(program, e))? {
                break Some(status);
            }
            if cancel.is_cancelled() || Instant::now() >= deadline {
                timed_out = !cancel.is_cancelled();
                let _ = child.kill();
                let _ = child.wait();
                break None;
            }
            thread::sleep(POLL_INTERVAL);
        };

        // Grandchildren may keep the pipes open after a kill; take what has
        // arrived instead of waiting for EOF.
        let drain_deadline = Instant::now() + DRAIN_GRACE;
        let mut log = String::new();
        for captured in [stdout, stderr].into_iter().flatten() {
            while !captured.handle.is_finished() && Instant::now() < drain_deadline {
                thread::sleep(Duration::from_millis(10));
            }
            log.push_str(&String::from_utf8_lossy(&captured.buf.lock()));
        }
        Ok(ProbeRun {
            exit_code: status.and_then(|s| s.code()),
            log: truncate_log(&log),
            timed_out,
        })
    }
}

struct Captured {
    buf: Arc<Mutex<Vec<u8>>>,
    handle: thread::JoinHandle<()>,
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> Captured {
    let buf = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&buf);
    let handle = thread::spawn(move || {
        let mut chunk = [0_u8; 1024];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let mut out = sink.lock();
                    if out.len() < MAX_LOG_BYTES * 2 {
                        out.extend_from_slice(&chunk[..n]);
                    }
                }
            }
        }
    });
    Captured { buf, handle }
}

fn truncate_log(log: &str) -> String {
    let trimmed = log.trim();
    if trimmed.len() <= MAX_LOG_BYTES {
        return trimmed.to_string();
    }
    let mut cut = MAX_LOG_BYTES;
    while !trimmed.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}... [truncated]", &trimmed[..cut])
}

/// One attempt of a custom probe through `runner`.
pub fn run_attempt(
    probe: &CustomProbe,
    runner: &dyn ProbeRunner,
    timeout: Duration,
    cancel: &CancelToken,
) -> AttemptOutcome {
    match runner.run(probe, timeout, cancel) {
        Ok(run) if run.timed_out => AttemptOutcome::timeout(format!(
            "command did not finish within {}s: {}",
            timeout.as_secs_f64(),
            run.log
        )),
        Ok(run) if run.exit_code == Some(0) => AttemptOutcome::passed(run.log),
        Ok(run) => AttemptOutcome::failed(match run.exit_code {
            Some(code) => format!("exit status {code}: {}", run.log),
            None => format!("terminated by signal: {}", run.log),
        }),
        Err(e) => AttemptOutcome::failed(e.to_string()),
    }
}
