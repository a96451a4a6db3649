//! Audit logging: JSONL append-only file fed by a background logger thread.

pub mod activity;
pub mod jsonl;

pub use activity::{ActivityEvent, ActivityLoggerConfig, ActivityLoggerHandle, spawn_logger};
pub use jsonl::{EventType, JsonlConfig, JsonlWriter, LogEntry, Severity};
