//! Health Check Engine: probes against the recovered environment.

pub mod custom;
pub mod database;
pub mod engine;
pub mod http;
pub mod probe;
pub mod secrets;
pub mod verdict;

pub use engine::{AttemptOutcome, HealthCheckEngine, HealthReport, ProbeExecutor, StandardExecutor};
pub use probe::{Category, HealthCheckResult, HealthCheckSpec, HealthPlan, Probe, ProbeDefaults, ProbeStatus};
pub use verdict::{CategoryOutcome, Verdict};
