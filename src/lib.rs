#![forbid(unsafe_code)]

//! lazarus: restore-test reconciliation engine.
//!
//! A restore test proves a backup is recoverable: it restores the backup into
//! an ephemeral namespace, probes the recovered workload, records RTO/RPO and
//! an outcome, then cleans the namespace up after a TTL.
//!
//! The pieces:
//! 1. **Controller** drives each test through its phase graph, one
//!    version-checked status write per step.
//! 2. **Restore gateway** creates and tracks restores in the external
//!    subsystem (Velero through `kubectl`).
//! 3. **Health check engine** runs database, HTTP and command probes with
//!    retries under one overall deadline.
//! 4. **Cleanup manager** deletes what a test created once its TTL expires.
//!
//! # Library usage
//!
//! ```rust,no_run
//! use lazarus::prelude::*;
//! ```

pub mod prelude;

pub mod cleanup;
pub mod controller;
pub mod core;
pub mod daemon;
pub mod health;
pub mod logger;
pub mod model;
pub mod report;
pub mod restore;
pub mod store;
