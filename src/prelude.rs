//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use lazarus::prelude::*;
//! ```

// Core
pub use crate::core::cancel::CancelToken;
pub use crate::core::clock::{Clock, ManualClock, SystemClock};
pub use crate::core::config::Config;
pub use crate::core::errors::{LzrError, Result};

// Model
pub use crate::model::{Phase, RestoreTest, RestoreTestSpec, RestoreTestStatus, TestResult};

// Controller
pub use crate::controller::{
    Collaborators, ReconcileAction, Reconciler, ReconcilerSettings, TriggerRequest, create_test,
    request_deletion,
};

// Collaborators
pub use crate::cleanup::{CleanupManager, CleanupPolicy, ResourceCleaner};
pub use crate::health::{HealthCheckEngine, ProbeExecutor, StandardExecutor};
pub use crate::report::{MetricsSink, NotificationSink};
pub use crate::restore::{RestoreGateway, RestoreSubsystem};
pub use crate::store::{InMemoryTestStore, TestStore};
