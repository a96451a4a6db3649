//! Daemon subsystem: work queue, reconcile worker pool, signal handling,
//! and outcome notification channels.

#[cfg(feature = "daemon")]
pub mod loop_main;
pub mod notifications;
pub mod queue;
#[cfg(feature = "daemon")]
pub mod signals;
