//! Reconciliation controller and the creation contract used by triggers.

#![allow(missing_docs)]

pub mod reconciler;
pub mod trigger;

use std::time::Duration;

pub use reconciler::{Collaborators, Reconciler, ReconcilerSettings};
pub use trigger::{TriggerRequest, create_from_spec, create_test, request_deletion};

/// What the caller should do with the test after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Nothing left to do until the record changes.
    Done,
    /// Run another pass after the delay.
    RequeueAfter(Duration),
}

/// `base * 2^(attempt-1)`, capped. `attempt` counts from 1.
#[must_use]
pub fn exponential_backoff(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(20);
    base.saturating_mul(1_u32 << shift).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        let base = Duration::from_secs(5);
        let cap = Duration::from_secs(60);
        let delays: Vec<u64> = (1..=6)
            .map(|n| exponential_backoff(base, cap, n).as_secs())
            .collect();
        assert_eq!(delays, [5, 10, 20, 40, 60, 60]);
        assert_eq!(exponential_backoff(base, cap, 0), base);
        assert_eq!(exponential_backoff(base, cap, u32::MAX), cap);
    }
}
