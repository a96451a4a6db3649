//! Restore-test phases and the transition graph between them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle phase of a restore test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Phase {
    #[default]
    Pending,
    RestoreRequested,
    RestoreInProgress,
    RestoreCompleted,
    RestoreFailed,
    HealthCheckInProgress,
    Succeeded,
    Failed,
    CleaningUp,
    Expired,
}

impl Phase {
    /// Every phase, in transition order.
    pub const ALL: [Self; 10] = [
        Self::Pending,
        Self::RestoreRequested,
        Self::RestoreInProgress,
        Self::RestoreCompleted,
        Self::RestoreFailed,
        Self::HealthCheckInProgress,
        Self::Succeeded,
        Self::Failed,
        Self::CleaningUp,
        Self::Expired,
    ];

    /// Position along the graph; sibling outcomes share a rank.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::RestoreRequested => 1,
            Self::RestoreInProgress => 2,
            Self::RestoreCompleted | Self::RestoreFailed => 3,
            Self::HealthCheckInProgress => 4,
            Self::Succeeded | Self::Failed => 5,
            Self::CleaningUp => 6,
            Self::Expired => 7,
        }
    }

    /// Whether `self -> to` is an edge of the normal transition graph.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::RestoreRequested | Self::Failed)
                | (
                    Self::RestoreRequested,
                    Self::RestoreInProgress | Self::RestoreFailed
                )
                | (
                    Self::RestoreInProgress,
                    Self::RestoreCompleted | Self::RestoreFailed
                )
                | (Self::RestoreCompleted, Self::HealthCheckInProgress)
                | (Self::RestoreFailed, Self::Failed)
                | (Self::HealthCheckInProgress, Self::Succeeded | Self::Failed)
                | (Self::Succeeded | Self::Failed, Self::CleaningUp)
                | (Self::CleaningUp, Self::Expired)
        )
    }

    /// Whether deleting the test may jump from `self` straight to cleanup.
    #[must_use]
    pub const fn can_fast_forward(self) -> bool {
        self.rank() < Self::CleaningUp.rank()
    }

    /// Outcome is decided (cleanup may still be pending).
    #[must_use]
    pub const fn is_outcome(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// No further automatic transition except cleanup.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Expired)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::RestoreRequested => "RestoreRequested",
            Self::RestoreInProgress => "RestoreInProgress",
            Self::RestoreCompleted => "RestoreCompleted",
            Self::RestoreFailed => "RestoreFailed",
            Self::HealthCheckInProgress => "HealthCheckInProgress",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::CleaningUp => "CleaningUp",
            Self::Expired => "Expired",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn happy_path_is_connected() {
        let path = [
            Phase::Pending,
            Phase::RestoreRequested,
            Phase::RestoreInProgress,
            Phase::RestoreCompleted,
            Phase::HealthCheckInProgress,
            Phase::Succeeded,
            Phase::CleaningUp,
            Phase::Expired,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn no_skipping_from_requested_to_completed() {
        assert!(!Phase::RestoreRequested.can_transition_to(Phase::RestoreCompleted));
        assert!(!Phase::RestoreCompleted.can_transition_to(Phase::Succeeded));
        assert!(!Phase::Succeeded.can_transition_to(Phase::Expired));
    }

    #[test]
    fn expired_is_a_sink() {
        for to in Phase::ALL {
            assert!(!Phase::Expired.can_transition_to(to));
        }
        assert!(!Phase::Expired.can_fast_forward());
        assert!(!Phase::CleaningUp.can_fast_forward());
        assert!(Phase::HealthCheckInProgress.can_fast_forward());
    }

    #[test]
    fn serde_uses_pascal_case_names() {
        let json = serde_json::to_string(&Phase::HealthCheckInProgress).unwrap();
        assert_eq!(json, "\"HealthCheckInProgress\"");
        let back: Phase = serde_json::from_str("\"RestoreFailed\"").unwrap();
        assert_eq!(back, Phase::RestoreFailed);
    }

    proptest! {
        #[test]
        fn every_edge_strictly_increases_rank(from in 0usize..10, to in 0usize..10) {
            let (from, to) = (Phase::ALL[from], Phase::ALL[to]);
            if from.can_transition_to(to) {
                prop_assert!(to.rank() > from.rank(), "{from} -> {to}");
            }
        }

        #[test]
        fn random_walks_are_monotone(choices in proptest::collection::vec(0usize..10, 1..40)) {
            let mut current = Phase::Pending;
            for choice in choices {
                let next = Phase::ALL[choice];
                if current.can_transition_to(next) {
                    prop_assert!(next.rank() > current.rank());
                    current = next;
                }
            }
        }
    }
}
