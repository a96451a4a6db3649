//! Per-category outcomes and the overall health verdict.

#![allow(missing_docs)]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::health::probe::{Category, HealthCheckResult, ProbeStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CategoryOutcome {
    Passed,
    Failed,
    Timeout,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Passed,
    Failed,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Passed => "Passed",
            Self::Failed => "Failed",
        })
    }
}

/// Outcome of every category. A category is `Passed` only when each of its
/// probes passed; any timeout makes it `Timeout` unless a probe hard-failed.
#[must_use]
pub fn category_outcomes(
    enabled: &BTreeSet<Category>,
    results: &[HealthCheckResult],
) -> BTreeMap<Category, CategoryOutcome> {
    [Category::Database, Category::Http, Category::Custom]
        .into_iter()
        .map(|category| {
            if !enabled.contains(&category) {
                return (category, CategoryOutcome::Disabled);
            }
            let mut outcome = CategoryOutcome::Passed;
            for result in results.iter().filter(|r| r.category == category) {
                match result.status {
                    ProbeStatus::Passed => {}
                    ProbeStatus::Timeout if outcome == CategoryOutcome::Passed => {
                        outcome = CategoryOutcome::Timeout;
                    }
                    ProbeStatus::Timeout => {}
                    ProbeStatus::Failed => outcome = CategoryOutcome::Failed,
                }
            }
            (category, outcome)
        })
        .collect()
}

/// Logical AND across enabled categories; disabled ones are skipped.
#[must_use]
pub fn overall_verdict(outcomes: &BTreeMap<Category, CategoryOutcome>) -> Verdict {
    let failing = outcomes
        .values()
        .any(|o| matches!(o, CategoryOutcome::Failed | CategoryOutcome::Timeout));
    if failing { Verdict::Failed } else { Verdict::Passed }
}

/// Verdict for a result set, as stored on a test.
#[must_use]
pub fn verdict(enabled: &BTreeSet<Category>, results: &[HealthCheckResult]) -> Verdict {
    overall_verdict(&category_outcomes(enabled, results))
}
