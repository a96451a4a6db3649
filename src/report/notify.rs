//! Outcome notifications: message construction and the sink contract.

#![allow(missing_docs)]

use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::errors::Result;
use crate::model::{RestoreTest, TestResult};

/// Error text beyond this many characters is cut from failure messages.
pub const MAX_ERROR_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeEvent {
    Success,
    Failure,
}

impl fmt::Display for OutcomeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Success => "success",
            Self::Failure => "failure",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub event: OutcomeEvent,
    pub channel: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mention: Option<String>,
    pub test: String,
    pub backup: String,
}

/// Append-only destination for outcome notifications.
pub trait NotificationSink: Send + Sync {
    fn send(&self, message: &NotificationMessage) -> Result<()>;
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl NotificationSink for NullNotifier {
    fn send(&self, _message: &NotificationMessage) -> Result<()> {
        Ok(())
    }
}

/// Keeps every message for inspection.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<NotificationMessage>>,
}

impl RecordingNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn sent(&self) -> Vec<NotificationMessage> {
        self.sent.lock().clone()
    }
}

impl NotificationSink for RecordingNotifier {
    fn send(&self, message: &NotificationMessage) -> Result<()> {
        self.sent.lock().push(message.clone());
        Ok(())
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// Message for `result`, if the test routes that outcome anywhere.
#[must_use]
pub fn outcome_message(
    test: &RestoreTest,
    result: &TestResult,
    default_channel: &str,
) -> Option<NotificationMessage> {
    let (event, route) = if result.success {
        (OutcomeEvent::Success, test.spec.notifications.on_success.as_ref())
    } else {
        (OutcomeEvent::Failure, test.spec.notifications.on_failure.as_ref())
    };
    let route = route.filter(|r| r.enabled)?;

    let rpo = if result.rpo_measured {
        format!("{:.0}s", result.rpo_seconds)
    } else {
        "not measured".to_string()
    };
    let message = match event {
        OutcomeEvent::Success => format!(
            ":white_check_mark: Restore test {} succeeded\nBackup: {}\nRTO: {:.0}s\nRPO: {rpo}\nResources restored: {}",
            test.name(),
            test.spec.backup_name,
            result.rto_seconds,
            result.resources_recovered,
        ),
        OutcomeEvent::Failure => {
            let mut text = format!(
                ":x: Restore test {} failed\nBackup: {}\nPhase reached: {}\nError: {}",
                test.name(),
                test.spec.backup_name,
                test.status.phase,
                truncate_chars(&result.message, MAX_ERROR_CHARS),
            );
            if let Some(mention) = &route.mention {
                text.push('\n');
                text.push_str(mention);
            }
            text
        }
    };

    Some(NotificationMessage {
        event,
        channel: route
            .channel
            .clone()
            .unwrap_or_else(|| default_channel.to_string()),
        message,
        mention: route.mention.clone(),
        test: test.name().to_string(),
        backup: test.spec.backup_name.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NotifyRoute, RestoreTestSpec};
    use chrono::Utc;

    fn result(success: bool, message: &str) -> TestResult {
        TestResult {
            success,
            rto_seconds: 754.2,
            rpo_seconds: 1800.0,
            rpo_measured: true,
            message: message.to_string(),
            resources_recovered: 42,
            resources_failed: 0,
        }
    }

    fn test_with_routes(success: Option<NotifyRoute>, failure: Option<NotifyRoute>) -> RestoreTest {
        let mut spec = RestoreTestSpec::for_backup("nightly-2025-12-31");
        spec.notifications.on_success = success;
        spec.notifications.on_failure = failure;
        RestoreTest::new("nightly-test", spec, Utc::now())
    }

    #[test]
    fn unrouted_outcome_sends_nothing() {
        let test = test_with_routes(None, None);
        assert!(outcome_message(&test, &result(true, ""), "#lazarus-alerts").is_none());
    }

    #[test]
    fn success_uses_default_channel() {
        let route = NotifyRoute {
            enabled: true,
            channel: None,
            mention: None,
        };
        let test = test_with_routes(Some(route), None);
        let msg = outcome_message(&test, &result(true, ""), "#lazarus-alerts").unwrap();
        assert_eq!(msg.channel, "#lazarus-alerts");
        assert!(msg.message.contains("RTO: 754s"));
        assert!(msg.message.contains("RPO: 1800s"));
    }

    #[test]
    fn failure_truncates_error_and_mentions() {
        let route = NotifyRoute {
            enabled: true,
            channel: Some("#dr".to_string()),
            mention: Some("@oncall".to_string()),
        };
        let test = test_with_routes(None, Some(route));
        let long = "e".repeat(MAX_ERROR_CHARS + 100);
        let msg = outcome_message(&test, &result(false, &long), "#lazarus-alerts").unwrap();
        assert_eq!(msg.event, OutcomeEvent::Failure);
        assert_eq!(msg.channel, "#dr");
        assert!(msg.message.ends_with("@oncall"));
        assert!(!msg.message.contains(&"e".repeat(MAX_ERROR_CHARS + 1)));
    }
}
