//! Multi-channel delivery of outcome notifications: journal, file, webhook.
//!
//! Every configured channel gets every message. A failing channel does not
//! stop the others; the first failure is returned so the caller can record it.

#![allow(missing_docs)]

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{LzrError, Result};
use crate::health::http::build_client;
use crate::report::notify::{NotificationMessage, NotificationSink, OutcomeEvent};

// ──────────────────── configuration ────────────────────

/// Top-level notification configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NotificationConfig {
    /// Master switch for all notifications.
    pub enabled: bool,
    /// Which channel names to activate.
    pub channels: Vec<String>,
    pub webhook: WebhookConfig,
    pub file: FileConfig,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            channels: vec!["journal".to_string(), "file".to_string()],
            webhook: WebhookConfig::default(),
            file: FileConfig::default(),
        }
    }
}

/// Slack-style incoming webhook.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub url: String,
    /// Channel used when a route does not name one.
    pub default_channel: String,
    /// Body template with `${CHANNEL}`, `${TEXT}`, `${EVENT}`, `${TEST}`,
    /// `${BACKUP}` and `${MENTION}` placeholders. Values are JSON-escaped.
    pub template: String,
    pub timeout_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            default_channel: "#lazarus-alerts".to_string(),
            template: r#"{"channel": "${CHANNEL}", "text": "${TEXT}"}"#.to_string(),
            timeout_secs: 10,
        }
    }
}

/// Append-only JSONL file of sent notifications.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FileConfig {
    pub path: PathBuf,
}

impl Default for FileConfig {
    fn default() -> Self {
        let home = std::env::var_os("HOME").map_or_else(|| PathBuf::from("/tmp"), PathBuf::from);
        Self {
            path: home
                .join(".local")
                .join("share")
                .join("lazarus")
                .join("notifications.jsonl"),
        }
    }
}

// ──────────────────── JSONL record ────────────────────

#[derive(Debug, Serialize)]
struct NotificationRecord<'a> {
    ts: String,
    #[serde(flatten)]
    message: &'a NotificationMessage,
}

// ──────────────────── channels ────────────────────

trait Channel: Send + Sync {
    fn name(&self) -> &'static str;
    fn send(&self, message: &NotificationMessage) -> Result<()>;
}

// ──── Journal (stderr, captured by systemd) ────

struct JournalChannel;

impl Channel for JournalChannel {
    fn name(&self) -> &'static str {
        "journal"
    }

    fn send(&self, message: &NotificationMessage) -> Result<()> {
        let priority = match message.event {
            OutcomeEvent::Success => "INFO",
            OutcomeEvent::Failure => "ERR",
        };
        let first_line = message.message.lines().next().unwrap_or_default();
        eprintln!(
            "[LZR-NOTIFY] [{priority}] {} {first_line}",
            message.channel
        );
        Ok(())
    }
}

// ──── File (append-only JSONL) ────

struct FileChannel {
    path: PathBuf,
}

impl Channel for FileChannel {
    fn name(&self) -> &'static str {
        "file"
    }

    fn send(&self, message: &NotificationMessage) -> Result<()> {
        let record = NotificationRecord {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            message,
        };
        let json = serde_json::to_string(&record)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| LzrError::io(parent, e))?;
        }
        let mut opts = OpenOptions::new();
        opts.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt as _;
            opts.mode(0o600);
        }
        let mut file = opts.open(&self.path).map_err(|e| LzrError::io(&self.path, e))?;
        writeln!(file, "{json}").map_err(|e| LzrError::io(&self.path, e))
    }
}

// ──── Webhook (HTTP POST) ────

struct WebhookChannel {
    url: String,
    template: String,
    timeout: Duration,
}

impl WebhookChannel {
    fn new(config: &WebhookConfig) -> Self {
        Self {
            url: config.url.clone(),
            template: config.template.clone(),
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
        }
    }

    fn render_body(&self, message: &NotificationMessage) -> String {
        // Placeholders sit inside JSON strings.
        let esc = |s: &str| {
            s.replace('\\', "\\\\")
                .replace('"', "\\\"")
                .replace('\n', "\\n")
                .replace('\r', "\\r")
                .replace('\t', "\\t")
        };
        self.template
            .replace("${CHANNEL}", &esc(&message.channel))
            .replace("${TEXT}", &esc(&message.message))
            .replace("${EVENT}", &esc(&message.event.to_string()))
            .replace("${TEST}", &esc(&message.test))
            .replace("${BACKUP}", &esc(&message.backup))
            .replace("${MENTION}", &esc(message.mention.as_deref().unwrap_or_default()))
    }
}

impl Channel for WebhookChannel {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn send(&self, message: &NotificationMessage) -> Result<()> {
        if self.url.is_empty() {
            return Ok(());
        }
        let client = build_client(self.timeout)?;
        let response = client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .body(self.render_body(message))
            .send()
            .map_err(|e| LzrError::transient("webhook", format!("POST failed: {e}")))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(LzrError::transient(
                "webhook",
                format!("endpoint answered {}", status.as_u16()),
            ))
        }
    }
}

// ──────────────────── notification manager ────────────────────

/// Dispatches each message to all enabled channels.
pub struct NotificationManager {
    channels: Vec<Box<dyn Channel>>,
    enabled: bool,
}

impl NotificationManager {
    #[must_use]
    pub fn from_config(config: &NotificationConfig) -> Self {
        if !config.enabled {
            return Self::disabled();
        }

        let mut channels: Vec<Box<dyn Channel>> = Vec::new();
        for channel_name in &config.channels {
            match channel_name.as_str() {
                "journal" => channels.push(Box::new(JournalChannel)),
                "file" => channels.push(Box::new(FileChannel {
                    path: config.file.path.clone(),
                })),
                "webhook" if config.webhook.enabled => {
                    channels.push(Box::new(WebhookChannel::new(&config.webhook)));
                }
                other => {
                    tracing::debug!(channel = %other, "notification channel unknown or disabled");
                }
            }
        }

        Self {
            channels,
            enabled: true,
        }
    }

    #[must_use]
    pub fn disabled() -> Self {
        Self {
            channels: Vec::new(),
            enabled: false,
        }
    }

    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub fn channel_names(&self) -> Vec<&str> {
        self.channels.iter().map(|c| c.name()).collect()
    }
}

impl NotificationSink for NotificationManager {
    fn send(&self, message: &NotificationMessage) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let mut first_error = None;
        for channel in &self.channels {
            if let Err(e) = channel.send(message) {
                tracing::warn!(channel = channel.name(), test = %message.test, error = %e, "notification channel failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

// ──────────────────── tests ────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::thread;

    fn message(event: OutcomeEvent) -> NotificationMessage {
        NotificationMessage {
            event,
            channel: "#dr".to_string(),
            message: ":x: Restore test nightly failed\nError: \"boom\"".to_string(),
            mention: Some("@oncall".to_string()),
            test: "nightly".to_string(),
            backup: "daily-2026".to_string(),
        }
    }

    fn file_only(path: PathBuf) -> NotificationConfig {
        NotificationConfig {
            channels: vec!["file".to_string()],
            file: FileConfig { path },
            ..NotificationConfig::default()
        }
    }

    #[test]
    fn default_config_has_journal_and_file() {
        let config = NotificationConfig::default();
        assert!(config.enabled);
        assert_eq!(config.channels, ["journal", "file"]);
        assert!(!config.webhook.enabled);
        assert_eq!(config.webhook.default_channel, "#lazarus-alerts");
    }

    #[test]
    fn disabled_config_builds_noop_manager() {
        let config = NotificationConfig {
            enabled: false,
            ..NotificationConfig::default()
        };
        let manager = NotificationManager::from_config(&config);
        assert!(!manager.is_enabled());
        assert_eq!(manager.channel_count(), 0);
        assert!(manager.send(&message(OutcomeEvent::Success)).is_ok());
    }

    #[test]
    fn webhook_skipped_unless_enabled() {
        let mut config = NotificationConfig {
            channels: vec!["journal".to_string(), "webhook".to_string(), "pager".to_string()],
            ..NotificationConfig::default()
        };
        assert_eq!(NotificationManager::from_config(&config).channel_names(), ["journal"]);
        config.webhook.enabled = true;
        config.webhook.url = "http://127.0.0.1:9/hook".to_string();
        assert_eq!(
            NotificationManager::from_config(&config).channel_names(),
            ["journal", "webhook"]
        );
    }

    #[test]
    fn render_escapes_json_specials() {
        let channel = WebhookChannel::new(&WebhookConfig {
            template: r#"{"channel": "${CHANNEL}", "text": "${TEXT}", "who": "${MENTION}", "e": "${EVENT}"}"#
                .to_string(),
            ..WebhookConfig::default()
        });
        let body = channel.render_body(&message(OutcomeEvent::Failure));
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["channel"], "#dr");
        assert_eq!(parsed["who"], "@oncall");
        assert_eq!(parsed["e"], "failure");
        assert!(parsed["text"].as_str().unwrap().contains("\"boom\""));
    }

    #[test]
    fn file_channel_appends_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("notify.jsonl");
        let manager = NotificationManager::from_config(&file_only(path.clone()));
        manager.send(&message(OutcomeEvent::Failure)).unwrap();
        manager.send(&message(OutcomeEvent::Success)).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "failure");
        assert_eq!(lines[1]["event"], "success");
        assert_eq!(lines[0]["test"], "nightly");
        assert!(lines[0]["ts"].is_string());
    }

    #[test]
    fn file_channel_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"x").unwrap();
        let manager = NotificationManager::from_config(&file_only(blocker.join("notify.jsonl")));
        assert!(manager.send(&message(OutcomeEvent::Failure)).is_err());
    }

    #[test]
    fn webhook_posts_rendered_body() {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let port = server.server_addr().to_ip().unwrap().port();
        let handle = thread::spawn(move || {
            let mut request = server.recv().unwrap();
            let mut body = String::new();
            request.as_reader().read_to_string(&mut body).unwrap();
            request.respond(tiny_http::Response::empty(200)).unwrap();
            body
        });

        let config = NotificationConfig {
            channels: vec!["webhook".to_string()],
            webhook: WebhookConfig {
                enabled: true,
                url: format!("http://127.0.0.1:{port}/hook"),
                ..WebhookConfig::default()
            },
            ..NotificationConfig::default()
        };
        NotificationManager::from_config(&config)
            .send(&message(OutcomeEvent::Failure))
            .unwrap();

        let body: serde_json::Value = serde_json::from_str(&handle.join().unwrap()).unwrap();
        assert_eq!(body["channel"], "#dr");
        assert!(body["text"].as_str().unwrap().starts_with(":x: Restore test nightly failed"));
    }

    #[test]
    fn webhook_error_status_is_an_error() {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let port = server.server_addr().to_ip().unwrap().port();
        let handle = thread::spawn(move || {
            let request = server.recv().unwrap();
            request.respond(tiny_http::Response::empty(500)).unwrap();
        });
        let channel = WebhookChannel::new(&WebhookConfig {
            enabled: true,
            url: format!("http://127.0.0.1:{port}/hook"),
            ..WebhookConfig::default()
        });
        let err = channel.send(&message(OutcomeEvent::Success)).unwrap_err();
        assert!(err.is_retryable());
        handle.join().unwrap();
    }

    #[test]
    fn config_roundtrips_through_toml() {
        let config = NotificationConfig::default();
        let text = toml::to_string(&config).unwrap();
        let back: NotificationConfig = toml::from_str(&text).unwrap();
        assert_eq!(config, back);
    }
}
