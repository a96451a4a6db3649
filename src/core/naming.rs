//! Kubernetes-safe naming helpers, TTL parsing, and deterministic identifiers.

use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::core::errors::{LzrError, Result};

/// Maximum length of a DNS-1123 label.
pub const MAX_NAME_LEN: usize = 63;

/// Lowercase `name`, replace anything outside `[a-z0-9-]` with `-`, strip
/// surrounding hyphens, and truncate to `max_len` without a trailing hyphen.
#[must_use]
pub fn sanitize_resource_name(name: &str, max_len: usize) -> String {
    let lowered: String = name
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = lowered.trim_matches('-');
    let truncated: String = trimmed.chars().take(max_len).collect();
    truncated.trim_end_matches('-').to_string()
}

/// Whether `name` is already a valid DNS-1123 label.
#[must_use]
pub fn is_dns_label(name: &str) -> bool {
    !name.is_empty() && name.len() <= MAX_NAME_LEN && sanitize_resource_name(name, MAX_NAME_LEN) == name
}

/// First 8 hex characters of the SHA-256 of `input`.
#[must_use]
pub fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest.iter().take(4).map(|b| format!("{b:02x}")).collect()
}

/// Ephemeral namespace for a restore test: `<prefix>-<backup>-<YYYYmmddHHMMSS>`.
///
/// Falls back to `<prefix>-<hash>-<timestamp>` when the readable form exceeds
/// the label limit.
#[must_use]
pub fn generate_test_namespace(prefix: &str, backup_name: &str, at: DateTime<Utc>) -> String {
    let stamp = at.format("%Y%m%d%H%M%S").to_string();
    let safe_backup = sanitize_resource_name(backup_name, 30);
    let candidate = if safe_backup.is_empty() {
        format!("{prefix}-{stamp}")
    } else {
        format!("{prefix}-{safe_backup}-{stamp}")
    };
    if candidate.len() <= MAX_NAME_LEN {
        return candidate;
    }
    let hashed = format!("{prefix}-{}-{stamp}", short_hash(backup_name));
    sanitize_resource_name(&hashed, MAX_NAME_LEN)
}

/// Deterministic restore object name derived from the test identity.
///
/// Re-deriving it on every pass is what makes restore creation idempotent.
#[must_use]
pub fn restore_id_for(test_name: &str, uid: &str) -> String {
    let hash = short_hash(&format!("{test_name}/{uid}"));
    let base = sanitize_resource_name(test_name, MAX_NAME_LEN - hash.len() - 1);
    if base.is_empty() {
        hash
    } else {
        format!("{base}-{hash}")
    }
}

fn duration_pattern() -> Result<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^\s*(\d+)\s*([dhms])\s*$").ok())
        .as_ref()
        .ok_or_else(|| LzrError::Runtime {
            details: "duration pattern failed to compile".to_string(),
        })
}

/// Parse a TTL string such as `30s`, `15m`, `24h`, or `7d`.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let lowered = raw.to_lowercase();
    let caps = duration_pattern()?
        .captures(&lowered)
        .ok_or_else(|| LzrError::validation(format!("invalid duration {raw:?}: expected <n>[dhms]")))?;
    let value: u64 = caps[1]
        .parse()
        .map_err(|e| LzrError::validation(format!("invalid duration {raw:?}: {e}")))?;
    let unit_secs = match &caps[2] {
        "d" => 86_400,
        "h" => 3_600,
        "m" => 60,
        _ => 1,
    };
    value
        .checked_mul(unit_secs)
        .map(Duration::from_secs)
        .ok_or_else(|| LzrError::validation(format!("duration {raw:?} overflows")))
}

/// Render a duration back into the compact `<n><unit>` form.
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs != 0 && secs % 86_400 == 0 {
        format!("{}d", secs / 86_400)
    } else if secs != 0 && secs % 3_600 == 0 {
        format!("{}h", secs / 3_600)
    } else if secs != 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}
