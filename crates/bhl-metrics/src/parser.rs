// SPDX-License-Identifier: MIT OR Apache-2.0
//! Backup summary extraction from restic output.
//!
//! restic reports its backup summary either as free text (`Files: 12 new,
//! ...`) or, with `--json`, as a stream of JSON lines whose last interesting
//! line carries `"message_type":"summary"`. Both shapes are normalized into
//! [`BackupSummary`].

use bhl_core::units::ByteSize;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Normalized backup summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackupSummary {
    pub files_new: Option<u64>,
    pub files_changed: Option<u64>,
    pub files_unmodified: Option<u64>,
    pub dirs_new: Option<u64>,
    pub dirs_changed: Option<u64>,
    pub dirs_unmodified: Option<u64>,
    /// Bytes added to the repository before compression.
    pub data_added: Option<u64>,
    /// Bytes actually stored after compression.
    pub data_stored: Option<u64>,
    pub total_files_processed: Option<u64>,
    pub total_bytes_processed: Option<u64>,
    /// Wall-clock duration of the backup in seconds.
    pub total_duration: Option<f64>,
    /// Whether error sentinels were seen in the output.
    pub errors: bool,
}

fn files_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^Files:\s+(\d+)\snew,\s+(\d+)\schanged,\s+(\d+)\sunmodified").unwrap()
    })
}

fn dirs_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^Dirs:\s+(\d+)\snew,\s+(\d+)\schanged,\s+(\d+)\sunmodified").unwrap()
    })
}

fn added_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^Added to the repo.*:\s([-+]?(?:\d*\.\d+|\d+))\s(\w+)\s+\((.*)\sstored\)")
            .unwrap()
    })
}

fn processed_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^processed\s(\d+)\sfiles,\s([-+]?(?:\d*\.\d+|\d+))\s(\w+)\sin\s((\d+:\d+:\d+)|(\d+:\d+)|(\d+))",
        )
        .unwrap()
    })
}

fn error_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^(Failure|Fatal|Unauthorized|no such host|.?s there a repository at the following location\?)",
        )
        .unwrap()
    })
}

/// Parse `H:M:S`, `M:S` or bare seconds into seconds.
fn time_to_seconds(text: &str) -> Option<f64> {
    let parts: Vec<&str> = text.split(':').collect();
    let mut seconds = 0.0;
    for part in &parts {
        seconds = seconds * 60.0 + part.parse::<f64>().ok()?;
    }
    Some(seconds)
}

fn parse_size(amount: &str, unit: &str) -> Option<u64> {
    format!("{amount} {unit}")
        .parse::<ByteSize>()
        .ok()
        .map(|b| b.bytes())
}

/// Extract a summary from restic's free-text output.
///
/// `success` is the backend exit status; a failed run marks the summary as
/// errored even when the counters parse fine.
pub fn parse_text_summary(success: bool, output: &str) -> BackupSummary {
    let mut summary = BackupSummary {
        errors: !success,
        ..Default::default()
    };

    for line in output.lines() {
        let line = line.trim_start();
        if let Some(caps) = files_re().captures(line) {
            summary.files_new = caps[1].parse().ok();
            summary.files_changed = caps[2].parse().ok();
            summary.files_unmodified = caps[3].parse().ok();
        }
        if let Some(caps) = dirs_re().captures(line) {
            summary.dirs_new = caps[1].parse().ok();
            summary.dirs_changed = caps[2].parse().ok();
            summary.dirs_unmodified = caps[3].parse().ok();
        }
        if let Some(caps) = added_re().captures(line) {
            summary.data_added = parse_size(&caps[1], &caps[2]);
            if summary.data_added.is_none() {
                warn!("cannot parse added-to-repo size from backend output");
                summary.errors = true;
            }
            summary.data_stored = caps[3].parse::<ByteSize>().ok().map(|b| b.bytes());
            if summary.data_stored.is_none() {
                warn!("cannot parse stored size from backend output");
                summary.errors = true;
            }
        }
        if let Some(caps) = processed_re().captures(line) {
            summary.total_files_processed = caps[1].parse().ok();
            summary.total_bytes_processed = parse_size(&caps[2], &caps[3]);
            if summary.total_bytes_processed.is_none() {
                warn!("cannot parse processed size from backend output");
                summary.errors = true;
            }
            summary.total_duration = time_to_seconds(&caps[4]);
            if summary.total_duration.is_none() {
                warn!("cannot parse elapsed time from backend output");
                summary.errors = true;
            }
        }
        if let Some(caps) = error_re().captures(line) {
            debug!("error sentinel '{}' found in backend output", &caps[0]);
            summary.errors = true;
        }
    }
    summary
}

fn u64_field(map: &serde_json::Map<String, Value>, key: &str) -> Option<u64> {
    map.get(key).and_then(Value::as_u64)
}

/// Extract the summary from JSON output.
///
/// Accepts either a parsed value (a summary object, or a list of JSON lines
/// containing one) or a raw string of JSON lines, scanned in reverse since
/// the summary is the last line restic prints.
pub fn summary_from_json(value: &Value) -> Option<BackupSummary> {
    match value {
        Value::Object(map) => {
            if map.get("message_type").and_then(Value::as_str) != Some("summary") {
                return None;
            }
            Some(BackupSummary {
                files_new: u64_field(map, "files_new"),
                files_changed: u64_field(map, "files_changed"),
                files_unmodified: u64_field(map, "files_unmodified"),
                dirs_new: u64_field(map, "dirs_new"),
                dirs_changed: u64_field(map, "dirs_changed"),
                dirs_unmodified: u64_field(map, "dirs_unmodified"),
                data_added: u64_field(map, "data_added"),
                data_stored: u64_field(map, "data_added_packed").or_else(|| u64_field(map, "data_stored")),
                total_files_processed: u64_field(map, "total_files_processed"),
                total_bytes_processed: u64_field(map, "total_bytes_processed"),
                total_duration: map.get("total_duration").and_then(Value::as_f64),
                errors: false,
            })
        }
        Value::Array(items) => items.iter().rev().find_map(summary_from_json),
        Value::String(text) => text
            .lines()
            .rev()
            .filter_map(|line| serde_json::from_str::<Value>(line.trim()).ok())
            .find_map(|v| summary_from_json(&v)),
        _ => None,
    }
}
