// SPDX-License-Identifier: MIT OR Apache-2.0
//! Backend data shapes the core consumes.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A snapshot as reported by the backend's `snapshots --json`.
///
/// Only the fields the core actually reads are modelled; everything else is
/// carried opaquely in the envelope output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub id: String,
    #[serde(default)]
    pub short_id: Option<String>,
    /// ISO-8601 timestamp with offset.
    pub time: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub paths: Vec<String>,
}

impl Snapshot {
    /// Parse the snapshot timestamp.
    pub fn timestamp(&self) -> Option<DateTime<FixedOffset>> {
        DateTime::parse_from_rfc3339(&self.time).ok()
    }

    /// Best-effort decode from an envelope output value.
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

/// Memory-optimized record for `ls` output, which may run to millions of
/// lines. Only the fields needed for display are kept.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LsNode {
    #[serde(rename = "type")]
    pub node_type: String,
    pub path: String,
    #[serde(default)]
    pub mtime: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn snapshot_decodes_backend_json() {
        let value = json!({
            "id": "8daef59e2ac4c865",
            "short_id": "8daef59e",
            "time": "2023-01-03T09:41:30.9104257+01:00",
            "hostname": "host1",
            "username": "root",
            "tags": ["nightly"],
            "paths": ["/etc"],
        });
        let snap = Snapshot::from_value(&value).unwrap();
        assert_eq!(snap.short_id.as_deref(), Some("8daef59e"));
        assert_eq!(snap.tags, vec!["nightly"]);
        let ts = snap.timestamp().unwrap();
        assert_eq!(ts.offset().local_minus_utc(), 3600);
    }

    #[test]
    fn snapshot_tolerates_missing_optional_fields() {
        let value = json!({"id": "abc", "time": "2023-01-03T09:41:30+00:00"});
        let snap = Snapshot::from_value(&value).unwrap();
        assert!(snap.tags.is_empty());
        assert!(snap.paths.is_empty());
    }

    #[test]
    fn ls_node_keeps_only_needed_fields() {
        let line = r#"{"type":"file","path":"/etc/hosts","mtime":"2023-01-01T00:00:00Z","size":214,"uid":0,"gid":0,"mode":420}"#;
        let node: LsNode = serde_json::from_str(line).unwrap();
        assert_eq!(node.node_type, "file");
        assert_eq!(node.size, Some(214));
    }

    #[test]
    fn bogus_time_yields_none() {
        let value = json!({"id": "abc", "time": "not a date"});
        let snap = Snapshot::from_value(&value).unwrap();
        assert!(snap.timestamp().is_none());
    }
}
