// SPDX-License-Identifier: MIT OR Apache-2.0
//! Backend output conversion: noise filtering and JSON-line parsing.

use bhl_core::LsNode;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// rclone debug lines interleave with restic output and break parsing.
fn rclone_noise_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?im)^rclone:\s+[0-9]{4}/[0-1][0-9]/[0-3][0-9]\s+[0-2][0-9]:[0-5][0-9]:[0-5][0-9]\s+DEBUG.*\n?",
        )
        .unwrap()
    })
}

/// Strip known noise patterns from text output.
pub fn filter_noise(output: &str) -> String {
    rclone_noise_re().replace_all(output, "").into_owned()
}

/// Parse output line-by-line into JSON values.
///
/// Valid JSON lines are kept as-is; anything else is wrapped as
/// `{"data": line}` so the envelope stays structured even when the backend
/// mixes text into a `--json` run. When `ls_nodes` is set, all but the
/// first line decode through the trimmed [`LsNode`] record to keep memory
/// bounded on huge listings.
pub fn parse_output_lines(output: &str, ls_nodes: bool) -> Vec<Value> {
    let mut values = Vec::new();
    let mut first_line = true;
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parsed = if ls_nodes && !first_line {
            serde_json::from_str::<LsNode>(line)
                .ok()
                .and_then(|node| serde_json::to_value(node).ok())
        } else {
            serde_json::from_str::<Value>(line).ok()
        };
        match parsed {
            Some(value) => {
                values.push(value);
                first_line = false;
            }
            None => values.push(serde_json::json!({ "data": line })),
        }
    }
    values
}
