// SPDX-License-Identifier: MIT OR Apache-2.0
//! Prometheus exposition rendering.

use crate::parser::BackupSummary;
use bhl_core::ExecState;
use bhl_core::units::ByteSize;
use std::collections::BTreeMap;
use tracing::info;

/// Label set with deterministic rendering order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Labels(BTreeMap<String, String>);

impl Labels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a label; empty values are skipped so they never render as
    /// `key=""`.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let key = key.into();
        let value = value.into();
        if !value.trim().is_empty() {
            self.0.insert(key.trim().to_string(), value.trim().to_string());
        }
        self
    }

    /// Builder form of [`Labels::set`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Render as `k1="v1",k2="v2"` with keys in sorted order.
    pub fn render(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{k}=\"{v}\""))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Render with extra labels appended after the sorted base set.
    fn render_with(&self, extra: &[(&str, String)]) -> String {
        let mut parts: Vec<String> = self
            .0
            .iter()
            .map(|(k, v)| format!("{k}=\"{v}\""))
            .collect();
        for (k, v) in extra {
            parts.push(format!("{k}=\"{v}\""));
        }
        parts.join(",")
    }
}

/// Convert a backup summary into `restic_*` samples.
///
/// Returns the samples plus the `backup_too_small` verdict against the
/// configured minimum size. The `restic_backup_failure` sample is 1 when the
/// operation failed or the backup was too small.
pub fn summary_to_samples(
    summary: &BackupSummary,
    labels: &Labels,
    minimum_backup_size_error: Option<ByteSize>,
    operation_success: bool,
    timestamp: i64,
) -> (Vec<String>, bool) {
    let base = labels.render();
    let mut samples = Vec::new();

    let file_states = [
        ("new", summary.files_new),
        ("changed", summary.files_changed),
        ("unmodified", summary.files_unmodified),
        ("total", summary.total_files_processed),
    ];
    for (state, value) in file_states {
        if let Some(value) = value {
            samples.push(format!("restic_files{{{base},state=\"{state}\"}} {value}"));
        }
    }

    let dir_states = [
        ("new", summary.dirs_new),
        ("changed", summary.dirs_changed),
        ("unmodified", summary.dirs_unmodified),
    ];
    for (state, value) in dir_states {
        if let Some(value) = value {
            samples.push(format!("restic_dirs{{{base},state=\"{state}\"}} {value}"));
        }
    }

    if let Some(value) = summary.total_bytes_processed {
        samples.push(format!(
            "restic_snapshot_size_bytes{{{base},type=\"processed\"}} {value}"
        ));
        info!(
            "processed {} of data",
            ByteSize::from_bytes(value).human_iec_bytes()
        );
    }
    if let Some(value) = summary.data_added {
        samples.push(format!("restic_data_added{{{base}}} {value}"));
    }
    if let Some(value) = summary.data_stored {
        samples.push(format!("restic_data_stored{{{base}}} {value}"));
    }
    if let Some(value) = summary.total_duration {
        samples.push(format!("restic_total_duration_seconds{{{base}}} {value}"));
    }

    let backup_too_small = match minimum_backup_size_error {
        Some(minimum) => summary
            .total_bytes_processed
            .map_or(true, |processed| processed < minimum.bytes()),
        None => false,
    };

    let good_backup = operation_success && !summary.errors && !backup_too_small;
    samples.push(format!(
        "restic_backup_failure{{{}}} {}",
        labels.render_with(&[("timestamp", timestamp.to_string())]),
        if good_backup { 0 } else { 1 }
    ));

    (samples, backup_too_small)
}

/// Aggregate run-state sample.
pub fn exec_state_sample(labels: &Labels, state: ExecState, timestamp: i64) -> String {
    format!(
        "backhaul_exec_state{{{}}} {}",
        labels.render_with(&[("timestamp", timestamp.to_string())]),
        state.0
    )
}

/// Wall-clock duration sample.
pub fn exec_time_sample(labels: &Labels, exec_time: f64, timestamp: i64) -> String {
    format!(
        "backhaul_exec_time{{{}}} {exec_time}",
        labels.render_with(&[("timestamp", timestamp.to_string())])
    )
}
