// SPDX-License-Identifier: MIT OR Apache-2.0
//! bhl-metrics
//!
//! Converts backend output into labelled Prometheus samples and publishes
//! them to a file or a push gateway; composes the notification e-mail sent
//! on operation outcomes.

pub mod dest;
pub mod email;
pub mod parser;
pub mod prom;

pub use dest::{upload_metrics, write_metrics_file};
pub use email::{EmailDecision, EmailSettings, send_notification};
pub use parser::{BackupSummary, parse_text_summary, summary_from_json};
pub use prom::{Labels, exec_state_sample, exec_time_sample, summary_to_samples};
