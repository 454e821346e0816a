// SPDX-License-Identifier: MIT OR Apache-2.0
//! backhaul
//!
//! Operational wrapper around the `restic` deduplicating backup engine:
//! centralized configuration with group inheritance and encrypted fields,
//! a gated operation runner, restic output parsing, Prometheus metrics and
//! e-mail notification, durable scheduling counters, and a process-wide
//! concurrency gate.
//!
//! This crate re-exports the workspace members under one roof; the
//! `backhaul` binary lives in `bhl-cli`.

pub use bhl_config as config;
pub use bhl_core as core;
pub use bhl_crypto as crypto;
pub use bhl_lock as lock;
pub use bhl_metrics as metrics;
pub use bhl_runner as runner;
pub use bhl_sched as sched;
pub use bhl_wrapper as wrapper;
