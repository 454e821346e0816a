// SPDX-License-Identifier: MIT OR Apache-2.0
//! Operation logger: forwards to `tracing` while tracking the worst level
//! reached and collecting warning/error messages for the result envelope.

use crate::exit_codes;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// Severity of an operator-facing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

/// Aggregate run state derived from the worst log level, exported as the
/// `exec_state` metric: 0 ok, 1 warning, 2 error, 3 critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecState(pub u8);

#[derive(Debug, Default)]
struct Inner {
    worst: Option<LogLevel>,
    errors: Vec<String>,
    warnings: Vec<String>,
}

/// Shared logger handed to the wrapper and the runner.
///
/// Cloning is cheap; all clones feed the same tracker so the exit code and
/// `exec_state` reflect the whole run.
#[derive(Debug, Clone, Default)]
pub struct OpLogger {
    inner: Arc<Mutex<Inner>>,
}

impl OpLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log a message and record its level.
    pub fn log(&self, level: LogLevel, msg: &str) {
        match level {
            LogLevel::Debug => debug!("{msg}"),
            LogLevel::Info => info!("{msg}"),
            LogLevel::Warning => warn!("{msg}"),
            LogLevel::Error => error!("{msg}"),
            LogLevel::Critical => error!(critical = true, "{msg}"),
        }
        let mut inner = self.inner.lock().expect("log tracker lock poisoned");
        if inner.worst.map_or(true, |w| level > w) {
            inner.worst = Some(level);
        }
        match level {
            LogLevel::Warning => inner.warnings.push(msg.to_string()),
            LogLevel::Error | LogLevel::Critical => inner.errors.push(msg.to_string()),
            _ => {}
        }
    }

    pub fn debug(&self, msg: &str) {
        self.log(LogLevel::Debug, msg);
    }

    pub fn info(&self, msg: &str) {
        self.log(LogLevel::Info, msg);
    }

    pub fn warning(&self, msg: &str) {
        self.log(LogLevel::Warning, msg);
    }

    pub fn error(&self, msg: &str) {
        self.log(LogLevel::Error, msg);
    }

    pub fn critical(&self, msg: &str) {
        self.log(LogLevel::Critical, msg);
    }

    /// Worst level reached so far.
    pub fn worst_level(&self) -> Option<LogLevel> {
        self.inner.lock().expect("log tracker lock poisoned").worst
    }

    /// `exec_state` metric value for the worst level reached.
    pub fn exec_state(&self) -> ExecState {
        match self.worst_level() {
            Some(LogLevel::Critical) => ExecState(3),
            Some(LogLevel::Error) => ExecState(2),
            Some(LogLevel::Warning) => ExecState(1),
            _ => ExecState(0),
        }
    }

    /// Process exit code for the worst level reached; 0 when nothing worse
    /// than info was logged.
    pub fn exit_code(&self) -> i32 {
        match self.worst_level() {
            Some(LogLevel::Critical) => exit_codes::WORST_LEVEL_CRITICAL,
            Some(LogLevel::Error) => exit_codes::WORST_LEVEL_ERROR,
            Some(LogLevel::Warning) => exit_codes::WORST_LEVEL_WARNING,
            _ => exit_codes::SUCCESS,
        }
    }

    /// Drain collected errors and warnings for envelope annotation, leaving
    /// the worst-level tracker untouched.
    pub fn drain_annotations(&self) -> (Vec<String>, Vec<String>) {
        let mut inner = self.inner.lock().expect("log tracker lock poisoned");
        (
            std::mem::take(&mut inner.errors),
            std::mem::take(&mut inner.warnings),
        )
    }

    /// Reset the worst-level tracker between metric emissions so one run's
    /// state does not leak into the next within the same process.
    pub fn reset_worst_level(&self) {
        self.inner.lock().expect("log tracker lock poisoned").worst = None;
    }
}
