// SPDX-License-Identifier: MIT OR Apache-2.0
//! bhl-core
#![deny(unsafe_code)]
//!
//! Core vocabulary for backhaul: the operation enum and permission table,
//! the uniform result envelope, the worst-log-level tracker, byte-unit
//! conversion, and the cancellation flag shared between the runner and the
//! backend wrapper.

pub mod cancel;
pub mod envelope;
pub mod logs;
pub mod op;
pub mod types;
pub mod units;

pub use cancel::CancelFlag;
pub use envelope::OpResult;
pub use logs::{ExecState, LogLevel, OpLogger};
pub use op::{Operation, Permission};
pub use types::{LsNode, Snapshot};
pub use units::{ByteSize, UnitError};

// ---------------------------------------------------------------------------
// Shared constants
// ---------------------------------------------------------------------------

/// Interval between cancellation polls while a backend child runs.
pub const CHECK_INTERVAL_MS: u64 = 5;

/// Interval between "still alive" heartbeat log lines during long operations.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 3600;

/// Timeout applied to commands that must answer quickly (init, version,
/// snapshot listings). A backend that cannot answer these within three
/// minutes is in real trouble.
pub const FAST_COMMANDS_TIMEOUT_SECS: u64 = 180;

/// Maximum clock offset, in seconds, tolerated before policy operations are
/// refused.
pub const MAX_ALLOWED_NTP_OFFSET: f64 = 600.0;

/// Replacement value written over secret environment variables once the
/// backend child has exited, so hook children cannot read them.
pub const HIDDEN_VALUE: &str = "_[o_O]_hidden_by_backhaul";

/// Maximum number of characters of operation detail included in notification
/// mails.
pub const MAX_EMAIL_DETAIL_LENGTH: usize = 1000;

/// Internal name used for pid files and scheduler counter files.
pub const INTERNAL_NAME: &str = "backhaul";

/// Environment variable exporting the resolved backend binary path to hooks.
pub const ENV_BACKEND_BINARY: &str = "BACKHAUL_BACKEND_BINARY";

/// Environment variable the upgrade subsystem writes its last state into.
pub const ENV_UPGRADE_STATE: &str = "BACKHAUL_UPGRADE_STATE";

// ---------------------------------------------------------------------------
// Exit codes
// ---------------------------------------------------------------------------

/// Process exit codes used by the CLI entry layer.
pub mod exit_codes {
    /// Everything went fine.
    pub const SUCCESS: i32 = 0;
    /// At least one warning was logged during the run.
    pub const WORST_LEVEL_WARNING: i32 = 30;
    /// At least one error was logged during the run.
    pub const WORST_LEVEL_ERROR: i32 = 40;
    /// At least one critical error was logged during the run.
    pub const WORST_LEVEL_CRITICAL: i32 = 50;
    /// Another instance already holds the process lock.
    pub const ALREADY_RUNNING: i32 = 21;
    /// The configuration file does not exist.
    pub const CONFIG_FILE_MISSING: i32 = 70;
    /// The configuration file could not be parsed.
    pub const CONFIG_FILE_INVALID: i32 = 71;
    /// The configuration file parsed but failed semantic checks.
    pub const CONFIG_FILE_BOGUS: i32 = 72;
    /// Interrupted by the operator.
    pub const KEYBOARD_INTERRUPT: i32 = 200;
    /// Unhandled failure bubbled up to the entry layer.
    pub const UNHANDLED_EXCEPTION: i32 = 201;
}
