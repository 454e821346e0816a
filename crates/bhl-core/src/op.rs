// SPDX-License-Identifier: MIT OR Apache-2.0
//! Closed enum of backend operations and the static permission table.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Role granted to a repository.
///
/// Only one permission is set per repo; when none is configured, `Full` is
/// assumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// May create backups and inspect snapshots.
    Backup,
    /// May restore data in addition to backup-side queries.
    Restore,
    /// May only restore data.
    RestoreOnly,
    /// Unrestricted.
    Full,
}

impl Permission {
    /// Stable configuration-file spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Backup => "backup",
            Permission::Restore => "restore",
            Permission::RestoreOnly => "restore_only",
            Permission::Full => "full",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backup" => Ok(Permission::Backup),
            "restore" => Ok(Permission::Restore),
            "restore_only" => Ok(Permission::RestoreOnly),
            "full" => Ok(Permission::Full),
            other => Err(format!("unknown permission '{other}'")),
        }
    }
}

/// Every operation the runner can dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Init,
    Backup,
    HasRecentSnapshot,
    Snapshots,
    Stats,
    List,
    Ls,
    Find,
    Restore,
    Dump,
    Check,
    Recover,
    Unlock,
    Repair,
    Forget,
    Prune,
    Housekeeping,
    Raw,
}

use Permission::{Backup as PB, Full as PF, Restore as PR, RestoreOnly as PRO};

impl Operation {
    /// Wire / log name of the operation.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Init => "init",
            Operation::Backup => "backup",
            Operation::HasRecentSnapshot => "has_recent_snapshot",
            Operation::Snapshots => "snapshots",
            Operation::Stats => "stats",
            Operation::List => "list",
            Operation::Ls => "ls",
            Operation::Find => "find",
            Operation::Restore => "restore",
            Operation::Dump => "dump",
            Operation::Check => "check",
            Operation::Recover => "recover",
            Operation::Unlock => "unlock",
            Operation::Repair => "repair",
            Operation::Forget => "forget",
            Operation::Prune => "prune",
            Operation::Housekeeping => "housekeeping",
            Operation::Raw => "raw",
        }
    }

    /// Minimum roles allowed to run this operation.
    pub fn allowed_permissions(&self) -> &'static [Permission] {
        match self {
            Operation::Init | Operation::Backup => &[PB, PR, PF],
            Operation::HasRecentSnapshot
            | Operation::Snapshots
            | Operation::Ls
            | Operation::Find => &[PB, PR, PRO, PF],
            Operation::Stats => &[PB, PR, PF],
            Operation::Restore | Operation::Dump => &[PR, PRO, PF],
            Operation::Check | Operation::Recover => &[PR, PF],
            Operation::Unlock => &[PB, PR, PF],
            Operation::List
            | Operation::Repair
            | Operation::Forget
            | Operation::Prune
            | Operation::Housekeeping
            | Operation::Raw => &[PF],
        }
    }

    /// Whether `permission` suffices to run this operation.
    pub fn permitted(&self, permission: Permission) -> bool {
        self.allowed_permissions().contains(&permission)
    }

    /// Operations that must never run concurrently process-wide.
    pub fn is_locking(&self) -> bool {
        matches!(
            self,
            Operation::Backup
                | Operation::Repair
                | Operation::Forget
                | Operation::Prune
                | Operation::Raw
                | Operation::Unlock
        )
    }

    /// Read-only operations never lock the repository (`--no-lock`).
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            Operation::Snapshots
                | Operation::Stats
                | Operation::List
                | Operation::Ls
                | Operation::Find
        )
    }

    /// Only these backend subcommands understand `--dry-run`, and the flag
    /// must follow the subcommand immediately.
    pub fn supports_dry_run(&self) -> bool {
        matches!(
            self,
            Operation::Backup | Operation::Forget | Operation::Prune | Operation::Restore
        )
    }

    /// Operations whose stdout is binary and must not be filtered or parsed.
    pub fn has_binary_output(&self) -> bool {
        matches!(self, Operation::Dump)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
