// SPDX-License-Identifier: MIT OR Apache-2.0
//! Process-wide concurrency gate.
//!
//! Mutating operations (backup, repair, forget, prune, raw, unlock) must not
//! run concurrently in separate processes. The gate is a pid file in the
//! temp directory whose name is derived from a sanitized executable name
//! plus an optional caller-supplied identifier (used by repo-aware
//! concurrency to allow different repositories to proceed in parallel).
//!
//! A stale file never blocks: acquisition only fails when the recorded pid
//! is alive and its executable matches ours.

use std::path::{Path, PathBuf};
use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, System};
use thiserror::Error;
use tracing::{debug, warn};

/// Lock acquisition failure.
#[derive(Debug, Error)]
pub enum LockError {
    /// A live process already holds the gate.
    #[error("another instance is already running (pid {pid})")]
    AlreadyRunning {
        /// Pid recorded in the lock file.
        pid: u32,
    },
    #[error("cannot access pid file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Keep only alphanumeric characters so the name is valid on every
/// filesystem.
fn sanitize(name: &str) -> String {
    name.chars().filter(|c| c.is_alphanumeric()).collect()
}

/// Held process gate; the pid file is removed on drop.
#[derive(Debug)]
pub struct PidLock {
    path: PathBuf,
}

impl PidLock {
    /// Derive the pid file path for `intname` and an optional identifier.
    pub fn path_for(intname: &str, identifier: Option<&str>) -> PathBuf {
        let exe_name = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| intname.to_string());
        let mut file_name = format!("{intname}.pid-{}", sanitize(&exe_name));
        if let Some(id) = identifier {
            file_name.push('-');
            file_name.push_str(&sanitize(id));
        }
        std::env::temp_dir().join(file_name)
    }

    /// Try to acquire the gate.
    pub fn acquire(intname: &str, identifier: Option<&str>) -> Result<Self, LockError> {
        Self::acquire_at(&Self::path_for(intname, identifier))
    }

    /// Try to acquire the gate at an explicit path.
    pub fn acquire_at(path: &Path) -> Result<Self, LockError> {
        if let Some(pid) = read_live_holder(path) {
            return Err(LockError::AlreadyRunning { pid });
        }

        std::fs::write(path, std::process::id().to_string()).map_err(|source| LockError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("acquired process gate at {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

/// Pid recorded in the file, when that process is alive and runs the same
/// executable as us.
fn read_live_holder(path: &Path) -> Option<u32> {
    let content = std::fs::read_to_string(path).ok()?;
    let pid: u32 = content.trim().parse().ok()?;
    if pid == std::process::id() {
        // A file carrying our own pid means this process already holds the
        // gate; a second acquisition must refuse like any other.
        return Some(pid);
    }

    let system = System::new_with_specifics(
        RefreshKind::new().with_processes(ProcessRefreshKind::new()),
    );
    let process = system.process(Pid::from_u32(pid))?;

    let our_exe = std::env::current_exe().ok();
    let holder_exe = process.exe().map(Path::to_path_buf);
    match (our_exe, holder_exe) {
        (Some(ours), Some(theirs)) => {
            let ours = ours.file_name().map(|n| sanitize(&n.to_string_lossy()));
            let theirs = theirs.file_name().map(|n| sanitize(&n.to_string_lossy()));
            (ours == theirs).then_some(pid)
        }
        // Cannot compare executables; be conservative and treat the live
        // pid as a holder.
        _ => Some(pid),
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("cannot remove pid file {}: {e}", self.path.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn acquire_writes_our_pid_and_releases_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backhaul.pid-test");
        {
            let _lock = PidLock::acquire_at(&path).unwrap();
            let recorded: u32 = std::fs::read_to_string(&path).unwrap().trim().parse().unwrap();
            assert_eq!(recorded, std::process::id());
        }
        assert!(!path.exists());
    }

    #[test]
    fn stale_file_with_dead_pid_does_not_block() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backhaul.pid-test");
        // Pids near u32::MAX are practically never alive.
        std::fs::write(&path, "4294967294").unwrap();
        let _lock = PidLock::acquire_at(&path).unwrap();
    }

    #[test]
    fn garbage_content_does_not_block() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backhaul.pid-test");
        std::fs::write(&path, "not a pid").unwrap();
        let _lock = PidLock::acquire_at(&path).unwrap();
    }

    #[test]
    fn second_acquisition_in_the_same_process_is_refused() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backhaul.pid-test");
        let _held = PidLock::acquire_at(&path).unwrap();
        let err = PidLock::acquire_at(&path).unwrap_err();
        assert!(matches!(err, LockError::AlreadyRunning { .. }));
    }

    #[test]
    fn identifier_changes_the_path() {
        let plain = PidLock::path_for("backhaul", None);
        let repo = PidLock::path_for("backhaul", Some("repo-one"));
        assert_ne!(plain, repo);
        assert!(repo.to_string_lossy().contains("repoone"));
    }

    #[test]
    fn sanitize_strips_separators() {
        assert_eq!(sanitize("/usr/bin/backhaul"), "usrbinbackhaul");
        assert_eq!(sanitize("back-haul_1.exe"), "backhaul1exe");
    }
}
