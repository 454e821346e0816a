// SPDX-License-Identifier: MIT OR Apache-2.0
//! Cross-run scheduling counters.
//!
//! Endpoints have no daemon, so "run housekeeping once every N backups" and
//! "attempt an upgrade with P% chance per run" are implemented as durable
//! file-backed counters plus a uniform random draw. The counter file is
//! probed through an ordered fallback chain because endpoints may run as
//! unprivileged users: system log dir, then the temp dir, then the current
//! directory. Once a writable file is found we stick to it for the run.
//! If no location is writable the trigger never fires.

use rand::Rng;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// Program name used in counter file names: `<program>.<job>.log`.
const PROGRAM_NAME: &str = "backhaul";

/// Ordered probe list for counter files.
fn default_counter_paths(job_name: &str) -> Vec<PathBuf> {
    let file_name = format!("{PROGRAM_NAME}.{job_name}.log");
    let mut paths = Vec::new();
    if cfg!(windows) {
        paths.push(PathBuf::from(r"C:\Windows\Temp").join(&file_name));
    } else {
        paths.push(PathBuf::from("/var/log").join(&file_name));
    }
    paths.push(std::env::temp_dir().join(&file_name));
    paths.push(PathBuf::from(".").join(&file_name));
    paths
}

fn read_count(path: &Path, job_name: &str) -> Option<u64> {
    match std::fs::read_to_string(path) {
        Ok(content) => match content.trim().parse::<u64>() {
            Ok(count) => Some(count),
            Err(e) => {
                error!("bogus {job_name} counter in {}: {e}", path.display());
                None
            }
        },
        Err(e) => {
            error!("cannot read {job_name} counter file {}: {e}", path.display());
            None
        }
    }
}

fn write_count(path: &Path, count: u64) -> bool {
    std::fs::write(path, count.to_string()).is_ok()
}

/// Counter-based trigger over an explicit path list. Fires once every
/// `interval` successful invocations.
pub fn schedule_on_interval_at(job_name: &str, interval: u64, paths: &[PathBuf]) -> bool {
    if interval == 0 {
        debug!("no interval given for schedule of job {job_name}");
        return false;
    }

    for path in paths {
        if !path.is_file() {
            if write_count(path, 1) {
                debug!("initial {job_name} counter written to {}", path.display());
            } else {
                debug!("cannot write {job_name} counter file {}", path.display());
                continue;
            }
        }
        let Some(count) = read_count(path, job_name) else {
            continue;
        };
        // Prove the file is writable before acting on the count.
        if !write_count(path, count + 1) {
            debug!("cannot write {job_name} counter to {}", path.display());
            continue;
        }
        if count >= interval {
            // Reset before approving the run.
            if write_count(path, 1) {
                info!("schedule on interval has decided {job_name} is required");
                return true;
            }
        }
        return false;
    }
    false
}

/// Counter-based trigger over the default fallback chain.
pub fn schedule_on_interval(job_name: &str, interval: u64) -> bool {
    schedule_on_interval_at(job_name, interval, &default_counter_paths(job_name))
}

/// Random trigger: fires with probability `chance_percent` / 100.
pub fn schedule_on_chance(job_name: &str, chance_percent: u32) -> bool {
    if chance_percent == 0 {
        return false;
    }
    if rand::thread_rng().gen_range(1..=100) <= chance_percent {
        debug!("schedule on chance has decided {job_name} is required");
        return true;
    }
    false
}

/// Fires when either the chance draw or the interval counter fires.
///
/// Both triggers are evaluated so the interval counter keeps advancing even
/// on runs where the chance draw already fired.
pub fn schedule_on_chance_or_interval(job_name: &str, chance_percent: u32, interval: u64) -> bool {
    let by_chance = schedule_on_chance(job_name, chance_percent);
    let by_interval = schedule_on_interval(job_name, interval);
    by_chance || by_interval
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn counter_in(dir: &Path) -> Vec<PathBuf> {
        vec![dir.join("backhaul.test-job.log")]
    }

    #[test]
    fn fires_exactly_once_every_interval() {
        let dir = tempdir().unwrap();
        let paths = counter_in(dir.path());

        let mut fired = Vec::new();
        for _ in 0..9 {
            fired.push(schedule_on_interval_at("test-job", 3, &paths));
        }
        // First call creates the file with 1, so the counter reaches the
        // interval on every third invocation.
        assert_eq!(
            fired,
            vec![false, false, true, false, false, true, false, false, true]
        );
    }

    #[test]
    fn interval_one_fires_every_time_after_seed() {
        let dir = tempdir().unwrap();
        let paths = counter_in(dir.path());
        assert!(schedule_on_interval_at("test-job", 1, &paths));
        assert!(schedule_on_interval_at("test-job", 1, &paths));
    }

    #[test]
    fn zero_interval_never_fires() {
        let dir = tempdir().unwrap();
        let paths = counter_in(dir.path());
        assert!(!schedule_on_interval_at("test-job", 0, &paths));
        assert!(!paths[0].exists());
    }

    #[test]
    fn unwritable_locations_fail_closed() {
        let paths = vec![PathBuf::from("/nonexistent-root-dir/backhaul.job.log")];
        for _ in 0..5 {
            assert!(!schedule_on_interval_at("job", 1, &paths));
        }
    }

    #[test]
    fn falls_back_to_next_writable_location() {
        let dir = tempdir().unwrap();
        let paths = vec![
            PathBuf::from("/nonexistent-root-dir/backhaul.job.log"),
            dir.path().join("backhaul.job.log"),
        ];
        assert!(!schedule_on_interval_at("job", 2, &paths));
        assert!(paths[1].exists());
        assert!(schedule_on_interval_at("job", 2, &paths));
    }

    #[test]
    fn bogus_counter_content_does_not_fire() {
        let dir = tempdir().unwrap();
        let paths = counter_in(dir.path());
        std::fs::write(&paths[0], "not a number").unwrap();
        assert!(!schedule_on_interval_at("test-job", 1, &paths));
    }

    #[test]
    fn chance_zero_never_fires_and_hundred_always_fires() {
        for _ in 0..50 {
            assert!(!schedule_on_chance("job", 0));
            assert!(schedule_on_chance("job", 100));
        }
    }

    #[test]
    fn chance_or_interval_is_an_or() {
        let dir = tempdir().unwrap();
        let paths = counter_in(dir.path());
        // Chance 100 always fires regardless of the interval counter.
        assert!(schedule_on_chance("job", 100) || schedule_on_interval_at("job", 1000, &paths));
        // Interval 1 fires once seeded even with chance 0.
        schedule_on_interval_at("job", 1, &paths);
        assert!(schedule_on_chance("job", 0) || schedule_on_interval_at("job", 1, &paths));
    }
}
