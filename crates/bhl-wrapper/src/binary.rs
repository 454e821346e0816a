// SPDX-License-Identifier: MIT OR Apache-2.0
//! Backend binary discovery and version gating.

use regex::Regex;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::debug;

/// Locate the backend binary.
///
/// Caller-supplied search paths are probed first, then the standard OS
/// locations, then `PATH`.
pub fn find_backend_binary(search_paths: &[PathBuf]) -> Option<PathBuf> {
    let binary_name = if cfg!(windows) { "restic.exe" } else { "restic" };

    let mut probe_dirs: Vec<PathBuf> = search_paths.to_vec();
    if cfg!(windows) {
        if let Ok(windir) = std::env::var("windir") {
            probe_dirs.push(PathBuf::from(&windir).join("SYSTEM32"));
            probe_dirs.push(PathBuf::from(windir));
        }
        if let Ok(program_files) = std::env::var("ProgramFiles") {
            probe_dirs.push(PathBuf::from(program_files).join("restic"));
        }
    } else {
        probe_dirs.push(PathBuf::from("/usr/bin"));
        probe_dirs.push(PathBuf::from("/usr/local/bin"));
    }

    for dir in &probe_dirs {
        let candidate = dir.join(binary_name);
        debug!("probing for backend binary in {}", candidate.display());
        if candidate.is_file() {
            return Some(candidate);
        }
    }

    // Fall back to PATH resolution.
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(binary_name))
        .find(|candidate| candidate.is_file())
}

fn version_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"restic\s+([0-9.]+).*compiled").unwrap())
}

/// Extract the version number from `restic version` output.
pub fn parse_backend_version(output: &str) -> Option<String> {
    version_re()
        .captures(output)
        .map(|caps| caps[1].trim_end_matches('.').to_string())
}

/// Compare a dotted version against a `(major, minor)` floor.
pub fn version_at_least(version: &str, major: u32, minor: u32) -> bool {
    let mut parts = version.split('.');
    let v_major: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let v_minor: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    (v_major, v_minor) >= (major, minor)
}

/// Infer the repository backend type from the URI scheme; anything without
/// a recognized scheme is a local path.
pub fn repo_type_of(repository: &str) -> &'static str {
    let scheme = repository.split(':').next().unwrap_or_default();
    match scheme.to_ascii_uppercase().as_str() {
        "REST" => "rest",
        "S3" => "s3",
        "B2" => "b2",
        "SFTP" => "sftp",
        "SWIFT" => "swift",
        "AZURE" => "azure",
        "GS" => "gs",
        "RCLONE" => "rclone",
        _ => "local",
    }
}

/// Anonymous rendition of a repository URI for logs: scheme plus a hidden
/// marker.
pub fn anonymous_repository(repository: &str, hidden: &str) -> String {
    format!("{}:{hidden}", repository.split(':').next().unwrap_or_default())
}
