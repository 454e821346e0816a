// SPDX-License-Identifier: MIT OR Apache-2.0
//! bhl-wrapper
//!
//! Single-shot execution of backend commands with streamed capture,
//! deterministic success/failure classification, and uniform conversion
//! into the operation result envelope. One wrapper instance drives one
//! operation at a time; concurrency is enforced at the process-lock layer
//! above.

pub mod binary;
pub mod exec;
pub mod output;

pub use exec::{ExecRequest, ExitKind, OutputSink, Priority};

use bhl_core::units::{ByteSize, parse_percent};
use bhl_core::{
    CancelFlag, ENV_BACKEND_BINARY, FAST_COMMANDS_TIMEOUT_SECS, HIDDEN_VALUE, OpLogger, Operation,
    OpResult, Snapshot,
};
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use exec::{Executor, all_errors_are_cloud_errors};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

// ---------------------------------------------------------------------------
// Backup request
// ---------------------------------------------------------------------------

/// How the backup payload is sourced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupSource {
    /// Plain folder/file list.
    FolderList(Vec<String>),
    /// Pattern list files (`--files-from`).
    FilesFrom(Vec<String>),
    /// Verbatim list files (`--files-from-verbatim`).
    FilesFromVerbatim(Vec<String>),
    /// NUL-separated list files (`--files-from-raw`).
    FilesFromRaw(Vec<String>),
    /// Backup the stdout of a command (`--stdin-from-command`).
    StdinFromCommand(String),
    /// Backup bytes piped into us (`--stdin`).
    Stdin(Vec<u8>),
}

/// Fully resolved backup invocation.
#[derive(Debug, Clone, Default)]
pub struct BackupRequest {
    pub source: Option<BackupSource>,
    pub stdin_filename: Option<String>,
    pub exclude_patterns: Vec<String>,
    pub exclude_files: Vec<String>,
    pub excludes_case_ignore: bool,
    pub exclude_caches: bool,
    pub exclude_files_larger_than: Option<String>,
    pub one_file_system: bool,
    pub use_fs_snapshot: bool,
    pub tags: Vec<String>,
    pub additional_backup_only_parameters: Option<String>,
}

/// Forget by explicit snapshots or by translated policy flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForgetTarget {
    Snapshots(Vec<String>),
    Policy {
        /// Pre-translated `(flag, value)` pairs such as
        /// `("keep-within-daily", "7d")`.
        keep_flags: Vec<(String, String)>,
        keep_tags: Vec<String>,
        apply_on_tags: Vec<String>,
        group_by: Vec<String>,
    },
}

/// Repair subcommand subjects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairSubject {
    Index,
    Packs,
    Snapshots,
}

impl RepairSubject {
    fn as_str(&self) -> &'static str {
        match self {
            RepairSubject::Index => "index",
            RepairSubject::Packs => "packs",
            RepairSubject::Snapshots => "snapshots",
        }
    }
}

/// Result of the recent-snapshot probe.
#[derive(Debug, Clone, PartialEq)]
pub enum RecentSnapshot {
    /// A snapshot younger than the delta exists.
    Recent(DateTime<FixedOffset>),
    /// Snapshots exist, but the newest is older than the delta.
    TooOld(DateTime<FixedOffset>),
    /// The repository holds no snapshots at all.
    NoSnapshots,
    /// The repository could not be queried.
    Unknown,
}

impl RecentSnapshot {
    /// Timestamp reported for the "no snapshots" case.
    pub fn epoch() -> DateTime<FixedOffset> {
        NaiveDate::from_ymd_opt(1, 1, 1)
            .expect("static date")
            .and_hms_opt(0, 0, 0)
            .expect("static time")
            .and_utc()
            .fixed_offset()
    }
}

// ---------------------------------------------------------------------------
// Wrapper
// ---------------------------------------------------------------------------

/// Drives one backend binary against one repository.
#[derive(Debug)]
pub struct ResticWrapper {
    repository: String,
    password: String,
    repo_type: &'static str,
    binary: Option<PathBuf>,
    binary_version: Option<String>,
    binary_search_paths: Vec<PathBuf>,

    pub verbose: bool,
    pub dry_run: bool,
    pub json_output: bool,
    /// Use the trimmed node record when parsing `ls` output.
    pub struct_output: bool,
    pub no_cache: bool,
    pub no_lock: bool,
    pub live_output: bool,
    pub ignore_cloud_files: bool,

    limit_upload_kib: Option<u64>,
    limit_download_kib: Option<u64>,
    backend_connections: Option<u32>,
    priority: Option<Priority>,
    additional_parameters: Option<String>,
    env_variables: BTreeMap<String, String>,
    encrypted_env_variables: BTreeMap<String, String>,

    stdout_sink: Option<OutputSink>,
    stderr_sink: Option<OutputSink>,

    logger: OpLogger,
    cancel: CancelFlag,

    /// Repository readiness: unknown until probed.
    is_init: Option<bool>,
    /// Raw output of the last backup, kept for the metrics analyzer.
    last_backup_output: Option<String>,
}

impl ResticWrapper {
    pub fn new(
        repository: impl Into<String>,
        password: impl Into<String>,
        binary_search_paths: Vec<PathBuf>,
        logger: OpLogger,
        cancel: CancelFlag,
    ) -> Self {
        let repository = repository.into().trim().to_string();
        let repo_type = binary::repo_type_of(&repository);
        Self {
            repository,
            password: password.into().trim().to_string(),
            repo_type,
            binary: None,
            binary_version: None,
            binary_search_paths,
            verbose: false,
            dry_run: false,
            json_output: false,
            struct_output: false,
            no_cache: false,
            no_lock: false,
            live_output: false,
            ignore_cloud_files: false,
            limit_upload_kib: None,
            limit_download_kib: None,
            backend_connections: None,
            priority: None,
            additional_parameters: None,
            env_variables: BTreeMap::new(),
            encrypted_env_variables: BTreeMap::new(),
            stdout_sink: None,
            stderr_sink: None,
            logger,
            cancel,
            is_init: None,
            last_backup_output: None,
        }
    }

    // -- knobs ------------------------------------------------------------

    /// Upload rate limit from a human size ("800 Mib"); the backend takes
    /// KiB/s. Zero disables the limit.
    pub fn set_limit_upload(&mut self, value: &str) -> Result<(), String> {
        self.limit_upload_kib = parse_rate_limit(value)?;
        Ok(())
    }

    /// Download rate limit, same semantics as upload.
    pub fn set_limit_download(&mut self, value: &str) -> Result<(), String> {
        self.limit_download_kib = parse_rate_limit(value)?;
        Ok(())
    }

    /// Backend connection count; zero selects 2 for local and 8 for remote
    /// repositories.
    pub fn set_backend_connections(&mut self, value: u32) {
        self.backend_connections = Some(if value > 0 {
            value
        } else if self.repo_type == "local" {
            2
        } else {
            8
        });
    }

    pub fn set_priority(&mut self, value: &str) -> Result<(), String> {
        self.priority =
            Some(Priority::parse(value).ok_or_else(|| format!("bogus priority '{value}'"))?);
        Ok(())
    }

    pub fn set_additional_parameters(&mut self, value: Option<String>) {
        self.additional_parameters = value;
    }

    pub fn set_env_variables(&mut self, plain: BTreeMap<String, String>, encrypted: BTreeMap<String, String>) {
        self.env_variables = plain;
        self.encrypted_env_variables = encrypted;
    }

    pub fn set_sinks(&mut self, stdout: Option<OutputSink>, stderr: Option<OutputSink>) {
        self.stdout_sink = stdout;
        self.stderr_sink = stderr;
    }

    pub fn is_init(&self) -> Option<bool> {
        self.is_init
    }

    pub fn last_backup_output(&self) -> Option<&str> {
        self.last_backup_output.as_deref()
    }

    /// Take the stored backup output, resetting it once consumed by the
    /// metrics analyzer.
    pub fn take_backup_output(&mut self) -> Option<String> {
        self.last_backup_output.take()
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    // -- binary handling ---------------------------------------------------

    /// Use an explicit binary path.
    pub fn set_binary(&mut self, path: PathBuf) -> Result<(), String> {
        if !path.is_file() {
            return Err(format!("non existent binary given: {}", path.display()));
        }
        self.binary = Some(path);
        Ok(())
    }

    /// Probe the search paths and OS locations for the binary.
    pub fn detect_binary(&mut self) -> bool {
        if self.binary.is_some() {
            return true;
        }
        match binary::find_backend_binary(&self.binary_search_paths) {
            Some(found) => {
                debug!("using backend binary {}", found.display());
                std::env::set_var(ENV_BACKEND_BINARY, &found);
                self.binary = Some(found);
                true
            }
            None => {
                self.logger.error(
                    "no backup engine binary found, please install the latest binary from restic.net",
                );
                false
            }
        }
    }

    pub fn binary(&self) -> Option<&Path> {
        self.binary.as_deref()
    }

    /// Query and cache `<binary> version`.
    pub async fn binary_version(&mut self) -> Option<String> {
        if self.binary_version.is_some() {
            return self.binary_version.clone();
        }
        let binary = self.binary.clone()?;
        let result = tokio::process::Command::new(&binary)
            .arg("version")
            .output();
        let output = tokio::time::timeout(Duration::from_secs(FAST_COMMANDS_TIMEOUT_SECS), result)
            .await
            .ok()?
            .ok()?;
        if !output.status.success() {
            self.logger.warning("cannot get backend version");
            return None;
        }
        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        match binary::parse_backend_version(&text) {
            Some(version) => {
                self.logger.info(&format!("using binary {text}"));
                self.binary_version = Some(version.clone());
                Some(version)
            }
            None => {
                self.logger
                    .warning(&format!("cannot extract backend version from output: {text}"));
                None
            }
        }
    }

    /// Override the cached backend version (tests, offline probing).
    pub fn set_binary_version(&mut self, version: impl Into<String>) {
        self.binary_version = Some(version.into());
    }

    // -- environment -------------------------------------------------------

    fn make_env(&self) {
        if !self.password.is_empty() {
            std::env::set_var("RESTIC_PASSWORD", &self.password);
        }
        if !self.repository.is_empty() {
            let repository = if self.repo_type == "local" {
                expand_home(&self.repository)
            } else {
                self.repository.clone()
            };
            std::env::set_var("RESTIC_REPOSITORY", repository);
        }
        for (key, value) in &self.env_variables {
            debug!("setting environment variable \"{key}\"");
            std::env::set_var(key, value);
        }
        for (key, value) in &self.encrypted_env_variables {
            debug!("setting encrypted environment variable \"{key}\"");
            std::env::set_var(key, value);
        }

        // Leave some cores to the rest of the system unless the operator
        // pinned the value.
        if !self.env_variables.contains_key("GOMAXPROCS") && std::env::var("GOMAXPROCS").is_err() {
            let cores = num_cpus::get();
            let gomaxprocs = match cores {
                0 | 1 => 1,
                2..=4 => cores - 1,
                _ => cores - 2,
            };
            debug!("setting GOMAXPROCS to {gomaxprocs}");
            std::env::set_var("GOMAXPROCS", gomaxprocs.to_string());
        }
    }

    /// Secrets must not survive for hook children to read.
    fn scrub_env(&self) {
        std::env::set_var("RESTIC_PASSWORD", HIDDEN_VALUE);
        std::env::set_var(
            "RESTIC_REPOSITORY",
            binary::anonymous_repository(&self.repository, HIDDEN_VALUE),
        );
        for key in self.encrypted_env_variables.keys() {
            std::env::set_var(key, HIDDEN_VALUE);
        }
    }

    // -- argument assembly -------------------------------------------------

    /// Global arguments applied before every subcommand.
    fn generic_args(&self, operation: Operation, json: bool) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(limit) = self.limit_upload_kib {
            args.push("--limit-upload".to_string());
            args.push(limit.to_string());
        }
        if let Some(limit) = self.limit_download_kib {
            args.push("--limit-download".to_string());
            args.push(limit.to_string());
        }
        if let Some(connections) = self.backend_connections {
            if self.repo_type != "local" {
                args.push("-o".to_string());
                args.push(format!("{}.connections={connections}", self.repo_type));
            }
        }
        if self.verbose {
            args.push("-vv".to_string());
        }
        if json {
            args.push("--json".to_string());
        }
        if self.no_cache {
            args.push("--no-cache".to_string());
        }
        // Read-only operations never take repository locks.
        if self.no_lock || operation.is_read_only() {
            args.push("--no-lock".to_string());
        }
        args
    }

    fn full_args(&self, operation: Operation, mut command: Vec<String>, json: bool) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(extra) = &self.additional_parameters {
            args.extend(extra.split_whitespace().map(str::to_string));
        }
        args.extend(self.generic_args(operation, json));
        if self.dry_run && operation.supports_dry_run() && !command.is_empty() {
            // --dry-run must follow the subcommand immediately.
            command.insert(1, "--dry-run".to_string());
            self.logger
                .info("running in dry mode, no modifications will be done");
        }
        args.extend(command);
        args
    }

    // -- execution ---------------------------------------------------------

    async fn execute(
        &mut self,
        operation: Operation,
        command: Vec<String>,
        json: bool,
        request_mods: impl FnOnce(&mut ExecRequest),
    ) -> (bool, ExitKind, String) {
        let Some(binary) = self.binary.clone() else {
            self.logger.error("backend binary not resolved");
            return (false, ExitKind::Failure { code: None }, String::new());
        };

        let mut request = ExecRequest::new(self.full_args(operation, command, json));
        request.binary_output = operation.has_binary_output();
        request_mods(&mut request);

        self.make_env();
        let binary_str = binary.to_string_lossy();
        let executor = Executor {
            binary: binary_str.as_ref(),
            priority: self.priority,
            cancel: &self.cancel,
            logger: &self.logger,
            stdout_sink: if request.errors_allowed {
                None
            } else {
                self.stdout_sink.as_ref()
            },
            stderr_sink: if request.errors_allowed {
                None
            } else {
                self.stderr_sink.as_ref()
            },
            live_output: self.live_output && !request.binary_output,
        };
        let outcome = executor.run(&request).await;
        self.scrub_env();

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                self.logger.error(&format!("cannot spawn backend: {e}"));
                return (false, ExitKind::Failure { code: None }, String::new());
            }
        };

        let mut kind = outcome.kind;
        let output = outcome.output;

        // Legacy cloud-file tolerance needs platform + version context the
        // low-level classifier doesn't have.
        if kind == (ExitKind::Failure { code: Some(3) })
            && cfg!(windows)
            && self.ignore_cloud_files
            && self
                .binary_version
                .as_deref()
                .map_or(false, |v| !binary::version_at_least(v, 0, 18))
        {
            if all_errors_are_cloud_errors(&output) {
                kind = ExitKind::CloudFilesTolerated;
                self.logger
                    .warning("some files were skipped because of cloud placeholders");
            } else {
                self.logger.error("some files could not be backed up");
            }
        }

        match &kind {
            ExitKind::Success | ExitKind::CloudFilesTolerated => {
                self.is_init = Some(true);
            }
            ExitKind::Uninitialized => {
                self.logger.info(
                    "repository is not initialized or does not exist, please create a backup to initialize it",
                );
                self.is_init = Some(false);
            }
            _ => {
                if !request.errors_allowed && !output.is_empty() {
                    self.logger.error(&output);
                }
            }
        }

        (kind.is_success(), kind, output)
    }

    /// Build the envelope from an execution.
    fn envelope(
        &self,
        operation: Operation,
        success: bool,
        output: &str,
        msg: Option<String>,
    ) -> OpResult {
        let filtered = if operation.has_binary_output() {
            output.to_string()
        } else {
            output::filter_noise(output)
        };

        let mut result = if success {
            let mut envelope = OpResult::success(operation);
            if let Some(msg) = msg {
                self.logger.info(&msg);
            }
            if !filtered.is_empty() {
                envelope = envelope.with_output_lines(output::parse_output_lines(
                    &filtered,
                    operation == Operation::Ls && self.struct_output,
                ));
            }
            envelope
        } else {
            let reason = msg.unwrap_or_else(|| "backend failed operation".to_string());
            self.logger.error(&reason);
            let mut envelope = OpResult::failure(operation, reason);
            if !filtered.is_empty() {
                envelope = envelope.with_output(
                    serde_json::from_str(&filtered)
                        .unwrap_or_else(|_| serde_json::json!({ "data": filtered })),
                );
            }
            envelope
        };
        let (errors, warnings) = self.logger.drain_annotations();
        result.annotate(errors, warnings);
        result
    }

    // -- operations --------------------------------------------------------

    /// Initialize the repository; "already initialized" counts as success.
    pub async fn init(&mut self, errors_allowed: bool) -> OpResult {
        let command = vec![
            "init".to_string(),
            "--repository-version".to_string(),
            "2".to_string(),
            "--compression".to_string(),
            "auto".to_string(),
        ];
        let (success, _, output) = self
            .execute(Operation::Init, command, true, |request| {
                request.timeout = Some(Duration::from_secs(FAST_COMMANDS_TIMEOUT_SECS));
                request.errors_allowed = errors_allowed;
            })
            .await;

        if success && initialized_marker(&output) {
            self.is_init = Some(true);
            return self.envelope(
                Operation::Init,
                true,
                &output,
                Some("repo initialized successfully".to_string()),
            );
        }
        if already_initialized_marker(&output) {
            self.is_init = Some(true);
            return self.envelope(
                Operation::Init,
                true,
                "",
                Some("repo is already initialized".to_string()),
            );
        }
        if !errors_allowed {
            self.logger.error(&format!("cannot contact repo: {output}"));
        }
        self.is_init = Some(false);
        self.envelope(Operation::Init, false, &output, Some("repo init failed".to_string()))
    }

    /// List snapshots, optionally a single one.
    pub async fn snapshots(&mut self, snapshot_id: Option<&str>, errors_allowed: bool) -> OpResult {
        let mut command = vec!["snapshots".to_string()];
        if let Some(id) = snapshot_id {
            command.push(id.to_string());
        }
        let (success, kind, output) = self
            .execute(Operation::Snapshots, command, self.json_output, |request| {
                request.timeout = Some(Duration::from_secs(FAST_COMMANDS_TIMEOUT_SECS));
                request.errors_allowed = errors_allowed;
            })
            .await;

        if success {
            let mut envelope =
                self.envelope(Operation::Snapshots, true, &output, Some("snapshots listed successfully".into()));
            if let Some(id) = snapshot_id {
                envelope = envelope.with_arg("snapshot_id", id);
            }
            envelope
        } else if errors_allowed && kind == ExitKind::Uninitialized {
            // Probe mode: an uninitialized repo is an answer, not an error.
            let mut envelope = OpResult::success(Operation::Snapshots)
                .with_output(Value::Array(Vec::new()));
            envelope.reason =
                Some("snapshots not listed, perhaps repo is not initialized yet".to_string());
            envelope
        } else {
            self.envelope(
                Operation::Snapshots,
                false,
                &output,
                Some(format!("could not list snapshots:\n{output}")),
            )
        }
    }

    /// List raw repository objects (index, blobs, ...).
    pub async fn list(&mut self, subject: &str) -> OpResult {
        if subject.is_empty() {
            return OpResult::failure(Operation::List, "list expects an object type");
        }
        let command = vec!["list".to_string(), subject.to_string()];
        let (success, _, output) = self
            .execute(Operation::List, command, self.json_output, |_| {})
            .await;
        let msg = if success {
            format!("successfully listed {subject} objects")
        } else {
            format!("failed to list {subject} objects:\n{output}")
        };
        self.envelope(Operation::List, success, &output, Some(msg))
            .with_arg("subject", subject)
    }

    /// List the contents of a snapshot. May produce millions of lines.
    pub async fn ls(&mut self, snapshot: &str) -> OpResult {
        if snapshot.is_empty() {
            return OpResult::failure(Operation::Ls, "ls expects a snapshot id");
        }
        let command = vec!["ls".to_string(), snapshot.to_string()];
        let (success, _, output) = self
            .execute(Operation::Ls, command, self.json_output, |_| {})
            .await;
        let msg = if success {
            format!("successfully listed snapshot {snapshot} content")
        } else {
            format!("could not list snapshot {snapshot} content:\n{output}")
        };
        self.envelope(Operation::Ls, success, &output, Some(msg))
            .with_arg("snapshot", snapshot)
    }

    /// Find a path across snapshots.
    pub async fn find(&mut self, path: &str) -> OpResult {
        if path.is_empty() {
            return OpResult::failure(Operation::Find, "find expects a path");
        }
        let command = vec!["find".to_string(), path.to_string()];
        let (success, _, output) = self
            .execute(Operation::Find, command, self.json_output, |_| {})
            .await;
        let msg = if success {
            format!("found path {path}")
        } else {
            format!("could not find path {path}:\n{output}")
        };
        self.envelope(Operation::Find, success, &output, Some(msg))
            .with_arg("path", path)
    }

    /// Run a backup. The repository is auto-initialized on first use.
    pub async fn backup(&mut self, request: &BackupRequest) -> OpResult {
        if self.is_init != Some(true) {
            self.init(true).await;
        }

        let Some(source) = &request.source else {
            return OpResult::failure(Operation::Backup, "no backup source given");
        };

        self.preflight_source(source);

        let (mut command, stdin_data) = self.backup_args(request, source).await;

        // The cloud-file workaround needs text output; the envelope wraps
        // text lines regardless.
        let (mut success, _, mut output) = self
            .execute(Operation::Backup, command.clone(), false, |req| {
                req.stdin_data = stdin_data.clone();
            })
            .await;

        // VSS snapshots silently fail on some volumes; retry without.
        if !success
            && request.use_fs_snapshot
            && output.to_lowercase().contains("vss error")
        {
            self.logger
                .error("VSS cannot be used, backup will be done without VSS");
            command.retain(|arg| arg != "--use-fs-snapshot");
            let retried = self
                .execute(Operation::Backup, command, false, |req| {
                    req.stdin_data = stdin_data.clone();
                })
                .await;
            success = retried.0;
            output = retried.2;
        }

        self.last_backup_output = Some(output.clone());
        let msg = if success {
            "backend finished with success".to_string()
        } else {
            format!("backend failed operation:\n{output}")
        };
        self.envelope(Operation::Backup, success, &output, Some(msg))
    }

    async fn backup_args(
        &mut self,
        request: &BackupRequest,
        source: &BackupSource,
    ) -> (Vec<String>, Option<Vec<u8>>) {
        let mut command = vec!["backup".to_string()];
        let mut stdin_data = None;
        let case_insensitive = cfg!(windows) || request.excludes_case_ignore;
        let exclude_flag = if case_insensitive { "--iexclude" } else { "--exclude" };
        let exclude_file_flag = if case_insensitive {
            "--iexclude-file"
        } else {
            "--exclude-file"
        };

        let file_source = match source {
            BackupSource::FolderList(paths) => {
                // No ETA scan needed; strip trailing separators except for
                // the filesystem root.
                command.push("--no-scan".to_string());
                for path in paths {
                    if path == "/" {
                        command.push(path.clone());
                    } else {
                        command.push(path.trim_end_matches(['/', '\\']).to_string());
                    }
                }
                true
            }
            BackupSource::FilesFrom(paths) => {
                for path in paths {
                    command.push("--files-from".to_string());
                    command.push(path.clone());
                }
                true
            }
            BackupSource::FilesFromVerbatim(paths) => {
                for path in paths {
                    command.push("--files-from-verbatim".to_string());
                    command.push(path.clone());
                }
                true
            }
            BackupSource::FilesFromRaw(paths) => {
                for path in paths {
                    command.push("--files-from-raw".to_string());
                    command.push(path.clone());
                }
                true
            }
            BackupSource::Stdin(data) => {
                command.push("--stdin".to_string());
                command.push("--stdin-filename".to_string());
                command.push(
                    request
                        .stdin_filename
                        .clone()
                        .unwrap_or_else(|| "stdin.data".to_string()),
                );
                stdin_data = Some(data.clone());
                false
            }
            BackupSource::StdinFromCommand(inner) => {
                command.push("--stdin-filename".to_string());
                command.push(
                    request
                        .stdin_filename
                        .clone()
                        .unwrap_or_else(|| "stdin.data".to_string()),
                );
                command.push("--stdin-from-command".to_string());
                command.push("--".to_string());
                command.extend(inner.split_whitespace().map(str::to_string));
                false
            }
        };

        if file_source {
            for pattern in &request.exclude_patterns {
                if !pattern.is_empty() {
                    command.push(exclude_flag.to_string());
                    command.push(pattern.clone());
                }
            }
            for exclude_file in &request.exclude_files {
                if exclude_file.is_empty() {
                    continue;
                }
                match resolve_exclude_file(exclude_file) {
                    Some(resolved) => {
                        command.push(exclude_file_flag.to_string());
                        command.push(resolved);
                    }
                    None => {
                        self.logger
                            .error(&format!("exclude file '{exclude_file}' not found"));
                    }
                }
            }
            if request.exclude_caches {
                command.push("--exclude-caches".to_string());
            }
            if let Some(larger_than) = &request.exclude_files_larger_than {
                match larger_than.parse::<ByteSize>() {
                    Ok(size) if size.bytes() > 0 => {
                        command.push("--exclude-larger-than".to_string());
                        command.push(size.bytes().to_string());
                    }
                    Ok(_) => {}
                    Err(_) => {
                        self.logger.warning(&format!(
                            "bogus unit for exclude_files_larger_than value given: {larger_than}"
                        ));
                    }
                }
            }
            if request.one_file_system {
                command.push("--one-file-system".to_string());
            }
            if request.use_fs_snapshot {
                if cfg!(windows) {
                    command.push("--use-fs-snapshot".to_string());
                    self.logger.info("using VSS snapshot to backup");
                } else {
                    self.logger.warning(
                        "parameter use_fs_snapshot was given, which is only compatible with Windows",
                    );
                }
            }
        }

        for tag in &request.tags {
            let tag = tag.trim();
            if !tag.is_empty() {
                command.push("--tag".to_string());
                command.push(tag.to_string());
            }
        }
        if let Some(extra) = &request.additional_backup_only_parameters {
            command.extend(extra.split_whitespace().map(str::to_string));
        }

        // Only restic >= 0.18 understands this flag, and only Windows
        // needs it.
        if self.ignore_cloud_files && cfg!(windows) {
            if let Some(version) = self.binary_version().await {
                if binary::version_at_least(&version, 0, 18) {
                    command.push("--exclude-cloud-files".to_string());
                }
            }
        }

        (command, stdin_data)
    }

    /// Verify that backup sources exist and are readable before invoking
    /// the backend, which reports missing sources poorly. Failures are
    /// logged as errors but do not abort the backup.
    fn preflight_source(&self, source: &BackupSource) {
        let mut must_be_readable: Vec<String> = Vec::new();
        match source {
            BackupSource::FolderList(paths) => {
                must_be_readable.extend(paths.iter().cloned());
            }
            BackupSource::FilesFromVerbatim(list_files) | BackupSource::FilesFromRaw(list_files) => {
                let strip_nul = matches!(source, BackupSource::FilesFromRaw(_));
                for list_file in list_files {
                    match std::fs::read_to_string(list_file) {
                        Ok(content) => {
                            for entry in content.lines() {
                                let entry = if strip_nul {
                                    entry.trim_matches('\0')
                                } else {
                                    entry
                                };
                                must_be_readable.push(entry.trim().to_string());
                            }
                        }
                        Err(e) => {
                            self.logger
                                .error(&format!("cannot open file {list_file} for reading: {e}"));
                        }
                    }
                }
            }
            _ => return,
        }

        for path in must_be_readable {
            if path.is_empty() {
                continue;
            }
            let candidate = Path::new(&path);
            let readable = candidate.exists()
                && (candidate.is_dir() || std::fs::File::open(candidate).is_ok());
            if !readable {
                self.logger
                    .error(&format!("path {path} does not exist or is not readable"));
            }
        }
    }

    /// Restore a snapshot into a target directory.
    pub async fn restore(
        &mut self,
        snapshot: &str,
        target: &str,
        includes: &[String],
        additional_restore_only_parameters: Option<&str>,
    ) -> OpResult {
        let include_flag = if cfg!(windows) { "--iinclude" } else { "--include" };
        let mut command = vec!["restore".to_string(), snapshot.to_string()];
        if let Some(extra) = additional_restore_only_parameters {
            command.extend(extra.split_whitespace().map(str::to_string));
        }
        command.push("--target".to_string());
        command.push(target.to_string());
        for include in includes {
            if !include.is_empty() {
                command.push(include_flag.to_string());
                command.push(include.clone());
            }
        }
        let (success, _, output) = self
            .execute(Operation::Restore, command, self.json_output, |_| {})
            .await;
        let msg = if success {
            "successfully restored data".to_string()
        } else {
            format!("data not restored:\n{output}")
        };
        self.envelope(Operation::Restore, success, &output, Some(msg))
            .with_arg("snapshot", snapshot)
            .with_arg("target", target)
    }

    /// Forget snapshots by id or by translated policy.
    pub async fn forget(&mut self, target: &ForgetTarget) -> OpResult {
        let commands: Vec<Vec<String>> = match target {
            ForgetTarget::Snapshots(snapshots) => {
                if snapshots.is_empty() {
                    return OpResult::failure(
                        Operation::Forget,
                        "no valid snapshot or policy defined for forget",
                    );
                }
                snapshots
                    .iter()
                    .map(|snapshot| vec!["forget".to_string(), snapshot.clone()])
                    .collect()
            }
            ForgetTarget::Policy {
                keep_flags,
                keep_tags,
                apply_on_tags,
                group_by,
            } => {
                if keep_flags.is_empty() && keep_tags.is_empty() {
                    return OpResult::failure(
                        Operation::Forget,
                        "no valid snapshot or policy defined for forget",
                    );
                }
                let mut command = vec!["forget".to_string()];
                for (flag, value) in keep_flags {
                    command.push(format!("--{flag}"));
                    command.push(value.clone());
                }
                for tag in keep_tags {
                    if !tag.is_empty() {
                        command.push("--keep-tag".to_string());
                        command.push(tag.clone());
                    }
                }
                for tag in apply_on_tags {
                    if !tag.is_empty() {
                        command.push("--tag".to_string());
                        command.push(tag.clone());
                    }
                }
                if !group_by.is_empty() {
                    command.push("--group-by".to_string());
                    command.push(group_by.join(","));
                }
                vec![command]
            }
        };

        // Server-side errors must stay visible even when the client keeps
        // deleting.
        let verbose = self.verbose;
        self.verbose = true;
        let mut batch_success = true;
        let mut batch_output = String::new();
        let is_policy = matches!(target, ForgetTarget::Policy { .. });
        for command in commands {
            let (success, _, output) = self
                .execute(Operation::Forget, command, self.json_output, |_| {})
                .await;
            if success {
                // restic exits 0 even when the snapshot id does not exist.
                if output.contains("no matching ID found for prefix") {
                    self.logger
                        .warning(&format!("snapshot not found for forget command:\n{output}"));
                    batch_success = false;
                    batch_output.push_str(&output);
                } else {
                    let msg = if is_policy {
                        "successfully applied retention policy"
                    } else {
                        "successfully forgot snapshot"
                    };
                    self.logger.info(msg);
                    batch_output.push('\n');
                    batch_output.push_str(msg);
                }
            } else {
                self.logger.error(&format!("forget failed\n{output}"));
                batch_success = false;
                batch_output.push_str(&output);
            }
        }
        self.verbose = verbose;
        self.envelope(Operation::Forget, batch_success, &batch_output, None)
    }

    /// Prune unreferenced data.
    pub async fn prune(
        &mut self,
        max_unused: Option<&str>,
        max_repack_size: Option<&str>,
    ) -> OpResult {
        let mut command = vec!["prune".to_string()];
        if let Some(max_unused) = max_unused {
            // Accepts either a percentage or a byte size.
            if let Some(percent) = parse_percent(max_unused) {
                command.push("--max-unused".to_string());
                command.push(format!("{percent}%"));
            } else {
                match max_unused.parse::<ByteSize>() {
                    Ok(size) => {
                        command.push("--max-unused".to_string());
                        command.push(size.bytes().to_string());
                    }
                    Err(_) => {
                        self.logger
                            .warning(&format!("bogus unit for max_unused value given: {max_unused}"));
                    }
                }
            }
        }
        if let Some(max_repack_size) = max_repack_size {
            match max_repack_size.parse::<ByteSize>() {
                Ok(size) => {
                    command.push("--max-repack-size".to_string());
                    command.push(size.bytes().to_string());
                }
                Err(_) => {
                    self.logger.warning(&format!(
                        "bogus unit for max_repack_size value given: {max_repack_size}"
                    ));
                }
            }
        }
        let verbose = self.verbose;
        self.verbose = true;
        let (success, _, output) = self
            .execute(Operation::Prune, command, self.json_output, |_| {})
            .await;
        self.verbose = verbose;
        let msg = if success {
            "successfully pruned repository".to_string()
        } else {
            "could not prune repository".to_string()
        };
        self.envelope(Operation::Prune, success, &output, Some(msg))
    }

    /// Verify repository consistency.
    pub async fn check(&mut self, read_data: bool) -> OpResult {
        let mut command = vec!["check".to_string()];
        if read_data {
            command.push("--read-data".to_string());
        }
        let (success, _, output) = self
            .execute(Operation::Check, command, self.json_output, |_| {})
            .await;
        let msg = if success {
            "repo checked successfully".to_string()
        } else {
            "repo check failed".to_string()
        };
        self.envelope(Operation::Check, success, &output, Some(msg))
            .with_arg("read_data", read_data)
    }

    /// Repair repository structures.
    pub async fn repair(&mut self, subject: RepairSubject, pack_ids: Option<&str>) -> OpResult {
        let mut command = vec!["repair".to_string(), subject.as_str().to_string()];
        if let Some(pack_ids) = pack_ids {
            command.extend(pack_ids.split_whitespace().map(str::to_string));
        }
        let (success, _, output) = self
            .execute(Operation::Repair, command, self.json_output, |_| {})
            .await;
        let msg = if success {
            format!("repo successfully repaired:\n{output}")
        } else {
            format!("repo repair failed:\n{output}")
        };
        self.envelope(Operation::Repair, success, &output, Some(msg))
            .with_arg("subject", subject.as_str())
    }

    /// Recover orphaned data into new snapshots.
    pub async fn recover(&mut self) -> OpResult {
        let (success, _, output) = self
            .execute(Operation::Recover, vec!["recover".to_string()], self.json_output, |_| {})
            .await;
        let msg = if success {
            "recovery finished".to_string()
        } else {
            format!("recovery failed:\n{output}")
        };
        self.envelope(Operation::Recover, success, &output, Some(msg))
    }

    /// Remove stale repository locks.
    pub async fn unlock(&mut self) -> OpResult {
        let (success, _, output) = self
            .execute(Operation::Unlock, vec!["unlock".to_string()], self.json_output, |_| {})
            .await;
        let msg = if success {
            "repo successfully unlocked".to_string()
        } else {
            format!("repo unlock failed:\n{output}")
        };
        self.envelope(Operation::Unlock, success, &output, Some(msg))
    }

    /// Dump a file from a snapshot to stdout.
    pub async fn dump(&mut self, snapshot: &str, path: &str) -> OpResult {
        let command = vec!["dump".to_string(), snapshot.to_string(), path.to_string()];
        let (success, _, output) = self
            .execute(Operation::Dump, command, false, |_| {})
            .await;
        let msg = if success {
            format!("file {path} successfully dumped")
        } else {
            format!("cannot dump file {path}:\n{output}")
        };
        self.envelope(Operation::Dump, success, &output, Some(msg))
            .with_arg("snapshot", snapshot)
            .with_arg("path", path)
    }

    /// Repository statistics.
    pub async fn stats(&mut self, subject: Option<&str>) -> OpResult {
        let mut command = vec!["stats".to_string()];
        if let Some(subject) = subject {
            command.extend(subject.split_whitespace().map(str::to_string));
        }
        let (success, _, output) = self
            .execute(Operation::Stats, command, self.json_output, |_| {})
            .await;
        let msg = if success {
            "repo statistics command success".to_string()
        } else {
            format!("cannot get repo statistics:\n{output}")
        };
        self.envelope(Operation::Stats, success, &output, Some(msg))
    }

    /// Run a raw backend command without interpretation.
    pub async fn raw(&mut self, command_line: &str) -> OpResult {
        let command: Vec<String> = command_line.split_whitespace().map(str::to_string).collect();
        let (success, _, output) = self
            .execute(Operation::Raw, command, self.json_output, |_| {})
            .await;
        let msg = if success {
            format!("successfully run raw command:\n{output}")
        } else {
            format!("raw command failed:\n{output}")
        };
        self.envelope(Operation::Raw, success, &output, Some(msg))
            .with_arg("command", command_line)
    }

    /// Probe for a snapshot younger than `delta_minutes`.
    pub async fn has_recent_snapshot(&mut self, delta_minutes: i64) -> RecentSnapshot {
        if delta_minutes == 0 {
            return RecentSnapshot::NoSnapshots;
        }
        // Force JSON for this probe regardless of the display setting.
        let json_output = self.json_output;
        self.json_output = true;
        let result = self.snapshots(Some("latest"), true).await;
        self.json_output = json_output;

        if !result.result {
            return RecentSnapshot::Unknown;
        }
        let snapshots = result.output_as_array();
        evaluate_recent(&snapshots, delta_minutes, Utc::now().fixed_offset())
    }
}

/// Recent-snapshot decision over a parsed snapshot list; the newest entry
/// comes last.
pub fn evaluate_recent(
    snapshots: &[Value],
    delta_minutes: i64,
    now: DateTime<FixedOffset>,
) -> RecentSnapshot {
    let Some(last) = snapshots.last() else {
        return RecentSnapshot::NoSnapshots;
    };
    let Some(snapshot) = Snapshot::from_value(last) else {
        return RecentSnapshot::NoSnapshots;
    };
    let Some(timestamp) = snapshot.timestamp() else {
        debug!("cannot parse snapshot time from latest snapshot");
        return RecentSnapshot::NoSnapshots;
    };
    let age_minutes = (now - timestamp).num_seconds() as f64 / 60.0;
    if (delta_minutes as f64) - age_minutes > 0.0 {
        RecentSnapshot::Recent(timestamp)
    } else {
        RecentSnapshot::TooOld(timestamp)
    }
}

fn initialized_marker(output: &str) -> bool {
    output.contains("created restic repository")
        || output.contains("\"message_type\":\"initialized\"")
}

fn already_initialized_marker(output: &str) -> bool {
    let lowered = output.to_lowercase();
    lowered.contains("already exists") || lowered.contains("already initialized")
}

fn parse_rate_limit(value: &str) -> Result<Option<u64>, String> {
    let size = value
        .parse::<ByteSize>()
        .map_err(|e| format!("cannot set rate limit: {e}"))?;
    Ok((size.kib() > 0).then(|| size.kib()))
}

/// Expand a leading `~` to the home directory for local repository paths.
fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{home}/{rest}");
        }
    }
    path.to_string()
}

/// Exclude files that are not directly present are retried under
/// `./excludes/<basename>`.
fn resolve_exclude_file(exclude_file: &str) -> Option<String> {
    let direct = Path::new(exclude_file);
    if direct.is_file() {
        return Some(exclude_file.to_string());
    }
    let basename = direct.file_name()?;
    let fallback = std::env::current_dir().ok()?.join("excludes").join(basename);
    fallback.is_file().then(|| fallback.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn wrapper_for(repository: &str) -> ResticWrapper {
        ResticWrapper::new(
            repository,
            "password",
            Vec::new(),
            OpLogger::new(),
            CancelFlag::new(),
        )
    }

    #[test]
    fn generic_args_include_limits_and_flags() {
        let mut wrapper = wrapper_for("s3:https://host/bucket");
        wrapper.set_limit_upload("800 Mib").unwrap();
        wrapper.set_backend_connections(0);
        wrapper.verbose = true;
        wrapper.no_cache = true;
        let args = wrapper.generic_args(Operation::Backup, true);
        let joined = args.join(" ");
        assert!(joined.contains(&format!("--limit-upload {}", 800 * 1024 / 8)));
        assert!(joined.contains("-o s3.connections=8"));
        assert!(joined.contains("-vv"));
        assert!(joined.contains("--json"));
        assert!(joined.contains("--no-cache"));
        assert!(!joined.contains("--no-lock"));
    }

    #[test]
    fn local_repos_get_no_connection_tuning() {
        let mut wrapper = wrapper_for("/tmp/repo");
        wrapper.set_backend_connections(0);
        let args = wrapper.generic_args(Operation::Backup, false);
        assert!(!args.join(" ").contains("connections"));
    }

    #[test]
    fn read_only_operations_force_no_lock() {
        let wrapper = wrapper_for("/tmp/repo");
        for op in [Operation::Snapshots, Operation::Stats, Operation::Ls] {
            assert!(wrapper.generic_args(op, false).contains(&"--no-lock".to_string()));
        }
        assert!(!wrapper
            .generic_args(Operation::Backup, false)
            .contains(&"--no-lock".to_string()));
    }

    #[test]
    fn dry_run_follows_the_subcommand() {
        let mut wrapper = wrapper_for("/tmp/repo");
        wrapper.dry_run = true;
        let args = wrapper.full_args(
            Operation::Backup,
            vec!["backup".to_string(), "/etc".to_string()],
            false,
        );
        let backup_pos = args.iter().position(|a| a == "backup").unwrap();
        assert_eq!(args[backup_pos + 1], "--dry-run");

        // Unsupported operations never get the flag.
        let args = wrapper.full_args(
            Operation::Snapshots,
            vec!["snapshots".to_string()],
            false,
        );
        assert!(!args.contains(&"--dry-run".to_string()));
    }

    #[test]
    fn backend_connection_defaults() {
        let mut local = wrapper_for("/tmp/repo");
        local.set_backend_connections(0);
        assert_eq!(local.backend_connections, Some(2));

        let mut remote = wrapper_for("sftp:user@host:/srv");
        remote.set_backend_connections(0);
        assert_eq!(remote.backend_connections, Some(8));

        let mut explicit = wrapper_for("/tmp/repo");
        explicit.set_backend_connections(4);
        assert_eq!(explicit.backend_connections, Some(4));
    }

    #[test]
    fn rate_limit_zero_means_unlimited() {
        let mut wrapper = wrapper_for("/tmp/repo");
        wrapper.set_limit_download("0 Mib").unwrap();
        assert_eq!(wrapper.limit_download_kib, None);
        assert!(wrapper.set_limit_upload("garbage").is_err());
    }

    #[tokio::test]
    async fn backup_args_for_folder_list() {
        let mut wrapper = wrapper_for("/tmp/repo");
        let request = BackupRequest {
            source: Some(BackupSource::FolderList(vec![
                "/etc/".to_string(),
                "/".to_string(),
            ])),
            exclude_patterns: vec!["*.tmp".to_string()],
            exclude_caches: true,
            exclude_files_larger_than: Some("1 MiB".to_string()),
            one_file_system: true,
            tags: vec!["nightly".to_string(), " ".to_string()],
            ..Default::default()
        };
        let (args, stdin) = wrapper
            .backup_args(&request, request.source.as_ref().unwrap())
            .await;
        assert!(stdin.is_none());
        let joined = args.join(" ");
        assert!(joined.starts_with("backup --no-scan /etc /"));
        assert!(joined.contains("--exclude *.tmp") || joined.contains("--iexclude *.tmp"));
        assert!(joined.contains("--exclude-caches"));
        assert!(joined.contains("--exclude-larger-than 1048576"));
        assert!(joined.contains("--one-file-system"));
        assert!(joined.contains("--tag nightly"));
        // Blank tags are dropped.
        assert_eq!(args.iter().filter(|a| *a == "--tag").count(), 1);
    }

    #[tokio::test]
    async fn backup_args_for_files_from_variants() {
        let mut wrapper = wrapper_for("/tmp/repo");
        for (source, flag) in [
            (BackupSource::FilesFrom(vec!["list".into()]), "--files-from"),
            (
                BackupSource::FilesFromVerbatim(vec!["list".into()]),
                "--files-from-verbatim",
            ),
            (
                BackupSource::FilesFromRaw(vec!["list".into()]),
                "--files-from-raw",
            ),
        ] {
            let request = BackupRequest {
                source: Some(source.clone()),
                ..Default::default()
            };
            let (args, _) = wrapper.backup_args(&request, &source).await;
            assert!(args.contains(&flag.to_string()), "missing {flag}");
            assert!(!args.contains(&"--no-scan".to_string()));
        }
    }

    #[tokio::test]
    async fn backup_args_for_stdin_sources() {
        let mut wrapper = wrapper_for("/tmp/repo");
        let source = BackupSource::Stdin(b"payload".to_vec());
        let request = BackupRequest {
            source: Some(source.clone()),
            stdin_filename: Some("db.dump".to_string()),
            ..Default::default()
        };
        let (args, stdin) = wrapper.backup_args(&request, &source).await;
        assert!(args.contains(&"--stdin".to_string()));
        assert!(args.contains(&"db.dump".to_string()));
        assert_eq!(stdin, Some(b"payload".to_vec()));

        let source = BackupSource::StdinFromCommand("pg_dump mydb".to_string());
        let request = BackupRequest {
            source: Some(source.clone()),
            ..Default::default()
        };
        let (args, stdin) = wrapper.backup_args(&request, &source).await;
        assert!(stdin.is_none());
        let joined = args.join(" ");
        assert!(joined.contains("--stdin-from-command -- pg_dump mydb"));
        assert!(joined.contains("--stdin-filename stdin.data"));
    }

    #[test]
    fn recent_snapshot_evaluation() {
        let now = chrono::FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2024, 6, 1, 12, 0, 0)
            .unwrap();
        let fresh = json!([{"id": "a", "time": "2024-06-01T11:30:00+00:00"}]);
        let stale = json!([{"id": "a", "time": "2024-05-01T11:30:00+00:00"}]);

        match evaluate_recent(fresh.as_array().unwrap(), 60, now) {
            RecentSnapshot::Recent(ts) => {
                assert_eq!(ts.to_rfc3339(), "2024-06-01T11:30:00+00:00");
            }
            other => panic!("expected recent, got {other:?}"),
        }
        assert!(matches!(
            evaluate_recent(stale.as_array().unwrap(), 60, now),
            RecentSnapshot::TooOld(_)
        ));
        assert_eq!(
            evaluate_recent(&[], 60, now),
            RecentSnapshot::NoSnapshots
        );
    }

    #[test]
    fn recent_snapshot_is_monotone_in_delta() {
        let now = chrono::FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2024, 6, 1, 12, 0, 0)
            .unwrap();
        let list = json!([{"id": "a", "time": "2024-06-01T10:00:00+00:00"}]);
        let snapshots = list.as_array().unwrap();

        let mut was_recent = false;
        for delta in [30, 60, 90, 121, 500] {
            let recent = matches!(
                evaluate_recent(snapshots, delta, now),
                RecentSnapshot::Recent(_)
            );
            // Once recent at some delta, larger deltas stay recent.
            assert!(!was_recent || recent, "monotonicity violated at delta {delta}");
            was_recent = recent;
        }
        assert!(was_recent);
    }

    #[test]
    fn epoch_timestamp_is_year_one() {
        assert_eq!(RecentSnapshot::epoch().to_rfc3339(), "0001-01-01T00:00:00+00:00");
    }

    #[test]
    fn initialized_markers() {
        assert!(initialized_marker("created restic repository 8daef59e at /tmp/r"));
        assert!(initialized_marker("{\"message_type\":\"initialized\",\"id\":\"x\"}"));
        assert!(!initialized_marker("nothing"));
        assert!(already_initialized_marker(
            "Fatal: create repository at /tmp/r failed: config file already exists"
        ));
        assert!(already_initialized_marker("repo is already initialized"));
    }

    #[tokio::test]
    async fn forget_refuses_empty_targets() {
        let mut wrapper = wrapper_for("/tmp/repo");
        let result = wrapper
            .forget(&ForgetTarget::Snapshots(Vec::new()))
            .await;
        assert!(!result.result);

        let result = wrapper
            .forget(&ForgetTarget::Policy {
                keep_flags: Vec::new(),
                keep_tags: Vec::new(),
                apply_on_tags: Vec::new(),
                group_by: Vec::new(),
            })
            .await;
        assert!(!result.result);
    }

    #[tokio::test]
    async fn empty_subjects_are_rejected_without_spawning() {
        let mut wrapper = wrapper_for("/tmp/repo");
        assert!(!wrapper.list("").await.result);
        assert!(!wrapper.ls("").await.result);
        assert!(!wrapper.find("").await.result);
    }

    #[test]
    fn home_expansion_only_touches_tilde_prefix() {
        std::env::set_var("HOME", "/home/tester");
        assert_eq!(expand_home("~/repo"), "/home/tester/repo");
        assert_eq!(expand_home("/tmp/repo"), "/tmp/repo");
    }
}
