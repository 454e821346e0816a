// SPDX-License-Identifier: MIT OR Apache-2.0
//! bhl-runner
//!
//! High-level operation orchestrator: permission gating, the process-wide
//! concurrency gate, pre/post-exec hooks, the NTP drift guard, retention
//! translation, housekeeping composition, metrics emission, and group runs.

pub mod hooks;
pub mod metrics;
pub mod ntp;
pub mod retention;

use bhl_config::{GlobalOptions, RepoView, SourceType};
use bhl_core::units::ByteSize;
use bhl_core::{CancelFlag, INTERNAL_NAME, MAX_ALLOWED_NTP_OFFSET, OpLogger, Operation, OpResult, exit_codes};
use bhl_lock::PidLock;
use bhl_wrapper::{
    BackupRequest, BackupSource, ForgetTarget, OutputSink, RecentSnapshot, RepairSubject,
    ResticWrapper,
};
use ntp::{NtpProbe, SntpProbe, offset_allows_policy};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// One dispatchable operation with its inputs.
#[derive(Debug, Clone)]
pub enum OpRequest {
    Init,
    Backup {
        force: bool,
        stdin_data: Option<Vec<u8>>,
        stdin_filename: Option<String>,
    },
    HasRecentSnapshot,
    Snapshots {
        snapshot_id: Option<String>,
    },
    Stats {
        subject: Option<String>,
    },
    List {
        subject: String,
    },
    Ls {
        snapshot: String,
    },
    Find {
        path: String,
    },
    Restore {
        snapshot: String,
        target: String,
        includes: Vec<String>,
    },
    Dump {
        snapshot: String,
        path: String,
    },
    Check {
        read_data: bool,
    },
    Recover,
    Unlock,
    Repair {
        subject: RepairSubject,
        pack_ids: Option<String>,
    },
    Forget {
        snapshots: Vec<String>,
        use_policy: bool,
    },
    Prune {
        prune_max: bool,
    },
    Housekeeping,
    Raw {
        command: String,
    },
}

impl OpRequest {
    /// The operation this request dispatches to.
    pub fn operation(&self) -> Operation {
        match self {
            OpRequest::Init => Operation::Init,
            OpRequest::Backup { .. } => Operation::Backup,
            OpRequest::HasRecentSnapshot => Operation::HasRecentSnapshot,
            OpRequest::Snapshots { .. } => Operation::Snapshots,
            OpRequest::Stats { .. } => Operation::Stats,
            OpRequest::List { .. } => Operation::List,
            OpRequest::Ls { .. } => Operation::Ls,
            OpRequest::Find { .. } => Operation::Find,
            OpRequest::Restore { .. } => Operation::Restore,
            OpRequest::Dump { .. } => Operation::Dump,
            OpRequest::Check { .. } => Operation::Check,
            OpRequest::Recover => Operation::Recover,
            OpRequest::Unlock => Operation::Unlock,
            OpRequest::Repair { .. } => Operation::Repair,
            OpRequest::Forget { .. } => Operation::Forget,
            OpRequest::Prune { .. } => Operation::Prune,
            OpRequest::Housekeeping => Operation::Housekeeping,
            OpRequest::Raw { .. } => Operation::Raw,
        }
    }
}

/// Orchestrates operations for one repository view.
///
/// The runner owns a deep copy of the view; runtime configuration edits
/// take effect on the next constructed runner, never mid-run.
pub struct Runner {
    view: RepoView,
    options: GlobalOptions,
    audience: String,
    logger: OpLogger,
    cancel: CancelFlag,
    wrapper: Option<ResticWrapper>,
    is_ready: Option<bool>,

    pub dry_run: bool,
    pub verbose: bool,
    pub json_output: bool,
    pub struct_output: bool,
    pub live_output: bool,
    pub no_cache: bool,
    pub produce_metrics: bool,

    binary_override: Option<PathBuf>,
    binary_search_paths: Vec<PathBuf>,
    stdout_sink: Option<OutputSink>,
    stderr_sink: Option<OutputSink>,
    ntp_probe: Arc<dyn NtpProbe>,
    lock_path_override: Option<PathBuf>,
    append_metrics_file: bool,
    last_exec_time: Option<f64>,
}

impl Runner {
    /// Build a runner over a materialized view tree.
    pub fn new(
        view: &Value,
        options: GlobalOptions,
        audience: impl Into<String>,
        logger: OpLogger,
        cancel: CancelFlag,
    ) -> Result<Self, String> {
        let view = RepoView::from_value(view)?;
        Ok(Self {
            view,
            options,
            audience: audience.into(),
            logger,
            cancel,
            wrapper: None,
            is_ready: None,
            dry_run: false,
            verbose: false,
            json_output: false,
            struct_output: false,
            live_output: false,
            no_cache: false,
            produce_metrics: true,
            binary_override: None,
            binary_search_paths: Vec::new(),
            stdout_sink: None,
            stderr_sink: None,
            ntp_probe: Arc::new(SntpProbe),
            lock_path_override: None,
            append_metrics_file: false,
            last_exec_time: None,
        })
    }

    pub fn repo_name(&self) -> &str {
        &self.view.name
    }

    pub fn view(&self) -> &RepoView {
        &self.view
    }

    pub fn logger(&self) -> &OpLogger {
        &self.logger
    }

    pub fn set_binary(&mut self, path: PathBuf) {
        self.binary_override = Some(path);
    }

    pub fn set_binary_search_paths(&mut self, paths: Vec<PathBuf>) {
        self.binary_search_paths = paths;
    }

    pub fn set_sinks(&mut self, stdout: Option<OutputSink>, stderr: Option<OutputSink>) {
        self.stdout_sink = stdout;
        self.stderr_sink = stderr;
    }

    /// Replace the NTP probe (tests).
    pub fn set_ntp_probe(&mut self, probe: Arc<dyn NtpProbe>) {
        self.ntp_probe = probe;
    }

    /// Use an explicit pid-file path for the concurrency gate (tests).
    pub fn set_lock_path(&mut self, path: PathBuf) {
        self.lock_path_override = Some(path);
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
        if let Some(wrapper) = &self.wrapper {
            wrapper.cancel_flag().cancel();
        }
    }

    // -- readiness & config application -------------------------------------

    async fn ensure_ready(&mut self) -> bool {
        if self.wrapper.is_none() {
            self.is_ready = Some(self.create_wrapper().await);
        }
        if self.is_ready != Some(true) {
            return false;
        }
        self.apply_config().await
    }

    async fn create_wrapper(&mut self) -> bool {
        let Some(repository) = self.view.repo_uri.clone().filter(|u| !u.is_empty()) else {
            self.logger.error("repo cannot be empty");
            return false;
        };

        let mut password = self.view.repo_opts.repo_password.clone().unwrap_or_default();
        if password.is_empty() {
            let Some(command) = self
                .view
                .repo_opts
                .repo_password_command
                .clone()
                .filter(|c| !c.is_empty())
            else {
                self.logger
                    .error("no password nor password command given, repo password cannot be empty");
                return false;
            };
            let (success, output) = hooks::run_shell(&command, 30).await;
            if !success || output.is_empty() {
                self.logger
                    .error(&format!("password command failed to produce output:\n{output}"));
                return false;
            }
            if output.trim().contains('\n') {
                self.logger
                    .error("password command returned multiline content instead of a string");
                return false;
            }
            password = output.trim().to_string();
        }

        self.wrapper = Some(ResticWrapper::new(
            repository,
            password,
            self.binary_search_paths.clone(),
            self.logger.clone(),
            self.cancel.clone(),
        ));
        true
    }

    /// Push the current view and display flags into the wrapper. Runs before
    /// every operation so a rebuilt runner always reflects the latest view.
    async fn apply_config(&mut self) -> bool {
        let view = self.view.clone();
        let Some(wrapper) = self.wrapper.as_mut() else {
            return false;
        };

        if let Some(upload) = view.repo_opts.upload_speed.as_deref() {
            if wrapper.set_limit_upload(upload).is_err() {
                self.logger.error("bogus upload limit given");
            }
        }
        if let Some(download) = view.repo_opts.download_speed.as_deref() {
            if wrapper.set_limit_download(download).is_err() {
                self.logger.error("bogus download limit given");
            }
        }
        wrapper.set_backend_connections(view.repo_opts.backend_connections);
        if let Some(priority) = view.backup_opts.priority.as_deref() {
            if wrapper.set_priority(priority).is_err() {
                self.logger.warning("bogus backup priority in config file");
            }
        }
        wrapper.ignore_cloud_files = view.backup_opts.ignore_cloud_files;
        wrapper.set_additional_parameters(view.backup_opts.additional_parameters.clone());
        wrapper.set_env_variables(
            view.env.env_variables.clone(),
            view.env.encrypted_env_variables.clone(),
        );

        wrapper.verbose = self.verbose;
        wrapper.dry_run = self.dry_run;
        wrapper.no_cache = self.no_cache;
        wrapper.live_output = self.live_output;
        wrapper.json_output = self.json_output;
        wrapper.struct_output = self.struct_output;
        wrapper.set_sinks(self.stdout_sink.clone(), self.stderr_sink.clone());

        if let Some(binary) = &self.binary_override {
            if wrapper.set_binary(binary.clone()).is_err() {
                self.logger
                    .error(&format!("backend binary {} is not readable", binary.display()));
                self.is_ready = Some(false);
                return false;
            }
        } else if !wrapper.detect_binary() {
            self.logger.error("no backend binary found");
            self.is_ready = Some(false);
            return false;
        }
        true
    }

    // -- gated execution ----------------------------------------------------

    /// Run one operation through the full gating pipeline.
    pub async fn run(&mut self, request: OpRequest) -> OpResult {
        self.run_gated(request, true).await
    }

    async fn run_gated(&mut self, request: OpRequest, check_concurrency: bool) -> OpResult {
        let operation = request.operation();

        // Permission gate: refusal is an answer, not a crash.
        if !operation.permitted(self.view.permissions) {
            self.logger.critical(&format!(
                "required permissions for operation '{operation}' must be one of {}, current permission is '{}'",
                operation
                    .allowed_permissions()
                    .iter()
                    .map(|p| p.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
                self.view.permissions
            ));
            return OpResult::failure(operation, "Not enough permissions");
        }

        // Readiness: missing binary, URI or password short-circuits.
        if !self.ensure_ready().await {
            return OpResult::failure(operation, "Runner cannot execute, backend not ready");
        }

        // Process-wide concurrency gate for mutating operations.
        let _gate = if check_concurrency
            && operation.is_locking()
            && !self.options.full_concurrency
        {
            let lock = match &self.lock_path_override {
                Some(path) => PidLock::acquire_at(path),
                None => {
                    let identifier = self
                        .options
                        .repo_aware_concurrency
                        .then(|| self.view.name.clone());
                    PidLock::acquire(INTERNAL_NAME, identifier.as_deref())
                }
            };
            match lock {
                Ok(lock) => Some(lock),
                Err(e) => {
                    self.logger.critical(&format!(
                        "there is already an operation running, will not launch {operation} to avoid concurrency: {e}"
                    ));
                    return OpResult::failure(operation, "refused to avoid concurrency")
                        .with_arg("exit_code", exit_codes::ALREADY_RUNNING);
                }
            }
        } else {
            None
        };

        let start = Instant::now();
        let mut result = self.dispatch(request).await;
        let exec_time = start.elapsed().as_secs_f64();
        self.last_exec_time = Some(exec_time);
        result.exec_time = Some(exec_time);
        self.logger
            .info(&format!("runner took {exec_time:.2} seconds for {operation}"));

        if self.produce_metrics && operation != Operation::HasRecentSnapshot {
            let backup_output = self
                .wrapper
                .as_mut()
                .and_then(|wrapper| wrapper.take_backup_output());
            metrics::analyse_and_emit(
                &self.view,
                operation,
                result.result,
                backup_output.as_deref(),
                result.exec_time,
                self.dry_run,
                self.append_metrics_file,
                &self.audience,
                &self.logger,
                false,
            )
            .await;
            self.append_metrics_file = true;
        } else {
            debug!("metrics disabled for call {operation}");
        }

        result
    }

    async fn dispatch(&mut self, request: OpRequest) -> OpResult {
        match request {
            OpRequest::Init => {
                self.logger
                    .info(&format!("initializing repo {}", self.view.name));
                self.wrapper_mut().init(false).await
            }
            OpRequest::Snapshots { snapshot_id } => {
                self.logger
                    .info(&format!("listing snapshots of repo {}", self.view.name));
                self.wrapper_mut().snapshots(snapshot_id.as_deref(), false).await
            }
            OpRequest::Stats { subject } => {
                self.logger
                    .info(&format!("getting stats of repo {}", self.view.name));
                self.wrapper_mut().stats(subject.as_deref()).await
            }
            OpRequest::List { subject } => {
                self.logger.info(&format!(
                    "listing {subject} objects of repo {}",
                    self.view.name
                ));
                self.wrapper_mut().list(&subject).await
            }
            OpRequest::Ls { snapshot } => {
                self.logger.info(&format!(
                    "showing content of snapshot {snapshot} in repo {}",
                    self.view.name
                ));
                self.wrapper_mut().ls(&snapshot).await
            }
            OpRequest::Find { path } => {
                self.logger.info(&format!(
                    "searching for path {path} in repo {}",
                    self.view.name
                ));
                self.wrapper_mut().find(&path).await
            }
            OpRequest::Restore {
                snapshot,
                target,
                includes,
            } => {
                self.logger.info(&format!("launching restore to {target}"));
                let extra = self
                    .view
                    .backup_opts
                    .additional_restore_only_parameters
                    .clone();
                self.wrapper_mut()
                    .restore(&snapshot, &target, &includes, extra.as_deref())
                    .await
            }
            OpRequest::Dump { snapshot, path } => {
                self.logger.info(&format!(
                    "dumping {path} from {} snapshot {snapshot}",
                    self.view.name
                ));
                self.wrapper_mut().dump(&snapshot, &path).await
            }
            OpRequest::Check { read_data } => {
                if read_data {
                    self.logger.info(&format!(
                        "running full data check of repository {}",
                        self.view.name
                    ));
                } else {
                    self.logger.info(&format!(
                        "running metadata consistency check of repository {}",
                        self.view.name
                    ));
                }
                self.wrapper_mut().check(read_data).await
            }
            OpRequest::Recover => {
                self.logger.info(&format!(
                    "recovering snapshots in repo {}",
                    self.view.name
                ));
                self.wrapper_mut().recover().await
            }
            OpRequest::Unlock => {
                self.logger
                    .info(&format!("unlocking repo {}", self.view.name));
                self.wrapper_mut().unlock().await
            }
            OpRequest::Repair { subject, pack_ids } => {
                self.logger
                    .info(&format!("repairing repo {}", self.view.name));
                self.wrapper_mut().repair(subject, pack_ids.as_deref()).await
            }
            OpRequest::Raw { command } => {
                self.logger.info(&format!("running raw command: {command}"));
                self.wrapper_mut().raw(&command).await
            }
            OpRequest::Prune { prune_max } => self.prune_impl(prune_max).await,
            OpRequest::Forget {
                snapshots,
                use_policy,
            } => self.forget_impl(snapshots, use_policy).await,
            OpRequest::HasRecentSnapshot => self.has_recent_impl().await,
            OpRequest::Backup {
                force,
                stdin_data,
                stdin_filename,
            } => self.backup_impl(force, stdin_data, stdin_filename).await,
            OpRequest::Housekeeping => self.housekeeping_impl().await,
        }
    }

    fn wrapper_mut(&mut self) -> &mut ResticWrapper {
        self.wrapper
            .as_mut()
            .expect("ensure_ready ran before dispatch")
    }

    // -- operation bodies ---------------------------------------------------

    async fn has_recent_impl(&mut self) -> OpResult {
        let minimum_backup_age = self.view.repo_opts.minimum_backup_age;
        if minimum_backup_age == 0 {
            self.logger.info("no minimal backup age set");
        }
        self.logger.info(&format!(
            "searching for a backup newer than {minimum_backup_age} minutes ago"
        ));

        let wrapper = self.wrapper_mut();
        // The probe needs neither verbosity nor live echo.
        let verbose = wrapper.verbose;
        let live_output = wrapper.live_output;
        wrapper.verbose = false;
        wrapper.live_output = false;
        let status = wrapper.has_recent_snapshot(minimum_backup_age as i64).await;
        let wrapper = self.wrapper_mut();
        wrapper.verbose = verbose;
        wrapper.live_output = live_output;

        match status {
            RecentSnapshot::Recent(ts) => {
                self.logger.info(&format!(
                    "most recent backup in repo {} is from {ts}",
                    self.view.name
                ));
                OpResult::success(Operation::HasRecentSnapshot)
                    .with_output(serde_json::json!(ts.to_rfc3339()))
            }
            RecentSnapshot::NoSnapshots => {
                self.logger
                    .info(&format!("no snapshots found in repo {}", self.view.name));
                let mut result = OpResult::failure(Operation::HasRecentSnapshot, "no snapshots");
                result.output =
                    Some(serde_json::json!(RecentSnapshot::epoch().to_rfc3339()));
                result
            }
            RecentSnapshot::TooOld(ts) => {
                self.logger.info(&format!(
                    "no recent backup found in repo {}, newest is from {ts}",
                    self.view.name
                ));
                let mut result =
                    OpResult::failure(Operation::HasRecentSnapshot, "no recent backup");
                result.output = Some(serde_json::json!(ts.to_rfc3339()));
                result
            }
            RecentSnapshot::Unknown => {
                self.logger
                    .error("cannot connect to repository or repository empty");
                OpResult::failure(Operation::HasRecentSnapshot, "could not check for snapshots")
            }
        }
    }

    async fn prune_impl(&mut self, prune_max: bool) -> OpResult {
        self.logger.info(&format!(
            "pruning snapshots for repo {}{}",
            self.view.name,
            if prune_max { " at maximum efficiency" } else { "" }
        ));
        let max_repack_size = self.view.repo_opts.prune_max_repack_size.clone();
        let max_unused = prune_max
            .then(|| self.view.repo_opts.prune_max_unused.clone())
            .flatten();
        self.wrapper_mut()
            .prune(max_unused.as_deref(), max_repack_size.as_deref())
            .await
    }

    async fn forget_impl(&mut self, snapshots: Vec<String>, use_policy: bool) -> OpResult {
        if !snapshots.is_empty() {
            self.logger
                .info(&format!("forgetting snapshots {snapshots:?}"));
            return self
                .wrapper_mut()
                .forget(&ForgetTarget::Snapshots(snapshots))
                .await;
        }
        if !use_policy {
            self.logger.critical("bogus options given to forget");
            return OpResult::failure(Operation::Forget, "bogus options given to forget");
        }

        let policy = self.view.repo_opts.retention_policy.clone();

        // A skewed clock must never drive a retention policy.
        if let Some(ntp_server) = policy.ntp_server.as_deref().filter(|s| !s.is_empty()) {
            self.logger.info(&format!(
                "checking time against ntp server {ntp_server}"
            ));
            let probe = self.ntp_probe.clone();
            let server = ntp_server.to_string();
            let offset = tokio::task::spawn_blocking(move || probe.offset_seconds(&server))
                .await
                .unwrap_or(None);
            if !offset_allows_policy(offset, MAX_ALLOWED_NTP_OFFSET) {
                let msg = match offset {
                    None => format!("offset cannot be obtained from NTP server {ntp_server}"),
                    Some(offset) => format!(
                        "offset from NTP server {ntp_server} is too high: {offset} seconds, won't apply policy"
                    ),
                };
                self.logger.critical(&msg);
                return OpResult::failure(Operation::Forget, msg);
            }
        }

        if policy.is_empty() {
            let msg = "empty retention policy, won't run";
            self.logger.error(msg);
            return OpResult::failure(Operation::Forget, msg);
        }

        let target = retention::translate_policy(&policy);
        self.logger.info(&format!(
            "forgetting snapshots using retention policy: {target:?}"
        ));
        self.wrapper_mut().forget(&target).await
    }

    async fn backup_impl(
        &mut self,
        force: bool,
        stdin_data: Option<Vec<u8>>,
        stdin_filename: Option<String>,
    ) -> OpResult {
        let opts = self.view.backup_opts.clone();
        let stdin_filename = stdin_filename
            .or_else(|| opts.stdin_filename.clone())
            .unwrap_or_else(|| "stdin.data".to_string());

        // Resolve the backup source.
        let source = if let Some(data) = stdin_data {
            self.logger.info(&format!(
                "running backup of piped stdin data as name {stdin_filename} to repo {}",
                self.view.name
            ));
            BackupSource::Stdin(data)
        } else {
            match opts.source_type {
                Some(SourceType::StdinFromCommand) => {
                    let Some(command) = opts.stdin_from_command.clone().filter(|c| !c.is_empty())
                    else {
                        let msg = "stdin_from_command source type without a command";
                        self.logger.critical(msg);
                        return OpResult::failure(Operation::Backup, msg);
                    };
                    self.logger.info(&format!(
                        "running backup of given command stdout as name {stdin_filename} to repo {}",
                        self.view.name
                    ));
                    BackupSource::StdinFromCommand(command)
                }
                source_type => {
                    let paths: Vec<String> = opts
                        .paths
                        .iter()
                        .map(|p| p.trim().to_string())
                        .filter(|p| !p.is_empty())
                        .collect();
                    if paths.is_empty() {
                        let msg = format!(
                            "no paths to backup defined for repo {}",
                            self.view.name
                        );
                        self.logger.critical(&msg);
                        return OpResult::failure(Operation::Backup, msg);
                    }
                    // Backing a repo into itself can only end badly.
                    if let Some(repo_uri) = &self.view.repo_uri {
                        if paths.iter().any(|p| p == repo_uri) {
                            let msg = format!(
                                "cannot backup source into its own path in repo {}",
                                self.view.name
                            );
                            self.logger.critical(&msg);
                            return OpResult::failure(Operation::Backup, msg);
                        }
                    }
                    self.logger.info(&format!(
                        "running backup of {paths:?} to repo {}",
                        self.view.name
                    ));
                    match source_type {
                        Some(SourceType::FilesFrom) => BackupSource::FilesFrom(paths),
                        Some(SourceType::FilesFromVerbatim) => {
                            BackupSource::FilesFromVerbatim(paths)
                        }
                        Some(SourceType::FilesFromRaw) => BackupSource::FilesFromRaw(paths),
                        _ => BackupSource::FolderList(paths),
                    }
                }
            }
        };

        // Unless forced, a recent enough snapshot makes the backup a no-op.
        if !force {
            let minimum_backup_age = self.view.repo_opts.minimum_backup_age;
            let wrapper = self.wrapper_mut();
            let verbose = wrapper.verbose;
            wrapper.verbose = false;
            let status = wrapper.has_recent_snapshot(minimum_backup_age as i64).await;
            self.wrapper_mut().verbose = verbose;
            if matches!(status, RecentSnapshot::Recent(_)) {
                let msg = "No backup necessary";
                self.logger.info(msg);
                return OpResult::success(Operation::Backup)
                    .with_output(serde_json::json!(msg));
            }
        }

        let pre_success = hooks::exec_commands(
            "Pre",
            &opts.pre_exec_commands,
            opts.pre_exec_per_command_timeout,
            opts.pre_exec_failure_is_fatal,
            &self.logger,
        )
        .await;

        let mut backend_result = None;
        let mut post_success = true;
        if opts.pre_exec_failure_is_fatal && !pre_success {
            // Fatal pre-hook failure aborts before the backend and skips
            // the post hooks entirely.
        } else {
            let request = BackupRequest {
                source: Some(source),
                stdin_filename: Some(stdin_filename),
                exclude_patterns: opts.exclude_patterns.clone(),
                exclude_files: opts.exclude_files.clone(),
                excludes_case_ignore: opts.excludes_case_ignore,
                exclude_caches: opts.exclude_caches,
                exclude_files_larger_than: opts.exclude_files_larger_than.clone(),
                one_file_system: if cfg!(windows) { false } else { opts.one_file_system },
                use_fs_snapshot: opts.use_fs_snapshot,
                tags: opts.tags.clone(),
                additional_backup_only_parameters: opts
                    .additional_backup_only_parameters
                    .clone(),
            };
            let result = self.wrapper_mut().backup(&request).await;

            if result.result || opts.post_exec_execute_even_on_backup_error {
                post_success = hooks::exec_commands(
                    "Post",
                    &opts.post_exec_commands,
                    opts.post_exec_per_command_timeout,
                    opts.post_exec_failure_is_fatal,
                    &self.logger,
                )
                .await;
            } else {
                self.logger
                    .info("skipping post-exec commands after backup failure");
            }
            backend_result = Some(result);
        }

        let backend_success = backend_result.as_ref().map_or(false, |r| r.result);
        let backup_output = self
            .wrapper
            .as_ref()
            .and_then(|wrapper| wrapper.last_backup_output().map(str::to_string));
        let analysis = metrics::analyse_and_emit(
            &self.view,
            Operation::Backup,
            backend_success,
            backup_output.as_deref(),
            self.last_exec_time,
            self.dry_run,
            self.append_metrics_file,
            &self.audience,
            &self.logger,
            true,
        )
        .await;
        if analysis.backup_too_small {
            self.logger
                .error("backup is smaller than configured minimum backup size");
        }

        let operation_result = backend_success
            && analysis.operation_success
            && pre_success
            && post_success
            && !analysis.backup_too_small;
        self.logger.log(
            if operation_result {
                bhl_core::LogLevel::Info
            } else {
                bhl_core::LogLevel::Error
            },
            &format!(
                "operation finished with {}",
                if operation_result { "success" } else { "failure" }
            ),
        );

        if operation_result {
            self.maybe_run_post_backup_housekeeping().await;
        }

        match backend_result {
            Some(mut result) => {
                result.result = operation_result;
                if !operation_result && result.reason.is_none() {
                    result.reason = Some("backup finished with failure".to_string());
                }
                result
            }
            None => OpResult::failure(
                Operation::Backup,
                "fatal pre-execution failure, backup aborted",
            ),
        }
    }

    /// Opportunistic housekeeping after a successful backup, decided by the
    /// scheduler counters. Runs inline: the concurrency gate is already held
    /// by the backup.
    async fn maybe_run_post_backup_housekeeping(&mut self) {
        let chance = self.view.backup_opts.post_backup_housekeeping_percent_chance;
        let interval = self.view.backup_opts.post_backup_housekeeping_interval;
        if chance == 0 && interval == 0 {
            return;
        }
        if !Operation::Housekeeping.permitted(self.view.permissions) {
            self.logger.critical(&format!(
                "required permissions for post backup housekeeping must be one of {}, current permission is '{}'",
                Operation::Housekeeping
                    .allowed_permissions()
                    .iter()
                    .map(|p| p.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
                self.view.permissions
            ));
            return;
        }
        if bhl_sched::schedule_on_chance_or_interval(
            "housekeeping-after-backup",
            chance,
            interval,
        ) {
            self.logger.info("running housekeeping after backup");
            // Boxed to break the async cycle backup -> housekeeping.
            let gated: std::pin::Pin<
                Box<dyn std::future::Future<Output = OpResult> + '_>,
            > = Box::pin(self.run_gated(OpRequest::Housekeeping, false));
            let result = gated.await;
            if !result.result {
                self.logger.error("after backup housekeeping failed");
            }
        }
    }

    /// Composite maintenance: unlock → check → policy forget → prune, each
    /// step short-circuiting the rest.
    async fn housekeeping_impl(&mut self) -> OpResult {
        self.logger.info("running housekeeping");
        let mut detail = BTreeMap::new();

        let unlock_result = self.wrapper_mut().unlock().await;
        let unlock_ok = unlock_result.result;
        detail.insert("unlock".to_string(), unlock_result);

        let mut overall = unlock_ok;
        if unlock_ok {
            let check_result = self.wrapper_mut().check(false).await;
            let check_ok = check_result.result;
            detail.insert("check".to_string(), check_result);
            overall = check_ok;
            if check_ok {
                let forget_result = self.forget_impl(Vec::new(), true).await;
                let forget_ok = forget_result.result;
                detail.insert("forget".to_string(), forget_result);
                overall = forget_ok;
                if forget_ok {
                    let prune_result = self.prune_impl(false).await;
                    overall = prune_result.result;
                    detail.insert("prune".to_string(), prune_result);
                } else {
                    self.logger.error(&format!(
                        "forget failed, won't continue housekeeping on repo {}",
                        self.view.name
                    ));
                }
            } else {
                self.logger.error(&format!(
                    "check failed, won't continue housekeeping on repo {}",
                    self.view.name
                ));
            }
        } else {
            self.logger.error(&format!(
                "unlock failed, won't continue housekeeping on repo {}",
                self.view.name
            ));
        }

        let mut result = if overall {
            OpResult::success(Operation::Housekeeping)
        } else {
            OpResult::failure(Operation::Housekeeping, "housekeeping step failed")
        };
        result.detail = Some(detail);
        result
    }
}

/// Run one operation across several repo views sequentially, checking for
/// cancellation between repositories.
pub async fn group_runner(
    views: Vec<Value>,
    options: GlobalOptions,
    audience: &str,
    request: OpRequest,
    logger: OpLogger,
    cancel: CancelFlag,
    configure: impl Fn(&mut Runner),
) -> OpResult {
    let operation = request.operation();
    let mut group_success = true;
    let mut outputs = Vec::new();

    for view in views {
        if cancel.is_cancelled() {
            logger.info("operations canceled");
            group_success = false;
            break;
        }
        let name = bhl_config::tree::get_path(&view, "name")
            .and_then(Value::as_str)
            .unwrap_or("?")
            .to_string();
        logger.info(&format!("running {operation} for repo {name}"));

        let result = match Runner::new(&view, options.clone(), audience, logger.clone(), cancel.clone())
        {
            Ok(mut runner) => {
                configure(&mut runner);
                runner.run(request.clone()).await
            }
            Err(e) => {
                logger.error(&format!("cannot build runner for repo {name}: {e}"));
                OpResult::failure(operation, e)
            }
        };
        if result.result {
            logger.info(&format!("finished {operation} for repo {name}"));
        } else {
            logger.error(&format!("operation {operation} failed for repo {name}"));
            group_success = false;
        }
        let mut entry = serde_json::Map::new();
        entry.insert(
            name.clone(),
            serde_json::to_value(&result).unwrap_or_default(),
        );
        outputs.push(serde_json::Value::Object(entry));
    }
    logger.info("finished execution of group operations");

    let mut result = if group_success {
        OpResult::success(operation)
    } else {
        OpResult::failure(operation, "at least one repo failed")
    };
    result.output = Some(serde_json::Value::Array(outputs));
    result
}

/// Parse a size string used by prune options, for validation at the CLI
/// boundary.
pub fn validate_size_string(value: &str) -> bool {
    bhl_core::units::parse_percent(value).is_some() || value.parse::<ByteSize>().is_ok()
}
