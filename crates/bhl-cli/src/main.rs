// SPDX-License-Identifier: MIT OR Apache-2.0
//! backhaul command line entry point.

use bhl_config::{ConfigError, ConfigStore};
use bhl_core::{CancelFlag, OpLogger, OpResult, exit_codes};
use bhl_crypto::KeyRing;
use bhl_runner::{OpRequest, Runner, group_runner};
use bhl_wrapper::RepairSubject;
use clap::Parser;
use std::io::Read;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Built-in key for public builds; private deployments override it through
/// the key location/command environment variables.
const DEFAULT_AES_KEY: &str = "bhl-public-default-key-5c41a41a";

#[derive(Parser, Debug)]
#[command(name = "backhaul", version, about = "Operational wrapper around the restic backup engine")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short = 'c', long, default_value = "backhaul.conf")]
    config_file: PathBuf,

    /// Repository to operate on.
    #[arg(long, default_value = "default")]
    repo_name: String,

    /// Operate on every repo of a group (use `__all__` for all repos).
    #[arg(long)]
    repo_group: Option<String>,

    /// Run a backup.
    #[arg(short = 'b', long)]
    backup: bool,

    /// Ignore the minimum backup age check.
    #[arg(short = 'f', long)]
    force: bool,

    /// Restore the selected snapshot into this directory.
    #[arg(short = 'r', long)]
    restore: Option<String>,

    /// Comma-separated include paths for restore.
    #[arg(long)]
    restore_includes: Option<String>,

    /// Snapshot id used by restore/ls/dump.
    #[arg(long, default_value = "latest")]
    snapshot_id: String,

    /// List snapshots.
    #[arg(short = 's', long)]
    snapshots: bool,

    /// List the contents of a snapshot.
    #[arg(long)]
    ls: bool,

    /// List raw repo objects (blobs, packs, index, snapshots, keys, locks).
    #[arg(long)]
    list: Option<String>,

    /// Find a path across snapshots.
    #[arg(long)]
    find: Option<String>,

    /// Forget snapshots: a comma-separated id list, or `policy` to apply
    /// the retention policy.
    #[arg(long)]
    forget: Option<String>,

    /// Initialize the repository.
    #[arg(long)]
    init: bool,

    /// Metadata consistency check.
    #[arg(long)]
    quick_check: bool,

    /// Full data check.
    #[arg(long)]
    full_check: bool,

    /// Prune unreferenced data.
    #[arg(long)]
    prune: bool,

    /// Prune with maximum space reclaim settings.
    #[arg(long)]
    prune_max: bool,

    /// Remove stale repository locks.
    #[arg(long)]
    unlock: bool,

    /// Repair the repository index.
    #[arg(long)]
    repair_index: bool,

    /// Repair repository snapshots.
    #[arg(long)]
    repair_snapshots: bool,

    /// Repair the given pack ids.
    #[arg(long)]
    repair_packs: Option<String>,

    /// Recover orphaned snapshots.
    #[arg(long)]
    recover: bool,

    /// Run unlock, check, policy forget and prune in one go.
    #[arg(long)]
    housekeeping: bool,

    /// Run a raw backend command.
    #[arg(long)]
    raw: Option<String>,

    /// Dump a file from the selected snapshot to stdout.
    #[arg(long)]
    dump: Option<String>,

    /// Repository statistics, with an optional subject argument.
    #[arg(long)]
    stats: bool,

    /// Stats subject (e.g. raw-data, files-by-contents).
    #[arg(long)]
    stats_subject: Option<String>,

    /// Check whether a recent enough snapshot exists; exit code 0 if so.
    #[arg(long)]
    has_recent_snapshot: bool,

    /// Read the backup payload from stdin.
    #[arg(long)]
    stdin: bool,

    /// Filename recorded for stdin backups.
    #[arg(long)]
    stdin_filename: Option<String>,

    /// Show the anonymized materialized configuration and exit.
    #[arg(long)]
    show_config: bool,

    /// Don't modify anything, just show what would happen.
    #[arg(long)]
    dry_run: bool,

    /// Verbose backend output.
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Produce JSON output.
    #[arg(long)]
    json: bool,

    /// Disable the backend cache.
    #[arg(long)]
    no_cache: bool,

    /// Also write logs to this file.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Cli {
    /// Map flags to an operation request, first match wins.
    fn to_request(&self) -> Option<OpRequest> {
        if self.backup || self.stdin {
            let stdin_data = if self.stdin {
                let mut data = Vec::new();
                std::io::stdin().read_to_end(&mut data).ok()?;
                Some(data)
            } else {
                None
            };
            return Some(OpRequest::Backup {
                force: self.force,
                stdin_data,
                stdin_filename: self.stdin_filename.clone(),
            });
        }
        if let Some(target) = &self.restore {
            let includes = self
                .restore_includes
                .as_deref()
                .map(|csv| csv.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default();
            return Some(OpRequest::Restore {
                snapshot: self.snapshot_id.clone(),
                target: target.clone(),
                includes,
            });
        }
        if self.has_recent_snapshot {
            return Some(OpRequest::HasRecentSnapshot);
        }
        if self.snapshots {
            return Some(OpRequest::Snapshots { snapshot_id: None });
        }
        if self.ls {
            return Some(OpRequest::Ls {
                snapshot: self.snapshot_id.clone(),
            });
        }
        if let Some(subject) = &self.list {
            return Some(OpRequest::List {
                subject: subject.clone(),
            });
        }
        if let Some(path) = &self.find {
            return Some(OpRequest::Find { path: path.clone() });
        }
        if let Some(forget) = &self.forget {
            if forget == "policy" {
                return Some(OpRequest::Forget {
                    snapshots: Vec::new(),
                    use_policy: true,
                });
            }
            return Some(OpRequest::Forget {
                snapshots: forget.split(',').map(|s| s.trim().to_string()).collect(),
                use_policy: false,
            });
        }
        if self.init {
            return Some(OpRequest::Init);
        }
        if self.quick_check {
            return Some(OpRequest::Check { read_data: false });
        }
        if self.full_check {
            return Some(OpRequest::Check { read_data: true });
        }
        if self.prune || self.prune_max {
            return Some(OpRequest::Prune {
                prune_max: self.prune_max,
            });
        }
        if self.unlock {
            return Some(OpRequest::Unlock);
        }
        if self.repair_index {
            return Some(OpRequest::Repair {
                subject: RepairSubject::Index,
                pack_ids: None,
            });
        }
        if self.repair_snapshots {
            return Some(OpRequest::Repair {
                subject: RepairSubject::Snapshots,
                pack_ids: None,
            });
        }
        if let Some(pack_ids) = &self.repair_packs {
            return Some(OpRequest::Repair {
                subject: RepairSubject::Packs,
                pack_ids: Some(pack_ids.clone()),
            });
        }
        if self.recover {
            return Some(OpRequest::Recover);
        }
        if self.housekeeping {
            return Some(OpRequest::Housekeeping);
        }
        if let Some(command) = &self.raw {
            return Some(OpRequest::Raw {
                command: command.clone(),
            });
        }
        if let Some(path) = &self.dump {
            return Some(OpRequest::Dump {
                snapshot: self.snapshot_id.clone(),
                path: path.clone(),
            });
        }
        if self.stats {
            return Some(OpRequest::Stats {
                subject: self.stats_subject.clone(),
            });
        }
        None
    }
}

fn config_error_exit_code(error: &ConfigError) -> i32 {
    match error {
        ConfigError::FileMissing(_) => exit_codes::CONFIG_FILE_MISSING,
        ConfigError::Parse(_) | ConfigError::Empty | ConfigError::Io { .. } => {
            exit_codes::CONFIG_FILE_INVALID
        }
        _ => exit_codes::CONFIG_FILE_BOGUS,
    }
}

fn init_tracing(cli: &Cli) {
    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match &cli.log_file {
        Some(path) => match std::fs::File::options().create(true).append(true).open(path) {
            Ok(file) => {
                builder
                    .with_ansi(false)
                    .with_writer(move || file.try_clone().expect("log file clone"))
                    .init();
            }
            Err(e) => {
                eprintln!("cannot open log file {}: {e}", path.display());
                tracing_subscriber::fmt().init();
            }
        },
        None => builder.init(),
    }
}

fn print_result(result: &OpResult, json: bool) {
    if json {
        match serde_json::to_string_pretty(result) {
            Ok(text) => println!("{text}"),
            Err(e) => eprintln!("cannot render result: {e}"),
        }
    } else if result.result {
        println!("{}: success", result.operation);
    } else {
        println!(
            "{}: failure ({})",
            result.operation,
            result.reason.as_deref().unwrap_or("see logs")
        );
    }
}

fn result_exit_code(cli: &Cli, result: &OpResult, logger: &OpLogger) -> i32 {
    if let Some(code) = result.args.get("exit_code").and_then(|v| v.as_i64()) {
        return code as i32;
    }
    if cli.has_recent_snapshot {
        return if result.result { 0 } else { 1 };
    }
    if result.result {
        logger.exit_code()
    } else {
        let code = logger.exit_code();
        if code == exit_codes::SUCCESS {
            exit_codes::WORST_LEVEL_ERROR
        } else {
            code
        }
    }
}

async fn run(cli: Cli) -> i32 {
    let logger = OpLogger::new();
    let cancel = CancelFlag::new();

    let keys = match KeyRing::resolve(DEFAULT_AES_KEY, None) {
        Ok(keys) => keys,
        Err(e) => {
            logger.critical(&format!("cannot load encryption key: {e}"));
            return exit_codes::CONFIG_FILE_BOGUS;
        }
    };

    let store = match ConfigStore::load(&cli.config_file, keys) {
        Ok(store) => store,
        Err(e) => {
            logger.critical(&format!("cannot load configuration: {e}"));
            return config_error_exit_code(&e);
        }
    };
    let options = store.global_options();
    let audience = bhl_config::tree::get_path(store.tree(), "audience")
        .and_then(serde_yaml::Value::as_str)
        .unwrap_or("public")
        .to_string();

    if cli.show_config {
        let Some((mut view, _)) = store.get_repo_config(&cli.repo_name) else {
            logger.critical(&format!("no repo {} in configuration", cli.repo_name));
            return exit_codes::CONFIG_FILE_BOGUS;
        };
        bhl_config::anonymize(&mut view);
        match serde_yaml::to_string(&view) {
            Ok(text) => println!("{text}"),
            Err(e) => eprintln!("cannot render config: {e}"),
        }
        return exit_codes::SUCCESS;
    }

    let Some(request) = cli.to_request() else {
        logger.error("no operation given, see --help");
        return exit_codes::WORST_LEVEL_ERROR;
    };

    // Cancellation from the terminal propagates to the backend child.
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let result = match &cli.repo_group {
        Some(group) => {
            let repos = store.repos_by_group(group);
            if repos.is_empty() {
                logger.error(&format!("no repos found for group {group}"));
                return exit_codes::WORST_LEVEL_ERROR;
            }
            let views: Vec<serde_yaml::Value> = repos
                .iter()
                .filter_map(|repo| store.get_repo_config(repo).map(|(view, _)| view))
                .collect();
            group_runner(
                views,
                options,
                &audience,
                request,
                logger.clone(),
                cancel.clone(),
                |runner| configure_runner(runner, &cli),
            )
            .await
        }
        None => {
            let Some((view, _)) = store.get_repo_config(&cli.repo_name) else {
                logger.critical(&format!("no repo {} in configuration", cli.repo_name));
                return exit_codes::CONFIG_FILE_BOGUS;
            };
            let mut runner = match Runner::new(
                &view,
                options,
                &audience,
                logger.clone(),
                cancel.clone(),
            ) {
                Ok(runner) => runner,
                Err(e) => {
                    logger.critical(&format!("cannot build runner: {e}"));
                    return exit_codes::CONFIG_FILE_BOGUS;
                }
            };
            configure_runner(&mut runner, &cli);
            runner.run(request).await
        }
    };

    print_result(&result, cli.json);
    if cancel.is_cancelled() {
        return exit_codes::KEYBOARD_INTERRUPT;
    }
    result_exit_code(&cli, &result, &logger)
}

fn configure_runner(runner: &mut Runner, cli: &Cli) {
    runner.dry_run = cli.dry_run;
    runner.verbose = cli.verbose;
    runner.json_output = cli.json;
    runner.no_cache = cli.no_cache;
    runner.live_output = !cli.json;
    if let Ok(current_dir) = std::env::current_dir() {
        runner.set_binary_search_paths(vec![current_dir]);
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli);
    let code = run(cli).await;
    std::process::exit(code);
}
