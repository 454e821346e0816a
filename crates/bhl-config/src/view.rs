// SPDX-License-Identifier: MIT OR Apache-2.0
//! Typed projection of a materialized repo view.
//!
//! The store works on value trees; the runner wants field access. A
//! [`RepoView`] deserializes the merged tree into the known schema while
//! keeping the raw tree available for the schemaless corners.

use bhl_core::Permission;
use serde::Deserialize;
use serde_yaml::Value;
use std::collections::BTreeMap;

/// How backup sources are fed to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    FolderList,
    FilesFrom,
    FilesFromVerbatim,
    FilesFromRaw,
    StdinFromCommand,
}

impl SourceType {
    /// Whether paths name list files rather than folders.
    pub fn is_files_from(&self) -> bool {
        matches!(
            self,
            SourceType::FilesFrom | SourceType::FilesFromVerbatim | SourceType::FilesFromRaw
        )
    }
}

fn default_exec_timeout() -> u64 {
    3600
}

fn default_true() -> bool {
    true
}

/// Typed `backup_opts` section.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackupOpts {
    pub paths: Vec<String>,
    pub source_type: Option<SourceType>,
    pub stdin_from_command: Option<String>,
    pub stdin_filename: Option<String>,
    pub tags: Vec<String>,
    pub use_fs_snapshot: bool,
    pub ignore_cloud_files: bool,
    pub one_file_system: bool,
    pub priority: Option<String>,
    pub exclude_caches: bool,
    pub excludes_case_ignore: bool,
    pub exclude_files: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub exclude_files_larger_than: Option<String>,
    pub additional_parameters: Option<String>,
    pub additional_backup_only_parameters: Option<String>,
    pub additional_restore_only_parameters: Option<String>,
    pub minimum_backup_size_error: Option<String>,
    pub pre_exec_commands: Vec<String>,
    #[serde(default = "default_exec_timeout")]
    pub pre_exec_per_command_timeout: u64,
    pub pre_exec_failure_is_fatal: bool,
    pub post_exec_commands: Vec<String>,
    #[serde(default = "default_exec_timeout")]
    pub post_exec_per_command_timeout: u64,
    pub post_exec_failure_is_fatal: bool,
    #[serde(default = "default_true")]
    pub post_exec_execute_even_on_backup_error: bool,
    pub post_backup_housekeeping_percent_chance: u32,
    pub post_backup_housekeeping_interval: u64,
}

impl Default for BackupOpts {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            source_type: None,
            stdin_from_command: None,
            stdin_filename: None,
            tags: Vec::new(),
            use_fs_snapshot: false,
            ignore_cloud_files: false,
            one_file_system: false,
            priority: None,
            exclude_caches: false,
            excludes_case_ignore: false,
            exclude_files: Vec::new(),
            exclude_patterns: Vec::new(),
            exclude_files_larger_than: None,
            additional_parameters: None,
            additional_backup_only_parameters: None,
            additional_restore_only_parameters: None,
            minimum_backup_size_error: None,
            pre_exec_commands: Vec::new(),
            pre_exec_per_command_timeout: default_exec_timeout(),
            pre_exec_failure_is_fatal: false,
            post_exec_commands: Vec::new(),
            post_exec_per_command_timeout: default_exec_timeout(),
            post_exec_failure_is_fatal: false,
            post_exec_execute_even_on_backup_error: true,
            post_backup_housekeeping_percent_chance: 0,
            post_backup_housekeeping_interval: 0,
        }
    }
}

/// Typed retention policy.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetentionPolicy {
    pub last: Option<u64>,
    pub hourly: Option<u64>,
    pub daily: Option<u64>,
    pub weekly: Option<u64>,
    pub monthly: Option<u64>,
    pub yearly: Option<u64>,
    pub keep_tags: Vec<String>,
    pub apply_on_tags: Vec<String>,
    pub keep_within: bool,
    pub group_by_host: bool,
    pub group_by_paths: bool,
    pub group_by_tags: bool,
    pub ntp_server: Option<String>,
}

impl RetentionPolicy {
    /// Counts present with a nonzero value, in canonical order.
    pub fn counts(&self) -> Vec<(&'static str, u64)> {
        [
            ("last", self.last),
            ("hourly", self.hourly),
            ("daily", self.daily),
            ("weekly", self.weekly),
            ("monthly", self.monthly),
            ("yearly", self.yearly),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.filter(|v| *v > 0).map(|v| (name, v)))
        .collect()
    }

    /// A policy with no counts and no keep tags must never reach the
    /// backend.
    pub fn is_empty(&self) -> bool {
        self.counts().is_empty() && self.keep_tags.iter().all(|t| t.trim().is_empty())
    }
}

/// Typed `repo_opts` section.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct RepoOpts {
    pub repo_password: Option<String>,
    pub repo_password_command: Option<String>,
    pub compression: Option<String>,
    /// Minimum minutes between two backups; zero disables the age check.
    pub minimum_backup_age: u64,
    pub random_delay_before_backup: Option<f64>,
    pub upload_speed: Option<String>,
    pub download_speed: Option<String>,
    /// Zero selects the backend default (2 local, 8 remote).
    pub backend_connections: u32,
    pub retention_policy: RetentionPolicy,
    pub prune_max_unused: Option<String>,
    pub prune_max_repack_size: Option<String>,
}

/// Per-repo prometheus identity labels.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct RepoPrometheus {
    pub backup_job: Option<String>,
    pub group: Option<String>,
}

/// Global prometheus settings copied into the view.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct GlobalPrometheus {
    pub metrics: bool,
    pub instance: Option<String>,
    pub destination: Option<String>,
    pub http_username: Option<String>,
    pub http_password: Option<String>,
    pub additional_labels: BTreeMap<String, String>,
    pub no_cert_verify: bool,
}

/// Environment variables handed to the backend child.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct EnvSection {
    pub env_variables: BTreeMap<String, String>,
    pub encrypted_env_variables: BTreeMap<String, String>,
}

/// Fully typed materialized repo view.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RepoView {
    pub name: String,
    #[serde(default)]
    pub repo_uri: Option<String>,
    #[serde(default = "default_permission")]
    pub permissions: Permission,
    #[serde(default)]
    pub manager_password: Option<String>,
    #[serde(default)]
    pub repo_group: Option<String>,
    #[serde(default)]
    pub backup_opts: BackupOpts,
    #[serde(default)]
    pub repo_opts: RepoOpts,
    #[serde(default)]
    pub prometheus: RepoPrometheus,
    #[serde(default)]
    pub env: EnvSection,
    #[serde(default)]
    pub global_prometheus: GlobalPrometheus,
    /// Raw `global_email` subtree, consumed by the metrics pipeline.
    #[serde(default)]
    pub global_email: Value,
}

fn default_permission() -> Permission {
    Permission::Full
}

impl RepoView {
    /// Deserialize a materialized view tree.
    pub fn from_value(view: &Value) -> Result<Self, String> {
        serde_yaml::from_value(view.clone()).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(text: &str) -> Value {
        serde_yaml::from_str(text).unwrap()
    }

    #[test]
    fn view_deserializes_from_merged_tree() {
        let view = yaml(
            r#"
name: default
repo_uri: /tmp/r
permissions: backup
backup_opts:
  paths: [/etc]
  tags: [nightly]
  source_type: folder_list
  priority: low
repo_opts:
  repo_password: hunter2
  minimum_backup_age: 1435
  retention_policy:
    last: 3
    daily: 7
    keep_within: true
    group_by_host: true
prometheus:
  backup_job: job1
global_prometheus:
  metrics: true
  instance: host1
  additional_labels:
    tenant: acme
env:
  env_variables:
    LANG: C
"#,
        );
        let typed = RepoView::from_value(&view).unwrap();
        assert_eq!(typed.name, "default");
        assert_eq!(typed.permissions, Permission::Backup);
        assert_eq!(typed.backup_opts.paths, vec!["/etc"]);
        assert_eq!(typed.backup_opts.source_type, Some(SourceType::FolderList));
        assert_eq!(typed.repo_opts.minimum_backup_age, 1435);
        assert_eq!(typed.repo_opts.retention_policy.last, Some(3));
        assert!(typed.repo_opts.retention_policy.keep_within);
        assert_eq!(typed.global_prometheus.additional_labels["tenant"], "acme");
        assert_eq!(typed.env.env_variables["LANG"], "C");
    }

    #[test]
    fn missing_permissions_default_to_full() {
        let typed = RepoView::from_value(&yaml("name: r\n")).unwrap();
        assert_eq!(typed.permissions, Permission::Full);
        assert!(typed.backup_opts.paths.is_empty());
        assert!(typed.backup_opts.post_exec_execute_even_on_backup_error);
        assert_eq!(typed.backup_opts.pre_exec_per_command_timeout, 3600);
    }

    #[test]
    fn retention_policy_counts_skip_zero_and_missing() {
        let policy = RetentionPolicy {
            last: Some(3),
            hourly: Some(0),
            daily: Some(7),
            ..Default::default()
        };
        assert_eq!(policy.counts(), vec![("last", 3), ("daily", 7)]);
        assert!(!policy.is_empty());
    }

    #[test]
    fn empty_policy_detection() {
        assert!(RetentionPolicy::default().is_empty());
        let tags_only = RetentionPolicy {
            keep_tags: vec!["prod".into()],
            ..Default::default()
        };
        assert!(!tags_only.is_empty());
        let blank_tags = RetentionPolicy {
            keep_tags: vec!["  ".into()],
            ..Default::default()
        };
        assert!(blank_tags.is_empty());
    }

    #[test]
    fn source_type_classification() {
        assert!(SourceType::FilesFrom.is_files_from());
        assert!(SourceType::FilesFromRaw.is_files_from());
        assert!(!SourceType::FolderList.is_files_from());
        assert!(!SourceType::StdinFromCommand.is_files_from());
    }
}
