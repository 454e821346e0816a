// SPDX-License-Identifier: MIT OR Apache-2.0
//! Default configuration document.

use serde_yaml::Value;

/// Configuration format version written by this build.
pub const CURRENT_CONF_VERSION: &str = "3.1.0";

/// Oldest version the in-place migrations can lift.
pub const MIN_MIGRATABLE_CONF_VERSION: &str = "3.0.0";

/// What a fresh configuration file looks like.
///
/// Repo and group names must not contain dots, since dotted paths address
/// the tree.
const DEFAULT_CONFIG_YAML: &str = r#"
conf_version: 3.1.0
audience: public
repos:
  default:
    repo_uri:
    permissions: full
    manager_password:
    repo_group: default_group
    backup_opts:
      paths: []
      tags: []
    repo_opts: {}
    prometheus: {}
    env:
      env_variables: {}
      encrypted_env_variables: {}
groups:
  default_group:
    backup_opts:
      paths: []
      source_type:
      stdin_from_command:
      stdin_filename:
      tags: []
      use_fs_snapshot: true
      ignore_cloud_files: true
      one_file_system: false
      priority: low
      exclude_caches: true
      excludes_case_ignore: false
      exclude_files:
        - excludes/generic_excluded_extensions
        - excludes/generic_excludes
        - excludes/windows_excludes
        - excludes/linux_excludes
      exclude_patterns:
      exclude_files_larger_than:
      additional_parameters:
      additional_backup_only_parameters:
      additional_restore_only_parameters:
      minimum_backup_size_error: 10 MiB
      pre_exec_commands: []
      pre_exec_per_command_timeout: 3600
      pre_exec_failure_is_fatal: false
      post_exec_commands: []
      post_exec_per_command_timeout: 3600
      post_exec_failure_is_fatal: false
      post_exec_execute_even_on_backup_error: true
      post_backup_housekeeping_percent_chance: 0
      post_backup_housekeeping_interval: 0
    repo_opts:
      repo_password:
      repo_password_command:
      compression: auto
      minimum_backup_age: 1435
      random_delay_before_backup: 200
      upload_speed: 800 Mib
      download_speed: 0 Mib
      backend_connections: 0
      retention_policy:
        last: 3
        hourly: 72
        daily: 30
        weekly: 4
        monthly: 12
        yearly: 3
        keep_tags: []
        apply_on_tags: []
        keep_within: true
        group_by_host: true
        group_by_tags: true
        group_by_paths: false
        ntp_server:
      prune_max_unused: 0 B
      prune_max_repack_size:
    prometheus:
      backup_job: ${MACHINE_ID}
      group: ${MACHINE_GROUP}
    env:
      env_variables: {}
      encrypted_env_variables: {}
identity:
  machine_id: ${HOSTNAME}__${RANDOM}[4]
  machine_group:
global_prometheus:
  metrics: false
  instance: ${MACHINE_ID}
  destination:
  http_username:
  http_password:
  additional_labels: {}
  no_cert_verify: false
global_email:
  enable: false
  instance: ${MACHINE_ID}
  smtp_server:
  smtp_port: 587
  smtp_security: starttls
  smtp_username:
  smtp_password:
  sender:
  recipients:
  on_backup_success: true
  on_backup_failure: true
  on_operations_success: false
  on_operations_failure: true
global_options:
  auto_upgrade: false
  auto_upgrade_percent_chance: 5
  auto_upgrade_interval: 15
  auto_upgrade_server_url:
  auto_upgrade_server_username:
  auto_upgrade_server_password:
  auto_upgrade_host_identity: ${MACHINE_ID}
  auto_upgrade_group: ${MACHINE_GROUP}
  full_concurrency: false
  repo_aware_concurrency: false
presets:
  adds_to_existing: true
  replaces_existing: false
  retention_policies:
    gfs:
      keep_daily: 30
      keep_weekly: 4
      keep_monthly: 12
      keep_yearly: 3
      keep_within: true
      group_by_host: true
      group_by_tags: true
      group_by_paths: false
      ntp_server:
      keep_tags: []
      apply_on_tags: []
destinations:
  default_destination:
    repo_uri:
    repo_password:
"#;

/// Parse the default configuration document.
pub fn default_config() -> Value {
    serde_yaml::from_str(DEFAULT_CONFIG_YAML).expect("built-in default config is valid YAML")
}

/// Default group template used when a repo references no resolvable group.
pub fn default_group_config() -> Value {
    crate::tree::get_path(&default_config(), "groups.default_group")
        .cloned()
        .expect("default config carries the default group")
}
