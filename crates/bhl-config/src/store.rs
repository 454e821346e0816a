// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration store: load, migrate, decrypt, materialize, save.

use crate::crypt::{all_fields_encrypted, decrypt_fields, encrypt_fields};
use crate::defaults::{CURRENT_CONF_VERSION, MIN_MIGRATABLE_CONF_VERSION, default_config};
use crate::inherit::merge_repo_with_group;
use crate::tree::{del_path, get_path, is_unset, set_path};
use crate::vars::{evaluate_variables, expand_units_display, materialize_random_variables};
use bhl_core::units::ByteSize;
use bhl_crypto::KeyRing;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Configuration load/save failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file {0} does not exist")]
    FileMissing(PathBuf),
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse config file: {0}")]
    Parse(String),
    #[error("config file is empty")]
    Empty,
    #[error("config file has no readable conf_version")]
    VersionUnreadable,
    #[error("config version {found} is below the minimum migratable version {minimum}")]
    VersionTooOld { found: String, minimum: String },
    #[error("cannot decrypt config file, keys don't match")]
    Decryption(#[source] bhl_crypto::CryptoError),
    #[error("cannot serialize config: {0}")]
    Serialize(String),
}

// ---------------------------------------------------------------------------
// Version handling
// ---------------------------------------------------------------------------

/// Numeric `major.minor.patch` triple; pre-release and build suffixes are
/// ignored for comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConfVersion(u32, u32, u32);

impl ConfVersion {
    pub fn parse(text: &str) -> Option<Self> {
        let core = text.trim().split(['-', '+']).next()?;
        let mut parts = core.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next().unwrap_or("0").parse().ok()?;
        let patch = parts.next().unwrap_or("0").parse().ok()?;
        Some(Self(major, minor, patch))
    }
}

// ---------------------------------------------------------------------------
// File checksum
// ---------------------------------------------------------------------------

/// CRC32 (IEEE) of the raw file contents, logged so operators can tell when
/// a config changed between runs.
fn crc32(data: &[u8]) -> u32 {
    let mut table = [0u32; 256];
    for (i, entry) in table.iter_mut().enumerate() {
        let mut c = i as u32;
        for _ in 0..8 {
            c = if c & 1 != 0 { 0xEDB8_8320 ^ (c >> 1) } else { c >> 1 };
        }
        *entry = c;
    }
    let mut crc = 0xFFFF_FFFFu32;
    for byte in data {
        crc = table[((crc ^ *byte as u32) & 0xFF) as usize] ^ (crc >> 8);
    }
    crc ^ 0xFFFF_FFFF
}

// ---------------------------------------------------------------------------
// Global options
// ---------------------------------------------------------------------------

/// Typed `global_options` section.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct GlobalOptions {
    pub auto_upgrade: bool,
    pub auto_upgrade_percent_chance: u32,
    pub auto_upgrade_interval: u64,
    pub auto_upgrade_server_url: Option<String>,
    pub auto_upgrade_server_username: Option<String>,
    pub auto_upgrade_server_password: Option<String>,
    pub auto_upgrade_host_identity: Option<String>,
    pub auto_upgrade_group: Option<String>,
    /// Ignore the process gate entirely.
    pub full_concurrency: bool,
    /// Scope the process gate per repository.
    pub repo_aware_concurrency: bool,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Loaded configuration: a decrypted value tree plus the key ring used to
/// re-wrap it on save.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    tree: Value,
    keys: KeyRing,
}

const LIST_KEYS: &[&str] = &[
    "paths",
    "tags",
    "exclude_patterns",
    "exclude_files",
    "pre_exec_commands",
    "post_exec_commands",
];

const MAP_KEYS: &[&str] = &["additional_labels", "env_variables", "encrypted_env_variables"];

impl ConfigStore {
    /// Load, validate, migrate and decrypt a configuration file.
    pub fn load(path: &Path, keys: KeyRing) -> Result<Self, ConfigError> {
        if !path.is_file() {
            return Err(ConfigError::FileMissing(path.to_path_buf()));
        }
        let raw = std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!(
            "loaded config {:08X} from {}",
            crc32(&raw),
            path.display()
        );

        let mut tree: Value =
            serde_yaml::from_slice(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        if tree.is_null() {
            return Err(ConfigError::Empty);
        }
        if !tree.is_mapping() {
            return Err(ConfigError::Parse("top level is not a mapping".into()));
        }

        let mut needs_save = false;

        // Version gate and in-place migrations.
        let version_text = get_path(&tree, "conf_version")
            .map(render_scalar)
            .ok_or(ConfigError::VersionUnreadable)?;
        let version =
            ConfVersion::parse(&version_text).ok_or(ConfigError::VersionUnreadable)?;
        let minimum = ConfVersion::parse(MIN_MIGRATABLE_CONF_VERSION)
            .expect("minimum version constant parses");
        let current =
            ConfVersion::parse(CURRENT_CONF_VERSION).expect("current version constant parses");
        if version < minimum {
            return Err(ConfigError::VersionTooOld {
                found: version_text,
                minimum: MIN_MIGRATABLE_CONF_VERSION.to_string(),
            });
        }
        if version > current {
            warn!(
                "config version {version_text} is newer than {CURRENT_CONF_VERSION}, loading anyway"
            );
        }
        if version < current {
            migrate(&mut tree, version);
            needs_save = true;
        }

        coerce_structure(&mut tree);

        // Fields found unwrapped get wrapped on the immediate re-save.
        if !all_fields_encrypted(&tree) {
            info!("encrypting non encrypted data in configuration file");
            needs_save = true;
        }
        let rotated = decrypt_fields(&mut tree, &keys).map_err(ConfigError::Decryption)?;
        if rotated {
            warn!("successfully migrated encryption key");
            needs_save = true;
        }

        if materialize_random_variables(&mut tree) {
            info!("materialized random variables in configuration file");
            needs_save = true;
        }

        extract_permissions(&mut tree);

        let store = Self {
            path: path.to_path_buf(),
            tree,
            keys,
        };
        if needs_save {
            info!("updating config file");
            store.save()?;
        }
        Ok(store)
    }

    /// Write the configuration back, re-wrapping encrypted fields and
    /// injecting permission triples. The in-memory tree stays decrypted.
    pub fn save(&self) -> Result<(), ConfigError> {
        let mut on_disk = self.tree.clone();
        inject_permissions(&mut on_disk);
        set_path(
            &mut on_disk,
            "audience",
            Value::String(if self.keys.is_private { "private" } else { "public" }.to_string()),
        );
        encrypt_fields(&mut on_disk, &self.keys).map_err(ConfigError::Decryption)?;

        let text =
            serde_yaml::to_string(&on_disk).map_err(|e| ConfigError::Serialize(e.to_string()))?;
        std::fs::write(&self.path, text).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })?;
        info!("saved configuration file {}", self.path.display());
        Ok(())
    }

    /// The decrypted configuration tree.
    pub fn tree(&self) -> &Value {
        &self.tree
    }

    /// Mutable access for editors; callers must `save()` afterwards.
    pub fn tree_mut(&mut self) -> &mut Value {
        &mut self.tree
    }

    /// Repo names, in document order.
    pub fn repo_list(&self) -> Vec<String> {
        mapping_keys(get_path(&self.tree, "repos"))
    }

    /// Group names, in document order.
    pub fn group_list(&self) -> Vec<String> {
        mapping_keys(get_path(&self.tree, "groups"))
    }

    /// Repos belonging to `group`; the special group `__all__` selects every
    /// repo.
    pub fn repos_by_group(&self, group: &str) -> Vec<String> {
        self.repo_list()
            .into_iter()
            .filter(|repo| {
                group == "__all__"
                    || get_path(&self.tree, &format!("repos.{repo}.repo_group"))
                        .and_then(Value::as_str)
                        == Some(group)
            })
            .collect()
    }

    /// Manager password of a repo, when protection is configured.
    pub fn manager_password(&self, repo_name: &str) -> Option<String> {
        get_path(&self.tree, &format!("repos.{repo_name}.manager_password"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Typed `global_options` section.
    pub fn global_options(&self) -> GlobalOptions {
        get_path(&self.tree, "global_options")
            .cloned()
            .and_then(|v| serde_yaml::from_value(v).ok())
            .unwrap_or_default()
    }

    /// Materialize the view of `repo_name`: group merged in, variables
    /// evaluated, units rendered for display.
    ///
    /// Returns the view and its inheritance map.
    pub fn get_repo_config(&self, repo_name: &str) -> Option<(Value, Value)> {
        self.get_repo_config_inner(repo_name, true)
    }

    /// Same as [`ConfigStore::get_repo_config`] without variable evaluation,
    /// for editors that need the raw tokens.
    pub fn get_repo_config_raw(&self, repo_name: &str) -> Option<(Value, Value)> {
        self.get_repo_config_inner(repo_name, false)
    }

    fn get_repo_config_inner(&self, repo_name: &str, eval_vars: bool) -> Option<(Value, Value)> {
        let mut repo = match get_path(&self.tree, &format!("repos.{repo_name}")) {
            Some(value) if value.is_mapping() => value.clone(),
            _ => {
                error!("no repo with name {repo_name} found in config");
                return None;
            }
        };
        set_path(&mut repo, "name", Value::String(repo_name.to_string()));

        for global in ["global_email", "global_prometheus"] {
            if let Some(section) = get_path(&self.tree, global) {
                set_path(&mut repo, global, section.clone());
            }
        }

        let group_config = self.resolve_group_for(repo_name);
        let (mut view, inheritance) = merge_repo_with_group(&repo, &group_config);

        if eval_vars {
            evaluate_variables(&mut view, &self.tree);
        }
        expand_units_display(&mut view);
        Some((view, inheritance))
    }

    /// Materialize a group template with variables and display units.
    pub fn get_group_config(&self, group_name: &str) -> Option<Value> {
        let mut group = get_path(&self.tree, &format!("groups.{group_name}"))?.clone();
        evaluate_variables(&mut group, &self.tree);
        expand_units_display(&mut group);
        Some(group)
    }

    fn resolve_group_for(&self, repo_name: &str) -> Value {
        let group_name = get_path(&self.tree, &format!("repos.{repo_name}.repo_group"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let resolved = match group_name {
            Some(ref name) => match get_path(&self.tree, &format!("groups.{name}")) {
                Some(group) => Some(group.clone()),
                None => {
                    error!("repo {repo_name} references missing group {name}, using first available group");
                    self.group_list()
                        .first()
                        .and_then(|first| get_path(&self.tree, &format!("groups.{first}")).cloned())
                }
            },
            None => {
                error!("repo {repo_name} has no group, using first available group");
                self.group_list()
                    .first()
                    .and_then(|first| get_path(&self.tree, &format!("groups.{first}")).cloned())
            }
        };

        let mut group = match resolved {
            Some(group) => group,
            None => {
                error!("no group found in config");
                Value::Mapping(Mapping::new())
            }
        };
        // Nesting groups is forbidden.
        if get_path(&group, "repo_group").is_some() {
            error!("group referenced by repo {repo_name} carries repo_group itself, ignoring it");
            del_path(&mut group, "repo_group");
        }
        group
    }

    /// Write a materialized view back into the repo block without
    /// propagating inherited values: every leaf equal to the group value
    /// (byte-unit aliases included) is skipped, and any stale repo override
    /// for it is dropped.
    pub fn update_repo_config(&mut self, repo_name: &str, view: &Value) {
        let group = self.resolve_group_for(repo_name);
        let mut updates: Vec<(String, Option<Value>)> = Vec::new();

        collect_repo_updates(view, &group, String::new(), &mut updates);

        for (path, update) in updates {
            let full_path = format!("repos.{repo_name}.{path}");
            match update {
                Some(value) => set_path(&mut self.tree, &full_path, value),
                None => del_path(&mut self.tree, &full_path),
            }
        }
    }
}

/// Keys of a mapping value as strings.
fn mapping_keys(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_mapping)
        .map(|map| {
            map.keys()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

/// View keys that never belong to the repo block.
const VIEW_ONLY_KEYS: &[&str] = &["name", "global_email", "global_prometheus", "is_protected"];

const UNIT_KEYS: &[&str] = &[
    "minimum_backup_size_error",
    "exclude_files_larger_than",
    "upload_speed",
    "download_speed",
    "prune_max_unused",
    "prune_max_repack_size",
];

fn unit_alias_equal(key: &str, a: &Value, b: &Value) -> bool {
    if !UNIT_KEYS.contains(&key) {
        return false;
    }
    match (a, b) {
        (Value::String(a), Value::String(b)) => {
            match (a.parse::<ByteSize>(), b.parse::<ByteSize>()) {
                (Ok(a), Ok(b)) => a == b,
                _ => false,
            }
        }
        _ => false,
    }
}

fn collect_repo_updates(
    view: &Value,
    group: &Value,
    prefix: String,
    updates: &mut Vec<(String, Option<Value>)>,
) {
    let Value::Mapping(view_map) = view else { return };
    for (key, view_value) in view_map {
        let Some(key_str) = key.as_str() else { continue };
        if prefix.is_empty() && VIEW_ONLY_KEYS.contains(&key_str) {
            continue;
        }
        let path = if prefix.is_empty() {
            key_str.to_string()
        } else {
            format!("{prefix}.{key_str}")
        };
        let group_value = get_path(group, &path);

        match view_value {
            Value::Mapping(_) => {
                collect_repo_updates(view_value, group, path, updates);
            }
            Value::Sequence(items) => {
                let group_items: Vec<Value> = match group_value {
                    Some(Value::Sequence(g)) => g.clone(),
                    Some(scalar) if !is_unset(scalar) => vec![scalar.clone()],
                    _ => Vec::new(),
                };
                let own: Vec<Value> = items
                    .iter()
                    .filter(|item| !group_items.contains(item))
                    .cloned()
                    .collect();
                updates.push((path, Some(Value::Sequence(own))));
            }
            scalar => {
                let inherited = match group_value {
                    Some(group_scalar) => {
                        group_scalar == scalar || unit_alias_equal(key_str, scalar, group_scalar)
                    }
                    None => false,
                };
                if inherited {
                    updates.push((path, None));
                } else {
                    updates.push((path, Some(scalar.clone())));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Structural coercion
// ---------------------------------------------------------------------------

/// Hand-written YAML is forgiving: keys that must be lists or maps may hold
/// scalars or nulls. Normalize them so the rest of the code never cares.
fn coerce_structure(tree: &mut Value) {
    fn inner(value: &mut Value) {
        let Value::Mapping(map) = value else { return };
        for (key, child) in map.iter_mut() {
            let key_str = key.as_str().unwrap_or_default().to_string();
            if LIST_KEYS.contains(&key_str.as_str()) && !child.is_sequence() {
                *child = match &*child {
                    Value::Null => Value::Sequence(Vec::new()),
                    other => Value::Sequence(vec![other.clone()]),
                };
                continue;
            }
            if MAP_KEYS.contains(&key_str.as_str()) && !child.is_mapping() {
                *child = match child {
                    Value::Sequence(items) => {
                        // A list of single-entry maps flattens into one map.
                        let mut combined = Mapping::new();
                        for item in items.iter() {
                            if let Value::Mapping(m) = item {
                                for (k, v) in m {
                                    combined.insert(k.clone(), v.clone());
                                }
                            }
                        }
                        Value::Mapping(combined)
                    }
                    _ => Value::Mapping(Mapping::new()),
                };
                continue;
            }
            inner(child);
        }
    }
    inner(tree);
}

// ---------------------------------------------------------------------------
// Migrations
// ---------------------------------------------------------------------------

fn migrate(tree: &mut Value, old_version: ConfVersion) {
    info!(
        "migrating config from version {}.{}.{} to {CURRENT_CONF_VERSION}",
        old_version.0, old_version.1, old_version.2
    );

    let objects: Vec<(String, String)> = ["repos", "groups"]
        .iter()
        .flat_map(|section| {
            mapping_keys(get_path(tree, section))
                .into_iter()
                .map(move |name| (section.to_string(), name))
        })
        .collect();

    for (section, name) in &objects {
        if old_version < ConfVersion(3, 0, 3) {
            migrate_retention_tags(tree, section, name);
        }
        if old_version < ConfVersion(3, 0, 4) {
            migrate_compression(tree, section, name);
        }
    }
    if old_version < ConfVersion(3, 1, 0) && get_path(tree, "presets").is_none() {
        if let Some(presets) = get_path(&default_config(), "presets") {
            set_path(tree, "presets", presets.clone());
            info!("migrated presets to new config structure");
        }
    }
    set_path(
        tree,
        "conf_version",
        Value::String(CURRENT_CONF_VERSION.to_string()),
    );
}

fn migrate_retention_tags(tree: &mut Value, section: &str, name: &str) {
    let tags_path = format!("{section}.{name}.repo_opts.retention_policy.tags");
    let keep_tags_path = format!("{section}.{name}.repo_opts.retention_policy.keep_tags");
    let tags = get_path(tree, &tags_path).cloned();
    let keep_tags_unset = get_path(tree, &keep_tags_path).map_or(true, is_unset);
    if let Some(tags) = tags {
        if !tags.is_null() && keep_tags_unset {
            set_path(tree, &keep_tags_path, tags);
            info!("migrated {name} retention policy tags to keep_tags");
        }
        del_path(tree, &tags_path);
    }
}

fn migrate_compression(tree: &mut Value, section: &str, name: &str) {
    let old_path = format!("{section}.{name}.backup_opts.compression");
    let new_path = format!("{section}.{name}.repo_opts.compression");
    let old = get_path(tree, &old_path).cloned();
    if let Some(old) = old {
        if get_path(tree, &new_path).map_or(true, Value::is_null) && !old.is_null() {
            set_path(tree, &new_path, old);
            info!("migrated {name} compression to repo_opts");
        }
        del_path(tree, &old_path);
    }
}

// ---------------------------------------------------------------------------
// Permission triples
// ---------------------------------------------------------------------------

/// Expand the at-rest `[uri, permissions, manager_password]` triple into
/// bare fields. Runs after decryption.
fn extract_permissions(tree: &mut Value) {
    for section in ["repos", "groups"] {
        if get_path(tree, section).is_none() {
            info!("no {section} found in config");
            continue;
        }
        for name in mapping_keys(get_path(tree, section)) {
            let uri_path = format!("{section}.{name}.repo_uri");
            let Some(repo_uri) = get_path(tree, &uri_path).cloned() else {
                continue;
            };
            if is_unset(&repo_uri) {
                continue;
            }

            let parts: Option<Vec<Value>> = match &repo_uri {
                Value::Sequence(items) if items.len() == 3 => Some(items.clone()),
                Value::String(s) if s.contains(',') => Some(
                    s.split(',')
                        .map(|part| Value::String(part.trim().to_string()))
                        .collect(),
                ),
                _ => None,
            };

            match parts {
                Some(parts) if parts.len() == 3 => {
                    set_path(tree, &uri_path, parts[0].clone());
                    set_path(tree, &format!("{section}.{name}.permissions"), parts[1].clone());
                    set_path(
                        tree,
                        &format!("{section}.{name}.manager_password"),
                        parts[2].clone(),
                    );
                }
                _ => {
                    debug!("no protection information for {section} {name}");
                    if get_path(tree, &format!("{section}.{name}.permissions"))
                        .map_or(true, is_unset)
                    {
                        set_path(
                            tree,
                            &format!("{section}.{name}.permissions"),
                            Value::String("full".to_string()),
                        );
                    }
                    set_path(tree, &format!("{section}.{name}.manager_password"), Value::Null);
                }
            }
        }
    }
}

/// Collapse bare permission fields back into the at-rest triple. Runs on a
/// clone of the tree just before encryption.
///
/// New protection only applies when the supplied current manager password
/// matches the stored one; otherwise the pre-existing protection is kept.
fn inject_permissions(tree: &mut Value) {
    for section in ["repos", "groups"] {
        for name in mapping_keys(get_path(tree, section)) {
            let base = format!("{section}.{name}");
            let repo_uri = get_path(tree, &format!("{base}.repo_uri")).cloned();
            let permissions = get_path(tree, &format!("{base}.permissions")).cloned();
            let manager_password = get_path(tree, &format!("{base}.manager_password")).cloned();
            let new_manager_password =
                get_path(tree, &format!("{base}.new_manager_password")).cloned();
            let current_manager_password =
                get_path(tree, &format!("{base}.current_manager_password")).cloned();
            let new_permissions = get_path(tree, &format!("{base}.new_permissions")).cloned();

            // Unset and missing passwords compare equal, so protection can
            // be applied to a repo that never had any.
            let normalize = |v: &Option<Value>| -> Option<String> {
                v.as_ref()
                    .filter(|value| !is_unset(value))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            };
            let manager_set = manager_password.as_ref().map_or(false, |v| !is_unset(v));
            let new_set = new_manager_password.as_ref().map_or(false, |v| !is_unset(v));

            if new_set && normalize(&current_manager_password) == normalize(&manager_password) {
                set_path(
                    tree,
                    &format!("{base}.repo_uri"),
                    Value::Sequence(vec![
                        repo_uri.unwrap_or(Value::Null),
                        new_permissions.unwrap_or(Value::Null),
                        new_manager_password.unwrap_or(Value::Null),
                    ]),
                );
                info!("new permissions set for {section} {name}");
            } else {
                if new_set {
                    error!(
                        "cannot set new permissions for {section} {name} without current manager password"
                    );
                }
                if manager_set {
                    set_path(
                        tree,
                        &format!("{base}.repo_uri"),
                        Value::Sequence(vec![
                            repo_uri.unwrap_or(Value::Null),
                            permissions.unwrap_or(Value::Null),
                            manager_password.unwrap_or(Value::Null),
                        ]),
                    );
                    debug!("permissions exist for {section} {name}");
                }
            }

            for transient in [
                "is_protected",
                "new_manager_password",
                "current_manager_password",
                "new_permissions",
                "permissions",
                "manager_password",
            ] {
                del_path(tree, &format!("{base}.{transient}"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"
conf_version: 3.1.0
repos:
  default:
    repo_uri: /tmp/r
    repo_group: default_group
    backup_opts:
      paths: /etc
      tags: [b, c]
    repo_opts:
      repo_password: hunter2
groups:
  default_group:
    backup_opts:
      tags: [a, b]
      priority: low
      minimum_backup_size_error: 10 MiB
    repo_opts:
      minimum_backup_age: 1435
      upload_speed: 800 Mib
identity:
  machine_id: machine-1
global_options:
  full_concurrency: false
  repo_aware_concurrency: true
"#;

    fn keys() -> KeyRing {
        KeyRing::new("unit-test-key", None)
    }

    fn write_config(text: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backhaul.conf");
        std::fs::write(&path, text).unwrap();
        (dir, path)
    }

    #[test]
    fn missing_file_is_reported() {
        let err = ConfigStore::load(Path::new("/nonexistent/backhaul.conf"), keys()).unwrap_err();
        assert!(matches!(err, ConfigError::FileMissing(_)));
    }

    #[test]
    fn empty_file_is_rejected() {
        let (_dir, path) = write_config("");
        let err = ConfigStore::load(&path, keys()).unwrap_err();
        assert!(matches!(err, ConfigError::Empty | ConfigError::Parse(_)));
    }

    #[test]
    fn version_below_minimum_is_rejected() {
        let (_dir, path) = write_config("conf_version: 2.2.0\nrepos: {}\ngroups: {}\n");
        let err = ConfigStore::load(&path, keys()).unwrap_err();
        assert!(matches!(err, ConfigError::VersionTooOld { .. }));
    }

    #[test]
    fn missing_version_is_rejected() {
        let (_dir, path) = write_config("repos: {}\n");
        let err = ConfigStore::load(&path, keys()).unwrap_err();
        assert!(matches!(err, ConfigError::VersionUnreadable));
    }

    #[test]
    fn empty_repos_and_groups_do_not_crash() {
        let (_dir, path) = write_config("conf_version: 3.1.0\nrepos:\ngroups:\n");
        let store = ConfigStore::load(&path, keys()).unwrap();
        assert!(store.repo_list().is_empty());
        assert!(store.group_list().is_empty());
    }

    #[test]
    fn load_encrypts_plaintext_fields_on_disk() {
        let (_dir, path) = write_config(SAMPLE);
        let store = ConfigStore::load(&path, keys()).unwrap();

        // In memory: decrypted.
        assert_eq!(
            get_path(store.tree(), "repos.default.repo_uri").and_then(Value::as_str),
            Some("/tmp/r")
        );

        // On disk: every encrypted-path scalar is wrapped.
        let on_disk: Value =
            serde_yaml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let uri = get_path(&on_disk, "repos.default.repo_uri")
            .and_then(Value::as_str)
            .unwrap();
        assert!(bhl_crypto::is_wrapped(uri));
        let pwd = get_path(&on_disk, "repos.default.repo_opts.repo_password")
            .and_then(Value::as_str)
            .unwrap();
        assert!(bhl_crypto::is_wrapped(pwd));
    }

    #[test]
    fn load_save_load_is_identity_over_views() {
        let (_dir, path) = write_config(SAMPLE);
        let store = ConfigStore::load(&path, keys()).unwrap();
        let (view1, inh1) = store.get_repo_config("default").unwrap();

        store.save().unwrap();
        let store2 = ConfigStore::load(&path, keys()).unwrap();
        let (view2, inh2) = store2.get_repo_config("default").unwrap();

        assert_eq!(view1, view2);
        assert_eq!(inh1, inh2);
    }

    #[test]
    fn materialized_view_merges_group_and_units() {
        let (_dir, path) = write_config(SAMPLE);
        let store = ConfigStore::load(&path, keys()).unwrap();
        let (view, inh) = store.get_repo_config("default").unwrap();

        // Scenario: group [a, b] + repo [b, c] -> [a, b, c].
        assert_eq!(
            get_path(&view, "backup_opts.tags").unwrap(),
            &serde_yaml::from_str::<Value>("[a, b, c]").unwrap()
        );
        let tags_inh = get_path(&inh, "backup_opts.tags").unwrap().as_mapping().unwrap();
        assert_eq!(tags_inh.get("a"), Some(&Value::Bool(true)));
        assert_eq!(tags_inh.get("b"), Some(&Value::Bool(true)));
        assert_eq!(tags_inh.get("c"), Some(&Value::Bool(false)));

        // Coerced scalar path became a list.
        assert_eq!(
            get_path(&view, "backup_opts.paths").unwrap(),
            &serde_yaml::from_str::<Value>("[/etc]").unwrap()
        );

        // Units are re-rendered for display.
        assert_eq!(
            get_path(&view, "backup_opts.minimum_backup_size_error").and_then(Value::as_str),
            Some("10.0 MiB")
        );
        assert_eq!(
            get_path(&view, "repo_opts.upload_speed").and_then(Value::as_str),
            Some("800.0 Mib")
        );

        // Inherited leaves equal the group values.
        assert_eq!(get_path(&inh, "backup_opts.priority"), Some(&Value::Bool(true)));
        assert_eq!(
            get_path(&view, "backup_opts.priority").and_then(Value::as_str),
            Some("low")
        );
        assert_eq!(get_path(&view, "name").and_then(Value::as_str), Some("default"));
    }

    #[test]
    fn update_repo_config_does_not_propagate_inherited_values() {
        let (_dir, path) = write_config(SAMPLE);
        let mut store = ConfigStore::load(&path, keys()).unwrap();
        let (view, _) = store.get_repo_config("default").unwrap();

        store.update_repo_config("default", &view);

        // Inherited scalar stays out of the repo block, unit alias included.
        let repo = get_path(store.tree(), "repos.default").unwrap();
        assert!(get_path(repo, "backup_opts.priority").is_none());
        assert!(get_path(repo, "backup_opts.minimum_backup_size_error").is_none());
        assert!(get_path(repo, "repo_opts.minimum_backup_age").is_none());
        // Own list elements survive without the inherited ones.
        assert_eq!(
            get_path(repo, "backup_opts.tags").unwrap(),
            &serde_yaml::from_str::<Value>("[c]").unwrap()
        );
        // Own scalars survive.
        assert_eq!(
            get_path(repo, "repo_uri").and_then(Value::as_str),
            Some("/tmp/r")
        );

        // The view derived after the write-back is unchanged.
        let (view2, _) = store.get_repo_config("default").unwrap();
        assert_eq!(view, view2);
    }

    #[test]
    fn permission_triple_roundtrip() {
        let text = r#"
conf_version: 3.1.0
repos:
  prot:
    repo_uri: [/tmp/r, backup, secret]
    repo_group: g
groups:
  g:
    backup_opts: {}
"#;
        let (_dir, path) = write_config(text);
        let store = ConfigStore::load(&path, keys()).unwrap();
        assert_eq!(
            get_path(store.tree(), "repos.prot.repo_uri").and_then(Value::as_str),
            Some("/tmp/r")
        );
        assert_eq!(
            get_path(store.tree(), "repos.prot.permissions").and_then(Value::as_str),
            Some("backup")
        );
        assert_eq!(store.manager_password("prot").as_deref(), Some("secret"));

        // Save and reload: the triple survives the encryption roundtrip.
        store.save().unwrap();
        let store2 = ConfigStore::load(&path, keys()).unwrap();
        assert_eq!(
            get_path(store2.tree(), "repos.prot.permissions").and_then(Value::as_str),
            Some("backup")
        );
        assert_eq!(store2.manager_password("prot").as_deref(), Some("secret"));
    }

    #[test]
    fn comma_joined_uri_expands_to_triple() {
        let text = r#"
conf_version: 3.1.0
repos:
  prot:
    repo_uri: "/tmp/r, restore_only, pwd"
    repo_group: g
groups:
  g: {}
"#;
        let (_dir, path) = write_config(text);
        let store = ConfigStore::load(&path, keys()).unwrap();
        assert_eq!(
            get_path(store.tree(), "repos.prot.permissions").and_then(Value::as_str),
            Some("restore_only")
        );
    }

    #[test]
    fn unprotected_repo_defaults_to_full_permissions() {
        let (_dir, path) = write_config(SAMPLE);
        let store = ConfigStore::load(&path, keys()).unwrap();
        assert_eq!(
            get_path(store.tree(), "repos.default.permissions").and_then(Value::as_str),
            Some("full")
        );
        assert_eq!(store.manager_password("default"), None);
    }

    #[test]
    fn new_protection_requires_current_manager_password() {
        let text = r#"
conf_version: 3.1.0
repos:
  prot:
    repo_uri: [/tmp/r, backup, secret]
    repo_group: g
groups:
  g: {}
"#;
        let (_dir, path) = write_config(text);
        let mut store = ConfigStore::load(&path, keys()).unwrap();

        // Attempt a change without the current manager password.
        set_path(
            store.tree_mut(),
            "repos.prot.new_manager_password",
            Value::String("other".into()),
        );
        set_path(
            store.tree_mut(),
            "repos.prot.new_permissions",
            Value::String("full".into()),
        );
        store.save().unwrap();
        let reloaded = ConfigStore::load(&path, keys()).unwrap();
        // The refused change left the existing protection intact.
        assert_eq!(
            get_path(reloaded.tree(), "repos.prot.permissions").and_then(Value::as_str),
            Some("backup")
        );
        assert_eq!(reloaded.manager_password("prot").as_deref(), Some("secret"));
    }

    #[test]
    fn new_protection_applies_with_current_manager_password() {
        let text = r#"
conf_version: 3.1.0
repos:
  prot:
    repo_uri: [/tmp/r, backup, secret]
    repo_group: g
groups:
  g: {}
"#;
        let (_dir, path) = write_config(text);
        let mut store = ConfigStore::load(&path, keys()).unwrap();

        set_path(
            store.tree_mut(),
            "repos.prot.new_manager_password",
            Value::String("other".into()),
        );
        set_path(
            store.tree_mut(),
            "repos.prot.current_manager_password",
            Value::String("secret".into()),
        );
        set_path(
            store.tree_mut(),
            "repos.prot.new_permissions",
            Value::String("restore".into()),
        );
        store.save().unwrap();
        let reloaded = ConfigStore::load(&path, keys()).unwrap();
        assert_eq!(
            get_path(reloaded.tree(), "repos.prot.permissions").and_then(Value::as_str),
            Some("restore")
        );
        assert_eq!(reloaded.manager_password("prot").as_deref(), Some("other"));
    }

    #[test]
    fn migration_renames_retention_tags_and_moves_compression() {
        let text = r#"
conf_version: 3.0.0
repos:
  default:
    repo_uri: /tmp/r
    repo_group: g
    backup_opts:
      compression: max
    repo_opts:
      retention_policy:
        tags: [keepme]
groups:
  g: {}
"#;
        let (_dir, path) = write_config(text);
        let store = ConfigStore::load(&path, keys()).unwrap();
        let repo = get_path(store.tree(), "repos.default").unwrap();
        assert_eq!(
            get_path(repo, "repo_opts.retention_policy.keep_tags").unwrap(),
            &serde_yaml::from_str::<Value>("[keepme]").unwrap()
        );
        assert!(get_path(repo, "repo_opts.retention_policy.tags").is_none());
        assert_eq!(
            get_path(repo, "repo_opts.compression").and_then(Value::as_str),
            Some("max")
        );
        assert!(get_path(repo, "backup_opts.compression").is_none());
        // Presets were seeded and the version stamped.
        assert!(get_path(store.tree(), "presets").is_some());
        assert_eq!(
            get_path(store.tree(), "conf_version").and_then(Value::as_str),
            Some(CURRENT_CONF_VERSION)
        );
    }

    #[test]
    fn repos_by_group_and_all_selector() {
        let text = r#"
conf_version: 3.1.0
repos:
  a:
    repo_uri: /tmp/a
    repo_group: g1
  b:
    repo_uri: /tmp/b
    repo_group: g2
groups:
  g1: {}
  g2: {}
"#;
        let (_dir, path) = write_config(text);
        let store = ConfigStore::load(&path, keys()).unwrap();
        assert_eq!(store.repos_by_group("g1"), vec!["a"]);
        assert_eq!(store.repos_by_group("__all__"), vec!["a", "b"]);
        assert!(store.repos_by_group("nope").is_empty());
    }

    #[test]
    fn global_options_deserialize() {
        let (_dir, path) = write_config(SAMPLE);
        let store = ConfigStore::load(&path, keys()).unwrap();
        let options = store.global_options();
        assert!(!options.full_concurrency);
        assert!(options.repo_aware_concurrency);
    }

    #[test]
    fn conf_version_parsing() {
        assert_eq!(ConfVersion::parse("3.0.4"), Some(ConfVersion(3, 0, 4)));
        assert_eq!(ConfVersion::parse("3.1.0-dev"), Some(ConfVersion(3, 1, 0)));
        assert!(ConfVersion::parse("3.1.0") > ConfVersion::parse("3.0.9"));
        assert_eq!(ConfVersion::parse("bogus"), None);
    }

    #[test]
    fn crc32_known_value() {
        // CRC32 of "123456789" is the classic check value.
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }
}
