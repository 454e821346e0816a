// SPDX-License-Identifier: MIT OR Apache-2.0
//! Repo ↔ group inheritance resolution.
//!
//! A repo view is the repo config with its group template merged in. The
//! merge also produces a parallel *inheritance map* of the same shape whose
//! leaves record whether each value came from the group: booleans for
//! scalars, `{element: bool}` mappings for list entries. The map drives
//! UI dimming and the save-path invariant of never writing inherited values
//! back into the repo block.
//!
//! Merge rules:
//! - scalars: the repo wins; null or empty string counts as unset and
//!   inherits the group value;
//! - lists: group elements first, then repo elements, deduplicated while
//!   preserving order; a scalar on either side is promoted to a
//!   single-element list; when every merged element is a mapping the
//!   elements collapse into one merged mapping;
//! - mappings: merged recursively.

use crate::tree::is_unset;
use serde_yaml::{Mapping, Value};

/// Merge `repo` with its `group` template.
///
/// Returns the materialized view and the inheritance map.
pub fn merge_repo_with_group(repo: &Value, group: &Value) -> (Value, Value) {
    let mut view = match repo {
        Value::Mapping(_) => repo.clone(),
        _ => Value::Mapping(Mapping::new()),
    };
    let mut inheritance = all_false_skeleton(&view);

    if let Value::Mapping(group_map) = group {
        apply_group(&mut view, &mut inheritance, group_map);
    }
    (view, inheritance)
}

/// Inheritance skeleton for repo-only content: every leaf is `false`.
fn all_false_skeleton(value: &Value) -> Value {
    match value {
        Value::Mapping(map) => {
            let mut out = Mapping::new();
            for (key, child) in map {
                out.insert(key.clone(), all_false_skeleton(child));
            }
            Value::Mapping(out)
        }
        Value::Sequence(items) => {
            let mut out = Mapping::new();
            for item in items {
                out.insert(item.clone(), Value::Bool(false));
            }
            Value::Mapping(out)
        }
        _ => Value::Bool(false),
    }
}

fn apply_group(view: &mut Value, inheritance: &mut Value, group: &Mapping) {
    ensure_mapping(view);
    ensure_mapping(inheritance);

    for (key, group_value) in group {
        match group_value {
            Value::Mapping(sub_group) => {
                let mut sub_view = view
                    .as_mapping()
                    .and_then(|m| m.get(key))
                    .cloned()
                    .unwrap_or(Value::Null);
                let mut sub_inheritance = all_false_skeleton(&sub_view);
                apply_group(&mut sub_view, &mut sub_inheritance, sub_group);
                insert(view, key, sub_view);
                insert(inheritance, key, sub_inheritance);
            }
            Value::Sequence(group_items) => {
                let repo_value = view.as_mapping().and_then(|m| m.get(key)).cloned();
                let (merged, inherited) = merge_lists(group_items, repo_value);
                insert(view, key, merged);
                insert(inheritance, key, inherited);
            }
            scalar => {
                let repo_value = view.as_mapping().and_then(|m| m.get(key)).cloned();
                match repo_value {
                    None => {
                        insert(view, key, scalar.clone());
                        insert(inheritance, key, Value::Bool(true));
                    }
                    Some(existing) if is_unset(&existing) => {
                        insert(view, key, scalar.clone());
                        insert(inheritance, key, Value::Bool(true));
                    }
                    Some(Value::Sequence(repo_items)) if !is_unset(scalar) => {
                        // Repo carries a list where the group has a scalar:
                        // promote the scalar and merge.
                        let group_items = vec![scalar.clone()];
                        let (merged, inherited) =
                            merge_lists(&group_items, Some(Value::Sequence(repo_items)));
                        insert(view, key, merged);
                        insert(inheritance, key, inherited);
                    }
                    Some(_) => {
                        insert(inheritance, key, Value::Bool(false));
                    }
                }
            }
        }
    }
}

/// Merge a group list with whatever the repo holds under the same key.
fn merge_lists(group_items: &[Value], repo_value: Option<Value>) -> (Value, Value) {
    let repo_items: Vec<Value> = match repo_value {
        Some(Value::Sequence(items)) => items,
        Some(value) if !is_unset(&value) => vec![value],
        _ => Vec::new(),
    };

    // Group first, repo second, order-preserving dedup.
    let mut merged: Vec<Value> = Vec::new();
    for item in group_items.iter().chain(repo_items.iter()) {
        if !merged.contains(item) {
            merged.push(item.clone());
        }
    }

    // Lists of mappings collapse into one merged mapping.
    if !merged.is_empty() && merged.iter().all(Value::is_mapping) {
        let mut combined = Mapping::new();
        let mut inherited = Mapping::new();
        for item in &merged {
            let from_group = group_items.contains(item);
            if let Value::Mapping(map) = item {
                for (k, v) in map {
                    combined.insert(k.clone(), v.clone());
                    inherited.insert(k.clone(), Value::Bool(from_group));
                }
            }
        }
        return (Value::Mapping(combined), Value::Mapping(inherited));
    }

    let mut inherited = Mapping::new();
    for item in &merged {
        inherited.insert(item.clone(), Value::Bool(group_items.contains(item)));
    }
    (Value::Sequence(merged), Value::Mapping(inherited))
}

fn ensure_mapping(value: &mut Value) {
    if !value.is_mapping() {
        *value = Value::Mapping(Mapping::new());
    }
}

fn insert(target: &mut Value, key: &Value, value: Value) {
    target
        .as_mapping_mut()
        .expect("ensure_mapping ran before insert")
        .insert(key.clone(), value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::get_path;

    fn yaml(text: &str) -> Value {
        serde_yaml::from_str(text).unwrap()
    }

    #[test]
    fn scalar_inherits_when_repo_is_unset() {
        let repo = yaml("repo_opts:\n  compression:\n");
        let group = yaml("repo_opts:\n  compression: auto\n  minimum_backup_age: 1435\n");
        let (view, inh) = merge_repo_with_group(&repo, &group);
        assert_eq!(
            get_path(&view, "repo_opts.compression").and_then(Value::as_str),
            Some("auto")
        );
        assert_eq!(
            get_path(&view, "repo_opts.minimum_backup_age").and_then(Value::as_u64),
            Some(1435)
        );
        assert_eq!(get_path(&inh, "repo_opts.compression"), Some(&Value::Bool(true)));
        assert_eq!(
            get_path(&inh, "repo_opts.minimum_backup_age"),
            Some(&Value::Bool(true))
        );
    }

    #[test]
    fn scalar_override_is_not_inherited() {
        let repo = yaml("repo_opts:\n  compression: max\n");
        let group = yaml("repo_opts:\n  compression: auto\n");
        let (view, inh) = merge_repo_with_group(&repo, &group);
        assert_eq!(
            get_path(&view, "repo_opts.compression").and_then(Value::as_str),
            Some("max")
        );
        assert_eq!(get_path(&inh, "repo_opts.compression"), Some(&Value::Bool(false)));
    }

    #[test]
    fn empty_string_counts_as_unset() {
        let repo = yaml("repo_opts:\n  compression: \"\"\n");
        let group = yaml("repo_opts:\n  compression: auto\n");
        let (view, inh) = merge_repo_with_group(&repo, &group);
        assert_eq!(
            get_path(&view, "repo_opts.compression").and_then(Value::as_str),
            Some("auto")
        );
        assert_eq!(get_path(&inh, "repo_opts.compression"), Some(&Value::Bool(true)));
    }

    #[test]
    fn lists_merge_group_first_with_dedup() {
        let repo = yaml("backup_opts:\n  tags: [b, c]\n");
        let group = yaml("backup_opts:\n  tags: [a, b]\n");
        let (view, inh) = merge_repo_with_group(&repo, &group);
        assert_eq!(
            get_path(&view, "backup_opts.tags").unwrap(),
            &yaml("[a, b, c]")
        );
        let tags_inh = get_path(&inh, "backup_opts.tags").unwrap().as_mapping().unwrap();
        assert_eq!(tags_inh.get("a"), Some(&Value::Bool(true)));
        assert_eq!(tags_inh.get("b"), Some(&Value::Bool(true)));
        assert_eq!(tags_inh.get("c"), Some(&Value::Bool(false)));
    }

    #[test]
    fn repo_scalar_is_promoted_when_group_has_list() {
        let repo = yaml("backup_opts:\n  paths: /etc\n");
        let group = yaml("backup_opts:\n  paths: [/var]\n");
        let (view, _) = merge_repo_with_group(&repo, &group);
        assert_eq!(
            get_path(&view, "backup_opts.paths").unwrap(),
            &yaml("[/var, /etc]")
        );
    }

    #[test]
    fn repo_list_absorbs_group_scalar() {
        let repo = yaml("backup_opts:\n  tags: [a]\n");
        let group = yaml("backup_opts:\n  tags: b\n");
        let (view, inh) = merge_repo_with_group(&repo, &group);
        assert_eq!(get_path(&view, "backup_opts.tags").unwrap(), &yaml("[b, a]"));
        let tags_inh = get_path(&inh, "backup_opts.tags").unwrap().as_mapping().unwrap();
        assert_eq!(tags_inh.get("b"), Some(&Value::Bool(true)));
        assert_eq!(tags_inh.get("a"), Some(&Value::Bool(false)));
    }

    #[test]
    fn lists_of_mappings_collapse_into_one() {
        let repo = yaml("env:\n  env_variables:\n    - {A: '1'}\n");
        let group = yaml("env:\n  env_variables:\n    - {B: '2'}\n");
        let (view, inh) = merge_repo_with_group(&repo, &group);
        let merged = get_path(&view, "env.env_variables").unwrap().as_mapping().unwrap();
        assert_eq!(merged.get("A"), Some(&Value::String("1".into())));
        assert_eq!(merged.get("B"), Some(&Value::String("2".into())));
        let env_inh = get_path(&inh, "env.env_variables").unwrap().as_mapping().unwrap();
        assert_eq!(env_inh.get("B"), Some(&Value::Bool(true)));
        assert_eq!(env_inh.get("A"), Some(&Value::Bool(false)));
    }

    #[test]
    fn repo_only_keys_are_kept_and_marked_not_inherited() {
        let repo = yaml("repo_uri: /tmp/r\nbackup_opts:\n  tags: [x]\n");
        let group = yaml("backup_opts:\n  paths: [/etc]\n");
        let (view, inh) = merge_repo_with_group(&repo, &group);
        assert_eq!(get_path(&view, "repo_uri").and_then(Value::as_str), Some("/tmp/r"));
        assert_eq!(get_path(&inh, "repo_uri"), Some(&Value::Bool(false)));
        let tags_inh = get_path(&inh, "backup_opts.tags").unwrap().as_mapping().unwrap();
        assert_eq!(tags_inh.get("x"), Some(&Value::Bool(false)));
    }

    #[test]
    fn null_repo_sections_are_materialized_from_group() {
        let repo = yaml("repo_opts:\n");
        let group = yaml("repo_opts:\n  retention_policy:\n    last: 3\n");
        let (view, inh) = merge_repo_with_group(&repo, &group);
        assert_eq!(
            get_path(&view, "repo_opts.retention_policy.last").and_then(Value::as_u64),
            Some(3)
        );
        assert_eq!(
            get_path(&inh, "repo_opts.retention_policy.last"),
            Some(&Value::Bool(true))
        );
    }

    #[test]
    fn inherited_leaves_match_group_values() {
        // Invariant: wherever the map says inherited, the view equals the group.
        let repo = yaml("backup_opts:\n  priority: high\n  tags: [b]\n");
        let group = yaml("backup_opts:\n  priority: low\n  use_fs_snapshot: true\n  tags: [a]\n");
        let (view, inh) = merge_repo_with_group(&repo, &group);

        assert_eq!(get_path(&inh, "backup_opts.priority"), Some(&Value::Bool(false)));
        assert_eq!(get_path(&inh, "backup_opts.use_fs_snapshot"), Some(&Value::Bool(true)));
        assert_eq!(
            get_path(&view, "backup_opts.use_fs_snapshot"),
            get_path(&group, "backup_opts.use_fs_snapshot")
        );
    }
}
