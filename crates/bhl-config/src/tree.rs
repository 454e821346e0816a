// SPDX-License-Identifier: MIT OR Apache-2.0
//! Dotted-path access over YAML value trees.
//!
//! The configuration document is schemaless at the edges (user-defined env
//! variables, additional labels, presets), so the store manipulates
//! `serde_yaml::Value` trees directly. Repo and group names must not contain
//! dots, which keeps dotted paths unambiguous.

use serde_yaml::{Mapping, Value};

/// Read the value at a dotted path, if present.
pub fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for key in path.split('.') {
        current = current.as_mapping()?.get(key)?;
    }
    Some(current)
}

/// Write a value at a dotted path, creating intermediate mappings.
pub fn set_path(root: &mut Value, path: &str, value: Value) {
    if !root.is_mapping() {
        *root = Value::Mapping(Mapping::new());
    }
    let mut current = root;
    let keys: Vec<&str> = path.split('.').collect();
    for key in &keys[..keys.len() - 1] {
        let map = current.as_mapping_mut().expect("mapping ensured above");
        let entry = map
            .entry(Value::from(*key))
            .or_insert_with(|| Value::Mapping(Mapping::new()));
        if !entry.is_mapping() {
            *entry = Value::Mapping(Mapping::new());
        }
        current = entry;
    }
    current
        .as_mapping_mut()
        .expect("mapping ensured above")
        .insert(Value::from(*keys.last().expect("split yields at least one key")), value);
}

/// Remove the value at a dotted path. Missing keys are ignored.
pub fn del_path(root: &mut Value, path: &str) {
    let keys: Vec<&str> = path.split('.').collect();
    let mut current = root;
    for key in &keys[..keys.len() - 1] {
        match current.as_mapping_mut().and_then(|m| m.get_mut(*key)) {
            Some(next) => current = next,
            None => return,
        }
    }
    if let Some(map) = current.as_mapping_mut() {
        map.remove(*keys.last().expect("split yields at least one key"));
    }
}

/// Whether a value counts as unset for inheritance purposes: null or the
/// empty string.
pub fn is_unset(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Visit every scalar leaf mutably, with the dotted path of its deepest
/// mapping key. Sequence elements keep their parent path so suffix matching
/// covers list contents.
pub fn walk_scalars_mut<F>(root: &mut Value, f: &mut F)
where
    F: FnMut(&str, &mut Value),
{
    fn inner<F>(value: &mut Value, path: &mut String, f: &mut F)
    where
        F: FnMut(&str, &mut Value),
    {
        match value {
            Value::Mapping(map) => {
                for (key, child) in map.iter_mut() {
                    let key_str = match key.as_str() {
                        Some(s) => s.to_string(),
                        None => continue,
                    };
                    let saved = path.len();
                    if !path.is_empty() {
                        path.push('.');
                    }
                    path.push_str(&key_str);
                    inner(child, path, f);
                    path.truncate(saved);
                }
            }
            Value::Sequence(items) => {
                for item in items.iter_mut() {
                    inner(item, path, f);
                }
            }
            scalar => f(path, scalar),
        }
    }
    let mut path = String::new();
    inner(root, &mut path, f);
}

/// Visit every scalar leaf immutably with its dotted path.
pub fn walk_scalars<F>(root: &Value, f: &mut F)
where
    F: FnMut(&str, &Value),
{
    fn inner<F>(value: &Value, path: &mut String, f: &mut F)
    where
        F: FnMut(&str, &Value),
    {
        match value {
            Value::Mapping(map) => {
                for (key, child) in map {
                    let key_str = match key.as_str() {
                        Some(s) => s.to_string(),
                        None => continue,
                    };
                    let saved = path.len();
                    if !path.is_empty() {
                        path.push('.');
                    }
                    path.push_str(&key_str);
                    inner(child, path, f);
                    path.truncate(saved);
                }
            }
            Value::Sequence(items) => {
                for item in items {
                    inner(item, path, f);
                }
            }
            scalar => f(path, scalar),
        }
    }
    let mut path = String::new();
    inner(root, &mut path, f);
}
