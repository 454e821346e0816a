// SPDX-License-Identifier: MIT OR Apache-2.0
//! Runtime variable substitution and unit display expansion.

use crate::tree::{get_path, walk_scalars_mut};
use bhl_core::units::ByteSize;
use rand::Rng;
use rand::distributions::Alphanumeric;
use regex::Regex;
use serde_yaml::Value;
use std::sync::OnceLock;
use tracing::warn;

/// Nested variables resolve within this many substitution passes.
const MAX_SUBSTITUTION_PASSES: usize = 16;

fn random_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{RANDOM\}\[([^\]]*)\]").unwrap())
}

fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Materialize every `${RANDOM}[n]` token in place.
///
/// Returns whether anything changed, so the caller can persist the drawn
/// values — the whole point is that the token is consumed exactly once.
pub fn materialize_random_variables(config: &mut Value) -> bool {
    let mut modified = false;
    walk_scalars_mut(config, &mut |_, value| {
        let Value::String(s) = value else { return };
        if !random_re().is_match(s) {
            return;
        }
        let replaced = random_re()
            .replace_all(s, |caps: &regex::Captures<'_>| {
                let quantity = caps[1].parse::<usize>().unwrap_or(1);
                random_string(quantity)
            })
            .into_owned();
        *value = Value::String(replaced);
        modified = true;
    });
    modified
}

/// Substitute `${MACHINE_ID}`, `${MACHINE_GROUP}`, `${BACKUP_JOB}` and
/// `${HOSTNAME}` in a repo view.
///
/// Substitution is iterated a bounded number of times to resolve nested
/// references; empty-string results collapse to null.
pub fn evaluate_variables(view: &mut Value, full_config: &Value) {
    let machine_id = get_path(full_config, "identity.machine_id")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let machine_group = get_path(full_config, "identity.machine_group")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let hostname = hostname_string();

    for _ in 0..MAX_SUBSTITUTION_PASSES {
        let backup_job = get_path(view, "prometheus.backup_job")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        let mut changed = false;
        walk_scalars_mut(view, &mut |_, value| {
            let Value::String(s) = value else { return };
            if !s.contains("${") {
                return;
            }
            let replaced = s
                .replace("${MACHINE_ID}", &machine_id)
                .replace("${MACHINE_GROUP}", &machine_group)
                .replace("${BACKUP_JOB}", &backup_job)
                .replace("${HOSTNAME}", &hostname);
            if replaced != *s {
                *value = Value::String(replaced);
                changed = true;
            }
        });
        if !changed {
            break;
        }
    }

    // Empty strings count as unset.
    walk_scalars_mut(view, &mut |_, value| {
        if matches!(value, Value::String(s) if s.is_empty()) {
            *value = Value::Null;
        }
    });
}

fn hostname_string() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Size fields rendered as IEC bytes.
const BYTE_UNIT_KEYS: &[&str] = &["minimum_backup_size_error", "exclude_files_larger_than"];
/// Size fields rendered as IEC bits (transfer speeds).
const BIT_UNIT_KEYS: &[&str] = &["upload_speed", "download_speed"];

/// Normalize size fields to their display form (IEC bytes or bits).
///
/// Unparseable values are reset to zero with a warning so a typo in the
/// config cannot poison backend invocations later.
pub fn expand_units_display(view: &mut Value) {
    walk_scalars_mut(view, &mut |path, value| {
        let key = path.rsplit('.').next().unwrap_or(path);
        let as_bits = BIT_UNIT_KEYS.contains(&key);
        if !as_bits && !BYTE_UNIT_KEYS.contains(&key) {
            return;
        }
        if value.is_null() {
            return;
        }
        let text = match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return,
        };
        let size = match text.parse::<ByteSize>() {
            Ok(size) => size,
            Err(_) => {
                warn!("cannot parse bytes value {key}:\"{text}\", setting to zero");
                ByteSize::from_bytes(0)
            }
        };
        let rendered = if as_bits {
            size.human_iec_bits()
        } else {
            size.human_iec_bytes()
        };
        *value = Value::String(rendered);
    });
}
