// SPDX-License-Identifier: MIT OR Apache-2.0
//! Encrypted-field handling over the configuration tree.

use crate::tree::walk_scalars_mut;
use bhl_crypto::{CryptoError, KeyRing, is_wrapped};
use serde_yaml::Value;
use tracing::error;

/// Dotted paths whose scalar values are stored encrypted. Matching is by
/// substring over the full dotted path, so the list covers both `repos.*`
/// and `groups.*` sections as well as every key under
/// `encrypted_env_variables`.
pub const ENCRYPTED_OPTIONS: &[&str] = &[
    "repo_uri",
    "repo_opts.repo_password",
    "repo_opts.repo_password_command",
    "global_prometheus.http_username",
    "global_prometheus.http_password",
    "global_email.smtp_username",
    "global_email.smtp_password",
    "env.encrypted_env_variables",
    "global_options.auto_upgrade_server_username",
    "global_options.auto_upgrade_server_password",
];

/// Whether a dotted path addresses an encrypted field.
pub fn is_encrypted_path(path: &str) -> bool {
    ENCRYPTED_OPTIONS.iter().any(|option| path.contains(option))
}

/// Encrypt every sensitive scalar in place. Already-wrapped values are left
/// untouched.
pub fn encrypt_fields(config: &mut Value, keys: &KeyRing) -> Result<(), CryptoError> {
    let mut failure = None;
    walk_scalars_mut(config, &mut |path, value| {
        if failure.is_some() || !is_encrypted_path(path) {
            return;
        }
        let plain = match value {
            Value::Null => return,
            Value::String(s) => s.clone(),
            ref other => serde_yaml::to_string(other)
                .map(|s| s.trim_end().to_string())
                .unwrap_or_default(),
        };
        match keys.wrap(&plain) {
            Ok(wrapped) => *value = Value::String(wrapped),
            Err(e) => failure = Some(e),
        }
    });
    match failure {
        Some(e) => {
            error!("cannot encrypt configuration: {e}");
            Err(e)
        }
        None => Ok(()),
    }
}

/// Decrypt every sensitive scalar in place.
///
/// Returns whether any value needed the earlier key, in which case the
/// caller must re-save the file so everything is wrapped under the current
/// key again.
pub fn decrypt_fields(config: &mut Value, keys: &KeyRing) -> Result<bool, CryptoError> {
    let mut rotated = false;
    let mut failure = None;
    walk_scalars_mut(config, &mut |path, value| {
        if failure.is_some() || !is_encrypted_path(path) {
            return;
        }
        let Value::String(s) = value else { return };
        if !is_wrapped(s) {
            return;
        }
        match keys.unwrap(s) {
            Ok((plain, used_earlier)) => {
                rotated |= used_earlier;
                *value = Value::String(plain);
            }
            Err(e) => failure = Some(e),
        }
    });
    match failure {
        Some(e) => {
            error!("cannot decrypt configuration: {e}");
            Err(e)
        }
        None => Ok(rotated),
    }
}

/// Whether every sensitive scalar is already wrapped.
pub fn all_fields_encrypted(config: &Value) -> bool {
    let mut encrypted = true;
    crate::tree::walk_scalars(config, &mut |path, value| {
        if !is_encrypted_path(path) {
            return;
        }
        if let Value::String(s) = value {
            if !is_wrapped(s) {
                encrypted = false;
            }
        }
    });
    encrypted
}

/// Redaction mark used by the anonymized view.
pub const REDACTED: &str = "__(o_O)__";

/// Redaction mark for the manager password specifically.
pub const REDACTED_MANAGER: &str = "__(x_X)__";

/// Replace every sensitive value with a redaction mark for display.
pub fn anonymize(config: &mut Value) {
    if let Some(map) = config.as_mapping_mut() {
        if let Some(pwd) = map.get_mut("manager_password") {
            if !crate::tree::is_unset(pwd) {
                *pwd = Value::String(REDACTED_MANAGER.to_string());
            }
        }
    }
    walk_scalars_mut(config, &mut |path, value| {
        if is_encrypted_path(path) && !matches!(value, Value::Null) {
            *value = Value::String(REDACTED.to_string());
        }
    });
}
