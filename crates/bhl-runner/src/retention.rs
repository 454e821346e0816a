// SPDX-License-Identifier: MIT OR Apache-2.0
//! Retention policy → backend flag translation.

use bhl_config::RetentionPolicy;
use bhl_wrapper::ForgetTarget;

/// Translate a retention policy into forget flags.
///
/// With `keep_within` set, counts become duration windows
/// (`--keep-within-daily 7d`); `last` always stays a plain count. Weeks are
/// converted to days because the backend rejects a `w` suffix inside
/// `--keep-within-*`. Group-by booleans compose in fixed host,paths,tags
/// order.
pub fn translate_policy(policy: &RetentionPolicy) -> ForgetTarget {
    let mut keep_flags = Vec::new();
    for (name, value) in policy.counts() {
        if !policy.keep_within || name == "last" {
            keep_flags.push((format!("keep-{name}"), value.to_string()));
        } else {
            let (unit, value) = match name {
                "weekly" => ("d", value * 7),
                other => (&other[0..1], value),
            };
            keep_flags.push((format!("keep-within-{name}"), format!("{value}{unit}")));
        }
    }

    let mut group_by = Vec::new();
    for (enabled, name) in [
        (policy.group_by_host, "host"),
        (policy.group_by_paths, "paths"),
        (policy.group_by_tags, "tags"),
    ] {
        if enabled {
            group_by.push(name.to_string());
        }
    }

    ForgetTarget::Policy {
        keep_flags,
        keep_tags: policy.keep_tags.clone(),
        apply_on_tags: policy.apply_on_tags.clone(),
        group_by,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_within_translation_matches_backend_expectations() {
        let policy = RetentionPolicy {
            last: Some(3),
            daily: Some(7),
            weekly: Some(4),
            keep_within: true,
            group_by_host: true,
            group_by_paths: false,
            group_by_tags: true,
            ..Default::default()
        };
        let ForgetTarget::Policy {
            keep_flags,
            group_by,
            ..
        } = translate_policy(&policy)
        else {
            panic!("expected policy target");
        };
        assert_eq!(
            keep_flags,
            vec![
                ("keep-last".to_string(), "3".to_string()),
                ("keep-within-daily".to_string(), "7d".to_string()),
                ("keep-within-weekly".to_string(), "28d".to_string()),
            ]
        );
        assert_eq!(group_by, vec!["host", "tags"]);
    }

    #[test]
    fn plain_counts_without_keep_within() {
        let policy = RetentionPolicy {
            hourly: Some(72),
            monthly: Some(12),
            yearly: Some(3),
            keep_within: false,
            ..Default::default()
        };
        let ForgetTarget::Policy { keep_flags, .. } = translate_policy(&policy) else {
            panic!("expected policy target");
        };
        assert_eq!(
            keep_flags,
            vec![
                ("keep-hourly".to_string(), "72".to_string()),
                ("keep-monthly".to_string(), "12".to_string()),
                ("keep-yearly".to_string(), "3".to_string()),
            ]
        );
    }

    #[test]
    fn keep_within_units_per_entry() {
        let policy = RetentionPolicy {
            hourly: Some(2),
            monthly: Some(6),
            yearly: Some(1),
            keep_within: true,
            ..Default::default()
        };
        let ForgetTarget::Policy { keep_flags, .. } = translate_policy(&policy) else {
            panic!("expected policy target");
        };
        assert_eq!(
            keep_flags,
            vec![
                ("keep-within-hourly".to_string(), "2h".to_string()),
                ("keep-within-monthly".to_string(), "6m".to_string()),
                ("keep-within-yearly".to_string(), "1y".to_string()),
            ]
        );
    }

    #[test]
    fn tags_and_group_by_are_carried() {
        let policy = RetentionPolicy {
            last: Some(1),
            keep_tags: vec!["prod".to_string()],
            apply_on_tags: vec!["nightly".to_string()],
            group_by_paths: true,
            ..Default::default()
        };
        let ForgetTarget::Policy {
            keep_tags,
            apply_on_tags,
            group_by,
            ..
        } = translate_policy(&policy)
        else {
            panic!("expected policy target");
        };
        assert_eq!(keep_tags, vec!["prod"]);
        assert_eq!(apply_on_tags, vec!["nightly"]);
        assert_eq!(group_by, vec!["paths"]);
    }
}
