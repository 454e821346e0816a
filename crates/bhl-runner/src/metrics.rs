// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-operation metric analysis and publication.

use bhl_config::RepoView;
use bhl_core::units::ByteSize;
use bhl_core::{ENV_UPGRADE_STATE, ExecState, OpLogger, Operation};
use bhl_metrics::{
    EmailSettings, Labels, exec_state_sample, exec_time_sample, parse_text_summary,
    send_notification, summary_to_samples, upload_metrics, write_metrics_file,
};
use chrono::Utc;
use std::path::Path;
use tracing::{debug, info, warn};

/// Outcome of the metric analysis pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Analysis {
    /// Operation success after output analysis.
    pub operation_success: bool,
    /// Whether the backup moved less data than the configured minimum.
    pub backup_too_small: bool,
}

/// Base label set for one operation on one repository.
pub fn operation_labels(view: &RepoView, operation: Operation, audience: &str) -> Labels {
    let mut labels = Labels::new()
        .with(
            "program_version",
            concat!("backhaul ", env!("CARGO_PKG_VERSION")),
        )
        .with("repo_name", view.name.clone())
        .with("action", operation.name())
        .with("audience", audience)
        .with("os", std::env::consts::OS)
        .with("arch", std::env::consts::ARCH);

    if view.global_prometheus.metrics {
        if let Some(backup_job) = &view.prometheus.backup_job {
            labels.set("backup_job", backup_job.clone());
        }
        if let Some(group) = &view.prometheus.group {
            labels.set("group", group.clone());
        }
        if let Some(instance) = &view.global_prometheus.instance {
            labels.set("instance", instance.clone());
        }
        for (key, value) in &view.global_prometheus.additional_labels {
            labels.set(key.clone(), value.clone());
        }
    }
    labels
}

/// Analyze backend output and compose, then optionally publish, the metric
/// samples for one finished operation.
#[allow(clippy::too_many_arguments)]
pub async fn analyse_and_emit(
    view: &RepoView,
    operation: Operation,
    backend_success: bool,
    backup_output: Option<&str>,
    exec_time: Option<f64>,
    dry_run: bool,
    append_metrics_file: bool,
    audience: &str,
    logger: &OpLogger,
    analyze_only: bool,
) -> Analysis {
    let labels = operation_labels(view, operation, audience);
    let timestamp = Utc::now().timestamp();
    let mut samples = Vec::new();

    let mut operation_success = backend_success;
    let mut backup_too_small = false;

    // Only backup output carries a summary worth analyzing.
    if operation == Operation::Backup {
        let output = backup_output.unwrap_or_default();
        let summary = parse_text_summary(backend_success, output);
        let minimum = view
            .backup_opts
            .minimum_backup_size_error
            .as_deref()
            .and_then(|v| v.parse::<ByteSize>().ok())
            .filter(|v| v.bytes() > 0);
        let (backup_samples, too_small) =
            summary_to_samples(&summary, &labels, minimum, backend_success, timestamp);
        samples.extend(backup_samples);
        backup_too_small = too_small;
        operation_success = backend_success && !summary.errors;
    }
    if !operation_success {
        logger.error("backend finished with errors");
    }

    let mut exec_state = logger.exec_state();
    if !operation_success || backup_too_small {
        exec_state = ExecState(2);
    }
    samples.push(exec_state_sample(&labels, exec_state, timestamp));

    // The upgrade subsystem leaves its last outcome in the environment.
    if let Ok(state) = std::env::var(ENV_UPGRADE_STATE) {
        if let Ok(state) = state.parse::<u8>() {
            let upgrade_labels = operation_labels(view, operation, audience)
                .with("action", "upgrade");
            samples.push(exec_state_sample(&upgrade_labels, ExecState(state), timestamp));
        }
    }
    if let Some(exec_time) = exec_time {
        samples.push(exec_time_sample(&labels, exec_time, timestamp));
    }

    if !analyze_only {
        debug!("metrics computed:\n{}", samples.join("\n"));
        publish(view, operation, &samples, dry_run, append_metrics_file).await;
        send_outcome_mail(
            view,
            operation,
            operation_success,
            backup_too_small,
            exec_state,
        )
        .await;
        // One emission per run; the next operation starts clean.
        logger.reset_worst_level();
    }

    Analysis {
        operation_success,
        backup_too_small,
    }
}

async fn publish(
    view: &RepoView,
    operation: Operation,
    samples: &[String],
    dry_run: bool,
    append_metrics_file: bool,
) {
    if !view.global_prometheus.metrics {
        debug!("metrics not enabled in configuration, not sending metrics");
        return;
    }
    let Some(destination) = view.global_prometheus.destination.as_deref() else {
        debug!("no metrics destination set, not sending metrics");
        return;
    };
    if dry_run {
        info!("dry run mode, not sending metrics");
        return;
    }

    if destination.to_lowercase().starts_with("http") {
        // Push gateways overwrite by job identity; make it unique per
        // (repo, action).
        let destination = format!(
            "{destination}___repo_name={}___action={}",
            view.name,
            operation.name()
        );
        let authentication = match (
            view.global_prometheus.http_username.as_deref(),
            view.global_prometheus.http_password.as_deref(),
        ) {
            (Some(username), Some(password)) => Some((username, password)),
            _ => None,
        };
        if let Err(e) = upload_metrics(
            &destination,
            authentication,
            view.global_prometheus.no_cert_verify,
            samples,
        )
        .await
        {
            warn!("cannot upload metrics: {e}");
        }
    } else if let Err(e) =
        write_metrics_file(Path::new(destination), samples, append_metrics_file)
    {
        warn!("cannot write metrics file: {e}");
    }
}

async fn send_outcome_mail(
    view: &RepoView,
    operation: Operation,
    operation_success: bool,
    backup_too_small: bool,
    exec_state: ExecState,
) {
    let settings: EmailSettings = match serde_yaml::from_value(view.global_email.clone()) {
        Ok(settings) => settings,
        Err(_) => return,
    };
    let success = operation_success && !backup_too_small && exec_state == ExecState(0);
    let date = Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();
    if let Err(e) = send_notification(
        &settings,
        operation,
        &view.name,
        success,
        backup_too_small,
        exec_state,
        &date,
        None,
    )
    .await
    {
        warn!("failed to send notification mail: {e}");
    }
}
