// SPDX-License-Identifier: MIT OR Apache-2.0
//! Outcome notification mail.

use bhl_core::{ExecState, MAX_EMAIL_DETAIL_LENGTH, Operation};
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// `global_email` settings as materialized into a repo view.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EmailSettings {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub instance: Option<String>,
    #[serde(default)]
    pub smtp_server: Option<String>,
    #[serde(default)]
    pub smtp_port: Option<u16>,
    /// `tls`, `starttls` or `none`; defaults to starttls.
    #[serde(default)]
    pub smtp_security: Option<String>,
    #[serde(default)]
    pub smtp_username: Option<String>,
    #[serde(default)]
    pub smtp_password: Option<String>,
    #[serde(default)]
    pub sender: Option<String>,
    /// Comma-separated recipient list.
    #[serde(default)]
    pub recipients: Option<String>,
    #[serde(default)]
    pub on_backup_success: bool,
    #[serde(default)]
    pub on_backup_failure: bool,
    #[serde(default)]
    pub on_operations_success: bool,
    #[serde(default)]
    pub on_operations_failure: bool,
}

/// Whether an outcome should produce a mail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailDecision {
    Send,
    Skip,
}

impl EmailSettings {
    /// Apply the recipient decision matrix.
    pub fn decision(&self, operation: Operation, success: bool) -> EmailDecision {
        if !self.enable {
            return EmailDecision::Skip;
        }
        let wanted = if operation == Operation::Backup {
            if success {
                self.on_backup_success
            } else {
                self.on_backup_failure
            }
        } else if success {
            self.on_operations_success
        } else {
            self.on_operations_failure
        };
        if wanted { EmailDecision::Send } else { EmailDecision::Skip }
    }
}

/// Mail failure.
#[derive(Debug, Error)]
pub enum EmailError {
    #[error("email configuration incomplete: {0}")]
    Incomplete(&'static str),
    #[error("invalid address '{0}'")]
    Address(String),
    #[error("cannot build transport: {0}")]
    Transport(String),
    #[error("sending failed: {0}")]
    Send(String),
}

/// Compose the human-readable body for an outcome.
pub fn compose_body(
    operation: Operation,
    repo_name: &str,
    success: bool,
    backup_too_small: bool,
    exec_state: ExecState,
    date: &str,
    detail: Option<&str>,
) -> String {
    let mut body = format!("Operation: {operation}\nRepo: {repo_name}");
    if success {
        body.push_str("\nStatus: Success");
    } else if backup_too_small {
        body.push_str("\nStatus: Backup too small");
    } else {
        match exec_state.0 {
            1 => body.push_str("\nStatus: Warning"),
            3 => body.push_str("\nStatus: Critical error"),
            _ => body.push_str("\nStatus: Error"),
        }
    }
    body.push_str(&format!("\nDate: {date}"));

    if let Some(detail) = detail {
        if detail.len() > MAX_EMAIL_DETAIL_LENGTH {
            let truncated: String = detail.chars().take(MAX_EMAIL_DETAIL_LENGTH).collect();
            body.push_str(&format!("\n\nDetail:\n{truncated} [... truncated]"));
        } else {
            body.push_str(&format!("\n\nDetail:\n{detail}"));
        }
    }

    body.push_str(&format!(
        "\n\nGenerated by backhaul {}\n",
        env!("CARGO_PKG_VERSION")
    ));
    body
}

/// Send the outcome notification, honoring the decision matrix.
///
/// Returns `Ok(false)` when the matrix decided not to send.
pub async fn send_notification(
    settings: &EmailSettings,
    operation: Operation,
    repo_name: &str,
    success: bool,
    backup_too_small: bool,
    exec_state: ExecState,
    date: &str,
    detail: Option<&str>,
) -> Result<bool, EmailError> {
    if settings.decision(operation, success) == EmailDecision::Skip {
        debug!("email decision matrix skipped notification for {operation}");
        return Ok(false);
    }

    let server = settings
        .smtp_server
        .as_deref()
        .ok_or(EmailError::Incomplete("smtp_server"))?;
    let port = settings.smtp_port.ok_or(EmailError::Incomplete("smtp_port"))?;
    let sender = settings
        .sender
        .as_deref()
        .ok_or(EmailError::Incomplete("sender"))?;
    let recipients = settings
        .recipients
        .as_deref()
        .ok_or(EmailError::Incomplete("recipients"))?;

    let instance = settings.instance.as_deref().unwrap_or("backhaul");
    let outcome = if success { "success" } else { "failure" };
    let subject = format!("backhaul {outcome} report for {instance} {operation} on repo {repo_name}");
    let body = compose_body(
        operation,
        repo_name,
        success,
        backup_too_small,
        exec_state,
        date,
        detail,
    );

    let from: Mailbox = sender
        .parse()
        .map_err(|_| EmailError::Address(sender.to_string()))?;
    let mut builder = Message::builder().from(from).subject(subject);
    for recipient in recipients.split(',') {
        let recipient = recipient.trim();
        if recipient.is_empty() {
            continue;
        }
        let to: Mailbox = recipient
            .parse()
            .map_err(|_| EmailError::Address(recipient.to_string()))?;
        builder = builder.to(to);
    }
    let message = builder
        .body(body)
        .map_err(|e| EmailError::Transport(e.to_string()))?;

    let security = settings.smtp_security.as_deref().unwrap_or("starttls");
    let mut transport = match security {
        "tls" => AsyncSmtpTransport::<Tokio1Executor>::relay(server)
            .map_err(|e| EmailError::Transport(e.to_string()))?,
        "none" => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(server),
        _ => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(server)
            .map_err(|e| EmailError::Transport(e.to_string()))?,
    }
    .port(port);

    if let (Some(username), Some(password)) =
        (settings.smtp_username.as_ref(), settings.smtp_password.as_ref())
    {
        transport = transport.credentials(Credentials::new(username.clone(), password.clone()));
    }

    info!("sending notification mail to {recipients}");
    match transport.build().send(message).await {
        Ok(_) => Ok(true),
        Err(e) => {
            warn!("failed to send notification mail: {e}");
            Err(EmailError::Send(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(enable: bool) -> EmailSettings {
        EmailSettings {
            enable,
            on_backup_success: true,
            on_backup_failure: true,
            on_operations_success: false,
            on_operations_failure: true,
            ..Default::default()
        }
    }

    #[test]
    fn decision_matrix_for_backup() {
        let s = settings(true);
        assert_eq!(s.decision(Operation::Backup, true), EmailDecision::Send);
        assert_eq!(s.decision(Operation::Backup, false), EmailDecision::Send);
    }

    #[test]
    fn decision_matrix_for_other_operations() {
        let s = settings(true);
        assert_eq!(s.decision(Operation::Prune, true), EmailDecision::Skip);
        assert_eq!(s.decision(Operation::Prune, false), EmailDecision::Send);
    }

    #[test]
    fn disabled_email_never_sends() {
        let s = settings(false);
        assert_eq!(s.decision(Operation::Backup, false), EmailDecision::Skip);
    }

    #[test]
    fn body_contains_status_and_date() {
        let body = compose_body(
            Operation::Backup,
            "default",
            true,
            false,
            ExecState(0),
            "2024-01-01 00:00:00 UTC",
            None,
        );
        assert!(body.contains("Operation: backup"));
        assert!(body.contains("Repo: default"));
        assert!(body.contains("Status: Success"));
        assert!(body.contains("Date: 2024-01-01 00:00:00 UTC"));
    }

    #[test]
    fn body_status_variants() {
        let too_small = compose_body(
            Operation::Backup, "r", false, true, ExecState(2), "d", None,
        );
        assert!(too_small.contains("Status: Backup too small"));

        let warning = compose_body(
            Operation::Prune, "r", false, false, ExecState(1), "d", None,
        );
        assert!(warning.contains("Status: Warning"));

        let critical = compose_body(
            Operation::Forget, "r", false, false, ExecState(3), "d", None,
        );
        assert!(critical.contains("Status: Critical error"));
    }

    #[test]
    fn long_detail_is_truncated() {
        let detail = "x".repeat(5000);
        let body = compose_body(
            Operation::Backup,
            "r",
            false,
            false,
            ExecState(2),
            "d",
            Some(&detail),
        );
        assert!(body.contains("[... truncated]"));
        assert!(body.len() < 2000);
    }

    #[tokio::test]
    async fn skip_decision_short_circuits_before_validation() {
        // Incomplete settings must not error when the matrix says skip.
        let s = EmailSettings::default();
        let sent = send_notification(
            &s,
            Operation::Backup,
            "r",
            true,
            false,
            ExecState(0),
            "d",
            None,
        )
        .await
        .unwrap();
        assert!(!sent);
    }

    #[tokio::test]
    async fn incomplete_settings_error_when_sending_wanted() {
        let s = settings(true);
        let err = send_notification(
            &s,
            Operation::Backup,
            "r",
            true,
            false,
            ExecState(0),
            "d",
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EmailError::Incomplete("smtp_server")));
    }
}
