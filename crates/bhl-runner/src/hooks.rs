// SPDX-License-Identifier: MIT OR Apache-2.0
//! Pre/post-exec hook commands.
//!
//! Hooks run through the shell with backhaul's privileges, serially, each
//! under its own timeout. A failing hook is a warning unless failures are
//! fatal, in which case remaining hooks are skipped.

use bhl_core::OpLogger;
use std::time::Duration;
use tokio::process::Command;

/// Run `commands` serially. Returns whether every command succeeded.
pub async fn exec_commands(
    kind: &str,
    commands: &[String],
    per_command_timeout: u64,
    failure_is_fatal: bool,
    logger: &OpLogger,
) -> bool {
    let mut all_succeeded = true;
    for command in commands {
        if command.trim().is_empty() {
            continue;
        }
        let (success, output) = run_shell(command, per_command_timeout).await;
        if success {
            logger.info(&format!(
                "{kind}-execution of command {command} succeeded with:\n{output}"
            ));
        } else {
            all_succeeded = false;
            let msg = format!("{kind}-execution of command {command} failed with:\n{output}");
            if failure_is_fatal {
                logger.error(&msg);
                logger.error("stopping further execution due to fatal error");
                break;
            }
            logger.warning(&msg);
        }
    }
    all_succeeded
}

/// Run one command line through the platform shell.
pub async fn run_shell(command: &str, timeout_secs: u64) -> (bool, String) {
    let mut shell = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(command);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(command);
        c
    };

    let result = tokio::time::timeout(Duration::from_secs(timeout_secs), shell.output()).await;
    match result {
        Ok(Ok(output)) => {
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            (output.status.success(), text.trim().to_string())
        }
        Ok(Err(e)) => (false, format!("cannot spawn command: {e}")),
        Err(_) => (false, format!("command timed out after {timeout_secs}s")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn successful_commands_pass() {
        let logger = OpLogger::new();
        let commands = vec!["true".to_string(), "echo done".to_string()];
        assert!(exec_commands("Pre", &commands, 30, false, &logger).await);
    }

    #[tokio::test]
    async fn failure_without_fatal_runs_all_commands() {
        let dir = tempfile::tempdir().unwrap();
        let witness = dir.path().join("ran");
        let logger = OpLogger::new();
        let commands = vec![
            "false".to_string(),
            format!("touch {}", witness.display()),
        ];
        assert!(!exec_commands("Post", &commands, 30, false, &logger).await);
        assert!(witness.exists());
    }

    #[tokio::test]
    async fn fatal_failure_stops_remaining_commands() {
        let dir = tempfile::tempdir().unwrap();
        let witness = dir.path().join("ran");
        let logger = OpLogger::new();
        let commands = vec![
            "false".to_string(),
            format!("touch {}", witness.display()),
        ];
        assert!(!exec_commands("Pre", &commands, 30, true, &logger).await);
        assert!(!witness.exists());
    }

    #[tokio::test]
    async fn timeout_counts_as_failure() {
        let (success, output) = run_shell("sleep 10", 1).await;
        assert!(!success);
        assert!(output.contains("timed out"));
    }

    #[tokio::test]
    async fn shell_output_is_captured() {
        let (success, output) = run_shell("echo hello-hook", 10).await;
        assert!(success);
        assert!(output.contains("hello-hook"));
    }
}
