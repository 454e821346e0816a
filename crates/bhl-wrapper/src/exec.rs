// SPDX-License-Identifier: MIT OR Apache-2.0
//! Backend child execution: spawn, stream, heartbeat, timeout, cancel,
//! and exit-code classification.

use bhl_core::{CHECK_INTERVAL_MS, CancelFlag, HEARTBEAT_INTERVAL_SECS, OpLogger};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

/// Where streamed output lines are forwarded for live display.
pub type OutputSink = UnboundedSender<String>;

/// One backend invocation.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Full argument vector, generic arguments included.
    pub args: Vec<String>,
    /// Kill the child after this long.
    pub timeout: Option<Duration>,
    /// Bytes piped into the child's stdin.
    pub stdin_data: Option<Vec<u8>>,
    /// Capture stdout as raw bytes instead of lines (dump).
    pub binary_output: bool,
    /// Failure is expected (repo probes); suppress error logging.
    pub errors_allowed: bool,
}

impl ExecRequest {
    pub fn new(args: Vec<String>) -> Self {
        Self {
            args,
            timeout: None,
            stdin_data: None,
            binary_output: false,
            errors_allowed: false,
        }
    }
}

/// How the child ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitKind {
    Success,
    /// Exit 10 or the fatal marker: the repository does not exist yet.
    Uninitialized,
    /// Exit 3 where every error line matched the legacy cloud-file
    /// patterns; treated as success with a warning.
    CloudFilesTolerated,
    Failure { code: Option<i32> },
    TimedOut,
    Cancelled,
}

impl ExitKind {
    pub fn is_success(&self) -> bool {
        matches!(self, ExitKind::Success | ExitKind::CloudFilesTolerated)
    }
}

/// Captured run result.
#[derive(Debug)]
pub struct ExecOutcome {
    pub kind: ExitKind,
    /// Combined stdout + stderr text, in arrival order per stream.
    pub output: String,
    pub exec_time: f64,
}

/// Process priority for the backend child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Priority {
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "low" => Some(Priority::Low),
            "normal" => Some(Priority::Normal),
            "high" => Some(Priority::High),
            _ => None,
        }
    }
}

pub(crate) struct Executor<'a> {
    pub binary: &'a str,
    pub priority: Option<Priority>,
    pub cancel: &'a CancelFlag,
    pub logger: &'a OpLogger,
    pub stdout_sink: Option<&'a OutputSink>,
    pub stderr_sink: Option<&'a OutputSink>,
    pub live_output: bool,
}

impl Executor<'_> {
    /// Run the backend once, streaming output and honoring cancellation.
    pub async fn run(&self, request: &ExecRequest) -> std::io::Result<ExecOutcome> {
        let start = std::time::Instant::now();

        let mut command = self.build_command(&request.args);
        command
            .stdin(if request.stdin_data.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;

        if let Some(data) = &request.stdin_data {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(data).await?;
                stdin.shutdown().await?;
            }
        }

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        // Stderr always drains line-by-line.
        let stderr_sink = self.stderr_sink.cloned();
        let stderr_task = tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut collected = String::new();
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        collected.push_str(&line);
                        let trimmed = line.trim_end();
                        if !trimmed.is_empty() {
                            if let Some(sink) = &stderr_sink {
                                let _ = sink.send(trimmed.to_string());
                            }
                        }
                    }
                    Err(_) => break,
                }
            }
            collected
        });

        // Stdout drains as lines, or raw bytes for binary output.
        let stdout_sink = self.stdout_sink.cloned();
        let live_output = self.live_output;
        let binary_output = request.binary_output;
        let stdout_task = tokio::spawn(async move {
            if binary_output {
                let mut reader = stdout;
                let mut bytes = Vec::new();
                let _ = reader.read_to_end(&mut bytes).await;
                return String::from_utf8_lossy(&bytes).into_owned();
            }
            let mut reader = BufReader::new(stdout);
            let mut collected = String::new();
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        collected.push_str(&line);
                        let trimmed = line.trim_end();
                        if !trimmed.is_empty() {
                            if live_output {
                                println!("{trimmed}");
                            }
                            if let Some(sink) = &stdout_sink {
                                let _ = sink.send(trimmed.to_string());
                            }
                        }
                    }
                    Err(_) => break,
                }
            }
            collected
        });

        let mut cancel_tick =
            tokio::time::interval(Duration::from_millis(CHECK_INTERVAL_MS));
        let mut heartbeat =
            tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
        heartbeat.tick().await; // First tick fires immediately; skip it.
        // Effectively unbounded; tokio timers reject Duration::MAX.
        let timeout = request
            .timeout
            .unwrap_or(Duration::from_secs(365 * 24 * 3600));
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let mut kind: Option<ExitKind> = None;
        let status = loop {
            tokio::select! {
                status = child.wait() => break Some(status?),
                _ = heartbeat.tick() => {
                    self.logger.info("backend is still running");
                }
                _ = &mut deadline => {
                    warn!("backend timed out, terminating child");
                    let _ = child.kill().await;
                    kind = Some(ExitKind::TimedOut);
                    break None;
                }
                _ = cancel_tick.tick() => {
                    if self.cancel.is_cancelled() {
                        self.logger.warning("cancel requested, terminating backend");
                        let _ = child.kill().await;
                        kind = Some(ExitKind::Cancelled);
                        break None;
                    }
                }
            }
        };

        let stdout_text = stdout_task.await.unwrap_or_default();
        let stderr_text = stderr_task.await.unwrap_or_default();
        let mut output = stdout_text;
        if !stderr_text.is_empty() {
            if !output.is_empty() && !output.ends_with('\n') {
                output.push('\n');
            }
            output.push_str(&stderr_text);
        }

        let kind = match kind {
            Some(kind) => {
                // Reap the killed child so it cannot linger as a zombie.
                let _ = child.wait().await;
                kind
            }
            None => classify_exit(status.and_then(|s| s.code()), &output),
        };

        Ok(ExecOutcome {
            kind,
            output,
            exec_time: start.elapsed().as_secs_f64(),
        })
    }

    fn build_command(&self, args: &[String]) -> Command {
        // Low priority runs through nice so long backups stay polite;
        // raising priority needs privileges we usually don't have.
        if cfg!(unix) && self.priority == Some(Priority::Low) {
            let mut command = Command::new("nice");
            command.arg("-n").arg("10").arg(self.binary).args(args);
            command
        } else {
            let mut command = Command::new(self.binary);
            command.args(args);
            command
        }
    }
}

/// Map an exit code and captured output to an [`ExitKind`].
///
/// The cloud-file special case is applied by the wrapper before calling
/// this, since it needs platform and version context.
pub(crate) fn classify_exit(code: Option<i32>, output: &str) -> ExitKind {
    match code {
        Some(0) => ExitKind::Success,
        Some(10) => ExitKind::Uninitialized,
        _ if output.contains("Fatal: repository does not exist") => ExitKind::Uninitialized,
        code => ExitKind::Failure { code },
    }
}

/// Legacy Windows cloud-file tolerance: with exit 3, the run is acceptable
/// when every `error:` line matches a known cloud pattern.
pub(crate) fn all_errors_are_cloud_errors(output: &str) -> bool {
    let error_line =
        regex::Regex::new(r"(?i)^error").expect("static regex");
    let cloud_patterns = regex::Regex::new(
        r"(?i)error: read .*: (The cloud operation is not supported on a read-only volume\.|The media is write protected\.)|error: read .*:.*cloud.*",
    )
    .expect("static regex");

    let mut saw_error = false;
    for line in output.lines() {
        if error_line.is_match(line) {
            saw_error = true;
            if !cloud_patterns.is_match(line) {
                return false;
            }
        }
    }
    debug!("cloud-file scan finished, saw_error={saw_error}");
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_of_exit_codes() {
        assert_eq!(classify_exit(Some(0), ""), ExitKind::Success);
        assert_eq!(classify_exit(Some(10), ""), ExitKind::Uninitialized);
        assert_eq!(
            classify_exit(Some(1), "Fatal: repository does not exist"),
            ExitKind::Uninitialized
        );
        assert_eq!(
            classify_exit(Some(1), "boom"),
            ExitKind::Failure { code: Some(1) }
        );
        assert_eq!(classify_exit(None, ""), ExitKind::Failure { code: None });
    }

    #[test]
    fn cloud_error_patterns() {
        let tolerated = "\
error: read \\\\?\\C:\\Users\\x\\f1: The cloud operation is not supported on a read-only volume.
error: read \\\\?\\C:\\Users\\x\\f2: The media is write protected.
error: read \\\\?\\C:\\Users\\x\\f3: cloud provider timeout";
        assert!(all_errors_are_cloud_errors(tolerated));

        let mixed = format!("{tolerated}\nerror: read /other/file: permission denied");
        assert!(!all_errors_are_cloud_errors(&mixed));

        // No error lines at all is tolerable by definition.
        assert!(all_errors_are_cloud_errors("Files: 1 new, 0 changed"));
    }

    #[test]
    fn priority_parsing() {
        assert_eq!(Priority::parse("low"), Some(Priority::Low));
        assert_eq!(Priority::parse("normal"), Some(Priority::Normal));
        assert_eq!(Priority::parse("high"), Some(Priority::High));
        assert_eq!(Priority::parse("extreme"), None);
    }

    #[tokio::test]
    async fn executor_captures_output_and_exit() {
        let logger = OpLogger::new();
        let cancel = CancelFlag::new();
        let executor = Executor {
            binary: "sh",
            priority: None,
            cancel: &cancel,
            logger: &logger,
            stdout_sink: None,
            stderr_sink: None,
            live_output: false,
        };
        let request = ExecRequest::new(vec![
            "-c".to_string(),
            "echo out-line; echo err-line >&2".to_string(),
        ]);
        let outcome = executor.run(&request).await.unwrap();
        assert_eq!(outcome.kind, ExitKind::Success);
        assert!(outcome.output.contains("out-line"));
        assert!(outcome.output.contains("err-line"));
        assert!(outcome.exec_time >= 0.0);
    }

    #[tokio::test]
    async fn executor_reports_failure_exit() {
        let logger = OpLogger::new();
        let cancel = CancelFlag::new();
        let executor = Executor {
            binary: "sh",
            priority: None,
            cancel: &cancel,
            logger: &logger,
            stdout_sink: None,
            stderr_sink: None,
            live_output: false,
        };
        let request = ExecRequest::new(vec!["-c".to_string(), "exit 7".to_string()]);
        let outcome = executor.run(&request).await.unwrap();
        assert_eq!(outcome.kind, ExitKind::Failure { code: Some(7) });
    }

    #[tokio::test]
    async fn executor_times_out_long_children() {
        let logger = OpLogger::new();
        let cancel = CancelFlag::new();
        let executor = Executor {
            binary: "sh",
            priority: None,
            cancel: &cancel,
            logger: &logger,
            stdout_sink: None,
            stderr_sink: None,
            live_output: false,
        };
        let mut request = ExecRequest::new(vec!["-c".to_string(), "sleep 30".to_string()]);
        request.timeout = Some(Duration::from_millis(100));
        let outcome = executor.run(&request).await.unwrap();
        assert_eq!(outcome.kind, ExitKind::TimedOut);
    }

    #[tokio::test]
    async fn executor_honors_cancellation() {
        let logger = OpLogger::new();
        let cancel = CancelFlag::new();
        cancel.cancel();
        let executor = Executor {
            binary: "sh",
            priority: None,
            cancel: &cancel,
            logger: &logger,
            stdout_sink: None,
            stderr_sink: None,
            live_output: false,
        };
        let request = ExecRequest::new(vec!["-c".to_string(), "sleep 30".to_string()]);
        let outcome = executor.run(&request).await.unwrap();
        assert_eq!(outcome.kind, ExitKind::Cancelled);
    }

    #[tokio::test]
    async fn executor_feeds_stdin() {
        let logger = OpLogger::new();
        let cancel = CancelFlag::new();
        let executor = Executor {
            binary: "cat",
            priority: None,
            cancel: &cancel,
            logger: &logger,
            stdout_sink: None,
            stderr_sink: None,
            live_output: false,
        };
        let mut request = ExecRequest::new(vec![]);
        request.stdin_data = Some(b"piped payload".to_vec());
        let outcome = executor.run(&request).await.unwrap();
        assert_eq!(outcome.kind, ExitKind::Success);
        assert!(outcome.output.contains("piped payload"));
    }

    #[tokio::test]
    async fn executor_forwards_lines_to_sinks() {
        let logger = OpLogger::new();
        let cancel = CancelFlag::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let executor = Executor {
            binary: "sh",
            priority: None,
            cancel: &cancel,
            logger: &logger,
            stdout_sink: Some(&tx),
            stderr_sink: None,
            live_output: false,
        };
        let request = ExecRequest::new(vec!["-c".to_string(), "echo hello".to_string()]);
        executor.run(&request).await.unwrap();
        drop(tx);
        assert_eq!(rx.recv().await.as_deref(), Some("hello"));
    }
}
