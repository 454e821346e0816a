// SPDX-License-Identifier: MIT OR Apache-2.0
//! Metrics destinations: text file or HTTP push gateway.

use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Destination failure.
#[derive(Debug, Error)]
pub enum DestError {
    #[error("cannot write metrics file {path}: {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("destination does not contain '{token}' keyword, not uploading")]
    MissingToken { token: &'static str },
    #[error("cannot upload metrics: {0}")]
    Upload(String),
    #[error("push gateway answered {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Write (or append) exposition lines to a file.
pub fn write_metrics_file(path: &Path, samples: &[String], append: bool) -> Result<(), DestError> {
    use std::io::Write;

    let mut body = String::new();
    for sample in samples {
        body.push_str(sample);
        body.push('\n');
    }

    let result = if append {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| f.write_all(body.as_bytes()))
    } else {
        std::fs::write(path, body.as_bytes())
    };
    result.map_err(|source| DestError::File {
        path: path.display().to_string(),
        source,
    })
}

/// POST exposition lines to a push gateway.
///
/// The destination must contain both `metrics` and `job` tokens; the caller
/// appends `___repo_name=…___action=…` so every (repo, action) pair keeps
/// its own job identity on the gateway.
pub async fn upload_metrics(
    destination: &str,
    authentication: Option<(&str, &str)>,
    no_cert_verify: bool,
    samples: &[String],
) -> Result<(), DestError> {
    let lowered = destination.to_lowercase();
    if !lowered.contains("metrics") {
        return Err(DestError::MissingToken { token: "metrics" });
    }
    if !lowered.contains("job") {
        return Err(DestError::MissingToken { token: "job" });
    }

    let mut body = String::new();
    for sample in samples {
        body.push_str(sample);
        body.push('\n');
    }

    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(no_cert_verify)
        .timeout(Duration::from_secs(4))
        .build()
        .map_err(|e| DestError::Upload(e.to_string()))?;

    let mut request = client
        .post(destination)
        .header("X-Requested-With", concat!("backhaul ", env!("CARGO_PKG_VERSION")))
        .header("Content-Type", "text/html")
        .body(body);
    if let Some((username, password)) = authentication {
        request = request.basic_auth(username, Some(password));
    }

    let response = request
        .send()
        .await
        .map_err(|e| DestError::Upload(e.to_string()))?;

    if response.status().is_success() {
        info!("metrics pushed successfully");
        Ok(())
    } else {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        warn!("could not push metrics: {status}: {body}");
        Err(DestError::Rejected { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn writes_samples_with_trailing_newlines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metrics.prom");
        write_metrics_file(&path, &["a 1".to_string(), "b 2".to_string()], false).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a 1\nb 2\n");
    }

    #[test]
    fn append_mode_keeps_existing_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metrics.prom");
        write_metrics_file(&path, &["a 1".to_string()], false).unwrap();
        write_metrics_file(&path, &["b 2".to_string()], true).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a 1\nb 2\n");
    }

    #[test]
    fn overwrite_mode_replaces_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metrics.prom");
        write_metrics_file(&path, &["a 1".to_string()], false).unwrap();
        write_metrics_file(&path, &["b 2".to_string()], false).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "b 2\n");
    }

    #[tokio::test]
    async fn upload_requires_metrics_and_job_tokens() {
        let err = upload_metrics("https://example.com/push", None, false, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, DestError::MissingToken { token: "metrics" }));

        let err = upload_metrics("https://example.com/metrics", None, false, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, DestError::MissingToken { token: "job" }));
    }
}
