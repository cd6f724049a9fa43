//! # Sample-Rate Conversion
//!
//! Runs the external converter on a stored upload to produce the file the backend
//! recognizer expects. The converter is an opaque command called as
//! `<command> [args...] <input-file> <output-file>`.
//!
//! ## Output Naming:
//! The converted file sits next to its input with the configured prefix in front of the
//! filename: `./input-log/input-143015000123-4.wav` → `./input-log/8k_input-143015000123-4.wav`.
//!
//! ## Failure Detection:
//! A run only counts as successful when the command exits with status 0 *and* a
//! non-empty output file exists afterwards.

use crate::audio::storage::StoredFile;
use crate::config::TranscoderConfig;
use crate::error::{AppError, AppResult};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;

/// A converted file ready to be handed to the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodedFile {
    pub path: PathBuf,
}

/// Invokes the converter command for each upload.
#[derive(Debug, Clone)]
pub struct TranscoderInvoker {
    command: String,
    args: Vec<String>,
    output_prefix: String,
    timeout: Option<Duration>,
}

impl TranscoderInvoker {
    pub fn new(config: &TranscoderConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            output_prefix: config.output_prefix.clone(),
            timeout: config.timeout(),
        }
    }

    /// Override the conversion budget.
    #[cfg(test)]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Deterministic output path for a stored upload.
    pub fn output_path_for(&self, stored: &StoredFile) -> PathBuf {
        let file_name = format!("{}{}", self.output_prefix, stored.file_name);
        match stored.path.parent() {
            Some(dir) => dir.join(file_name),
            None => PathBuf::from(file_name),
        }
    }

    /// Convert `stored`, blocking the calling task until the command exits.
    ///
    /// ## Errors:
    /// - `AppError::Transcode` if the command cannot be started, exits non-zero,
    ///   or leaves no (or an empty) output file
    /// - `AppError::Timeout` if a budget is configured and the command overruns it;
    ///   the child is killed in that case
    pub async fn transcode(&self, stored: &StoredFile) -> AppResult<TranscodedFile> {
        let output_path = self.output_path_for(stored);
        let start_time = Instant::now();

        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .arg(&stored.path)
            .arg(&output_path)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let run = command.output();
        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, run).await.map_err(|_| {
                tracing::warn!(
                    command = %self.command,
                    input = %stored.path.display(),
                    "Converter timed out, killing it"
                );
                AppError::Timeout { stage: "transcode", after: limit }
            })?,
            None => run.await,
        }
        .map_err(|e| AppError::Transcode(format!("failed to run {}: {}", self.command, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr.lines().last().unwrap_or("").trim();
            return Err(AppError::Transcode(if detail.is_empty() {
                format!("{} exited with {}", self.command, output.status)
            } else {
                format!("{} exited with {}: {}", self.command, output.status, detail)
            }));
        }

        match tokio::fs::metadata(&output_path).await {
            Ok(meta) if meta.is_file() && meta.len() > 0 => {}
            Ok(_) => {
                return Err(AppError::Transcode(format!(
                    "{} produced an empty output file {}",
                    self.command,
                    output_path.display()
                )));
            }
            Err(_) => {
                return Err(AppError::Transcode(format!(
                    "{} did not produce {}",
                    self.command,
                    output_path.display()
                )));
            }
        }

        tracing::debug!(
            input = %stored.path.display(),
            output = %output_path.display(),
            duration_ms = %start_time.elapsed().as_millis(),
            "Audio converted"
        );

        Ok(TranscodedFile { path: output_path })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::audio::storage::StorageWriter;

    fn invoker(command: &str, args: &[&str]) -> TranscoderInvoker {
        TranscoderInvoker::new(&TranscoderConfig {
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            output_prefix: "8k_".to_string(),
            timeout_secs: 0,
        })
    }

    #[test]
    fn test_output_path_uses_prefix_in_same_directory() {
        let stored = StoredFile {
            path: PathBuf::from("./input-log/input-143015000000-0.wav"),
            file_name: "input-143015000000-0.wav".to_string(),
            size_bytes: 4,
        };

        let path = invoker("cp", &[]).output_path_for(&stored);
        assert_eq!(path, PathBuf::from("./input-log/8k_input-143015000000-0.wav"));
    }

    #[tokio::test]
    async fn test_successful_conversion() {
        let dir = tempfile::tempdir().unwrap();
        let stored = StorageWriter::new(dir.path()).store(b"pcm data").await.unwrap();

        let transcoded = invoker("cp", &[]).transcode(&stored).await.unwrap();

        assert_eq!(
            transcoded.path.file_name().and_then(|n| n.to_str()),
            Some(format!("8k_{}", stored.file_name).as_str())
        );
        assert_eq!(std::fs::read(&transcoded.path).unwrap(), b"pcm data");
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_transcode_error() {
        let dir = tempfile::tempdir().unwrap();
        let stored = StorageWriter::new(dir.path()).store(b"pcm data").await.unwrap();

        // Writes the output, then fails: the exit status alone must fail the run.
        let converter = invoker("sh", &["-c", "cp \"$1\" \"$2\"; echo 'bad header' >&2; exit 3", "convert"]);
        let err = converter.transcode(&stored).await.unwrap_err();

        match err {
            AppError::Transcode(msg) => assert!(msg.contains("bad header"), "message: {msg}"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_output_is_transcode_error() {
        let dir = tempfile::tempdir().unwrap();
        let stored = StorageWriter::new(dir.path()).store(b"pcm data").await.unwrap();

        let err = invoker("true", &[]).transcode(&stored).await.unwrap_err();
        assert!(matches!(err, AppError::Transcode(ref msg) if msg.contains("did not produce")));
    }

    #[tokio::test]
    async fn test_empty_output_is_transcode_error() {
        let dir = tempfile::tempdir().unwrap();
        let stored = StorageWriter::new(dir.path()).store(b"pcm data").await.unwrap();

        let err = invoker("sh", &["-c", ": > \"$2\"", "convert"])
            .transcode(&stored)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Transcode(ref msg) if msg.contains("empty output")));
    }

    #[tokio::test]
    async fn test_unknown_command_is_transcode_error() {
        let dir = tempfile::tempdir().unwrap();
        let stored = StorageWriter::new(dir.path()).store(b"pcm data").await.unwrap();

        let err = invoker("/nonexistent/convert_sample_rate.sh", &[])
            .transcode(&stored)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Transcode(_)));
    }

    #[tokio::test]
    async fn test_slow_converter_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let stored = StorageWriter::new(dir.path()).store(b"pcm data").await.unwrap();

        let converter = invoker("sh", &["-c", "sleep 5", "convert"])
            .with_timeout(Some(Duration::from_millis(200)));
        let started = Instant::now();
        let err = converter.transcode(&stored).await.unwrap_err();

        assert!(matches!(err, AppError::Timeout { stage: "transcode", .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
