//! # Upload Storage
//!
//! Persists each uploaded audio payload to its own file under the input directory
//! before any processing starts.
//!
//! ## Naming:
//! `input-HHMMSSffffff-N.wav`, local wall-clock time down to the microsecond followed by a
//! process-wide sequence number. Two uploads arriving in the same second, or even the same
//! microsecond, always get different names. Files are opened with create-new semantics, so
//! a leftover file from an earlier run is skipped rather than overwritten.

use crate::error::{AppError, AppResult};
use chrono::{DateTime, Local};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

/// Name clashes tolerated before giving up on a single upload.
const MAX_NAME_ATTEMPTS: usize = 16;

/// A payload that has been written to local storage.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredFile {
    /// Full path of the written file
    pub path: PathBuf,

    /// Bare filename inside the input directory
    pub file_name: String,

    /// Number of bytes written
    pub size_bytes: usize,
}

/// Writes uploads into the configured input directory.
///
/// ## Thread Safety:
/// The sequence counter is an `AtomicU64`, so one writer is shared by every
/// request handler without locking.
#[derive(Debug)]
pub struct StorageWriter {
    input_dir: PathBuf,
    sequence: AtomicU64,
}

impl StorageWriter {
    pub fn new(input_dir: impl Into<PathBuf>) -> Self {
        Self {
            input_dir: input_dir.into(),
            sequence: AtomicU64::new(0),
        }
    }

    /// Create the input directory (and parents) if it does not exist yet.
    ///
    /// Called once during startup; request handling never creates directories.
    pub fn ensure_input_dir(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.input_dir).map_err(|e| {
            anyhow::anyhow!(
                "failed to create input directory {}: {}",
                self.input_dir.display(),
                e
            )
        })
    }

    /// Write `audio` to a freshly named file.
    ///
    /// ## Errors:
    /// `AppError::Storage` when the directory is missing or unwritable. I/O failures are
    /// not retried; only a name that already exists moves on to the next sequence number.
    pub async fn store(&self, audio: &[u8]) -> AppResult<StoredFile> {
        self.store_at(audio, Local::now).await
    }

    async fn store_at(
        &self,
        audio: &[u8],
        clock: impl Fn() -> DateTime<Local>,
    ) -> AppResult<StoredFile> {
        for _ in 0..MAX_NAME_ATTEMPTS {
            let file_name = self.next_file_name(clock());
            let path = self.input_dir.join(&file_name);

            let mut file = match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    tracing::debug!(path = %path.display(), "Upload name already taken, trying next");
                    continue;
                }
                Err(e) => {
                    return Err(AppError::Storage(format!(
                        "cannot create {}: {}",
                        path.display(),
                        e
                    )));
                }
            };

            // tokio files complete writes in the background until flushed
            let written = match file.write_all(audio).await {
                Ok(()) => file.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                drop(file);
                if let Err(cleanup) = tokio::fs::remove_file(&path).await {
                    tracing::warn!(path = %path.display(), error = %cleanup, "Failed to remove partial upload");
                }
                return Err(AppError::Storage(format!("cannot write {}: {}", path.display(), e)));
            }

            tracing::debug!(path = %path.display(), size_bytes = audio.len(), "Upload stored");

            return Ok(StoredFile {
                path,
                file_name,
                size_bytes: audio.len(),
            });
        }

        Err(AppError::Storage(format!(
            "no free upload name in {} after {} attempts",
            self.input_dir.display(),
            MAX_NAME_ATTEMPTS
        )))
    }

    fn next_file_name(&self, now: DateTime<Local>) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("input-{}-{}.wav", now.format("%H%M%S%6f"), seq)
    }
}
