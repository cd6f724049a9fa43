//! # Recognition Pipeline
//!
//! Drives one upload from raw bytes to a transcript:
//! Storage Writer → Transcoder Invoker → Worker Channel.
//!
//! ## Request Lifecycle:
//! 1. **Receiving**: multipart body being read by the HTTP handler
//! 2. **Stored**: upload written to the input directory
//! 3. **Transcoded**: converter produced the resampled file
//! 4. **Exchanged**: backend answered with a transcript line
//! 5. **Responded**: transcript written back to the client
//! 6. **Failed**: any stage above gave up; terminal, reachable from every non-terminal stage

use crate::audio::storage::{StorageWriter, StoredFile};
use crate::audio::transcoder::{TranscodedFile, TranscoderInvoker};
use crate::error::{AppError, AppResult};
use crate::worker::WorkerChannel;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Where a request currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStage {
    Receiving,
    Stored,
    Transcoded,
    Exchanged,
    Responded,
    Failed,
}

impl RequestStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStage::Receiving => "receiving",
            RequestStage::Stored => "stored",
            RequestStage::Transcoded => "transcoded",
            RequestStage::Exchanged => "exchanged",
            RequestStage::Responded => "responded",
            RequestStage::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStage::Responded | RequestStage::Failed)
    }
}

/// Tracks one request through its stages and logs every transition.
#[derive(Debug)]
pub struct RequestLifecycle {
    request_id: Uuid,
    stage: RequestStage,
    started_at: Instant,
}

impl RequestLifecycle {
    pub fn begin(request_id: Uuid) -> Self {
        tracing::debug!(request_id = %request_id, "Receiving upload");
        Self {
            request_id,
            stage: RequestStage::Receiving,
            started_at: Instant::now(),
        }
    }

    #[cfg(test)]
    pub fn stage(&self) -> RequestStage {
        self.stage
    }

    /// Move to `next`. Terminal stages are final; later transitions are ignored.
    pub fn advance(&mut self, next: RequestStage) {
        if self.stage.is_terminal() {
            return;
        }
        tracing::debug!(
            request_id = %self.request_id,
            from = self.stage.as_str(),
            to = next.as_str(),
            elapsed_ms = %self.started_at.elapsed().as_millis(),
            "Request stage changed"
        );
        self.stage = next;
    }

    /// Record a failure in the current stage and move to `Failed`.
    pub fn fail(&mut self, error: &AppError) {
        if self.stage.is_terminal() {
            return;
        }
        tracing::warn!(
            request_id = %self.request_id,
            stage = self.stage.as_str(),
            kind = error.kind(),
            error = %error,
            "Request failed"
        );
        self.stage = RequestStage::Failed;
    }

    pub fn respond(&mut self) {
        self.advance(RequestStage::Responded);
        tracing::info!(
            request_id = %self.request_id,
            duration_ms = %self.started_at.elapsed().as_millis(),
            "Transcript delivered"
        );
    }
}

/// Everything one successful run produced.
#[derive(Debug, Clone)]
pub struct RecognitionOutcome {
    pub stored: StoredFile,
    pub transcoded: TranscodedFile,
    pub transcript: String,
}

/// Shared by every request handler; only the worker channel holds a lock.
#[derive(Debug)]
pub struct RecognitionPipeline {
    storage: StorageWriter,
    transcoder: TranscoderInvoker,
    worker: Arc<WorkerChannel>,
}

impl RecognitionPipeline {
    pub fn new(storage: StorageWriter, transcoder: TranscoderInvoker, worker: Arc<WorkerChannel>) -> Self {
        Self {
            storage,
            transcoder,
            worker,
        }
    }

    pub fn worker(&self) -> &WorkerChannel {
        &self.worker
    }

    /// Run the stored → transcoded → exchanged stages for one upload.
    ///
    /// On error `lifecycle` is left in `Failed` and the error is returned unchanged,
    /// so the caller can turn it into an HTTP response.
    pub async fn process(
        &self,
        lifecycle: &mut RequestLifecycle,
        audio: &[u8],
    ) -> AppResult<RecognitionOutcome> {
        let result = self.run_stages(lifecycle, audio).await;
        if let Err(error) = &result {
            lifecycle.fail(error);
        }
        result
    }

    async fn run_stages(
        &self,
        lifecycle: &mut RequestLifecycle,
        audio: &[u8],
    ) -> AppResult<RecognitionOutcome> {
        let stored = self.storage.store(audio).await?;
        lifecycle.advance(RequestStage::Stored);

        let transcoded = self.transcoder.transcode(&stored).await?;
        lifecycle.advance(RequestStage::Transcoded);

        let request_line = transcoded.path.to_str().ok_or_else(|| {
            AppError::Internal(format!(
                "converted file path is not valid UTF-8: {}",
                transcoded.path.display()
            ))
        })?;
        let transcript = self.worker.exchange(request_line).await?;
        lifecycle.advance(RequestStage::Exchanged);

        Ok(RecognitionOutcome {
            stored,
            transcoded,
            transcript,
        })
    }
}
