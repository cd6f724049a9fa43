//! # Application State Management
//!
//! Shared state handed to every HTTP request handler through `web::Data<AppState>`.
//!
//! ## What lives here:
//! - The validated configuration (read-only after startup)
//! - The recognition pipeline, which owns the single backend worker channel
//! - Request metrics (`Arc<RwLock<AppMetrics>>`, updated by the metrics middleware)
//! - The execution-context counter behind `GET /`
//! - An optional admission semaphore capping recognitions in flight
//!
//! ## Arc<RwLock<T>> Pattern
//! - **Arc**: every actix worker thread holds a clone of the same `AppState`
//! - **RwLock**: `/metrics` readers never block each other; request bookkeeping takes a
//!   short write lock
//!
//! Nothing here is held across an `.await`, so the std locks are fine inside async handlers.

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::pipeline::RecognitionPipeline;
use crate::worker::WorkerChannel;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// The main application state that's shared across all HTTP request handlers.
///
/// Cloning is cheap: every field is an `Arc` or `Copy`.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Application configuration, fixed once the server is running
    pub config: Arc<AppConfig>,

    /// Performance metrics (constantly being updated by requests)
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Storage writer → transcoder → worker channel
    pub pipeline: Arc<RecognitionPipeline>,

    /// Caps recognitions in flight; `None` when unbounded
    admission: Option<Arc<Semaphore>>,

    /// Source of the distinct ids returned by `GET /`
    context_counter: Arc<AtomicU64>,

    /// When the server started
    pub start_time: Instant,
}

/// Performance metrics collected across all HTTP requests.
///
/// ## Fields:
/// - **request_count**: Total requests processed (for load monitoring)
/// - **error_count**: Responses with a 4xx/5xx status (for reliability monitoring)
/// - **active_requests**: Requests currently being handled
/// - **endpoint_metrics**: Per-route statistics, keyed by `"<METHOD> <route pattern>"`
#[derive(Debug, Default)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    pub active_requests: u32,
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed performance metrics for a specific API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,

    /// Total time spent processing all requests to this endpoint (milliseconds)
    pub total_duration_ms: u64,

    pub error_count: u64,
}

/// Counts one request as active until dropped.
///
/// Returned by [`AppState::begin_request`]; the metrics middleware keeps it alive for
/// exactly as long as the wrapped service future runs, including when that future is
/// dropped early because the client went away.
#[must_use = "the request stops counting as active as soon as this guard is dropped"]
pub struct ActiveRequest {
    metrics: Arc<RwLock<AppMetrics>>,
}

impl Drop for ActiveRequest {
    fn drop(&mut self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.active_requests = metrics.active_requests.saturating_sub(1);
    }
}

impl AppState {
    /// Build the state around an already running backend worker.
    ///
    /// ## What this does:
    /// 1. Builds the storage writer and transcoder invoker from `config`
    /// 2. Wraps them with `worker` into the recognition pipeline
    /// 3. Creates the admission semaphore when `max_concurrent_requests > 0`
    /// 4. Records the current time as the server start time
    pub fn new(config: AppConfig, worker: Arc<WorkerChannel>) -> Self {
        let storage = crate::audio::StorageWriter::new(config.storage.input_dir.clone());
        let transcoder = crate::audio::TranscoderInvoker::new(&config.transcoder);
        let pipeline = RecognitionPipeline::new(storage, transcoder, worker);

        let admission = match config.performance.max_concurrent_requests {
            0 => None,
            limit => Some(Arc::new(Semaphore::new(limit))),
        };

        Self {
            config: Arc::new(config),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            pipeline: Arc::new(pipeline),
            admission,
            context_counter: Arc::new(AtomicU64::new(0)),
            start_time: Instant::now(),
        }
    }

    pub fn get_config(&self) -> &AppConfig {
        &self.config
    }

    pub fn worker(&self) -> &WorkerChannel {
        self.pipeline.worker()
    }

    /// Next execution-context id. Never repeats within one server run.
    pub fn next_context_id(&self) -> u64 {
        self.context_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Wait for a recognition slot.
    ///
    /// Returns `None` when admission is unbounded. Waiters are served in FIFO order;
    /// the slot is released when the returned permit is dropped.
    pub async fn admit(&self) -> AppResult<Option<OwnedSemaphorePermit>> {
        match &self.admission {
            None => Ok(None),
            Some(semaphore) => Arc::clone(semaphore)
                .acquire_owned()
                .await
                .map(Some)
                .map_err(|_| AppError::Internal("request admission is closed".to_string())),
        }
    }

    /// Recognition slots currently free, `None` when admission is unbounded.
    pub fn available_slots(&self) -> Option<usize> {
        self.admission.as_ref().map(|s| s.available_permits())
    }

    /// Increment the total request counter (called by middleware for every request).
    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.request_count += 1;
    }

    /// Increment the total error counter (any 4xx/5xx response).
    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    ///
    /// ## Parameters:
    /// - **endpoint**: `"<METHOD> <route pattern>"`, e.g. `"POST /"`
    /// - **duration_ms**: How long the request took to process
    /// - **is_error**: Whether the response status was 4xx/5xx
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);

        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;

        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Mark a request as active until the returned guard is dropped.
    pub fn begin_request(&self) -> ActiveRequest {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.active_requests += 1;
        ActiveRequest {
            metrics: Arc::clone(&self.metrics),
        }
    }

    /// Get a snapshot of current metrics (used for the /metrics endpoint).
    ///
    /// Copies the data out so the lock is not held while the response is serialized.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap_or_else(PoisonError::into_inner);
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            active_requests: metrics.active_requests,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    /// Average response time; 0.0 before the first request.
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed, from 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
