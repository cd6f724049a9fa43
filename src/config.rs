//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix, `__` between nested keys)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platform conventions)
//! 2. Environment variables (APP_SERVER__HOST, APP_WORKER__COMMAND, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration that contains all settings.
///
/// Grouped by the component that consumes each section: the HTTP server, the storage
/// writer, the transcoder invoker, the worker channel and the request limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub transcoder: TranscoderConfig,
    pub worker: WorkerConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Fields:
/// - `host`: IP address or hostname to bind the server to
/// - `port`: TCP port number to listen on
/// - `workers`: HTTP worker threads; 0 lets actix pick one per CPU core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
}

/// Where uploads land and how they are named.
///
/// ## Fields:
/// - `input_dir`: directory for raw uploads and transcoded files (created at startup)
/// - `upload_field`: preferred multipart field carrying the audio
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub input_dir: PathBuf,
    pub upload_field: String,
}

/// External sample-rate converter, invoked as `<command> [args...] <input> <output>`.
///
/// ## Fields:
/// - `command`: path to the converter executable or script
/// - `args`: leading arguments placed before the two file paths
/// - `output_prefix`: prepended to the raw filename to name the converted file
/// - `timeout_secs`: budget for one conversion; 0 disables the timeout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscoderConfig {
    pub command: String,
    pub args: Vec<String>,
    pub output_prefix: String,
    pub timeout_secs: u64,
}

/// Long-lived backend recognizer started once at startup.
///
/// ## Fields:
/// - `command`: executable started as the backend process
/// - `args`: arguments passed to the backend
/// - `exchange_timeout_secs`: budget for one request/response exchange; 0 disables it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub command: String,
    pub args: Vec<String>,
    pub exchange_timeout_secs: u64,
}

/// Request limits.
///
/// ## Fields:
/// - `max_concurrent_requests`: recognition requests allowed in flight; 0 = unbounded
/// - `max_upload_bytes`: largest accepted audio payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_requests: usize,
    pub max_upload_bytes: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "localhost".to_string(),
                port: 8081,
                workers: 0,
            },
            storage: StorageConfig {
                input_dir: PathBuf::from("./input-log/"),
                upload_field: "file".to_string(),
            },
            transcoder: TranscoderConfig {
                command: "scripts/convert_sample_rate.sh".to_string(),
                args: Vec::new(),
                output_prefix: "8k_".to_string(),
                timeout_secs: 0,
            },
            worker: WorkerConfig {
                command: "scripts/server.sh".to_string(),
                args: Vec::new(),
                exchange_timeout_secs: 0,
            },
            performance: PerformanceConfig {
                max_concurrent_requests: 0,
                max_upload_bytes: 50 * 1024 * 1024, // 50MB
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=9000`: Override server port
    /// - `APP_STORAGE__INPUT_DIR=/var/lib/asr/uploads`: Override the upload directory
    /// - `APP_WORKER__ARGS="--beam 13 --online"`: Backend arguments (space separated)
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special cases for deployment platforms
    pub fn load() -> AppResult<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(" ")
                    .with_list_parse_key("worker.args")
                    .with_list_parse_key("transcoder.args")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Converter and backend commands are set
    /// - The output prefix is a plain filename fragment
    /// - Upload limit is greater than 0
    pub fn validate(&self) -> AppResult<()> {
        if self.server.port == 0 {
            return Err(AppError::ConfigError("Server port cannot be 0".to_string()));
        }

        if self.storage.input_dir.as_os_str().is_empty() {
            return Err(AppError::ConfigError("Storage input directory must be set".to_string()));
        }

        if self.transcoder.command.trim().is_empty() {
            return Err(AppError::ConfigError("Transcoder command must be set".to_string()));
        }

        let prefix = &self.transcoder.output_prefix;
        if prefix.is_empty() {
            return Err(AppError::ConfigError(
                "Transcoder output prefix cannot be empty".to_string(),
            ));
        }
        if prefix.contains('/') || prefix.contains(std::path::MAIN_SEPARATOR) {
            return Err(AppError::ConfigError(format!(
                "Transcoder output prefix must not contain a path separator: {}",
                prefix
            )));
        }

        if self.worker.command.trim().is_empty() {
            return Err(AppError::ConfigError("Worker command must be set".to_string()));
        }

        if self.performance.max_upload_bytes == 0 {
            return Err(AppError::ConfigError("Max upload size must be greater than 0".to_string()));
        }

        Ok(())
    }
}

impl TranscoderConfig {
    /// Conversion budget, `None` when unbounded.
    pub fn timeout(&self) -> Option<Duration> {
        secs_to_timeout(self.timeout_secs)
    }
}

impl WorkerConfig {
    /// Exchange budget, `None` when unbounded.
    pub fn exchange_timeout(&self) -> Option<Duration> {
        secs_to_timeout(self.exchange_timeout_secs)
    }
}

fn secs_to_timeout(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}
