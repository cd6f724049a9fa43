//! Helpers shared by the unit tests: `sh`-scripted backends and a config that points
//! every external command at something present on any Unix box.

use crate::config::{AppConfig, WorkerConfig};
use crate::worker::WorkerChannel;
use std::path::Path;

/// Answers every request line with `result:<line>`.
pub const ECHO_BACKEND: &str = r#"while IFS= read -r line; do echo "result:$line"; done"#;

pub fn sh_worker_config(script: &str) -> WorkerConfig {
    WorkerConfig {
        command: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        exchange_timeout_secs: 0,
    }
}

pub fn sh_worker(script: &str) -> WorkerChannel {
    WorkerChannel::spawn(&sh_worker_config(script)).expect("sh backend should start")
}

/// Defaults with uploads under `input_dir`, `cp` as the converter and an echoing backend.
pub fn test_config(input_dir: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.storage.input_dir = input_dir.to_path_buf();
    config.transcoder.command = "cp".to_string();
    config.transcoder.args = Vec::new();
    config.worker = sh_worker_config(ECHO_BACKEND);
    config
}
