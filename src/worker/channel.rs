//! # Backend Worker Channel
//!
//! Owns the single long-lived backend recognizer process and turns its strictly
//! sequential stdin/stdout line protocol into an operation many request handlers can
//! call concurrently.
//!
//! ## Protocol:
//! One newline-terminated request line in, one newline-terminated response line out,
//! strictly FIFO, nothing else on the pipes.
//!
//! ## Critical Section:
//! The backend's stdin and stdout live together behind one `tokio::sync::Mutex`. An
//! exchange takes the *owned* guard, moves it into a blocking task, writes its line,
//! reads exactly one line back and only then drops the guard. So:
//! - no two requests ever interleave on the pipes
//! - a caller that times out gives up waiting, but the blocking task still holds the
//!   lock until the backend's answer to *that* request has been read and discarded,
//!   so the next caller never receives a stale line
//!
//! ## Failure Model:
//! The first time the backend is seen dead (exited, broken pipe, EOF on stdout) the
//! channel records the reason and every later exchange fails immediately with
//! `AppError::WorkerUnavailable`. The channel never restarts the backend.

use crate::config::WorkerConfig;
use crate::error::{AppError, AppResult};
use anyhow::Context;
use serde::Serialize;
use std::fmt;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// The backend's pipe pair. Only ever touched while holding the channel lock.
struct WorkerIo {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// Health and counters shared between the channel and its blocking tasks.
#[derive(Debug, Default)]
struct WorkerStatus {
    /// Why the backend is unusable; `None` while it is healthy
    failure: Mutex<Option<String>>,
    exchanges_completed: AtomicU64,
    exchanges_failed: AtomicU64,
}

impl WorkerStatus {
    fn failure(&self) -> Option<String> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Record the backend as unusable. The first reason sticks.
    fn mark_unavailable(&self, reason: String) -> AppError {
        let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        match failure.as_ref() {
            Some(existing) => AppError::WorkerUnavailable(existing.clone()),
            None => {
                tracing::error!(reason = %reason, "Backend worker became unavailable");
                *failure = Some(reason.clone());
                AppError::WorkerUnavailable(reason)
            }
        }
    }
}

/// Point-in-time view of the channel, reported by `/health` and `/metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub available: bool,
    pub pid: u32,
    pub failure: Option<String>,
    pub exchanges_completed: u64,
    pub exchanges_failed: u64,
}

/// Serialized request/response access to the backend process.
///
/// ## Thread Safety:
/// Everything inside is behind `Arc`, so the channel is created once at startup and
/// shared by reference (through `AppState`) with every request handler.
pub struct WorkerChannel {
    io: Arc<AsyncMutex<WorkerIo>>,
    process: Arc<Mutex<Child>>,
    status: Arc<WorkerStatus>,
    pid: u32,
    exchange_timeout: Option<Duration>,
}

impl WorkerChannel {
    /// Start the backend process with piped stdin/stdout.
    ///
    /// The backend's stderr is inherited so its diagnostics end up in the
    /// front-end's own log stream.
    pub fn spawn(config: &WorkerConfig) -> anyhow::Result<Self> {
        let mut child = Command::new(&config.command)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("failed to start backend worker `{}`", config.command))?;

        let stdin = child
            .stdin
            .take()
            .context("backend worker stdin was not captured")?;
        let stdout = child
            .stdout
            .take()
            .context("backend worker stdout was not captured")?;
        let pid = child.id();

        tracing::info!(pid, command = %config.command, args = ?config.args, "Backend worker started");

        Ok(Self {
            io: Arc::new(AsyncMutex::new(WorkerIo {
                stdin,
                stdout: BufReader::new(stdout),
            })),
            process: Arc::new(Mutex::new(child)),
            status: Arc::new(WorkerStatus::default()),
            pid,
            exchange_timeout: config.exchange_timeout(),
        })
    }

    /// Override the per-exchange budget.
    #[cfg(test)]
    pub fn with_exchange_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.exchange_timeout = timeout;
        self
    }

    /// Send one request line and wait for the backend's response line.
    ///
    /// ## Steps:
    /// 1. Acquire exclusive access to the pipes (other callers queue in FIFO order)
    /// 2. Write `request_line` plus `\n` and flush
    /// 3. Read exactly one line back
    /// 4. Release exclusive access
    ///
    /// The returned line has its trailing newline stripped.
    ///
    /// ## Errors:
    /// - `AppError::WorkerUnavailable` if the backend is (or turns out to be) dead
    /// - `AppError::Timeout` if an exchange budget is configured and exceeded
    /// - `AppError::Internal` if `request_line` itself contains a line break
    pub async fn exchange(&self, request_line: &str) -> AppResult<String> {
        if request_line.contains(['\n', '\r']) {
            return Err(AppError::Internal(
                "worker request must be a single line".to_string(),
            ));
        }

        let result = match self.exchange_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.locked_exchange(request_line)).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(
                        request = %request_line,
                        timeout_ms = %limit.as_millis(),
                        "Backend exchange timed out"
                    );
                    Err(AppError::Timeout { stage: "exchange", after: limit })
                }
            },
            None => self.locked_exchange(request_line).await,
        };

        match &result {
            Ok(_) => self.status.exchanges_completed.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.status.exchanges_failed.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    async fn locked_exchange(&self, request_line: &str) -> AppResult<String> {
        if let Some(reason) = self.status.failure() {
            return Err(AppError::WorkerUnavailable(reason));
        }

        let guard = Arc::clone(&self.io).lock_owned().await;
        let process = Arc::clone(&self.process);
        let status = Arc::clone(&self.status);
        let line = request_line.to_string();

        tokio::task::spawn_blocking(move || exchange_blocking(guard, &process, &status, &line))
            .await
            .map_err(|e| AppError::Internal(format!("backend exchange task failed: {}", e)))?
    }

    /// Whether exchanges can still succeed. Also notices a backend that exited while idle.
    pub fn is_available(&self) -> bool {
        self.refresh_liveness();
        self.status.failure().is_none()
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        self.refresh_liveness();
        let failure = self.status.failure();
        WorkerSnapshot {
            available: failure.is_none(),
            pid: self.pid,
            failure,
            exchanges_completed: self.status.exchanges_completed.load(Ordering::Relaxed),
            exchanges_failed: self.status.exchanges_failed.load(Ordering::Relaxed),
        }
    }

    /// Stop the backend process. Later exchanges fail with `WorkerUnavailable`.
    ///
    /// Does not wait for an in-flight exchange; the kill makes its read hit EOF.
    pub fn shutdown(&self) {
        {
            let mut failure = self
                .status
                .failure
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            failure.get_or_insert_with(|| "backend worker was shut down".to_string());
        }

        let mut child = self.process.lock().unwrap_or_else(PoisonError::into_inner);
        match child.try_wait() {
            Ok(Some(status)) => {
                tracing::info!(pid = self.pid, %status, "Backend worker already exited");
            }
            _ => {
                if let Err(e) = child.kill() {
                    tracing::warn!(pid = self.pid, error = %e, "Failed to kill backend worker");
                }
                match child.wait() {
                    Ok(status) => tracing::info!(pid = self.pid, %status, "Backend worker stopped"),
                    Err(e) => tracing::warn!(pid = self.pid, error = %e, "Failed to reap backend worker"),
                }
            }
        }
    }

    /// Mark the channel unavailable if the backend process has exited since the last check.
    fn refresh_liveness(&self) {
        if self.status.failure().is_some() {
            return;
        }
        let exited = self
            .process
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_wait();
        match exited {
            Ok(Some(exit)) => {
                self.status
                    .mark_unavailable(format!("backend worker exited with {}", exit));
            }
            Ok(None) => {}
            Err(e) => {
                self.status
                    .mark_unavailable(format!("cannot query backend worker: {}", e));
            }
        }
    }
}

impl fmt::Debug for WorkerChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerChannel")
            .field("pid", &self.pid)
            .field("available", &self.status.failure().is_none())
            .field("exchange_timeout", &self.exchange_timeout)
            .finish_non_exhaustive()
    }
}

/// One write-then-read cycle. Runs on the blocking pool with the lock held.
fn exchange_blocking(
    mut io: OwnedMutexGuard<WorkerIo>,
    process: &Mutex<Child>,
    status: &WorkerStatus,
    line: &str,
) -> AppResult<String> {
    // Another exchange may have broken the channel while this one was queued.
    if let Some(reason) = status.failure() {
        return Err(AppError::WorkerUnavailable(reason));
    }

    let exited = process
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .try_wait();
    match exited {
        Ok(Some(exit)) => {
            return Err(status.mark_unavailable(format!("backend worker exited with {}", exit)));
        }
        Ok(None) => {}
        Err(e) => {
            return Err(status.mark_unavailable(format!("cannot query backend worker: {}", e)));
        }
    }

    let io = &mut *io;
    if let Err(e) = writeln!(io.stdin, "{}", line).and_then(|_| io.stdin.flush()) {
        return Err(status.mark_unavailable(format!("cannot write to backend worker: {}", e)));
    }

    let mut response = Vec::new();
    match io.stdout.read_until(b'\n', &mut response) {
        Ok(0) => Err(status.mark_unavailable(
            "backend worker closed its output stream".to_string(),
        )),
        Ok(_) if response.last() != Some(&b'\n') => Err(status.mark_unavailable(
            "backend worker output ended mid-line".to_string(),
        )),
        Ok(_) => {
            let text = String::from_utf8_lossy(&response);
            let text = text.trim_end_matches(['\n', '\r']).to_string();
            tracing::debug!(request = %line, response = %text, "Backend exchange completed");
            Ok(text)
        }
        Err(e) => Err(status.mark_unavailable(format!(
            "cannot read from backend worker: {}",
            e
        ))),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::{sh_worker as spawn_sh, ECHO_BACKEND};
    use std::collections::HashSet;
    use std::time::Instant;

    #[tokio::test]
    async fn test_single_exchange_strips_newline() {
        let channel = spawn_sh(ECHO_BACKEND);

        let response = channel.exchange("./input-log/8k_input-1.wav").await.unwrap();
        assert_eq!(response, "result:./input-log/8k_input-1.wav");

        let snapshot = channel.snapshot();
        assert!(snapshot.available);
        assert_eq!(snapshot.exchanges_completed, 1);
        channel.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_exchanges_never_cross_talk() {
        // Each reply carries the backend's own running count, so the replies also
        // show the order in which requests were admitted to the channel.
        let channel = Arc::new(spawn_sh(
            r#"n=0; while IFS= read -r line; do n=$((n+1)); echo "$n $line"; done"#,
        ));

        let mut handles = Vec::new();
        for i in 0..64 {
            let channel = Arc::clone(&channel);
            handles.push(tokio::spawn(async move {
                let request = format!("request-{i}");
                let response = channel.exchange(&request).await.unwrap();
                (request, response)
            }));
        }

        let mut sequence_numbers = HashSet::new();
        for handle in handles {
            let (request, response) = handle.await.unwrap();
            let (seq, echoed) = response.split_once(' ').unwrap();
            assert_eq!(echoed, request, "caller received someone else's response");
            assert!(sequence_numbers.insert(seq.parse::<u32>().unwrap()));
        }
        assert_eq!(sequence_numbers, (1..=64).collect::<HashSet<_>>());
        assert_eq!(channel.snapshot().exchanges_completed, 64);
        channel.shutdown();
    }

    #[tokio::test]
    async fn test_dead_backend_fails_fast() {
        let channel = spawn_sh("exit 3");

        let first = tokio::time::timeout(Duration::from_secs(5), channel.exchange("a"))
            .await
            .expect("exchange with a dead backend must not hang");
        assert!(matches!(first, Err(AppError::WorkerUnavailable(_))));
        assert!(!channel.is_available());

        let started = Instant::now();
        let second = channel.exchange("b").await;
        assert!(matches!(second, Err(AppError::WorkerUnavailable(_))));
        assert!(started.elapsed() < Duration::from_secs(1));

        let snapshot = channel.snapshot();
        assert!(!snapshot.available);
        assert!(snapshot.failure.is_some());
        assert_eq!(snapshot.exchanges_failed, 2);
    }

    #[tokio::test]
    async fn test_backend_exiting_while_idle_is_noticed_without_an_exchange() {
        let channel = spawn_sh("exit 1");
        tokio::time::sleep(Duration::from_millis(300)).await;

        let snapshot = channel.snapshot();
        assert!(!snapshot.available);
        assert!(snapshot.failure.unwrap().contains("exited"));
        assert_eq!(snapshot.exchanges_completed + snapshot.exchanges_failed, 0);
        assert!(!channel.is_available());
    }

    #[tokio::test]
    async fn test_backend_closing_stdout_is_unavailable() {
        let channel = spawn_sh("exec 1>&-; sleep 5");

        let result = tokio::time::timeout(Duration::from_secs(5), channel.exchange("a"))
            .await
            .expect("exchange must not hang on a closed stdout");
        assert!(matches!(result, Err(AppError::WorkerUnavailable(_))));
        channel.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timed_out_exchange_does_not_leak_its_response() {
        let channel = spawn_sh(
            r#"while IFS= read -r line; do case "$line" in slow*) sleep 1;; esac; echo "result:$line"; done"#,
        )
        .with_exchange_timeout(Some(Duration::from_millis(300)));

        let slow = channel.exchange("slow-1").await;
        assert!(matches!(slow, Err(AppError::Timeout { stage: "exchange", .. })));

        // Let the backend finish answering the abandoned request.
        tokio::time::sleep(Duration::from_millis(1200)).await;

        let fast = channel.exchange("fast-2").await.unwrap();
        assert_eq!(fast, "result:fast-2");
        assert!(channel.is_available());
        channel.shutdown();
    }

    #[tokio::test]
    async fn test_multiline_request_is_rejected() {
        let channel = spawn_sh(ECHO_BACKEND);

        let err = channel.exchange("a\nb").await.unwrap_err();
        assert!(matches!(err, AppError::Internal(_)));
        assert!(channel.is_available());
        channel.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_makes_channel_unavailable() {
        let channel = spawn_sh(ECHO_BACKEND);
        channel.shutdown();

        let err = channel.exchange("a").await.unwrap_err();
        assert!(matches!(err, AppError::WorkerUnavailable(ref msg) if msg.contains("shut down")));
    }

    #[test]
    fn test_spawn_unknown_command_fails() {
        let result = WorkerChannel::spawn(&WorkerConfig {
            command: "/nonexistent/server.sh".to_string(),
            args: Vec::new(),
            exchange_timeout_secs: 0,
        });
        assert!(result.is_err());
    }
}
