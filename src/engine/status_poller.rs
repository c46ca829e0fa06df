//! Per-target status polling.
//!
//! A scheduler thread fires at the target's refresh interval and hands each
//! poll to a short-lived thread. At most one poll per target is in flight; a
//! tick that finds one running is dropped. Results land in a `StatusCache`
//! whose snapshot readers clone without waiting on the poll.

use crate::engine::published::Published;
use crate::error::{ErrorRecord, StatusError};
use crate::services::cmd_runner::{run_bounded, CommandOutput, RunOutcome};
use crate::services::ipc::IpcClient;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Status stdout beyond this is treated as an error rather than parsed.
pub const MAX_STATUS_OUTPUT_BYTES: usize = 4 * 1024 * 1024;

/// Where a status payload comes from.
pub trait StatusSource: Send + Sync {
    fn fetch(&self) -> Result<JsonValue, StatusError>;
}

pub struct ExecStatusSource {
    cmd: Vec<String>,
    cwd: Option<String>,
    timeout: Duration,
}

impl ExecStatusSource {
    pub fn new(cmd: Vec<String>, cwd: Option<String>, timeout: Duration) -> Self {
        Self { cmd, cwd, timeout }
    }
}

impl StatusSource for ExecStatusSource {
    fn fetch(&self) -> Result<JsonValue, StatusError> {
        if self.cmd.is_empty() {
            return Err(StatusError::EmptyCommand);
        }
        let outcome = run_bounded(
            &self.cmd,
            self.cwd.as_deref(),
            self.timeout,
            MAX_STATUS_OUTPUT_BYTES,
        )
        .map_err(StatusError::Spawn)?;
        match outcome {
            RunOutcome::TimedOut { .. } => Err(StatusError::Timeout {
                seconds: self.timeout.as_secs_f64(),
            }),
            RunOutcome::Exited(out) => parse_status_output(&out),
        }
    }
}

/// Exit code zero and exactly one JSON document on stdout, or an error.
pub fn parse_status_output(out: &CommandOutput) -> Result<JsonValue, StatusError> {
    if !out.success() {
        let stderr = String::from_utf8_lossy(&out.stderr.bytes);
        let message = stderr
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| match out.code {
                Some(code) => format!("exited with code {code}"),
                None => "terminated by signal".to_string(),
            });
        return Err(StatusError::NonZeroExit(message));
    }
    if out.stdout.overflowed {
        return Err(StatusError::OutputTooLarge {
            limit: MAX_STATUS_OUTPUT_BYTES,
        });
    }
    let text = String::from_utf8_lossy(&out.stdout.bytes);
    let text = text.trim_start_matches('\u{feff}').trim();
    if text.is_empty() {
        return Err(StatusError::EmptyOutput);
    }
    serde_json::from_str(text).map_err(StatusError::MalformedJson)
}

/// Status over IPC. The handshake is redone whenever the client dropped it
/// after a transport failure.
pub struct IpcStatusSource {
    client: Arc<IpcClient>,
}

impl IpcStatusSource {
    pub fn new(client: Arc<IpcClient>) -> Self {
        Self { client }
    }
}

impl StatusSource for IpcStatusSource {
    fn fetch(&self) -> Result<JsonValue, StatusError> {
        if self.client.cached_hello().is_none() {
            self.client.hello()?;
        }
        Ok(self.client.get_status()?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub target_id: String,
    pub last_good_status: Option<JsonValue>,
    pub last_error: Option<ErrorRecord>,
    pub last_success_at: Option<DateTime<Utc>>,
    /// Sequence number of the last committed poll.
    pub sequence: u64,
    pub polls: u64,
}

impl StatusSnapshot {
    fn empty(target_id: &str) -> Self {
        Self {
            target_id: target_id.to_string(),
            last_good_status: None,
            last_error: None,
            last_success_at: None,
            sequence: 0,
            polls: 0,
        }
    }
}

/// Last good payload and last error of one target.
pub struct StatusCache {
    cell: Published<StatusSnapshot>,
    next_seq: AtomicU64,
    // Serializes commits only; readers never touch it
    commit: Mutex<()>,
}

impl StatusCache {
    pub fn new(target_id: &str) -> Self {
        Self {
            cell: Published::new(StatusSnapshot::empty(target_id)),
            next_seq: AtomicU64::new(1),
            commit: Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> Arc<StatusSnapshot> {
        self.cell.snapshot()
    }

    /// Sequence number for a poll about to start.
    pub fn begin(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Apply a poll result. A result older than the last committed one is
    /// discarded and `false` returned. A failure never clears the last good payload.
    pub fn commit(&self, seq: u64, result: Result<JsonValue, StatusError>) -> bool {
        let _guard = self.commit.lock().unwrap_or_else(|p| p.into_inner());
        if seq <= self.cell.snapshot().sequence {
            tracing::debug!(seq, "stale status result discarded");
            return false;
        }
        self.cell.update(|snap| {
            snap.sequence = seq;
            snap.polls += 1;
            match result {
                Ok(value) => {
                    snap.last_good_status = Some(value);
                    snap.last_error = None;
                    snap.last_success_at = Some(Utc::now());
                }
                Err(e) => {
                    let changed = snap
                        .last_error
                        .as_ref()
                        .map(|prev| prev.message != e.to_string())
                        .unwrap_or(true);
                    if changed {
                        tracing::warn!(target_id = %snap.target_id, error = %e, "status poll failed");
                    }
                    snap.last_error = Some(ErrorRecord::now(e.to_string()));
                }
            }
        });
        true
    }
}

enum Control {
    RefreshNow,
    Stop,
}

/// Scheduler for one target. Stops and joins on drop.
pub struct StatusPoller {
    target_id: String,
    cache: Arc<StatusCache>,
    control: Sender<Control>,
    handle: Option<JoinHandle<()>>,
}

impl StatusPoller {
    pub fn start(target_id: &str, interval: Duration, source: Arc<dyn StatusSource>) -> Self {
        let cache = Arc::new(StatusCache::new(target_id));
        let (tx, rx) = mpsc::channel::<Control>();
        let in_flight = Arc::new(AtomicBool::new(false));
        let worker_cache = Arc::clone(&cache);
        let id = target_id.to_string();
        let handle = thread::Builder::new()
            .name(format!("status-{target_id}"))
            .spawn(move || {
                tracing::info!(target_id = %id, ?interval, "status poller started");
                let mut polls: Vec<JoinHandle<()>> = Vec::new();
                let mut next = Instant::now();
                loop {
                    let wait = next.saturating_duration_since(Instant::now());
                    let fire = match rx.recv_timeout(wait) {
                        Ok(Control::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                        Ok(Control::RefreshNow) => true,
                        Err(RecvTimeoutError::Timeout) => {
                            next += interval;
                            let now = Instant::now();
                            if next < now {
                                next = now + interval;
                            }
                            true
                        }
                    };
                    if !fire {
                        continue;
                    }
                    polls.retain(|h| !h.is_finished());
                    if in_flight.swap(true, Ordering::SeqCst) {
                        tracing::debug!(target_id = %id, "poll still running; tick skipped");
                        continue;
                    }
                    let cache = Arc::clone(&worker_cache);
                    let source = Arc::clone(&source);
                    let flag = Arc::clone(&in_flight);
                    polls.push(thread::spawn(move || {
                        let seq = cache.begin();
                        let result = source.fetch();
                        cache.commit(seq, result);
                        flag.store(false, Ordering::SeqCst);
                    }));
                }
                // Outstanding polls are bounded by their own timeout
                for h in polls {
                    let _ = h.join();
                }
                tracing::info!(target_id = %id, "status poller stopped");
            })
            .ok();
        if handle.is_none() {
            tracing::error!(target_id, "could not spawn status poller thread");
        }
        Self {
            target_id: target_id.to_string(),
            cache,
            control: tx,
            handle,
        }
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn snapshot(&self) -> Arc<StatusSnapshot> {
        self.cache.snapshot()
    }

    pub fn cache(&self) -> &Arc<StatusCache> {
        &self.cache
    }

    /// Poll now, out of schedule. Ignored if a poll is already running.
    pub fn refresh_now(&self) {
        let _ = self.control.send(Control::RefreshNow);
    }

    pub fn stop(&mut self) {
        let _ = self.control.send(Control::Stop);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for StatusPoller {
    fn drop(&mut self) {
        self.stop();
    }
}
