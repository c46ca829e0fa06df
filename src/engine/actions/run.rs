use super::output::{OutputBuffer, OutputLine, OutputStream};
use crate::model::OutputLimits;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

pub type RunId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RunState {
    Running,
    Succeeded,
    Failed,
    TimedOut,
    DetachedLaunched,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunState::Running)
    }
}

#[derive(Debug)]
struct RunInner {
    state: RunState,
    finished_at: Option<DateTime<Utc>>,
    exit_code: Option<i32>,
    error: Option<String>,
    output: OutputBuffer,
}

/// One invocation of an action. Written by the thread executing it, read
/// through `snapshot`, which copies under a short lock.
#[derive(Debug)]
pub struct ActionRun {
    id: RunId,
    target_id: String,
    action: String,
    mutex: String,
    detached: bool,
    started_at: DateTime<Utc>,
    inner: Mutex<RunInner>,
    done: Condvar,
    cancelled: AtomicBool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRunSnapshot {
    pub id: RunId,
    pub target_id: String,
    pub action: String,
    pub mutex: String,
    pub detached: bool,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub lines: Vec<OutputLine>,
    pub buffered_bytes: usize,
    pub total_lines: u64,
    pub evicted_lines: u64,
}

impl ActionRunSnapshot {
    pub fn render_output(&self) -> String {
        self.lines
            .iter()
            .map(OutputLine::render)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl ActionRun {
    pub fn new(
        id: RunId,
        target_id: &str,
        action: &str,
        mutex: &str,
        detached: bool,
        limits: OutputLimits,
    ) -> Self {
        Self {
            id,
            target_id: target_id.to_string(),
            action: action.to_string(),
            mutex: mutex.to_string(),
            detached,
            started_at: Utc::now(),
            inner: Mutex::new(RunInner {
                state: RunState::Running,
                finished_at: None,
                exit_code: None,
                error: None,
                output: OutputBuffer::new(limits),
            }),
            done: Condvar::new(),
            cancelled: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RunInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn id(&self) -> RunId {
        self.id
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn push(&self, stream: OutputStream, text: impl Into<String>) {
        self.lock().output.push(stream, text);
    }

    pub fn system(&self, text: impl Into<String>) {
        self.push(OutputStream::System, text);
    }

    pub fn mutex(&self) -> &str {
        &self.mutex
    }

    /// Ask the executing spawner to give up. Only honoured while running.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> RunState {
        self.lock().state
    }

    /// Move to a terminal state. Later calls are ignored.
    pub fn finish(&self, state: RunState, exit_code: Option<i32>, error: Option<String>) {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return;
        }
        inner.state = state;
        inner.exit_code = exit_code;
        inner.error = error;
        inner.finished_at = Some(Utc::now());
        drop(inner);
        self.done.notify_all();
    }

    pub fn snapshot(&self) -> ActionRunSnapshot {
        let inner = self.lock();
        ActionRunSnapshot {
            id: self.id,
            target_id: self.target_id.clone(),
            action: self.action.clone(),
            mutex: self.mutex.clone(),
            detached: self.detached,
            state: inner.state,
            started_at: self.started_at,
            finished_at: inner.finished_at,
            exit_code: inner.exit_code,
            error: inner.error.clone(),
            lines: inner.output.to_vec(),
            buffered_bytes: inner.output.bytes(),
            total_lines: inner.output.total_lines(),
            evicted_lines: inner.output.evicted_lines(),
        }
    }

    /// Block until the run is terminal or `timeout` passes. Returns the final state if reached.
    pub fn wait(&self, timeout: Duration) -> Option<RunState> {
        let inner = self.lock();
        let (inner, _) = self
            .done
            .wait_timeout_while(inner, timeout, |i| !i.state.is_terminal())
            .unwrap_or_else(|p| p.into_inner());
        inner.state.is_terminal().then_some(inner.state)
    }
}
