use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::{Job, Spawner};
use crate::engine::actions::output::OutputStream;
use crate::engine::actions::run::{ActionRun, RunState};
use crate::error::ActionError;
use crate::services::ipc::IpcClient;

const JOB_POLL: Duration = Duration::from_millis(250);

/// Invokes actions on a target over its IPC endpoint and follows the remote job.
pub struct IpcSpawner {
    client: Arc<IpcClient>,
}

impl IpcSpawner {
    pub fn new(client: Arc<IpcClient>) -> Self {
        Self { client }
    }
}

// Remote job output arrives as whole text each poll; forward only the new suffix
#[derive(Default)]
struct Forwarded {
    stdout: usize,
    stderr: usize,
}

fn forward_new(run: &ActionRun, stream: OutputStream, text: &str, seen: &mut usize) {
    // The remote side may reset its buffer; start over rather than slice out of range
    if text.len() < *seen || !text.is_char_boundary(*seen) {
        *seen = 0;
    }
    let fresh = &text[*seen..];
    // Hold back an unterminated trailing line until it completes
    let complete = match fresh.rfind('\n') {
        Some(i) => &fresh[..=i],
        None => return,
    };
    for line in complete.lines() {
        run.push(stream, line);
    }
    *seen += complete.len();
}

fn flush_rest(run: &ActionRun, stream: OutputStream, text: &str, seen: usize) {
    if let Some(rest) = text.get(seen..) {
        if !rest.is_empty() {
            run.push(stream, rest);
        }
    }
}

fn map_state(state: &str) -> RunState {
    match state {
        "succeeded" => RunState::Succeeded,
        "timedOut" => RunState::TimedOut,
        _ => RunState::Failed,
    }
}

impl Spawner for IpcSpawner {
    fn execute(&self, job: &Job, run: &ActionRun) {
        run.system(format!("invoking {} on {}", job.label, self.client.endpoint()));
        let job_id = match self.client.invoke_action(&job.action, job.args.clone()) {
            Ok(id) => id,
            Err(e) => {
                let e = ActionError::Transport(e);
                run.system(format!("failed: {e}"));
                tracing::warn!(run_id = run.id(), error = %e, "ipc action invoke failed");
                return run.finish(RunState::Failed, None, Some(e.to_string()));
            }
        };
        run.system(format!("remote job {job_id}"));
        if job.detached {
            return run.finish(RunState::DetachedLaunched, None, None);
        }

        let deadline = Instant::now() + job.timeout;
        let mut seen = Forwarded::default();
        loop {
            match self.client.job_status(&job_id) {
                Ok(status) => {
                    forward_new(run, OutputStream::Stdout, &status.stdout, &mut seen.stdout);
                    forward_new(run, OutputStream::Stderr, &status.stderr, &mut seen.stderr);
                    if status.is_terminal() {
                        flush_rest(run, OutputStream::Stdout, &status.stdout, seen.stdout);
                        flush_rest(run, OutputStream::Stderr, &status.stderr, seen.stderr);
                        let state = map_state(&status.state);
                        run.system(format!("{}: remote job {}", job.label, status.state));
                        let error = (state != RunState::Succeeded).then(|| status.state.clone());
                        return run.finish(state, None, error);
                    }
                }
                Err(e) => {
                    // A single failed poll is not fatal; the deadline still bounds the run
                    tracing::debug!(run_id = run.id(), error = %e, "job status poll failed");
                }
            }
            if run.is_cancelled() {
                run.system(format!("{}: stopped following remote job", job.label));
                return run.finish(RunState::Failed, None, Some("cancelled".into()));
            }
            if Instant::now() >= deadline {
                let secs = job.timeout.as_secs_f64();
                run.system(format!("{}: timeout after {secs:.1}s waiting for remote job", job.label));
                tracing::warn!(run_id = run.id(), action = %job.action, "ipc action timed out");
                return run.finish(RunState::TimedOut, None, Some(format!("timeout after {secs:.1}s")));
            }
            thread::sleep(JOB_POLL.min(deadline.saturating_duration_since(Instant::now())));
        }
    }
}
