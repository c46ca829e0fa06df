use std::process::Stdio;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use wait_timeout::ChildExt;

use super::{Job, Spawner};
use crate::engine::actions::output::OutputStream;
use crate::engine::actions::run::{ActionRun, RunState};
use crate::error::ActionError;
use crate::services::cmd_runner::{build_command, display_cmd, spawn_line_reader, terminate};

// How long to wait for pipe readers after the child is gone
const READER_GRACE: Duration = Duration::from_secs(2);

/// Runs actions as local child processes.
#[derive(Default)]
pub struct LocalSpawner;

impl LocalSpawner {
    pub fn new() -> Self {
        Self
    }

    fn launch_detached(&self, job: &Job, run: &ActionRun) {
        let mut command = match build_command(&job.cmd, job.cwd.as_deref()) {
            Ok(c) => c,
            Err(e) => return fail(run, ActionError::Spawn(e)),
        };
        match command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => {
                run.system(format!("{}: detached process started (pid {})", job.label, child.id()));
                tracing::info!(action = %job.action, pid = child.id(), "detached action launched");
                // not waited on; the process is meant to outlive this session
                drop(child);
                run.finish(RunState::DetachedLaunched, None, None);
            }
            Err(e) => fail(run, ActionError::Spawn(e)),
        }
    }
}

fn fail(run: &ActionRun, e: ActionError) {
    run.system(format!("failed: {e}"));
    tracing::warn!(run_id = run.id(), error = %e, "action could not start");
    run.finish(RunState::Failed, None, Some(e.to_string()));
}

// Join readers, but never hang on a pipe a grandchild still holds open
fn join_readers(handles: Vec<JoinHandle<()>>) {
    let deadline = Instant::now() + READER_GRACE;
    for h in handles {
        while !h.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        if h.is_finished() {
            let _ = h.join();
        }
    }
}

impl Spawner for LocalSpawner {
    fn execute(&self, job: &Job, run: &ActionRun) {
        run.system(format!("running {}: {}", job.label, display_cmd(&job.cmd)));
        if job.detached {
            return self.launch_detached(job, run);
        }
        let mut command = match build_command(&job.cmd, job.cwd.as_deref()) {
            Ok(c) => c,
            Err(e) => return fail(run, ActionError::Spawn(e)),
        };
        let mut child = match command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(c) => c,
            Err(e) => return fail(run, ActionError::Spawn(e)),
        };

        // Readers forward into a channel; only this thread touches the run
        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        let (tx, rx) = std::sync::mpsc::channel::<(OutputStream, String)>();
        if let Some(stdout) = child.stdout.take() {
            let tx = tx.clone();
            handles.push(spawn_line_reader(stdout, move |line| {
                let _ = tx.send((OutputStream::Stdout, line));
            }));
        }
        if let Some(stderr) = child.stderr.take() {
            let tx = tx.clone();
            handles.push(spawn_line_reader(stderr, move |line| {
                let _ = tx.send((OutputStream::Stderr, line));
            }));
        }
        drop(tx);

        let started = Instant::now();
        let deadline = started + job.timeout;
        let status = loop {
            // drain in arrival order while waiting
            while let Ok((stream, line)) = rx.try_recv() {
                run.push(stream, line);
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() || run.is_cancelled() {
                break None;
            }
            match child.wait_timeout(left.min(Duration::from_millis(50))) {
                Ok(Some(status)) => break Some(Ok(status)),
                Ok(None) => continue,
                Err(e) => break Some(Err(e)),
            }
        };

        let timed_out = status.is_none();
        if timed_out {
            terminate(&mut child);
        }
        join_readers(handles);
        while let Ok((stream, line)) = rx.try_recv() {
            run.push(stream, line);
        }

        match status {
            None if run.is_cancelled() => {
                run.system(format!("{}: cancelled; process killed", job.label));
                run.finish(RunState::Failed, None, Some("cancelled".into()));
            }
            None => {
                let secs = job.timeout.as_secs_f64();
                run.system(format!("{}: timeout after {secs:.1}s; process killed", job.label));
                tracing::warn!(run_id = run.id(), action = %job.action, "action timed out");
                run.finish(RunState::TimedOut, None, Some(format!("timeout after {secs:.1}s")));
            }
            Some(Err(e)) => {
                terminate(&mut child);
                run.system(format!("{}: wait failed: {e}", job.label));
                run.finish(RunState::Failed, None, Some(e.to_string()));
            }
            Some(Ok(status)) => {
                let code = status.code();
                let shown = code.map(|c| c.to_string()).unwrap_or_else(|| "signal".into());
                run.system(format!("{}: finished rc={shown}", job.label));
                if code == Some(0) {
                    run.finish(RunState::Succeeded, code, None);
                } else {
                    run.finish(RunState::Failed, code, Some(format!("exited with {shown}")));
                }
            }
        }
    }
}
