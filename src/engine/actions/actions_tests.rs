use super::*;
use crate::model::{ExecSpec, IpcSpec, StatusSpec};
use crate::test_support::{hello, ok, FakeIpcServer};
use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;

fn action(name: &str, cmd: &[&str]) -> ActionSpec {
    ActionSpec {
        name: name.into(),
        label: name.to_uppercase(),
        mode: ActionMode::Exec,
        cwd: None,
        cmd: cmd.iter().map(|s| s.to_string()).collect(),
        timeout_seconds: 10.0,
        confirm: None,
        show_output_panel: true,
        mutex: String::new(),
        detached: false,
    }
}

fn sh(name: &str, script: &str) -> ActionSpec {
    action(name, &["sh", "-c", script])
}

fn target(actions: Vec<ActionSpec>) -> Target {
    Target {
        id: "svc".into(),
        title: "Service".into(),
        refresh_seconds: None,
        status: StatusSpec::Exec(ExecSpec {
            cwd: None,
            cmd: vec!["true".into()],
            timeout_seconds: None,
        }),
        logs: vec![],
        actions,
        ui: json!({"tabs": []}),
        action_output: None,
        source_path: PathBuf::from("svc.json"),
    }
}

const WAIT: Duration = Duration::from_secs(10);

/// Records jobs instead of running them; finishes each run once `release` is set.
#[derive(Default)]
struct Gate {
    release: std::sync::atomic::AtomicBool,
    jobs: Mutex<Vec<Job>>,
    calls: AtomicUsize,
}

impl Spawner for Gate {
    fn execute(&self, job: &Job, run: &ActionRun) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.push(job.clone());
        }
        while !self.release.load(Ordering::SeqCst) && !run.is_cancelled() {
            thread::sleep(Duration::from_millis(10));
        }
        run.finish(RunState::Succeeded, Some(0), None);
    }
}

#[test]
fn shared_mutex_rejects_second_run_until_first_completes() {
    let gate = Arc::new(Gate::default());
    let exec = ActionExecutor::with_spawner(gate.clone());
    let t = target(vec![
        ActionSpec { mutex: "deploy".into(), ..action("a", &["true"]) },
        ActionSpec { mutex: "deploy".into(), ..action("b", &["true"]) },
    ]);

    let first = exec.run(&t, "a", OutputLimits::default()).unwrap();
    let err = exec.run(&t, "b", OutputLimits::default()).unwrap_err();
    match err {
        ActionError::Busy { mutex, holder } => {
            assert_eq!(mutex, "deploy");
            assert_eq!(holder, first.id());
        }
        other => panic!("expected busy, got {other:?}"),
    }

    gate.release.store(true, Ordering::SeqCst);
    assert_eq!(first.wait(WAIT), Some(RunState::Succeeded));
    let second = exec.run(&t, "b", OutputLimits::default()).unwrap();
    assert_eq!(second.wait(WAIT), Some(RunState::Succeeded));
    assert!(second.id() > first.id());
}

#[test]
fn unconstrained_actions_may_overlap() {
    let gate = Arc::new(Gate::default());
    let exec = ActionExecutor::with_spawner(gate.clone());
    let t = target(vec![action("a", &["true"])]);
    let r1 = exec.run(&t, "a", OutputLimits::default()).unwrap();
    let r2 = exec.run(&t, "a", OutputLimits::default()).unwrap();
    gate.release.store(true, Ordering::SeqCst);
    assert_eq!(r1.wait(WAIT), Some(RunState::Succeeded));
    assert_eq!(r2.wait(WAIT), Some(RunState::Succeeded));
    assert_eq!(gate.calls.load(Ordering::SeqCst), 2);
    assert_eq!(exec.latest("svc", "a").map(|s| s.id), Some(r2.id()));
    // superseded and finished
    assert!(exec.run_state(r1.id()).is_none());
}

#[test]
fn value_is_substituted_into_cmd_and_cwd() {
    let gate = Arc::new(Gate::default());
    gate.release.store(true, Ordering::SeqCst);
    let exec = ActionExecutor::with_spawner(gate.clone());
    let t = target(vec![ActionSpec {
        cwd: Some("/srv/{value}".into()),
        ..action("restart", &["systemctl", "restart", "{value}.service"])
    }]);
    let run = exec
        .run_with_value(&t, "restart", "worker", OutputLimits::default())
        .unwrap();
    run.wait(WAIT);
    let jobs = gate.jobs.lock().unwrap();
    assert_eq!(jobs[0].cmd, vec!["systemctl", "restart", "worker.service"]);
    assert_eq!(jobs[0].cwd.as_deref(), Some("/srv/worker"));
    assert_eq!(jobs[0].args, json!({"value": "worker"}));
}

#[test]
fn unknown_action_is_rejected() {
    let exec = ActionExecutor::new();
    let t = target(vec![]);
    let err = exec.run(&t, "nope", OutputLimits::default()).unwrap_err();
    assert_eq!(err.to_string(), "target 'svc' has no action 'nope'");
}

#[test]
fn ipc_action_without_endpoint_is_rejected() {
    let exec = ActionExecutor::new();
    let t = target(vec![ActionSpec {
        mode: ActionMode::Ipc,
        ..action("flush", &[])
    }]);
    assert!(matches!(
        exec.run(&t, "flush", OutputLimits::default()),
        Err(ActionError::NoEndpoint(_))
    ));
}

#[cfg(unix)]
#[test]
fn local_run_tags_streams_and_reports_exit() {
    let exec = ActionExecutor::new();
    let t = target(vec![
        sh("ok", "echo out; echo err 1>&2"),
        sh("bad", "echo nope 1>&2; exit 3"),
    ]);
    let run = exec.run(&t, "ok", OutputLimits::default()).unwrap();
    assert_eq!(run.wait(WAIT), Some(RunState::Succeeded));
    let snap = run.snapshot();
    assert_eq!(snap.exit_code, Some(0));
    assert!(snap.lines.contains(&OutputLine { stream: OutputStream::Stdout, text: "out".into() }));
    assert!(snap.lines.contains(&OutputLine { stream: OutputStream::Stderr, text: "err".into() }));
    assert_eq!(snap.lines[0].stream, OutputStream::System);
    assert!(snap.render_output().ends_with("[system] OK: finished rc=0"));

    let run = exec.run(&t, "bad", OutputLimits::default()).unwrap();
    assert_eq!(run.wait(WAIT), Some(RunState::Failed));
    let snap = run.snapshot();
    assert_eq!(snap.exit_code, Some(3));
    assert_eq!(snap.error.as_deref(), Some("exited with 3"));
}

#[cfg(unix)]
#[test]
fn local_run_times_out() {
    let exec = ActionExecutor::new();
    let t = target(vec![ActionSpec {
        timeout_seconds: 0.3,
        ..sh("hang", "sleep 30")
    }]);
    let run = exec.run(&t, "hang", OutputLimits::default()).unwrap();
    assert_eq!(run.wait(WAIT), Some(RunState::TimedOut));
    assert_eq!(run.snapshot().error.as_deref(), Some("timeout after 0.3s"));
}

#[cfg(unix)]
#[test]
fn detached_run_returns_immediately_and_frees_mutex() {
    let exec = ActionExecutor::new();
    let t = target(vec![
        ActionSpec {
            detached: true,
            mutex: "long".into(),
            ..sh("soak", "sleep 2")
        },
        ActionSpec {
            mutex: "long".into(),
            ..sh("other", "true")
        },
    ]);
    let run = exec.run(&t, "soak", OutputLimits::default()).unwrap();
    assert_eq!(run.wait(WAIT), Some(RunState::DetachedLaunched));
    assert!(run.snapshot().render_output().contains("detached process started"));
    let other = exec.run(&t, "other", OutputLimits::default()).unwrap();
    assert_eq!(other.wait(WAIT), Some(RunState::Succeeded));
}

#[cfg(unix)]
#[test]
fn output_window_slides() {
    let exec = ActionExecutor::new();
    let t = target(vec![sh("count", "for i in 1 2 3 4 5 6; do echo line$i; done")]);
    let limits = OutputLimits { max_lines: 3, max_bytes: 1_000_000 };
    let run = exec.run(&t, "count", limits).unwrap();
    assert_eq!(run.wait(WAIT), Some(RunState::Succeeded));
    let snap = run.snapshot();
    assert_eq!(snap.lines.len(), 3);
    assert_eq!(snap.lines[0].text, "line5");
    assert_eq!(snap.lines[1].text, "line6");
    assert_eq!(snap.total_lines, 8);
}

#[cfg(unix)]
#[test]
fn missing_program_fails_the_run() {
    let exec = ActionExecutor::new();
    let t = target(vec![action("ghost", &["/nonexistent/chi-monitor-ghost"])]);
    let run = exec.run(&t, "ghost", OutputLimits::default()).unwrap();
    assert_eq!(run.wait(WAIT), Some(RunState::Failed));
    assert!(run.snapshot().error.unwrap().starts_with("spawning action"));
}

#[cfg(unix)]
#[test]
fn shutdown_cancels_running_actions() {
    let exec = ActionExecutor::new();
    let t = target(vec![ActionSpec {
        timeout_seconds: 60.0,
        ..sh("hang", "sleep 30")
    }]);
    let run = exec.run(&t, "hang", OutputLimits::default()).unwrap();
    exec.shutdown();
    assert_eq!(run.state(), RunState::Failed);
    assert_eq!(run.snapshot().error.as_deref(), Some("cancelled"));
}

#[test]
fn ipc_action_follows_remote_job() {
    let polls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&polls);
    let server = FakeIpcServer::start(move |method, params| match method {
        "hello" => hello(&["action.invoke"]),
        "action.invoke" => {
            assert_eq!(params["actionName"], json!("flush"));
            ok(json!({"jobId": "job-7"}))
        }
        "action.job.get" => {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                ok(json!({"state": "running", "stdout": "flushing\npart", "stderr": ""}))
            } else {
                ok(json!({"state": "succeeded", "stdout": "flushing\npartial done\n", "stderr": "warn\n"}))
            }
        }
        _ => json!({"ok": false}),
    });
    let exec = ActionExecutor::new();
    let client = Arc::new(IpcClient::new(&server.endpoint, Duration::from_secs(1), 64 * 1024).unwrap());
    exec.register_endpoint("svc", client);
    let t = Target {
        status: StatusSpec::Ipc(IpcSpec {
            endpoint: server.endpoint.clone(),
            timeout_seconds: None,
            max_response_bytes: None,
        }),
        ..target(vec![ActionSpec {
            mode: ActionMode::Ipc,
            ..action("flush", &[])
        }])
    };
    let run = exec.run(&t, "flush", OutputLimits::default()).unwrap();
    assert_eq!(run.wait(WAIT), Some(RunState::Succeeded));
    let texts: Vec<(OutputStream, String)> = run
        .snapshot()
        .lines
        .into_iter()
        .filter(|l| l.stream != OutputStream::System)
        .map(|l| (l.stream, l.text))
        .collect();
    assert_eq!(
        texts,
        vec![
            (OutputStream::Stdout, "flushing".to_string()),
            (OutputStream::Stdout, "partial done".to_string()),
            (OutputStream::Stderr, "warn".to_string()),
        ]
    );
    assert!(polls.load(Ordering::SeqCst) >= 2);
}
