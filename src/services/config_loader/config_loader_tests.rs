use super::*;
use crate::model::{ActionMode, LogMode, StatusSpec, TextEncoding};
use serde_json::json;
use std::fs;
use tempfile::TempDir;

fn write(dir: &TempDir, name: &str, value: &JsonValue) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, serde_json::to_string_pretty(value).unwrap()).unwrap();
    path
}

fn root_with(dir: &TempDir, includes: &[&str]) -> PathBuf {
    write(
        dir,
        "monitor_config.json",
        &json!({"refreshSeconds": 2.0, "includeFiles": includes}),
    )
}

fn legacy_doc() -> JsonValue {
    json!({
        "logPanels": [
            {"name": "Bridge Log", "path": "/tmp/bridge/*.log", "tailLines": 50},
            {"name": "no path"}
        ],
        "target": {
            "id": "bridge",
            "name": "Bridge",
            "cwd": "/srv/bridge",
            "statusCommand": "python3 status.py --json",
            "statusTimeoutSeconds": 4,
            "fields": [
                {"key": "runtime.pid", "label": "PID"},
                {"key": "state"},
                {"label": "no key"}
            ],
            "commands": [
                {"label": "Restart Now", "command": ["systemctl", "restart", "bridge"], "confirm": true},
                {"label": "Restart Now", "command": ["true"], "mutex": "ignored", "detached": true},
                {"label": "Empty", "command": []}
            ]
        }
    })
}

fn canonical_doc() -> JsonValue {
    json!({
        "configVersion": 2,
        "$schema": "./monitor.schema.json",
        "targets": [{
            "id": "worker",
            "status": {"cwd": "/srv/worker", "cmd": ["./status.sh"], "timeoutSeconds": 3},
            "logs": [{"stream": "main", "glob": "/var/log/worker-*.log", "encoding": "latin1"}],
            "actions": [
                {"name": "train", "cmd": ["./train.sh"], "mutex": "gpu", "detached": true},
                {"name": "eval", "cmd": ["./eval.sh"], "mutex": "gpu", "cwd": "/tmp"}
            ],
            "ui": {"tabs": [{"id": "overview", "title": "Overview", "widgets": []}]},
            "x-owner": "ops"
        }]
    })
}

#[test]
fn legacy_target_is_upgraded() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "bridge.json", &legacy_doc());
    let (targets, errors) = load_include(&path, &RootConfig::default());
    assert!(errors.is_empty(), "{errors:?}");
    let t = &targets[0];
    assert_eq!(t.id, "bridge");
    assert_eq!(t.title, "Bridge");
    match &t.status {
        StatusSpec::Exec(exec) => {
            assert_eq!(exec.cmd, vec!["python3", "status.py", "--json"]);
            assert_eq!(exec.cwd.as_deref(), Some("/srv/bridge"));
            assert_eq!(exec.timeout_seconds, Some(4.0));
        }
        other => panic!("unexpected status {other:?}"),
    }

    assert_eq!(t.logs.len(), 1);
    assert_eq!(t.logs[0].stream, "bridge-log");
    assert_eq!(t.logs[0].tail_lines, 50);
    assert_eq!(t.logs[0].poll_ms, 500);

    let names: Vec<&str> = t.actions.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(names, vec!["restart-now", "restart-now-2"]);
    assert!(t.actions.iter().all(|a| a.mutex.is_empty() && !a.detached));
    assert_eq!(t.actions[0].confirm.as_deref(), Some("Run Restart Now?"));
    assert_eq!(t.actions[0].cwd.as_deref(), Some("/srv/bridge"));

    let tabs = t.ui["tabs"].as_array().unwrap();
    let ids: Vec<&str> = tabs.iter().map(|t| t["id"].as_str().unwrap()).collect();
    assert_eq!(ids, vec!["status", "logs", "actions"]);
    assert_eq!(tabs[0]["widgets"][0]["type"], json!("kv"));
    assert_eq!(
        tabs[0]["widgets"][0]["items"],
        json!([
            {"label": "PID", "jsonpath": "$.runtime.pid"},
            {"label": "state", "jsonpath": "$.state"}
        ])
    );
}

#[test]
fn legacy_normalization_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let root = RootConfig::default();
    let path = write(&dir, "bridge.json", &legacy_doc());
    let (first, errors) = load_include(&path, &root);
    assert!(errors.is_empty());

    let doc = first[0].to_canonical();
    let (second, errors) = normalize_document(&doc, &path, &root);
    assert!(errors.is_empty(), "{errors:?}");
    assert_eq!(second, first);
    assert_eq!(second[0].to_canonical(), doc);
}

#[test]
fn legacy_output_passes_canonical_validation() {
    let dir = TempDir::new().unwrap();
    let path = write(
        &dir,
        "many.json",
        &json!({
            "logPanels": [{"name": "Out", "path": "a.log"}, {"name": "out", "path": "b.log"}],
            "targets": [
                {"statusCommand": ["echo", "{}"]},
                {"statusCommand": ["echo", "{}"], "commands": [{"command": "ls -la"}]}
            ]
        }),
    );
    let (targets, errors) = load_include(&path, &RootConfig::default());
    assert!(errors.is_empty(), "{errors:?}");
    assert_eq!(targets[0].id, "many-1");
    assert_eq!(targets[1].id, "many-2");
    assert_eq!(targets[1].actions[0].name, "action-1");
    for t in &targets {
        assert!(validate_target(t, "").is_empty());
        assert_eq!(t.logs[1].stream, "out-2");
    }
}

#[test]
fn legacy_target_without_status_command_is_reported() {
    let dir = TempDir::new().unwrap();
    let path = write(
        &dir,
        "broken.json",
        &json!({"targets": [{"id": "ok", "statusCommand": ["true"]}, {"id": "bad"}]}),
    );
    let (targets, errors) = load_include(&path, &RootConfig::default());
    assert_eq!(targets.len(), 1);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].pointer, "/targets/1/statusCommand");
}

#[test]
fn canonical_target_is_parsed() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "worker.json", &canonical_doc());
    let (targets, errors) = load_include(&path, &RootConfig::default());
    assert!(errors.is_empty(), "{errors:?}");
    let t = &targets[0];
    assert_eq!(t.title, "worker");
    assert_eq!(t.status.timeout_seconds(), Some(3.0));
    assert_eq!(t.logs[0].encoding, TextEncoding::Latin1);
    assert_eq!(t.logs[0].mode, LogMode::File);
    assert_eq!(t.logs[0].tail_lines, 300);
    let train = t.action("train").unwrap();
    assert!(train.detached);
    assert_eq!(train.cwd.as_deref(), Some("/srv/worker"));
    assert_eq!(train.timeout_seconds, 120.0);
    assert_eq!(train.mode, ActionMode::Exec);
    assert_eq!(t.action("eval").unwrap().cwd.as_deref(), Some("/tmp"));
    assert_eq!(t.source_path, path);
}

#[test]
fn canonical_round_trips_through_to_canonical() {
    let dir = TempDir::new().unwrap();
    let root = RootConfig::default();
    let path = write(&dir, "worker.json", &canonical_doc());
    let (first, _) = load_include(&path, &root);
    let (second, errors) = normalize_document(&first[0].to_canonical(), &path, &root);
    assert!(errors.is_empty());
    assert_eq!(first, second);
}

#[test]
fn ipc_status_target() {
    let dir = TempDir::new().unwrap();
    let path = write(
        &dir,
        "app.json",
        &json!({
            "configVersion": 2,
            "id": "app",
            "title": "App",
            "status": {"mode": "ipc", "endpoint": "127.0.0.1:8777"},
            "logs": [{"stream": "events", "mode": "ipc"}],
            "actions": [{"name": "ping", "mode": "ipc"}],
            "ui": {"tabs": []}
        }),
    );
    let (targets, errors) = load_include(&path, &RootConfig::default());
    assert!(errors.is_empty(), "{errors:?}");
    assert_eq!(targets[0].status.ipc().unwrap().endpoint, "127.0.0.1:8777");
    assert_eq!(targets[0].logs[0].mode, LogMode::Ipc);
    assert_eq!(targets[0].actions[0].mode, ActionMode::Ipc);
}

#[test]
fn exec_status_rejects_endpoint() {
    let dir = TempDir::new().unwrap();
    let path = write(
        &dir,
        "mixed.json",
        &json!({
            "configVersion": 2,
            "id": "mixed",
            "status": {"cmd": ["true"], "endpoint": "127.0.0.1:1"},
            "ui": {"tabs": []}
        }),
    );
    let (targets, errors) = load_include(&path, &RootConfig::default());
    assert!(targets.is_empty());
    assert_eq!(errors[0].pointer, "/status");
    assert!(errors[0].message.contains("endpoint"));
}

#[test]
fn unsupported_config_versions_are_errors() {
    let dir = TempDir::new().unwrap();
    for version in [json!(1), json!(3), json!("2")] {
        let path = write(
            &dir,
            "versioned.json",
            &json!({"configVersion": version, "target": {"statusCommand": ["true"]}}),
        );
        let (targets, errors) = load_include(&path, &RootConfig::default());
        assert!(targets.is_empty());
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].pointer, "/configVersion");
    }
}

#[test]
fn legacy_shape_claiming_version_two_is_an_error() {
    let dir = TempDir::new().unwrap();
    let path = write(
        &dir,
        "liar.json",
        &json!({"configVersion": 2, "target": {"id": "x", "statusCommand": ["true"]}}),
    );
    let (targets, errors) = load_include(&path, &RootConfig::default());
    assert!(targets.is_empty());
    assert!(errors[0].message.contains("statusCommand"));
}

#[test]
fn unknown_keys_are_reported_with_pointer() {
    let dir = TempDir::new().unwrap();
    let mut doc = canonical_doc();
    doc["targets"][0]["actions"][1]["retries"] = json!(3);
    let path = write(&dir, "worker.json", &doc);
    let (targets, errors) = load_include(&path, &RootConfig::default());
    assert!(targets.is_empty());
    assert_eq!(errors[0].pointer, "/targets/0/actions/1");
    assert_eq!(errors[0].message, "unsupported keys: retries");
}

#[test]
fn invalid_mutex_excludes_target() {
    let dir = TempDir::new().unwrap();
    let mut doc = canonical_doc();
    doc["targets"][0]["actions"][0]["mutex"] = json!("gpu lock");
    let path = write(&dir, "worker.json", &doc);
    let (targets, errors) = load_include(&path, &RootConfig::default());
    assert!(targets.is_empty());
    assert_eq!(errors[0].pointer, "/targets/0/actions/0/mutex");
}

#[test]
fn bad_include_does_not_block_siblings() {
    let dir = TempDir::new().unwrap();
    write(&dir, "worker.json", &canonical_doc());
    fs::write(dir.path().join("broken.json"), "{ not json").unwrap();
    let root = root_with(&dir, &["broken.json", "missing.json", "worker.json"]);
    let loaded = load(&root).unwrap();
    assert_eq!(loaded.targets.len(), 1);
    assert_eq!(loaded.targets[0].id, "worker");
    assert_eq!(loaded.errors.len(), 2);
    assert!(loaded.errors[0].path.ends_with("broken.json"));
    assert!(loaded.errors[1].path.ends_with("missing.json"));
    assert_eq!(loaded.root.refresh_seconds, 2.0);
}

#[test]
fn duplicate_ids_name_both_files() {
    let dir = TempDir::new().unwrap();
    write(&dir, "a.json", &json!({"target": {"id": "same", "statusCommand": ["true"]}}));
    write(&dir, "b.json", &json!({"target": {"id": "same", "statusCommand": ["false"]}}));
    let loaded = load(&root_with(&dir, &["a.json", "b.json"])).unwrap();
    assert_eq!(loaded.targets.len(), 1);
    assert!(loaded.targets[0].source_path.ends_with("a.json"));
    let err = &loaded.errors[0];
    assert!(err.path.ends_with("b.json"));
    assert!(err.message.contains("a.json"));
}

#[test]
fn yaml_includes_are_supported() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("svc.yaml"),
        "configVersion: 2\nid: svc\nstatus:\n  cmd: [\"true\"]\nui:\n  tabs: []\n",
    )
    .unwrap();
    let loaded = load(&root_with(&dir, &["svc.yaml"])).unwrap();
    assert!(loaded.errors.is_empty(), "{:?}", loaded.errors);
    assert_eq!(loaded.target("svc").unwrap().title, "svc");
}

#[test]
fn unparseable_root_is_fatal() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("monitor_config.json");
    fs::write(&path, "[1, 2").unwrap();
    assert!(load(&path).is_err());
}

#[test]
fn root_validation_is_fatal() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "root.json", &json!({"includeFiles": []}));
    assert!(load(&path).is_err());
    let path = write(&dir, "root.json", &json!({"includeFiles": ["a.json"], "theme": "dark"}));
    let err = load(&path).unwrap_err();
    assert!(format!("{err:#}").contains("unsupported keys: theme"));
}

#[test]
fn root_defaults_and_bom() {
    let dir = TempDir::new().unwrap();
    write(&dir, "a.json", &json!({"target": {"id": "a", "statusCommand": ["true"]}}));
    let path = dir.path().join("root.json");
    fs::write(&path, "\u{feff}{\"includeFiles\": [\"a.json\"], \"actionOutput\": {\"maxLines\": 10}}").unwrap();
    let loaded = load(&path).unwrap();
    assert_eq!(loaded.root.refresh_seconds, 1.0);
    assert_eq!(loaded.root.command_timeout_seconds, 10.0);
    assert_eq!(loaded.root.action_output.max_lines, 10);
    assert_eq!(loaded.root.action_output.max_bytes, 1_000_000);
}
