use super::fields::Fields;
use crate::error::ConfigError;
use crate::model::*;
use serde_json::{json, Value as JsonValue};
use std::path::Path;

const CONTAINER_KEYS: &[&str] = &["configVersion", "target", "targets"];
const TARGET_KEYS: &[&str] = &[
    "configVersion",
    "id",
    "title",
    "refreshSeconds",
    "status",
    "logs",
    "actions",
    "ui",
    "actionOutput",
];
const EXEC_STATUS_KEYS: &[&str] = &["mode", "cwd", "cmd", "timeoutSeconds"];
const IPC_STATUS_KEYS: &[&str] = &["mode", "endpoint", "timeoutSeconds", "maxResponseBytes"];
const LOG_KEYS: &[&str] = &[
    "mode",
    "stream",
    "title",
    "glob",
    "tailLines",
    "maxLineBytes",
    "pollMs",
    "encoding",
    "allowMissing",
];
const ACTION_KEYS: &[&str] = &[
    "mode",
    "name",
    "label",
    "cwd",
    "cmd",
    "timeoutSeconds",
    "confirm",
    "showOutputPanel",
    "mutex",
    "detached",
];
const LIMIT_KEYS: &[&str] = &["maxLines", "maxBytes"];

// Keys that only exist in the legacy layout
const LEGACY_KEYS: &[&str] = &["statusCommand", "fields", "commands", "logPanels"];

/// Every target block of a document, with its JSON pointer.
pub(crate) fn target_blocks(doc: &JsonValue) -> Vec<(String, &JsonValue)> {
    let mut out = Vec::new();
    if let Some(t) = doc.get("target").filter(|t| !t.is_null()) {
        out.push(("/target".to_string(), t));
    }
    if let Some(items) = doc.get("targets").and_then(|t| t.as_array()) {
        for (i, t) in items.iter().enumerate() {
            out.push((format!("/targets/{i}"), t));
        }
    }
    out
}

fn legacy_key_in(value: &JsonValue) -> Option<&'static str> {
    let obj = value.as_object()?;
    LEGACY_KEYS.iter().copied().find(|k| obj.contains_key(*k))
}

/// Parse a `configVersion: 2` document. Each target is parsed on its own so
/// one broken block does not hide its siblings.
pub(crate) fn parse_document(
    doc: &JsonValue,
    path: &Path,
    root: &RootConfig,
) -> (Vec<(String, Target)>, Vec<ConfigError>) {
    let mut targets = Vec::new();
    let mut errors = Vec::new();

    let top = match Fields::new(path, "", doc) {
        Ok(f) => f,
        Err(e) => return (targets, vec![e]),
    };
    if let Some(key) = legacy_key_in(doc) {
        errors.push(top.error(
            None,
            format!("'{key}' belongs to the legacy layout; drop configVersion or migrate the file"),
        ));
        return (targets, errors);
    }

    let container = top.contains("target") || top.contains("targets");
    let blocks = if container {
        if let Err(e) = top.check_keys(CONTAINER_KEYS) {
            return (targets, vec![e]);
        }
        if let Err(e) = top.opt_array("targets") {
            return (targets, vec![e]);
        }
        target_blocks(doc)
    } else {
        vec![(String::new(), doc)]
    };
    if blocks.is_empty() {
        errors.push(top.error(None, "document declares no targets"));
    }

    for (pointer, block) in blocks {
        if let Some(key) = legacy_key_in(block) {
            errors.push(ConfigError::new(
                path,
                pointer,
                format!("'{key}' belongs to the legacy layout; drop configVersion or migrate the file"),
            ));
            continue;
        }
        match parse_target(block, path, &pointer, root) {
            Ok(target) => targets.push((pointer, target)),
            Err(e) => errors.push(e),
        }
    }
    (targets, errors)
}

fn parse_target(
    value: &JsonValue,
    path: &Path,
    pointer: &str,
    root: &RootConfig,
) -> Result<Target, ConfigError> {
    let f = Fields::new(path, pointer, value)?;
    f.check_keys(TARGET_KEYS)?;

    let id = f
        .opt_str("id")?
        .ok_or_else(|| f.error(Some("id"), "id is required"))?;
    let title = f.opt_str("title")?.unwrap_or_else(|| id.clone());
    let refresh_seconds = f.opt_f64("refreshSeconds")?;

    let status = f
        .opt_object("status")?
        .ok_or_else(|| f.error(Some("status"), "status object is required"))?;
    let status = parse_status(&status)?;

    let mut logs = Vec::new();
    if let Some(items) = f.opt_array("logs")? {
        for (i, item) in items.iter().enumerate() {
            let lf = Fields::new(path, format!("{}/{}", f.pointer_for("logs"), i), item)?;
            logs.push(parse_log(&lf)?);
        }
    }

    let mut actions = Vec::new();
    if let Some(items) = f.opt_array("actions")? {
        for (i, item) in items.iter().enumerate() {
            let af = Fields::new(path, format!("{}/{}", f.pointer_for("actions"), i), item)?;
            actions.push(parse_action(&af, status.cwd())?);
        }
    }

    let ui = f
        .opt_object("ui")?
        .ok_or_else(|| f.error(Some("ui"), "ui object is required"))?;
    ui.check_keys(&["tabs"])?;
    let tabs = ui
        .opt_array("tabs")?
        .ok_or_else(|| ui.error(Some("tabs"), "ui.tabs must be a list"))?;

    let action_output = match f.opt_object("actionOutput")? {
        Some(limits) => {
            limits.check_keys(LIMIT_KEYS)?;
            Some(OutputLimits {
                max_lines: limits
                    .opt_usize("maxLines")?
                    .unwrap_or(root.action_output.max_lines),
                max_bytes: limits
                    .opt_usize("maxBytes")?
                    .unwrap_or(root.action_output.max_bytes),
            })
        }
        None => None,
    };

    Ok(Target {
        id,
        title,
        refresh_seconds,
        status,
        logs,
        actions,
        ui: json!({ "tabs": tabs }),
        action_output,
        source_path: path.to_path_buf(),
    })
}

fn parse_status(f: &Fields<'_>) -> Result<StatusSpec, ConfigError> {
    let mode = f.opt_str("mode")?;
    match mode.as_deref().unwrap_or("exec") {
        "exec" => {
            f.check_keys(EXEC_STATUS_KEYS)?;
            let cmd = f.opt_string_list("cmd")?.unwrap_or_default();
            if cmd.is_empty() {
                return Err(f.error(Some("cmd"), "status.cmd must be a non-empty list"));
            }
            Ok(StatusSpec::Exec(ExecSpec {
                cwd: f.opt_str("cwd")?,
                cmd,
                timeout_seconds: f.opt_f64("timeoutSeconds")?,
            }))
        }
        "ipc" => {
            f.check_keys(IPC_STATUS_KEYS)?;
            let endpoint = f
                .opt_str("endpoint")?
                .ok_or_else(|| f.error(Some("endpoint"), "ipc status requires an endpoint"))?;
            Ok(StatusSpec::Ipc(IpcSpec {
                endpoint,
                timeout_seconds: f.opt_f64("timeoutSeconds")?,
                max_response_bytes: f.opt_usize("maxResponseBytes")?,
            }))
        }
        other => Err(f.error(
            Some("mode"),
            format!("unknown status mode '{other}' (expected exec or ipc)"),
        )),
    }
}

fn parse_log(f: &Fields<'_>) -> Result<LogSpec, ConfigError> {
    f.check_keys(LOG_KEYS)?;
    let mode = match f.opt_str("mode")?.as_deref() {
        None | Some("file") => LogMode::File,
        Some("ipc") => LogMode::Ipc,
        Some(other) => {
            return Err(f.error(
                Some("mode"),
                format!("unknown log mode '{other}' (expected file or ipc)"),
            ))
        }
    };
    let stream = f
        .opt_str("stream")?
        .ok_or_else(|| f.error(Some("stream"), "stream is required"))?;
    let encoding = match f.opt_str("encoding")? {
        None => TextEncoding::Utf8,
        Some(name) => TextEncoding::parse(&name)
            .ok_or_else(|| f.error(Some("encoding"), format!("unknown encoding '{name}'")))?,
    };
    Ok(LogSpec {
        title: f.opt_str("title")?.unwrap_or_else(|| stream.clone()),
        stream,
        mode,
        glob: f.opt_str("glob")?.unwrap_or_default(),
        tail_lines: f.opt_usize("tailLines")?.unwrap_or(DEFAULT_TAIL_LINES),
        max_line_bytes: f.opt_usize("maxLineBytes")?.unwrap_or(DEFAULT_MAX_LINE_BYTES),
        poll_ms: f.opt_u64("pollMs")?.unwrap_or(DEFAULT_POLL_MS),
        encoding,
        allow_missing: f.opt_bool("allowMissing")?.unwrap_or(true),
    })
}

/// `confirm` may be prompt text or `true` for a generic prompt.
pub(crate) fn parse_confirm(f: &Fields<'_>, label: &str) -> Result<Option<String>, ConfigError> {
    match f.get("confirm") {
        Some(JsonValue::Bool(true)) => Ok(Some(format!("Run {label}?"))),
        Some(JsonValue::Bool(false)) => Ok(None),
        _ => f.opt_str("confirm"),
    }
}

fn parse_action(f: &Fields<'_>, status_cwd: Option<&str>) -> Result<ActionSpec, ConfigError> {
    f.check_keys(ACTION_KEYS)?;
    let mode = match f.opt_str("mode")?.as_deref() {
        None | Some("exec") => ActionMode::Exec,
        Some("ipc") => ActionMode::Ipc,
        Some(other) => {
            return Err(f.error(
                Some("mode"),
                format!("unknown action mode '{other}' (expected exec or ipc)"),
            ))
        }
    };
    let name = f
        .opt_str("name")?
        .ok_or_else(|| f.error(Some("name"), "name is required"))?;
    let label = f.opt_str("label")?.unwrap_or_else(|| name.clone());
    let confirm = parse_confirm(f, &label)?;
    Ok(ActionSpec {
        mode,
        cwd: f.opt_str("cwd")?.or_else(|| status_cwd.map(str::to_string)),
        cmd: f.opt_string_list("cmd")?.unwrap_or_default(),
        timeout_seconds: f
            .opt_f64("timeoutSeconds")?
            .unwrap_or(DEFAULT_ACTION_TIMEOUT_SECONDS),
        confirm,
        show_output_panel: f.opt_bool("showOutputPanel")?.unwrap_or(true),
        mutex: f.opt_str("mutex")?.unwrap_or_default(),
        detached: f.opt_bool("detached")?.unwrap_or(false),
        name,
        label,
    })
}
