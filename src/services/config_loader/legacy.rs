//! Upgrade of legacy (unversioned) include files to the canonical target model.

use super::canonical::{parse_confirm, target_blocks};
use super::fields::Fields;
use crate::error::ConfigError;
use crate::model::*;
use serde_json::{json, Value as JsonValue};
use std::collections::HashSet;
use std::path::Path;

const LEGACY_TAIL_LINES: usize = 120;

/// Lowercase, non-alphanumerics collapsed to single dashes.
pub fn slugify(text: &str, fallback: &str) -> String {
    let cleaned: String = text
        .trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_lowercase().next().unwrap_or(c)
            } else {
                '-'
            }
        })
        .collect();
    let compact = cleaned
        .split('-')
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if compact.is_empty() {
        fallback.to_string()
    } else {
        compact
    }
}

/// `a.b.c` -> `$.a.b.c`
pub fn dot_key_to_jsonpath(key: &str) -> String {
    let parts: Vec<&str> = key.split('.').map(str::trim).filter(|p| !p.is_empty()).collect();
    if parts.is_empty() {
        "$".to_string()
    } else {
        format!("$.{}", parts.join("."))
    }
}

// Append -2, -3, ... until the name is free
fn unique_name(base: String, taken: &mut HashSet<String>) -> String {
    let mut name = base.clone();
    let mut n = 2;
    while taken.contains(&name) {
        name = format!("{base}-{n}");
        n += 1;
    }
    taken.insert(name.clone());
    name
}

/// Command given either as a list or as one shell-quoted string.
fn command_vector(f: &Fields<'_>, key: &str) -> Result<Vec<String>, ConfigError> {
    match f.get(key) {
        None => Ok(vec![]),
        Some(JsonValue::String(s)) => shlex::split(s)
            .map(|parts| parts.into_iter().filter(|p| !p.trim().is_empty()).collect())
            .ok_or_else(|| f.error(Some(key), "command has unbalanced quotes")),
        Some(_) => Ok(f.opt_string_list(key)?.unwrap_or_default()),
    }
}

pub(crate) fn normalize_document(
    doc: &JsonValue,
    path: &Path,
) -> (Vec<(String, Target)>, Vec<ConfigError>) {
    let mut targets = Vec::new();
    let mut errors = Vec::new();

    let top = match Fields::new(path, "", doc) {
        Ok(f) => f,
        Err(e) => return (targets, vec![e]),
    };
    let blocks = target_blocks(doc);
    if blocks.is_empty() {
        errors.push(top.error(None, "no targets found (expected 'target' or 'targets')"));
        return (targets, errors);
    }
    let logs = match legacy_logs(&top) {
        Ok(logs) => logs,
        Err(e) => return (targets, vec![e]),
    };
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "target".to_string());

    for (index, (pointer, block)) in blocks.into_iter().enumerate() {
        let result = Fields::new(path, pointer.clone(), block)
            .and_then(|f| legacy_target(&f, &format!("{stem}-{}", index + 1), &logs, path));
        match result {
            Ok(target) => targets.push((pointer, target)),
            Err(e) => errors.push(e),
        }
    }
    (targets, errors)
}

// File-level log panels; every target of the file shares them
fn legacy_logs(top: &Fields<'_>) -> Result<Vec<LogSpec>, ConfigError> {
    let Some(items) = top.opt_array("logPanels")? else {
        return Ok(vec![]);
    };
    let mut streams = HashSet::new();
    let mut out = Vec::new();
    for (i, item) in items.iter().enumerate() {
        let Ok(panel) = Fields::new(top.path(), format!("/logPanels/{i}"), item) else {
            continue;
        };
        let Some(glob) = panel.opt_str("path")? else {
            tracing::debug!(pointer = panel.pointer(), "log panel without path skipped");
            continue;
        };
        let fallback = format!("log-{}", i + 1);
        let name = panel.opt_str("name")?;
        let stream = unique_name(
            slugify(name.as_deref().unwrap_or(&fallback), &fallback),
            &mut streams,
        );
        out.push(LogSpec {
            title: name.unwrap_or_else(|| stream.clone()),
            stream,
            mode: LogMode::File,
            glob,
            tail_lines: panel.opt_usize("tailLines")?.unwrap_or(LEGACY_TAIL_LINES).max(1),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            poll_ms: DEFAULT_POLL_MS,
            encoding: TextEncoding::Utf8,
            allow_missing: true,
        });
    }
    Ok(out)
}

fn legacy_target(
    f: &Fields<'_>,
    default_id: &str,
    logs: &[LogSpec],
    path: &Path,
) -> Result<Target, ConfigError> {
    let id = f.opt_str("id")?.unwrap_or_else(|| default_id.to_string());
    let title = match f.opt_str("name")? {
        Some(name) => name,
        None => f.opt_str("title")?.unwrap_or_else(|| id.clone()),
    };
    let cwd = f.opt_str("cwd")?;
    let status_cmd = command_vector(f, "statusCommand")?;
    if status_cmd.is_empty() {
        return Err(f.error(
            Some("statusCommand"),
            format!("legacy target '{id}' is missing statusCommand"),
        ));
    }

    let mut names = HashSet::new();
    let mut actions = Vec::new();
    if let Some(items) = f.opt_array("commands")? {
        for (i, item) in items.iter().enumerate() {
            let c = Fields::new(path, format!("{}/{}", f.pointer_for("commands"), i), item)?;
            let cmd = command_vector(&c, "command")?;
            if cmd.is_empty() {
                tracing::debug!(pointer = c.pointer(), "command without argv skipped");
                continue;
            }
            let label = c
                .opt_str("label")?
                .unwrap_or_else(|| format!("Action {}", i + 1));
            let fallback = format!("action-{}", i + 1);
            let base = slugify(c.opt_str("name")?.as_deref().unwrap_or(&label), &fallback);
            actions.push(ActionSpec {
                name: unique_name(base, &mut names),
                mode: ActionMode::Exec,
                cwd: c.opt_str("cwd")?.or_else(|| cwd.clone()),
                cmd,
                timeout_seconds: c
                    .opt_f64("timeoutSeconds")?
                    .unwrap_or(DEFAULT_ACTION_TIMEOUT_SECONDS),
                confirm: parse_confirm(&c, &label)?,
                show_output_panel: c.opt_bool("showOutputPanel")?.unwrap_or(true),
                // Legacy commands are never grouped or detached
                mutex: String::new(),
                detached: false,
                label,
            });
        }
    }

    let mut items = Vec::new();
    if let Some(fields) = f.opt_array("fields")? {
        for field in fields {
            let Some(obj) = field.as_object() else { continue };
            let key = obj.get("key").and_then(|k| k.as_str()).unwrap_or("").trim();
            if key.is_empty() {
                continue;
            }
            let label = obj
                .get("label")
                .and_then(|l| l.as_str())
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .unwrap_or(key);
            items.push(json!({"label": label, "jsonpath": dot_key_to_jsonpath(key)}));
        }
    }

    let mut tabs = Vec::new();
    if !items.is_empty() {
        tabs.push(json!({
            "id": "status",
            "title": "Status",
            "widgets": [{"type": "kv", "title": "Status", "items": items}],
        }));
    }
    if !logs.is_empty() {
        let widgets: Vec<JsonValue> = logs
            .iter()
            .map(|l| json!({"type": "log", "title": l.title, "stream": l.stream}))
            .collect();
        tabs.push(json!({"id": "logs", "title": "Logs", "widgets": widgets}));
    }
    if !actions.is_empty() {
        let widgets: Vec<JsonValue> = actions
            .iter()
            .map(|a| json!({"type": "button", "label": a.label, "action": a.name}))
            .collect();
        tabs.push(json!({"id": "actions", "title": "Actions", "widgets": widgets}));
    }
    if tabs.is_empty() {
        tabs.push(json!({"id": "status", "title": "Status", "widgets": []}));
    }

    Ok(Target {
        id,
        title,
        refresh_seconds: f.opt_f64("refreshSeconds")?,
        status: StatusSpec::Exec(ExecSpec {
            cwd,
            cmd: status_cmd,
            timeout_seconds: f.opt_f64("statusTimeoutSeconds")?,
        }),
        logs: logs.to_vec(),
        actions,
        ui: json!({ "tabs": tabs }),
        action_output: None,
        source_path: path.to_path_buf(),
    })
}
