use crate::error::ConfigError;
use crate::model::{ActionMode, LogMode, StatusSpec, Target, MIN_MAX_LINE_BYTES, MIN_POLL_MS};
use crate::services::ipc::parse_endpoint;
use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

fn mutex_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.:-]{0,63}$").expect("static pattern"))
}

pub fn is_valid_mutex_name(name: &str) -> bool {
    mutex_pattern().is_match(name)
}

/// Check a normalized target against the canonical shape. `base` is the
/// pointer of the target inside its source document.
pub fn validate_target(target: &Target, base: &str) -> Vec<ConfigError> {
    let path = target.source_path.as_path();
    let mut errors = Vec::new();
    let mut push = |pointer: String, message: String| {
        errors.push(ConfigError::new(path, pointer, message));
    };

    if target.id.trim().is_empty() {
        push(format!("{base}/id"), "id is required".into());
    }
    if target.title.trim().is_empty() {
        push(format!("{base}/title"), "title is required".into());
    }
    if let Some(r) = target.refresh_seconds {
        if !(r > 0.0) {
            push(format!("{base}/refreshSeconds"), "must be greater than zero".into());
        }
    }
    if let Some(t) = target.status.timeout_seconds() {
        if !(t > 0.0) {
            push(format!("{base}/status/timeoutSeconds"), "must be greater than zero".into());
        }
    }
    match &target.status {
        StatusSpec::Exec(exec) => {
            if exec.cmd.is_empty() {
                push(format!("{base}/status/cmd"), "status.cmd must be a non-empty list".into());
            }
        }
        StatusSpec::Ipc(ipc) => {
            if let Err(e) = parse_endpoint(&ipc.endpoint) {
                push(format!("{base}/status/endpoint"), e.to_string());
            }
        }
    }
    let has_ipc = target.status.ipc().is_some();

    let mut streams = HashSet::new();
    for (i, log) in target.logs.iter().enumerate() {
        let at = format!("{base}/logs/{i}");
        if log.stream.trim().is_empty() {
            push(format!("{at}/stream"), "stream is required".into());
        } else if !streams.insert(log.stream.as_str()) {
            push(format!("{at}/stream"), format!("duplicate log stream '{}'", log.stream));
        }
        match log.mode {
            LogMode::File if log.glob.trim().is_empty() => {
                push(format!("{at}/glob"), "glob is required for file logs".into());
            }
            LogMode::Ipc if !has_ipc => {
                push(format!("{at}/mode"), "ipc logs require an ipc status endpoint".into());
            }
            _ => {}
        }
        if log.tail_lines < 1 {
            push(format!("{at}/tailLines"), "must be at least 1".into());
        }
        if log.max_line_bytes < MIN_MAX_LINE_BYTES {
            push(format!("{at}/maxLineBytes"), format!("must be at least {MIN_MAX_LINE_BYTES}"));
        }
        if log.poll_ms < MIN_POLL_MS {
            push(format!("{at}/pollMs"), format!("must be at least {MIN_POLL_MS}"));
        }
    }

    let mut names = HashSet::new();
    for (i, action) in target.actions.iter().enumerate() {
        let at = format!("{base}/actions/{i}");
        if action.name.trim().is_empty() {
            push(format!("{at}/name"), "name is required".into());
        } else if !names.insert(action.name.as_str()) {
            push(format!("{at}/name"), format!("duplicate action name '{}'", action.name));
        }
        match action.mode {
            ActionMode::Exec if action.cmd.is_empty() => {
                push(format!("{at}/cmd"), format!("action '{}' has empty cmd", action.name));
            }
            ActionMode::Ipc if !has_ipc => {
                push(format!("{at}/mode"), "ipc actions require an ipc status endpoint".into());
            }
            _ => {}
        }
        if !(action.timeout_seconds > 0.0) {
            push(format!("{at}/timeoutSeconds"), "must be greater than zero".into());
        }
        if !action.mutex.is_empty() && !is_valid_mutex_name(&action.mutex) {
            push(
                format!("{at}/mutex"),
                format!("mutex '{}' must match [A-Za-z0-9][A-Za-z0-9_.:-]*", action.mutex),
            );
        }
    }

    if !target.ui.get("tabs").map(|t| t.is_array()).unwrap_or(false) {
        push(format!("{base}/ui/tabs"), "ui.tabs must be a list".into());
    }
    errors
}
