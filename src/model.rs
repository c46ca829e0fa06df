use serde::Serialize;
use serde_json::{json, Map, Value as JsonValue};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_REFRESH_SECONDS: f64 = 1.0;
pub const DEFAULT_COMMAND_TIMEOUT_SECONDS: f64 = 10.0;
pub const DEFAULT_ACTION_TIMEOUT_SECONDS: f64 = 120.0;
pub const DEFAULT_ACTION_OUTPUT_MAX_LINES: usize = 1200;
pub const DEFAULT_ACTION_OUTPUT_MAX_BYTES: usize = 1_000_000;
pub const MIN_REFRESH_SECONDS: f64 = 0.2;

pub const DEFAULT_TAIL_LINES: usize = 300;
pub const DEFAULT_MAX_LINE_BYTES: usize = 4096;
pub const DEFAULT_POLL_MS: u64 = 500;
pub const MIN_MAX_LINE_BYTES: usize = 64;
pub const MIN_POLL_MS: u64 = 100;

pub const DEFAULT_IPC_MAX_RESPONSE_BYTES: usize = 1024 * 1024;

/// Sliding-window bound applied to an action run's output buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputLimits {
    pub max_lines: usize,
    pub max_bytes: usize,
}

impl Default for OutputLimits {
    fn default() -> Self {
        Self {
            max_lines: DEFAULT_ACTION_OUTPUT_MAX_LINES,
            max_bytes: DEFAULT_ACTION_OUTPUT_MAX_BYTES,
        }
    }
}

impl OutputLimits {
    // Zero limits would make every append evict itself
    pub fn clamped(self) -> Self {
        Self {
            max_lines: self.max_lines.max(1),
            max_bytes: self.max_bytes.max(1),
        }
    }

    fn to_json(self) -> JsonValue {
        json!({"maxLines": self.max_lines, "maxBytes": self.max_bytes})
    }
}

/// Root document. Immutable once loaded; a reload builds a fresh value.
#[derive(Debug, Clone, PartialEq)]
pub struct RootConfig {
    pub source_path: PathBuf,
    pub refresh_seconds: f64,
    pub command_timeout_seconds: f64,
    pub action_output: OutputLimits,
    pub include_files: Vec<String>,
}

impl Default for RootConfig {
    fn default() -> Self {
        Self {
            source_path: PathBuf::new(),
            refresh_seconds: DEFAULT_REFRESH_SECONDS,
            command_timeout_seconds: DEFAULT_COMMAND_TIMEOUT_SECONDS,
            action_output: OutputLimits::default(),
            include_files: vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecSpec {
    pub cwd: Option<String>,
    pub cmd: Vec<String>,
    pub timeout_seconds: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IpcSpec {
    pub endpoint: String,
    pub timeout_seconds: Option<f64>,
    pub max_response_bytes: Option<usize>,
}

impl IpcSpec {
    pub fn max_response_bytes(&self) -> usize {
        self.max_response_bytes
            .unwrap_or(DEFAULT_IPC_MAX_RESPONSE_BYTES)
    }
}

/// How a target reports its status: a local command or an IPC endpoint, never both.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusSpec {
    Exec(ExecSpec),
    Ipc(IpcSpec),
}

impl StatusSpec {
    pub fn timeout_seconds(&self) -> Option<f64> {
        match self {
            StatusSpec::Exec(e) => e.timeout_seconds,
            StatusSpec::Ipc(i) => i.timeout_seconds,
        }
    }

    pub fn cwd(&self) -> Option<&str> {
        match self {
            StatusSpec::Exec(e) => e.cwd.as_deref(),
            StatusSpec::Ipc(_) => None,
        }
    }

    pub fn ipc(&self) -> Option<&IpcSpec> {
        match self {
            StatusSpec::Ipc(i) => Some(i),
            StatusSpec::Exec(_) => None,
        }
    }

    fn to_json(&self) -> JsonValue {
        let mut obj = Map::new();
        match self {
            StatusSpec::Exec(e) => {
                obj.insert("mode".into(), json!("exec"));
                if let Some(cwd) = &e.cwd {
                    obj.insert("cwd".into(), json!(cwd));
                }
                obj.insert("cmd".into(), json!(e.cmd));
                if let Some(t) = e.timeout_seconds {
                    obj.insert("timeoutSeconds".into(), json!(t));
                }
            }
            StatusSpec::Ipc(i) => {
                obj.insert("mode".into(), json!("ipc"));
                obj.insert("endpoint".into(), json!(i.endpoint));
                if let Some(t) = i.timeout_seconds {
                    obj.insert("timeoutSeconds".into(), json!(t));
                }
                if let Some(m) = i.max_response_bytes {
                    obj.insert("maxResponseBytes".into(), json!(m));
                }
            }
        }
        JsonValue::Object(obj)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TextEncoding {
    Utf8,
    Latin1,
    Ascii,
}

impl TextEncoding {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "utf-8" | "utf8" | "utf-8-sig" => Some(TextEncoding::Utf8),
            "latin-1" | "latin1" | "iso-8859-1" | "iso8859-1" | "l1" => Some(TextEncoding::Latin1),
            "ascii" | "us-ascii" => Some(TextEncoding::Ascii),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TextEncoding::Utf8 => "utf-8",
            TextEncoding::Latin1 => "latin-1",
            TextEncoding::Ascii => "ascii",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogMode {
    File,
    Ipc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogSpec {
    pub stream: String,
    pub title: String,
    pub mode: LogMode,
    pub glob: String,
    pub tail_lines: usize,
    pub max_line_bytes: usize,
    pub poll_ms: u64,
    pub encoding: TextEncoding,
    pub allow_missing: bool,
}

impl LogSpec {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_ms.max(MIN_POLL_MS))
    }

    fn to_json(&self) -> JsonValue {
        json!({
            "mode": match self.mode { LogMode::File => "file", LogMode::Ipc => "ipc" },
            "stream": self.stream,
            "title": self.title,
            "glob": self.glob,
            "tailLines": self.tail_lines,
            "maxLineBytes": self.max_line_bytes,
            "pollMs": self.poll_ms,
            "encoding": self.encoding.as_str(),
            "allowMissing": self.allow_missing,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionMode {
    Exec,
    Ipc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionSpec {
    pub name: String,
    pub label: String,
    pub mode: ActionMode,
    pub cwd: Option<String>,
    pub cmd: Vec<String>,
    pub timeout_seconds: f64,
    /// Prompt text the caller shows before running. The executor never waits on it.
    pub confirm: Option<String>,
    pub show_output_panel: bool,
    /// Exclusion group; empty means unconstrained.
    pub mutex: String,
    pub detached: bool,
}

impl ActionSpec {
    pub fn requires_confirmation(&self) -> bool {
        self.confirm.as_deref().map(|s| !s.is_empty()).unwrap_or(false)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_seconds.max(0.0))
    }

    fn to_json(&self) -> JsonValue {
        let mut obj = Map::new();
        obj.insert(
            "mode".into(),
            json!(match self.mode {
                ActionMode::Exec => "exec",
                ActionMode::Ipc => "ipc",
            }),
        );
        obj.insert("name".into(), json!(self.name));
        obj.insert("label".into(), json!(self.label));
        if let Some(cwd) = &self.cwd {
            obj.insert("cwd".into(), json!(cwd));
        }
        if !self.cmd.is_empty() {
            obj.insert("cmd".into(), json!(self.cmd));
        }
        obj.insert("timeoutSeconds".into(), json!(self.timeout_seconds));
        if let Some(c) = &self.confirm {
            obj.insert("confirm".into(), json!(c));
        }
        obj.insert("showOutputPanel".into(), json!(self.show_output_panel));
        obj.insert("mutex".into(), json!(self.mutex));
        obj.insert("detached".into(), json!(self.detached));
        JsonValue::Object(obj)
    }
}

/// One observed process. Owned by the loaded configuration and replaced wholesale on reload.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub id: String,
    pub title: String,
    pub refresh_seconds: Option<f64>,
    pub status: StatusSpec,
    pub logs: Vec<LogSpec>,
    pub actions: Vec<ActionSpec>,
    // Rendering tree; the core passes it through without looking inside
    pub ui: JsonValue,
    pub action_output: Option<OutputLimits>,
    pub source_path: PathBuf,
}

impl Target {
    pub fn refresh_interval(&self, root: &RootConfig) -> Duration {
        let secs = self
            .refresh_seconds
            .unwrap_or(root.refresh_seconds)
            .max(MIN_REFRESH_SECONDS);
        Duration::from_secs_f64(secs)
    }

    pub fn status_timeout(&self, root: &RootConfig) -> Duration {
        let secs = self
            .status
            .timeout_seconds()
            .unwrap_or(root.command_timeout_seconds);
        Duration::from_secs_f64(secs.max(0.0))
    }

    pub fn output_limits(&self, root: &RootConfig) -> OutputLimits {
        self.action_output.unwrap_or(root.action_output).clamped()
    }

    pub fn action(&self, name: &str) -> Option<&ActionSpec> {
        self.actions.iter().find(|a| a.name == name)
    }

    pub fn log(&self, stream: &str) -> Option<&LogSpec> {
        self.logs.iter().find(|l| l.stream == stream)
    }

    /// Render the target as a canonical (`configVersion: 2`) include document.
    /// Loading that document again yields an equal target.
    pub fn to_canonical(&self) -> JsonValue {
        let mut obj = Map::new();
        obj.insert("configVersion".into(), json!(2));
        obj.insert("id".into(), json!(self.id));
        obj.insert("title".into(), json!(self.title));
        if let Some(r) = self.refresh_seconds {
            obj.insert("refreshSeconds".into(), json!(r));
        }
        obj.insert("status".into(), self.status.to_json());
        obj.insert(
            "logs".into(),
            JsonValue::Array(self.logs.iter().map(LogSpec::to_json).collect()),
        );
        obj.insert(
            "actions".into(),
            JsonValue::Array(self.actions.iter().map(ActionSpec::to_json).collect()),
        );
        obj.insert("ui".into(), self.ui.clone());
        if let Some(limits) = self.action_output {
            obj.insert("actionOutput".into(), limits.to_json());
        }
        JsonValue::Object(obj)
    }
}
