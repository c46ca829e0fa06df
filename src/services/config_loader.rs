//! Root + include configuration loading.
//!
//! The root document is mandatory and fatal when broken. Include files are
//! processed independently: a broken include contributes `ConfigError`s and
//! no targets, its siblings load normally.

mod canonical;
mod fields;
mod legacy;
mod validate;

pub use legacy::{dot_key_to_jsonpath, slugify};
pub use validate::{is_valid_mutex_name, validate_target};

use crate::error::ConfigError;
use crate::model::{OutputLimits, RootConfig, Target};
use anyhow::{anyhow, Context, Result};
use fields::Fields;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const ROOT_KEYS: &[&str] = &[
    "refreshSeconds",
    "commandTimeoutSeconds",
    "actionOutput",
    "includeFiles",
];

/// Outcome of one load: the root settings, every target that survived
/// validation, and everything that was wrong along the way.
#[derive(Debug, Clone, Default)]
pub struct LoadedConfig {
    pub root: RootConfig,
    pub targets: Vec<Target>,
    pub errors: Vec<ConfigError>,
}

impl LoadedConfig {
    pub fn target(&self, id: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.id == id)
    }
}

/// Which normalizer an include document goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    Legacy,
    Canonical,
}

fn classify(doc: &JsonValue, path: &Path) -> Result<Layout, ConfigError> {
    match doc.get("configVersion") {
        None | Some(JsonValue::Null) => Ok(Layout::Legacy),
        Some(v) if v.as_u64() == Some(2) => Ok(Layout::Canonical),
        Some(v) => Err(ConfigError::new(
            path,
            "/configVersion",
            format!("unsupported configVersion {v} (omit it for the legacy layout or use 2)"),
        )),
    }
}

/// Read a JSON or YAML document into a generic value.
pub fn read_document(path: &Path) -> Result<JsonValue> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let text = text.strip_prefix('\u{feff}').unwrap_or(&text);
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    if is_yaml {
        serde_yaml::from_str(text).with_context(|| format!("parsing YAML {}", path.display()))
    } else {
        serde_json::from_str(text).with_context(|| format!("parsing JSON {}", path.display()))
    }
}

fn resolve_include(root_path: &Path, include: &str) -> PathBuf {
    let candidate = PathBuf::from(crate::services::cmd_runner::expand_vars(include));
    if candidate.is_absolute() {
        return candidate;
    }
    root_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(candidate)
}

fn parse_root(doc: &JsonValue, path: &Path) -> Result<RootConfig, ConfigError> {
    let f = Fields::new(path, "", doc)?;
    f.check_keys(ROOT_KEYS)?;
    let mut root = RootConfig {
        source_path: path.to_path_buf(),
        ..Default::default()
    };
    if let Some(r) = f.opt_f64("refreshSeconds")? {
        if !(r > 0.0) {
            return Err(f.error(Some("refreshSeconds"), "must be greater than zero"));
        }
        root.refresh_seconds = r;
    }
    if let Some(t) = f.opt_f64("commandTimeoutSeconds")? {
        if !(t > 0.0) {
            return Err(f.error(Some("commandTimeoutSeconds"), "must be greater than zero"));
        }
        root.command_timeout_seconds = t;
    }
    if let Some(limits) = f.opt_object("actionOutput")? {
        limits.check_keys(&["maxLines", "maxBytes"])?;
        let defaults = OutputLimits::default();
        root.action_output = OutputLimits {
            max_lines: limits.opt_usize("maxLines")?.unwrap_or(defaults.max_lines),
            max_bytes: limits.opt_usize("maxBytes")?.unwrap_or(defaults.max_bytes),
        };
    }
    let includes = f.opt_array("includeFiles")?.ok_or_else(|| {
        f.error(Some("includeFiles"), "includeFiles must be a list")
    })?;
    for (i, item) in includes.iter().enumerate() {
        match item.as_str().map(str::trim) {
            Some(s) if !s.is_empty() => root.include_files.push(s.to_string()),
            _ => {
                return Err(ConfigError::new(
                    path,
                    format!("/includeFiles/{i}"),
                    "must be a non-empty string",
                ))
            }
        }
    }
    if root.include_files.is_empty() {
        return Err(f.error(Some("includeFiles"), "includeFiles must contain at least one item"));
    }
    Ok(root)
}

/// Normalize and validate one include document already parsed into a value.
pub fn normalize_document(
    doc: &JsonValue,
    path: &Path,
    root: &RootConfig,
) -> (Vec<Target>, Vec<ConfigError>) {
    let layout = match classify(doc, path) {
        Ok(layout) => layout,
        Err(e) => return (vec![], vec![e]),
    };
    let (parsed, mut errors) = match layout {
        Layout::Legacy => legacy::normalize_document(doc, path),
        Layout::Canonical => canonical::parse_document(doc, path, root),
    };
    let mut targets = Vec::with_capacity(parsed.len());
    for (pointer, target) in parsed {
        let problems = validate_target(&target, &pointer);
        if problems.is_empty() {
            targets.push(target);
        } else {
            errors.extend(problems);
        }
    }
    (targets, errors)
}

/// Load one include file. Read and parse failures become a single error
/// against the whole file.
pub fn load_include(path: &Path, root: &RootConfig) -> (Vec<Target>, Vec<ConfigError>) {
    match read_document(path) {
        Ok(doc) => normalize_document(&doc, path, root),
        Err(e) => (vec![], vec![ConfigError::new(path, "", format!("{e:#}"))]),
    }
}

/// Load the root document at `root_path` and every include it lists.
pub fn load(root_path: &Path) -> Result<LoadedConfig> {
    let doc = read_document(root_path).context("loading root configuration")?;
    let root = parse_root(&doc, root_path).map_err(|e| anyhow!("invalid root configuration: {e}"))?;

    let mut loaded = LoadedConfig {
        root,
        ..Default::default()
    };
    let mut owners: HashMap<String, PathBuf> = HashMap::new();
    let includes = loaded.root.include_files.clone();
    for include in &includes {
        let path = resolve_include(root_path, include);
        let (targets, errors) = load_include(&path, &loaded.root);
        loaded.errors.extend(errors);
        for target in targets {
            if let Some(first) = owners.get(&target.id) {
                loaded.errors.push(ConfigError::new(
                    &path,
                    "",
                    format!(
                        "duplicate target id '{}' (also defined in {})",
                        target.id,
                        first.display()
                    ),
                ));
                continue;
            }
            owners.insert(target.id.clone(), path.clone());
            loaded.targets.push(target);
        }
    }

    for e in &loaded.errors {
        tracing::warn!(error = %e, "configuration problem");
    }
    tracing::info!(
        root = %root_path.display(),
        targets = loaded.targets.len(),
        errors = loaded.errors.len(),
        "configuration loaded"
    );
    Ok(loaded)
}

#[cfg(test)]
mod config_loader_tests;
