//! Restricted JSONPath: `$`, `.key` and `[n]`, chained. No wildcards, slices or filters.

use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;

const RENDER_MAX_CHARS: usize = 200;

/// Placeholder shown when a path does not resolve.
pub const MISSING_PLACEHOLDER: &str = "-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathSyntaxError {
    #[error("path must start with '$'")]
    MissingRoot,
    #[error("empty key at offset {0}")]
    EmptyKey(usize),
    #[error("expected non-negative integer index at offset {0}")]
    BadIndex(usize),
    #[error("unexpected character '{ch}' at offset {at}")]
    Unexpected { ch: char, at: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JsonPath {
    segments: Vec<Segment>,
}

impl JsonPath {
    pub fn parse(text: &str) -> Result<Self, PathSyntaxError> {
        let text = text.trim();
        let rest = text.strip_prefix('$').ok_or(PathSyntaxError::MissingRoot)?;
        let bytes = rest.as_bytes();
        let mut segments = Vec::new();
        let mut i = 0;
        while i < bytes.len() {
            match bytes[i] {
                b'.' => {
                    let start = i + 1;
                    let mut end = start;
                    while end < bytes.len() && bytes[end] != b'.' && bytes[end] != b'[' {
                        end += 1;
                    }
                    if end == start {
                        return Err(PathSyntaxError::EmptyKey(start + 1));
                    }
                    segments.push(Segment::Key(rest[start..end].to_string()));
                    i = end;
                }
                b'[' => {
                    let start = i + 1;
                    let mut end = start;
                    while end < bytes.len() && bytes[end].is_ascii_digit() {
                        end += 1;
                    }
                    if end == start || end >= bytes.len() || bytes[end] != b']' {
                        return Err(PathSyntaxError::BadIndex(start + 1));
                    }
                    let n = rest[start..end]
                        .parse::<usize>()
                        .map_err(|_| PathSyntaxError::BadIndex(start + 1))?;
                    segments.push(Segment::Index(n));
                    i = end + 1;
                }
                _ => {
                    let ch = rest[i..].chars().next().unwrap_or('?');
                    return Err(PathSyntaxError::Unexpected { ch, at: i + 1 });
                }
            }
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Walk the path. `None` means "not found", which is distinct from
    /// `Some(&JsonValue::Null)` (present but null).
    pub fn resolve<'a>(&self, value: &'a JsonValue) -> Option<&'a JsonValue> {
        let mut cur = value;
        for seg in &self.segments {
            cur = match seg {
                Segment::Key(k) => cur.as_object()?.get(k)?,
                Segment::Index(n) => cur.as_array()?.get(*n)?,
            };
        }
        Some(cur)
    }
}

impl FromStr for JsonPath {
    type Err = PathSyntaxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JsonPath::parse(s)
    }
}

impl fmt::Display for JsonPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("$")?;
        for seg in &self.segments {
            match seg {
                Segment::Key(k) => write!(f, ".{k}")?,
                Segment::Index(n) => write!(f, "[{n}]")?,
            }
        }
        Ok(())
    }
}

/// Evaluate `path` against `value`. A syntactically invalid path never matches.
pub fn evaluate<'a>(value: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    JsonPath::parse(path).ok()?.resolve(value)
}

/// Display form of an evaluated value. Absent renders as `-`, null as `null`,
/// containers as compact JSON capped at 200 characters.
pub fn render_value(value: Option<&JsonValue>) -> String {
    match value {
        None => MISSING_PLACEHOLDER.to_string(),
        Some(JsonValue::Null) => "null".to_string(),
        Some(JsonValue::String(s)) => s.clone(),
        Some(v @ (JsonValue::Object(_) | JsonValue::Array(_))) => {
            let text = v.to_string();
            if text.chars().count() <= RENDER_MAX_CHARS {
                text
            } else {
                let head: String = text.chars().take(RENDER_MAX_CHARS - 3).collect();
                format!("{head}...")
            }
        }
        Some(v) => v.to_string(),
    }
}
