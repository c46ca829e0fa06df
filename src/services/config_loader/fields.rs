use crate::error::ConfigError;
use serde_json::{Map, Value as JsonValue};
use std::path::Path;

/// Escape a key for use inside a JSON pointer (RFC 6901).
pub(crate) fn escape_key(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

/// Typed view over one JSON object that remembers where it sits in the
/// document, so every error carries a file path and a pointer.
pub(crate) struct Fields<'a> {
    path: &'a Path,
    pointer: String,
    obj: &'a Map<String, JsonValue>,
}

impl<'a> Fields<'a> {
    pub fn new(path: &'a Path, pointer: impl Into<String>, value: &'a JsonValue) -> Result<Self, ConfigError> {
        let pointer = pointer.into();
        match value.as_object() {
            Some(obj) => Ok(Self { path, pointer, obj }),
            None => Err(ConfigError::new(path, pointer, "must be an object")),
        }
    }

    pub fn path(&self) -> &'a Path {
        self.path
    }

    pub fn pointer(&self) -> &str {
        &self.pointer
    }

    pub fn pointer_for(&self, key: &str) -> String {
        format!("{}/{}", self.pointer, escape_key(key))
    }

    pub fn error(&self, key: Option<&str>, message: impl Into<String>) -> ConfigError {
        let pointer = match key {
            Some(k) => self.pointer_for(k),
            None => self.pointer.clone(),
        };
        ConfigError::new(self.path, pointer, message)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// `$schema` and `x-` prefixed keys are always accepted.
    pub fn check_keys(&self, allowed: &[&str]) -> Result<(), ConfigError> {
        let mut extras: Vec<&str> = self
            .obj
            .keys()
            .map(|k| k.as_str())
            .filter(|k| !allowed.contains(k) && *k != "$schema" && !k.starts_with("x-"))
            .collect();
        if extras.is_empty() {
            return Ok(());
        }
        extras.sort_unstable();
        Err(self.error(None, format!("unsupported keys: {}", extras.join(", "))))
    }

    // null counts as absent
    pub fn get(&self, key: &str) -> Option<&'a JsonValue> {
        self.obj.get(key).filter(|v| !v.is_null())
    }

    pub fn opt_str(&self, key: &str) -> Result<Option<String>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(JsonValue::String(s)) => {
                let s = s.trim();
                Ok(if s.is_empty() { None } else { Some(s.to_string()) })
            }
            Some(_) => Err(self.error(Some(key), "must be a string")),
        }
    }

    pub fn opt_f64(&self, key: &str) -> Result<Option<f64>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(v) => v
                .as_f64()
                .map(Some)
                .ok_or_else(|| self.error(Some(key), "must be a number")),
        }
    }

    pub fn opt_u64(&self, key: &str) -> Result<Option<u64>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(v) => v
                .as_u64()
                .map(Some)
                .ok_or_else(|| self.error(Some(key), "must be a non-negative integer")),
        }
    }

    pub fn opt_usize(&self, key: &str) -> Result<Option<usize>, ConfigError> {
        Ok(self.opt_u64(key)?.map(|n| usize::try_from(n).unwrap_or(usize::MAX)))
    }

    pub fn opt_bool(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(JsonValue::Bool(b)) => Ok(Some(*b)),
            Some(_) => Err(self.error(Some(key), "must be a boolean")),
        }
    }

    pub fn opt_object(&self, key: &str) -> Result<Option<Fields<'a>>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(v) => Fields::new(self.path, self.pointer_for(key), v).map(Some),
        }
    }

    pub fn opt_array(&self, key: &str) -> Result<Option<&'a Vec<JsonValue>>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(JsonValue::Array(items)) => Ok(Some(items)),
            Some(_) => Err(self.error(Some(key), "must be a list")),
        }
    }

    /// A list of non-empty strings. Blank entries are dropped.
    pub fn opt_string_list(&self, key: &str) -> Result<Option<Vec<String>>, ConfigError> {
        let Some(items) = self.opt_array(key)? else {
            return Ok(None);
        };
        let mut out = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            match item {
                JsonValue::String(s) if !s.trim().is_empty() => out.push(s.clone()),
                JsonValue::String(_) => {}
                JsonValue::Number(n) => out.push(n.to_string()),
                _ => {
                    return Err(ConfigError::new(
                        self.path,
                        format!("{}/{}", self.pointer_for(key), i),
                        "must be a string",
                    ))
                }
            }
        }
        Ok(Some(out))
    }
}
