use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;

/// A problem in one include file. Never aborts loading of sibling files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{}#{}: {}", .path.display(), .pointer, .message)]
pub struct ConfigError {
    pub path: PathBuf,
    /// JSON pointer into the offending document ("" for the whole file).
    pub pointer: String,
    pub message: String,
}

impl ConfigError {
    pub fn new(path: impl Into<PathBuf>, pointer: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            pointer: pointer.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid endpoint '{0}': {1}")]
    InvalidEndpoint(String, String),
    #[error("endpoint '{0}' is not a loopback address")]
    NonLoopback(String),
    #[error("connecting to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },
    #[error("ipc i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("ipc call timed out after {seconds:.1}s")]
    Timeout { seconds: f64 },
    #[error("ipc response exceeds {limit} bytes")]
    ResponseTooLarge { limit: usize },
    #[error("ipc response is empty")]
    EmptyResponse,
    #[error("ipc protocol: {0}")]
    Protocol(String),
    #[error("ipc request failed ({code}): {message}")]
    Remote { code: String, message: String },
    #[error("target does not advertise capability '{0}'")]
    Unsupported(String),
}

impl TransportError {
    // Failures after which a fresh Hello is needed
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            TransportError::Connect { .. }
                | TransportError::Io(_)
                | TransportError::Timeout { .. }
                | TransportError::EmptyResponse
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("status command is empty")]
    EmptyCommand,
    #[error("spawning status command: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("status timeout after {seconds:.1}s")]
    Timeout { seconds: f64 },
    #[error("{0}")]
    NonZeroExit(String),
    #[error("empty status output")]
    EmptyOutput,
    #[error("status output is not a single JSON document: {0}")]
    MalformedJson(#[source] serde_json::Error),
    #[error("status output exceeds {limit} bytes")]
    OutputTooLarge { limit: usize },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogError {
    #[error("(missing) {glob}")]
    Missing { glob: String },
    #[error("invalid glob '{glob}': {message}")]
    Pattern { glob: String, message: String },
    #[error("reading {}: {message}", .path.display())]
    Io { path: PathBuf, message: String },
    #[error("ipc log tail: {0}")]
    Transport(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("unknown target '{0}'")]
    UnknownTarget(String),
    #[error("target '{target}' has no action '{action}'")]
    UnknownAction { target: String, action: String },
    #[error("mutex '{mutex}' is busy (held by run {holder})")]
    Busy { mutex: String, holder: u64 },
    #[error("target '{0}' has no ipc endpoint")]
    NoEndpoint(String),
    #[error("spawning action: {0}")]
    Spawn(#[source] std::io::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Error as published in snapshots: message plus when it happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    pub at: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn now(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            at: Utc::now(),
        }
    }
}
