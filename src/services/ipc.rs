//! Loopback-only JSON-lines client for targets that speak the IPC contract.
//!
//! Each call opens a connection, writes one `{"method", "params"}` line and
//! reads one `{"ok", "response" | "error"}` line back, bounded by a timeout
//! and a response size limit.

use crate::error::TransportError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const CAP_LOG_TAIL: &str = "log.tail";
pub const CAP_ACTION_INVOKE: &str = "action.invoke";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloInfo {
    pub protocol_version: u32,
    pub app_id: String,
    #[serde(default)]
    pub app_title: String,
    pub boot_id: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl HelloInfo {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogTail {
    #[serde(default)]
    pub lines: Vec<String>,
    pub next_cursor: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub state: String,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self.state.as_str(), "succeeded" | "failed" | "cancelled" | "timedOut")
    }
}

/// Host and port of a loopback endpoint. Accepts `host:port` and `scheme://host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

pub fn parse_endpoint(text: &str) -> Result<Endpoint, TransportError> {
    let raw = text.trim();
    let invalid = |why: &str| TransportError::InvalidEndpoint(raw.to_string(), why.to_string());
    if raw.is_empty() {
        return Err(invalid("endpoint is empty"));
    }
    let without_scheme = raw.split_once("://").map(|(_, rest)| rest).unwrap_or(raw);
    let authority = without_scheme.split('/').next().unwrap_or("");
    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        // [::1]:8777
        let (h, p) = rest.split_once("]:").ok_or_else(|| invalid("expected [host]:port"))?;
        (h.to_string(), p)
    } else {
        let (h, p) = authority.rsplit_once(':').ok_or_else(|| invalid("expected host:port"))?;
        (h.to_string(), p)
    };
    let port: u16 = port
        .trim()
        .parse()
        .map_err(|_| invalid("port is not a number in 1..65535"))?;
    if port == 0 {
        return Err(invalid("port is not a number in 1..65535"));
    }
    let host = if host.trim().is_empty() {
        "127.0.0.1".to_string()
    } else {
        host.trim().to_string()
    };
    let loopback = host.eq_ignore_ascii_case("localhost")
        || host.parse::<IpAddr>().map(|ip| ip.is_loopback()).unwrap_or(false);
    if !loopback {
        return Err(TransportError::NonLoopback(raw.to_string()));
    }
    Ok(Endpoint { host, port })
}

impl Endpoint {
    fn resolve(&self) -> Result<SocketAddr, TransportError> {
        let addrs = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| TransportError::InvalidEndpoint(self.to_string(), e.to_string()))?;
        addrs
            .into_iter()
            .find(|a| a.ip().is_loopback())
            .ok_or_else(|| TransportError::NonLoopback(self.to_string()))
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

pub struct IpcClient {
    endpoint: Endpoint,
    timeout: Duration,
    max_response_bytes: usize,
    hello: Mutex<Option<HelloInfo>>,
}

impl IpcClient {
    pub fn new(
        endpoint: &str,
        timeout: Duration,
        max_response_bytes: usize,
    ) -> Result<Self, TransportError> {
        Ok(Self {
            endpoint: parse_endpoint(endpoint)?,
            timeout: timeout.max(Duration::from_millis(100)),
            max_response_bytes: max_response_bytes.max(1024),
            hello: Mutex::new(None),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Handshake. The result is cached until `invalidate` is called.
    pub fn hello(&self) -> Result<HelloInfo, TransportError> {
        let response = self.call("hello", json!({}))?;
        let info: HelloInfo = serde_json::from_value(response)
            .map_err(|e| TransportError::Protocol(format!("hello response: {e}")))?;
        if let Ok(mut slot) = self.hello.lock() {
            if let Some(prev) = slot.as_ref() {
                if prev.boot_id != info.boot_id {
                    tracing::info!(
                        endpoint = %self.endpoint,
                        old = %prev.boot_id,
                        new = %info.boot_id,
                        "target instance restarted"
                    );
                }
            }
            *slot = Some(info.clone());
        }
        Ok(info)
    }

    pub fn cached_hello(&self) -> Option<HelloInfo> {
        self.hello.lock().ok().and_then(|h| h.clone())
    }

    /// Forget the cached handshake so the next capability check redoes it.
    pub fn invalidate(&self) {
        if let Ok(mut slot) = self.hello.lock() {
            slot.take();
        }
    }

    pub fn ensure_capability(&self, capability: &str) -> Result<(), TransportError> {
        let info = match self.cached_hello() {
            Some(info) => info,
            None => self.hello()?,
        };
        if info.supports(capability) {
            Ok(())
        } else {
            Err(TransportError::Unsupported(capability.to_string()))
        }
    }

    pub fn get_status(&self) -> Result<JsonValue, TransportError> {
        self.call("status.get", json!({}))
    }

    pub fn get_log_tail(&self, stream: &str, cursor: u64) -> Result<LogTail, TransportError> {
        self.ensure_capability(CAP_LOG_TAIL)?;
        let response = self.call("log.tail", json!({"stream": stream, "cursor": cursor}))?;
        serde_json::from_value(response)
            .map_err(|e| TransportError::Protocol(format!("log.tail response: {e}")))
    }

    pub fn invoke_action(&self, action: &str, args: JsonValue) -> Result<String, TransportError> {
        self.ensure_capability(CAP_ACTION_INVOKE)?;
        let response = self.call("action.invoke", json!({"actionName": action, "args": args}))?;
        response
            .get("jobId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| TransportError::Protocol("action.invoke response has no jobId".into()))
    }

    pub fn job_status(&self, job_id: &str) -> Result<JobStatus, TransportError> {
        let response = self.call("action.job.get", json!({"jobId": job_id}))?;
        serde_json::from_value(response)
            .map_err(|e| TransportError::Protocol(format!("action.job.get response: {e}")))
    }

    fn remaining(&self, deadline: Instant) -> Result<Duration, TransportError> {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(self.timed_out());
        }
        Ok(left)
    }

    fn timed_out(&self) -> TransportError {
        TransportError::Timeout {
            seconds: self.timeout.as_secs_f64(),
        }
    }

    fn io_error(&self, e: std::io::Error) -> TransportError {
        match e.kind() {
            ErrorKind::WouldBlock | ErrorKind::TimedOut => self.timed_out(),
            _ => TransportError::Io(e),
        }
    }

    fn call(&self, method: &str, params: JsonValue) -> Result<JsonValue, TransportError> {
        let result = self.round_trip(method, params);
        if let Err(e) = &result {
            if e.is_connection_level() {
                self.invalidate();
            }
        }
        result
    }

    fn round_trip(&self, method: &str, params: JsonValue) -> Result<JsonValue, TransportError> {
        // One deadline for the whole call, not per syscall
        let deadline = Instant::now() + self.timeout;
        let addr = self.endpoint.resolve()?;
        let mut stream =
            TcpStream::connect_timeout(&addr, self.timeout).map_err(|source| TransportError::Connect {
                endpoint: self.endpoint.to_string(),
                source,
            })?;
        stream.set_write_timeout(Some(self.remaining(deadline)?))?;

        let mut line = serde_json::to_vec(&json!({"method": method, "params": params}))
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        line.push(b'\n');
        stream.write_all(&line).map_err(|e| self.io_error(e))?;
        stream.flush().map_err(|e| self.io_error(e))?;

        let limit = self.max_response_bytes;
        let mut reader = BufReader::new(stream.take(limit as u64 + 1));
        let mut buf = Vec::new();
        loop {
            let left = self.remaining(deadline)?;
            reader.get_ref().get_ref().set_read_timeout(Some(left))?;
            let available = reader.fill_buf().map_err(|e| self.io_error(e))?;
            if available.is_empty() {
                break;
            }
            match available.iter().position(|b| *b == b'\n') {
                Some(i) => {
                    buf.extend_from_slice(&available[..=i]);
                    reader.consume(i + 1);
                    break;
                }
                None => {
                    let n = available.len();
                    buf.extend_from_slice(available);
                    reader.consume(n);
                }
            }
        }
        if buf.len() > limit {
            return Err(TransportError::ResponseTooLarge { limit });
        }
        let text = String::from_utf8_lossy(&buf);
        let text = text.trim();
        if text.is_empty() {
            return Err(TransportError::EmptyResponse);
        }
        let envelope: JsonValue = serde_json::from_str(text)
            .map_err(|e| TransportError::Protocol(format!("response is not JSON: {e}")))?;
        unwrap_envelope(envelope)
    }
}

fn unwrap_envelope(envelope: JsonValue) -> Result<JsonValue, TransportError> {
    let obj = envelope
        .as_object()
        .ok_or_else(|| TransportError::Protocol("response is not an object".into()))?;
    if obj.get("ok").and_then(|v| v.as_bool()).unwrap_or(false) {
        return Ok(obj.get("response").cloned().unwrap_or(JsonValue::Null));
    }
    let err = obj.get("error");
    let code = err
        .and_then(|e| e.get("code"))
        .and_then(|c| c.as_str())
        .unwrap_or("request_failed")
        .to_string();
    let message = err
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .unwrap_or("ipc request failed")
        .to_string();
    Err(TransportError::Remote { code, message })
}

#[cfg(test)]
mod ipc_tests;
