//! Fixtures shared by unit tests across modules.

use serde_json::{json, Value as JsonValue};
use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub type Handler = dyn Fn(&str, &JsonValue) -> JsonValue + Send + Sync;

/// JSON-lines server on 127.0.0.1 answering each request through `handler`.
pub struct FakeIpcServer {
    pub endpoint: String,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FakeIpcServer {
    pub fn start<F>(handler: F) -> Self
    where
        F: Fn(&str, &JsonValue) -> JsonValue + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let endpoint = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handler: Arc<Handler> = Arc::new(handler);
        let handle = thread::spawn(move || {
            while !stop_flag.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((stream, _)) => {
                        let _ = stream.set_nonblocking(false);
                        let handler = Arc::clone(&handler);
                        thread::spawn(move || {
                            let mut reader = BufReader::new(stream.try_clone().unwrap());
                            let mut line = String::new();
                            if reader.read_line(&mut line).unwrap_or(0) == 0 {
                                return;
                            }
                            let request: JsonValue =
                                serde_json::from_str(line.trim()).unwrap_or(JsonValue::Null);
                            let method = request
                                .get("method")
                                .and_then(|m| m.as_str())
                                .unwrap_or("")
                                .to_string();
                            let params = request.get("params").cloned().unwrap_or(json!({}));
                            let response = handler(&method, &params);
                            let mut stream = stream;
                            let _ = stream.write_all(format!("{response}\n").as_bytes());
                        });
                    }
                    Err(_) => thread::sleep(Duration::from_millis(10)),
                }
            }
        });
        Self {
            endpoint,
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for FakeIpcServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

pub fn ok(response: JsonValue) -> JsonValue {
    json!({"ok": true, "response": response})
}

pub fn hello(capabilities: &[&str]) -> JsonValue {
    ok(json!({
        "protocolVersion": 1,
        "appId": "sample-app",
        "appTitle": "Sample App",
        "bootId": "boot-1",
        "capabilities": capabilities,
    }))
}

/// Poll `cond` until it holds or `timeout` elapses.
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    cond()
}
