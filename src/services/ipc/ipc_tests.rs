use super::*;
use crate::test_support::{hello, ok, FakeIpcServer};
use serde_json::json;
use std::net::TcpListener;
use std::thread;

fn client(endpoint: &str) -> IpcClient {
    IpcClient::new(endpoint, Duration::from_secs(2), 64 * 1024).unwrap()
}

#[test]
fn parse_endpoint_accepts_loopback_forms() {
    assert_eq!(
        parse_endpoint("127.0.0.1:8777").unwrap(),
        Endpoint {
            host: "127.0.0.1".into(),
            port: 8777
        }
    );
    assert_eq!(parse_endpoint("tcp://localhost:9000").unwrap().port, 9000);
    assert_eq!(parse_endpoint("http://[::1]:80/").unwrap().host, "::1");
    assert_eq!(parse_endpoint(":8777").unwrap().host, "127.0.0.1");
}

#[test]
fn parse_endpoint_rejects_remote_and_malformed() {
    assert!(matches!(
        parse_endpoint("10.0.0.5:8777"),
        Err(TransportError::NonLoopback(_))
    ));
    assert!(matches!(
        parse_endpoint("example.com:80"),
        Err(TransportError::NonLoopback(_))
    ));
    assert!(parse_endpoint("127.0.0.1").is_err());
    assert!(parse_endpoint("127.0.0.1:0").is_err());
    assert!(parse_endpoint("127.0.0.1:99999").is_err());
    assert!(parse_endpoint("").is_err());
}

#[test]
fn hello_and_status_round_trip() {
    let server = FakeIpcServer::start(|method, _| match method {
        "hello" => hello(&["log.tail"]),
        "status.get" => ok(json!({"state": "ok"})),
        _ => json!({"ok": false, "error": {"code": "unsupported_method", "message": "nope"}}),
    });
    let c = client(&server.endpoint);
    let info = c.hello().unwrap();
    assert_eq!(info.app_id, "sample-app");
    assert!(info.supports("log.tail"));
    assert!(!info.supports("action.invoke"));
    assert_eq!(c.get_status().unwrap(), json!({"state": "ok"}));
    assert_eq!(c.cached_hello().unwrap().boot_id, "boot-1");
}

#[test]
fn optional_calls_require_capability() {
    let server = FakeIpcServer::start(|method, _| match method {
        "hello" => hello(&[]),
        _ => ok(json!({"lines": ["x"], "nextCursor": 1})),
    });
    let c = client(&server.endpoint);
    let err = c.get_log_tail("main", 0).unwrap_err();
    assert!(matches!(err, TransportError::Unsupported(cap) if cap == "log.tail"));
    assert!(c.invoke_action("ping", json!({})).is_err());
}

#[test]
fn log_tail_passes_cursor() {
    let server = FakeIpcServer::start(|method, params| match method {
        "hello" => hello(&["log.tail"]),
        "log.tail" => {
            let cursor = params["cursor"].as_u64().unwrap_or(0);
            ok(json!({"lines": [format!("line {cursor}")], "nextCursor": cursor + 1}))
        }
        _ => json!({"ok": false}),
    });
    let c = client(&server.endpoint);
    let tail = c.get_log_tail("main", 41).unwrap();
    assert_eq!(tail.lines, vec!["line 41".to_string()]);
    assert_eq!(tail.next_cursor, 42);
}

#[test]
fn remote_errors_are_surfaced() {
    let server = FakeIpcServer::start(|_, _| {
        json!({"ok": false, "error": {"code": "invalid_params", "message": "jobId is required"}})
    });
    let c = client(&server.endpoint);
    match c.job_status("") {
        Err(TransportError::Remote { code, message }) => {
            assert_eq!(code, "invalid_params");
            assert_eq!(message, "jobId is required");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn oversized_response_is_rejected() {
    let server = FakeIpcServer::start(|_, _| ok(json!({"blob": "x".repeat(4096)})));
    let c = IpcClient::new(&server.endpoint, Duration::from_secs(2), 1024).unwrap();
    assert!(matches!(
        c.get_status(),
        Err(TransportError::ResponseTooLarge { limit: 1024 })
    ));
}

#[test]
fn connection_failure_clears_cached_hello() {
    let server = FakeIpcServer::start(|_, _| hello(&[]));
    let endpoint = server.endpoint.clone();
    let c = client(&endpoint);
    c.hello().unwrap();
    assert!(c.cached_hello().is_some());
    drop(server);
    assert!(c.get_status().is_err());
    assert!(c.cached_hello().is_none());
}

#[test]
fn trickled_response_is_bounded_by_call_timeout() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let endpoint = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut request = String::new();
        BufReader::new(stream.try_clone().unwrap())
            .read_line(&mut request)
            .unwrap();
        // one byte at a time, each well inside the read timeout
        for _ in 0..8 {
            if stream.write_all(b" ").is_err() {
                return;
            }
            thread::sleep(Duration::from_millis(500));
        }
        let _ = stream.write_all(b"{\"ok\":true,\"response\":{}}\n");
    });

    let c = IpcClient::new(&endpoint, Duration::from_secs(1), 64 * 1024).unwrap();
    let started = Instant::now();
    let err = c.get_status().unwrap_err();
    assert!(matches!(err, TransportError::Timeout { .. }), "{err}");
    assert_eq!(err.to_string(), "ipc call timed out after 1.0s");
    assert!(started.elapsed() < Duration::from_secs(3));
    let _ = server.join();
}
