//! HTTP Transport Integration Tests
//!
//! Starts the server on an ephemeral port and talks to it over real sockets.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;

use modgate::config::ServerConfig;
use modgate::module::{CatalogLoader, Fault, MethodDef, Module, TypeDef, TypeRef, Value};
use modgate::{Gateway, Server};

fn start_server(max_body_bytes: usize) -> SocketAddr {
    let catalog = CatalogLoader::new().with_module("/srv/echo.so", |path| {
        Ok(Module::new(path).with_type(
            TypeDef::new("Echo.Service")
                .method(MethodDef::new_static(
                    "Echo",
                    vec![TypeRef::TEXT],
                    TypeRef::TEXT,
                    |args| Ok(Some(Value::Text(args[0].text()?.to_string()))),
                ))
                .method(MethodDef::new_static("Fail", vec![], TypeRef::TEXT, |_| {
                    Err(Fault::new("report store unavailable"))
                }))
                .method(
                    MethodDef::new_static("Hidden", vec![], TypeRef::Void, |_| Ok(None))
                        .private(),
                ),
        ))
    });

    let config = ServerConfig {
        bind: "127.0.0.1:0".to_string(),
        max_body_bytes,
        read_timeout_secs: 5,
    };
    let listener = TcpListener::bind(&config.bind).unwrap();
    let addr = listener.local_addr().unwrap();

    let server = Server::new(Gateway::new(catalog), config);
    thread::spawn(move || server.run(listener));
    addr
}

/// Send a raw request and split the reply into status and body
fn send(addr: SocketAddr, raw: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(raw.as_bytes()).unwrap();

    let mut reply = String::new();
    stream.read_to_string(&mut reply).unwrap();

    let status = reply
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap();
    let body = reply
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    (status, body)
}

fn post_invoke(addr: SocketAddr, body: &str) -> (u16, serde_json::Value) {
    let raw = format!(
        "POST /invoke HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    let (status, body) = send(addr, &raw);
    (status, serde_json::from_str(&body).unwrap())
}

#[test]
fn test_health() {
    let addr = start_server(1024);
    let (status, body) = send(addr, "GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert_eq!(status, 200);
    assert_eq!(body, "healthy");
}

#[test]
fn test_invoke_success() {
    let addr = start_server(1024);
    let (status, json) = post_invoke(
        addr,
        r#"{"modulePath":"/srv/echo.so","typeName":"Echo.Service","methodName":"Echo","parameters":["hello"]}"#,
    );
    assert_eq!(status, 200);
    assert_eq!(json["result"], "hello");
    assert!(json["timestamp"].as_str().unwrap().contains('T'));
}

#[test]
fn test_invoke_failures_map_to_statuses() {
    let addr = start_server(1024);
    let cases = [
        (r#"{"modulePath":"/srv/missing.so","typeName":"T","methodName":"M"}"#, 422, "ModuleLoadError"),
        (r#"{"modulePath":"/srv/echo.so","typeName":"Nope","methodName":"Echo"}"#, 404, "TypeNotFound"),
        (r#"{"modulePath":"/srv/echo.so","typeName":"Echo.Service","methodName":"Hidden"}"#, 403, "MethodNotInvocable"),
        (r#"{"modulePath":"/srv/echo.so","typeName":"Echo.Service","methodName":"Echo"}"#, 400, "ParameterCountMismatch"),
        (r#"{"modulePath":"/srv/echo.so","typeName":"Echo.Service","methodName":"Fail"}"#, 500, "TargetInvocationError"),
    ];

    for (body, expected_status, expected_kind) in cases {
        let (status, json) = post_invoke(addr, body);
        assert_eq!(status, expected_status, "{}", body);
        assert_eq!(json["error"]["kind"], expected_kind, "{}", body);
        assert!(!json["error"]["message"].as_str().unwrap().is_empty());
        assert!(json.get("timestamp").is_none());
    }
}

#[test]
fn test_failure_envelope_names_the_request() {
    let addr = start_server(1024);
    let (status, json) = post_invoke(
        addr,
        r#"{"modulePath":"/srv/echo.so","typeName":"Echo.Service","methodName":"Echo","parameters":["a","b"]}"#,
    );
    assert_eq!(status, 400);

    let error = &json["error"];
    assert_eq!(error["kind"], "ParameterCountMismatch");
    assert_eq!(error["modulePath"], "/srv/echo.so");
    assert_eq!(error["typeName"], "Echo.Service");
    assert_eq!(error["methodName"], "Echo");

    let message = error["message"].as_str().unwrap();
    assert!(message.contains("/srv/echo.so"));
    assert!(message.contains("Echo.Service"));
    assert!(message.contains("expected 1, provided 2"));
}

#[test]
fn test_malformed_body() {
    let addr = start_server(1024);
    let (status, json) = post_invoke(addr, r#"{"modulePath":"/srv/echo.so""#);
    assert_eq!(status, 400);
    assert!(json["error"]["message"]
        .as_str()
        .unwrap()
        .contains("malformed request body"));
}

#[test]
fn test_body_limit() {
    let addr = start_server(64);
    // Rejected on the declared length, before any body bytes are read
    let (status, body) = send(addr, "POST /invoke HTTP/1.1\r\nContent-Length: 4096\r\n\r\n");
    assert_eq!(status, 413);
    assert!(body.contains("64 bytes"));
}

#[test]
fn test_describe() {
    let addr = start_server(1024);
    let (status, body) = send(
        addr,
        "GET /describe?module=%2Fsrv%2Fecho.so HTTP/1.1\r\nHost: localhost\r\n\r\n",
    );
    assert_eq!(status, 200);

    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["modulePath"], "/srv/echo.so");
    assert_eq!(json["types"][0]["name"], "Echo.Service");
    assert_eq!(json["types"][0]["methods"][0]["name"], "Echo");
    assert_eq!(json["types"][0]["methods"][0]["static"], true);
}
