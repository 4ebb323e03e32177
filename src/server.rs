//! HTTP Transport
//!
//! A minimal HTTP/1.1 server in front of the [`Gateway`]. Each connection is
//! served on its own OS thread and closed after one response.
//!
//! Endpoints:
//! - POST /invoke                  - Run an invocation request (JSON body)
//! - GET  /describe?module=<path>  - List a module's types and methods
//! - GET  /health                  - Liveness check

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::gateway::{ErrorBody, ErrorKind, Gateway, InvocationRequest};

/// HTTP status for each failure kind
pub fn status_for(kind: ErrorKind) -> u16 {
    match kind {
        ErrorKind::ParameterCountMismatch | ErrorKind::ParameterConversionError => 400,
        ErrorKind::MethodNotInvocable => 403,
        ErrorKind::TypeNotFound | ErrorKind::MethodNotFound => 404,
        ErrorKind::ModuleLoadError => 422,
        ErrorKind::ReceiverConstructionError | ErrorKind::TargetInvocationError => 500,
    }
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        422 => "Unprocessable Entity",
        431 => "Request Header Fields Too Large",
        _ => "Internal Server Error",
    }
}

/// A response ready to be written to the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl Response {
    fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "text/plain",
            body: body.into(),
        }
    }

    fn json<T: Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_string(value) {
            Ok(body) => Self {
                status,
                content_type: "application/json",
                body,
            },
            Err(e) => Self::text(500, format!("failed to encode response: {}", e)),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::json(400, &json!({ "error": { "message": message.into() } }))
    }

    fn write_to(&self, stream: &mut impl Write) -> io::Result<()> {
        let head = format!(
            "HTTP/1.1 {} {}\r\n\
             Content-Type: {}\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\
             \r\n",
            self.status,
            status_text(self.status),
            self.content_type,
            self.body.len(),
        );
        stream.write_all(head.as_bytes())?;
        stream.write_all(self.body.as_bytes())?;
        stream.flush()
    }
}

/// Route one parsed request
pub fn route(gateway: &Gateway, method: &str, target: &str, body: &[u8]) -> Response {
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (target, None),
    };

    match (method, path) {
        ("POST", "/invoke") => handle_invoke(gateway, body),
        ("GET", "/describe") => handle_describe(gateway, query),
        ("GET", "/health") => Response::text(200, "healthy"),
        (_, "/invoke") | (_, "/describe") | (_, "/health") => {
            Response::text(405, "Method not allowed")
        }
        _ => Response::text(404, "Endpoint not found"),
    }
}

fn handle_invoke(gateway: &Gateway, body: &[u8]) -> Response {
    let request: InvocationRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(e) => return Response::bad_request(format!("malformed request body: {}", e)),
    };

    match gateway.invoke(&request) {
        Ok(response) => Response::json(200, &response),
        Err(err) => Response::json(
            status_for(err.kind()),
            &json!({ "error": ErrorBody::from(&err) }),
        ),
    }
}

fn handle_describe(gateway: &Gateway, query: Option<&str>) -> Response {
    let module = query
        .into_iter()
        .flat_map(|q| q.split('&'))
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "module")
        .map(|(_, value)| percent_decode(value));

    let module = match module {
        Some(Ok(module)) if !module.is_empty() => module,
        Some(Err(e)) => return Response::bad_request(e),
        _ => return Response::bad_request("missing 'module' query parameter"),
    };

    match gateway.describe(&module) {
        Ok(description) => Response::json(200, &description),
        Err(err) => Response::json(
            status_for(err.kind()),
            &json!({ "error": ErrorBody::from(&err) }),
        ),
    }
}

/// Decode `%XX` escapes and `+` in a query component
fn percent_decode(raw: &str) -> Result<String, String> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes
                    .get(i + 1..i + 3)
                    .and_then(|h| std::str::from_utf8(h).ok())
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or_else(|| format!("invalid escape in '{}'", raw))?;
                out.push(hex);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).map_err(|_| format!("'{}' is not valid UTF-8", raw))
}

/// The transport: a listener plus the gateway it fronts
#[derive(Debug, Clone)]
pub struct Server {
    gateway: Gateway,
    config: ServerConfig,
}

impl Server {
    pub fn new(gateway: Gateway, config: ServerConfig) -> Self {
        Self { gateway, config }
    }

    /// Bind the configured address and serve forever
    pub fn serve(self) -> io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind)?;
        self.run(listener)
    }

    /// Serve connections from an already-bound listener
    pub fn run(self, listener: TcpListener) -> io::Result<()> {
        info!(addr = %listener.local_addr()?, "listening");

        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let server = self.clone();
                    thread::spawn(move || {
                        if let Err(e) = server.handle_connection(stream) {
                            debug!(error = %e, "connection closed with error");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "connection error"),
            }
        }
        Ok(())
    }

    fn handle_connection(&self, mut stream: TcpStream) -> io::Result<()> {
        stream.set_read_timeout(self.config.read_timeout())?;
        let response = match read_request(&stream, self.config.max_body_bytes) {
            Ok((method, target, body)) => {
                debug!(%method, %target, bytes = body.len(), "request");
                route(&self.gateway, &method, &target, &body)
            }
            Err(response) => response,
        };
        response.write_to(&mut stream)
    }
}

/// Largest accepted request line plus headers
pub const MAX_HEAD_BYTES: usize = 16 * 1024;

/// Read one line of the request head, charging it against `budget`
fn read_head_line(
    reader: &mut impl BufRead,
    budget: &mut usize,
    line: &mut String,
) -> Result<usize, Response> {
    if *budget == 0 {
        return Err(head_too_large());
    }
    let read = reader
        .by_ref()
        .take(*budget as u64)
        .read_line(line)
        .map_err(|e| Response::bad_request(format!("cannot read request head: {}", e)))?;
    *budget -= read;
    if *budget == 0 && !line.ends_with('\n') {
        return Err(head_too_large());
    }
    Ok(read)
}

fn head_too_large() -> Response {
    Response::text(431, format!("request head exceeds {} bytes", MAX_HEAD_BYTES))
}

/// Read the request line, headers and body.
///
/// Failures come back as the response to send.
fn read_request(
    stream: impl Read,
    max_body_bytes: usize,
) -> Result<(String, String, Vec<u8>), Response> {
    let mut reader = BufReader::new(stream);
    let mut budget = MAX_HEAD_BYTES;

    let mut request_line = String::new();
    read_head_line(&mut reader, &mut budget, &mut request_line)?;

    let mut parts = request_line.split_whitespace();
    let (method, target) = match (parts.next(), parts.next()) {
        (Some(method), Some(target)) => (method.to_string(), target.to_string()),
        _ => return Err(Response::bad_request("invalid request line")),
    };

    let mut content_length: usize = 0;
    loop {
        let mut header = String::new();
        let read = read_head_line(&mut reader, &mut budget, &mut header)?;
        let header = header.trim();
        if read == 0 || header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = value
                    .trim()
                    .parse()
                    .map_err(|_| Response::bad_request("invalid Content-Length"))?;
            }
        }
    }

    if content_length > max_body_bytes {
        return Err(Response::text(
            413,
            format!("request body exceeds {} bytes", max_body_bytes),
        ));
    }

    let mut body = vec![0u8; content_length];
    reader
        .read_exact(&mut body)
        .map_err(|e| Response::bad_request(format!("truncated request body: {}", e)))?;

    Ok((method, target, body))
}
