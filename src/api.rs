// CLASSIFICATION: COMMUNITY
// Filename: api.rs v1.3
// Author: Lukas Bower
// Date Modified: 2026-08-21

//! HTTP surface of the broker.
//!
//! Thread-per-request on `tiny_http`. Requests naming a remote descriptor
//! are proxied transparently to the peer broker; everything else drives
//! the local compile pipeline and shapes the response by the client's
//! Accept header (JSON, plain text with banners, or the raw object file).

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use serde::Deserialize;
use thiserror::Error;
use tiny_http::{Header, Method, Request, Response, Server};

use crate::compile::{self, CompileEnv, CompileError};
use crate::config::{split_options, Config};
use crate::registry::CompilerPool;
use crate::types::{BackendOptions, CompileRequest, CompileResult, FilterSet};

const WORKER_THREADS: usize = 8;
/// Upper bound on a proxied peer response body.
const PROXY_RESPONSE_CAP: u64 = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unknown compiler {0:?}")]
    UnknownCompiler(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("request body exceeds limit")]
    BodyTooLarge,
    #[error("peer broker unreachable: {0}")]
    PeerUnreachable(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn status(&self) -> u16 {
        match self {
            ApiError::UnknownCompiler(_) => 404,
            ApiError::BadRequest(_) => 400,
            ApiError::BodyTooLarge => 413,
            ApiError::PeerUnreachable(_) => 502,
            ApiError::Internal(_) => 500,
        }
    }
}

impl From<CompileError> for ApiError {
    fn from(err: CompileError) -> Self {
        match err {
            CompileError::BadRequest(msg) => ApiError::BadRequest(msg),
            CompileError::Internal(err) => ApiError::Internal(err),
        }
    }
}

/// Shared server state threaded through every handler.
pub struct Broker {
    pub cfg: Arc<Config>,
    pub env: CompileEnv,
    pub pool: Arc<CompilerPool>,
}

/// Bind and serve forever. A bind failure is fatal to the caller.
pub fn serve(broker: Arc<Broker>, host: &str, port: u16) -> Result<()> {
    let addr = format!("{host}:{port}");
    let server =
        Server::http(&addr).map_err(|err| anyhow!("cannot bind http server on {addr}: {err}"))?;
    info!("listening on http://{addr}");
    let server = Arc::new(server);
    let mut workers = Vec::new();
    for _ in 0..WORKER_THREADS {
        let server = Arc::clone(&server);
        let broker = Arc::clone(&broker);
        workers.push(std::thread::spawn(move || loop {
            match server.recv() {
                Ok(request) => dispatch(&broker, request),
                Err(err) => {
                    error!("http accept failed: {err}");
                    break;
                }
            }
        }));
    }
    for worker in workers {
        let _ = worker.join();
    }
    Ok(())
}

fn dispatch(broker: &Broker, mut request: Request) {
    let method = request.method().clone();
    let url = request.url().to_string();
    let (path, query) = match url.split_once('?') {
        Some((p, q)) => (p.to_string(), q.to_string()),
        None => (url.clone(), String::new()),
    };
    debug!("{method} {path}");

    let outcome = route(broker, &mut request, &method, &path, &query);
    let response = match outcome {
        Ok(response) => response,
        Err(err) => {
            warn!("{method} {path} -> {}: {err}", err.status());
            Response::from_string(format!("{err}\n"))
                .with_status_code(err.status())
                .boxed()
        }
    };
    if let Err(err) = request.respond(response) {
        debug!("client went away: {err}");
    }
}

type BoxedResponse = Response<Box<dyn Read + Send>>;

fn route(
    broker: &Broker,
    request: &mut Request,
    method: &Method,
    path: &str,
    query: &str,
) -> Result<BoxedResponse, ApiError> {
    match (method, path) {
        (Method::Get, "/healthcheck") => Ok(Response::from_string("OK\n").boxed()),
        (Method::Get, "/api/compilers") => Ok(list_compilers(broker, request)),
        (Method::Get, "/client-options.json") => Ok(json_response(
            broker.pool.client_options().as_str().to_string(),
        )),
        (Method::Get, _) if path.starts_with("/api/asm/") => {
            Ok(asm_docs(path.trim_start_matches("/api/asm/")))
        }
        (Method::Post, "/compile") => legacy_compile(broker, request),
        (Method::Post, _) if path.starts_with("/api/compiler/") => {
            let rest = path.trim_start_matches("/api/compiler/");
            let Some((id, "compile")) = rest.split_once('/') else {
                return Err(ApiError::BadRequest(format!("bad compile path {path:?}")));
            };
            compile_endpoint(broker, request, id, path, query)
        }
        _ => Err(ApiError::BadRequest(format!("no route for {method} {path}"))),
    }
}

/// `GET /api/compilers`, JSON by default, `id | name` columns for text.
fn list_compilers(broker: &Broker, request: &Request) -> BoxedResponse {
    let set = broker.pool.snapshot();
    if accepts(request, "text/plain") {
        let width = set.iter().map(|d| d.id.len()).max().unwrap_or(0);
        let mut body = String::new();
        for desc in set.iter() {
            body.push_str(&format!("{:width$} | {}\n", desc.id, desc.name));
        }
        return Response::from_string(body).boxed();
    }
    let public: Vec<&crate::types::CompilerDescriptor> =
        set.iter().map(|d| d.as_ref()).collect();
    json_response(serde_json::to_string(&public).unwrap_or_else(|_| "[]".into()))
}

/// JSON envelope shared by `/compile` and the JSON form of the compile
/// endpoint.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct CompileEnvelope {
    source: String,
    compiler: Option<String>,
    options: EnvelopeOptions,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct EnvelopeOptions {
    user_arguments: String,
    compiler_options: BackendOptions,
    filters: FilterSet,
}

impl CompileEnvelope {
    fn into_request(self) -> CompileRequest {
        CompileRequest {
            source: self.source,
            user_options: split_options(&self.options.user_arguments),
            backend: self.options.compiler_options,
            filters: self.options.filters,
        }
    }
}

/// `POST /compile` with the compiler id inside the envelope.
fn legacy_compile(broker: &Broker, request: &mut Request) -> Result<BoxedResponse, ApiError> {
    let headers = collect_headers(request);
    let body = read_body(broker, request)?;
    let envelope: CompileEnvelope = serde_json::from_slice(&body)
        .map_err(|err| ApiError::BadRequest(format!("bad compile envelope: {err}")))?;
    let id = envelope
        .compiler
        .clone()
        .ok_or_else(|| ApiError::BadRequest("envelope missing compiler id".into()))?;
    let desc = broker
        .pool
        .find(&id)
        .ok_or_else(|| ApiError::UnknownCompiler(id.clone()))?;
    if desc.is_remote() {
        return proxy(
            broker,
            &desc,
            request.method(),
            "/compile",
            "",
            &body,
            &headers,
        );
    }
    let result = compile::compile(&broker.env, &desc, &envelope.into_request())?;
    Ok(json_response(
        serde_json::to_string(&result).unwrap_or_else(|_| "{}".into()),
    ))
}

fn compile_endpoint(
    broker: &Broker,
    request: &mut Request,
    id: &str,
    path: &str,
    query: &str,
) -> Result<BoxedResponse, ApiError> {
    let desc = broker
        .pool
        .find(id)
        .ok_or_else(|| ApiError::UnknownCompiler(id.to_string()))?;
    let headers = collect_headers(request);
    let body = read_body(broker, request)?;
    if desc.is_remote() {
        return proxy(broker, &desc, request.method(), path, query, &body, &headers);
    }

    let req = if is_json(request) {
        serde_json::from_slice::<CompileEnvelope>(&body)
            .map_err(|err| ApiError::BadRequest(format!("bad compile envelope: {err}")))?
            .into_request()
    } else {
        text_request(&body, query)?
    };

    let result = compile::compile(&broker.env, &desc, &req)?;
    shape_result(broker, request, &req, &result)
}

/// The text form: body is the bare source, knobs arrive as query flags.
fn text_request(body: &[u8], query: &str) -> Result<CompileRequest, ApiError> {
    let source = String::from_utf8(body.to_vec())
        .map_err(|_| ApiError::BadRequest("source is not valid UTF-8".into()))?;
    let params = parse_query(query);
    // Text clients get the tidy defaults unless they say otherwise.
    let mut filters = FilterSet {
        labels: true,
        directives: true,
        comment_only: true,
        ..Default::default()
    };
    let mut user_options = Vec::new();
    for (key, value) in &params {
        match key.as_str() {
            "options" => user_options = split_options(value),
            "filters" => {
                filters = FilterSet::default();
                for name in value.split(',').filter(|n| !n.is_empty()) {
                    filters.set(name, true);
                }
            }
            "addFilters" => {
                for name in value.split(',').filter(|n| !n.is_empty()) {
                    filters.set(name, true);
                }
            }
            "removeFilters" => {
                for name in value.split(',').filter(|n| !n.is_empty()) {
                    filters.set(name, false);
                }
            }
            _ => {}
        }
    }
    Ok(CompileRequest {
        source,
        user_options,
        backend: BackendOptions::default(),
        filters,
    })
}

/// Content negotiation for a finished compile.
fn shape_result(
    broker: &Broker,
    request: &Request,
    req: &CompileRequest,
    result: &CompileResult,
) -> Result<BoxedResponse, ApiError> {
    if wants_binary(request) && req.filters.binary {
        let Some(path) = &result.output_file_path else {
            return Err(ApiError::BadRequest(
                "no output file was produced".into(),
            ));
        };
        let bytes = std::fs::read(path)
            .map_err(|err| ApiError::Internal(anyhow!("read output file: {err}")))?;
        return Ok(Response::from_data(bytes)
            .with_header(header("Content-Type", "application/octet-stream"))
            .boxed());
    }
    if accepts(request, "text/plain") {
        return Ok(Response::from_string(text_banner(result)).boxed());
    }
    Ok(json_response(
        serde_json::to_string(result).unwrap_or_else(|_| "{}".into()),
    ))
}

fn text_banner(result: &CompileResult) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "# Compilation provided by asmbroker on {}\n",
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".into())
    ));
    for line in &result.asm {
        out.push_str(&line.text);
        out.push('\n');
    }
    match (result.status, result.signal) {
        (_, Some(signal)) => out.push_str(&format!("# Compiler terminated by signal {signal}\n")),
        (Some(code), None) => out.push_str(&format!("# Compiler exited with result code {code}\n")),
        (None, None) => out.push_str("# Compiler exit status unknown\n"),
    }
    if !result.stdout.is_empty() {
        out.push_str("Standard out:\n");
        for line in &result.stdout {
            out.push_str(&line.text);
            out.push('\n');
        }
    }
    if !result.stderr.is_empty() {
        out.push_str("Standard error:\n");
        for line in &result.stderr {
            out.push_str(&line.text);
            out.push('\n');
        }
    }
    out
}

/// Forward the request unchanged to the peer that owns the descriptor.
fn proxy(
    broker: &Broker,
    desc: &crate::types::CompilerDescriptor,
    method: &Method,
    path: &str,
    query: &str,
    body: &[u8],
    headers: &[(String, String)],
) -> Result<BoxedResponse, ApiError> {
    let remote = desc
        .remote
        .as_ref()
        .ok_or_else(|| ApiError::Internal(anyhow!("proxy without remote endpoint")))?;
    let url = if query.is_empty() {
        format!("{remote}{path}")
    } else {
        format!("{remote}{path}?{query}")
    };
    debug!("proxying to {url}");
    let mut peer_req = ureq::request(method.as_str(), &url)
        .timeout(Duration::from_millis(broker.cfg.proxy_timeout_ms));
    for (name, value) in headers {
        let lowered = name.to_ascii_lowercase();
        if lowered == "host" || lowered == "content-length" || lowered == "connection" {
            continue;
        }
        peer_req = peer_req.set(name, value);
    }
    let outcome = peer_req.send_bytes(body);
    let peer_resp = match outcome {
        Ok(resp) => resp,
        Err(ureq::Error::Status(_, resp)) => resp,
        Err(ureq::Error::Transport(err)) => {
            return Err(ApiError::PeerUnreachable(err.to_string()));
        }
    };
    let status = peer_resp.status();
    let content_type = peer_resp.content_type().to_string();
    let mut bytes = Vec::new();
    peer_resp
        .into_reader()
        .take(PROXY_RESPONSE_CAP)
        .read_to_end(&mut bytes)
        .map_err(|err| ApiError::PeerUnreachable(err.to_string()))?;
    // The content type is peer-supplied; bytes tiny_http rejects must not
    // take down the worker thread.
    let content_type = Header::from_bytes("Content-Type".as_bytes(), content_type.as_bytes())
        .unwrap_or_else(|_| {
            warn!("peer sent unusable content type {content_type:?}");
            header("Content-Type", "application/octet-stream")
        });
    Ok(Response::from_data(bytes)
        .with_status_code(status)
        .with_header(content_type)
        .boxed())
}

/// Tiny static opcode reference for `GET /api/asm/{opcode}`.
fn asm_docs(opcode: &str) -> BoxedResponse {
    let tooltip = match opcode.to_ascii_lowercase().as_str() {
        "mov" => Some("Copies the source operand to the destination operand."),
        "add" => Some("Adds the source operand to the destination operand."),
        "sub" => Some("Subtracts the source operand from the destination operand."),
        "imul" => Some("Signed multiply."),
        "lea" => Some("Computes an effective address without touching memory."),
        "call" => Some("Pushes the return address and jumps to the target."),
        "ret" => Some("Pops the return address and jumps to it."),
        "jmp" => Some("Unconditional jump."),
        "cmp" => Some("Subtracts operands, sets flags, discards the result."),
        "test" => Some("Bitwise AND of operands, sets flags, discards the result."),
        "xor" => Some("Bitwise exclusive or."),
        "push" => Some("Decrements the stack pointer and stores the operand."),
        "pop" => Some("Loads the operand from the stack and increments the pointer."),
        _ => None,
    };
    match tooltip {
        Some(text) => json_response(
            serde_json::json!({"opcode": opcode.to_ascii_uppercase(), "tooltip": text})
                .to_string(),
        ),
        None => Response::from_string(format!("unknown opcode {opcode:?}\n"))
            .with_status_code(404)
            .boxed(),
    }
}

fn collect_headers(request: &Request) -> Vec<(String, String)> {
    request
        .headers()
        .iter()
        .map(|h| (h.field.as_str().to_string(), h.value.to_string()))
        .collect()
}

fn read_body(broker: &Broker, request: &mut Request) -> Result<Vec<u8>, ApiError> {
    let limit = broker.cfg.body_parser_limit;
    let mut body = Vec::new();
    request
        .as_reader()
        .take(limit as u64 + 1)
        .read_to_end(&mut body)
        .map_err(|err| ApiError::Internal(anyhow!("read request body: {err}")))?;
    if body.len() > limit {
        return Err(ApiError::BodyTooLarge);
    }
    Ok(body)
}

fn accepts(request: &Request, needle: &str) -> bool {
    request
        .headers()
        .iter()
        .find(|h| h.field.equiv("Accept"))
        .map(|h| h.value.as_str().contains(needle))
        .unwrap_or(false)
}

fn wants_binary(request: &Request) -> bool {
    // The last token is the bare `binary` media type some download
    // clients send.
    const BINARY_TYPES: [&str; 5] = [
        "application/octet-stream",
        "application/x-object",
        "application/x-executable",
        "application/x-sharedlib",
        "binary",
    ];
    request
        .headers()
        .iter()
        .find(|h| h.field.equiv("Accept"))
        .map(|h| {
            let accept = h.value.as_str();
            BINARY_TYPES.iter().any(|t| accept.contains(t))
        })
        .unwrap_or(false)
}

fn is_json(request: &Request) -> bool {
    request
        .headers()
        .iter()
        .find(|h| h.field.equiv("Content-Type"))
        .map(|h| h.value.as_str().contains("application/json"))
        .unwrap_or(false)
}

fn json_response(body: String) -> BoxedResponse {
    Response::from_string(body)
        .with_header(header("Content-Type", "application/json"))
        .boxed()
}

fn header(name: &str, value: &str) -> Header {
    Header::from_bytes(name.as_bytes(), value.as_bytes()).expect("static header")
}

/// Percent-decode enough of the query string for option flags.
fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (percent_decode(k), percent_decode(v)),
            None => (percent_decode(pair), String::new()),
        })
        .collect()
}

fn percent_decode(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        match bytes[idx] {
            b'%' if idx + 2 < bytes.len() => {
                let hex = &text[idx + 1..idx + 3];
                match u8::from_str_radix(hex, 16) {
                    Ok(byte) => {
                        out.push(byte);
                        idx += 3;
                    }
                    Err(_) => {
                        out.push(b'%');
                        idx += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                idx += 1;
            }
            byte => {
                out.push(byte);
                idx += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
