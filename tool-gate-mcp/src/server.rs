// tool-gate-mcp/src/server.rs
// ============================================================================
// Module: JSON-RPC Server
// Description: JSON-RPC 2.0 over HTTP POST /mcp and newline-delimited stdio.
// Purpose: Expose the decision pipeline to agents on both transports.
// Dependencies: axum, tokio, tool-gate-core
// ============================================================================

//! ## Overview
//! Both transports funnel into one dispatcher: `initialize`, `tools/list`,
//! `tools/call`, and (stdio only) `shutdown`. HTTP callers authenticate with
//! a bearer token; the stdio transport acts for the local operator under a
//! fixed `local/stdio-client` principal, with policy still applied. Policy
//! denies and pending approvals are `result` payloads with `isError: true`,
//! not JSON-RPC errors; the error object is reserved for protocol and
//! infrastructure failures. Replies go to stdout, logs to stderr.
//! Security posture: every request body is untrusted input.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::http::header::AUTHORIZATION;
use axum::response::IntoResponse;
use axum::routing::post;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use thiserror::Error;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;

use crate::admin;
use crate::gateway::McpGateway;
use crate::identity::Principal;
use crate::metrics;
use crate::tools::ToolExecError;
use tool_gate_config::ServerTransport;
use tool_gate_core::GateReply;
use tool_gate_core::ToolCall;
use tool_gate_core::ToolName;
use tool_gate_core::runtime::PipelineError;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// MCP protocol version answered by `initialize`.
pub const PROTOCOL_VERSION: &str = "2025-06-18";

/// JSON-RPC error codes used by the gateway.
pub mod codes {
    /// Request body was not valid JSON.
    pub const PARSE_ERROR: i64 = -32700;
    /// Envelope was not a valid JSON-RPC 2.0 request.
    pub const INVALID_REQUEST: i64 = -32600;
    /// Unknown method.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Parameters malformed or naming an unknown tool.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Unexpected server failure.
    pub const INTERNAL_ERROR: i64 = -32603;
    /// Bearer token missing or invalid.
    pub const UNAUTHORIZED: i64 = -32001;
    /// Caller authenticated but lacks a required role.
    pub const FORBIDDEN: i64 = -32003;
    /// Coordinating or audit store unreachable; request failed closed.
    pub const STORE_UNAVAILABLE: i64 = -32012;
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Transport-level server failures.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Bind address unusable.
    #[error("server bind failed: {0}")]
    Bind(String),
    /// HTTP serve loop failed.
    #[error("http server failed: {0}")]
    Http(String),
    /// Stdio transport failed.
    #[error("stdio transport failed: {0}")]
    Stdio(String),
}

// ============================================================================
// SECTION: JSON-RPC Envelope
// ============================================================================

/// Incoming JSON-RPC request payload.
#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    /// Protocol version; must be "2.0".
    jsonrpc: String,
    /// Request identifier echoed in the reply.
    #[serde(default)]
    id: Value,
    /// Method name.
    method: String,
    /// Optional parameters.
    params: Option<Value>,
}

/// JSON-RPC response envelope.
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    /// Protocol version literal.
    jsonrpc: &'static str,
    /// Request identifier.
    id: Value,
    /// Success payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    /// Failure payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Builds a success reply.
    fn result(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Builds an error reply.
    fn error(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
            }),
        }
    }

    /// Returns the error code, when this is an error reply.
    #[must_use]
    pub fn error_code(&self) -> Option<i64> {
        self.error.as_ref().map(|error| error.code)
    }

    /// Returns the result payload, when this is a success reply.
    #[must_use]
    pub fn result_value(&self) -> Option<&Value> {
        self.result.as_ref()
    }
}

/// JSON-RPC error payload.
#[derive(Debug, Serialize)]
struct JsonRpcError {
    /// Error code.
    code: i64,
    /// Human-readable message.
    message: String,
}

/// `tools/call` parameters.
#[derive(Debug, Deserialize)]
struct ToolCallParams {
    /// Tool name.
    name: String,
    /// Raw arguments.
    #[serde(default)]
    arguments: Value,
}

// ============================================================================
// SECTION: Caller Identity
// ============================================================================

/// Where a request came from, for identity resolution.
enum CallerSource {
    /// HTTP with an optional Authorization header.
    Http {
        /// Raw header value.
        auth_header: Option<String>,
    },
    /// The local stdio operator.
    Stdio,
}

/// Resolves the caller's principal for the transport.
async fn resolve_principal(
    gateway: &McpGateway,
    source: &CallerSource,
) -> Result<Principal, JsonRpcError> {
    match source {
        CallerSource::Http { auth_header } => gateway
            .identity
            .verify_bearer(auth_header.as_deref())
            .await
            .map_err(|err| JsonRpcError {
                code: codes::UNAUTHORIZED,
                message: err.to_string(),
            }),
        CallerSource::Stdio => Ok(Principal {
            tenant: "local".into(),
            subject: "stdio-client".into(),
            roles: Default::default(),
        }),
    }
}

// ============================================================================
// SECTION: Dispatch
// ============================================================================

/// Outcome of dispatching one line/body: the reply, plus a shutdown flag for
/// the stdio loop.
struct Dispatch {
    /// Reply to serialize.
    response: JsonRpcResponse,
    /// True when the client requested `shutdown` on stdio.
    shutdown: bool,
}

/// Parses and dispatches one raw JSON-RPC payload.
async fn dispatch(gateway: &McpGateway, source: &CallerSource, raw: &[u8]) -> Dispatch {
    if raw.len() > gateway.config.server.max_body_bytes {
        return Dispatch {
            response: JsonRpcResponse::error(
                Value::Null,
                codes::INVALID_REQUEST,
                "request body too large",
            ),
            shutdown: false,
        };
    }
    let request: JsonRpcRequest = match serde_json::from_slice(raw) {
        Ok(request) => request,
        Err(_) => {
            return Dispatch {
                response: JsonRpcResponse::error(Value::Null, codes::PARSE_ERROR, "parse error"),
                shutdown: false,
            };
        }
    };
    if request.jsonrpc != "2.0" {
        return Dispatch {
            response: JsonRpcResponse::error(
                request.id,
                codes::INVALID_REQUEST,
                "invalid json-rpc version",
            ),
            shutdown: false,
        };
    }
    let id = request.id.clone();
    match request.method.as_str() {
        "initialize" => Dispatch {
            response: JsonRpcResponse::result(
                id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {"tools": {"listChanged": true}},
                    "serverInfo": {
                        "name": "tool-gate",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
            ),
            shutdown: false,
        },
        "tools/list" => Dispatch {
            response: handle_tools_list(gateway, source, id).await,
            shutdown: false,
        },
        "tools/call" => Dispatch {
            response: handle_tools_call(gateway, source, id, request.params).await,
            shutdown: false,
        },
        "shutdown" if matches!(source, CallerSource::Stdio) => Dispatch {
            response: JsonRpcResponse::result(id, json!({"ok": true})),
            shutdown: true,
        },
        other => Dispatch {
            response: JsonRpcResponse::error(
                id,
                codes::METHOD_NOT_FOUND,
                format!("method not found: {other}"),
            ),
            shutdown: false,
        },
    }
}

/// Handles `tools/list`.
async fn handle_tools_list(
    gateway: &McpGateway,
    source: &CallerSource,
    id: Value,
) -> JsonRpcResponse {
    if let Err(error) = resolve_principal(gateway, source).await {
        return JsonRpcResponse::error(id, error.code, error.message);
    }
    JsonRpcResponse::result(
        id,
        json!({"tools": gateway.tools.list(), "nextCursor": Value::Null}),
    )
}

/// Handles `tools/call`: authenticate, decide, map the reply.
async fn handle_tools_call(
    gateway: &McpGateway,
    source: &CallerSource,
    id: Value,
    params: Option<Value>,
) -> JsonRpcResponse {
    let principal = match resolve_principal(gateway, source).await {
        Ok(principal) => principal,
        Err(error) => return JsonRpcResponse::error(id, error.code, error.message),
    };
    let params: ToolCallParams = match serde_json::from_value(params.unwrap_or(Value::Null)) {
        Ok(params) => params,
        Err(_) => {
            return JsonRpcResponse::error(id, codes::INVALID_PARAMS, "invalid tool params");
        }
    };
    let tool = ToolName::new(params.name.clone());
    if !gateway.tools.contains(&tool) {
        return JsonRpcResponse::error(
            id,
            codes::INVALID_PARAMS,
            format!("unknown tool: {}", params.name),
        );
    }
    let call = ToolCall::new(
        principal.tenant.clone(),
        principal.subject.clone(),
        tool.clone(),
        params.arguments,
        id.to_string().as_str(),
    );
    let reply = match gateway.pipeline.decide(&call).await {
        Ok(reply) => reply,
        Err(PipelineError::Audit(err)) => {
            tracing::error!(error = %err, "audit append failed; failing request closed");
            return JsonRpcResponse::error(
                id,
                codes::STORE_UNAVAILABLE,
                "audit store unavailable",
            );
        }
    };
    match reply {
        GateReply::Allow { rule, audit_id } => {
            metrics::record_decision("allow");
            if tool.as_str() == "cloud.estimate" {
                return estimate_reply(gateway, id, &call);
            }
            let meta = json!({
                "decision": "allow",
                "rule": rule.as_ref().map(|rule| rule.as_str().to_string()),
                "auditId": audit_id,
            });
            JsonRpcResponse::result(
                id,
                json!({
                    "content": [{"type": "text", "text": meta.to_string()}],
                    "structuredContent": meta,
                    "isError": false,
                }),
            )
        }
        GateReply::Deny { reason, rule, audit_id } => {
            metrics::record_decision("deny");
            JsonRpcResponse::result(
                id,
                json!({
                    "content": [{"type": "text", "text": format!("denied: {reason}")}],
                    "structuredContent": {
                        "decision": "deny",
                        "reason": reason,
                        "rule": rule.as_ref().map(|rule| rule.as_str().to_string()),
                        "auditId": audit_id,
                    },
                    "isError": true,
                }),
            )
        }
        GateReply::NeedsApproval { pending_id, audit_id } => {
            metrics::record_decision("approval");
            JsonRpcResponse::result(
                id,
                json!({
                    "decision": "approval",
                    "pendingId": pending_id.as_str(),
                    "content": [{
                        "type": "text",
                        "text": format!("approval required; pending_id={pending_id}"),
                    }],
                    "structuredContent": {
                        "decision": "approval",
                        "pendingId": pending_id.as_str(),
                        "auditId": audit_id,
                    },
                    "isError": true,
                }),
            )
        }
    }
}

/// Executes the estimator after an allow verdict.
fn estimate_reply(gateway: &McpGateway, id: Value, call: &ToolCall) -> JsonRpcResponse {
    match gateway.tools.estimate(&call.arguments) {
        Ok(estimate) => JsonRpcResponse::result(
            id,
            json!({
                "content": [{"type": "text", "text": estimate.to_string()}],
                "structuredContent": estimate,
                "isError": false,
            }),
        ),
        Err(err @ ToolExecError::InvalidArguments(_)) => {
            JsonRpcResponse::error(id, codes::INVALID_PARAMS, err.to_string())
        }
        Err(err @ ToolExecError::UnknownPrice { .. }) => JsonRpcResponse::result(
            id,
            json!({
                "content": [{"type": "text", "text": err.to_string()}],
                "isError": true,
            }),
        ),
    }
}

// ============================================================================
// SECTION: HTTP Transport
// ============================================================================

/// Serves the configured transport until the process exits.
///
/// # Errors
///
/// Returns [`ServerError`] when the transport fails.
pub async fn serve(gateway: McpGateway) -> Result<(), ServerError> {
    let transport = gateway.config.server.transport;
    let gateway = Arc::new(gateway);
    match transport {
        ServerTransport::Http => serve_http(gateway).await,
        ServerTransport::Stdio => serve_stdio(gateway).await,
    }
}

/// Builds the full HTTP router: /mcp plus the operator surface.
#[must_use]
pub fn router(gateway: Arc<McpGateway>) -> Router {
    Router::new()
        .route("/mcp", post(handle_mcp))
        .merge(admin::router())
        .with_state(gateway)
}

/// Serves JSON-RPC and the operator surface over HTTP.
async fn serve_http(gateway: Arc<McpGateway>) -> Result<(), ServerError> {
    let addr: SocketAddr = gateway
        .config
        .server
        .bind
        .parse()
        .map_err(|_| ServerError::Bind(format!("invalid bind '{}'", gateway.config.server.bind)))?;
    let app = router(gateway);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|err| ServerError::Bind(err.to_string()))?;
    tracing::info!(%addr, "tool-gate http transport listening");
    axum::serve(listener, app.into_make_service())
        .await
        .map_err(|err| ServerError::Http(err.to_string()))
}

/// Handles HTTP POST /mcp.
async fn handle_mcp(
    State(gateway): State<Arc<McpGateway>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let started_at = Instant::now();
    let auth_header =
        headers.get(AUTHORIZATION).and_then(|value| value.to_str().ok()).map(str::to_string);
    let source = CallerSource::Http { auth_header };
    let dispatch = dispatch(&gateway, &source, &body).await;
    let status = status_for(&dispatch.response);
    metrics::record_http_request("POST", "/mcp", status.as_u16());
    metrics::observe_latency("/mcp", started_at.elapsed().as_secs_f64());
    (status, axum::Json(dispatch.response))
}

/// Maps JSON-RPC errors onto HTTP status codes.
fn status_for(response: &JsonRpcResponse) -> StatusCode {
    match response.error_code() {
        None => StatusCode::OK,
        Some(codes::UNAUTHORIZED) => StatusCode::UNAUTHORIZED,
        Some(codes::FORBIDDEN) => StatusCode::FORBIDDEN,
        Some(codes::STORE_UNAVAILABLE) => StatusCode::SERVICE_UNAVAILABLE,
        Some(codes::METHOD_NOT_FOUND | codes::INVALID_PARAMS | codes::INVALID_REQUEST
            | codes::PARSE_ERROR) => StatusCode::BAD_REQUEST,
        Some(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ============================================================================
// SECTION: Stdio Transport
// ============================================================================

/// Serves newline-delimited JSON-RPC on stdin/stdout.
///
/// One task reads lines in order and fans each request out to the runtime's
/// worker pool, so a call parked in the approval wait window does not stall
/// the ones behind it. A single writer task serializes replies onto stdout
/// (ids pair replies with requests); logs go to stderr only. `shutdown`
/// flushes its reply and ends both loops.
async fn serve_stdio(gateway: Arc<McpGateway>) -> Result<(), ServerError> {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    let (reply_tx, mut reply_rx) = tokio::sync::mpsc::channel::<(Vec<u8>, bool)>(64);
    let mut writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some((payload, shutdown)) = reply_rx.recv().await {
            for chunk in [payload.as_slice(), b"\n"] {
                stdout
                    .write_all(chunk)
                    .await
                    .map_err(|err| ServerError::Stdio(err.to_string()))?;
            }
            stdout.flush().await.map_err(|err| ServerError::Stdio(err.to_string()))?;
            if shutdown {
                break;
            }
        }
        Ok::<(), ServerError>(())
    });
    tracing::info!("tool-gate stdio transport ready");
    loop {
        tokio::select! {
            // The writer ends after a shutdown reply; stop reading.
            result = &mut writer => {
                return result.map_err(|err| ServerError::Stdio(err.to_string()))?;
            }
            line = lines.next_line() => {
                let line = line.map_err(|err| ServerError::Stdio(err.to_string()))?;
                let Some(line) = line else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let gateway = Arc::clone(&gateway);
                let reply_tx = reply_tx.clone();
                tokio::spawn(async move {
                    let dispatch = dispatch(&gateway, &CallerSource::Stdio, line.as_bytes()).await;
                    let payload = serde_json::to_vec(&dispatch.response).unwrap_or_else(|_| {
                        br#"{"jsonrpc":"2.0","id":null,"error":{"code":-32603,"message":"serialization failed"}}"#
                            .to_vec()
                    });
                    let _ = reply_tx.send((payload, dispatch.shutdown)).await;
                });
            }
        }
    }
    // EOF: let in-flight replies drain, then stop the writer.
    drop(reply_tx);
    writer
        .await
        .map_err(|err| ServerError::Stdio(err.to_string()))?
}

// ============================================================================
// SECTION: Tests
// ============================================================================
