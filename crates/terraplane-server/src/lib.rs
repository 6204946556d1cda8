//! HTTP provisioning API for Terraplane.
//!
//! Routes, each served both at the root and under `/api/v1`:
//!
//! - `POST /provision` `{template, workspace, parameters}` → `202` with a
//!   `Location` header, `400` on bad input, `409` if the workspace is busy
//! - `GET  /provision` → all retained requests, newest first
//! - `GET  /provision/{id}` → status snapshot, `404` if unknown
//! - `POST /provision/{id}/cancel` → `{cancelled: bool}`
//! - `POST /workspaces/{id}/destroy` `{template?, parameters?}` → `202`
//! - `GET  /health`
//!
//! The [`TestServer`] helper starts a server on a random port for integration testing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use terraplane_core::{shutdown_requested, CoreError, DestroyInput, Orchestrator, ProvisionInput};
use terraplane_schema::{FailureKind, PlanSummary, ProvisionRequest, ProvisionState, RequestKind};
use thiserror::Error;
use tiny_http::{Header, Method, Response, Server, StatusCode};
use tracing::{debug, error, info, warn};

const API_PREFIX: &str = "/api/v1";
const MAX_BODY_BYTES: u64 = 1024 * 1024;
const ACCEPT_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {message}")]
    Bind { addr: String, message: String },
    #[error("server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse status reported to API clients.
pub fn api_status(state: ProvisionState) -> &'static str {
    match state {
        ProvisionState::Completed => "completed",
        ProvisionState::Destroyed => "destroyed",
        ProvisionState::Failed => "failed",
        _ => "in_progress",
    }
}

#[derive(Debug, Deserialize)]
struct ProvisionBody {
    template: Option<String>,
    workspace: Option<String>,
    #[serde(default)]
    parameters: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct DestroyBody {
    template: Option<String>,
    parameters: Option<BTreeMap<String, serde_json::Value>>,
}

#[derive(Debug, Serialize)]
struct Accepted<'a> {
    provision_id: &'a str,
    workspace: &'a str,
    kind: RequestKind,
    status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct FailureView<'a> {
    pub kind: FailureKind,
    pub message: &'a str,
    pub output: &'a str,
}

/// JSON shape of `GET /provision/{id}`.
#[derive(Debug, Serialize)]
pub struct StatusView<'a> {
    pub provision_id: &'a str,
    pub workspace: &'a str,
    pub kind: RequestKind,
    pub template: &'a str,
    pub status: &'static str,
    pub state: ProvisionState,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_summary: Option<PlanSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<&'a BTreeMap<String, serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureView<'a>>,
}

impl<'a> StatusView<'a> {
    pub fn new(req: &'a ProvisionRequest) -> Self {
        Self {
            provision_id: &req.provision_id,
            workspace: &req.workspace_id,
            kind: req.kind,
            template: &req.template,
            status: api_status(req.state),
            state: req.state,
            started_at: req.started_at,
            updated_at: req.updated_at,
            plan_summary: req.plan_summary,
            outputs: (req.state == ProvisionState::Completed).then_some(&req.outputs),
            failure: req.failure.as_ref().map(|f| FailureView {
                kind: f.kind,
                message: &f.message,
                output: &f.output,
            }),
        }
    }
}

/// Parameters are strings; scalar JSON values are accepted and stringified.
fn string_parameters(
    params: BTreeMap<String, serde_json::Value>,
) -> Result<BTreeMap<String, String>, String> {
    params
        .into_iter()
        .map(|(name, value)| match value {
            serde_json::Value::String(s) => Ok((name, s)),
            serde_json::Value::Number(n) => Ok((name, n.to_string())),
            serde_json::Value::Bool(b) => Ok((name, b.to_string())),
            _ => Err(format!("parameter '{name}' must be a string")),
        })
        .collect()
}

/// A routed request path, with any `/api/v1` prefix and query string removed.
#[derive(Debug, PartialEq, Eq)]
pub enum Route<'a> {
    Health,
    ProvisionCollection,
    Provision(&'a str),
    Cancel(&'a str),
    Destroy(&'a str),
}

pub fn parse_route(url: &str) -> Option<Route<'_>> {
    let path = url.split('?').next().unwrap_or(url);
    let path = match path.strip_prefix(API_PREFIX) {
        Some(rest) if rest.starts_with('/') => rest,
        _ => path,
    };
    let path = path.trim_end_matches('/');
    let segments: Vec<&str> = path.split('/').skip(1).collect();
    match segments.as_slice() {
        ["health"] => Some(Route::Health),
        ["provision"] => Some(Route::ProvisionCollection),
        ["provision", id] if !id.is_empty() => Some(Route::Provision(id)),
        ["provision", id, "cancel"] if !id.is_empty() => Some(Route::Cancel(id)),
        ["workspaces", id, "destroy"] if !id.is_empty() => Some(Route::Destroy(id)),
        _ => None,
    }
}

fn json_header() -> Header {
    Header::from_bytes("Content-Type", "application/json").expect("valid header")
}

fn respond_json(req: tiny_http::Request, code: u16, json: &impl Serialize) {
    let body = serde_json::to_vec(json).unwrap_or_else(|_| b"{}".to_vec());
    let _ = req.respond(
        Response::from_data(body)
            .with_status_code(StatusCode(code))
            .with_header(json_header()),
    );
}

fn respond_err(req: tiny_http::Request, code: u16, msg: &str) {
    respond_json(req, code, &serde_json::json!({ "error": msg }));
}

fn respond_core_err(req: tiny_http::Request, e: &CoreError) {
    let code = if e.is_retriable() {
        409
    } else if e.is_not_found() {
        404
    } else if e.is_invalid_input() {
        400
    } else {
        error!("request failed: {e}");
        500
    };
    respond_err(req, code, &e.to_string());
}

fn respond_accepted(req: tiny_http::Request, ticket: &terraplane_core::ProvisionTicket) {
    let body = serde_json::to_vec(&Accepted {
        provision_id: &ticket.provision_id,
        workspace: &ticket.workspace_id,
        kind: ticket.kind,
        status: "in_progress",
    })
    .unwrap_or_else(|_| b"{}".to_vec());
    let mut response = Response::from_data(body)
        .with_status_code(StatusCode(202))
        .with_header(json_header());
    if let Ok(location) = Header::from_bytes(
        "Location",
        format!("{API_PREFIX}/provision/{}", ticket.provision_id),
    ) {
        response = response.with_header(location);
    }
    let _ = req.respond(response);
}

fn read_body(req: &mut tiny_http::Request) -> Option<Vec<u8>> {
    let mut body = Vec::new();
    if req
        .as_reader()
        .take(MAX_BODY_BYTES)
        .read_to_end(&mut body)
        .is_ok()
    {
        Some(body)
    } else {
        None
    }
}

fn handle_provision(orchestrator: &Orchestrator, mut req: tiny_http::Request) {
    let Some(body) = read_body(&mut req) else {
        respond_err(req, 400, "cannot read request body");
        return;
    };
    let parsed: ProvisionBody = match serde_json::from_slice(&body) {
        Ok(b) => b,
        Err(e) => {
            respond_err(req, 400, &format!("invalid JSON body: {e}"));
            return;
        }
    };
    let (Some(template), Some(workspace)) = (parsed.template, parsed.workspace) else {
        respond_err(req, 400, "template and workspace are required");
        return;
    };
    let variables = match string_parameters(parsed.parameters) {
        Ok(v) => v,
        Err(msg) => {
            respond_err(req, 400, &msg);
            return;
        }
    };

    match orchestrator.provision(ProvisionInput {
        workspace,
        template,
        variables,
    }) {
        Ok(ticket) => respond_accepted(req, &ticket),
        Err(e) => {
            if e.is_retriable() {
                info!("provision rejected: {e}");
            }
            respond_core_err(req, &e);
        }
    }
}

fn handle_destroy(orchestrator: &Orchestrator, mut req: tiny_http::Request, workspace: &str) {
    let Some(body) = read_body(&mut req) else {
        respond_err(req, 400, "cannot read request body");
        return;
    };
    let parsed: DestroyBody = if body.iter().all(u8::is_ascii_whitespace) {
        DestroyBody::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(b) => b,
            Err(e) => {
                respond_err(req, 400, &format!("invalid JSON body: {e}"));
                return;
            }
        }
    };
    let variables = match parsed.parameters.map(string_parameters).transpose() {
        Ok(v) => v,
        Err(msg) => {
            respond_err(req, 400, &msg);
            return;
        }
    };

    match orchestrator.destroy(DestroyInput {
        workspace: workspace.to_owned(),
        template: parsed.template,
        variables,
    }) {
        Ok(ticket) => respond_accepted(req, &ticket),
        Err(e) => respond_core_err(req, &e),
    }
}

/// Handle a single HTTP request, dispatching to the appropriate route handler.
pub fn handle_request(orchestrator: &Orchestrator, req: tiny_http::Request) {
    let method = req.method().clone();
    let url = req.url().to_owned();
    debug!("{method} {url}");

    match (parse_route(&url), &method) {
        (Some(Route::Health), Method::Get) => {
            respond_json(req, 200, &serde_json::json!({ "status": "ok" }));
        }
        (Some(Route::ProvisionCollection), Method::Post) => handle_provision(orchestrator, req),
        (Some(Route::ProvisionCollection), Method::Get) => match orchestrator.list() {
            Ok(all) => {
                let views: Vec<_> = all.iter().map(StatusView::new).collect();
                respond_json(req, 200, &views);
            }
            Err(e) => respond_core_err(req, &e),
        },
        (Some(Route::Provision(id)), Method::Get) => match orchestrator.get_status(id) {
            Ok(snapshot) => respond_json(req, 200, &StatusView::new(&snapshot)),
            Err(e) => respond_core_err(req, &e),
        },
        (Some(Route::Cancel(id)), Method::Post) => match orchestrator.cancel(id) {
            Ok(cancelled) => respond_json(
                req,
                200,
                &serde_json::json!({ "provision_id": id, "cancelled": cancelled }),
            ),
            Err(e) => respond_core_err(req, &e),
        },
        (Some(Route::Destroy(ws)), Method::Post) => handle_destroy(orchestrator, req, ws),
        (Some(_), _) => respond_err(req, 405, "method not allowed"),
        (None, _) => respond_err(req, 404, "not found"),
    }
}

pub fn bind(addr: &str) -> Result<Server, ServerError> {
    Server::http(addr).map_err(|e| ServerError::Bind {
        addr: addr.to_owned(),
        message: e.to_string(),
    })
}

/// Serve until Ctrl-C, then cancel every running request.
pub fn run_server(orchestrator: &Orchestrator, server: &Server) -> Result<(), ServerError> {
    loop {
        if shutdown_requested() {
            let n = orchestrator.cancel_all();
            info!("shutting down, cancelled {n} running requests");
            return Ok(());
        }
        match server.recv_timeout(ACCEPT_POLL) {
            Ok(Some(request)) => handle_request(orchestrator, request),
            Ok(None) => {}
            Err(e) => {
                warn!("accept failed: {e}");
                return Err(e.into());
            }
        }
    }
}

/// A test helper that serves an [`Orchestrator`] on a random port in a background thread.
///
/// The server listens on `127.0.0.1:{port}`. Dropping the `TestServer` stops it.
pub struct TestServer {
    pub url: String,
    pub port: u16,
    server: Arc<Server>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl TestServer {
    pub fn start(orchestrator: Orchestrator) -> Self {
        let server =
            Arc::new(Server::http("127.0.0.1:0").expect("failed to bind test HTTP server"));
        let port = server.server_addr().to_ip().expect("not an IP addr").port();
        let url = format!("http://127.0.0.1:{port}");

        let srv = Arc::clone(&server);
        let handle = std::thread::spawn(move || {
            for request in srv.incoming_requests() {
                handle_request(&orchestrator, request);
            }
        });

        Self {
            url,
            port,
            server,
            handle: Some(handle),
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.unblock();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
