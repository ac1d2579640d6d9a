//! HTTP API for netbk.
//!
//! REST endpoints are thin wrappers around the JSON-RPC method handler, so
//! the HTTP, WebSocket and TCP surfaces always agree.
//!
//! ## Endpoints
//!
//! - `POST /api/backups` - start a bulk backup (`202` with the job id)
//! - `GET /api/jobs` - list jobs (`limit`, `offset`, `status` query parameters)
//! - `GET /api/jobs/{id}` - job record with status history and summary
//! - `GET /api/jobs/{id}/progress` - processed/total devices
//! - `GET /api/status` - daemon status
//! - `WS /ws` - JSON-RPC over WebSocket

mod websocket;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::rpc::{
    INVALID_PARAMS, JOB_NOT_FOUND, METHOD_NOT_FOUND, MethodHandler, Request, STORE_UNAVAILABLE,
    VALIDATION_FAILED,
};

/// Shared state for the web server
#[derive(Clone)]
pub struct WebState {
    pub handler: Arc<MethodHandler>,
}

/// HTTP server for the API.
pub struct WebServer {
    bind_addr: SocketAddr,
    state: WebState,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebServer {
    /// Create a new web server bound to the given address.
    pub fn new(handler: Arc<MethodHandler>, bind_addr: SocketAddr) -> Self {
        let state = WebState { handler };
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            bind_addr,
            state,
            shutdown_tx,
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/backups", post(start_backup))
            .route("/api/jobs", get(list_jobs))
            .route("/api/jobs/{id}", get(get_job))
            .route("/api/jobs/{id}/progress", get(get_progress))
            .route("/api/status", get(daemon_status))
            .route("/ws", get(websocket::ws_handler))
            .with_state(self.state.clone())
    }

    /// Start the web server. Runs until shutdown() is called.
    pub async fn start(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.start_on(listener).await
    }

    /// Serve on a listener the caller already bound.
    pub async fn start_on(&self, listener: TcpListener) -> anyhow::Result<()> {
        tracing::info!(addr = %listener.local_addr()?, "HTTP API listening");

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await?;

        Ok(())
    }

    /// Signal the server to shut down gracefully.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

type ApiResponse = (StatusCode, Json<Value>);

/// Run one RPC method and translate the outcome into an HTTP status.
async fn call(state: &WebState, method: &str, params: Value, ok: StatusCode) -> ApiResponse {
    let request = Request {
        jsonrpc: "2.0".to_string(),
        method: method.to_string(),
        params: Some(params),
        id: Some(Value::Null),
    };

    let response = state.handler.handle(request).await;
    match response.error {
        None => (ok, Json(response.result.unwrap_or(Value::Null))),
        Some(error) => {
            let status = match error.code {
                VALIDATION_FAILED | INVALID_PARAMS => StatusCode::BAD_REQUEST,
                JOB_NOT_FOUND | METHOD_NOT_FOUND => StatusCode::NOT_FOUND,
                STORE_UNAVAILABLE => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, Json(json!({ "error": error })))
        }
    }
}

async fn start_backup(State(state): State<WebState>, Json(body): Json<Value>) -> ApiResponse {
    call(&state, "backup.start", body, StatusCode::ACCEPTED).await
}

#[derive(Debug, Deserialize, Serialize)]
struct ListQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    offset: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<String>,
}

async fn list_jobs(State(state): State<WebState>, Query(query): Query<ListQuery>) -> ApiResponse {
    let params = serde_json::to_value(query).unwrap_or(Value::Null);
    call(&state, "jobs.list", params, StatusCode::OK).await
}

async fn get_job(State(state): State<WebState>, Path(id): Path<String>) -> ApiResponse {
    call(&state, "jobs.get", json!({ "id": id }), StatusCode::OK).await
}

async fn get_progress(State(state): State<WebState>, Path(id): Path<String>) -> ApiResponse {
    call(&state, "progress.get", json!({ "id": id }), StatusCode::OK).await
}

async fn daemon_status(State(state): State<WebState>) -> ApiResponse {
    call(&state, "daemon.status", Value::Null, StatusCode::OK).await
}
