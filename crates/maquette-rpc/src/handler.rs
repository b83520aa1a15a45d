//! HTTP request handlers.
//!
//! `/rpc` parses the body by hand instead of using the `Json` extractor:
//! the transport contract is "status 200 with a JSON-RPC envelope, always",
//! and a malformed body must come back as a `-32700` error envelope rather
//! than an axum rejection.

use crate::server::AppState;
use axum::{extract::State, response::IntoResponse, Json};
use chrono::Utc;
use maquette_core::{JsonRpcRequest, JsonRpcResponse, PARSE_ERROR_CODE};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Liveness probe; also the target of the lifecycle manager's attach check.
pub async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(health_body(&state))
}

/// Cooperative shutdown endpoint used by `stop_by_lock`. The response is
/// written before draining begins so the stopping side gets an answer.
pub async fn handle_shutdown(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    info!("Shutdown requested over HTTP");
    trigger_shutdown(&state);
    Json(json!({"ok": true, "stopping": true}))
}

/// Main JSON-RPC handler.
pub async fn handle_rpc(State(state): State<Arc<AppState>>, body: String) -> impl IntoResponse {
    let request: JsonRpcRequest = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(e) => {
            return Json(JsonRpcResponse::error(
                Value::Null,
                PARSE_ERROR_CODE,
                format!("Parse error: {}", e),
            ));
        }
    };

    let method = request.method.trim();
    let id = request.id;
    debug!("RPC call: {}", method);

    // Reserved methods answer regardless of registry or gate state. Folded
    // to lowercase so their resolution matches the router's.
    match method.to_ascii_lowercase().as_str() {
        "health" => {
            return Json(JsonRpcResponse::success(id, health_body(&state)));
        }
        "version" => {
            return Json(JsonRpcResponse::success(
                id,
                json!({
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                }),
            ));
        }
        "list_commands" => {
            let commands: Vec<Value> = state
                .router
                .list_all()
                .into_iter()
                .map(|(name, kind)| json!({"name": name, "kind": kind}))
                .collect();
            return Json(JsonRpcResponse::success(id, json!({"commands": commands})));
        }
        "shutdown" => {
            info!("Shutdown requested over RPC");
            trigger_shutdown(&state);
            return Json(JsonRpcResponse::success(
                id,
                json!({"ok": true, "stopping": true}),
            ));
        }
        _ => {}
    }

    Json(state.router.dispatch(method, request.params, id).await)
}

fn health_body(state: &AppState) -> Value {
    json!({
        "ok": true,
        "port": state.port,
        "time": Utc::now().to_rfc3339(),
    })
}

/// Flip the shutdown watch after a short grace so the current response hits
/// the wire first.
fn trigger_shutdown(state: &AppState) {
    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = shutdown.send(true);
    });
}
