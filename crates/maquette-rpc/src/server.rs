//! HTTP server implementation using Axum.

use crate::handler::{handle_health, handle_rpc, handle_shutdown};
use axum::{
    routing::{get, post},
    Router,
};
use maquette_core::RpcRouter;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

/// Application state shared across handlers.
pub struct AppState {
    /// Command dispatch (registry, smoke gate, log sink)
    pub router: Arc<RpcRouter>,
    /// Port this server actually bound
    pub port: u16,
    /// Cooperative shutdown trigger; flipping it drains the server
    pub shutdown: watch::Sender<bool>,
}

/// Handle to the background serve task.
pub struct ServerHandle {
    task: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Resolve once the server has drained (after a shutdown request).
    pub async fn wait(self) {
        let _ = self.task.await;
    }
}

/// Start the JSON-RPC HTTP server.
///
/// Returns the actual bound address (useful when port=0 in tests) plus a
/// handle that resolves when a shutdown request drains the server.
pub async fn start_server(
    router: Arc<RpcRouter>,
    host: &str,
    port: u16,
) -> anyhow::Result<(SocketAddr, ServerHandle)> {
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let state = Arc::new(AppState {
        router,
        port: actual_addr.port(),
        shutdown: shutdown_tx,
    });

    // Permissive CORS: the bridge only ever listens on loopback.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(handle_health))
        .route("/rpc", post(handle_rpc))
        .route("/shutdown", post(handle_shutdown))
        .layer(cors)
        .with_state(state);

    info!("Server listening on {}", actual_addr);

    let task = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.changed().await;
        };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!("Server error: {}", e);
        }
    });

    Ok((actual_addr, ServerHandle { task }))
}
