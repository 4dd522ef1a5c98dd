//! MCP server transports.
//!
//! The same [`McpBridge`] is served either over Streamable HTTP (for
//! browser-based and remote clients) or over stdio (for desktop clients
//! that spawn the server as a subprocess).
//!
//! # Endpoints (HTTP transport)
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST`/`GET`/`DELETE` | `/mcp` | MCP Streamable HTTP endpoint |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! Unknown paths answer with the JSON error body
//! `{ "error": { "code": "not_found", "message": "..." } }`.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser-based
//! clients.
//!
//! # Desktop client integration
//!
//! ```json
//! {
//!   "mcpServers": {
//!     "crates-warehouse": {
//!       "command": "cwh",
//!       "args": ["--config", "/path/to/cwh.toml", "serve", "mcp", "--transport", "stdio"]
//!     }
//!   }
//! }
//! ```

use anyhow::Context;
use axum::{
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use rmcp::transport::streamable_http_server::{
    session::local::LocalSessionManager, StreamableHttpServerConfig, StreamableHttpService,
};
use rmcp::ServiceExt;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::config::Config;
use crate::db;
use crate::mcp::McpBridge;

/// How `cwh serve mcp` talks to its client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum Transport {
    /// Streamable HTTP on `[server].bind`.
    Http,
    /// JSON-RPC over stdin/stdout.
    Stdio,
}

/// Open the warehouse read-only and serve it until shutdown.
pub async fn run_server(config: &Config, transport: Transport) -> anyhow::Result<()> {
    let pool = db::connect_read_only(config).await?;
    let bridge = McpBridge::new(pool.clone(), config.server.schema_dir.clone());

    let result = match transport {
        Transport::Http => serve_http(bridge, &config.server.bind).await,
        Transport::Stdio => serve_stdio(bridge).await,
    };

    pool.close().await;
    result
}

/// Axum router with the MCP endpoint, health check and CORS.
pub fn router(bridge: McpBridge) -> Router {
    let mcp_service = StreamableHttpService::new(
        move || Ok(bridge.clone()),
        LocalSessionManager::default().into(),
        StreamableHttpServerConfig::default(),
    );

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .nest_service("/mcp", mcp_service)
        .route("/health", get(handle_health))
        .fallback(handle_not_found)
        .layer(cors)
}

async fn serve_http(bridge: McpBridge, bind_addr: &str) -> anyhow::Result<()> {
    let app = router(bridge);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", bind_addr))?;
    println!("MCP server listening on http://{}/mcp", bind_addr);
    info!(%bind_addr, "serving MCP over streamable HTTP");

    axum::serve(listener, app).await?;
    Ok(())
}

async fn serve_stdio(bridge: McpBridge) -> anyhow::Result<()> {
    info!("serving MCP over stdio");
    let service = bridge
        .serve((tokio::io::stdin(), tokio::io::stdout()))
        .await
        .inspect_err(|e| tracing::error!("serve error: {e:?}"))?;
    service.waiting().await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

async fn handle_not_found(uri: Uri) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: format!("no route for {}", uri.path()),
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Returns `{ "status": "ok", "version": "<crate version>" }`.
async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
