//! HTTP surface: health, session listing, and the MCP Streamable HTTP mount.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderValue, Method},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::commands::CommandPolicy;
use crate::config::Config;
use crate::manager::{ActiveSession, TerminalManager};
use crate::telemetry::Telemetry;

/// Shared state for HTTP handlers and MCP tools.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<TerminalManager>,
    pub policy: CommandPolicy,
    pub config: Arc<Config>,
    pub telemetry: Telemetry,
}

/// Configuration for the HTTP router.
///
/// Use `RouterConfig::default()` in tests for a minimal setup.
#[derive(Default)]
pub struct RouterConfig {
    pub cors_origins: Vec<String>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    active_sessions: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        active_sessions: state.manager.session_count(),
    })
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<ActiveSession>> {
    Json(state.manager.list_active_sessions())
}

pub fn router(state: AppState, config: RouterConfig) -> Router {
    use rmcp::transport::streamable_http_server::{
        session::local::LocalSessionManager, StreamableHttpServerConfig, StreamableHttpService,
    };

    let mcp_state = state.clone();
    let mcp_service = StreamableHttpService::new(
        move || Ok(crate::mcp::CmdrMcpServer::new(mcp_state.clone())),
        Arc::new(LocalSessionManager::default()),
        StreamableHttpServerConfig::default(),
    );

    let router = Router::new()
        .route("/health", get(health))
        .route("/sessions", get(list_sessions))
        .nest_service("/mcp", mcp_service)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // CORS only when origins are configured.
    if config.cors_origins.is_empty() {
        router
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        router.layer(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
                .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]),
        )
    }
}
