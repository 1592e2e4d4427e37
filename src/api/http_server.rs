//! HTTP router and shared handler state.

use std::sync::Arc;

use axum::Router;
use axum::middleware::from_fn_with_state;
use axum::routing::{any, get};
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{AuthGate, auth_middleware};
use crate::config::Config;
use crate::core::SessionOrchestrator;
use crate::gateway::GatewayControl;
use crate::tunnel::TunnelController;
use crate::worktree::WorktreeService;

use super::protocol::ServerEvent;
use super::proxy::{ProxyClient, proxy_rest, proxy_root};
use super::socket::ws_handler;
use super::static_files::serve_static;

/// Shared state for HTTP and socket handlers
#[derive(Clone)]
pub struct AppState {
    /// Session lifecycle API
    pub orchestrator: Arc<SessionOrchestrator>,
    /// Git worktree operations
    pub worktrees: Arc<WorktreeService>,
    /// Gateway supervisor (for port lease reporting)
    pub gateway: Arc<dyn GatewayControl>,
    /// Public tunnel controller
    pub tunnel: Arc<TunnelController>,
    /// Auth gate shared with the middleware
    pub auth: Arc<AuthGate>,
    /// Event bus every client subscribes to
    pub events: broadcast::Sender<ServerEvent>,
    /// Runtime configuration
    pub config: Arc<Config>,
    /// Pooled client for plain proxied requests
    pub proxy_client: ProxyClient,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

/// Build the router: reverse proxy, client socket, embedded SPA.
///
/// The auth gate wraps everything; static assets bypass it inside the
/// predicate itself.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let auth = Arc::clone(&state.auth);

    Router::new()
        .route("/t/{sid}", any(proxy_root))
        .route("/t/{sid}/", any(proxy_rest_empty))
        .route("/t/{sid}/{*rest}", any(proxy_rest))
        .route("/ws", get(ws_handler))
        .fallback(serve_static)
        .layer(from_fn_with_state(auth, auth_middleware))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `/t/{sid}/` has an empty wildcard, which axum does not match; route it
/// explicitly to the same handler with an empty rest.
async fn proxy_rest_empty(
    state: axum::extract::State<AppState>,
    path: axum::extract::Path<String>,
    request: axum::extract::Request,
) -> axum::response::Response {
    let sid = path.0;
    super::proxy::proxy_root(
        state,
        axum::extract::Path(sid),
        request,
    )
    .await
}
