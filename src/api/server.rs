//! Composition root: build the supervisors, registry, orchestrator and
//! HTTP server, then serve until shutdown.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::auth::AuthGate;
use crate::config::Config;
use crate::core::SessionOrchestrator;
use crate::gateway::{GatewayControl, GatewaySupervisor, PortAllocator};
use crate::store::SqliteRegistry;
use crate::terminal::{TerminalControl, TerminalSupervisor};
use crate::tunnel::TunnelController;
use crate::utils::paths;
use crate::worktree::WorktreeService;

use super::http_server::{AppState, create_router};
use super::protocol::ServerEvent;
use super::proxy::proxy_client;

/// Capacity of the event bus; a slow client lags rather than blocking
/// publishers
const EVENT_BUS_CAPACITY: usize = 256;

/// Run the orchestrator server until ctrl-c.
pub async fn run(config: Config) -> anyhow::Result<()> {
    paths::ensure_dirs()?;

    let (events, _) = broadcast::channel::<ServerEvent>(EVENT_BUS_CAPACITY);

    tracing::debug!("Initializing session registry...");
    let registry = Arc::new(SqliteRegistry::new(&paths::database_path()).await?);

    tracing::debug!("Initializing terminal supervisor...");
    let terminal: Arc<dyn TerminalControl> = Arc::new(
        TerminalSupervisor::new(
            config.tmux_bin.clone(),
            config.agent_cmd.clone(),
            events.clone(),
        )
        .await,
    );

    let ports = Arc::new(PortAllocator::new(
        config.gateway_ports.0,
        config.gateway_ports.1,
    ));
    let gateway: Arc<dyn GatewayControl> = Arc::new(GatewaySupervisor::new(
        config.ttyd_bin.clone(),
        config.tmux_bin.clone(),
        Arc::clone(&ports),
        events.clone(),
    ));

    let orchestrator = Arc::new(SessionOrchestrator::new(
        Arc::clone(&terminal),
        Arc::clone(&gateway),
        registry,
        events.clone(),
    ));
    orchestrator.recover().await;

    let tunnel = Arc::new(TunnelController::new(
        config.cloudflared_bin.clone(),
        config.port,
        config.named_tunnel.clone(),
        events.clone(),
    ));

    let auth = Arc::new(AuthGate::new(config.remote));
    if config.remote {
        tracing::info!(token = %auth.token(), "Remote mode: authentication enabled");
        match tunnel.start().await {
            Ok(url) => tracing::info!(url = %url, "Public tunnel ready"),
            Err(e) => tracing::error!(error = %e, "Tunnel failed to start; continuing local-only"),
        }
    }

    let port = config.port;
    let state = AppState {
        orchestrator: Arc::clone(&orchestrator),
        worktrees: Arc::new(WorktreeService::new()),
        gateway: Arc::clone(&gateway),
        tunnel: Arc::clone(&tunnel),
        auth,
        events,
        config: Arc::new(config),
        proxy_client: proxy_client(),
    };

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "Orchestrator listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Gateways stop, the tunnel comes down; windows stay alive so the
    // agent sessions survive the restart
    tracing::info!("Shutting down: stopping gateways and tunnel");
    orchestrator.cleanup().await;
    tunnel.stop().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
}
