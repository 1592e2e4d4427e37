//! Client socket: per-client event fan-out and inbound command dispatch.
//!
//! Each connected client subscribes to the event bus on accept and receives
//! every event from its subscription point on, in bus order. Inbound
//! messages are decoded into [`ClientCommand`]s; failures surface back to
//! the issuing client as the matching `*:error` event.

use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{RawQuery, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::sink::SinkExt;
use futures::stream::{SplitSink, StreamExt};

use crate::auth::presented_token;
use crate::core::errors::OrchestratorError;

use super::http_server::AppState;
use super::protocol::{ClientCommand, PortLease, ScanPhase, ServerEvent};

/// Depth of repository scans started from the socket
const SCAN_DEPTH: usize = 3;

/// Upgrade handler for `/ws`.
///
/// The auth gate runs before the upgrade so an unauthorized handshake is
/// rejected with 401 instead of being accepted and dropped.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    let token = presented_token(query.as_deref(), &headers).map(ToString::to_string);
    if !state.auth.allows("/ws", &headers, token.as_deref()) {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Drive one client connection until it drops.
async fn handle_socket(socket: WebSocket, state: AppState) {
    tracing::info!("Client socket connected");
    let mut bus = state.events.subscribe();
    let (mut sender, mut receiver) = socket.split();

    // Greet with the repository allow-list
    let repos: Vec<String> = state
        .config
        .allowed_repos
        .iter()
        .map(|p| p.to_string_lossy().to_string())
        .collect();
    if send_event(&mut sender, &ServerEvent::ReposList { repos })
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            event = bus.recv() => {
                match event {
                    Ok(event) => {
                        if send_event(&mut sender, &event).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(dropped)) => {
                        tracing::warn!(dropped, "Client lagged behind the event bus");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        let command: ClientCommand = match serde_json::from_str(&text) {
                            Ok(command) => command,
                            Err(e) => {
                                tracing::warn!(error = %e, "Unparseable client command");
                                continue;
                            }
                        };
                        dispatch(command, &state, &mut sender).await;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "Client socket error");
                        break;
                    }
                }
            }
        }
    }

    tracing::info!("Client socket disconnected");
}

type Sender = SplitSink<WebSocket, WsMessage>;

async fn send_event(sender: &mut Sender, event: &ServerEvent) -> Result<(), axum::Error> {
    match serde_json::to_string(event) {
        Ok(json) => sender.send(WsMessage::Text(json.into())).await,
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode event");
            Ok(())
        }
    }
}

/// Execute one client command.
///
/// State-changing results are broadcast on the bus so every client stays
/// consistent; validation failures go only to the issuing client.
async fn dispatch(command: ClientCommand, state: &AppState, sender: &mut Sender) {
    match command {
        ClientCommand::RepoSelect { path } => {
            repo_select(state, sender, &path).await;
        }

        ClientCommand::RepoScan { base_path } => {
            broadcast(state, ServerEvent::ReposScanning {
                status: ScanPhase::Start,
            });
            match crate::worktree::scan_repos(&base_path, SCAN_DEPTH).await {
                Ok(repos) => {
                    broadcast(state, ServerEvent::ReposScanned { repos });
                    broadcast(state, ServerEvent::ReposScanning {
                        status: ScanPhase::Complete,
                    });
                }
                Err(e) => {
                    broadcast(state, ServerEvent::ReposScanning {
                        status: ScanPhase::Error,
                    });
                    let _ = send_event(sender, &ServerEvent::RepoError {
                        message: e.to_string(),
                    })
                    .await;
                }
            }
        }

        ClientCommand::WorktreeList { repo_path } => {
            match state.worktrees.list(&repo_path).await {
                Ok(worktrees) => broadcast(state, ServerEvent::WorktreeList { worktrees }),
                Err(e) => send_worktree_error(sender, &e).await,
            }
        }

        ClientCommand::WorktreeCreate {
            repo_path,
            branch_name,
            base_branch,
        } => {
            match state
                .worktrees
                .create(&repo_path, &branch_name, base_branch.as_deref())
                .await
            {
                Ok(worktree) => {
                    broadcast(state, ServerEvent::WorktreeCreated { worktree });
                    refresh_worktrees(state, sender, &repo_path).await;
                }
                Err(e) => send_worktree_error(sender, &e).await,
            }
        }

        ClientCommand::WorktreeDelete {
            repo_path,
            worktree_path,
        } => {
            // A live session on the worktree is stopped before removal
            match state.orchestrator.get_by_worktree(&worktree_path).await {
                Ok(Some(session)) => {
                    if let Err(e) = state.orchestrator.stop(&session.id).await {
                        tracing::warn!(sid = %session.id, error = %e, "Stop before delete failed");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    send_worktree_error(sender, &e).await;
                    return;
                }
            }

            match state.worktrees.delete(&repo_path, &worktree_path).await {
                Ok(()) => {
                    broadcast(state, ServerEvent::WorktreeDeleted { worktree_path });
                    refresh_worktrees(state, sender, &repo_path).await;
                }
                Err(e) => send_worktree_error(sender, &e).await,
            }
        }

        ClientCommand::SessionStart {
            worktree_id,
            worktree_path,
        } => {
            if let Err(e) = state.orchestrator.start(&worktree_id, &worktree_path).await {
                send_session_error(sender, None, &e).await;
            }
        }

        ClientCommand::SessionRestore { worktree_path } => {
            match state.orchestrator.restore(&worktree_path).await {
                Ok(Some(_)) => {} // session:restored already on the bus
                Ok(None) => {
                    let _ = send_event(sender, &ServerEvent::SessionRestoreFailed {
                        worktree_path,
                    })
                    .await;
                }
                Err(e) => send_session_error(sender, None, &e).await,
            }
        }

        ClientCommand::SessionSend { sid, text } => {
            if let Err(e) = state.orchestrator.send(&sid, &text).await {
                send_session_error(sender, Some(sid), &e).await;
            }
        }

        ClientCommand::SessionKey { sid, key } => {
            if let Err(e) = state.orchestrator.send_key(&sid, &key).await {
                send_session_error(sender, Some(sid), &e).await;
            }
        }

        ClientCommand::SessionStop { sid } => {
            if let Err(e) = state.orchestrator.stop(&sid).await {
                send_session_error(sender, Some(sid), &e).await;
            }
        }

        ClientCommand::TunnelStart => {
            if let Err(e) = state.tunnel.start().await {
                // tunnel:error is already on the bus; log for the record
                tracing::warn!(error = %e, "Tunnel start failed");
            }
        }

        ClientCommand::TunnelStop => {
            state.tunnel.stop().await;
        }

        ClientCommand::PortsScan => {
            let ports = state
                .gateway
                .port_allocator()
                .leases()
                .await
                .into_iter()
                .map(|(port, sid)| PortLease { port, sid })
                .collect();
            broadcast(state, ServerEvent::PortsList { ports });
        }
    }
}

async fn repo_select(state: &AppState, sender: &mut Sender, path: &str) {
    let allowed = &state.config.allowed_repos;
    if !allowed.is_empty() && !allowed.iter().any(|p| p.to_string_lossy() == path) {
        let _ = send_event(sender, &ServerEvent::RepoError {
            message: "Repository not in allowed list".to_string(),
        })
        .await;
        return;
    }

    match state.worktrees.is_repo(path).await {
        Ok(true) => {}
        Ok(false) => {
            let _ = send_event(sender, &ServerEvent::RepoError {
                message: format!("Not a git repository: {path}"),
            })
            .await;
            return;
        }
        Err(e) => {
            let _ = send_event(sender, &ServerEvent::RepoError {
                message: e.to_string(),
            })
            .await;
            return;
        }
    }

    broadcast(state, ServerEvent::RepoSet {
        path: path.to_string(),
    });
    refresh_worktrees(state, sender, path).await;
}

/// Re-broadcast the worktree list after a mutation
async fn refresh_worktrees(state: &AppState, sender: &mut Sender, repo_path: &str) {
    match state.worktrees.list(repo_path).await {
        Ok(worktrees) => broadcast(state, ServerEvent::WorktreeList { worktrees }),
        Err(e) => send_worktree_error(sender, &e).await,
    }
}

fn broadcast(state: &AppState, event: ServerEvent) {
    let _ = state.events.send(event);
}

async fn send_worktree_error(sender: &mut Sender, err: &OrchestratorError) {
    let _ = send_event(sender, &ServerEvent::WorktreeError {
        kind: err.kind().to_string(),
        message: err.to_string(),
    })
    .await;
}

async fn send_session_error(sender: &mut Sender, sid: Option<String>, err: &OrchestratorError) {
    let _ = send_event(sender, &ServerEvent::SessionError {
        sid,
        kind: err.kind().to_string(),
        message: err.to_string(),
    })
    .await;
}
