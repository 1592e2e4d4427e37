//! Public-URL tunnel controller.
//!
//! Wraps the external tunnel binary in two modes: quick (an ephemeral URL
//! parsed from the child's stderr) and named (a preconfigured URL, ready
//! once the child reports a registered connection).

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, broadcast};

use crate::api::protocol::ServerEvent;
use crate::config::NamedTunnel;
use crate::core::errors::{OrchestratorError, Result};

/// Quick-mode URL must appear within this window
const QUICK_TIMEOUT: Duration = Duration::from_secs(30);

/// Named-mode registration must appear within this window
const NAMED_TIMEOUT: Duration = Duration::from_secs(60);

/// Marker logged by the child once a named tunnel is connected
const NAMED_READY_MARKER: &str = "Registered tunnel connection";

/// Starts and stops the tunnel subprocess and reports its public URL.
pub struct TunnelController {
    bin: String,
    local_port: u16,
    named: Option<NamedTunnel>,
    events: broadcast::Sender<ServerEvent>,
    state: Arc<Mutex<TunnelState>>,
}

#[derive(Default)]
struct TunnelState {
    child: Option<Child>,
    url: Option<String>,
}

impl std::fmt::Debug for TunnelController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelController")
            .field("bin", &self.bin)
            .field("local_port", &self.local_port)
            .finish_non_exhaustive()
    }
}

impl TunnelController {
    /// Create the controller
    #[must_use]
    pub fn new(
        bin: String,
        local_port: u16,
        named: Option<NamedTunnel>,
        events: broadcast::Sender<ServerEvent>,
    ) -> Self {
        Self {
            bin,
            local_port,
            named,
            events,
            state: Arc::new(Mutex::new(TunnelState::default())),
        }
    }

    /// Start the tunnel and return its public URL.
    ///
    /// Already running: returns the existing URL.
    pub async fn start(&self) -> Result<String> {
        let mut state = self.state.lock().await;
        if let (Some(_), Some(url)) = (&state.child, &state.url) {
            return Ok(url.clone());
        }

        let (mut child, timeout, named_url) = match &self.named {
            Some(named) => {
                let child = self.spawn(&["tunnel", "run", &named.name])?;
                (child, NAMED_TIMEOUT, Some(named.url.clone()))
            }
            None => {
                let target = format!("http://127.0.0.1:{}", self.local_port);
                let child = self.spawn(&["tunnel", "--url", &target])?;
                (child, QUICK_TIMEOUT, None)
            }
        };

        let stderr = child.stderr.take();
        let mut lines = stderr.map(|s| BufReader::new(s).lines());

        // Scan stderr for readiness: the ephemeral URL in quick mode, the
        // registration marker in named mode
        #[allow(clippy::unwrap_used, reason = "pattern is a checked literal")]
        let url_pattern = Regex::new(r"https://[a-z0-9-]+\.trycloudflare\.com").unwrap();
        let named_mode = named_url.is_some();
        let found = tokio::time::timeout(timeout, async {
            let lines = lines.as_mut()?;
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(line = %line, "tunnel stderr");
                if named_mode {
                    if line.contains(NAMED_READY_MARKER) {
                        return named_url.clone();
                    }
                } else if let Some(found) = url_pattern.find(&line) {
                    return Some(found.as_str().to_string());
                }
            }
            None
        })
        .await;

        let url = match found {
            Ok(Some(url)) => url,
            Ok(None) => {
                let _ = child.kill().await;
                let err = OrchestratorError::TunnelStartFailed {
                    reason: "tunnel process exited before becoming ready".to_string(),
                };
                let _ = self.events.send(ServerEvent::TunnelError {
                    message: err.to_string(),
                });
                return Err(err);
            }
            Err(_) => {
                let _ = child.kill().await;
                let err = OrchestratorError::TunnelStartFailed {
                    reason: format!("no public URL within {}s", timeout.as_secs()),
                };
                let _ = self.events.send(ServerEvent::TunnelError {
                    message: err.to_string(),
                });
                return Err(err);
            }
        };

        state.child = Some(child);
        state.url = Some(url.clone());
        drop(state);

        // Drain remaining stderr until the child exits, then clean up
        self.spawn_reaper(lines);

        tracing::info!(url = %url, "Tunnel started");
        let _ = self
            .events
            .send(ServerEvent::TunnelStarted { url: url.clone() });
        Ok(url)
    }

    /// Kill the tunnel child. The reaper emits `tunnel:closed`.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if let Some(mut child) = state.child.take() {
            let _ = child.kill().await;
        }
        state.url = None;
    }

    /// The current public URL, if the tunnel is up
    pub async fn url(&self) -> Option<String> {
        self.state.lock().await.url.clone()
    }

    fn spawn(&self, args: &[&str]) -> Result<Child> {
        Command::new(&self.bin)
            .args(args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    OrchestratorError::TunnelStartFailed {
                        reason: format!("{} is not installed", self.bin),
                    }
                } else {
                    OrchestratorError::Internal(e.into())
                }
            })
    }

    /// Watch for the child exiting on its own: clear state, emit close.
    fn spawn_reaper(
        &self,
        lines: Option<tokio::io::Lines<BufReader<tokio::process::ChildStderr>>>,
    ) {
        let state = Arc::clone(&self.state);
        let events = self.events.clone();
        tokio::spawn(async move {
            if let Some(mut lines) = lines {
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::trace!(line = %line, "tunnel stderr");
                }
            }

            // stderr EOF: the child is gone (or was killed by stop)
            let mut state = state.lock().await;
            if let Some(mut child) = state.child.take() {
                let _ = child.wait().await;
            }
            state.url = None;
            drop(state);

            tracing::info!("Tunnel closed");
            let _ = events.send(ServerEvent::TunnelClosed);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(bin: &str, named: Option<NamedTunnel>) -> TunnelController {
        let (events, _) = broadcast::channel(16);
        TunnelController::new(bin.to_string(), 8080, named, events)
    }

    #[tokio::test]
    async fn test_missing_binary_fails_start() {
        let tunnel = controller("definitely-not-cloudflared", None);
        let err = tunnel.start().await.unwrap_err();
        assert_eq!(err.kind(), "TunnelStartFailed");
        assert!(tunnel.url().await.is_none());
    }

    #[tokio::test]
    async fn test_fast_exit_without_url_fails_start() {
        // `false` exits immediately without printing a URL
        let tunnel = controller("false", None);
        let err = tunnel.start().await.unwrap_err();
        assert_eq!(err.kind(), "TunnelStartFailed");
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let tunnel = controller("false", None);
        tunnel.stop().await;
        assert!(tunnel.url().await.is_none());
    }
}
