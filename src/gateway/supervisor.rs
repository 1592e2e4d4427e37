//! Supervisor for per-session web-terminal gateways.
//!
//! Each gateway is a ttyd subprocess bound to loopback on a leased port,
//! attached to one multiplexer window. Unlike windows, gateways do not
//! survive restarts; they are respawned on demand during restore.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, broadcast};

use crate::api::protocol::ServerEvent;
use crate::core::errors::{OrchestratorError, Result};

use super::port_allocator::PortAllocator;

/// How long to wait for the child to announce it is listening
const READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Grace period between SIGTERM and SIGKILL on stop
const STOP_GRACE: Duration = Duration::from_millis(2000);

/// Poll interval of the exit monitor; a dead child is reaped well inside 1 s
const MONITOR_INTERVAL: Duration = Duration::from_millis(250);

/// A live gateway subprocess
#[derive(Debug, Clone)]
pub struct GatewayInstance {
    /// Owning session id
    pub sid: String,

    /// Loopback port the gateway listens on
    pub port: u16,

    /// Child process id
    pub pid: Option<u32>,

    /// Window the gateway is attached to
    pub window_name: String,

    /// When the gateway became ready
    pub started_at: DateTime<Utc>,
}

struct GatewayRecord {
    instance: GatewayInstance,
    child: Arc<Mutex<Option<Child>>>,
}

/// Spawns and reaps one ttyd process per session.
pub struct GatewaySupervisor {
    ttyd_bin: String,
    tmux_bin: String,
    ports: Arc<PortAllocator>,
    instances: Arc<DashMap<String, GatewayRecord>>,
    events: broadcast::Sender<ServerEvent>,
}

impl std::fmt::Debug for GatewaySupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewaySupervisor")
            .field("ttyd_bin", &self.ttyd_bin)
            .field("instances", &self.instances.len())
            .finish_non_exhaustive()
    }
}

impl GatewaySupervisor {
    /// Create the supervisor
    #[must_use]
    pub fn new(
        ttyd_bin: String,
        tmux_bin: String,
        ports: Arc<PortAllocator>,
        events: broadcast::Sender<ServerEvent>,
    ) -> Self {
        Self {
            ttyd_bin,
            tmux_bin,
            ports,
            instances: Arc::new(DashMap::new()),
            events,
        }
    }

    /// The allocator backing this supervisor
    #[must_use]
    pub fn port_allocator(&self) -> Arc<PortAllocator> {
        Arc::clone(&self.ports)
    }

    /// Start a gateway for `sid` attached to `window_name`.
    ///
    /// Acquires a port, spawns ttyd bound to loopback, and waits for the
    /// child to announce "Listening" on stderr. On any failure the port is
    /// released and the child killed.
    pub async fn start(&self, sid: &str, window_name: &str) -> Result<GatewayInstance> {
        if let Some(existing) = self.get(sid) {
            return Err(OrchestratorError::Conflict {
                reason: format!("gateway already running for {sid} on port {}", existing.port),
            });
        }

        let port = self.ports.acquire(sid).await?;

        let spawn_result = Command::new(&self.ttyd_bin)
            .arg("--writable")
            .args(["--interface", "127.0.0.1"])
            .args(["--port", &port.to_string()])
            .arg(&self.tmux_bin)
            .args(["attach-session", "-t", window_name])
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawn_result {
            Ok(child) => child,
            Err(e) => {
                self.ports.release(port).await;
                if e.kind() == std::io::ErrorKind::NotFound {
                    return Err(OrchestratorError::GatewayUnavailable {
                        hint: format!("{} is not installed", self.ttyd_bin),
                    });
                }
                return Err(OrchestratorError::Internal(e.into()));
            }
        };

        let stderr = child.stderr.take();
        let mut lines = stderr.map(|s| BufReader::new(s).lines());

        // Wait for the readiness marker on stderr
        let ready = tokio::time::timeout(READY_TIMEOUT, async {
            let Some(lines) = lines.as_mut() else {
                return false;
            };
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(sid, line = %line, "gateway stderr");
                if line.to_lowercase().contains("listening") {
                    return true;
                }
            }
            false
        })
        .await;

        if !matches!(ready, Ok(true)) {
            let _ = child.kill().await;
            self.ports.release(port).await;
            let reason = if ready.is_err() {
                format!("no readiness marker within {}s", READY_TIMEOUT.as_secs())
            } else {
                "process exited before becoming ready".to_string()
            };
            tracing::error!(sid, port, reason = %reason, "Gateway failed to start");
            return Err(OrchestratorError::GatewayStartFailed {
                sid: sid.to_string(),
                reason,
            });
        }

        let instance = GatewayInstance {
            sid: sid.to_string(),
            port,
            pid: child.id(),
            window_name: window_name.to_string(),
            started_at: Utc::now(),
        };

        let child = Arc::new(Mutex::new(Some(child)));
        self.instances.insert(
            sid.to_string(),
            GatewayRecord {
                instance: instance.clone(),
                child: Arc::clone(&child),
            },
        );

        // Keep draining stderr so the child never blocks on a full pipe
        if let Some(mut lines) = lines {
            let sid_owned = sid.to_string();
            tokio::spawn(async move {
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::trace!(sid = %sid_owned, line = %line, "gateway stderr");
                }
            });
        }

        self.spawn_monitor(sid.to_string(), port, child);

        tracing::info!(sid, port, window = window_name, "Gateway ready");
        Ok(instance)
    }

    /// Look up the gateway for a session
    #[must_use]
    pub fn get(&self, sid: &str) -> Option<GatewayInstance> {
        self.instances.get(sid).map(|r| r.instance.clone())
    }

    /// All live gateways
    #[must_use]
    pub fn all(&self) -> Vec<GatewayInstance> {
        self.instances.iter().map(|r| r.instance.clone()).collect()
    }

    /// Stop a session's gateway: graceful TERM, then kill after the grace
    /// period. Releases the port and emits `gateway:stopped`.
    pub async fn stop(&self, sid: &str) -> Result<()> {
        let Some((_, record)) = self.instances.remove(sid) else {
            return Ok(()); // repeated stop is a no-op
        };
        let port = record.instance.port;

        let mut guard = record.child.lock().await;
        if let Some(mut child) = guard.take() {
            terminate(&mut child, STOP_GRACE).await;
        }
        drop(guard);

        self.ports.release(port).await;
        let _ = self.events.send(ServerEvent::GatewayStopped {
            sid: sid.to_string(),
            port,
        });
        tracing::info!(sid, port, "Gateway stopped");
        Ok(())
    }

    /// Stop every gateway (restart path; windows are left alone).
    pub async fn cleanup(&self) {
        let sids: Vec<String> = self.instances.iter().map(|r| r.key().clone()).collect();
        for sid in sids {
            let _ = self.stop(&sid).await;
        }
    }

    /// Reap a gateway that exits on its own: drop the record, release the
    /// port, emit the event. Polls faster than the 1 s reaping bound.
    fn spawn_monitor(&self, sid: String, port: u16, child: Arc<Mutex<Option<Child>>>) {
        let instances = Arc::clone(&self.instances);
        let ports = Arc::clone(&self.ports);
        let events = self.events.clone();

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(MONITOR_INTERVAL).await;

                let mut guard = child.lock().await;
                let Some(running) = guard.as_mut() else {
                    return; // stop() already took the child
                };
                match running.try_wait() {
                    Ok(Some(status)) => {
                        guard.take();
                        drop(guard);
                        tracing::warn!(sid, port, %status, "Gateway exited on its own");
                        instances.remove(&sid);
                        ports.release(port).await;
                        let _ = events.send(ServerEvent::GatewayStopped {
                            sid: sid.clone(),
                            port,
                        });
                        return;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::error!(sid, error = %e, "Gateway monitor wait failed");
                        return;
                    }
                }
            }
        });
    }
}

/// TERM the child, give it the grace period, then KILL.
async fn terminate(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        let _ = Command::new("kill")
            .args(["-TERM", &pid.to_string()])
            .output()
            .await;
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.kill().await;
}

#[async_trait::async_trait]
impl super::traits::GatewayControl for GatewaySupervisor {
    async fn start(&self, sid: &str, window_name: &str) -> Result<GatewayInstance> {
        Self::start(self, sid, window_name).await
    }

    fn get(&self, sid: &str) -> Option<GatewayInstance> {
        Self::get(self, sid)
    }

    fn all(&self) -> Vec<GatewayInstance> {
        Self::all(self)
    }

    async fn stop(&self, sid: &str) -> Result<()> {
        Self::stop(self, sid).await
    }

    async fn cleanup(&self) {
        Self::cleanup(self).await;
    }

    fn port_allocator(&self) -> Arc<PortAllocator> {
        Self::port_allocator(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor(bin: &str, range: (u16, u16)) -> GatewaySupervisor {
        let (events, _) = broadcast::channel(16);
        GatewaySupervisor::new(
            bin.to_string(),
            "tmux".to_string(),
            Arc::new(PortAllocator::new(range.0, range.1)),
            events,
        )
    }

    #[tokio::test]
    async fn test_missing_binary_releases_port() {
        let supervisor = supervisor("definitely-not-ttyd", (19400, 19401));

        let err = supervisor.start("s1", "ccm-s1").await.unwrap_err();
        assert_eq!(err.kind(), "GatewayUnavailable");

        // The lease must not leak on the failure path
        assert!(supervisor.port_allocator().leases().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_start_with_fast_exit_reports_start_failed() {
        // `false` exits immediately without printing a readiness marker
        let supervisor = supervisor("false", (19410, 19411));

        let err = supervisor.start("s1", "ccm-s1").await.unwrap_err();
        assert_eq!(err.kind(), "GatewayStartFailed");
        assert!(supervisor.port_allocator().leases().await.is_empty());
        assert!(supervisor.get("s1").is_none());
    }

    #[tokio::test]
    async fn test_stop_unknown_sid_is_noop() {
        let supervisor = supervisor("false", (19420, 19421));
        supervisor.stop("missing").await.unwrap();
    }

    #[tokio::test]
    async fn test_all_empty_initially() {
        let supervisor = supervisor("false", (19430, 19431));
        assert!(supervisor.all().is_empty());
    }
}
