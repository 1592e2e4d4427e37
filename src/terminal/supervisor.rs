//! Supervisor for multiplexer windows.
//!
//! The supervisor is the single authority for window lifecycle. Windows are
//! tmux sessions named `ccm-<sid>`; they deliberately outlive this process
//! so a restart can rediscover them.

use std::path::{Path, PathBuf};
use std::process::Output;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::process::Command;
use tokio::sync::broadcast;

use crate::api::protocol::ServerEvent;
use crate::core::errors::{OrchestratorError, Result};
use crate::core::session::WindowState;
use crate::utils::{generate_sid, sid_from_window, window_name};

use super::escape::escape_send_text;

/// Keys accepted by [`TerminalSupervisor::send_key`]
const ALLOWED_KEYS: &[&str] = &["Enter", "C-c", "C-d", "y", "n", "S-Tab", "Escape"];

/// A live multiplexer window owned by the supervisor
#[derive(Debug, Clone)]
pub struct TerminalWindow {
    /// Owning session id
    pub sid: String,

    /// Multiplexer window name (`ccm-<sid>`)
    pub window_name: String,

    /// Working directory the window was created in (empty when discovery
    /// could not recover it)
    pub worktree_path: PathBuf,

    /// When the window record was created or discovered
    pub created_at: DateTime<Utc>,

    /// Last keystroke sent through the supervisor
    pub last_activity: DateTime<Utc>,

    /// Current window state
    pub state: WindowState,
}

/// Creates, discovers, drives and kills multiplexer windows.
pub struct TerminalSupervisor {
    tmux_bin: String,
    agent_cmd: String,
    windows: DashMap<String, TerminalWindow>,
    events: broadcast::Sender<ServerEvent>,
    available: bool,
}

impl std::fmt::Debug for TerminalSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalSupervisor")
            .field("tmux_bin", &self.tmux_bin)
            .field("windows", &self.windows.len())
            .field("available", &self.available)
            .finish_non_exhaustive()
    }
}

impl TerminalSupervisor {
    /// Construct the supervisor and discover surviving `ccm-*` windows.
    pub async fn new(
        tmux_bin: String,
        agent_cmd: String,
        events: broadcast::Sender<ServerEvent>,
    ) -> Self {
        let available = match Command::new(&tmux_bin).arg("-V").output().await {
            Ok(output) => output.status.success(),
            Err(_) => false,
        };

        if !available {
            tracing::warn!(
                bin = %tmux_bin,
                "Terminal multiplexer not found; install tmux (e.g. `apt install tmux` \
                 or `brew install tmux`) to start sessions"
            );
        }

        let supervisor = Self {
            tmux_bin,
            agent_cmd,
            windows: DashMap::new(),
            events,
            available,
        };

        if supervisor.available {
            supervisor.discover().await;
        }

        supervisor
    }

    /// Create a detached window in `worktree_path` and start the agent in it.
    ///
    /// A caller that is re-materializing a persisted session passes its
    /// stored sid so the window name stays stable; otherwise a fresh sid is
    /// generated.
    pub async fn create(&self, worktree_path: &Path, sid: Option<&str>) -> Result<TerminalWindow> {
        self.require_available()?;

        let sid = sid.map_or_else(generate_sid, ToString::to_string);
        let name = window_name(&sid);
        let cwd = worktree_path.to_string_lossy();

        self.tmux(&["new-session", "-d", "-s", &name, "-c", &cwd])
            .await?;

        // Type the agent invocation and submit it
        let agent = escape_send_text(&self.agent_cmd);
        self.tmux(&["send-keys", "-t", &name, "-l", &agent]).await?;
        self.tmux(&["send-keys", "-t", &name, "Enter"]).await?;
        self.tmux(&["set-option", "-t", &name, "mouse", "on"])
            .await?;

        let now = Utc::now();
        let window = TerminalWindow {
            sid: sid.clone(),
            window_name: name.clone(),
            worktree_path: worktree_path.to_path_buf(),
            created_at: now,
            last_activity: now,
            state: WindowState::Running,
        };
        self.windows.insert(sid.clone(), window.clone());

        tracing::info!(sid, window = %name, cwd = %cwd, "Created terminal window");
        let _ = self.events.send(ServerEvent::WindowCreated {
            sid,
            window_name: name,
        });

        Ok(window)
    }

    /// Enumerate external `ccm-*` windows and reconstruct their records.
    ///
    /// Called at construction so windows from a previous orchestrator run
    /// stay reachable. The working directory is recovered best effort; a
    /// window whose directory is gone is recorded with an empty path.
    async fn discover(&self) {
        let output = match self
            .tmux(&["list-sessions", "-F", "#{session_name}"])
            .await
        {
            Ok(output) => output,
            Err(_) => return, // no server running means no windows
        };

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            let Some(sid) = sid_from_window(line.trim()) else {
                continue;
            };
            let name = line.trim().to_string();

            let cwd = match self
                .tmux(&["display-message", "-p", "-t", &name, "#{pane_current_path}"])
                .await
            {
                Ok(out) => {
                    let path = String::from_utf8_lossy(&out.stdout).trim().to_string();
                    if Path::new(&path).is_dir() {
                        PathBuf::from(path)
                    } else {
                        PathBuf::new()
                    }
                }
                Err(_) => PathBuf::new(),
            };

            let _ = self.tmux(&["set-option", "-t", &name, "mouse", "on"]).await;

            let now = Utc::now();
            tracing::info!(sid, window = %name, cwd = %cwd.display(), "Discovered surviving window");
            self.windows.insert(
                sid.to_string(),
                TerminalWindow {
                    sid: sid.to_string(),
                    window_name: name,
                    worktree_path: cwd,
                    created_at: now,
                    last_activity: now,
                    state: WindowState::Running,
                },
            );
        }
    }

    /// Send literal text followed by a line terminator.
    pub async fn send_text(&self, sid: &str, text: &str) -> Result<()> {
        self.require_available()?;
        let name = self.window_name_of(sid)?;

        let escaped = escape_send_text(text);
        let result = self.tmux(&["send-keys", "-t", &name, "-l", &escaped]).await;
        if let Err(e) = result {
            self.mark_error(sid);
            return Err(self.missing_window_error(sid, e).await);
        }
        self.tmux(&["send-keys", "-t", &name, "Enter"]).await?;

        self.touch(sid);
        Ok(())
    }

    /// Send a special key from the allow-list.
    pub async fn send_key(&self, sid: &str, key: &str) -> Result<()> {
        self.require_available()?;
        if !ALLOWED_KEYS.contains(&key) {
            return Err(OrchestratorError::invalid(format!(
                "key not allowed: {key}"
            )));
        }
        let name = self.window_name_of(sid)?;

        // tmux names back-tab "BTab"
        let token = if key == "S-Tab" { "BTab" } else { key };
        if let Err(e) = self.tmux(&["send-keys", "-t", &name, token]).await {
            self.mark_error(sid);
            return Err(self.missing_window_error(sid, e).await);
        }

        self.touch(sid);
        Ok(())
    }

    /// Whether a window record exists for the sid
    #[must_use]
    pub fn exists(&self, sid: &str) -> bool {
        self.windows.contains_key(sid)
    }

    /// Look up a window by sid
    #[must_use]
    pub fn get(&self, sid: &str) -> Option<TerminalWindow> {
        self.windows.get(sid).map(|w| w.clone())
    }

    /// Look up a window by the worktree it was created in
    #[must_use]
    pub fn get_by_worktree(&self, path: &Path) -> Option<TerminalWindow> {
        if path.as_os_str().is_empty() {
            return None;
        }
        self.windows
            .iter()
            .find(|w| w.worktree_path == path)
            .map(|w| w.clone())
    }

    /// All window records
    #[must_use]
    pub fn all(&self) -> Vec<TerminalWindow> {
        self.windows.iter().map(|w| w.clone()).collect()
    }

    /// Kill the external window and drop its record.
    pub async fn kill(&self, sid: &str) -> Result<()> {
        self.require_available()?;
        let name = self.window_name_of(sid)?;

        if let Err(e) = self.tmux(&["kill-session", "-t", &name]).await {
            // The window may already be gone; dropping the record is still right
            tracing::warn!(sid, error = %e, "kill-session failed");
        }
        self.windows.remove(sid);

        tracing::info!(sid, window = %name, "Killed terminal window");
        let _ = self.events.send(ServerEvent::WindowStopped {
            sid: sid.to_string(),
        });
        Ok(())
    }

    /// Run one tmux command, surfacing stderr on failure.
    async fn tmux(&self, args: &[&str]) -> Result<Output> {
        let output = Command::new(&self.tmux_bin)
            .args(args)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    OrchestratorError::MultiplexerUnavailable {
                        hint: format!("{} is not installed", self.tmux_bin),
                    }
                } else {
                    OrchestratorError::Internal(e.into())
                }
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(OrchestratorError::Internal(anyhow::anyhow!(
                "tmux {} failed: {stderr}",
                args.first().unwrap_or(&"")
            )));
        }

        Ok(output)
    }

    fn require_available(&self) -> Result<()> {
        if self.available {
            Ok(())
        } else {
            Err(OrchestratorError::MultiplexerUnavailable {
                hint: format!("{} is not installed", self.tmux_bin),
            })
        }
    }

    fn window_name_of(&self, sid: &str) -> Result<String> {
        self.windows
            .get(sid)
            .map(|w| w.window_name.clone())
            .ok_or_else(|| OrchestratorError::session_not_found(sid))
    }

    fn touch(&self, sid: &str) {
        if let Some(mut window) = self.windows.get_mut(sid) {
            window.last_activity = Utc::now();
            window.state = WindowState::Running;
        }
    }

    fn mark_error(&self, sid: &str) {
        if let Some(mut window) = self.windows.get_mut(sid) {
            window.state = WindowState::Error;
        }
    }

    /// Distinguish "the window vanished" from other tmux failures.
    async fn missing_window_error(
        &self,
        sid: &str,
        original: OrchestratorError,
    ) -> OrchestratorError {
        let name = window_name(sid);
        match self.tmux(&["has-session", "-t", &name]).await {
            Ok(_) => original,
            Err(_) => OrchestratorError::session_not_found(sid),
        }
    }
}

#[async_trait::async_trait]
impl super::traits::TerminalControl for TerminalSupervisor {
    async fn create(&self, worktree_path: &Path, sid: Option<&str>) -> Result<TerminalWindow> {
        Self::create(self, worktree_path, sid).await
    }

    async fn send_text(&self, sid: &str, text: &str) -> Result<()> {
        Self::send_text(self, sid, text).await
    }

    async fn send_key(&self, sid: &str, key: &str) -> Result<()> {
        Self::send_key(self, sid, key).await
    }

    fn exists(&self, sid: &str) -> bool {
        Self::exists(self, sid)
    }

    fn get(&self, sid: &str) -> Option<TerminalWindow> {
        Self::get(self, sid)
    }

    fn get_by_worktree(&self, path: &Path) -> Option<TerminalWindow> {
        Self::get_by_worktree(self, path)
    }

    fn all(&self) -> Vec<TerminalWindow> {
        Self::all(self)
    }

    async fn kill(&self, sid: &str) -> Result<()> {
        Self::kill(self, sid).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast;

    fn bus() -> broadcast::Sender<ServerEvent> {
        broadcast::channel(16).0
    }

    #[tokio::test]
    async fn test_missing_binary_reports_unavailable() {
        let supervisor = TerminalSupervisor::new(
            "definitely-not-a-multiplexer".to_string(),
            "claude".to_string(),
            bus(),
        )
        .await;

        let err = supervisor
            .create(Path::new("/tmp"), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "MultiplexerUnavailable");

        let err = supervisor.send_text("abc", "ls").await.unwrap_err();
        assert_eq!(err.kind(), "MultiplexerUnavailable");
    }

    #[tokio::test]
    async fn test_send_key_rejects_unknown_keys() {
        let mut supervisor = TerminalSupervisor::new(
            "definitely-not-a-multiplexer".to_string(),
            "claude".to_string(),
            bus(),
        )
        .await;
        // Bypass the availability gate so the key check is reached
        supervisor.available = true;

        let err = supervisor.send_key("abc", "C-z").await.unwrap_err();
        assert_eq!(err.kind(), "InvalidArgument");
    }

    #[tokio::test]
    async fn test_lookup_on_empty_supervisor() {
        let supervisor = TerminalSupervisor::new(
            "definitely-not-a-multiplexer".to_string(),
            "claude".to_string(),
            bus(),
        )
        .await;

        assert!(!supervisor.exists("nope"));
        assert!(supervisor.get("nope").is_none());
        assert!(supervisor.all().is_empty());
        assert!(
            supervisor
                .get_by_worktree(Path::new("/tmp/r"))
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_get_by_worktree_ignores_empty_paths() {
        let supervisor = TerminalSupervisor::new(
            "definitely-not-a-multiplexer".to_string(),
            "claude".to_string(),
            bus(),
        )
        .await;
        // A discovered window whose cwd vanished is stored with an empty path
        supervisor.windows.insert(
            "orphan01".to_string(),
            TerminalWindow {
                sid: "orphan01".to_string(),
                window_name: window_name("orphan01"),
                worktree_path: PathBuf::new(),
                created_at: Utc::now(),
                last_activity: Utc::now(),
                state: WindowState::Running,
            },
        );

        assert!(supervisor.get_by_worktree(Path::new("")).is_none());
        assert!(supervisor.exists("orphan01"));
    }
}
