//! In-memory terminal supervisor for tests.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::path::Path;
use std::sync::Mutex;
use tokio::sync::broadcast;

use crate::api::protocol::ServerEvent;
use crate::core::errors::{OrchestratorError, Result};
use crate::core::session::WindowState;
use crate::utils::{generate_sid, window_name};

use super::supervisor::TerminalWindow;
use super::traits::TerminalControl;

/// A terminal supervisor that keeps windows purely in memory.
///
/// Records every `send_text` payload so tests can assert on keystroke
/// traffic without a real multiplexer.
pub struct MockTerminal {
    windows: DashMap<String, TerminalWindow>,
    sent: Mutex<Vec<(String, String)>>,
    events: broadcast::Sender<ServerEvent>,
    /// When set, `create` fails with this kind
    pub fail_create: Mutex<bool>,
}

impl std::fmt::Debug for MockTerminal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTerminal")
            .field("windows", &self.windows.len())
            .finish_non_exhaustive()
    }
}

impl MockTerminal {
    /// Create an empty mock
    #[must_use]
    pub fn new(events: broadcast::Sender<ServerEvent>) -> Self {
        Self {
            windows: DashMap::new(),
            sent: Mutex::new(Vec::new()),
            events,
            fail_create: Mutex::new(false),
        }
    }

    /// Pre-seed a discovered window, as if it survived a restart
    pub fn seed_window(&self, sid: &str, worktree_path: &Path) {
        let now = Utc::now();
        self.windows.insert(
            sid.to_string(),
            TerminalWindow {
                sid: sid.to_string(),
                window_name: window_name(sid),
                worktree_path: worktree_path.to_path_buf(),
                created_at: now,
                last_activity: now,
                state: WindowState::Running,
            },
        );
    }

    /// Everything sent via `send_text`, in order
    pub fn sent_lines(&self) -> Vec<(String, String)> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl TerminalControl for MockTerminal {
    async fn create(&self, worktree_path: &Path, sid: Option<&str>) -> Result<TerminalWindow> {
        if self.fail_create.lock().is_ok_and(|f| *f) {
            return Err(OrchestratorError::MultiplexerUnavailable {
                hint: "mock failure".to_string(),
            });
        }

        let sid = sid.map_or_else(generate_sid, ToString::to_string);
        let now = Utc::now();
        let window = TerminalWindow {
            sid: sid.clone(),
            window_name: window_name(&sid),
            worktree_path: worktree_path.to_path_buf(),
            created_at: now,
            last_activity: now,
            state: WindowState::Running,
        };
        self.windows.insert(sid.clone(), window.clone());
        let _ = self.events.send(ServerEvent::WindowCreated {
            sid,
            window_name: window.window_name.clone(),
        });
        Ok(window)
    }

    async fn send_text(&self, sid: &str, text: &str) -> Result<()> {
        if !self.windows.contains_key(sid) {
            return Err(OrchestratorError::session_not_found(sid));
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((sid.to_string(), text.to_string()));
        }
        Ok(())
    }

    async fn send_key(&self, sid: &str, key: &str) -> Result<()> {
        if !self.windows.contains_key(sid) {
            return Err(OrchestratorError::session_not_found(sid));
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((sid.to_string(), format!("<key:{key}>")));
        }
        Ok(())
    }

    fn exists(&self, sid: &str) -> bool {
        self.windows.contains_key(sid)
    }

    fn get(&self, sid: &str) -> Option<TerminalWindow> {
        self.windows.get(sid).map(|w| w.clone())
    }

    fn get_by_worktree(&self, path: &Path) -> Option<TerminalWindow> {
        if path.as_os_str().is_empty() {
            return None;
        }
        self.windows
            .iter()
            .find(|w| w.worktree_path == path)
            .map(|w| w.clone())
    }

    fn all(&self) -> Vec<TerminalWindow> {
        self.windows.iter().map(|w| w.clone()).collect()
    }

    async fn kill(&self, sid: &str) -> Result<()> {
        self.windows.remove(sid);
        let _ = self.events.send(ServerEvent::WindowStopped {
            sid: sid.to_string(),
        });
        Ok(())
    }
}
