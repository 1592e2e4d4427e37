//! Session lifecycle orchestration.
//!
//! The orchestrator composes the terminal supervisor, the gateway
//! supervisor and the registry into one API. It keeps no session cache:
//! every `Session` handed out is a fresh projection of the supervisors'
//! state joined with the registry row.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, broadcast};

use crate::api::protocol::ServerEvent;
use crate::gateway::GatewayControl;
use crate::store::{Registry, SessionRow};
use crate::terminal::{TerminalControl, TerminalWindow};
use crate::utils::worktree_id;
use crate::worktree::validate::safe_path;

use super::errors::{OrchestratorError, Result};
use super::session::{Message, MessageKind, MessageRole, Session, SessionStatus, session_url};

/// Composes window, gateway and registry into the session lifecycle API.
pub struct SessionOrchestrator {
    terminal: Arc<dyn TerminalControl>,
    gateway: Arc<dyn GatewayControl>,
    registry: Arc<dyn Registry>,
    events: broadcast::Sender<ServerEvent>,
    /// Serializes start/restore/send/stop per session (and per worktree
    /// path while a session id is still being resolved). Slots are evicted
    /// when the last guard for a key drops, so historical sids and paths
    /// do not accumulate.
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for SessionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOrchestrator").finish_non_exhaustive()
    }
}

impl SessionOrchestrator {
    /// Build the orchestrator. The terminal supervisor has already run its
    /// window discovery; surviving windows become restorable immediately.
    pub fn new(
        terminal: Arc<dyn TerminalControl>,
        gateway: Arc<dyn GatewayControl>,
        registry: Arc<dyn Registry>,
        events: broadcast::Sender<ServerEvent>,
    ) -> Self {
        Self {
            terminal,
            gateway,
            registry,
            events,
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Log the join of discovered windows and persisted rows at startup.
    ///
    /// Emits nothing; discovered sessions surface through `all()` and
    /// become live again via `restore`.
    pub async fn recover(&self) {
        for window in self.terminal.all() {
            let row = self
                .registry
                .get_by_id(&window.sid)
                .await
                .ok()
                .flatten();
            tracing::info!(
                sid = %window.sid,
                worktree = %window.worktree_path.display(),
                has_row = row.is_some(),
                "Recovered surviving session window"
            );
        }
    }

    /// Start (or reattach) a session on a worktree.
    ///
    /// Idempotent per worktree path: a second start returns the same sid.
    pub async fn start(&self, _worktree_id: &str, worktree_path: &str) -> Result<Session> {
        let path = safe_path(worktree_path)?;
        let path_key = path.to_string_lossy().to_string();
        let _path_guard = self.lock(&format!("path:{path_key}")).await;

        let existing_row = self.registry.get_by_worktree_path(&path_key).await?;

        // Reuse a live window for the path; otherwise create one, keeping
        // the persisted sid when a row already exists
        let (window, created_here) = match self.terminal.get_by_worktree(&path) {
            Some(window) => (window, false),
            None => {
                let sid = existing_row.as_ref().map(|r| r.id.as_str());
                let window = self.terminal.create(&path, sid).await?;
                (window, true)
            }
        };

        let sid = window.sid.clone();
        let _sid_guard = self.lock(&sid).await;

        if self.gateway.get(&sid).is_none() {
            if let Err(e) = self.gateway.start(&sid, &window.window_name).await {
                // Only a window created by this very call is torn down;
                // reused windows are left alone
                if created_here {
                    let _ = self.terminal.kill(&sid).await;
                }
                return Err(e);
            }
        }

        self.upsert_row(&sid, &path_key, existing_row).await?;

        let session = self
            .project(&sid)
            .await?
            .ok_or_else(|| OrchestratorError::session_not_found(&sid))?;
        let _ = self.events.send(ServerEvent::SessionCreated {
            session: session.clone(),
        });
        Ok(session)
    }

    /// Restore a discovered window's session: restart the gateway if it is
    /// down. Returns `None` when no window exists for the path.
    pub async fn restore(&self, worktree_path: &str) -> Result<Option<Session>> {
        let path = safe_path(worktree_path)?;
        let path_key = path.to_string_lossy().to_string();
        let _path_guard = self.lock(&format!("path:{path_key}")).await;

        let Some(window) = self.terminal.get_by_worktree(&path) else {
            return Ok(None);
        };
        let sid = window.sid.clone();
        let _sid_guard = self.lock(&sid).await;

        if self.gateway.get(&sid).is_none() {
            self.gateway.start(&sid, &window.window_name).await?;
        }

        let existing_row = self.registry.get_by_worktree_path(&path_key).await?;
        self.upsert_row(&sid, &path_key, existing_row).await?;

        let session = self
            .project(&sid)
            .await?
            .ok_or_else(|| OrchestratorError::session_not_found(&sid))?;
        let _ = self.events.send(ServerEvent::SessionRestored {
            session: session.clone(),
        });
        Ok(Some(session))
    }

    /// Send literal text to a session's terminal and record it in the
    /// transcript.
    pub async fn send(&self, sid: &str, text: &str) -> Result<()> {
        let _guard = self.lock(sid).await;

        if let Err(e) = self.terminal.send_text(sid, text).await {
            self.mark_error_on_lost_window(sid, &e).await;
            return Err(e);
        }

        // Transcript write is best effort; a discovered window may have no row
        if let Err(e) = self
            .registry
            .add_message(sid, MessageRole::User, MessageKind::Text, text)
            .await
        {
            tracing::debug!(sid, error = %e, "Skipped transcript write");
        }
        let _ = self.registry.update_status(sid, SessionStatus::Active).await;

        self.emit_updated(sid).await;
        Ok(())
    }

    /// Send a special key to a session's terminal.
    pub async fn send_key(&self, sid: &str, key: &str) -> Result<()> {
        let _guard = self.lock(sid).await;

        if let Err(e) = self.terminal.send_key(sid, key).await {
            self.mark_error_on_lost_window(sid, &e).await;
            return Err(e);
        }
        let _ = self.registry.update_status(sid, SessionStatus::Active).await;
        Ok(())
    }

    /// Stop a session: gateway down, window killed, row marked stopped.
    ///
    /// Repeated stop is a no-op and emits nothing.
    pub async fn stop(&self, sid: &str) -> Result<()> {
        let _guard = self.lock(sid).await;

        let had_window = self.terminal.exists(sid);
        let had_gateway = self.gateway.get(sid).is_some();
        if !had_window && !had_gateway {
            return Ok(());
        }

        self.gateway.stop(sid).await?;
        if had_window {
            self.terminal.kill(sid).await?;
        }
        if let Err(e) = self.registry.update_status(sid, SessionStatus::Stopped).await {
            tracing::debug!(sid, error = %e, "No registry row to mark stopped");
        }

        let _ = self.events.send(ServerEvent::SessionStopped {
            sid: sid.to_string(),
        });
        Ok(())
    }

    /// Project a single session
    pub async fn get(&self, sid: &str) -> Result<Option<Session>> {
        self.project(sid).await
    }

    /// Project the session bound to a worktree path
    pub async fn get_by_worktree(&self, worktree_path: &str) -> Result<Option<Session>> {
        let path = safe_path(worktree_path)?;
        if let Some(window) = self.terminal.get_by_worktree(&path) {
            return self.project(&window.sid).await;
        }
        let path_key = path.to_string_lossy().to_string();
        match self.registry.get_by_worktree_path(&path_key).await? {
            Some(row) => self.project(&row.id).await,
            None => Ok(None),
        }
    }

    /// Project every known session: live windows plus persisted rows whose
    /// window is gone (stopped history).
    pub async fn all(&self) -> Result<Vec<Session>> {
        let mut sessions = Vec::new();
        let mut seen = std::collections::HashSet::new();

        for window in self.terminal.all() {
            if let Some(session) = self.project(&window.sid).await? {
                seen.insert(session.id.clone());
                sessions.push(session);
            }
        }
        for row in self.registry.list_all().await? {
            if seen.contains(&row.id) {
                continue;
            }
            if let Some(session) = self.project(&row.id).await? {
                sessions.push(session);
            }
        }

        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }

    /// Transcript of a session
    pub async fn messages_of(&self, sid: &str) -> Result<Vec<Message>> {
        self.registry.messages_of(sid).await
    }

    /// Shutdown path: stop all gateways. Windows are deliberately left
    /// running so the user's agent sessions survive the restart.
    pub async fn cleanup(&self) {
        self.gateway.cleanup().await;
    }

    /// Join window + gateway + row into the client-facing projection.
    async fn project(&self, sid: &str) -> Result<Option<Session>> {
        let window = self.terminal.get(sid);
        let row = self.registry.get_by_id(sid).await?;

        let Some(source) = window.as_ref().map(Source::Window).or(row
            .as_ref()
            .map(Source::Row))
        else {
            return Ok(None);
        };

        let gateway = self.gateway.get(sid);
        let status = match (&window, &row) {
            (Some(w), _) => w.state.session_status(),
            (None, Some(r)) => r.status,
            (None, None) => unreachable!("source guarantees one side"),
        };

        let (worktree_path, created_at) = match source {
            Source::Window(w) => (
                w.worktree_path.clone(),
                row.as_ref().map_or(w.created_at, |r| r.created_at),
            ),
            Source::Row(r) => (r.worktree_path.clone().into(), r.created_at),
        };

        let worktree_id = row.as_ref().map_or_else(
            || worktree_id(&worktree_path.to_string_lossy()),
            |r| r.worktree_id.clone(),
        );

        Ok(Some(Session {
            id: sid.to_string(),
            worktree_id,
            worktree_path,
            window_name: crate::utils::window_name(sid),
            gateway_port: gateway.map(|g| g.port),
            status,
            url: session_url(sid),
            created_at,
        }))
    }

    /// Insert or refresh the registry row for a started session.
    async fn upsert_row(
        &self,
        sid: &str,
        worktree_path: &str,
        existing: Option<SessionRow>,
    ) -> Result<()> {
        match existing {
            Some(row) if row.id == sid => {
                self.registry
                    .update_status(sid, SessionStatus::Active)
                    .await
            }
            Some(row) => {
                // The path's row points at a session whose window is gone
                // and whose sid could not be reused; replace it
                tracing::warn!(
                    old_sid = %row.id,
                    new_sid = sid,
                    worktree_path,
                    "Replacing stale session row"
                );
                self.registry.delete(&row.id).await?;
                self.insert_row(sid, worktree_path).await
            }
            None => self.insert_row(sid, worktree_path).await,
        }
    }

    async fn insert_row(&self, sid: &str, worktree_path: &str) -> Result<()> {
        let now = Utc::now();
        self.registry
            .create(&SessionRow {
                id: sid.to_string(),
                worktree_id: worktree_id(worktree_path),
                worktree_path: worktree_path.to_string(),
                status: SessionStatus::Active,
                created_at: now,
                updated_at: now,
            })
            .await
    }

    /// A keystroke against a vanished window marks the session `error`.
    async fn mark_error_on_lost_window(&self, sid: &str, err: &OrchestratorError) {
        if err.kind() == "NotFound" {
            let _ = self.registry.update_status(sid, SessionStatus::Error).await;
            let _ = self.events.send(ServerEvent::SessionError {
                sid: Some(sid.to_string()),
                kind: err.kind().to_string(),
                message: err.to_string(),
            });
        }
    }

    async fn emit_updated(&self, sid: &str) {
        if let Ok(Some(session)) = self.project(sid).await {
            let _ = self.events.send(ServerEvent::SessionUpdated { session });
        }
    }

    async fn lock(&self, key: &str) -> KeyedGuard {
        let entry = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = entry.lock_owned().await;
        KeyedGuard {
            key: key.to_string(),
            locks: Arc::clone(&self.locks),
            guard: Some(guard),
        }
    }
}

/// A held per-key lock that evicts its map slot on release.
///
/// The mutex guard is dropped first; the slot is then removed only when the
/// map holds the sole remaining reference, i.e. no other task holds the lock
/// or is waiting on it.
struct KeyedGuard {
    key: String,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

enum Source<'a> {
    Window(&'a TerminalWindow),
    Row(&'a SessionRow),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{MockGateway, PortAllocator};
    use crate::store::SqliteRegistry;
    use crate::terminal::MockTerminal;
    use tempfile::TempDir;

    async fn orchestrator() -> (TempDir, SessionOrchestrator) {
        let (events, _) = broadcast::channel(64);
        let tmp = TempDir::new().unwrap();
        let registry = Arc::new(
            SqliteRegistry::new(&tmp.path().join("sessions.db"))
                .await
                .unwrap(),
        );
        let terminal = Arc::new(MockTerminal::new(events.clone()));
        let ports = Arc::new(PortAllocator::new(19800, 19810));
        let gateway = Arc::new(MockGateway::new(ports, events.clone()));
        let orchestrator = SessionOrchestrator::new(terminal, gateway, registry, events);
        (tmp, orchestrator)
    }

    #[tokio::test]
    async fn test_lock_slot_lives_only_while_held() {
        let (_tmp, orchestrator) = orchestrator().await;

        let guard = orchestrator.lock("s1").await;
        assert_eq!(orchestrator.locks.len(), 1);

        drop(guard);
        assert!(orchestrator.locks.is_empty());
    }

    #[tokio::test]
    async fn test_lock_slot_survives_a_waiter() {
        let (_tmp, orchestrator) = orchestrator().await;
        let orchestrator = Arc::new(orchestrator);

        let first = orchestrator.lock("s1").await;
        let contender = {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move {
                let _second = orchestrator.lock("s1").await;
            })
        };

        // Give the contender time to queue on the slot, then release
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        drop(first);
        contender.await.unwrap();

        // Once both guards are gone the slot is reclaimed
        assert!(orchestrator.locks.is_empty());
    }

    #[tokio::test]
    async fn test_full_lifecycle_leaves_no_lock_slots() {
        let (_tmp, orchestrator) = orchestrator().await;
        let worktree = TempDir::new().unwrap();
        let path = worktree.path().to_string_lossy().to_string();

        let session = orchestrator.start("w1", &path).await.unwrap();
        orchestrator.send(&session.id, "ls").await.unwrap();
        orchestrator.send_key(&session.id, "Enter").await.unwrap();
        orchestrator.stop(&session.id).await.unwrap();

        // Neither the sid slot nor the path slot outlives its operation
        assert!(orchestrator.locks.is_empty());
    }
}
