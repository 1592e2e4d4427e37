//! Trait seam for the terminal supervisor, enabling mock-backed tests.

use async_trait::async_trait;
use std::path::Path;

use crate::core::errors::Result;

use super::supervisor::TerminalWindow;

/// Window lifecycle operations the orchestrator depends on.
#[async_trait]
pub trait TerminalControl: Send + Sync {
    /// Create a detached window in `worktree_path`, optionally reusing a
    /// persisted sid
    async fn create(&self, worktree_path: &Path, sid: Option<&str>) -> Result<TerminalWindow>;

    /// Send literal text followed by a line terminator
    async fn send_text(&self, sid: &str, text: &str) -> Result<()>;

    /// Send an allow-listed special key
    async fn send_key(&self, sid: &str, key: &str) -> Result<()>;

    /// Whether a window record exists
    fn exists(&self, sid: &str) -> bool;

    /// Look up a window by sid
    fn get(&self, sid: &str) -> Option<TerminalWindow>;

    /// Look up a window by worktree path
    fn get_by_worktree(&self, path: &Path) -> Option<TerminalWindow>;

    /// All window records
    fn all(&self) -> Vec<TerminalWindow>;

    /// Kill the window and drop its record
    async fn kill(&self, sid: &str) -> Result<()>;
}
