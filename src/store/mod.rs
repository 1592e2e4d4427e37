pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::core::errors::Result;
use crate::core::session::{Message, MessageKind, MessageRole, SessionStatus};

pub use sqlite::SqliteRegistry;

/// A persisted session row.
///
/// Distinct from the live [`crate::core::session::Session`] projection: the
/// row is what survives restarts, the projection is the join with the
/// supervisors' state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRow {
    /// Opaque 8-character session id
    pub id: String,

    /// Stable id derived from the worktree path
    pub worktree_id: String,

    /// Absolute worktree path; unique across rows
    pub worktree_path: String,

    /// Last persisted status
    pub status: SessionStatus,

    /// When the row was created
    pub created_at: DateTime<Utc>,

    /// When the row last changed
    pub updated_at: DateTime<Utc>,
}

/// Persistent registry of sessions and their transcripts.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Insert a new session row. Fails with `Conflict` when a row already
    /// exists for the worktree path.
    async fn create(&self, row: &SessionRow) -> Result<()>;

    /// Fetch a row by session id
    async fn get_by_id(&self, sid: &str) -> Result<Option<SessionRow>>;

    /// Fetch a row by worktree path (the restart-recovery pivot)
    async fn get_by_worktree_path(&self, path: &str) -> Result<Option<SessionRow>>;

    /// Update a session's status
    async fn update_status(&self, sid: &str, status: SessionStatus) -> Result<()>;

    /// Delete a session row; messages cascade
    async fn delete(&self, sid: &str) -> Result<()>;

    /// All rows
    async fn list_all(&self) -> Result<Vec<SessionRow>>;

    /// Append a transcript message
    async fn add_message(
        &self,
        sid: &str,
        role: MessageRole,
        kind: MessageKind,
        content: &str,
    ) -> Result<Message>;

    /// Transcript of a session, ordered by timestamp
    async fn messages_of(&self, sid: &str) -> Result<Vec<Message>>;

    /// Drop a session's transcript
    async fn clear_messages(&self, sid: &str) -> Result<()>;
}
