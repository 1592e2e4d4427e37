use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

use crate::core::errors::{OrchestratorError, Result};
use crate::core::session::{Message, MessageKind, MessageRole, SessionStatus};

use super::{Registry, SessionRow};

/// Messages longer than this are truncated at insert
const MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// SQLite-backed session registry
pub struct SqliteRegistry {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteRegistry").finish_non_exhaustive()
    }
}

impl SqliteRegistry {
    /// Open (or create) the registry database at the given path.
    pub async fn new(db_path: &Path) -> anyhow::Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::from_str(&format!(
            "sqlite:{display}",
            display = db_path.display()
        ))?
        .create_if_missing(true)
        .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    /// Run database migrations
    async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            )
            ",
        )
        .execute(pool)
        .await?;

        let current_version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
                .fetch_optional(pool)
                .await?
                .flatten();

        let current_version = current_version.unwrap_or(0);

        if current_version < 1 {
            Self::migrate_to_v1(pool).await?;
        }

        Ok(())
    }

    /// Migration v1: sessions and messages tables
    async fn migrate_to_v1(pool: &SqlitePool) -> anyhow::Result<()> {
        tracing::info!("Applying migration v1: Initial schema");

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                worktree_id TEXT NOT NULL,
                worktree_path TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            ",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL
                    REFERENCES sessions(id) ON DELETE CASCADE,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                type TEXT NOT NULL,
                timestamp TEXT NOT NULL
            )
            ",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_session_id ON messages(session_id)",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sessions_worktree_path ON sessions(worktree_path)",
        )
        .execute(pool)
        .await?;

        let now = Utc::now();
        sqlx::query("INSERT OR REPLACE INTO schema_version (version, applied_at) VALUES (?, ?)")
            .bind(1)
            .bind(now.to_rfc3339())
            .execute(pool)
            .await?;

        tracing::info!("Migration v1 complete");
        Ok(())
    }

    fn row_to_session(row: &sqlx::sqlite::SqliteRow) -> Result<SessionRow> {
        let status: String = row.get("status");
        let created_at: String = row.get("created_at");
        let updated_at: String = row.get("updated_at");
        Ok(SessionRow {
            id: row.get("id"),
            worktree_id: row.get("worktree_id"),
            worktree_path: row.get("worktree_path"),
            status: SessionStatus::from_str(&status).map_err(OrchestratorError::Internal)?,
            created_at: parse_timestamp(&created_at)?,
            updated_at: parse_timestamp(&updated_at)?,
        })
    }

    fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<Message> {
        let role: String = row.get("role");
        let kind: String = row.get("type");
        let timestamp: String = row.get("timestamp");
        Ok(Message {
            id: row.get("id"),
            session_id: row.get("session_id"),
            role: MessageRole::from_str(&role).map_err(OrchestratorError::Internal)?,
            kind: MessageKind::from_str(&kind).map_err(OrchestratorError::Internal)?,
            content: row.get("content"),
            timestamp: parse_timestamp(&timestamp)?,
        })
    }
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| OrchestratorError::Internal(e.into()))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.message().contains("UNIQUE constraint failed"))
}

#[async_trait]
impl Registry for SqliteRegistry {
    async fn create(&self, row: &SessionRow) -> Result<()> {
        let result = sqlx::query(
            r"
            INSERT INTO sessions (id, worktree_id, worktree_path, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&row.id)
        .bind(&row.worktree_id)
        .bind(&row.worktree_path)
        .bind(row.status.as_str())
        .bind(row.created_at.to_rfc3339())
        .bind(row.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(OrchestratorError::Conflict {
                reason: format!("session already exists for {}", row.worktree_path),
            }),
            Err(e) => Err(OrchestratorError::Internal(e.into())),
        }
    }

    async fn get_by_id(&self, sid: &str) -> Result<Option<SessionRow>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?")
            .bind(sid)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| OrchestratorError::Internal(e.into()))?;

        row.as_ref().map(Self::row_to_session).transpose()
    }

    async fn get_by_worktree_path(&self, path: &str) -> Result<Option<SessionRow>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE worktree_path = ?")
            .bind(path)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| OrchestratorError::Internal(e.into()))?;

        row.as_ref().map(Self::row_to_session).transpose()
    }

    async fn update_status(&self, sid: &str, status: SessionStatus) -> Result<()> {
        let result = sqlx::query("UPDATE sessions SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(sid)
            .execute(&self.pool)
            .await
            .map_err(|e| OrchestratorError::Internal(e.into()))?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::session_not_found(sid));
        }
        Ok(())
    }

    async fn delete(&self, sid: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(sid)
            .execute(&self.pool)
            .await
            .map_err(|e| OrchestratorError::Internal(e.into()))?;
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<SessionRow>> {
        let rows = sqlx::query("SELECT * FROM sessions ORDER BY created_at")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| OrchestratorError::Internal(e.into()))?;

        rows.iter().map(Self::row_to_session).collect()
    }

    async fn add_message(
        &self,
        sid: &str,
        role: MessageRole,
        kind: MessageKind,
        content: &str,
    ) -> Result<Message> {
        // Clamp oversized payloads rather than reject them
        let content = if content.len() > MAX_MESSAGE_BYTES {
            let mut end = MAX_MESSAGE_BYTES;
            while !content.is_char_boundary(end) {
                end -= 1;
            }
            &content[..end]
        } else {
            content
        };

        let now = Utc::now();
        let result = sqlx::query(
            r"
            INSERT INTO messages (session_id, role, content, type, timestamp)
            VALUES (?, ?, ?, ?, ?)
            ",
        )
        .bind(sid)
        .bind(role.as_str())
        .bind(content)
        .bind(kind.as_str())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if matches!(&e, sqlx::Error::Database(db)
                if db.message().contains("FOREIGN KEY constraint failed"))
            {
                OrchestratorError::session_not_found(sid)
            } else {
                OrchestratorError::Internal(e.into())
            }
        })?;

        Ok(Message {
            id: result.last_insert_rowid(),
            session_id: sid.to_string(),
            role,
            kind,
            content: content.to_string(),
            timestamp: now,
        })
    }

    async fn messages_of(&self, sid: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE session_id = ? ORDER BY timestamp, id",
        )
        .bind(sid)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| OrchestratorError::Internal(e.into()))?;

        rows.iter().map(Self::row_to_message).collect()
    }

    async fn clear_messages(&self, sid: &str) -> Result<()> {
        sqlx::query("DELETE FROM messages WHERE session_id = ?")
            .bind(sid)
            .execute(&self.pool)
            .await
            .map_err(|e| OrchestratorError::Internal(e.into()))?;
        Ok(())
    }
}
