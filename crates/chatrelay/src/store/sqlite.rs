//! SQLite implementation of [`SessionStore`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use chatrelay_protocol::{Message, Role};
use sqlx::FromRow;
use sqlx::sqlite::SqlitePool;

use super::SessionStore;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    role TEXT NOT NULL CHECK(role IN ('user', 'assistant', 'tool')),
    content TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_messages_session_ts ON messages(session_id, timestamp);
"#;

#[derive(Debug, FromRow)]
struct MessageRow {
    role: String,
    content: String,
    timestamp: i64,
}

impl TryFrom<MessageRow> for Message {
    type Error = anyhow::Error;

    fn try_from(row: MessageRow) -> Result<Self> {
        let role = row.role.parse::<Role>().map_err(anyhow::Error::msg)?;
        Ok(Message::new(role, row.content, row.timestamp))
    }
}

/// Session store backed by a shared SQLite pool.
#[derive(Debug, Clone)]
pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .context("initializing session store schema")?;
        Ok(())
    }

    async fn select_all_ordered_by_time(&self, session_id: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT role, content, timestamp
            FROM messages
            WHERE session_id = ?
            ORDER BY timestamp ASC, id ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("fetching messages for session {}", session_id))?;

        rows.into_iter()
            .map(Message::try_from)
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("decoding messages for session {}", session_id))
    }

    async fn insert(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
        timestamp: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO messages (session_id, role, content, timestamp)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(session_id)
        .bind(role.as_str())
        .bind(content)
        .bind(timestamp)
        .execute(&self.pool)
        .await
        .with_context(|| format!("inserting {} message for session {}", role, session_id))?;
        Ok(())
    }

    async fn delete_all(&self, session_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM messages WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("clearing messages for session {}", session_id))?;

        Ok(result.rows_affected())
    }
}
