//! Durable per-session message log.
//!
//! The relay only ever issues four operations against storage: create the
//! schema if absent, read a session's log in time order, append one row, and
//! truncate a session. Anything implementing [`SessionStore`] can back it.

mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use chatrelay_protocol::{Message, Role};

pub use sqlite::SqliteSessionStore;

/// Transactional message store keyed by session id.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create tables and indexes if they do not exist yet.
    async fn ensure_schema(&self) -> Result<()>;

    /// All rows of a session, oldest first. Rows with equal timestamps keep
    /// their insertion order.
    async fn select_all_ordered_by_time(&self, session_id: &str) -> Result<Vec<Message>>;

    /// Append one row.
    async fn insert(&self, session_id: &str, role: Role, content: &str, timestamp: i64)
    -> Result<()>;

    /// Remove every row of a session, returning how many were deleted.
    async fn delete_all(&self, session_id: &str) -> Result<u64>;
}
