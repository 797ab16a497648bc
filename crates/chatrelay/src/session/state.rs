//! Session state and its store-backed manager.

use anyhow::Result;
use chatrelay_protocol::{Message, Role, SessionSnapshot};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use crate::store::SessionStore;

/// In-memory state of one conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    /// Model used for the next generation.
    pub model: String,
    /// Insertion-ordered mirror of the persisted log.
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    /// Refreshed on every mutation. Nothing evicts on it yet.
    pub expires_at: DateTime<Utc>,
}

impl SessionState {
    fn new(model: String, ttl: TimeDelta) -> Self {
        let now = Utc::now();
        Self {
            model,
            messages: Vec::new(),
            created_at: now,
            expires_at: now + ttl,
        }
    }
}

/// Read-only view of a session for inspection endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub model: String,
    pub messages: Vec<Message>,
    pub message_count: usize,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Owns one session's [`SessionState`] and keeps it in step with the store.
///
/// Not shareable: exactly one relay task holds the manager for a session,
/// which is what serializes all mutations.
pub struct SessionStateManager {
    session_id: String,
    store: Arc<dyn SessionStore>,
    ttl: TimeDelta,
    state: SessionState,
}

impl SessionStateManager {
    pub fn new(
        session_id: impl Into<String>,
        store: Arc<dyn SessionStore>,
        default_model: impl Into<String>,
        ttl: TimeDelta,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            store,
            ttl,
            state: SessionState::new(default_model.into(), ttl),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn model(&self) -> &str {
        &self.state.model
    }

    /// Load the persisted log if memory holds no messages yet.
    ///
    /// Returns whether the store was read. Calling it again once messages
    /// are present is a no-op.
    pub async fn hydrate(&mut self) -> Result<bool> {
        if !self.state.messages.is_empty() {
            return Ok(false);
        }

        let messages = self
            .store
            .select_all_ordered_by_time(&self.session_id)
            .await?;
        debug!(
            session_id = %self.session_id,
            count = messages.len(),
            "hydrated session from store"
        );
        self.state.messages = messages;
        self.touch();
        Ok(true)
    }

    /// Persist a new message, then append it to memory.
    pub async fn append_message(
        &mut self,
        role: Role,
        content: impl Into<String>,
    ) -> Result<&Message> {
        let message = Message::new(role, content, self.next_timestamp());
        self.store
            .insert(
                &self.session_id,
                message.role,
                &message.content,
                message.timestamp,
            )
            .await?;

        self.state.messages.push(message);
        self.touch();
        Ok(&self.state.messages[self.state.messages.len() - 1])
    }

    /// Switch the active model. Kept in memory only.
    pub fn set_model(&mut self, model: impl Into<String>) {
        self.state.model = model.into();
        self.touch();
    }

    /// Delete the persisted log and start a fresh state with the same model.
    ///
    /// Returns the number of rows removed from the store.
    pub async fn reset(&mut self) -> Result<u64> {
        let deleted = self.store.delete_all(&self.session_id).await?;
        self.state = SessionState::new(self.state.model.clone(), self.ttl);
        Ok(deleted)
    }

    /// The last `window` user/assistant messages, oldest first.
    pub fn recent_conversation(&self, window: usize) -> Vec<&Message> {
        let conversational: Vec<&Message> = self
            .state
            .messages
            .iter()
            .filter(|m| m.role.is_conversational())
            .collect();
        let skip = conversational.len().saturating_sub(window);
        conversational.into_iter().skip(skip).collect()
    }

    /// State as delivered to clients; tool rows are withheld.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            model: self.state.model.clone(),
            messages: self
                .state
                .messages
                .iter()
                .filter(|m| m.role.is_conversational())
                .cloned()
                .collect(),
        }
    }

    pub fn info(&self) -> SessionInfo {
        let snapshot = self.snapshot();
        SessionInfo {
            session_id: self.session_id.clone(),
            message_count: snapshot.messages.len(),
            model: snapshot.model,
            messages: snapshot.messages,
            created_at: self.state.created_at,
            expires_at: self.state.expires_at,
        }
    }

    fn touch(&mut self) {
        self.state.expires_at = Utc::now() + self.ttl;
    }

    /// Wall clock in ms, never earlier than the last message.
    fn next_timestamp(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        self.state
            .messages
            .last()
            .map_or(now, |last| now.max(last.timestamp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::store::SqliteSessionStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Wraps the SQLite store to count reads and inject write failures.
    struct InstrumentedStore {
        inner: SqliteSessionStore,
        selects: AtomicUsize,
        fail_writes: AtomicBool,
    }

    #[async_trait]
    impl SessionStore for InstrumentedStore {
        async fn ensure_schema(&self) -> Result<()> {
            self.inner.ensure_schema().await
        }

        async fn select_all_ordered_by_time(&self, session_id: &str) -> Result<Vec<Message>> {
            self.selects.fetch_add(1, Ordering::SeqCst);
            self.inner.select_all_ordered_by_time(session_id).await
        }

        async fn insert(
            &self,
            session_id: &str,
            role: Role,
            content: &str,
            timestamp: i64,
        ) -> Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                anyhow::bail!("disk full");
            }
            self.inner.insert(session_id, role, content, timestamp).await
        }

        async fn delete_all(&self, session_id: &str) -> Result<u64> {
            if self.fail_writes.load(Ordering::SeqCst) {
                anyhow::bail!("disk full");
            }
            self.inner.delete_all(session_id).await
        }
    }

    async fn instrumented_store() -> Arc<InstrumentedStore> {
        let db = Database::in_memory().await.unwrap();
        let inner = SqliteSessionStore::new(db.pool().clone());
        inner.ensure_schema().await.unwrap();
        Arc::new(InstrumentedStore {
            inner,
            selects: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
        })
    }

    fn manager(store: Arc<InstrumentedStore>) -> SessionStateManager {
        SessionStateManager::new("sess", store, "default-model", TimeDelta::hours(24))
    }

    #[tokio::test]
    async fn test_hydrate_is_idempotent_and_reads_once() {
        let store = instrumented_store().await;
        store.inner.insert("sess", Role::User, "a", 1).await.unwrap();
        store.inner.insert("sess", Role::Assistant, "b", 2).await.unwrap();

        let mut mgr = manager(store.clone());
        assert!(mgr.hydrate().await.unwrap());
        let first = mgr.state().messages.clone();

        assert!(!mgr.hydrate().await.unwrap());
        assert_eq!(mgr.state().messages, first);
        assert_eq!(store.selects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_append_matches_store_order() {
        let store = instrumented_store().await;
        let mut mgr = manager(store.clone());
        mgr.hydrate().await.unwrap();

        for (i, role) in [Role::User, Role::Assistant, Role::User, Role::Assistant]
            .into_iter()
            .enumerate()
        {
            mgr.append_message(role, format!("m{i}")).await.unwrap();
            let persisted = store.inner.select_all_ordered_by_time("sess").await.unwrap();
            assert_eq!(persisted, mgr.state().messages);
        }

        let stamps: Vec<_> = mgr.state().messages.iter().map(|m| m.timestamp).collect();
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_failed_write_leaves_memory_untouched() {
        let store = instrumented_store().await;
        let mut mgr = manager(store.clone());
        mgr.append_message(Role::User, "kept").await.unwrap();

        store.fail_writes.store(true, Ordering::SeqCst);
        assert!(mgr.append_message(Role::User, "lost").await.is_err());
        assert!(mgr.reset().await.is_err());

        assert_eq!(mgr.state().messages.len(), 1);
        assert_eq!(mgr.state().messages[0].content, "kept");
    }

    #[tokio::test]
    async fn test_reset_clears_and_is_repeatable() {
        let store = instrumented_store().await;
        let mut mgr = manager(store.clone());
        mgr.set_model("custom");
        mgr.append_message(Role::User, "hello").await.unwrap();

        assert_eq!(mgr.reset().await.unwrap(), 1);
        assert!(mgr.state().messages.is_empty());
        assert_eq!(mgr.model(), "custom");
        assert!(store.inner.select_all_ordered_by_time("sess").await.unwrap().is_empty());

        assert_eq!(mgr.reset().await.unwrap(), 0);
        assert!(mgr.state().messages.is_empty());
    }

    #[tokio::test]
    async fn test_mutations_refresh_expiry() {
        let store = instrumented_store().await;
        let mut mgr = manager(store);
        let before = mgr.state().expires_at;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        mgr.set_model("other");
        assert!(mgr.state().expires_at > before);
        assert!(mgr.state().expires_at - mgr.state().created_at >= TimeDelta::hours(24));
    }

    #[tokio::test]
    async fn test_recent_conversation_skips_tool_rows() {
        let store = instrumented_store().await;
        let mut mgr = manager(store);
        for i in 0..5 {
            mgr.append_message(Role::User, format!("u{i}")).await.unwrap();
            mgr.append_message(Role::Tool, format!("t{i}")).await.unwrap();
        }

        let recent: Vec<_> = mgr
            .recent_conversation(3)
            .into_iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(recent, vec!["u2", "u3", "u4"]);

        let snapshot = mgr.snapshot();
        assert_eq!(snapshot.messages.len(), 5);
        assert!(snapshot.messages.iter().all(|m| m.role == Role::User));
    }
}
