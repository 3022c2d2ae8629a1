//! Session Store access contract.
//!
//! The multiplexer and HTTP handlers only ever talk to storage through this
//! trait; `ChatRepository` is the SQLite implementation.

use anyhow::Result;
use async_trait::async_trait;
pub use chat_convo::ActiveGeneration;
use chat_convo::{Message, Session, SessionSummary};
use chrono::{DateTime, Utc};

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, session_id: &str) -> Result<Option<Session>>;

    /// Create the session if it does not exist and return it. The returned
    /// session may belong to a different user; callers check ownership.
    async fn ensure_session(
        &self,
        session_id: &str,
        user_id: &str,
        title: Option<&str>,
    ) -> Result<Session>;

    /// Append a final message. Idempotent on message id; pending messages are rejected.
    async fn append_final_message(&self, session_id: &str, message: &Message) -> Result<()>;

    async fn get_active_generation(&self, session_id: &str) -> Result<Option<ActiveGeneration>>;

    async fn set_active_generation(&self, generation: &ActiveGeneration) -> Result<()>;

    /// Clear the resume token, but only if it still belongs to `generation_id`.
    async fn clear_active_generation(&self, session_id: &str, generation_id: &str) -> Result<()>;

    /// Drop every resume token. Called at startup: no generation survives a restart.
    async fn clear_orphaned_generations(&self) -> Result<u64>;

    async fn count_user_messages_since(&self, user_id: &str, since: DateTime<Utc>) -> Result<i64>;

    async fn list_sessions(&self, user_id: &str, limit: i64) -> Result<Vec<SessionSummary>>;

    async fn delete_session(&self, session_id: &str) -> Result<bool>;
}
