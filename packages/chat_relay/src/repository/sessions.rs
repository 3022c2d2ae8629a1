use anyhow::{Context, Result};
use async_trait::async_trait;
use chat_convo::{Message, MessageContent, MessageRole, MessageStatus, Session, SessionSummary};
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use super::ChatRepository;
use crate::store::{ActiveGeneration, SessionStore};

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn message_from_row(r: &SqliteRow) -> Result<Message> {
    let role: String = r.get("role");
    let content_json: String = r.get("content_json");
    let content: MessageContent = serde_json::from_str(&content_json)
        .with_context(|| format!("Corrupt content for message {}", r.get::<String, _>("id")))?;
    Ok(Message {
        id: r.get("id"),
        role: role
            .parse::<MessageRole>()
            .map_err(|e| anyhow::anyhow!(e))?,
        content,
        model: r.get("model"),
        created_at: from_millis(r.get("created_at")),
        status: MessageStatus::Final,
        stop_reason: r.get("stop_reason"),
    })
}

impl ChatRepository {
    async fn session_row(&self, session_id: &str) -> Result<Option<Session>> {
        let row = sqlx::query(
            "SELECT id, user_id, title, created_at, updated_at FROM sessions WHERE id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Session {
            id: r.get("id"),
            user_id: r.get("user_id"),
            title: r.get("title"),
            messages: Vec::new(),
            created_at: from_millis(r.get("created_at")),
            updated_at: from_millis(r.get("updated_at")),
        }))
    }

    pub async fn get_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT id, role, content_json, model, stop_reason, created_at
            FROM messages
            WHERE session_id = ?
            ORDER BY position ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(message_from_row).collect()
    }
}

#[async_trait]
impl SessionStore for ChatRepository {
    async fn get(&self, session_id: &str) -> Result<Option<Session>> {
        let Some(mut session) = self.session_row(session_id).await? else {
            return Ok(None);
        };
        session.messages = self.get_messages(session_id).await?;
        Ok(Some(session))
    }

    async fn ensure_session(
        &self,
        session_id: &str,
        user_id: &str,
        title: Option<&str>,
    ) -> Result<Session> {
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO sessions (id, user_id, title, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(session_id)
        .bind(user_id)
        .bind(title)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to create session")?;

        self.get(session_id)
            .await?
            .with_context(|| format!("Session {} vanished after insert", session_id))
    }

    async fn append_final_message(&self, session_id: &str, message: &Message) -> Result<()> {
        if !message.is_final() {
            anyhow::bail!("Refusing to persist pending message {}", message.id);
        }

        let content_json = serde_json::to_string(&message.content)?;
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO messages (id, session_id, role, content_json, model, stop_reason, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.id)
        .bind(session_id)
        .bind(message.role.as_str())
        .bind(&content_json)
        .bind(&message.model)
        .bind(&message.stop_reason)
        .bind(message.created_at.timestamp_millis())
        .execute(&mut *tx)
        .await
        .context("Failed to insert message")?;

        if result.rows_affected() > 0 {
            sqlx::query("UPDATE sessions SET updated_at = ? WHERE id = ?")
                .bind(Utc::now().timestamp_millis())
                .bind(session_id)
                .execute(&mut *tx)
                .await?;

            if message.role == MessageRole::User {
                let title = chat_convo::derive_title(std::slice::from_ref(message));
                sqlx::query("UPDATE sessions SET title = ? WHERE id = ? AND title IS NULL")
                    .bind(title)
                    .bind(session_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_active_generation(&self, session_id: &str) -> Result<Option<ActiveGeneration>> {
        let row = sqlx::query(
            r#"
            SELECT session_id, generation_id, message_id, model, started_at
            FROM active_generations
            WHERE session_id = ?
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| ActiveGeneration {
            generation_id: r.get("generation_id"),
            session_id: r.get("session_id"),
            message_id: r.get("message_id"),
            model: r.get("model"),
            seq: 0,
            live: false,
            started_at: from_millis(r.get("started_at")),
        }))
    }

    async fn set_active_generation(&self, generation: &ActiveGeneration) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO active_generations (session_id, generation_id, message_id, model, started_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&generation.session_id)
        .bind(&generation.generation_id)
        .bind(&generation.message_id)
        .bind(&generation.model)
        .bind(generation.started_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .context("Failed to record active generation")?;
        Ok(())
    }

    async fn clear_active_generation(&self, session_id: &str, generation_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM active_generations WHERE session_id = ? AND generation_id = ?")
            .bind(session_id)
            .bind(generation_id)
            .execute(&self.pool)
            .await
            .context("Failed to clear active generation")?;
        Ok(())
    }

    async fn clear_orphaned_generations(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM active_generations")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn count_user_messages_since(&self, user_id: &str, since: DateTime<Utc>) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM messages m
            JOIN sessions s ON s.id = m.session_id
            WHERE s.user_id = ? AND m.role = 'user' AND m.created_at >= ?
            "#,
        )
        .bind(user_id)
        .bind(since.timestamp_millis())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn list_sessions(&self, user_id: &str, limit: i64) -> Result<Vec<SessionSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT s.id, s.title, s.updated_at,
                   (SELECT COUNT(*) FROM messages m WHERE m.session_id = s.id) as message_count
            FROM sessions s
            WHERE s.user_id = ?
            ORDER BY s.updated_at DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| SessionSummary {
                id: r.get("id"),
                title: r.get("title"),
                message_count: r.get("message_count"),
                updated_at: from_millis(r.get("updated_at")),
            })
            .collect())
    }

    async fn delete_session(&self, session_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
