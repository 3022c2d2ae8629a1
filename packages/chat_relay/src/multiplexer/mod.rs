//! Stream multiplexer: at most one generation per session, any number of
//! consumers attached to it.
//!
//! The registry maps a session id to its running [`Generation`]. Creating a
//! generation is a check-and-set under the registry lock, so racing submits
//! for the same session end up attached to one Stream Source invocation.
//! Each generation runs in its own task and outlives the connection that
//! started it; consumers hold a [`StreamHandle`] and may come and go.

use std::collections::HashMap;
use std::sync::Arc;

use chat_convo::{
    ActiveGeneration, GenerationErrorKind, Message, MessageRole, Session, StreamEvent, awaiting_reply,
};
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ChatConfig;
use crate::error::ChatError;
use crate::metrics::ServerMetrics;
use crate::source::StreamSource;
use crate::store::SessionStore;

mod generation;
mod handle;
mod replay_buffer;

use generation::Generation;
pub use handle::StreamHandle;
use replay_buffer::ReplayBuffer;

pub(crate) struct Inner {
    registry: Mutex<HashMap<String, Arc<Generation>>>,
    pub(crate) store: Arc<dyn SessionStore>,
    pub(crate) source: Arc<dyn StreamSource>,
    pub(crate) config: ChatConfig,
    pub(crate) metrics: Arc<ServerMetrics>,
}

impl Inner {
    /// Drop `generation` from the registry unless it was already replaced.
    pub(crate) async fn remove(&self, generation: &Arc<Generation>) {
        let mut registry = self.registry.lock().await;
        if registry
            .get(&generation.session_id)
            .is_some_and(|current| Arc::ptr_eq(current, generation))
        {
            registry.remove(&generation.session_id);
        }
    }
}

enum Slot {
    Existing(Arc<Generation>),
    Created(Arc<Generation>, Session),
}

#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<Inner>,
}

impl Multiplexer {
    pub fn new(
        store: Arc<dyn SessionStore>,
        source: Arc<dyn StreamSource>,
        config: ChatConfig,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(HashMap::new()),
                store,
                source,
                config,
                metrics,
            }),
        }
    }

    /// Start a generation answering `user_message`, or attach to the one
    /// already running for the session.
    ///
    /// Only the caller that creates the generation persists `user_message`
    /// and invokes the Stream Source; an attached caller's message is dropped.
    pub async fn start_or_attach(
        &self,
        session_id: &str,
        user_id: &str,
        user_message: Message,
        model: &str,
    ) -> Result<StreamHandle, ChatError> {
        if user_message.role != MessageRole::User {
            return Err(ChatError::BadRequest("last message must be a user message".into()));
        }
        if !user_message.is_final() {
            return Err(ChatError::BadRequest("user message must be final".into()));
        }
        let mut user_message = match user_message.model {
            Some(_) => user_message,
            None => user_message.with_model(model),
        };
        // The daily limit counts stored timestamps, so the relay's clock wins.
        user_message.created_at = Utc::now();

        let title = chat_convo::derive_title(std::slice::from_ref(&user_message));
        let session = self
            .inner
            .store
            .ensure_session(session_id, user_id, title.as_deref())
            .await?;
        if session.user_id != user_id {
            return Err(ChatError::Forbidden);
        }

        let already_answered =
            session.contains(&user_message.id) && !awaiting_reply(&session.messages);

        // Cheap path: attach without touching the rate limit.
        if let Some(existing) = self.live(session_id).await {
            return Ok(self.attach_to(existing, Some(0)).await);
        }

        if !already_answered {
            self.check_rate_limit(user_id).await?;
        }

        let slot = {
            let mut registry = self.inner.registry.lock().await;
            let existing = registry.get(session_id).cloned();
            match existing {
                Some(existing) if !existing.is_finished().await => Slot::Existing(existing),
                existing => {
                    // A generation that finished before the lock was taken has
                    // already stored its reply, so a fresh read sees it.
                    let current = self
                        .inner
                        .store
                        .get(session_id)
                        .await?
                        .unwrap_or(session);
                    let answered =
                        current.contains(&user_message.id) && !awaiting_reply(&current.messages);
                    match existing {
                        Some(existing) if answered => Slot::Existing(existing),
                        _ if answered => {
                            return Err(ChatError::Conflict("message has already been answered".into()));
                        }
                        _ => {
                            let generation = Arc::new(Generation::new(
                                session_id,
                                model,
                                ReplayBuffer::with_limits(
                                    self.inner.config.replay_max_entries,
                                    self.inner.config.replay_max_age,
                                ),
                                self.inner.config.broadcast_capacity,
                            ));
                            registry.insert(session_id.to_string(), generation.clone());
                            Slot::Created(generation, current)
                        }
                    }
                }
            }
        };

        let (generation, session) = match slot {
            Slot::Existing(existing) => return Ok(self.attach_to(existing, Some(0)).await),
            Slot::Created(generation, session) => (generation, session),
        };

        if let Err(e) = self.prepare(&generation, &user_message).await {
            generation
                .finish(StreamEvent::Error {
                    message: "failed to start generation".to_string(),
                    kind: GenerationErrorKind::Internal,
                })
                .await;
            self.inner.remove(&generation).await;
            return Err(ChatError::Internal(e));
        }

        let mut transcript = session.messages;
        if !transcript.iter().any(|m| m.id == user_message.id) {
            transcript.push(user_message);
        }

        self.inner.metrics.generation_started();
        let handle =
            StreamHandle::subscribe(generation.clone(), Some(0), self.inner.metrics.clone()).await;

        info!(
            session_id,
            generation_id = %generation.generation_id,
            model,
            messages = transcript.len(),
            "Generation started"
        );
        tokio::spawn(generation::run(self.inner.clone(), generation, transcript));

        Ok(handle)
    }

    /// Attach to the session's generation. `None` means nothing to resume.
    pub async fn attach(&self, session_id: &str, after: Option<u64>) -> Option<StreamHandle> {
        let generation = self.inner.registry.lock().await.get(session_id).cloned();
        match generation {
            Some(generation) => Some(self.attach_to(generation, after).await),
            None => {
                debug!(session_id, "Nothing to resume");
                self.inner.metrics.empty_resume();
                None
            }
        }
    }

    /// Cancel the running generation. Returns `false` if none was running.
    pub async fn cancel(&self, session_id: &str) -> bool {
        let Some(generation) = self.live(session_id).await else {
            return false;
        };
        if generation.cancel.is_cancelled() {
            return false;
        }
        info!(session_id, generation_id = %generation.generation_id, "Cancelling generation");
        generation.cancel.cancel();
        true
    }

    /// Cancel every running generation (used on shutdown).
    pub async fn cancel_all(&self) -> usize {
        let generations: Vec<_> = self.inner.registry.lock().await.values().cloned().collect();
        let mut cancelled = 0;
        for generation in generations {
            if !generation.is_finished().await && !generation.cancel.is_cancelled() {
                generation.cancel.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    /// The live generation for a session, if one is running.
    pub async fn active(&self, session_id: &str) -> Option<ActiveGeneration> {
        let generation = self.live(session_id).await?;
        Some(generation.snapshot().await)
    }

    /// Number of generations still running.
    pub async fn active_count(&self) -> usize {
        let generations: Vec<_> = self.inner.registry.lock().await.values().cloned().collect();
        let mut count = 0;
        for generation in generations {
            if !generation.is_finished().await {
                count += 1;
            }
        }
        count
    }

    /// Delete a session unless a generation is running for it.
    ///
    /// Holds the registry lock across the delete, so no generation can be
    /// created for the session in between.
    pub async fn delete_session(&self, session_id: &str) -> Result<bool, ChatError> {
        let registry = self.inner.registry.lock().await;
        if let Some(generation) = registry.get(session_id) {
            if !generation.is_finished().await {
                return Err(ChatError::Conflict(
                    "a reply is still streaming; cancel it first".into(),
                ));
            }
        }
        let deleted = self.inner.store.delete_session(session_id).await?;
        drop(registry);
        if deleted {
            info!(session_id, "Session deleted");
        }
        Ok(deleted)
    }

    /// Clear resume tokens left behind by a previous process. Generations do
    /// not survive a restart, so every stored token is an orphan.
    pub async fn recover_orphans(&self) -> anyhow::Result<u64> {
        let cleared = self.inner.store.clear_orphaned_generations().await?;
        if cleared > 0 {
            warn!(cleared, "Cleared resume tokens orphaned by a previous run");
        }
        Ok(cleared)
    }

    async fn live(&self, session_id: &str) -> Option<Arc<Generation>> {
        let generation = self.inner.registry.lock().await.get(session_id).cloned()?;
        if generation.is_finished().await {
            None
        } else {
            Some(generation)
        }
    }

    async fn attach_to(&self, generation: Arc<Generation>, after: Option<u64>) -> StreamHandle {
        self.inner.metrics.attached();
        debug!(
            session_id = %generation.session_id,
            generation_id = %generation.generation_id,
            ?after,
            "Consumer attached"
        );
        StreamHandle::subscribe(generation, after, self.inner.metrics.clone()).await
    }

    async fn check_rate_limit(&self, user_id: &str) -> Result<(), ChatError> {
        let Some(limit) = self.inner.config.max_messages_per_day else {
            return Ok(());
        };
        let since = Utc::now() - chrono::Duration::hours(24);
        let sent = self
            .inner
            .store
            .count_user_messages_since(user_id, since)
            .await?;
        if sent >= i64::from(limit) {
            self.inner.metrics.rate_limit_hit();
            info!(user_id, sent, limit, "Daily message limit reached");
            return Err(ChatError::RateLimited { limit });
        }
        Ok(())
    }

    /// Persist the user message and record the resume token.
    async fn prepare(&self, generation: &Generation, user_message: &Message) -> anyhow::Result<()> {
        self.inner
            .store
            .append_final_message(&generation.session_id, user_message)
            .await?;
        self.inner
            .store
            .set_active_generation(&generation.snapshot().await)
            .await?;
        Ok(())
    }
}
