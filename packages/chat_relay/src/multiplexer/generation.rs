//! One in-flight generation: its shared state and the task that drives it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chat_convo::{
    ActiveGeneration, DataSignal, GenerationErrorKind, Message, MessageContent, MessageRole,
    MessageStatus, StreamEvent,
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::Inner;
use super::replay_buffer::ReplayBuffer;
use crate::source::SourceError;

/// Stop reasons recorded on final assistant messages.
pub(crate) const STOP_COMPLETE: &str = "stop";
pub(crate) const STOP_CANCELLED: &str = "cancelled";

pub(crate) struct Generation {
    pub generation_id: String,
    pub session_id: String,
    pub message_id: String,
    pub model: String,
    pub started_at: DateTime<Utc>,
    pub(crate) state: Mutex<GenerationState>,
    pub(crate) cancel: CancellationToken,
}

/// Everything fragment publication and subscription must see atomically.
pub(crate) struct GenerationState {
    pub seq: u64,
    pub content: String,
    pub replay: ReplayBuffer,
    /// Set once; the last event of the generation.
    pub terminal: Option<StreamEvent>,
    pub tx: broadcast::Sender<StreamEvent>,
}

impl GenerationState {
    /// Events a consumer with cursor `after` has not seen yet, followed by the
    /// terminal event if the generation already ended.
    pub fn catch_up(&self, after: u64) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if after < self.seq {
            match self.replay.replay_since(after) {
                Some(fragments) => events.extend(fragments.into_iter().map(|(seq, delta)| {
                    StreamEvent::Fragment {
                        seq,
                        delta: delta.to_string(),
                    }
                })),
                None => events.push(StreamEvent::Snapshot {
                    seq: self.seq,
                    content: self.content.clone(),
                }),
            }
        }
        if let Some(terminal) = &self.terminal {
            events.push(terminal.clone());
        }
        events
    }
}

impl Generation {
    pub fn new(session_id: &str, model: &str, replay: ReplayBuffer, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            generation_id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            message_id: uuid::Uuid::new_v4().to_string(),
            model: model.to_string(),
            started_at: Utc::now(),
            state: Mutex::new(GenerationState {
                seq: 0,
                content: String::new(),
                replay,
                terminal: None,
                tx,
            }),
            cancel: CancellationToken::new(),
        }
    }

    pub async fn snapshot(&self) -> ActiveGeneration {
        let state = self.state.lock().await;
        ActiveGeneration {
            generation_id: self.generation_id.clone(),
            session_id: self.session_id.clone(),
            message_id: self.message_id.clone(),
            model: self.model.clone(),
            seq: state.seq,
            live: state.terminal.is_none(),
            started_at: self.started_at,
        }
    }

    pub fn start_event(&self, seq: u64) -> StreamEvent {
        StreamEvent::Start {
            generation_id: self.generation_id.clone(),
            session_id: self.session_id.clone(),
            message_id: self.message_id.clone(),
            model: self.model.clone(),
            seq,
        }
    }

    pub async fn is_finished(&self) -> bool {
        self.state.lock().await.terminal.is_some()
    }

    async fn publish(&self, delta: String) -> u64 {
        let mut state = self.state.lock().await;
        state.seq += 1;
        let seq = state.seq;
        state.content.push_str(&delta);
        state.replay.push(seq, &delta);
        // No receivers is fine: nobody may be attached right now.
        let _ = state.tx.send(StreamEvent::Fragment { seq, delta });
        seq
    }

    /// Record and broadcast the terminal event. Later calls are ignored.
    pub async fn finish(&self, event: StreamEvent) {
        let mut state = self.state.lock().await;
        if state.terminal.is_some() {
            return;
        }
        state.terminal = Some(event.clone());
        let _ = state.tx.send(event);
    }

    async fn content(&self) -> String {
        self.state.lock().await.content.clone()
    }

    fn final_message(&self, content: String, stop_reason: &str) -> Message {
        Message {
            id: self.message_id.clone(),
            role: MessageRole::Assistant,
            content: MessageContent::Text(content),
            model: Some(self.model.clone()),
            created_at: Utc::now(),
            status: MessageStatus::Final,
            stop_reason: Some(stop_reason.to_string()),
        }
    }
}

/// How the fragment loop ended.
enum Outcome {
    Completed,
    Cancelled,
    Stalled,
    Failed(SourceError),
}

/// Await `fut`, giving up after `limit` if one is set.
async fn within<F: Future>(limit: Option<Duration>, fut: F) -> Option<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}

/// Drive one generation to its terminal state. Runs as its own task, so
/// consumers coming and going never affect it.
pub(crate) async fn run(inner: Arc<Inner>, generation: Arc<Generation>, transcript: Vec<Message>) {
    let outcome = pull_fragments(&inner, &generation, transcript).await;
    complete(&inner, &generation, outcome).await;
    inner.remove(&generation).await;
}

async fn pull_fragments(inner: &Inner, generation: &Generation, transcript: Vec<Message>) -> Outcome {
    let stall = inner.config.stall_timeout;
    let cancel = &generation.cancel;

    let started = tokio::select! {
        _ = cancel.cancelled() => return Outcome::Cancelled,
        started = within(stall, inner.source.generate(transcript, &generation.model)) => started,
    };
    let mut fragments = match started {
        None => return Outcome::Stalled,
        Some(Err(e)) => return Outcome::Failed(e),
        Some(Ok(stream)) => stream,
    };

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Outcome::Cancelled,
            next = within(stall, fragments.next()) => next,
        };
        match next {
            None => return Outcome::Stalled,
            Some(None) => return Outcome::Completed,
            Some(Some(Err(e))) => return Outcome::Failed(e),
            Some(Some(Ok(delta))) => {
                if delta.is_empty() {
                    continue;
                }
                let seq = generation.publish(delta).await;
                debug!(session_id = %generation.session_id, seq, "Fragment published");
            }
        }
    }
}

/// Persist (or discard) the assembled reply, clear the resume token, and
/// emit the terminal event, in that order.
async fn complete(inner: &Inner, generation: &Generation, outcome: Outcome) {
    let session_id = generation.session_id.as_str();
    let generation_id = generation.generation_id.as_str();
    let content = generation.content().await;

    let terminal = match outcome {
        Outcome::Completed => {
            let event = persist_reply(inner, generation, content, STOP_COMPLETE).await;
            if !matches!(event, StreamEvent::Error { .. }) {
                inner.metrics.generation_completed();
                info!(session_id, generation_id, "Generation completed");
            }
            event
        }
        Outcome::Cancelled if !content.is_empty() => {
            let event = persist_reply(inner, generation, content, STOP_CANCELLED).await;
            if !matches!(event, StreamEvent::Error { .. }) {
                inner.metrics.generation_cancelled();
                info!(session_id, generation_id, "Generation cancelled, partial reply kept");
            }
            event
        }
        Outcome::Cancelled => {
            inner.metrics.generation_cancelled();
            info!(session_id, generation_id, "Generation cancelled before any content");
            StreamEvent::Error {
                message: "generation cancelled".to_string(),
                kind: GenerationErrorKind::Cancelled,
            }
        }
        Outcome::Stalled => {
            inner.metrics.generation_stalled();
            warn!(session_id, generation_id, "Generation stalled, giving up");
            StreamEvent::Error {
                message: "no progress from the model within the stall window".to_string(),
                kind: GenerationErrorKind::Stalled,
            }
        }
        Outcome::Failed(e) => {
            inner.metrics.generation_failed();
            warn!(session_id, generation_id, "Generation failed: {}", e);
            StreamEvent::Error {
                message: e.to_string(),
                kind: GenerationErrorKind::Source,
            }
        }
    };

    if let Err(e) = inner
        .store
        .clear_active_generation(session_id, generation_id)
        .await
    {
        warn!(session_id, generation_id, "Failed to clear resume token: {:#}", e);
    }

    generation.finish(terminal).await;
}

/// Store the final message once and build its `append-message` event. A
/// storage failure becomes an internal error event; nothing partial is kept.
async fn persist_reply(
    inner: &Inner,
    generation: &Generation,
    content: String,
    stop_reason: &str,
) -> StreamEvent {
    let message = generation.final_message(content, stop_reason);
    let stored = async {
        inner
            .store
            .append_final_message(&generation.session_id, &message)
            .await?;
        anyhow::Ok(StreamEvent::data(&[DataSignal::append_message(&message)?])?)
    }
    .await;

    match stored {
        Ok(event) => event,
        Err(e) => {
            error!(
                session_id = %generation.session_id,
                generation_id = %generation.generation_id,
                "Failed to persist reply: {:#}", e
            );
            inner.metrics.generation_failed();
            StreamEvent::Error {
                message: "failed to store the reply".to_string(),
                kind: GenerationErrorKind::Internal,
            }
        }
    }
}
