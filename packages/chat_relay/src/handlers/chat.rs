use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use chat_convo::{Message, StreamEvent};
use futures::{Stream, stream};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::AppState;
use crate::auth::AuthUser;
use crate::error::ChatError;
use crate::metrics::ServerMetrics;
use crate::multiplexer::StreamHandle;
use crate::store::SessionStore;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub id: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Client transcript. Only the trailing user message is read, the stored
    /// transcript is authoritative for everything before it.
    pub messages: Vec<Message>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResumeQuery {
    pub after: Option<u64>,
}

/// Counts an open event stream for as long as the response body lives.
struct StreamGuard(Arc<ServerMetrics>);

impl StreamGuard {
    fn new(metrics: Arc<ServerMetrics>) -> Self {
        metrics.stream_opened();
        Self(metrics)
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0.stream_closed();
    }
}

fn to_sse(event: &StreamEvent) -> Result<Event, axum::Error> {
    let sse = Event::default().event(event.name());
    let sse = match event.seq() {
        Some(seq) => sse.id(seq.to_string()),
        None => sse,
    };
    sse.json_data(event)
}

/// Serve a consumer's handle as an event stream. The connection closing
/// drops the handle, which only detaches this consumer.
fn event_stream(handle: StreamHandle, state: &AppState) -> Response {
    let guard = StreamGuard::new(state.metrics.clone());
    let body = stream::unfold((handle, guard), |(mut handle, guard)| async move {
        loop {
            let event = handle.next().await?;
            match to_sse(&event) {
                Ok(sse) => return Some((Ok::<_, Infallible>(sse), (handle, guard))),
                Err(e) => warn!(session_id = handle.session_id(), "Dropping unencodable event: {}", e),
            }
        }
    });
    sse_response(body, state.chat_config.keep_alive)
}

fn sse_response<S>(body: S, keep_alive: Duration) -> Response
where
    S: Stream<Item = Result<Event, Infallible>> + Send + 'static,
{
    Sse::new(body)
        .keep_alive(KeepAlive::new().interval(keep_alive))
        .into_response()
}

/// Load the session and check it belongs to `user`. `Ok(None)` if it does not exist.
async fn owned_session(
    state: &AppState,
    session_id: &str,
    user: &AuthUser,
) -> Result<Option<chat_convo::Session>, ChatError> {
    match state.repository.get(session_id).await? {
        Some(session) if session.user_id != user.user_id => Err(ChatError::Forbidden),
        other => Ok(other),
    }
}

/// Cursor from `Last-Event-ID`, falling back to `?after=`.
fn resume_cursor(headers: &HeaderMap, query: &ResumeQuery) -> Option<u64> {
    headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .or(query.after)
}

/// POST /api/chat: submit a user message and stream the reply.
pub async fn submit_chat(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<ChatRequest>,
) -> Result<Response, ChatError> {
    if req.id.trim().is_empty() {
        return Err(ChatError::BadRequest("session id is required".into()));
    }
    let Some(user_message) = req.messages.into_iter().last() else {
        return Err(ChatError::BadRequest("messages must not be empty".into()));
    };
    let model = req
        .model
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| state.chat_config.default_model.clone());

    let handle = state
        .multiplexer
        .start_or_attach(&req.id, &user.user_id, user_message, &model)
        .await?;
    debug!(session_id = %req.id, generation_id = handle.generation_id(), "Streaming reply");

    Ok(event_stream(handle, &state))
}

/// GET /api/chat/{id}/stream: attach to the in-flight generation.
/// 204 when there is nothing to resume.
pub async fn resume_chat(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<ResumeQuery>,
    headers: HeaderMap,
    user: AuthUser,
) -> Result<Response, ChatError> {
    if owned_session(&state, &session_id, &user).await?.is_none() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    let after = resume_cursor(&headers, &query);
    match state.multiplexer.attach(&session_id, after).await {
        Some(handle) => Ok(event_stream(handle, &state)),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

/// POST /api/chat/{id}/cancel
pub async fn cancel_chat(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    user: AuthUser,
) -> Result<Response, ChatError> {
    if owned_session(&state, &session_id, &user).await?.is_none() {
        return Err(ChatError::NotFound(format!("session {session_id}")));
    }
    if state.multiplexer.cancel(&session_id).await {
        Ok((
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "cancelled": true })),
        )
            .into_response())
    } else {
        Err(ChatError::NotFound("active generation".into()))
    }
}
