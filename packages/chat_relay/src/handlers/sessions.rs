use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chat_convo::{SessionDetail, SessionSummary};
use serde::Deserialize;

use crate::AppState;
use crate::auth::AuthUser;
use crate::error::ChatError;
use crate::store::SessionStore;

const DEFAULT_LIST_LIMIT: i64 = 50;
const MAX_LIST_LIMIT: i64 = 200;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
}

pub async fn list_sessions(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<SessionSummary>>, ChatError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);
    Ok(Json(state.repository.list_sessions(&user.user_id, limit).await?))
}

/// The stored transcript plus the live generation, if one is running.
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    user: AuthUser,
) -> Result<Json<SessionDetail>, ChatError> {
    let session = state
        .repository
        .get(&session_id)
        .await?
        .ok_or_else(|| ChatError::NotFound(format!("session {session_id}")))?;
    if session.user_id != user.user_id {
        return Err(ChatError::Forbidden);
    }

    let active_generation = state.multiplexer.active(&session_id).await;
    Ok(Json(SessionDetail {
        session,
        active_generation,
    }))
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    user: AuthUser,
) -> Result<StatusCode, ChatError> {
    let session = state
        .repository
        .get(&session_id)
        .await?
        .ok_or_else(|| ChatError::NotFound(format!("session {session_id}")))?;
    if session.user_id != user.user_id {
        return Err(ChatError::Forbidden);
    }
    state.multiplexer.delete_session(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
