use thiserror::Error;

pub type Result<T> = std::result::Result<T, ConvoError>;

#[derive(Debug, Error)]
pub enum ConvoError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SSE event name '{event}' does not match payload type '{payload}'")]
    EventMismatch { event: String, payload: String },
}
