use chat_convo::{ConvoError, GenerationErrorKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("relay returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("not authenticated")]
    Unauthorized,

    #[error("daily message limit reached")]
    RateLimited,

    #[error("invalid base URL: {0}")]
    InvalidUrl(String),

    #[error("malformed stream event: {0}")]
    Protocol(#[from] ConvoError),

    /// The generation ended with an error event. The transcript is unchanged.
    #[error("generation failed ({kind:?}): {message}")]
    Generation {
        message: String,
        kind: GenerationErrorKind,
    },

    #[error("stream ended before the generation finished")]
    Interrupted,
}

pub type Result<T> = std::result::Result<T, ClientError>;
