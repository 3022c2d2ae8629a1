//! Text-generation services the relay streams replies from.
//!
//! A [`StreamSource`] turns a transcript into a finite, non-restartable
//! stream of text fragments. The multiplexer invokes it exactly once per
//! generation.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chat_convo::Message;
use futures::Stream;
use thiserror::Error;

use crate::config::{SourceConfig, SourceKind};

mod echo;
mod openai;

pub use echo::EchoSource;
pub use openai::OpenAiSource;

pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, SourceError>> + Send>>;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("provider error: {0}")]
    Provider(String),

    #[error("undecodable response: {0}")]
    Decode(String),

    #[error("source misconfigured: {0}")]
    Config(String),
}

#[async_trait]
pub trait StreamSource: Send + Sync {
    /// Start generating a reply to `transcript` with `model`.
    async fn generate(&self, transcript: Vec<Message>, model: &str) -> Result<FragmentStream, SourceError>;
}

pub fn from_config(config: &SourceConfig) -> Result<Arc<dyn StreamSource>, SourceError> {
    Ok(match config.kind {
        SourceKind::Openai => Arc::new(OpenAiSource::new(config)?),
        SourceKind::Echo => Arc::new(EchoSource::new(config.echo_delay)),
    })
}
