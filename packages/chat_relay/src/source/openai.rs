use async_trait::async_trait;
use bytes::Bytes;
use chat_convo::{Message, SseDecoder};
use futures::Stream;
use futures::stream::{self, StreamExt};
use reqwest::Client as ReqwestClient;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{FragmentStream, SourceError, StreamSource};
use crate::config::SourceConfig;

/// OpenAI-compatible `chat/completions` streaming source.
pub struct OpenAiSource {
    client: ReqwestClient,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    stream: bool,
    messages: Vec<WireMessage>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<ChunkError>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkError {
    message: String,
}

impl OpenAiSource {
    pub fn new(config: &SourceConfig) -> Result<Self, SourceError> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| SourceError::Config("API key environment variable is not set".into()))?;
        // Per read, not per body; stalled streams are the multiplexer's to end.
        let client = ReqwestClient::builder()
            .connect_timeout(config.request_timeout)
            .read_timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            api_key,
        })
    }
}

#[async_trait]
impl StreamSource for OpenAiSource {
    async fn generate(&self, transcript: Vec<Message>, model: &str) -> Result<FragmentStream, SourceError> {
        let messages = transcript
            .iter()
            .map(|m| WireMessage {
                role: m.role.as_str(),
                content: m.text(),
            })
            .collect();
        let body = CompletionRequest {
            model,
            stream: true,
            messages,
        };

        debug!(model, messages = transcript.len(), "Requesting completion stream");
        let response = self
            .client
            .post(format!("{}chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(fragments(response.bytes_stream()))
    }
}

enum Step {
    Fragment(String),
    Skip,
    Done,
}

fn parse_chunk(data: &str) -> Result<Step, SourceError> {
    if data.trim() == "[DONE]" {
        return Ok(Step::Done);
    }
    let chunk: CompletionChunk =
        serde_json::from_str(data).map_err(|e| SourceError::Decode(e.to_string()))?;
    if let Some(err) = chunk.error {
        return Err(SourceError::Provider(err.message));
    }
    let text: String = chunk
        .choices
        .into_iter()
        .filter_map(|c| c.delta.content)
        .collect();
    if text.is_empty() {
        Ok(Step::Skip)
    } else {
        Ok(Step::Fragment(text))
    }
}

/// Turn the provider's event-stream body into text fragments. Ends at `[DONE]`
/// or at the end of the body, and after the first error.
fn fragments<S>(bytes: S) -> FragmentStream
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    let state = (Box::pin(bytes), SseDecoder::new(), false);
    stream::unfold(state, |(mut bytes, mut decoder, mut finished)| async move {
        loop {
            if finished {
                return None;
            }
            let frame = match decoder.next_frame() {
                Some(frame) => frame,
                None => match bytes.next().await {
                    Some(Ok(chunk)) => {
                        decoder.push(&chunk);
                        continue;
                    }
                    Some(Err(e)) => {
                        return Some((Err(SourceError::Http(e)), (bytes, decoder, true)));
                    }
                    None => match decoder.finish() {
                        Some(frame) => {
                            finished = true;
                            frame
                        }
                        None => return None,
                    },
                },
            };
            match parse_chunk(&frame.data) {
                Ok(Step::Fragment(text)) => return Some((Ok(text), (bytes, decoder, finished))),
                Ok(Step::Skip) => continue,
                Ok(Step::Done) => return None,
                Err(e) => return Some((Err(e), (bytes, decoder, true))),
            }
        }
    })
    .boxed()
}
