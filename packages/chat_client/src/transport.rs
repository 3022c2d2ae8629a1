//! HTTP/SSE transport to the relay.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chat_convo::{Message, SessionDetail, SseDecoder, StreamEvent};
use futures::Stream;
use futures::stream::{self, StreamExt};
use reqwest::{Client as ReqwestClient, Response, StatusCode, header};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ClientError, Result};
use crate::resume::Attach;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Live events from one chat stream.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    id: &'a str,
    model: &'a str,
    messages: &'a [Message],
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// Client for the relay's chat API.
#[derive(Debug, Clone)]
pub struct RelayClient {
    http: ReqwestClient,
    base_url: String,
    token: Option<String>,
}

impl RelayClient {
    pub fn new(base_url: &str) -> Result<Self> {
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ClientError::InvalidUrl(base_url.to_string()));
        }
        // No overall timeout: streams stay open as long as the generation runs.
        let http = ReqwestClient::builder()
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, self.url(path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Log in with a password and keep the issued token for later requests.
    pub async fn login(&mut self, username: &str, password: &str) -> Result<()> {
        let response = self
            .http
            .post(self.url("/api/auth/login"))
            .json(&LoginRequest { username, password })
            .send()
            .await?;
        let response = check_status(response).await?;
        let body: LoginResponse = response.json().await?;
        self.token = Some(body.token);
        Ok(())
    }

    /// Submit a transcript ending in a user message and stream the reply.
    ///
    /// If a generation is already running for the session the relay attaches
    /// this request to it instead of starting another.
    pub async fn send(&self, session_id: &str, model: &str, messages: &[Message]) -> Result<EventStream> {
        let response = self
            .request(reqwest::Method::POST, "/api/chat")
            .header(header::ACCEPT, "text/event-stream")
            .json(&ChatRequest {
                id: session_id,
                model,
                messages,
            })
            .send()
            .await?;
        let response = check_status(response).await?;
        Ok(event_stream(response.bytes_stream()))
    }

    /// Attach to the session's in-flight generation. `Ok(None)` when there is
    /// nothing to resume. `after` replays fragments with a higher sequence number.
    pub async fn resume(&self, session_id: &str, after: Option<u64>) -> Result<Option<EventStream>> {
        let mut request = self
            .request(reqwest::Method::GET, &format!("/api/chat/{session_id}/stream"))
            .header(header::ACCEPT, "text/event-stream");
        if let Some(after) = after {
            request = request.header("Last-Event-ID", after.to_string());
        }
        let response = request.send().await?;
        if response.status() == StatusCode::NO_CONTENT {
            debug!(session_id, "Relay reports nothing to resume");
            return Ok(None);
        }
        let response = check_status(response).await?;
        Ok(Some(event_stream(response.bytes_stream())))
    }

    /// Returns `false` when no generation was running.
    pub async fn cancel(&self, session_id: &str) -> Result<bool> {
        let response = self
            .request(reqwest::Method::POST, &format!("/api/chat/{session_id}/cancel"))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check_status(response).await?;
        Ok(true)
    }

    pub async fn session(&self, session_id: &str) -> Result<Option<SessionDetail>> {
        let response = self
            .request(reqwest::Method::GET, &format!("/api/sessions/{session_id}"))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response).await?;
        Ok(Some(response.json().await?))
    }
}

#[async_trait]
impl Attach for RelayClient {
    type Stream = EventStream;

    async fn attach(&self, session_id: &str, after: Option<u64>) -> Result<Option<EventStream>> {
        self.resume(session_id, after).await
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match status {
        StatusCode::UNAUTHORIZED => Err(ClientError::Unauthorized),
        StatusCode::TOO_MANY_REQUESTS => Err(ClientError::RateLimited),
        _ => {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&text)
                .map(|b| b.error)
                .unwrap_or(text);
            Err(ClientError::Status {
                status: status.as_u16(),
                message,
            })
        }
    }
}

/// Decode an event-stream body into [`StreamEvent`]s.
pub fn event_stream<S>(bytes: S) -> EventStream
where
    S: Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + 'static,
{
    let state = (Box::pin(bytes), SseDecoder::new(), false);
    Box::pin(stream::unfold(
        state,
        |(mut bytes, mut decoder, mut done)| async move {
            loop {
                if let Some(frame) = decoder.next_frame() {
                    let event = StreamEvent::from_sse(frame.event.as_deref(), &frame.data)
                        .map_err(ClientError::from);
                    return Some((event, (bytes, decoder, done)));
                }
                if done {
                    let frame = decoder.finish()?;
                    let event = StreamEvent::from_sse(frame.event.as_deref(), &frame.data)
                        .map_err(ClientError::from);
                    return Some((event, (bytes, decoder, done)));
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => decoder.push(&chunk),
                    Some(Err(e)) => {
                        done = true;
                        return Some((Err(ClientError::Http(e)), (bytes, decoder, done)));
                    }
                    None => done = true,
                }
            }
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(chunks: Vec<&'static str>) -> impl Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + 'static {
        stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from_static(c.as_bytes()))))
    }

    #[tokio::test]
    async fn decodes_events_across_chunks() {
        let mut events = event_stream(body(vec![
            "event: fragment\nid: 1\ndata: {\"type\":\"fragment\",\"seq\":1,",
            "\"delta\":\"Hel\"}\n\n: keep-alive\n\n",
            "event: fragment\nid: 2\ndata: {\"type\":\"fragment\",\"seq\":2,\"delta\":\"lo\"}\n\n",
        ]));

        let first = events.next().await.unwrap().unwrap();
        assert_eq!(first, StreamEvent::Fragment { seq: 1, delta: "Hel".into() });
        let second = events.next().await.unwrap().unwrap();
        assert_eq!(second.seq(), Some(2));
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn malformed_event_is_an_error_item() {
        let mut events = event_stream(body(vec!["event: fragment\ndata: nope\n\n"]));
        assert!(matches!(
            events.next().await,
            Some(Err(ClientError::Protocol(_)))
        ));
        assert!(events.next().await.is_none());
    }

    #[test]
    fn rejects_non_http_base_url() {
        assert!(matches!(
            RelayClient::new("localhost:8080"),
            Err(ClientError::InvalidUrl(_))
        ));
        let client = RelayClient::new("http://127.0.0.1:7777/").unwrap();
        assert_eq!(client.url("/health"), "http://127.0.0.1:7777/health");
    }
}
