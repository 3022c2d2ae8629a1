//! A mounted chat session: transcript, resume check and stream folding.

use chat_convo::{DataSignal, Message, StreamEvent};
use futures::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::error::{ClientError, Result};
use crate::reconciler::MessageReconciler;
use crate::resume::{Attach, ResumeCoordinator, ResumeOutcome};
use crate::transport::RelayClient;

/// The assistant reply currently being streamed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Draft {
    pub message_id: Option<String>,
    pub seq: u64,
    pub content: String,
}

pub struct ChatSession {
    session_id: String,
    model: String,
    reconciler: MessageReconciler,
    resume: ResumeCoordinator,
    draft: Option<Draft>,
}

impl ChatSession {
    pub fn new(
        session_id: impl Into<String>,
        model: impl Into<String>,
        initial_messages: Vec<Message>,
        auto_resume: bool,
    ) -> Self {
        let session_id = session_id.into();
        Self {
            resume: ResumeCoordinator::new(session_id.clone(), auto_resume),
            session_id,
            model: model.into(),
            reconciler: MessageReconciler::new(initial_messages),
            draft: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn transcript(&self) -> &[Message] {
        self.reconciler.transcript()
    }

    pub fn draft(&self) -> Option<&Draft> {
        self.draft.as_ref()
    }

    /// Run the one-shot resume check. When a generation was attached, the
    /// stream is driven to completion and the final message is returned.
    pub async fn mount<A, S>(&mut self, relay: &A, on_delta: impl FnMut(&str)) -> Result<Option<Message>>
    where
        A: Attach<Stream = S>,
        S: Stream<Item = Result<StreamEvent>> + Unpin,
    {
        let outcome = self.resume.on_mount(self.reconciler.transcript(), relay).await?;
        match outcome {
            ResumeOutcome::Attached(stream) => self.drive(stream, on_delta).await.map(Some),
            other => {
                debug!(session_id = %self.session_id, outcome = other.label(), "No stream to drive on mount");
                Ok(None)
            }
        }
    }

    /// Submit the transcript plus a new user message and drive the reply.
    ///
    /// The message joins the local transcript only once the relay accepts
    /// the request; a rejected submit leaves the transcript as it was.
    pub async fn submit(
        &mut self,
        client: &RelayClient,
        text: &str,
        on_delta: impl FnMut(&str),
    ) -> Result<Message> {
        let mut user = Message::user(text);
        if !self.model.is_empty() {
            user = user.with_model(self.model.clone());
        }
        let mut outgoing = self.reconciler.transcript().to_vec();
        outgoing.push(user.clone());
        let stream = client.send(&self.session_id, &self.model, &outgoing).await?;
        self.reconciler.push_local(user);
        self.drive(stream, on_delta).await
    }

    /// Fold a chat stream into this session.
    ///
    /// Fragments accumulate in the draft; `data` batches go through the
    /// reconciler. On an `error` event the draft is dropped, the transcript
    /// keeps its prior state, and [`ClientError::Generation`] is returned.
    pub async fn drive<S>(&mut self, mut stream: S, mut on_delta: impl FnMut(&str)) -> Result<Message>
    where
        S: Stream<Item = Result<StreamEvent>> + Unpin,
    {
        self.draft = Some(Draft::default());

        while let Some(event) = stream.next().await {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    self.draft = None;
                    return Err(e);
                }
            };

            match event {
                StreamEvent::Start {
                    message_id, seq, ..
                } => {
                    let draft = self.draft.get_or_insert_with(Draft::default);
                    draft.message_id = Some(message_id);
                    draft.seq = draft.seq.max(seq);
                }
                StreamEvent::Snapshot { seq, content } => {
                    let draft = self.draft.get_or_insert_with(Draft::default);
                    // Only the part the caller has not been shown yet
                    match content.strip_prefix(draft.content.as_str()) {
                        Some(tail) if !tail.is_empty() => on_delta(tail),
                        Some(_) => {}
                        None => on_delta(&content),
                    }
                    draft.seq = seq;
                    draft.content = content;
                }
                StreamEvent::Fragment { seq, delta } => {
                    let draft = self.draft.get_or_insert_with(Draft::default);
                    if seq <= draft.seq {
                        continue;
                    }
                    draft.seq = seq;
                    on_delta(&delta);
                    draft.content.push_str(&delta);
                }
                StreamEvent::Data { signals } => {
                    let terminal = final_message(&signals);
                    self.reconciler.apply(&signals);
                    if let Some(message) = terminal {
                        self.draft = None;
                        return Ok(message);
                    }
                }
                StreamEvent::Error { message, kind } => {
                    warn!(session_id = %self.session_id, ?kind, "Generation failed: {}", message);
                    self.draft = None;
                    return Err(ClientError::Generation { message, kind });
                }
            }
        }

        self.draft = None;
        Err(ClientError::Interrupted)
    }
}

fn final_message(signals: &[serde_json::Value]) -> Option<Message> {
    signals.iter().find_map(|raw| {
        serde_json::from_value::<DataSignal>(raw.clone())
            .ok()?
            .decode_message()?
            .ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chat_convo::GenerationErrorKind;
    use futures::stream::{self, BoxStream};

    fn start(seq: u64) -> Result<StreamEvent> {
        Ok(StreamEvent::Start {
            generation_id: "g".into(),
            session_id: "s".into(),
            message_id: "a-1".into(),
            model: "echo".into(),
            seq,
        })
    }

    fn fragment(seq: u64, delta: &str) -> Result<StreamEvent> {
        Ok(StreamEvent::Fragment {
            seq,
            delta: delta.into(),
        })
    }

    fn done(text: &str) -> Result<StreamEvent> {
        let reply = Message::assistant(text).with_id("a-1");
        Ok(StreamEvent::data(&[DataSignal::append_message(&reply).unwrap()]).unwrap())
    }

    struct Scripted(Vec<Result<StreamEvent>>);

    #[async_trait]
    impl Attach for std::sync::Mutex<Option<Scripted>> {
        type Stream = BoxStream<'static, Result<StreamEvent>>;

        async fn attach(&self, _session_id: &str, _after: Option<u64>) -> Result<Option<Self::Stream>> {
            let script = self.lock().unwrap().take();
            Ok(script.map(|s| stream::iter(s.0).boxed()))
        }
    }

    #[tokio::test]
    async fn drive_assembles_and_reconciles() {
        let mut session = ChatSession::new("s", "echo", vec![Message::user("hi")], true);
        let mut seen = String::new();

        let events = stream::iter(vec![start(0), fragment(1, "hel"), fragment(2, "lo"), done("hello")]);
        let reply = session.drive(events, |d| seen.push_str(d)).await.unwrap();

        assert_eq!(seen, "hello");
        assert_eq!(reply.id, "a-1");
        assert_eq!(session.transcript().len(), 2);
        assert!(session.draft().is_none());
    }

    #[tokio::test]
    async fn snapshot_after_lag_only_emits_unseen_text() {
        let mut session = ChatSession::new("s", "echo", vec![Message::user("hi")], true);
        let mut seen = String::new();

        let events = stream::iter(vec![
            start(0),
            fragment(1, "Hel"),
            Ok(StreamEvent::Snapshot {
                seq: 3,
                content: "Hello wo".into(),
            }),
            fragment(3, "wo"),
            fragment(4, "rld"),
            done("Hello world"),
        ]);
        let reply = session.drive(events, |d| seen.push_str(d)).await.unwrap();

        assert_eq!(seen, "Hello world");
        assert_eq!(reply.text(), "Hello world");
    }

    #[tokio::test]
    async fn rejected_submit_keeps_transcript() {
        // Nothing listens on port 1, so the request never reaches a relay
        let client = RelayClient::new("http://127.0.0.1:1").unwrap();
        let mut session = ChatSession::new("s", "echo", vec![Message::user("hi")], true);

        let err = session.submit(&client, "again", |_| {}).await.unwrap_err();

        assert!(!matches!(err, ClientError::Generation { .. }));
        assert_eq!(session.transcript().len(), 1);
        assert_eq!(session.transcript()[0].text(), "hi");
        assert!(session.draft().is_none());
    }

    #[tokio::test]
    async fn error_keeps_prior_transcript() {
        let mut session = ChatSession::new("s", "echo", vec![Message::user("hi")], true);

        let events = stream::iter(vec![
            start(0),
            fragment(1, "par"),
            Ok(StreamEvent::Error {
                message: "upstream closed".into(),
                kind: GenerationErrorKind::Source,
            }),
        ]);
        let err = session.drive(events, |_| {}).await.unwrap_err();

        assert!(matches!(err, ClientError::Generation { kind: GenerationErrorKind::Source, .. }));
        assert_eq!(session.transcript().len(), 1);
        assert!(session.draft().is_none());
    }

    #[tokio::test]
    async fn stream_ending_without_terminal_is_interrupted() {
        let mut session = ChatSession::new("s", "echo", vec![Message::user("hi")], true);
        let events = stream::iter(vec![start(0), fragment(1, "x")]);
        assert!(matches!(
            session.drive(events, |_| {}).await,
            Err(ClientError::Interrupted)
        ));
        assert_eq!(session.transcript().len(), 1);
    }

    #[tokio::test]
    async fn mount_resumes_mid_stream() {
        // Attached at seq 5: only later fragments arrive, then the full message
        let relay = std::sync::Mutex::new(Some(Scripted(vec![
            start(5),
            fragment(6, " world"),
            done("hello world"),
        ])));
        let mut session = ChatSession::new("s2", "echo", vec![Message::user("hi")], true);

        let reply = session.mount(&relay, |_| {}).await.unwrap().unwrap();
        assert_eq!(reply.text(), "hello world");
        assert_eq!(session.transcript().last().unwrap().text(), "hello world");

        // Second mount call is a no-op
        assert!(session.mount(&relay, |_| {}).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mount_with_nothing_to_resume_keeps_transcript() {
        let relay: std::sync::Mutex<Option<Scripted>> = std::sync::Mutex::new(None);
        let mut session = ChatSession::new("s1", "echo", vec![Message::user("hi")], true);

        assert!(session.mount(&relay, |_| {}).await.unwrap().is_none());
        assert_eq!(session.transcript().len(), 1);
        assert_eq!(session.transcript()[0].text(), "hi");
    }

    #[tokio::test]
    async fn duplicate_terminal_signal_after_reconcile_is_harmless() {
        let mut session = ChatSession::new("s", "echo", vec![Message::user("hi")], true);
        session
            .drive(stream::iter(vec![start(0), done("ok")]), |_| {})
            .await
            .unwrap();
        session
            .drive(stream::iter(vec![done("ok")]), |_| {})
            .await
            .unwrap();
        assert_eq!(session.transcript().len(), 2);
    }
}
