use std::time::Duration;

use async_trait::async_trait;
use chat_convo::{Message, MessageRole};
use futures::stream::{self, StreamExt};

use super::{FragmentStream, SourceError, StreamSource};

/// Streams the last user message back, one word per fragment.
pub struct EchoSource {
    delay: Duration,
}

impl EchoSource {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

fn words(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for (i, word) in text.split_whitespace().enumerate() {
        if i == 0 {
            out.push(word.to_string());
        } else {
            out.push(format!(" {}", word));
        }
    }
    out
}

#[async_trait]
impl StreamSource for EchoSource {
    async fn generate(&self, transcript: Vec<Message>, _model: &str) -> Result<FragmentStream, SourceError> {
        let last_user = transcript
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.text())
            .unwrap_or_default();

        let delay = self.delay;
        let fragments = stream::iter(words(&last_user)).then(move |word| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok(word)
        });
        Ok(fragments.boxed())
    }
}
