//! Folds `data` signal batches into a local transcript snapshot.

use std::collections::HashSet;

use chat_convo::{DataSignal, Message};
use serde_json::Value;
use tracing::debug;

/// Applies `append-message` signals to a transcript exactly once per message id.
#[derive(Debug, Clone)]
pub struct MessageReconciler {
    messages: Vec<Message>,
    seen: HashSet<String>,
}

impl MessageReconciler {
    pub fn new(snapshot: Vec<Message>) -> Self {
        let seen = snapshot.iter().map(|m| m.id.clone()).collect();
        Self {
            messages: snapshot,
            seen,
        }
    }

    /// Apply one batch of raw signals. Returns the new transcript when at
    /// least one message was appended, `None` otherwise.
    ///
    /// Malformed envelopes, undecodable messages and signal types other than
    /// `append-message` are skipped individually.
    pub fn apply(&mut self, batch: &[Value]) -> Option<&[Message]> {
        if batch.is_empty() {
            return None;
        }

        let mut changed = false;
        for raw in batch {
            let signal = match serde_json::from_value::<DataSignal>(raw.clone()) {
                Ok(signal) => signal,
                Err(e) => {
                    debug!(error = %e, "Skipping malformed data signal");
                    continue;
                }
            };
            let message = match signal.decode_message() {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    debug!(error = %e, "Skipping append-message with undecodable payload");
                    continue;
                }
                None => continue,
            };
            if self.seen.insert(message.id.clone()) {
                self.messages.push(message);
                changed = true;
            }
        }

        changed.then_some(self.messages.as_slice())
    }

    /// Append a locally originated message (e.g. the user's own submission).
    /// Returns `false` if a message with that id is already present.
    pub fn push_local(&mut self, message: Message) -> bool {
        if !self.seen.insert(message.id.clone()) {
            return false;
        }
        self.messages.push(message);
        true
    }

    pub fn transcript(&self) -> &[Message] {
        &self.messages
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.seen.contains(message_id)
    }

    pub fn into_transcript(self) -> Vec<Message> {
        self.messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn append(message: &Message) -> Value {
        serde_json::to_value(DataSignal::append_message(message).unwrap()).unwrap()
    }

    #[test]
    fn appends_carried_message() {
        let user = Message::user("hi");
        let reply = Message::assistant("hello").with_id("a-1");
        let mut r = MessageReconciler::new(vec![user.clone()]);

        let out = r.apply(&[append(&reply)]).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].id, user.id);
        assert_eq!(out[1].id, "a-1");
        assert_eq!(out[1].text(), "hello");
    }

    #[test]
    fn same_signal_twice_appends_once() {
        let reply = Message::assistant("hello").with_id("a-1");
        let mut r = MessageReconciler::new(vec![Message::user("hi")]);

        assert!(r.apply(&[append(&reply)]).is_some());
        assert!(r.apply(&[append(&reply)]).is_none());
        assert!(r.apply(&[append(&reply), append(&reply)]).is_none());
        assert_eq!(r.transcript().len(), 2);
    }

    #[test]
    fn message_already_in_snapshot_is_not_duplicated() {
        let reply = Message::assistant("hello").with_id("a-1");
        let mut r = MessageReconciler::new(vec![Message::user("hi"), reply.clone()]);

        assert!(r.apply(&[append(&reply)]).is_none());
        assert_eq!(r.transcript().len(), 2);
    }

    #[test]
    fn empty_batch_is_ignored() {
        let mut r = MessageReconciler::new(vec![]);
        assert!(r.apply(&[]).is_none());
    }

    #[test]
    fn unknown_and_malformed_signals_are_skipped() {
        let reply = Message::assistant("ok").with_id("a-2");
        let mut r = MessageReconciler::new(vec![]);

        let batch = vec![
            json!({"type": "usage", "tokens": 12}),
            json!("not an object"),
            json!({"type": "append-message", "message": "{broken"}),
            json!({"type": "append-message"}),
            append(&reply),
        ];
        let out = r.apply(&batch).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, "a-2");
    }

    #[test]
    fn only_unknown_signals_report_no_change() {
        let mut r = MessageReconciler::new(vec![Message::user("hi")]);
        assert!(r.apply(&[json!({"type": "future-thing"})]).is_none());
        assert_eq!(r.transcript().len(), 1);
    }
}
