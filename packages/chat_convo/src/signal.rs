//! Stream events and out-of-band data signals.
//!
//! Every event travels as one server-sent-event frame: the frame's `event:`
//! line is [`StreamEvent::name`], its `data:` line is the JSON encoding of the
//! event (which is self-describing via its `type` tag), and fragments carry
//! their sequence number in the `id:` line so `Last-Event-ID` can resume them.

use serde::{Deserialize, Serialize};

use crate::error::{ConvoError, Result};
use crate::types::Message;

/// Envelope for whole-message updates delivered alongside the token stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum DataSignal {
    /// A completed message, JSON-serialized, to be appended to the transcript.
    AppendMessage { message: String },
    /// Catch-all for signal types this build does not know about
    #[serde(other)]
    Unknown,
}

impl DataSignal {
    pub fn append_message(message: &Message) -> Result<Self> {
        Ok(DataSignal::AppendMessage {
            message: serde_json::to_string(message)?,
        })
    }

    /// Decode the carried message, if this is an `append-message` signal.
    pub fn decode_message(&self) -> Option<Result<Message>> {
        match self {
            DataSignal::AppendMessage { message } => {
                Some(serde_json::from_str(message).map_err(ConvoError::from))
            }
            DataSignal::Unknown => None,
        }
    }
}

/// Why a generation ended without a final message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GenerationErrorKind {
    /// The text-generation service failed (network, provider, bad response).
    Source,
    /// No fragment arrived within the stall window.
    Stalled,
    /// The relay itself failed (e.g. the final message could not be stored).
    Internal,
    /// Cancelled before any content was produced.
    Cancelled,
}

/// One event on a chat stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// First event on every connection. `seq` is the last sequence number
    /// already produced by the generation at the time of attaching.
    Start {
        generation_id: String,
        session_id: String,
        message_id: String,
        model: String,
        seq: u64,
    },
    /// Content assembled so far, sent when a resume cursor is too old to replay.
    Snapshot { seq: u64, content: String },
    Fragment { seq: u64, delta: String },
    /// Out-of-band signals. Kept as raw JSON so unknown or malformed envelopes
    /// can be skipped one by one by the receiver.
    Data { signals: Vec<serde_json::Value> },
    Error {
        message: String,
        kind: GenerationErrorKind,
    },
}

impl StreamEvent {
    pub fn data(signals: &[DataSignal]) -> Result<Self> {
        let signals = signals
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(StreamEvent::Data { signals })
    }

    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Start { .. } => "start",
            StreamEvent::Snapshot { .. } => "snapshot",
            StreamEvent::Fragment { .. } => "fragment",
            StreamEvent::Data { .. } => "data",
            StreamEvent::Error { .. } => "error",
        }
    }

    /// Sequence number carried by the event, for events that have one.
    pub fn seq(&self) -> Option<u64> {
        match self {
            StreamEvent::Fragment { seq, .. } | StreamEvent::Snapshot { seq, .. } => Some(*seq),
            _ => None,
        }
    }

    /// Terminal events end the stream for their generation.
    pub fn is_terminal(&self) -> bool {
        match self {
            StreamEvent::Error { .. } => true,
            StreamEvent::Data { signals } => signals
                .iter()
                .any(|s| s.get("type").and_then(|t| t.as_str()) == Some("append-message")),
            _ => false,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse an SSE frame. The `event:` name must agree with the payload tag.
    pub fn from_sse(event: Option<&str>, data: &str) -> Result<Self> {
        let parsed: StreamEvent = serde_json::from_str(data)?;
        match event {
            Some(name) if name != parsed.name() => Err(ConvoError::EventMismatch {
                event: name.to_string(),
                payload: parsed.name().to_string(),
            }),
            _ => Ok(parsed),
        }
    }
}
