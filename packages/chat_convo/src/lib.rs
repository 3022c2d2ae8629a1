//! # Chat Conversations
//!
//! Shared data model for the resumable chat relay and its clients.
//!
//! ## Overview
//!
//! - [`Message`] / [`Session`]: the transcript model. Messages are either
//!   `pending` (still streaming) or `final`.
//! - [`StreamEvent`]: one event on a chat stream (start, fragment, snapshot,
//!   data, error).
//! - [`DataSignal`]: out-of-band envelopes carried by `data` events; the
//!   `append-message` signal delivers the final assembled message of a
//!   generation so a client can reconcile its transcript without re-fetching.
//! - [`SseDecoder`]: incremental decoder for the event-stream framing.
//!
//! ## Example
//!
//! ```rust
//! use chat_convo::{DataSignal, Message, StreamEvent};
//!
//! let reply = Message::assistant("Hello!");
//! let event = StreamEvent::data(&[DataSignal::append_message(&reply)?])?;
//! assert!(event.is_terminal());
//! # Ok::<(), chat_convo::ConvoError>(())
//! ```

pub mod error;
pub mod signal;
pub mod sse;
pub mod types;

pub use error::{ConvoError, Result};
pub use signal::{DataSignal, GenerationErrorKind, StreamEvent};
pub use sse::{SseDecoder, SseFrame};
pub use types::{
    ActiveGeneration, ContentPart, Message, MessageContent, MessageRole, MessageStatus, Session,
    SessionDetail, SessionSummary, awaiting_reply, derive_title,
};
