//! # Chat client core
//!
//! Client-side half of the resumable chat stream.
//!
//! - [`ResumeCoordinator`]: one-shot check on mount. If the local transcript
//!   ends in an unanswered user message, attach to the relay's in-flight
//!   generation instead of starting a new one.
//! - [`MessageReconciler`]: folds `append-message` data signals into the local
//!   transcript, de-duplicated by message id.
//! - [`RelayClient`]: reqwest transport for the relay's HTTP/SSE API.
//! - [`ChatSession`]: ties the three together for a mounted session.
//!
//! ## Example
//!
//! ```rust
//! use chat_client::MessageReconciler;
//! use chat_convo::{DataSignal, Message};
//!
//! let reply = Message::assistant("Hi there").with_id("a-1");
//! let signal = serde_json::to_value(DataSignal::append_message(&reply).unwrap()).unwrap();
//!
//! let mut reconciler = MessageReconciler::new(vec![Message::user("Hello")]);
//! assert_eq!(reconciler.apply(&[signal.clone()]).map(|t| t.len()), Some(2));
//! // A repeated signal changes nothing
//! assert!(reconciler.apply(&[signal]).is_none());
//! ```

pub mod error;
pub mod reconciler;
pub mod resume;
pub mod session;
pub mod transport;

pub use error::{ClientError, Result};
pub use reconciler::MessageReconciler;
pub use resume::{Attach, ResumeCoordinator, ResumeOutcome};
pub use session::{ChatSession, Draft};
pub use transport::{EventStream, RelayClient, event_stream};
