//! Resume-on-mount: reattach to an in-flight generation instead of starting one.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chat_convo::{Message, awaiting_reply};
use tracing::{debug, info};

use crate::error::Result;

/// Something that can attach to a session's in-flight generation.
#[async_trait]
pub trait Attach: Send + Sync {
    type Stream: Send;

    /// `Ok(None)` means there is nothing to resume for this session.
    async fn attach(&self, session_id: &str, after: Option<u64>) -> Result<Option<Self::Stream>>;
}

#[derive(Debug)]
pub enum ResumeOutcome<S> {
    /// Attached to the live generation.
    Attached(S),
    /// The transcript awaited a reply but the relay had no active generation.
    NothingToResume,
    /// The transcript already ends in a reply (or is empty).
    NotNeeded,
    /// Auto-resume is turned off for this session.
    Disabled,
    /// The one-shot check already ran for this mount.
    AlreadyChecked,
}

impl<S> ResumeOutcome<S> {
    pub fn is_attached(&self) -> bool {
        matches!(self, ResumeOutcome::Attached(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            ResumeOutcome::Attached(_) => "attached",
            ResumeOutcome::NothingToResume => "nothing_to_resume",
            ResumeOutcome::NotNeeded => "not_needed",
            ResumeOutcome::Disabled => "disabled",
            ResumeOutcome::AlreadyChecked => "already_checked",
        }
    }
}

/// One-shot resume check for a mounted session.
///
/// Construct one per mount. The first call to [`on_mount`](Self::on_mount)
/// decides; every later call returns [`ResumeOutcome::AlreadyChecked`]
/// without contacting the relay, whatever transcript it is given.
#[derive(Debug)]
pub struct ResumeCoordinator {
    session_id: String,
    auto_resume: bool,
    checked: AtomicBool,
}

impl ResumeCoordinator {
    pub fn new(session_id: impl Into<String>, auto_resume: bool) -> Self {
        Self {
            session_id: session_id.into(),
            auto_resume,
            checked: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn has_checked(&self) -> bool {
        self.checked.load(Ordering::Acquire)
    }

    pub async fn on_mount<A: Attach>(
        &self,
        initial_messages: &[Message],
        attacher: &A,
    ) -> Result<ResumeOutcome<A::Stream>> {
        if !self.auto_resume {
            return Ok(ResumeOutcome::Disabled);
        }
        if self
            .checked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(ResumeOutcome::AlreadyChecked);
        }

        if !awaiting_reply(initial_messages) {
            debug!(session_id = %self.session_id, "Transcript not awaiting a reply, no resume");
            return Ok(ResumeOutcome::NotNeeded);
        }

        match attacher.attach(&self.session_id, None).await? {
            Some(stream) => {
                info!(session_id = %self.session_id, "Resumed in-flight generation");
                Ok(ResumeOutcome::Attached(stream))
            }
            None => {
                info!(session_id = %self.session_id, "Nothing to resume");
                Ok(ResumeOutcome::NothingToResume)
            }
        }
    }
}
