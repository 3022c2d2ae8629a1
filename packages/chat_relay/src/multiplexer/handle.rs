use std::collections::VecDeque;
use std::sync::Arc;

use chat_convo::StreamEvent;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;

use super::generation::Generation;
use crate::metrics::ServerMetrics;

/// One consumer's view of a generation.
///
/// Yields a `start` event, any catch-up (replayed fragments or a snapshot),
/// then live events, and ends after the terminal event. Dropping the handle
/// only detaches this consumer.
pub struct StreamHandle {
    generation: Arc<Generation>,
    rx: broadcast::Receiver<StreamEvent>,
    pending: VecDeque<StreamEvent>,
    last_seq: u64,
    done: bool,
    metrics: Arc<ServerMetrics>,
}

impl StreamHandle {
    /// Subscribe to `generation`. `after = None` joins at the live tail,
    /// `Some(n)` catches up on everything after sequence `n`.
    pub(crate) async fn subscribe(
        generation: Arc<Generation>,
        after: Option<u64>,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        let (rx, pending, last_seq) = {
            // Subscribing under the state lock means no fragment can be
            // published between the catch-up and the live feed.
            let state = generation.state.lock().await;
            let cursor = after.unwrap_or(state.seq).min(state.seq);
            let mut pending = VecDeque::new();
            pending.push_back(generation.start_event(state.seq));
            pending.extend(state.catch_up(cursor));
            (state.tx.subscribe(), pending, cursor)
        };

        Self {
            generation,
            rx,
            pending,
            last_seq,
            done: false,
            metrics,
        }
    }

    pub fn generation_id(&self) -> &str {
        &self.generation.generation_id
    }

    pub fn session_id(&self) -> &str {
        &self.generation.session_id
    }

    /// Next event, or `None` once the terminal event has been delivered.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        loop {
            if self.done {
                return None;
            }

            if let Some(event) = self.pending.pop_front() {
                if let Some(event) = self.accept(event) {
                    return Some(event);
                }
                continue;
            }

            match self.rx.recv().await {
                Ok(event) => {
                    if let Some(event) = self.accept(event) {
                        return Some(event);
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    debug!(
                        session_id = %self.generation.session_id,
                        missed,
                        last_seq = self.last_seq,
                        "Consumer lagged, resyncing"
                    );
                    self.metrics.lagged_resync();
                    self.resync().await;
                }
                Err(RecvError::Closed) => {
                    // Sender lives as long as the generation; only the terminal
                    // event can still be owed.
                    let terminal = self.generation.state.lock().await.terminal.clone();
                    self.done = true;
                    return terminal;
                }
            }
        }
    }

    /// Rebuild the pending queue from the replay buffer after falling
    /// behind the broadcast channel.
    async fn resync(&mut self) {
        let state = self.generation.state.lock().await;
        self.rx = state.tx.subscribe();
        self.pending = state.catch_up(self.last_seq).into();
    }

    /// Filter duplicates and track the cursor. Returns the event to deliver.
    fn accept(&mut self, event: StreamEvent) -> Option<StreamEvent> {
        match &event {
            StreamEvent::Fragment { seq, .. } => {
                if *seq <= self.last_seq {
                    return None;
                }
                self.last_seq = *seq;
                self.metrics.fragment_sent();
            }
            StreamEvent::Snapshot { seq, .. } => {
                if *seq < self.last_seq {
                    return None;
                }
                self.last_seq = *seq;
            }
            _ => {}
        }
        if event.is_terminal() || matches!(event, StreamEvent::Error { .. }) {
            self.done = true;
        }
        Some(event)
    }
}
