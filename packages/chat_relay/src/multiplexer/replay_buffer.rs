//! Bounded ring buffer of recent fragments for resume replay.
//!
//! A generation stores its recent fragments so that a client that
//! reconnects with a cursor can replay what it missed instead of
//! receiving a full content snapshot.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Default maximum number of entries in the replay buffer.
const DEFAULT_MAX_ENTRIES: usize = 2048;

/// Default maximum age for replay entries.
const DEFAULT_MAX_AGE: Duration = Duration::from_secs(300); // 5 minutes

/// A bounded ring buffer of fragments keyed by sequence number.
pub struct ReplayBuffer {
    buffer: VecDeque<Entry>,
    max_entries: usize,
    max_age: Duration,
    /// Highest sequence number ever pushed, even if since evicted.
    head_seq: u64,
}

struct Entry {
    seq: u64,
    delta: String,
    timestamp: Instant,
}

impl ReplayBuffer {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_ENTRIES, DEFAULT_MAX_AGE)
    }

    pub fn with_limits(max_entries: usize, max_age: Duration) -> Self {
        Self {
            buffer: VecDeque::new(),
            max_entries: max_entries.max(1),
            max_age,
            head_seq: 0,
        }
    }

    /// Push a fragment. Sequence numbers must be increasing.
    pub fn push(&mut self, seq: u64, delta: &str) {
        // Evict old entries first
        self.evict_expired();

        // Enforce capacity
        while self.buffer.len() >= self.max_entries {
            self.buffer.pop_front();
        }

        self.buffer.push_back(Entry {
            seq,
            delta: delta.to_string(),
            timestamp: Instant::now(),
        });
        self.head_seq = seq;
    }

    /// Return all fragments with seq > `last_seq`, in order.
    ///
    /// Returns `None` if fragments after `last_seq` have already been evicted,
    /// meaning the caller should send a content snapshot instead.
    pub fn replay_since(&self, last_seq: u64) -> Option<Vec<(u64, &str)>> {
        if last_seq >= self.head_seq {
            return Some(Vec::new());
        }

        let oldest_seq = self.buffer.front().map(|e| e.seq)?;
        if last_seq + 1 < oldest_seq {
            // There is a gap between the cursor and our oldest entry
            return None;
        }

        Some(
            self.buffer
                .iter()
                .filter(|e| e.seq > last_seq)
                .map(|e| (e.seq, e.delta.as_str()))
                .collect(),
        )
    }

    /// Remove entries older than `max_age`.
    pub fn evict_expired(&mut self) {
        let Some(cutoff) = Instant::now().checked_sub(self.max_age) else {
            return;
        };
        while let Some(front) = self.buffer.front() {
            if front.timestamp < cutoff {
                self.buffer.pop_front();
            } else {
                break;
            }
        }
    }

    /// Current number of entries.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// The highest sequence number pushed, or 0 if none.
    pub fn head_seq(&self) -> u64 {
        self.head_seq
    }
}

impl Default for ReplayBuffer {
    fn default() -> Self {
        Self::new()
    }
}
