//! Server metrics for observability
//!
//! Provides runtime metrics for monitoring relay health and generation throughput.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Server-wide metrics
#[derive(Debug, Default)]
pub struct ServerMetrics {
    // Stream connection metrics
    /// Currently open chat streams
    pub active_streams: AtomicU64,
    /// Total chat streams opened since server start
    pub total_streams: AtomicU64,

    // Generation metrics
    /// Generations currently running
    pub active_generations: AtomicU64,
    pub generations_started: AtomicU64,
    pub generations_completed: AtomicU64,
    pub generations_failed: AtomicU64,
    pub generations_cancelled: AtomicU64,
    pub generations_stalled: AtomicU64,

    // Fan-out metrics
    /// Consumers that joined an already-running generation
    pub attaches: AtomicU64,
    /// Resume requests that found nothing to attach to
    pub empty_resumes: AtomicU64,
    /// Fragment events handed to consumers
    pub fragments_sent: AtomicU64,
    /// Consumers that fell behind the broadcast channel and were resynced
    pub lagged_resyncs: AtomicU64,
    /// Requests rejected by the daily message limit
    pub rate_limited: AtomicU64,

    /// Server start time (for uptime calculation)
    start_time: Option<Instant>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    // Stream tracking
    pub fn stream_opened(&self) {
        self.active_streams.fetch_add(1, Ordering::Relaxed);
        self.total_streams.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stream_closed(&self) {
        self.active_streams.fetch_sub(1, Ordering::Relaxed);
    }

    // Generation lifecycle
    pub fn generation_started(&self) {
        self.active_generations.fetch_add(1, Ordering::Relaxed);
        self.generations_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn generation_completed(&self) {
        self.active_generations.fetch_sub(1, Ordering::Relaxed);
        self.generations_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn generation_failed(&self) {
        self.active_generations.fetch_sub(1, Ordering::Relaxed);
        self.generations_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn generation_cancelled(&self) {
        self.active_generations.fetch_sub(1, Ordering::Relaxed);
        self.generations_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn generation_stalled(&self) {
        self.active_generations.fetch_sub(1, Ordering::Relaxed);
        self.generations_stalled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn attached(&self) {
        self.attaches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn empty_resume(&self) {
        self.empty_resumes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fragment_sent(&self) {
        self.fragments_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn lagged_resync(&self) {
        self.lagged_resyncs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rate_limit_hit(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            streams: StreamMetrics {
                active: self.active_streams.load(Ordering::Relaxed),
                total: self.total_streams.load(Ordering::Relaxed),
            },
            generations: GenerationMetrics {
                active: self.active_generations.load(Ordering::Relaxed),
                started: self.generations_started.load(Ordering::Relaxed),
                completed: self.generations_completed.load(Ordering::Relaxed),
                failed: self.generations_failed.load(Ordering::Relaxed),
                cancelled: self.generations_cancelled.load(Ordering::Relaxed),
                stalled: self.generations_stalled.load(Ordering::Relaxed),
            },
            fanout: FanoutMetrics {
                attaches: self.attaches.load(Ordering::Relaxed),
                empty_resumes: self.empty_resumes.load(Ordering::Relaxed),
                fragments_sent: self.fragments_sent.load(Ordering::Relaxed),
                lagged_resyncs: self.lagged_resyncs.load(Ordering::Relaxed),
            },
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub streams: StreamMetrics,
    pub generations: GenerationMetrics,
    pub fanout: FanoutMetrics,
    pub rate_limited: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamMetrics {
    pub active: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationMetrics {
    pub active: u64,
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub stalled: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutMetrics {
    pub attaches: u64,
    pub empty_resumes: u64,
    pub fragments_sent: u64,
    pub lagged_resyncs: u64,
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub active_generations: u64,
    pub streams: u64,
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_tracking() {
        let metrics = ServerMetrics::new();

        metrics.stream_opened();
        metrics.stream_opened();
        assert_eq!(metrics.active_streams.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.total_streams.load(Ordering::Relaxed), 2);

        metrics.stream_closed();
        assert_eq!(metrics.active_streams.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.total_streams.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_generation_lifecycle() {
        let metrics = ServerMetrics::new();

        metrics.generation_started();
        metrics.generation_started();
        metrics.generation_started();
        assert_eq!(metrics.active_generations.load(Ordering::Relaxed), 3);

        metrics.generation_completed();
        metrics.generation_stalled();
        assert_eq!(metrics.active_generations.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.generations_stalled.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_snapshot() {
        let metrics = ServerMetrics::new();
        metrics.stream_opened();
        metrics.generation_started();
        metrics.fragment_sent();
        metrics.attached();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.streams.active, 1);
        assert_eq!(snapshot.generations.active, 1);
        assert_eq!(snapshot.fanout.fragments_sent, 1);
        assert_eq!(snapshot.fanout.attaches, 1);
    }
}
