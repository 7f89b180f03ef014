//! Lightweight per-stream counters
//!
//! Atomic counters updated from the session driver, readable from any thread
//! without locking. This is deliberately not an aggregation layer; callers
//! who want dashboards export the snapshot themselves.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters for one streaming session
#[derive(Debug, Default)]
pub struct StreamMetrics {
    frames_pushed: AtomicU64,
    frames_dropped: AtomicU64,
    chunks_sent: AtomicU64,
    bytes_sent: AtomicU64,
    interim_events: AtomicU64,
    final_events: AtomicU64,
    reconnects: AtomicU64,
}

impl StreamMetrics {
    pub(crate) fn record_frame_pushed(&self) {
        self.frames_pushed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_frames_dropped(&self, n: u64) {
        if n > 0 {
            self.frames_dropped.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_chunk_sent(&self, bytes: usize) {
        self.chunks_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_interim(&self) {
        self.interim_events.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_final(&self) {
        self.final_events.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_pushed: self.frames_pushed.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            chunks_sent: self.chunks_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            interim_events: self.interim_events.load(Ordering::Relaxed),
            final_events: self.final_events.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Serializable view of [`StreamMetrics`]
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Frames accepted by `push`
    pub frames_pushed: u64,
    /// Frames evicted from the outage buffer during reconnects
    pub frames_dropped: u64,
    /// Binary frames sent to the server
    pub chunks_sent: u64,
    /// Total audio payload bytes sent
    pub bytes_sent: u64,
    /// Interim events received (counted even when filtered out)
    pub interim_events: u64,
    /// Final events delivered
    pub final_events: u64,
    /// Successful connection replacements
    pub reconnects: u64,
}
