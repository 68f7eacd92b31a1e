//! Middleman counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Transport counters, updated by the event loop and socket tasks
#[derive(Debug, Default)]
pub struct MiddlemanMetrics {
    pub frames_sent: AtomicU64,
    pub frames_received: AtomicU64,
    /// Frames passed on unchanged to a third node
    pub frames_relayed: AtomicU64,
    /// Frames discarded because no route to their destination exists
    pub frames_dropped: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub connections_opened: AtomicU64,
    pub connections_closed: AtomicU64,
}

impl MiddlemanMetrics {
    #[inline]
    pub fn record_send(&self, bytes: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_receive(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_frame(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_relay(&self) {
        self.frames_relayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_open(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_close(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MiddlemanStats {
        let opened = self.connections_opened.load(Ordering::Relaxed);
        let closed = self.connections_closed.load(Ordering::Relaxed);
        MiddlemanStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_relayed: self.frames_relayed.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            connections_opened: opened,
            connections_closed: closed,
            connections_open: opened.saturating_sub(closed),
        }
    }
}

/// Point-in-time copy of `MiddlemanMetrics`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MiddlemanStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub frames_relayed: u64,
    pub frames_dropped: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub connections_open: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_tracks_open_connections() {
        let metrics = MiddlemanMetrics::default();
        metrics.record_open();
        metrics.record_open();
        metrics.record_close();
        metrics.record_send(10);
        metrics.record_send(6);
        let stats = metrics.snapshot();
        assert_eq!(stats.connections_open, 1);
        assert_eq!(stats.frames_sent, 2);
        assert_eq!(stats.bytes_sent, 16);
    }
}
