//! Actor system counters

use std::sync::atomic::{AtomicU64, Ordering};

/// System-wide counters, updated lock-free by workers and actor threads
#[derive(Debug, Default)]
pub struct SystemMetrics {
    pub actors_spawned: AtomicU64,
    pub actors_exited: AtomicU64,
    pub messages_processed: AtomicU64,
    /// Messages that reached a closed mailbox or a dead proxy
    pub messages_bounced: AtomicU64,
    /// Handler panics converted into `UNHANDLED_EXCEPTION` exits
    pub handler_panics: AtomicU64,
}

impl SystemMetrics {
    pub fn record_spawn(&self) {
        self.actors_spawned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_exit(&self) {
        self.actors_exited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message(&self) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bounce(&self) {
        self.messages_bounced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_panic(&self) {
        self.handler_panics.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SystemStats {
        let spawned = self.actors_spawned.load(Ordering::Relaxed);
        let exited = self.actors_exited.load(Ordering::Relaxed);
        SystemStats {
            actors_spawned: spawned,
            actors_exited: exited,
            actors_running: spawned.saturating_sub(exited),
            messages_processed: self.messages_processed.load(Ordering::Relaxed),
            messages_bounced: self.messages_bounced.load(Ordering::Relaxed),
            handler_panics: self.handler_panics.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of `SystemMetrics`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SystemStats {
    pub actors_spawned: u64,
    pub actors_exited: u64,
    pub actors_running: u64,
    pub messages_processed: u64,
    pub messages_bounced: u64,
    pub handler_panics: u64,
}
