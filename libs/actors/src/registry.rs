//! Process-local actor registry
//!
//! Maps actor ids to live local actors. Entries of exited actors keep their
//! exit reason so that late lookups (e.g. a `MONITOR` arriving after the
//! actor died) can still answer with the right reason instead of an error.

use crate::local::LocalActor;
use dashmap::DashMap;
use lattice_types::{ActorId, ExitReason};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

#[derive(Clone)]
struct Entry {
    actor: Option<Arc<LocalActor>>,
    reason: ExitReason,
}

pub struct ActorRegistry {
    entries: DashMap<ActorId, Entry>,
    running: Mutex<usize>,
    running_changed: Condvar,
}

impl ActorRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            running: Mutex::new(0),
            running_changed: Condvar::new(),
        }
    }

    pub fn put(&self, id: ActorId, actor: Arc<LocalActor>) {
        trace!(actor_id = %id, "Registering actor");
        self.entries.insert(
            id,
            Entry {
                actor: Some(actor),
                reason: ExitReason::NOT_EXITED,
            },
        );
    }

    pub fn get(&self, id: ActorId) -> Option<Arc<LocalActor>> {
        self.entries.get(&id).and_then(|entry| entry.actor.clone())
    }

    /// The actor if alive, and its exit reason (`NOT_EXITED` while alive or
    /// if the id was never registered)
    pub fn get_entry(&self, id: ActorId) -> (Option<Arc<LocalActor>>, ExitReason) {
        match self.entries.get(&id) {
            Some(entry) => (entry.actor.clone(), entry.reason),
            None => (None, ExitReason::NOT_EXITED),
        }
    }

    /// Drops the strong reference and remembers `reason`
    pub fn erase(&self, id: ActorId, reason: ExitReason) {
        let previous = self.entries.insert(
            id,
            Entry {
                actor: None,
                reason,
            },
        );
        drop(previous);
    }

    /// Every live actor
    pub fn live_actors(&self) -> Vec<Arc<LocalActor>> {
        self.entries
            .iter()
            .filter_map(|entry| entry.actor.clone())
            .collect()
    }

    pub fn inc_running(&self) {
        *self.running.lock() += 1;
    }

    pub fn dec_running(&self) {
        let mut running = self.running.lock();
        *running = running.saturating_sub(1);
        self.running_changed.notify_all();
    }

    pub fn running(&self) -> usize {
        *self.running.lock()
    }

    /// Blocks until at most `expected` actors are running
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub fn await_running_count_equal(&self, expected: usize, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut running = self.running.lock();
        while *running > expected {
            match deadline {
                Some(deadline) => {
                    if self
                        .running_changed
                        .wait_until(&mut running, deadline)
                        .timed_out()
                    {
                        return *running <= expected;
                    }
                }
                None => self.running_changed.wait(&mut running),
            }
        }
        true
    }
}

impl Default for ActorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
