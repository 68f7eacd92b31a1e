//! Actors living in this process
//!
//! A `LocalActor` owns its mailbox and lifecycle state (exit reason, links,
//! attachables). Event-based actors additionally keep their behavior stack
//! and message cache in `event`, touched only by the thread currently
//! resuming the actor. Blocking actors keep that state on their own thread.
//!
//! # Exit sequence
//!
//! 1. record the reason, take links and attachables
//! 2. close the mailbox and bounce every queued request
//! 3. erase from the registry (late lookups see the reason)
//! 4. `ExitMsg` to links, `DownMsg`/callbacks to attachables

use crate::event_based::EventState;
use crate::handle::{bounce, AbstractActor, ActorHandle, Attachable};
use crate::mailbox::{EnqueueResult, Mailbox, MailboxElement};
use crate::metrics::SystemMetrics;
use crate::registry::ActorRegistry;
use crate::scheduler::PoolHandle;
use lattice_codec::{message, Message};
use lattice_types::{ActorAddr, ExitMsg, ExitReason, MessageId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorKind {
    /// Driven by behaviors; resumed by the worker pool or a detached thread
    EventBased,
    /// Runs a body with blocking receive calls on its own thread
    Blocking,
}

/// Outcome of one resume step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resumable {
    /// The actor has exited
    Done,
    /// Mailbox empty; the next enqueue reschedules the actor
    Blocked,
    /// Throughput budget used up with messages still queued
    Yield,
}

#[derive(Default)]
struct Lifecycle {
    reason: ExitReason,
    links: HashMap<ActorAddr, ActorHandle>,
    attachables: Vec<Attachable>,
}

pub struct LocalActor {
    addr: ActorAddr,
    kind: ActorKind,
    interface: Vec<String>,
    hidden: bool,
    mailbox: Mailbox,
    lifecycle: Mutex<Lifecycle>,
    pub(crate) event: Mutex<Option<EventState>>,
    next_request: AtomicU64,
    pool: Option<PoolHandle>,
    registry: Arc<ActorRegistry>,
    metrics: Arc<SystemMetrics>,
    self_ref: Weak<LocalActor>,
}

pub(crate) struct LocalActorConfig {
    pub(crate) addr: ActorAddr,
    pub(crate) kind: ActorKind,
    pub(crate) interface: Vec<String>,
    /// Not counted by `await_all_actors_done`
    pub(crate) hidden: bool,
    /// `None` for actors on a dedicated thread
    pub(crate) pool: Option<PoolHandle>,
    pub(crate) registry: Arc<ActorRegistry>,
    pub(crate) metrics: Arc<SystemMetrics>,
}

impl LocalActor {
    pub(crate) fn new(config: LocalActorConfig) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            addr: config.addr,
            kind: config.kind,
            interface: config.interface,
            hidden: config.hidden,
            mailbox: Mailbox::new(),
            lifecycle: Mutex::new(Lifecycle::default()),
            event: Mutex::new(None),
            next_request: AtomicU64::new(1),
            pool: config.pool,
            registry: config.registry,
            metrics: config.metrics,
            self_ref: self_ref.clone(),
        })
    }

    pub fn kind(&self) -> ActorKind {
        self.kind
    }

    /// Declared message interface, checked during handshakes
    pub fn interface(&self) -> &[String] {
        &self.interface
    }

    pub fn is_exited(&self) -> bool {
        self.exit_reason().is_exited()
    }

    pub(crate) fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    pub(crate) fn metrics(&self) -> &SystemMetrics {
        &self.metrics
    }

    pub(crate) fn handle(&self) -> Option<ActorHandle> {
        self.self_ref.upgrade().map(ActorHandle::Local)
    }

    pub(crate) fn next_request_id(&self) -> u64 {
        self.next_request.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of links, for diagnostics and tests
    pub fn link_count(&self) -> usize {
        self.lifecycle.lock().links.len()
    }

    /// Number of registered attachables (monitors and callbacks)
    pub fn attachable_count(&self) -> usize {
        self.lifecycle.lock().attachables.len()
    }

    pub(crate) fn bounce_element(&self, element: MailboxElement) {
        self.metrics.record_bounce();
        bounce(self.addr, self.exit_reason(), element.sender, element.mid);
    }

    /// Terminates the actor; returns `false` if it had already exited
    pub(crate) fn cleanup(&self, reason: ExitReason) -> bool {
        let (links, attachables) = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.reason.is_exited() {
                return false;
            }
            lifecycle.reason = reason;
            (
                std::mem::take(&mut lifecycle.links),
                std::mem::take(&mut lifecycle.attachables),
            )
        };

        for element in self.mailbox.close() {
            self.bounce_element(element);
        }
        self.registry.erase(self.addr.id(), reason);

        let me = self.handle();
        for link in links.into_values() {
            link.enqueue(
                me.clone(),
                MessageId::ASYNC,
                message![ExitMsg {
                    source: self.addr,
                    reason,
                }],
            );
        }
        for attachable in attachables {
            attachable.fire(self.addr, reason);
        }

        self.metrics.record_exit();
        if !self.hidden {
            self.registry.dec_running();
        }
        debug!(actor = %self.addr, %reason, kind = ?self.kind, "Actor exited");
        true
    }

    /// Runs up to `max_throughput` messages of an event-based actor
    pub(crate) fn resume(self: &Arc<Self>, max_throughput: usize) -> Resumable {
        let mut guard = self.event.lock();
        let Some(state) = guard.as_mut() else {
            return Resumable::Done;
        };

        let step = match panic::catch_unwind(AssertUnwindSafe(|| {
            state.run(&self.mailbox, max_throughput)
        })) {
            Ok(step) => step,
            Err(payload) => {
                error!(
                    actor = %self.addr,
                    panic = panic_message(payload.as_ref()),
                    "Unhandled panic in actor handler"
                );
                self.metrics.record_panic();
                state.ctx.quit(ExitReason::UNHANDLED_EXCEPTION);
                Resumable::Done
            }
        };

        if let Some(reason) = state.ctx.quit_reason() {
            let cached = state.take_cache();
            // Drops behaviors and the context, which hold references back
            // to this actor and the system.
            *guard = None;
            drop(guard);
            self.cleanup(reason);
            for element in cached {
                self.bounce_element(element);
            }
            return Resumable::Done;
        }
        step
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

impl AbstractActor for LocalActor {
    fn address(&self) -> ActorAddr {
        self.addr
    }

    fn enqueue(&self, sender: Option<ActorHandle>, mid: MessageId, content: Message) {
        match self
            .mailbox
            .enqueue(MailboxElement::new(sender, mid, content))
        {
            EnqueueResult::Success => {}
            EnqueueResult::UnblockedReader => {
                if let (Some(pool), Some(me)) = (&self.pool, self.self_ref.upgrade()) {
                    pool.schedule(me);
                }
            }
            EnqueueResult::QueueClosed(element) => self.bounce_element(element),
        }
    }

    fn attach(&self, attachable: Attachable) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.reason.is_exited() {
            let reason = lifecycle.reason;
            drop(lifecycle);
            attachable.fire(self.addr, reason);
        } else {
            lifecycle.attachables.push(attachable);
        }
    }

    fn detach(&self, observer: &ActorAddr) {
        self.lifecycle
            .lock()
            .attachables
            .retain(|a| !a.is_monitor_of(observer));
    }

    fn add_link(&self, other: ActorHandle) {
        if other.address() == self.addr {
            return;
        }
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.reason.is_exited() {
            let reason = lifecycle.reason;
            drop(lifecycle);
            other.enqueue(
                self.handle(),
                MessageId::ASYNC,
                message![ExitMsg {
                    source: self.addr,
                    reason,
                }],
            );
        } else {
            lifecycle.links.insert(other.address(), other);
        }
    }

    fn remove_link(&self, other: &ActorAddr) {
        self.lifecycle.lock().links.remove(other);
    }

    fn exit_reason(&self) -> ExitReason {
        self.lifecycle.lock().reason
    }
}

impl std::fmt::Debug for LocalActor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalActor")
            .field("addr", &self.addr)
            .field("kind", &self.kind)
            .field("mailbox", &self.mailbox)
            .finish()
    }
}
