//! Actors with blocking receive
//!
//! A blocking actor runs a plain closure on its own thread and pulls
//! messages explicitly with `receive`/`receive_matching`. Messages that do
//! not match the current receive are cached and offered again to later
//! receives, oldest first. `ScopedActor` is the same API bound to the
//! calling thread; it terminates when dropped.

use crate::error::{ActorExited, RequestError};
use crate::handle::{AbstractActor, ActorHandle, Attachable};
use crate::local::LocalActor;
use crate::mailbox::MailboxElement;
use crate::system::ActorSystem;
use lattice_codec::{message, Message};
use lattice_types::{ActorAddr, ExitMsg, ExitReason, MessageId, SyncExitedMsg, SyncTimeoutMsg};
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

/// Timed-out request ids remembered to swallow late responses
const MAX_ABANDONED: usize = 1024;

/// A received message together with its sender and id
pub type Envelope = MailboxElement;

pub struct BlockingContext {
    this: Arc<LocalActor>,
    system: ActorSystem,
    cache: VecDeque<Envelope>,
    trap_exit: bool,
    /// Responses for requests that gave up waiting, oldest first
    abandoned: VecDeque<u64>,
}

impl BlockingContext {
    pub(crate) fn new(this: Arc<LocalActor>, system: ActorSystem) -> Self {
        Self {
            this,
            system,
            cache: VecDeque::new(),
            trap_exit: false,
            abandoned: VecDeque::new(),
        }
    }

    pub fn address(&self) -> ActorAddr {
        self.this.address()
    }

    pub fn handle(&self) -> ActorHandle {
        ActorHandle::Local(Arc::clone(&self.this))
    }

    pub fn system(&self) -> &ActorSystem {
        &self.system
    }

    pub fn send(&self, dest: &ActorHandle, content: Message) {
        dest.enqueue(Some(self.handle()), MessageId::ASYNC, content);
    }

    pub fn delayed_send(&self, dest: &ActorHandle, content: Message, delay: Duration) {
        self.system.delayed_enqueue(
            dest.clone(),
            Some(self.handle()),
            MessageId::ASYNC,
            content,
            delay,
        );
    }

    /// Next message of any kind; `Ok(None)` on timeout
    pub fn receive(&mut self, timeout: Option<Duration>) -> Result<Option<Envelope>, ActorExited> {
        self.receive_matching(|_| true, timeout)
    }

    /// Next message accepted by `predicate`; others stay cached
    ///
    /// Fails once the actor has been terminated, e.g. by a non-normal
    /// `ExitMsg` from a link while not trapping exits.
    pub fn receive_matching<P>(
        &mut self,
        mut predicate: P,
        timeout: Option<Duration>,
    ) -> Result<Option<Envelope>, ActorExited>
    where
        P: FnMut(&Envelope) -> bool,
    {
        if let Some(index) = self.cache.iter().position(|env| predicate(env)) {
            return Ok(self.cache.remove(index));
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let remaining = match deadline {
                Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                    Some(remaining) => Some(remaining),
                    None => return Ok(None),
                },
                None => None,
            };
            let Some(envelope) = self.this.mailbox().pop_blocking(remaining) else {
                if self.this.mailbox().is_closed() {
                    return Err(ActorExited(self.this.exit_reason()));
                }
                return Ok(None);
            };
            self.this.metrics().record_message();

            if envelope.mid.is_response() && self.abandoned.contains(&envelope.mid.request_id()) {
                let id = envelope.mid.request_id();
                self.abandoned.retain(|abandoned| *abandoned != id);
                continue;
            }
            if envelope.mid.is_async() && envelope.content.is_single::<ExitMsg>() {
                if let Some(exit) = envelope.content.get::<ExitMsg>(0).cloned() {
                    self.this.remove_link(&exit.source);
                    if !self.trap_exit {
                        if exit.reason.is_normal() {
                            continue;
                        }
                        return Err(self.quit(exit.reason));
                    }
                }
            }
            if predicate(&envelope) {
                return Ok(Some(envelope));
            }
            self.cache.push_back(envelope);
        }
    }

    /// Answers `envelope`: as a response if it was a request, otherwise as
    /// an asynchronous message to its sender
    pub fn reply(&self, envelope: &Envelope, content: Message) {
        let Some(sender) = &envelope.sender else {
            return;
        };
        if envelope.mid.is_request() {
            sender.enqueue(Some(self.handle()), envelope.mid.response_id(), content);
        } else if envelope.mid.is_async() {
            sender.enqueue(Some(self.handle()), MessageId::ASYNC, content);
        }
    }

    /// Sends a request and blocks until its response or `timeout`
    pub fn request(
        &mut self,
        dest: &ActorHandle,
        content: Message,
        timeout: Duration,
    ) -> Result<Message, RequestError> {
        let id = self.this.next_request_id();
        let mid = MessageId::request(id);
        let response = mid.response_id();
        dest.enqueue(Some(self.handle()), mid, content);

        match self.receive_matching(|env| env.mid == response, Some(timeout)) {
            Ok(Some(envelope)) => {
                let content = envelope.content;
                let exited = content
                    .get::<SyncExitedMsg>(0)
                    .filter(|_| content.len() == 1)
                    .map(|exited| exited.reason);
                if content.is_single::<SyncTimeoutMsg>() {
                    Err(RequestError::Timeout)
                } else if let Some(reason) = exited {
                    Err(RequestError::Exited(reason))
                } else {
                    Ok(content)
                }
            }
            Ok(None) => {
                trace!(actor = %self.address(), request = id, "Request timed out");
                if self.abandoned.len() == MAX_ABANDONED {
                    self.abandoned.pop_front();
                }
                self.abandoned.push_back(id);
                Err(RequestError::Timeout)
            }
            Err(ActorExited(reason)) => Err(RequestError::Aborted(reason)),
        }
    }

    pub fn trap_exit(&mut self, enabled: bool) {
        self.trap_exit = enabled;
    }

    pub fn link_to(&self, other: &ActorHandle) {
        self.this.add_link(other.clone());
        other.add_link(self.handle());
    }

    pub fn unlink_from(&self, other: &ActorHandle) {
        self.this.remove_link(&other.address());
        other.remove_link(&self.address());
    }

    pub fn monitor(&self, other: &ActorHandle) {
        other.attach(Attachable::Monitor {
            observer: self.handle(),
        });
    }

    pub fn demonitor(&self, other: &ActorHandle) {
        other.detach(&self.address());
    }

    pub fn send_exit(&self, dest: &ActorHandle, reason: ExitReason) {
        dest.enqueue(
            Some(self.handle()),
            MessageId::ASYNC,
            message![ExitMsg {
                source: self.address(),
                reason,
            }],
        );
    }

    /// Terminates the actor now; return the result from the body with `?`
    pub fn quit(&mut self, reason: ExitReason) -> ActorExited {
        self.finish(reason);
        ActorExited(self.this.exit_reason())
    }

    pub(crate) fn finish(&mut self, reason: ExitReason) {
        if self.this.cleanup(reason) {
            for envelope in self.cache.drain(..) {
                self.this.bounce_element(envelope);
            }
        }
    }
}

/// A blocking actor bound to the current thread
///
/// Not counted by `await_all_actors_done`. Exits with `NORMAL` on drop.
pub struct ScopedActor {
    ctx: BlockingContext,
}

impl ScopedActor {
    pub(crate) fn new(ctx: BlockingContext) -> Self {
        Self { ctx }
    }
}

impl Deref for ScopedActor {
    type Target = BlockingContext;

    fn deref(&self) -> &Self::Target {
        &self.ctx
    }
}

impl DerefMut for ScopedActor {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.ctx
    }
}

impl Drop for ScopedActor {
    fn drop(&mut self) {
        self.ctx.finish(ExitReason::NORMAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abandoned_requests_are_bounded() {
        let system = ActorSystem::builder().build().unwrap();
        let mut me = system.scoped();
        // Requests to ourselves are never answered
        let target = me.handle();
        for n in 0..(MAX_ABANDONED + 10) as u32 {
            let result = me.request(&target, message![n], Duration::ZERO);
            assert!(matches!(result, Err(RequestError::Timeout)));
        }
        assert_eq!(me.abandoned.len(), MAX_ABANDONED);
        drop(me);
        system.shutdown();
    }
}
