//! Handler-side API of event-based actors

use crate::behavior::{Behavior, StackOp};
use crate::error::RequestError;
use crate::handle::{AbstractActor, ActorHandle, Attachable};
use crate::local::LocalActor;
use crate::system::ActorSystem;
use lattice_codec::{message, Message};
use lattice_types::{
    ActorAddr, ExitMsg, ExitReason, MessageId, NodeId, SyncTimeoutMsg, TimeoutMsg,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub(crate) type ResponseHandler =
    Box<dyn FnOnce(&mut ActorContext, Result<Message, RequestError>) + Send>;

/// Sender and id of the message being handled
#[derive(Clone)]
pub(crate) struct Current {
    pub(crate) sender: Option<ActorHandle>,
    pub(crate) mid: MessageId,
}

/// Passed to every handler of an event-based actor
///
/// Behavior changes (`become_behavior`, `become_stacked`, `unbecome`) and
/// `quit` take effect after the running handler returns.
pub struct ActorContext {
    pub(crate) this: Arc<LocalActor>,
    system: ActorSystem,
    pub(crate) current: Option<Current>,
    pub(crate) ops: Vec<StackOp>,
    pub(crate) trap_exit: bool,
    quit_reason: Option<ExitReason>,
    pub(crate) pending: HashMap<u64, ResponseHandler>,
    /// Requests whose response must arrive before other messages are handled
    pub(crate) awaiting: Vec<u64>,
    pub(crate) timeout_generation: u32,
    /// Set when a response handler ran, so cached messages get another chance
    pub(crate) changed: bool,
}

impl ActorContext {
    pub(crate) fn new(this: Arc<LocalActor>, system: ActorSystem) -> Self {
        Self {
            this,
            system,
            current: None,
            ops: Vec::new(),
            trap_exit: false,
            quit_reason: None,
            pending: HashMap::new(),
            awaiting: Vec::new(),
            timeout_generation: 0,
            changed: false,
        }
    }

    pub fn address(&self) -> ActorAddr {
        self.this.address()
    }

    pub fn node(&self) -> NodeId {
        self.system.node()
    }

    /// Handle to this actor
    pub fn handle(&self) -> ActorHandle {
        ActorHandle::Local(Arc::clone(&self.this))
    }

    pub fn system(&self) -> &ActorSystem {
        &self.system
    }

    /// Sender of the message being handled, if it had one
    pub fn current_sender(&self) -> Option<&ActorHandle> {
        self.current.as_ref().and_then(|c| c.sender.as_ref())
    }

    pub fn current_message_id(&self) -> MessageId {
        self.current
            .as_ref()
            .map(|c| c.mid)
            .unwrap_or(MessageId::ASYNC)
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

    /// Sends a request; complete it with `.then(..)`
    ///
    /// If no response arrives within `timeout`, the handler receives
    /// `Err(RequestError::Timeout)`; a late response is discarded.
    pub fn request(
        &mut self,
        dest: &ActorHandle,
        content: Message,
        timeout: Duration,
    ) -> PendingRequest<'_> {
        let id = self.this.next_request_id();
        let mid = MessageId::request(id);
        dest.enqueue(Some(self.handle()), mid, content);
        self.system.delayed_enqueue(
            self.handle(),
            None,
            mid.response_id(),
            message![SyncTimeoutMsg],
            timeout,
        );
        PendingRequest { ctx: self, id }
    }

    /// Replaces the current behavior
    pub fn become_behavior(&mut self, behavior: Behavior) {
        self.ops.push(StackOp::Replace(behavior));
    }

    /// Pushes a behavior; `unbecome` returns to the current one
    pub fn become_stacked(&mut self, behavior: Behavior) {
        self.ops.push(StackOp::Push(behavior));
    }

    /// Pops the current behavior; an empty stack terminates the actor
    pub fn unbecome(&mut self) {
        self.ops.push(StackOp::Pop);
    }

    /// Deliver `ExitMsg` from links to the behavior instead of exiting
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

    /// Receive one `DownMsg` when `other` exits
    pub fn monitor(&self, other: &ActorHandle) {
        other.attach(Attachable::Monitor {
            observer: self.handle(),
        });
    }

    pub fn demonitor(&self, other: &ActorHandle) {
        other.detach(&self.address());
    }

    /// Terminates after the current handler; the first reason wins
    pub fn quit(&mut self, reason: ExitReason) {
        if self.quit_reason.is_none() {
            self.quit_reason = Some(reason);
        }
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

    pub(crate) fn quit_reason(&self) -> Option<ExitReason> {
        self.quit_reason
    }

    /// Sends a handler's return value back to the current sender
    pub(crate) fn deliver_reply(&self, current: Option<Current>, reply: Message) {
        let Some(Current {
            sender: Some(sender),
            mid,
        }) = current
        else {
            return;
        };
        if mid.is_request() {
            sender.enqueue(Some(self.handle()), mid.response_id(), reply);
        } else if mid.is_async() {
            sender.enqueue(Some(self.handle()), MessageId::ASYNC, reply);
        }
    }

    pub(crate) fn arm_timeout(&mut self, after: Option<Duration>) {
        self.timeout_generation = self.timeout_generation.wrapping_add(1);
        if let Some(after) = after {
            self.system.delayed_enqueue(
                self.handle(),
                None,
                MessageId::ASYNC,
                message![TimeoutMsg {
                    generation: self.timeout_generation,
                }],
                after,
            );
        }
    }
}

/// A request awaiting its response handler
#[must_use = "a request without `then` discards its response"]
pub struct PendingRequest<'a> {
    ctx: &'a mut ActorContext,
    id: u64,
}

impl PendingRequest<'_> {
    /// Handles the response; other messages are cached until it arrives
    pub fn then<F>(self, handler: F)
    where
        F: FnOnce(&mut ActorContext, Result<Message, RequestError>) + Send + 'static,
    {
        self.ctx.pending.insert(self.id, Box::new(handler));
        self.ctx.awaiting.push(self.id);
    }

    pub fn request_id(&self) -> u64 {
        self.id
    }
}
