//! Dispatch loop of event-based actors
//!
//! Every message popped from the mailbox is matched against the top of the
//! behavior stack. Messages that no handler accepts, and messages arriving
//! while a request awaits its response, go to the cache. Whenever the
//! behavior changes or a response handler runs, the cache is replayed in
//! arrival order before the mailbox is read again.

use crate::behavior::{Behavior, BehaviorStack, HandleResult, StackOp};
use crate::context::{ActorContext, Current};
use crate::error::RequestError;
use crate::handle::AbstractActor;
use crate::local::Resumable;
use crate::mailbox::{Mailbox, MailboxElement};
use lattice_codec::Message;
use lattice_types::{ExitMsg, ExitReason, SyncExitedMsg, SyncTimeoutMsg, TimeoutMsg};
use std::any::Any;
use std::collections::VecDeque;
use tracing::trace;

pub(crate) type InitFn = Box<dyn FnOnce(&mut ActorContext) -> Behavior + Send>;

pub(crate) struct EventState {
    pub(crate) ctx: ActorContext,
    stack: BehaviorStack,
    cache: VecDeque<MailboxElement>,
    init: Option<InitFn>,
}

impl EventState {
    pub(crate) fn new(ctx: ActorContext, init: InitFn) -> Self {
        Self {
            ctx,
            stack: BehaviorStack::default(),
            cache: VecDeque::new(),
            init: Some(init),
        }
    }

    pub(crate) fn take_cache(&mut self) -> VecDeque<MailboxElement> {
        self.stack.clear();
        std::mem::take(&mut self.cache)
    }

    pub(crate) fn run(&mut self, mailbox: &Mailbox, max_throughput: usize) -> Resumable {
        if let Some(init) = self.init.take() {
            let behavior = init(&mut self.ctx);
            self.ctx.ops.push(StackOp::Replace(behavior));
            self.settle();
        }

        for _ in 0..max_throughput.max(1) {
            if self.ctx.quit_reason().is_some() {
                return Resumable::Done;
            }
            match mailbox.try_pop() {
                Some(element) => {
                    self.ctx.this.metrics().record_message();
                    self.process(element);
                }
                None => {
                    if mailbox.try_block() {
                        return Resumable::Blocked;
                    }
                }
            }
        }

        if self.ctx.quit_reason().is_some() {
            Resumable::Done
        } else {
            Resumable::Yield
        }
    }

    fn process(&mut self, element: MailboxElement) {
        match self.invoke(&element) {
            Some(HandleResult::Handled) => self.settle(),
            Some(HandleResult::Skipped) | Some(HandleResult::Cached) => {
                self.cache.push_back(element);
            }
            None => {}
        }
    }

    /// Applies pending stack changes, replays the cache if anything changed
    /// and re-arms the behavior timeout
    fn settle(&mut self) {
        let changed = self.apply_ops();
        if self.finished() {
            return;
        }
        if changed {
            self.replay_cache();
            if self.finished() {
                return;
            }
        }
        let after = self.stack.top().and_then(|b| b.timeout_after());
        self.ctx.arm_timeout(after);
    }

    fn apply_ops(&mut self) -> bool {
        let mut changed = std::mem::take(&mut self.ctx.changed);
        for op in self.ctx.ops.drain(..) {
            self.stack.apply(op);
            changed = true;
        }
        changed
    }

    /// An actor without a usable behavior and without outstanding requests
    /// terminates normally
    fn finished(&mut self) -> bool {
        if self.ctx.quit_reason().is_some() {
            return true;
        }
        let idle = match self.stack.top() {
            None => true,
            Some(top) => top.is_empty() && self.ctx.pending.is_empty(),
        };
        if idle {
            self.ctx.quit(ExitReason::NORMAL);
        }
        idle
    }

    fn replay_cache(&mut self) {
        let mut index = 0;
        while index < self.cache.len() {
            if self.ctx.quit_reason().is_some() {
                return;
            }
            let Some(element) = self.cache.remove(index) else {
                break;
            };
            match self.invoke(&element) {
                Some(HandleResult::Handled) => {
                    if self.apply_ops() {
                        index = 0;
                    }
                }
                Some(HandleResult::Skipped) | Some(HandleResult::Cached) => {
                    self.cache.insert(index, element);
                    index += 1;
                }
                None => {}
            }
        }
    }

    /// `None` means the message was consumed without reaching a handler
    fn invoke(&mut self, element: &MailboxElement) -> Option<HandleResult> {
        let msg = &element.content;

        if element.mid.is_response() {
            return self.invoke_response(element);
        }

        if element.mid.is_async() {
            if let Some(exit) = single::<ExitMsg>(msg) {
                self.ctx.this.remove_link(&exit.source);
                if !self.ctx.trap_exit {
                    if !exit.reason.is_normal() {
                        trace!(
                            actor = %self.ctx.address(),
                            source = %exit.source,
                            reason = %exit.reason,
                            "Exiting with linked actor"
                        );
                        self.ctx.quit(exit.reason);
                    }
                    return None;
                }
            }
            if let Some(timeout) = single::<TimeoutMsg>(msg) {
                if timeout.generation != self.ctx.timeout_generation {
                    return None;
                }
                let top = self.stack.top()?;
                self.ctx.current = None;
                top.handle_timeout(&mut self.ctx);
                return Some(HandleResult::Handled);
            }
        }

        if !self.ctx.awaiting.is_empty() {
            return Some(HandleResult::Cached);
        }

        let current = Current {
            sender: element.sender.clone(),
            mid: element.mid,
        };
        self.ctx.current = Some(current.clone());
        let top = self.stack.top()?;
        let outcome = top.try_handle(&mut self.ctx, msg);
        self.ctx.current = None;
        match outcome {
            None => Some(HandleResult::Skipped),
            Some(reply) => {
                if let Some(reply) = reply {
                    self.ctx.deliver_reply(Some(current), reply);
                }
                Some(HandleResult::Handled)
            }
        }
    }

    fn invoke_response(&mut self, element: &MailboxElement) -> Option<HandleResult> {
        let id = element.mid.request_id();
        let Some(handler) = self.ctx.pending.remove(&id) else {
            trace!(actor = %self.ctx.address(), request = id, "Dropping stale response");
            return None;
        };
        self.ctx.awaiting.retain(|pending| *pending != id);

        let msg = &element.content;
        let result = if msg.is_single::<SyncTimeoutMsg>() {
            Err(RequestError::Timeout)
        } else if let Some(exited) = single::<SyncExitedMsg>(msg) {
            Err(RequestError::Exited(exited.reason))
        } else {
            Ok(Message::clone(msg))
        };

        self.ctx.current = Some(Current {
            sender: element.sender.clone(),
            mid: element.mid,
        });
        handler(&mut self.ctx, result);
        self.ctx.current = None;
        self.ctx.changed = true;
        Some(HandleResult::Handled)
    }
}

fn single<T: Any>(msg: &Message) -> Option<&T> {
    if msg.len() == 1 {
        msg.get::<T>(0)
    } else {
        None
    }
}
