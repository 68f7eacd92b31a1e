//! Message handlers of event-based actors
//!
//! A `Behavior` is an ordered list of predicate/action pairs; the first
//! handler whose predicate accepts a message runs. Actors keep a stack of
//! behaviors (`become_stacked` pushes, `unbecome` pops) and always dispatch
//! against the top.

use crate::context::ActorContext;
use lattice_codec::Message;
use std::any::Any;
use std::fmt;
use std::time::Duration;

/// Result of matching one message against the current behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleResult {
    Handled,
    /// No handler matched; kept in the cache for a later behavior
    Skipped,
    /// Arrived while the actor awaits a response; kept in the cache
    Cached,
}

type Predicate = Box<dyn Fn(&Message) -> bool + Send>;
type Action = Box<dyn FnMut(&mut ActorContext, &Message) -> Option<Message> + Send>;
type TimeoutAction = Box<dyn FnMut(&mut ActorContext) + Send>;

struct Handler {
    predicate: Predicate,
    action: Action,
}

pub(crate) struct BehaviorTimeout {
    pub(crate) after: Duration,
    pub(crate) action: TimeoutAction,
}

/// Predicate/action handler list with an optional idle timeout
///
/// An action's return value is the reply: if the message was a request, it is
/// sent back to the requester as the response.
///
/// ```
/// use lattice_actors::Behavior;
/// use lattice_codec::message;
/// use lattice_types::Atom;
///
/// let behavior = Behavior::new()
///     .on_atom("ping", |_ctx, msg| {
///         let n = *msg.get::<i32>(1)?;
///         Some(message![Atom::from("pong"), n + 1])
///     })
///     .others(|_ctx, _msg| None);
/// assert_eq!(behavior.len(), 2);
/// ```
#[derive(Default)]
pub struct Behavior {
    handlers: Vec<Handler>,
    timeout: Option<BehaviorTimeout>,
}

impl Behavior {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<P, A>(mut self, predicate: P, action: A) -> Self
    where
        P: Fn(&Message) -> bool + Send + 'static,
        A: FnMut(&mut ActorContext, &Message) -> Option<Message> + Send + 'static,
    {
        self.handlers.push(Handler {
            predicate: Box::new(predicate),
            action: Box::new(action),
        });
        self
    }

    /// Matches messages whose first element is the atom `name`
    pub fn on_atom<A>(self, name: &str, action: A) -> Self
    where
        A: FnMut(&mut ActorContext, &Message) -> Option<Message> + Send + 'static,
    {
        let name = name.to_string();
        self.on(move |msg| msg.match_atom(0, &name), action)
    }

    /// Matches single-element messages of type `T`
    pub fn on_single<T: Any, A>(self, action: A) -> Self
    where
        A: FnMut(&mut ActorContext, &Message) -> Option<Message> + Send + 'static,
    {
        self.on(|msg| msg.is_single::<T>(), action)
    }

    /// Matches anything
    pub fn others<A>(self, action: A) -> Self
    where
        A: FnMut(&mut ActorContext, &Message) -> Option<Message> + Send + 'static,
    {
        self.on(|_| true, action)
    }

    /// Runs `action` if no message is handled within `after`
    pub fn after<A>(mut self, after: Duration, action: A) -> Self
    where
        A: FnMut(&mut ActorContext) + Send + 'static,
    {
        self.timeout = Some(BehaviorTimeout {
            after,
            action: Box::new(action),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// True if the behavior can neither handle a message nor time out
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty() && self.timeout.is_none()
    }

    pub(crate) fn timeout_after(&self) -> Option<Duration> {
        self.timeout.as_ref().map(|t| t.after)
    }

    /// Runs the first matching handler; `None` if nothing matched
    pub(crate) fn try_handle(
        &mut self,
        ctx: &mut ActorContext,
        msg: &Message,
    ) -> Option<Option<Message>> {
        let handler = self.handlers.iter_mut().find(|h| (h.predicate)(msg))?;
        Some((handler.action)(ctx, msg))
    }

    pub(crate) fn handle_timeout(&mut self, ctx: &mut ActorContext) -> bool {
        match self.timeout.as_mut() {
            Some(timeout) => {
                (timeout.action)(ctx);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for Behavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Behavior")
            .field("handlers", &self.handlers.len())
            .field("timeout", &self.timeout_after())
            .finish()
    }
}

/// Pending change to the behavior stack, applied after the handler returns
pub(crate) enum StackOp {
    Replace(Behavior),
    Push(Behavior),
    Pop,
}

/// The actor's behaviors, top last
#[derive(Default)]
pub(crate) struct BehaviorStack {
    stack: Vec<Behavior>,
}

impl BehaviorStack {
    pub(crate) fn top(&mut self) -> Option<&mut Behavior> {
        self.stack.last_mut()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    pub(crate) fn apply(&mut self, op: StackOp) {
        match op {
            StackOp::Replace(behavior) => {
                self.stack.pop();
                self.stack.push(behavior);
            }
            StackOp::Push(behavior) => self.stack.push(behavior),
            StackOp::Pop => {
                self.stack.pop();
            }
        }
    }

    pub(crate) fn clear(&mut self) {
        self.stack.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_ops() {
        let mut stack = BehaviorStack::default();
        stack.apply(StackOp::Push(Behavior::new().others(|_, _| None)));
        stack.apply(StackOp::Push(Behavior::new()));
        assert!(stack.top().unwrap().is_empty());
        stack.apply(StackOp::Replace(
            Behavior::new().after(Duration::from_millis(5), |_| {}),
        ));
        assert_eq!(
            stack.top().unwrap().timeout_after(),
            Some(Duration::from_millis(5))
        );
        stack.apply(StackOp::Pop);
        assert_eq!(stack.top().unwrap().len(), 1);
        stack.apply(StackOp::Pop);
        assert!(stack.is_empty());
    }
}
