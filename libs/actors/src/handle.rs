//! Location-transparent actor handles
//!
//! `ActorHandle` is the only way user code refers to an actor. Local actors,
//! proxies for remote actors and unresolvable addresses share one API through
//! the `AbstractActor` trait; equality and hashing use the address only.

use crate::local::LocalActor;
use crate::proxy::ActorProxy;
use lattice_codec::{message, Message};
use lattice_types::{ActorAddr, DownMsg, ExitMsg, ExitReason, MessageId, SyncExitedMsg};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::trace;

/// Capabilities shared by every kind of actor
pub trait AbstractActor: Send + Sync {
    fn address(&self) -> ActorAddr;

    /// Delivers a message; never blocks and never fails silently
    fn enqueue(&self, sender: Option<ActorHandle>, mid: MessageId, content: Message);

    /// Registers an exit observer; fires immediately if already exited
    fn attach(&self, attachable: Attachable);

    /// Removes monitors registered by `observer`
    fn detach(&self, observer: &ActorAddr);

    /// Records a link to `other`; if already exited, `other` receives an
    /// `ExitMsg` instead
    fn add_link(&self, other: ActorHandle);

    fn remove_link(&self, other: &ActorAddr);

    /// `NOT_EXITED` while alive
    fn exit_reason(&self) -> ExitReason;
}

/// Observer of an actor's termination
pub enum Attachable {
    /// Sends `DownMsg` to the observer
    Monitor { observer: ActorHandle },
    /// Runs once with the exit reason
    Functor(Box<dyn FnOnce(ExitReason) + Send>),
}

impl Attachable {
    pub fn functor(f: impl FnOnce(ExitReason) + Send + 'static) -> Self {
        Attachable::Functor(Box::new(f))
    }

    pub(crate) fn is_monitor_of(&self, observer: &ActorAddr) -> bool {
        matches!(self, Attachable::Monitor { observer: o } if o.address() == *observer)
    }

    pub(crate) fn fire(self, source: ActorAddr, reason: ExitReason) {
        match self {
            Attachable::Monitor { observer } => {
                observer.enqueue(None, MessageId::ASYNC, message![DownMsg { source, reason }]);
            }
            Attachable::Functor(f) => f(reason),
        }
    }
}

impl fmt::Debug for Attachable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attachable::Monitor { observer } => f
                .debug_struct("Monitor")
                .field("observer", &observer.address())
                .finish(),
            Attachable::Functor(_) => f.write_str("Functor"),
        }
    }
}

/// Handle to any actor
#[derive(Clone)]
pub enum ActorHandle {
    Local(Arc<LocalActor>),
    Remote(Arc<ActorProxy>),
    /// An address that no longer (or never did) resolve to an actor
    Dead { addr: ActorAddr, reason: ExitReason },
}

impl ActorHandle {
    /// The "no actor" handle
    pub fn invalid() -> Self {
        ActorHandle::Dead {
            addr: ActorAddr::INVALID,
            reason: ExitReason::NOT_EXITED,
        }
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self, ActorHandle::Dead { .. })
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, ActorHandle::Remote(_))
    }

    pub fn as_local(&self) -> Option<&Arc<LocalActor>> {
        match self {
            ActorHandle::Local(actor) => Some(actor),
            _ => None,
        }
    }

    pub fn as_proxy(&self) -> Option<&Arc<ActorProxy>> {
        match self {
            ActorHandle::Remote(proxy) => Some(proxy),
            _ => None,
        }
    }

    /// Asynchronous send
    pub fn send(&self, sender: Option<&ActorHandle>, content: Message) {
        self.enqueue(sender.cloned(), MessageId::ASYNC, content);
    }

    fn inner(&self) -> Option<&dyn AbstractActor> {
        match self {
            ActorHandle::Local(actor) => Some(actor.as_ref()),
            ActorHandle::Remote(proxy) => Some(proxy.as_ref()),
            ActorHandle::Dead { .. } => None,
        }
    }
}

/// Replies to a request whose receiver has already exited
pub(crate) fn bounce(
    source: ActorAddr,
    reason: ExitReason,
    sender: Option<ActorHandle>,
    mid: MessageId,
) -> bool {
    match sender {
        Some(sender) if mid.is_request() => {
            trace!(%source, %reason, "Bouncing request");
            sender.enqueue(
                None,
                mid.response_id(),
                message![SyncExitedMsg { source, reason }],
            );
            true
        }
        _ => false,
    }
}

impl AbstractActor for ActorHandle {
    fn address(&self) -> ActorAddr {
        match self {
            ActorHandle::Local(actor) => actor.address(),
            ActorHandle::Remote(proxy) => proxy.address(),
            ActorHandle::Dead { addr, .. } => *addr,
        }
    }

    fn enqueue(&self, sender: Option<ActorHandle>, mid: MessageId, content: Message) {
        match self.inner() {
            Some(actor) => actor.enqueue(sender, mid, content),
            None => {
                let reason = self.exit_reason();
                bounce(self.address(), reason, sender, mid);
            }
        }
    }

    fn attach(&self, attachable: Attachable) {
        match self.inner() {
            Some(actor) => actor.attach(attachable),
            None => attachable.fire(self.address(), self.exit_reason()),
        }
    }

    fn detach(&self, observer: &ActorAddr) {
        if let Some(actor) = self.inner() {
            actor.detach(observer);
        }
    }

    fn add_link(&self, other: ActorHandle) {
        match self.inner() {
            Some(actor) => actor.add_link(other),
            None => other.enqueue(
                None,
                MessageId::ASYNC,
                message![ExitMsg {
                    source: self.address(),
                    reason: self.exit_reason(),
                }],
            ),
        }
    }

    fn remove_link(&self, other: &ActorAddr) {
        if let Some(actor) = self.inner() {
            actor.remove_link(other);
        }
    }

    fn exit_reason(&self) -> ExitReason {
        match self {
            ActorHandle::Local(actor) => actor.exit_reason(),
            ActorHandle::Remote(proxy) => proxy.exit_reason(),
            ActorHandle::Dead { reason, .. } if reason.is_exited() => *reason,
            ActorHandle::Dead { .. } => ExitReason::NORMAL,
        }
    }
}

impl PartialEq for ActorHandle {
    fn eq(&self, other: &Self) -> bool {
        self.address() == other.address()
    }
}

impl Eq for ActorHandle {}

impl Hash for ActorHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address().hash(state);
    }
}

impl fmt::Debug for ActorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActorHandle::Local(_) => write!(f, "Local({})", self.address()),
            ActorHandle::Remote(_) => write!(f, "Remote({})", self.address()),
            ActorHandle::Dead { addr, reason } => write!(f, "Dead({addr}, {reason})"),
        }
    }
}

impl fmt::Display for ActorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.address(), f)
    }
}

impl Default for ActorHandle {
    fn default() -> Self {
        Self::invalid()
    }
}
