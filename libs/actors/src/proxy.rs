//! Local stand-ins for remote actors
//!
//! An `ActorProxy` forwards everything to a `ProxyBackend` (the middleman)
//! and mirrors the remote actor's lifecycle locally: monitors and links
//! registered here fire when the backend reports the remote exit through
//! `kill`. Requests sent through a proxy are remembered until their
//! response comes back, so a lost connection can answer them with
//! `SyncExitedMsg`.

use crate::handle::{bounce, AbstractActor, ActorHandle, Attachable};
use crate::namespace::ActorNamespace;
use lattice_codec::{message, Message};
use lattice_types::{ActorAddr, ExitMsg, ExitReason, MessageId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

/// Transport behind a proxy
///
/// Implemented by the network layer. Calls must not block on I/O.
pub trait ProxyBackend: Send + Sync {
    /// Ships a message to `receiver` on its node
    fn forward(
        &self,
        receiver: ActorAddr,
        sender: Option<ActorHandle>,
        mid: MessageId,
        content: Message,
    );

    /// Asks the remote node to link `remote` with the local actor `local`
    fn link(&self, local: ActorHandle, remote: ActorAddr);

    fn unlink(&self, local: ActorAddr, remote: ActorAddr);
}

#[derive(Default)]
struct ProxyState {
    reason: ExitReason,
    attachables: Vec<Attachable>,
    links: HashMap<ActorAddr, ActorHandle>,
    /// Requests forwarded to the remote actor, still awaiting a response
    pending: Vec<(ActorHandle, MessageId)>,
}

pub struct ActorProxy {
    addr: ActorAddr,
    namespace: Weak<ActorNamespace>,
    backend: Arc<dyn ProxyBackend>,
    state: Mutex<ProxyState>,
}

impl ActorProxy {
    pub fn new(
        addr: ActorAddr,
        namespace: Weak<ActorNamespace>,
        backend: Arc<dyn ProxyBackend>,
    ) -> Self {
        Self {
            addr,
            namespace,
            backend,
            state: Mutex::new(ProxyState::default()),
        }
    }

    /// Records a link without telling the remote node
    ///
    /// Used when the remote side initiated the link.
    pub fn local_link(&self, other: ActorHandle) {
        let mut state = self.state.lock();
        if state.reason.is_exited() {
            let reason = state.reason;
            drop(state);
            other.enqueue(None, MessageId::ASYNC, exit_msg(self.addr, reason));
        } else {
            state.links.insert(other.address(), other);
        }
    }

    pub fn local_unlink(&self, other: &ActorAddr) {
        self.state.lock().links.remove(other);
    }

    /// Forgets a forwarded request once its response arrived
    pub fn response_received(&self, requester: &ActorAddr, request_id: u64) {
        self.state.lock().pending.retain(|(sender, mid)| {
            !(sender.address() == *requester && mid.request_id() == request_id)
        });
    }

    pub fn pending_requests(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_exited(&self) -> bool {
        self.state.lock().reason.is_exited()
    }

    /// Terminates the proxy after the remote actor exited or became
    /// unreachable
    ///
    /// Removes it from the namespace, fires monitors, sends `ExitMsg` to
    /// links and fails every pending request. Returns `false` if the proxy
    /// was already dead.
    pub fn kill(&self, reason: ExitReason) -> bool {
        // The reason stays set: a dead proxy bounces and fires on attach
        let (attachables, links, pending) = {
            let mut state = self.state.lock();
            if state.reason.is_exited() {
                return false;
            }
            state.reason = reason;
            (
                std::mem::take(&mut state.attachables),
                std::mem::take(&mut state.links),
                std::mem::take(&mut state.pending),
            )
        };

        if let Some(namespace) = self.namespace.upgrade() {
            namespace.erase(self.addr.node(), self.addr.id());
        }
        debug!(proxy = %self.addr, %reason, "Proxy killed");

        for attachable in attachables {
            attachable.fire(self.addr, reason);
        }
        for link in links.into_values() {
            link.enqueue(None, MessageId::ASYNC, exit_msg(self.addr, reason));
        }
        for (sender, mid) in pending {
            bounce(self.addr, reason, Some(sender), mid);
        }
        true
    }
}

fn exit_msg(source: ActorAddr, reason: ExitReason) -> Message {
    message![ExitMsg { source, reason }]
}

/// An exiting linked actor telling this proxy about its own exit
fn is_link_exit(
    state: &ProxyState,
    sender: Option<&ActorHandle>,
    mid: MessageId,
    content: &Message,
) -> bool {
    let (Some(sender), true) = (sender, mid.is_async()) else {
        return false;
    };
    if !content.is_single::<ExitMsg>() {
        return false;
    }
    let from = sender.address();
    content
        .get::<ExitMsg>(0)
        .map_or(false, |exit| exit.source == from && state.links.contains_key(&from))
}

impl AbstractActor for ActorProxy {
    fn address(&self) -> ActorAddr {
        self.addr
    }

    fn enqueue(&self, sender: Option<ActorHandle>, mid: MessageId, content: Message) {
        let mut state = self.state.lock();
        if state.reason.is_exited() {
            let reason = state.reason;
            drop(state);
            bounce(self.addr, reason, sender, mid);
            return;
        }
        if is_link_exit(&state, sender.as_ref(), mid, &content) {
            // The remote node learns about this exit from its own proxy of
            // the sender (MONITOR / KILL_PROXY); forwarding would deliver
            // the ExitMsg twice.
            if let Some(sender) = &sender {
                state.links.remove(&sender.address());
            }
            trace!(proxy = %self.addr, "Dropped link exit notification");
            return;
        }
        if mid.is_request() {
            if let Some(sender) = &sender {
                state.pending.push((sender.clone(), mid));
            }
        }
        // Forwarding under the lock keeps the order of concurrent senders
        // identical to the order the backend sees.
        self.backend.forward(self.addr, sender, mid, content);
    }

    fn attach(&self, attachable: Attachable) {
        let mut state = self.state.lock();
        if state.reason.is_exited() {
            let reason = state.reason;
            drop(state);
            attachable.fire(self.addr, reason);
        } else {
            state.attachables.push(attachable);
        }
    }

    fn detach(&self, observer: &ActorAddr) {
        self.state
            .lock()
            .attachables
            .retain(|a| !a.is_monitor_of(observer));
    }

    fn add_link(&self, other: ActorHandle) {
        let mut state = self.state.lock();
        if state.reason.is_exited() {
            let reason = state.reason;
            drop(state);
            other.enqueue(None, MessageId::ASYNC, exit_msg(self.addr, reason));
            return;
        }
        if state.links.insert(other.address(), other.clone()).is_none() {
            drop(state);
            trace!(proxy = %self.addr, local = %other.address(), "Linking remote actor");
            self.backend.link(other, self.addr);
        }
    }

    fn remove_link(&self, other: &ActorAddr) {
        let removed = self.state.lock().links.remove(other).is_some();
        if removed {
            self.backend.unlink(*other, self.addr);
        }
    }

    fn exit_reason(&self) -> ExitReason {
        self.state.lock().reason
    }
}

impl Drop for ActorProxy {
    fn drop(&mut self) {
        if let Some(namespace) = self.namespace.upgrade() {
            namespace.release(self.addr);
        }
    }
}

impl fmt::Debug for ActorProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorProxy")
            .field("addr", &self.addr)
            .field("reason", &self.exit_reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::ActorSystem;
    use lattice_types::{ActorId, DownMsg, NodeId, SyncExitedMsg};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Counting {
        forwarded: AtomicUsize,
    }

    impl ProxyBackend for Counting {
        fn forward(&self, _: ActorAddr, _: Option<ActorHandle>, _: MessageId, _: Message) {
            self.forwarded.fetch_add(1, Ordering::SeqCst);
        }
        fn link(&self, _: ActorHandle, _: ActorAddr) {}
        fn unlink(&self, _: ActorAddr, _: ActorAddr) {}
    }

    fn proxy(backend: Arc<Counting>) -> ActorProxy {
        let addr = ActorAddr::new(ActorId::from_raw(11), NodeId::new(77, [7; 20]));
        ActorProxy::new(addr, Weak::new(), backend)
    }

    #[test]
    fn test_killed_proxy_stays_dead() {
        let backend = Arc::new(Counting::default());
        let proxy = proxy(backend.clone());
        assert!(proxy.kill(ExitReason::new(42)));
        assert!(proxy.is_exited());
        assert_eq!(proxy.exit_reason(), ExitReason::new(42));
        assert!(!proxy.kill(ExitReason::new(43)));
        assert_eq!(proxy.exit_reason(), ExitReason::new(42));

        proxy.enqueue(None, MessageId::ASYNC, message![1u32]);
        assert_eq!(backend.forwarded.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_request_after_kill_bounces() {
        let system = ActorSystem::builder().build().unwrap();
        let backend = Arc::new(Counting::default());
        let proxy = proxy(backend.clone());
        proxy.kill(ExitReason::new(42));

        let mut me = system.scoped();
        let mid = MessageId::request(1);
        proxy.enqueue(Some(me.handle()), mid, message![1u32]);
        let env = me.receive(Some(Duration::from_secs(5))).unwrap().unwrap();
        assert_eq!(env.mid, mid.response_id());
        let exited = env.content.get::<SyncExitedMsg>(0).unwrap();
        assert_eq!(exited.reason, ExitReason::new(42));
        assert_eq!(exited.source, proxy.address());
        assert_eq!(backend.forwarded.load(Ordering::SeqCst), 0);
        drop(me);
        system.shutdown();
    }

    #[test]
    fn test_pending_request_bounces_once_on_kill() {
        let system = ActorSystem::builder().build().unwrap();
        let proxy = proxy(Arc::new(Counting::default()));
        let mut me = system.scoped();
        let mid = MessageId::request(9);
        proxy.enqueue(Some(me.handle()), mid, message![1u32]);
        assert_eq!(proxy.pending_requests(), 1);

        proxy.kill(ExitReason::REMOTE_LINK_UNREACHABLE);
        proxy.kill(ExitReason::new(5));
        assert_eq!(proxy.pending_requests(), 0);
        let env = me.receive(Some(Duration::from_secs(5))).unwrap().unwrap();
        assert!(env.content.is_single::<SyncExitedMsg>());
        assert!(me.receive(Some(Duration::from_millis(100))).unwrap().is_none());
        drop(me);
        system.shutdown();
    }

    #[test]
    fn test_monitor_after_kill_fires_immediately() {
        let system = ActorSystem::builder().build().unwrap();
        let proxy = proxy(Arc::new(Counting::default()));
        proxy.kill(ExitReason::new(42));

        let mut me = system.scoped();
        proxy.attach(Attachable::Monitor { observer: me.handle() });
        let env = me.receive(Some(Duration::from_secs(5))).unwrap().unwrap();
        let down = env.content.get::<DownMsg>(0).unwrap();
        assert_eq!(down.source, proxy.address());
        assert_eq!(down.reason, ExitReason::new(42));
        drop(me);
        system.shutdown();
    }
}
