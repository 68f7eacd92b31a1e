//! Actor namespace and proxy registry
//!
//! Resolves actor addresses to handles. Local addresses go through the
//! process-local `ActorRegistry`; remote addresses map to at most one live
//! `ActorProxy` per (node, actor id), created on demand by the injected
//! `ProxyFactory`.
//!
//! The namespace holds proxies weakly. A proxy whose last handle is dropped
//! removes its own slot (`release`); when a node's last proxy goes away the
//! factory is told through `last_proxy_exited`, which lets the middleman
//! close connections that only existed to serve lookups.
//!
//! Locking: no `Arc<ActorProxy>` is ever dropped while the proxy map lock
//! is held, since dropping the last one re-enters `release`.

use crate::error::{ActorError, Result};
use crate::handle::{AbstractActor, ActorHandle};
use crate::proxy::ActorProxy;
use crate::registry::ActorRegistry;
use lattice_codec::{
    CodecError, Deserializer, Element, HandleCodec, Serializer, UniformType,
};
use lattice_types::{ActorAddr, ActorId, ExitReason, NodeId};
use parking_lot::RwLock;
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

/// Type name of actor handles on the wire
pub const HANDLE_TYPE_NAME: &str = "@actor";

/// Creates proxies for remote actors; implemented by the middleman
pub trait ProxyFactory: Send + Sync {
    /// Called with the proxy map write lock held; must not call back into
    /// the namespace
    fn create(&self, addr: ActorAddr, namespace: Weak<ActorNamespace>) -> Result<Arc<ActorProxy>>;

    /// An address of `node` arrived over the connection to `via`
    fn learned_route(&self, _node: NodeId, _via: NodeId) {}

    /// The last proxy for `node` is gone
    fn last_proxy_exited(&self, _node: NodeId) {}
}

type ProxyMap = HashMap<NodeId, HashMap<ActorId, Weak<ActorProxy>>>;

pub struct ActorNamespace {
    node: NodeId,
    registry: Arc<ActorRegistry>,
    proxies: RwLock<ProxyMap>,
    factory: RwLock<Option<Arc<dyn ProxyFactory>>>,
    self_ref: Weak<ActorNamespace>,
}

impl ActorNamespace {
    pub fn new(node: NodeId, registry: Arc<ActorRegistry>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            node,
            registry,
            proxies: RwLock::new(HashMap::new()),
            factory: RwLock::new(None),
            self_ref: self_ref.clone(),
        })
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn set_factory(&self, factory: Arc<dyn ProxyFactory>) {
        *self.factory.write() = Some(factory);
    }

    pub fn clear_factory(&self) {
        self.factory.write().take();
    }

    fn factory(&self) -> Option<Arc<dyn ProxyFactory>> {
        self.factory.read().clone()
    }

    /// Existing live proxy, without side effects
    pub fn get(&self, node: NodeId, id: ActorId) -> Option<Arc<ActorProxy>> {
        self.proxies
            .read()
            .get(&node)
            .and_then(|proxies| proxies.get(&id))
            .and_then(Weak::upgrade)
    }

    /// Existing proxy, or a new one from the factory
    ///
    /// Concurrent callers for the same address all receive the same proxy.
    pub fn get_or_put(&self, node: NodeId, id: ActorId) -> Result<Arc<ActorProxy>> {
        if let Some(proxy) = self.get(node, id) {
            return Ok(proxy);
        }
        let factory = self.factory().ok_or(ActorError::NoProxyFactory { node })?;

        let mut proxies = self.proxies.write();
        let slot = proxies.entry(node).or_default();
        if let Some(existing) = slot.get(&id).and_then(Weak::upgrade) {
            return Ok(existing);
        }
        let addr = ActorAddr::new(id, node);
        match factory.create(addr, self.self_ref.clone()) {
            Ok(proxy) => {
                slot.insert(id, Arc::downgrade(&proxy));
                drop(proxies);
                debug!(proxy = %addr, "Created proxy");
                Ok(proxy)
            }
            Err(e) => {
                if slot.is_empty() {
                    proxies.remove(&node);
                }
                Err(e)
            }
        }
    }

    /// Registers a proxy created elsewhere; an occupied slot is kept
    pub fn put(&self, proxy: &Arc<ActorProxy>) -> bool {
        let addr = proxy.address();
        let mut proxies = self.proxies.write();
        let slot = proxies.entry(addr.node()).or_default();
        let occupied = slot
            .get(&addr.id())
            .map_or(false, |existing| existing.strong_count() > 0);
        if occupied {
            drop(proxies);
            warn!(proxy = %addr, "Proxy slot already occupied, keeping existing proxy");
            return false;
        }
        slot.insert(addr.id(), Arc::downgrade(proxy));
        true
    }

    /// Removes the proxy for (`node`, `id`)
    pub fn erase(&self, node: NodeId, id: ActorId) {
        let emptied = {
            let mut proxies = self.proxies.write();
            let emptied = match proxies.get_mut(&node) {
                Some(slot) => slot.remove(&id).is_some() && slot.is_empty(),
                None => false,
            };
            if emptied {
                proxies.remove(&node);
            }
            emptied
        };
        trace!(%node, actor_id = %id, "Erased proxy");
        if emptied {
            self.notify_last_proxy_exited(node);
        }
    }

    pub fn erase_proxy(&self, proxy: &ActorProxy) {
        let addr = proxy.address();
        self.erase(addr.node(), addr.id());
    }

    /// Removes every proxy for `node` and returns the ones still alive
    ///
    /// Does not call `last_proxy_exited`; the caller is tearing the node
    /// down already.
    pub fn erase_node(&self, node: NodeId) -> Vec<Arc<ActorProxy>> {
        let removed = self.proxies.write().remove(&node);
        removed
            .map(|slot| slot.into_values().filter_map(|w| w.upgrade()).collect())
            .unwrap_or_default()
    }

    /// Live proxies for `node`
    pub fn count_proxies(&self, node: NodeId) -> usize {
        self.proxies.read().get(&node).map_or(0, |slot| {
            slot.values().filter(|w| w.strong_count() > 0).count()
        })
    }

    pub fn proxies_of(&self, node: NodeId) -> Vec<Arc<ActorProxy>> {
        let proxies = self.proxies.read();
        proxies
            .get(&node)
            .map(|slot| slot.values().filter_map(Weak::upgrade).collect())
            .unwrap_or_default()
    }

    /// Nodes with at least one registered proxy
    pub fn nodes(&self) -> Vec<NodeId> {
        self.proxies.read().keys().copied().collect()
    }

    /// Drops the slot of a proxy whose last handle went away
    pub(crate) fn release(&self, addr: ActorAddr) {
        let emptied = {
            let mut proxies = self.proxies.write();
            let Some(slot) = proxies.get_mut(&addr.node()) else {
                return;
            };
            let dead = slot
                .get(&addr.id())
                .map_or(false, |weak| weak.strong_count() == 0);
            if !dead {
                return;
            }
            slot.remove(&addr.id());
            if slot.is_empty() {
                proxies.remove(&addr.node());
                true
            } else {
                false
            }
        };
        trace!(proxy = %addr, "Released proxy");
        if emptied {
            self.notify_last_proxy_exited(addr.node());
        }
    }

    fn notify_last_proxy_exited(&self, node: NodeId) {
        if let Some(factory) = self.factory() {
            debug!(%node, "Last proxy exited");
            factory.last_proxy_exited(node);
        }
    }

    /// Writes the 28-byte address of `handle`
    pub fn write(&self, sink: &mut Serializer<'_>, handle: &ActorHandle) {
        sink.write_addr(&handle.address());
    }

    /// Reads an address and resolves it; `via` is the node the bytes came from
    pub fn read(&self, source: &mut Deserializer<'_>, via: Option<NodeId>) -> Result<ActorHandle> {
        let addr = source.read_addr()?;
        self.resolve(addr, via)
    }

    /// Turns an address into a handle
    ///
    /// Unknown or exited local ids resolve to `ActorHandle::Dead`, never to
    /// an error. Remote addresses yield the node's proxy; an address for a
    /// third node learned through `via` records a route through `via` first.
    pub fn resolve(&self, addr: ActorAddr, via: Option<NodeId>) -> Result<ActorHandle> {
        if !addr.id().is_valid() {
            return Ok(ActorHandle::invalid());
        }
        let node = addr.node();
        if node == self.node {
            let (actor, reason) = self.registry.get_entry(addr.id());
            return Ok(match actor {
                Some(actor) => ActorHandle::Local(actor),
                None => ActorHandle::Dead {
                    addr,
                    reason: if reason.is_exited() {
                        reason
                    } else {
                        ExitReason::NORMAL
                    },
                },
            });
        }
        if !node.is_valid() {
            return Ok(ActorHandle::invalid());
        }
        if let Some(via) = via.filter(|via| *via != node) {
            if let Some(factory) = self.factory() {
                factory.learned_route(node, via);
            }
        }
        Ok(ActorHandle::Remote(self.get_or_put(node, addr.id())?))
    }

    /// Handle codec for messages arriving from `via` (or created locally)
    pub fn codec(&self, via: Option<NodeId>) -> HandleContext<'_> {
        HandleContext {
            namespace: self,
            via,
        }
    }
}

impl std::fmt::Debug for ActorNamespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorNamespace")
            .field("node", &self.node)
            .field("nodes", &self.proxies.read().len())
            .finish()
    }
}

/// `HandleCodec` bound to a namespace and the connection bytes arrive on
pub struct HandleContext<'a> {
    namespace: &'a ActorNamespace,
    via: Option<NodeId>,
}

impl HandleCodec for HandleContext<'_> {
    fn write_handle(
        &self,
        sink: &mut Serializer<'_>,
        handle: &dyn Element,
    ) -> lattice_codec::Result<()> {
        let handle = handle
            .as_any()
            .downcast_ref::<ActorHandle>()
            .ok_or_else(|| CodecError::mismatch(HANDLE_TYPE_NAME, handle.rust_type_name()))?;
        self.namespace.write(sink, handle);
        Ok(())
    }

    fn read_handle(&self, source: &mut Deserializer<'_>) -> lattice_codec::Result<Box<dyn Element>> {
        let handle = self
            .namespace
            .read(source, self.via)
            .map_err(|e| match e {
                ActorError::Codec(e) => e,
                other => CodecError::Serde {
                    name: HANDLE_TYPE_NAME.to_string(),
                    message: other.to_string(),
                },
            })?;
        Ok(Box::new(handle))
    }
}

/// Registry entry that lets actor handles travel inside messages
pub struct HandleTypeInfo;

impl UniformType for HandleTypeInfo {
    fn name(&self) -> &str {
        HANDLE_TYPE_NAME
    }

    fn native_type(&self) -> TypeId {
        TypeId::of::<ActorHandle>()
    }

    fn serialize(&self, value: &dyn Element, sink: &mut Serializer<'_>) -> lattice_codec::Result<()> {
        sink.write_handle(value)
    }

    fn deserialize(&self, source: &mut Deserializer<'_>) -> lattice_codec::Result<Box<dyn Element>> {
        source.read_handle()
    }

    fn create(&self, from: Option<&dyn Element>) -> lattice_codec::Result<Box<dyn Element>> {
        match from {
            Some(value) => value
                .as_any()
                .downcast_ref::<ActorHandle>()
                .map(|handle| Box::new(handle.clone()) as Box<dyn Element>)
                .ok_or_else(|| CodecError::mismatch(HANDLE_TYPE_NAME, value.rust_type_name())),
            None => Ok(Box::new(ActorHandle::invalid())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ProxyBackend;
    use lattice_codec::{message, Message, TypeRegistry};
    use lattice_types::MessageId;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        forwarded: Mutex<Vec<(ActorAddr, MessageId)>>,
    }

    impl ProxyBackend for Recorder {
        fn forward(&self, receiver: ActorAddr, _: Option<ActorHandle>, mid: MessageId, _: Message) {
            self.forwarded.lock().push((receiver, mid));
        }
        fn link(&self, _: ActorHandle, _: ActorAddr) {}
        fn unlink(&self, _: ActorAddr, _: ActorAddr) {}
    }

    #[derive(Default)]
    struct Factory {
        backend: Arc<Recorder>,
        created: AtomicUsize,
        emptied: Mutex<Vec<NodeId>>,
        routes: Mutex<Vec<(NodeId, NodeId)>>,
    }

    impl ProxyFactory for Factory {
        fn create(&self, addr: ActorAddr, ns: Weak<ActorNamespace>) -> Result<Arc<ActorProxy>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(ActorProxy::new(addr, ns, self.backend.clone())))
        }
        fn learned_route(&self, node: NodeId, via: NodeId) {
            self.routes.lock().push((node, via));
        }
        fn last_proxy_exited(&self, node: NodeId) {
            self.emptied.lock().push(node);
        }
    }

    fn setup() -> (Arc<ActorNamespace>, Arc<Factory>) {
        let ns = ActorNamespace::new(NodeId::new(1, [1; 20]), Arc::new(ActorRegistry::new()));
        let factory = Arc::new(Factory::default());
        ns.set_factory(factory.clone());
        (ns, factory)
    }

    #[test]
    fn test_get_or_put_reuses_live_proxy() {
        let (ns, factory) = setup();
        let remote = NodeId::new(2, [2; 20]);
        let a = ns.get_or_put(remote, ActorId::from_raw(7)).unwrap();
        let b = ns.get_or_put(remote, ActorId::from_raw(7)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        assert_eq!(ns.count_proxies(remote), 1);
    }

    #[test]
    fn test_dropping_last_handle_releases_slot() {
        let (ns, factory) = setup();
        let remote = NodeId::new(2, [2; 20]);
        let proxy = ns.get_or_put(remote, ActorId::from_raw(7)).unwrap();
        assert!(ns.get(remote, ActorId::from_raw(7)).is_some());
        drop(proxy);
        assert_eq!(ns.count_proxies(remote), 0);
        assert!(ns.nodes().is_empty());
        assert_eq!(*factory.emptied.lock(), vec![remote]);
    }

    #[test]
    fn test_kill_erases_and_notifies_once() {
        let (ns, factory) = setup();
        let remote = NodeId::new(2, [2; 20]);
        let proxy = ns.get_or_put(remote, ActorId::from_raw(3)).unwrap();
        assert!(proxy.kill(ExitReason::new(42)));
        assert!(!proxy.kill(ExitReason::new(43)));
        assert_eq!(ns.count_proxies(remote), 0);
        drop(proxy);
        assert_eq!(factory.emptied.lock().len(), 1);
    }

    #[test]
    fn test_put_keeps_occupied_slot() {
        let (ns, factory) = setup();
        let remote = NodeId::new(2, [2; 20]);
        let first = ns.get_or_put(remote, ActorId::from_raw(9)).unwrap();
        let second = Arc::new(ActorProxy::new(
            first.address(),
            Arc::downgrade(&ns),
            factory.backend.clone(),
        ));
        assert!(!ns.put(&second));
        assert!(Arc::ptr_eq(&ns.get(remote, ActorId::from_raw(9)).unwrap(), &first));
    }

    #[test]
    fn test_resolve_local_and_stale_ids() {
        let (ns, _) = setup();
        let gone = ActorId::next();
        ns.registry.erase(gone, ExitReason::new(42));
        match ns.resolve(ActorAddr::new(gone, ns.node()), None).unwrap() {
            ActorHandle::Dead { reason, .. } => assert_eq!(reason, ExitReason::new(42)),
            other => panic!("expected dead handle, got {other:?}"),
        }
        let never = ns
            .resolve(ActorAddr::new(ActorId::from_raw(999_999), ns.node()), None)
            .unwrap();
        assert!(!never.is_valid());
        assert!(!ns.resolve(ActorAddr::INVALID, None).unwrap().is_valid());
    }

    #[test]
    fn test_third_party_address_records_route() {
        let (ns, factory) = setup();
        let via = NodeId::new(2, [2; 20]);
        let third = NodeId::new(3, [3; 20]);
        let handle = ns
            .resolve(ActorAddr::new(ActorId::from_raw(1), third), Some(via))
            .unwrap();
        assert!(handle.is_remote());
        assert_eq!(*factory.routes.lock(), vec![(third, via)]);

        handle.send(None, message![1u32]);
        assert_eq!(factory.backend.forwarded.lock().len(), 1);
    }

    #[test]
    fn test_handles_roundtrip_through_codec() {
        let (ns, _) = setup();
        let registry = TypeRegistry::with_builtins(vec![Arc::new(HandleTypeInfo)]);
        let remote = ActorAddr::new(ActorId::from_raw(5), NodeId::new(2, [2; 20]));
        let handle = ns.resolve(remote, None).unwrap();

        let mut buf = bytes::BytesMut::new();
        let codec = ns.codec(None);
        Serializer::new(&mut buf, &registry)
            .with_handles(&codec)
            .write_message(&message![handle.clone(), 7u32])
            .unwrap();
        let decoded = Deserializer::new(&buf, &registry)
            .with_handles(&codec)
            .read_message()
            .unwrap();
        assert_eq!(decoded.get::<ActorHandle>(0), Some(&handle));
        assert_eq!(decoded.get::<u32>(1), Some(&7));
    }
}
