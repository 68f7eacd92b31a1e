//! Middleman: the network I/O event loop of a node
//!
//! One dedicated thread runs a single-threaded tokio runtime. The event
//! loop on that thread exclusively owns the routing table, every BASP
//! connection and the acceptors; other threads (actors, proxies, the
//! `Node` API) only post `Command`s to it. Because proxies post their
//! messages in send order and each connection has one ordered write queue,
//! per-sender FIFO order holds across the wire.
//!
//! ```text
//!  actor ─▶ ActorProxy ─▶ Outbox ──Command──▶ EventLoop ──Bytes──▶ writer task ─▶ socket
//!                                                ▲
//!  socket ─▶ reader task ──SocketEvent───────────┘ ─▶ BaspConnection ─▶ deliver / relay / control
//! ```

use crate::basp::{
    encode_client_handshake, BaspConnection, BaspEvent, ControlMessage, Role, ServerHandshake,
};
use crate::error::{NetworkError, Result};
use crate::metrics::{MiddlemanMetrics, MiddlemanStats};
use crate::router::{ConnectionId, Route, Router};
use crate::tcp::{self, SocketEvent};
use bytes::Bytes;
use lattice_actors::{
    AbstractActor, ActorError, ActorHandle, ActorNamespace, ActorProxy, ActorSystem, Attachable,
    ProxyBackend, ProxyFactory,
};
use lattice_codec::{message, FrameHeader, Message};
use lattice_config::MiddlemanConfig;
use lattice_types::{ActorAddr, ActorId, ExitReason, MessageId, NodeId, SyncExitedMsg};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

/// Requests marshaled onto the event loop thread
pub(crate) enum Command {
    Publish {
        actor: ActorHandle,
        host: String,
        port: u16,
        reply: oneshot::Sender<Result<u16>>,
    },
    Unpublish {
        port: u16,
        reply: oneshot::Sender<bool>,
    },
    Connect {
        host: String,
        port: u16,
        expected: Vec<String>,
        reply: oneshot::Sender<Result<ActorHandle>>,
    },
    Forward {
        header: FrameHeader,
        content: Message,
    },
    Link {
        local: ActorAddr,
        remote: ActorAddr,
    },
    Unlink {
        local: ActorAddr,
        remote: ActorAddr,
    },
    /// A proxy for `addr` was created; ask its node for `KILL_PROXY`
    Monitor {
        addr: ActorAddr,
    },
    /// A local actor monitored by `requester` exited
    KillProxy {
        requester: NodeId,
        actor: ActorId,
        reason: ExitReason,
    },
    LearnedRoute {
        node: NodeId,
        via: NodeId,
    },
    LastProxyExited {
        node: NodeId,
    },
    HandshakeTimeout {
        connection: ConnectionId,
    },
    Peers {
        reply: oneshot::Sender<Vec<NodeId>>,
    },
    Route {
        node: NodeId,
        reply: oneshot::Sender<Option<Route>>,
    },
    Socket(SocketEvent),
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

impl From<SocketEvent> for Command {
    fn from(event: SocketEvent) -> Self {
        Command::Socket(event)
    }
}

/// Proxy transport: posts everything to the event loop
struct Outbox {
    commands: mpsc::UnboundedSender<Command>,
}

impl Outbox {
    fn post(&self, command: Command) -> bool {
        self.commands.send(command).is_ok()
    }
}

impl ProxyBackend for Outbox {
    fn forward(
        &self,
        receiver: ActorAddr,
        sender: Option<ActorHandle>,
        mid: MessageId,
        content: Message,
    ) {
        let from = sender
            .as_ref()
            .map_or(ActorAddr::INVALID, |sender| sender.address());
        let header = FrameHeader::new(from, receiver, mid);
        if !self.post(Command::Forward { header, content }) && mid.is_request() {
            if let Some(sender) = sender {
                sender.enqueue(
                    None,
                    mid.response_id(),
                    message![SyncExitedMsg {
                        source: receiver,
                        reason: ExitReason::REMOTE_LINK_UNREACHABLE,
                    }],
                );
            }
        }
    }

    fn link(&self, local: ActorHandle, remote: ActorAddr) {
        self.post(Command::Link {
            local: local.address(),
            remote,
        });
    }

    fn unlink(&self, local: ActorAddr, remote: ActorAddr) {
        self.post(Command::Unlink { local, remote });
    }
}

struct MiddlemanProxyFactory {
    outbox: Arc<Outbox>,
}

impl ProxyFactory for MiddlemanProxyFactory {
    fn create(
        &self,
        addr: ActorAddr,
        namespace: Weak<ActorNamespace>,
    ) -> lattice_actors::Result<Arc<ActorProxy>> {
        if !self.outbox.post(Command::Monitor { addr }) {
            return Err(ActorError::proxy_creation(addr, "middleman is shut down"));
        }
        let backend: Arc<dyn ProxyBackend> = self.outbox.clone();
        Ok(Arc::new(ActorProxy::new(addr, namespace, backend)))
    }

    fn learned_route(&self, node: NodeId, via: NodeId) {
        self.outbox.post(Command::LearnedRoute { node, via });
    }

    fn last_proxy_exited(&self, node: NodeId) {
        self.outbox.post(Command::LastProxyExited { node });
    }
}

/// Handle to a running middleman; cheap to clone
#[derive(Clone)]
pub struct Middleman {
    inner: Arc<MiddlemanInner>,
}

struct MiddlemanInner {
    node: NodeId,
    commands: mpsc::UnboundedSender<Command>,
    metrics: Arc<MiddlemanMetrics>,
    namespace: Arc<ActorNamespace>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Middleman {
    /// Starts the event loop thread and attaches it to `system`'s namespace
    pub fn start(system: &ActorSystem) -> Result<Self> {
        let (commands, receiver) = mpsc::unbounded_channel();
        let metrics = Arc::new(MiddlemanMetrics::default());
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let event_loop = EventLoop::new(system.clone(), commands.clone(), Arc::clone(&metrics));
        let thread = std::thread::Builder::new()
            .name("lattice-middleman".to_string())
            .spawn(move || runtime.block_on(event_loop.run(receiver)))?;

        let outbox = Arc::new(Outbox {
            commands: commands.clone(),
        });
        system
            .namespace()
            .set_factory(Arc::new(MiddlemanProxyFactory { outbox }));

        info!(node = %system.node(), "Middleman started");
        Ok(Self {
            inner: Arc::new(MiddlemanInner {
                node: system.node(),
                commands,
                metrics,
                namespace: Arc::clone(system.namespace()),
                thread: Mutex::new(Some(thread)),
            }),
        })
    }

    pub fn node(&self) -> NodeId {
        self.inner.node
    }

    /// Sends `command` built around a reply channel and waits for the answer
    ///
    /// Must not be called from inside a tokio runtime.
    fn call<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.inner
            .commands
            .send(command(reply))
            .map_err(|_| NetworkError::Shutdown)?;
        response.blocking_recv().map_err(|_| NetworkError::Shutdown)
    }

    /// Accepts connections for `actor` on `host:port`; returns the bound port
    pub fn publish(&self, actor: &ActorHandle, host: &str, port: u16) -> Result<u16> {
        let actor = actor.clone();
        let host = host.to_string();
        self.call(|reply| Command::Publish {
            actor,
            host,
            port,
            reply,
        })?
    }

    /// Stops accepting on `port`; existing connections stay open
    pub fn unpublish(&self, port: u16) -> Result<bool> {
        self.call(|reply| Command::Unpublish { port, reply })
    }

    /// Connects to a published actor whose interface equals `expected`
    /// (compared as sets; empty for untyped actors)
    pub fn connect(&self, host: &str, port: u16, expected: Vec<String>) -> Result<ActorHandle> {
        let host = host.to_string();
        self.call(|reply| Command::Connect {
            host,
            port,
            expected,
            reply,
        })?
    }

    /// Nodes with a direct connection
    pub fn peers(&self) -> Result<Vec<NodeId>> {
        self.call(|reply| Command::Peers { reply })
    }

    /// Current route to `node`, direct or through a relay
    pub fn route(&self, node: NodeId) -> Result<Option<Route>> {
        self.call(|reply| Command::Route { node, reply })
    }

    pub fn stats(&self) -> MiddlemanStats {
        self.inner.metrics.snapshot()
    }

    pub fn metrics_handle(&self) -> Arc<MiddlemanMetrics> {
        Arc::clone(&self.inner.metrics)
    }

    pub fn is_running(&self) -> bool {
        !self.inner.commands.is_closed()
    }

    /// Closes every connection and stops the event loop thread
    ///
    /// Proxies of connected nodes are killed with `REMOTE_LINK_UNREACHABLE`.
    pub fn shutdown(&self) {
        self.inner.namespace.clear_factory();
        let (reply, done) = oneshot::channel();
        if self.inner.commands.send(Command::Shutdown { reply }).is_ok() {
            let _ = done.blocking_recv();
        }
        if let Some(thread) = self.inner.thread.lock().take() {
            if thread.join().is_err() {
                error!("Middleman thread panicked");
            }
        }
    }
}

impl Drop for MiddlemanInner {
    fn drop(&mut self) {
        self.namespace.clear_factory();
        let (reply, _) = oneshot::channel();
        let _ = self.commands.send(Command::Shutdown { reply });
    }
}

impl std::fmt::Debug for Middleman {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Middleman")
            .field("node", &self.inner.node)
            .field("stats", &self.stats())
            .finish()
    }
}

/// A `publish` call waiting for its listener
struct PendingPublish {
    actor: ActorHandle,
    reply: oneshot::Sender<Result<u16>>,
}

/// A `remote_actor` call waiting for its handshake
struct PendingLookup {
    expected: Vec<String>,
    reply: oneshot::Sender<Result<ActorHandle>>,
}

struct Connection {
    basp: BaspConnection,
    outgoing: mpsc::UnboundedSender<Bytes>,
    reader: tokio::task::JoinHandle<()>,
    remote: SocketAddr,
    lookup: Option<PendingLookup>,
    /// Close once the peer's last proxy is gone (outbound lookups only)
    stop_on_last_proxy_exited: bool,
}

struct Acceptor {
    actor: ActorHandle,
    task: tokio::task::JoinHandle<()>,
}

struct EventLoop {
    system: ActorSystem,
    node: NodeId,
    config: MiddlemanConfig,
    commands: mpsc::UnboundedSender<Command>,
    metrics: Arc<MiddlemanMetrics>,
    router: Router,
    connections: HashMap<ConnectionId, Connection>,
    acceptors: HashMap<u16, Acceptor>,
    connecting: HashMap<u64, PendingLookup>,
    binding: HashMap<u64, PendingPublish>,
    next_id: u64,
}

impl EventLoop {
    fn new(
        system: ActorSystem,
        commands: mpsc::UnboundedSender<Command>,
        metrics: Arc<MiddlemanMetrics>,
    ) -> Self {
        Self {
            node: system.node(),
            config: system.config().middleman.clone(),
            system,
            commands,
            metrics,
            router: Router::new(),
            connections: HashMap::new(),
            acceptors: HashMap::new(),
            connecting: HashMap::new(),
            binding: HashMap::new(),
            next_id: 1,
        }
    }

    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<Command>) {
        debug!(node = %self.node, "Middleman event loop running");
        while let Some(command) = receiver.recv().await {
            if !self.handle(command) {
                break;
            }
        }
        debug!(node = %self.node, "Middleman event loop stopped");
    }

    /// Returns `false` once the loop should stop
    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Publish {
                actor,
                host,
                port,
                reply,
            } => self.publish(actor, host, port, reply),
            Command::Unpublish { port, reply } => {
                let _ = reply.send(self.unpublish(port));
            }
            Command::Connect {
                host,
                port,
                expected,
                reply,
            } => self.connect(host, port, expected, reply),
            Command::Forward { header, content } => self.dispatch(header, content),
            Command::Link { local, remote } => self.send_control(
                remote.node(),
                ControlMessage::Link {
                    from: local,
                    to: remote,
                },
            ),
            Command::Unlink { local, remote } => self.send_control(
                remote.node(),
                ControlMessage::Unlink {
                    from: local,
                    to: remote,
                },
            ),
            Command::Monitor { addr } => self.send_control(
                addr.node(),
                ControlMessage::Monitor {
                    node: self.node,
                    actor: addr.id(),
                },
            ),
            Command::KillProxy {
                requester,
                actor,
                reason,
            } => self.send_control(
                requester,
                ControlMessage::KillProxy {
                    node: self.node,
                    actor,
                    reason,
                },
            ),
            Command::LearnedRoute { node, via } => {
                self.router.announce_route(node, via);
            }
            Command::LastProxyExited { node } => self.last_proxy_exited(node),
            Command::HandshakeTimeout { connection } => self.handshake_timeout(connection),
            Command::Peers { reply } => {
                let _ = reply.send(self.router.peers());
            }
            Command::Route { node, reply } => {
                let _ = reply.send(self.router.lookup(node));
            }
            Command::Socket(event) => self.socket_event(event),
            Command::Shutdown { reply } => {
                self.shutdown();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    // --- acceptors and connection setup ---

    fn publish(
        &mut self,
        actor: ActorHandle,
        host: String,
        port: u16,
        reply: oneshot::Sender<Result<u16>>,
    ) {
        if actor.as_local().is_none() {
            let _ = reply.send(Err(NetworkError::network(format!(
                "only local actors can be published, got {}",
                actor.address()
            ))));
            return;
        }
        if port != 0 && self.acceptors.contains_key(&port) {
            let _ = reply.send(Err(NetworkError::bind_failure(
                format!("{host}:{port}"),
                std::io::Error::new(std::io::ErrorKind::AddrInUse, "port already published"),
            )));
            return;
        }
        let request = self.next_id();
        self.binding.insert(request, PendingPublish { actor, reply });
        tcp::spawn_bind(host, port, request, self.commands.clone());
    }

    fn bound(&mut self, request: u64, target: String, result: Result<TcpListener>) {
        let Some(PendingPublish { actor, reply }) = self.binding.remove(&request) else {
            return;
        };
        let listener = match result {
            Ok(listener) => listener,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        let bound = match listener.local_addr() {
            Ok(addr) => addr.port(),
            Err(e) => {
                let _ = reply.send(Err(NetworkError::bind_failure(target, e)));
                return;
            }
        };
        let task = tcp::spawn_acceptor(listener, bound, self.config.nodelay, self.commands.clone());
        info!(actor = %actor.address(), %target, port = bound, "Published actor");
        self.acceptors.insert(bound, Acceptor { actor, task });
        let _ = reply.send(Ok(bound));
    }

    fn unpublish(&mut self, port: u16) -> bool {
        match self.acceptors.remove(&port) {
            Some(acceptor) => {
                acceptor.task.abort();
                info!(actor = %acceptor.actor.address(), port, "Unpublished actor");
                true
            }
            None => false,
        }
    }

    fn connect(
        &mut self,
        host: String,
        port: u16,
        expected: Vec<String>,
        reply: oneshot::Sender<Result<ActorHandle>>,
    ) {
        let request = self.next_id();
        self.connecting
            .insert(request, PendingLookup { expected, reply });
        debug!(%host, port, request, "Connecting to remote actor");
        tcp::spawn_connect(
            host,
            port,
            self.config.connect_timeout(),
            self.config.nodelay,
            request,
            self.commands.clone(),
        );
    }

    fn open_connection(&mut self, role: Role, stream: TcpStream, remote: SocketAddr) -> ConnectionId {
        let id = ConnectionId(self.next_id());
        let (read, write) = stream.into_split();
        let (outgoing, queue) = mpsc::unbounded_channel();
        let reader = tcp::spawn_reader(id, read, self.commands.clone());
        tcp::spawn_writer(id, write, queue, self.commands.clone());

        let commands = self.commands.clone();
        let timeout = self.config.connect_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = commands.send(Command::HandshakeTimeout { connection: id });
        });

        self.metrics.record_open();
        debug!(connection = %id, %remote, ?role, "Opened connection");
        self.connections.insert(
            id,
            Connection {
                basp: BaspConnection::new(role, self.node, self.config.max_frame_size),
                outgoing,
                reader,
                remote,
                lookup: None,
                stop_on_last_proxy_exited: false,
            },
        );
        id
    }

    fn socket_event(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::Accepted {
                port,
                stream,
                remote,
            } => self.accepted(port, stream, remote),
            SocketEvent::Connected {
                request,
                target,
                result,
            } => self.connected(request, target, result),
            SocketEvent::Bound {
                request,
                target,
                result,
            } => self.bound(request, target, result),
            SocketEvent::Received { connection, data } => self.received(connection, data),
            SocketEvent::Closed { connection, error } => {
                let error = error.map(NetworkError::network);
                self.close_connection(connection, error);
            }
        }
    }

    fn accepted(&mut self, port: u16, stream: TcpStream, remote: SocketAddr) {
        let Some(acceptor) = self.acceptors.get(&port) else {
            debug!(port, %remote, "Dropping connection for unpublished port");
            return;
        };
        let handshake = ServerHandshake {
            actor_id: acceptor.actor.address().id(),
            node: self.node,
            interface: acceptor
                .actor
                .as_local()
                .map(|actor| actor.interface().to_vec())
                .unwrap_or_default(),
        };
        let id = self.open_connection(Role::Server, stream, remote);
        self.queue(id, handshake.encode());
    }

    fn connected(&mut self, request: u64, target: String, result: Result<TcpStream>) {
        let Some(lookup) = self.connecting.remove(&request) else {
            return;
        };
        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                warn!(%target, error = %e, "Connect failed");
                let _ = lookup.reply.send(Err(e));
                return;
            }
        };
        let remote = match stream.peer_addr() {
            Ok(remote) => remote,
            Err(e) => {
                let _ = lookup.reply.send(Err(e.into()));
                return;
            }
        };
        let id = self.open_connection(Role::Client, stream, remote);
        if let Some(connection) = self.connections.get_mut(&id) {
            connection.lookup = Some(lookup);
            connection.stop_on_last_proxy_exited = true;
        }
    }

    fn handshake_timeout(&mut self, id: ConnectionId) {
        let Some(connection) = self.connections.get(&id) else {
            return;
        };
        if connection.basp.peer().is_some() {
            return;
        }
        let timeout_ms = self.config.connect_timeout_ms;
        let error = NetworkError::timeout(format!("handshake with {}", connection.remote), timeout_ms);
        self.close_connection(id, Some(error));
    }

    // --- inbound ---

    fn received(&mut self, id: ConnectionId, data: Bytes) {
        self.metrics.record_receive(data.len());
        let Some(connection) = self.connections.get_mut(&id) else {
            return;
        };
        let events = match connection.basp.consume(&data, self.system.types()) {
            Ok(events) => events,
            Err(e) => {
                self.close_connection(id, Some(e));
                return;
            }
        };
        for event in events {
            if !self.connections.contains_key(&id) {
                break;
            }
            if let Err(e) = self.basp_event(id, event) {
                self.close_connection(id, Some(e));
                break;
            }
        }
    }

    fn basp_event(&mut self, id: ConnectionId, event: BaspEvent) -> Result<()> {
        match event {
            BaspEvent::ServerHandshake(handshake) => self.server_handshake(id, handshake),
            BaspEvent::ClientHandshake { node } => {
                if !self.router.register_peer(node, id) {
                    return Err(NetworkError::handshake(
                        node.to_string(),
                        "duplicate connection",
                    ));
                }
                info!(peer = %node, connection = %id, "Accepted peer");
                Ok(())
            }
            BaspEvent::Relay { header, frame } => {
                self.metrics.record_frame();
                self.relay(id, header, frame);
                Ok(())
            }
            BaspEvent::Control { header, control } => {
                self.metrics.record_frame();
                self.control(id, header, control)
            }
            BaspEvent::Message { header, payload } => {
                self.metrics.record_frame();
                self.deliver(id, header, payload)
            }
        }
    }

    fn server_handshake(&mut self, id: ConnectionId, handshake: ServerHandshake) -> Result<()> {
        let expected = self
            .connections
            .get(&id)
            .and_then(|connection| connection.lookup.as_ref())
            .map(|lookup| lookup.expected.clone())
            .ok_or_else(|| {
                NetworkError::handshake(handshake.node.to_string(), "unexpected server handshake")
            })?;
        if !same_interface(&expected, &handshake.interface) {
            return Err(NetworkError::interface_mismatch(&expected, &handshake.interface));
        }

        let addr = ActorAddr::new(handshake.actor_id, handshake.node);
        let namespace = Arc::clone(self.system.namespace());

        if handshake.node == self.node {
            debug!(actor = %addr, "Connected to own node, using local actor");
            let handle = namespace.resolve(addr, None)?;
            self.finish_lookup(id, Ok(handle));
            self.close_connection(id, None);
            return Ok(());
        }
        if self.router.has_peer(handshake.node) {
            info!(
                peer = %handshake.node,
                connection = %id,
                "Duplicate connection, reusing existing peer"
            );
            let handle = namespace.resolve(addr, None)?;
            self.finish_lookup(id, Ok(handle));
            self.close_connection(id, None);
            return Ok(());
        }
        if !self.router.register_peer(handshake.node, id) {
            return Err(NetworkError::handshake(
                handshake.node.to_string(),
                "connection is blacklisted for this node",
            ));
        }
        self.queue(id, encode_client_handshake(&self.node));
        let handle = namespace.resolve(addr, None).map_err(NetworkError::from);
        info!(peer = %handshake.node, actor = %addr, "Connected to remote actor");
        self.finish_lookup(id, handle);
        Ok(())
    }

    fn finish_lookup(&mut self, id: ConnectionId, result: Result<ActorHandle>) {
        if let Some(lookup) = self
            .connections
            .get_mut(&id)
            .and_then(|connection| connection.lookup.take())
        {
            let _ = lookup.reply.send(result);
        }
    }

    fn relay(&mut self, from: ConnectionId, header: FrameHeader, frame: Bytes) {
        let destination = header.receiver.node();
        match self.router.lookup(destination) {
            Some(route) if route.connection != from => {
                trace!(
                    %destination,
                    next_hop = %route.next_hop,
                    size = frame.len(),
                    "Relaying frame"
                );
                self.metrics.record_relay();
                self.queue(route.connection, frame);
            }
            _ => {
                warn!(%destination, receiver = %header.receiver, "No route for relayed frame, dropping");
                self.metrics.record_drop();
            }
        }
    }

    fn deliver(&mut self, id: ConnectionId, header: FrameHeader, payload: Bytes) -> Result<()> {
        let Some(connection) = self.connections.get(&id) else {
            return Ok(());
        };
        let peer = connection.basp.peer();
        let namespace = Arc::clone(self.system.namespace());
        let content = {
            let codec = namespace.codec(peer);
            connection
                .basp
                .decode_payload(&payload, self.system.types(), &codec)?
        };

        let sender = if header.sender.id().is_valid() {
            Some(namespace.resolve(header.sender, peer)?)
        } else {
            None
        };
        let mid = header.message_id;
        if mid.is_response() {
            if let Some(proxy) = namespace.get(header.sender.node(), header.sender.id()) {
                proxy.response_received(&header.receiver, mid.request_id());
            }
        }
        let receiver = namespace.resolve(header.receiver, peer)?;
        trace!(sender = %header.sender, receiver = %header.receiver, ?mid, "Delivering remote message");
        receiver.enqueue(sender, mid, content);
        Ok(())
    }

    fn control(&mut self, id: ConnectionId, header: FrameHeader, control: ControlMessage) -> Result<()> {
        let peer = self.connections.get(&id).and_then(|c| c.basp.peer());
        let namespace = Arc::clone(self.system.namespace());
        trace!(from = %header.sender.node(), control = control.name(), "Control message");

        match control {
            ControlMessage::Monitor { node, actor } => {
                let (local, reason) = self.system.registry().get_entry(actor);
                match local {
                    Some(local) => {
                        let commands = self.commands.clone();
                        local.attach(Attachable::functor(move |reason| {
                            let _ = commands.send(Command::KillProxy {
                                requester: node,
                                actor,
                                reason,
                            });
                        }));
                    }
                    None if reason.is_exited() => self.send_control(
                        node,
                        ControlMessage::KillProxy {
                            node: self.node,
                            actor,
                            reason,
                        },
                    ),
                    None => debug!(requester = %node, actor_id = %actor, "MONITOR for unknown actor ignored"),
                }
            }
            ControlMessage::KillProxy {
                node,
                actor,
                reason,
            } => {
                if let Some(proxy) = namespace.get(node, actor) {
                    debug!(proxy = %proxy.address(), %reason, "Remote actor exited");
                    proxy.kill(reason);
                }
            }
            ControlMessage::Link { from, to } => {
                let a = namespace.resolve(from, peer)?;
                let b = namespace.resolve(to, peer)?;
                link_pair(&a, &b);
            }
            ControlMessage::Unlink { from, to } => {
                if let (Some(a), Some(b)) = (existing(&namespace, from), existing(&namespace, to)) {
                    unlink_pair(&a, &b);
                }
            }
            ControlMessage::AddType { .. } => {}
        }
        Ok(())
    }

    // --- outbound ---

    fn queue(&mut self, id: ConnectionId, bytes: Bytes) {
        if let Some(connection) = self.connections.get(&id) {
            self.metrics.record_send(bytes.len());
            // A closed queue means the writer failed; its Closed event follows.
            let _ = connection.outgoing.send(bytes);
        }
    }

    /// Sends a message frame along the route to its receiver's node
    fn dispatch(&mut self, header: FrameHeader, content: Message) {
        let destination = header.receiver.node();
        let Some(route) = self.router.lookup(destination) else {
            debug!(%destination, receiver = %header.receiver, "No route, dropping message");
            self.metrics.record_drop();
            return;
        };
        let Some(connection) = self.connections.get_mut(&route.connection) else {
            self.metrics.record_drop();
            return;
        };
        let use_type_ids = self.config.use_type_ids && route.is_direct(destination);
        let namespace = self.system.namespace();
        let codec = namespace.codec(None);
        let encoded = connection.basp.write_frame(
            &header,
            &content,
            self.system.types(),
            &codec,
            use_type_ids,
        );
        match encoded {
            Ok(bytes) => self.queue(route.connection, bytes),
            Err(e) => {
                warn!(receiver = %header.receiver, error = %e, "Failed to serialize message");
                self.metrics.record_drop();
                self.fail_request(&header);
            }
        }
    }

    /// Answers a request that could not be sent
    fn fail_request(&self, header: &FrameHeader) {
        let mid = header.message_id;
        if !mid.is_request() || !header.sender.id().is_valid() {
            return;
        }
        let namespace = self.system.namespace();
        if let Some(proxy) = namespace.get(header.receiver.node(), header.receiver.id()) {
            proxy.response_received(&header.sender, mid.request_id());
        }
        if let Ok(sender) = namespace.resolve(header.sender, None) {
            sender.enqueue(
                None,
                mid.response_id(),
                message![SyncExitedMsg {
                    source: header.receiver,
                    reason: ExitReason::UNHANDLED_SYNC_FAILURE,
                }],
            );
        }
    }

    fn send_control(&mut self, destination: NodeId, control: ControlMessage) {
        let Some(route) = self.router.lookup(destination) else {
            debug!(%destination, control = control.name(), "No route for control message");
            self.metrics.record_drop();
            return;
        };
        let Some(connection) = self.connections.get(&route.connection) else {
            return;
        };
        match connection
            .basp
            .write_control(destination, &control, self.system.types())
        {
            Ok(bytes) => self.queue(route.connection, bytes),
            Err(e) => warn!(%destination, error = %e, "Failed to encode control message"),
        }
    }

    // --- teardown ---

    fn last_proxy_exited(&mut self, node: NodeId) {
        let namespace = self.system.namespace();
        if namespace.count_proxies(node) > 0 {
            return;
        }
        // Still needed as the next hop towards nodes with live proxies
        let relaying = self.router.indirect_nodes().into_iter().any(|other| {
            self.router.lookup(other).map(|route| route.next_hop) == Some(node)
                && namespace.count_proxies(other) > 0
        });
        if relaying {
            return;
        }
        let Some(route) = self.router.lookup(node).filter(|route| route.is_direct(node)) else {
            return;
        };
        let stop = self
            .connections
            .get(&route.connection)
            .map_or(false, |connection| connection.stop_on_last_proxy_exited);
        if stop {
            info!(peer = %node, "Last proxy exited, closing connection");
            self.close_connection(route.connection, None);
        }
    }

    /// Drops a connection; a registered peer loses its routes and proxies
    fn close_connection(&mut self, id: ConnectionId, error: Option<NetworkError>) {
        let Some(mut connection) = self.connections.remove(&id) else {
            return;
        };
        connection.basp.close();
        connection.reader.abort();
        self.metrics.record_close();

        match (connection.lookup.take(), error) {
            (Some(lookup), error) => {
                let error = error.unwrap_or_else(|| {
                    NetworkError::network("connection closed before the handshake completed")
                });
                warn!(connection = %id, remote = %connection.remote, error = %error, "Remote actor lookup failed");
                let _ = lookup.reply.send(Err(error));
            }
            (None, Some(error)) => {
                warn!(connection = %id, remote = %connection.remote, error = %error, "Closing connection");
            }
            (None, None) => {
                debug!(connection = %id, remote = %connection.remote, "Closing connection");
            }
        }

        if let Some((node, unreachable)) = self.router.erase_connection(id) {
            info!(peer = %node, connection = %id, "Lost connection to peer");
            self.evict(node);
            for node in unreachable {
                self.evict(node);
            }
        }
    }

    /// Kills every proxy of `node` with `REMOTE_LINK_UNREACHABLE`
    fn evict(&self, node: NodeId) {
        let proxies = self.system.namespace().erase_node(node);
        if proxies.is_empty() {
            return;
        }
        debug!(%node, count = proxies.len(), "Evicting proxies");
        for proxy in proxies {
            proxy.kill(ExitReason::REMOTE_LINK_UNREACHABLE);
        }
    }

    fn shutdown(&mut self) {
        for (_, acceptor) in self.acceptors.drain() {
            acceptor.task.abort();
        }
        for (_, lookup) in self.connecting.drain() {
            let _ = lookup.reply.send(Err(NetworkError::Shutdown));
        }
        let ids: Vec<_> = self.connections.keys().copied().collect();
        for id in ids {
            self.close_connection(id, Some(NetworkError::Shutdown));
        }
        info!(node = %self.node, "Middleman shut down");
    }
}

/// Interfaces match when they contain the same signatures
fn same_interface(expected: &[String], actual: &[String]) -> bool {
    let expected: BTreeSet<&str> = expected.iter().map(String::as_str).collect();
    let actual: BTreeSet<&str> = actual.iter().map(String::as_str).collect();
    expected == actual
}

/// Live handle for `addr` without creating a proxy
fn existing(namespace: &ActorNamespace, addr: ActorAddr) -> Option<ActorHandle> {
    if addr.node() == namespace.node() {
        namespace.resolve(addr, None).ok()
    } else {
        namespace
            .get(addr.node(), addr.id())
            .map(ActorHandle::Remote)
    }
}

/// Applies a `LINK` received from a peer
///
/// A proxy side only records the link locally: the remote node already
/// knows about it, and the proxy's `kill` delivers the `ExitMsg`. The
/// proxy records it first so an already exited local actor's `ExitMsg` is
/// not sent back over the wire.
fn link_pair(a: &ActorHandle, b: &ActorHandle) {
    match (a.as_proxy(), b.as_proxy()) {
        (Some(proxy), None) => {
            if b.is_valid() {
                proxy.local_link(b.clone());
            }
            b.add_link(a.clone());
        }
        (None, Some(proxy)) => {
            if a.is_valid() {
                proxy.local_link(a.clone());
            }
            a.add_link(b.clone());
        }
        (None, None) => {
            a.add_link(b.clone());
            b.add_link(a.clone());
        }
        (Some(_), Some(_)) => {
            // Neither actor lives here, so this node has nothing to watch;
            // the two nodes involved link through their own connection.
            warn!(a = %a.address(), b = %b.address(), "LINK between two remote actors ignored");
        }
    }
}

fn unlink_pair(a: &ActorHandle, b: &ActorHandle) {
    match (a.as_proxy(), b.as_proxy()) {
        (Some(proxy), None) => {
            b.remove_link(&a.address());
            proxy.local_unlink(&b.address());
        }
        (None, Some(proxy)) => {
            a.remove_link(&b.address());
            proxy.local_unlink(&a.address());
        }
        (None, None) => {
            a.remove_link(&b.address());
            b.remove_link(&a.address());
        }
        (Some(_), Some(_)) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interfaces_compare_as_sets() {
        let a = vec!["ping".to_string(), "pong".to_string()];
        let b = vec!["pong".to_string(), "ping".to_string(), "ping".to_string()];
        assert!(same_interface(&a, &b));
        assert!(same_interface(&[], &[]));
        assert!(!same_interface(&[], &a));
        assert!(!same_interface(&a[..1], &a));
    }

    #[derive(Default)]
    struct Counting {
        forwarded: std::sync::atomic::AtomicUsize,
        linked: std::sync::atomic::AtomicUsize,
    }

    impl ProxyBackend for Counting {
        fn forward(&self, _: ActorAddr, _: Option<ActorHandle>, _: MessageId, _: Message) {
            self.forwarded.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
        fn link(&self, _: ActorHandle, _: ActorAddr) {
            self.linked.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
        fn unlink(&self, _: ActorAddr, _: ActorAddr) {}
    }

    #[test]
    fn test_link_between_two_proxies_is_not_recorded() {
        use std::sync::atomic::Ordering;

        let backend = Arc::new(Counting::default());
        let proxy = |pid: u32| {
            let addr = ActorAddr::new(ActorId::from_raw(1), NodeId::new(pid, [pid as u8; 20]));
            ActorHandle::Remote(Arc::new(ActorProxy::new(addr, Weak::new(), backend.clone())))
        };
        let (a, b) = (proxy(2), proxy(3));
        link_pair(&a, &b);
        assert_eq!(backend.linked.load(Ordering::SeqCst), 0);

        // Neither proxy notifies the other when it dies
        a.as_proxy().unwrap().kill(ExitReason::new(42));
        b.as_proxy().unwrap().kill(ExitReason::new(43));
        assert_eq!(backend.forwarded.load(Ordering::SeqCst), 0);
    }
}
