//! Actor System Core
//!
//! `ActorSystem` is the runtime context of one node: node id, type registry,
//! local actor registry, actor namespace, worker pool, timer and metrics.
//! It is a cheap handle (`Clone` shares the same runtime), so several
//! independent systems can live in one process, e.g. one per simulated node
//! in tests.
//!
//! ## Spawning
//!
//! | Call | Runs on |
//! |------|---------|
//! | `spawn` / `spawn_with` | worker pool (cooperative) |
//! | `spawn_with(SpawnOptions::new().detached())` | own thread, event-based |
//! | `spawn_blocking` | own thread, blocking receive |
//! | `scoped` | the calling thread |
//!
//! Every spawn registers the actor in the local registry before the actor
//! can run, so its address resolves as soon as the handle exists.
//!
//! ## Shutdown
//!
//! Actors hold a handle to their system, so dropping the last user handle
//! does not stop anything. Call `shutdown` once the application is done.

use crate::behavior::Behavior;
use crate::blocking::{BlockingContext, ScopedActor};
use crate::context::ActorContext;
use crate::error::{ActorError, ActorExited, Result};
use crate::event_based::EventState;
use crate::handle::{AbstractActor, ActorHandle, Attachable};
use crate::local::{panic_message, ActorKind, LocalActor, LocalActorConfig};
use crate::metrics::{SystemMetrics, SystemStats};
use crate::namespace::{ActorNamespace, HandleTypeInfo};
use crate::registry::ActorRegistry;
use crate::scheduler::{run_detached, spawn_thread, Delivery, PoolHandle, Timer, WorkerPool};
use lattice_codec::{message, Message, TypeRegistry};
use lattice_config::RuntimeConfig;
use lattice_types::{local_node, ActorAddr, ActorId, ExitMsg, ExitReason, MessageId, NodeId};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long `shutdown` waits for actors to honor `USER_SHUTDOWN`
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Options for `ActorSystem::spawn_with`
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Run an event-based actor on its own thread instead of the pool
    pub detached: bool,
    /// Message signatures announced in handshakes when published
    pub interface: Vec<String>,
    /// Link the new actor to this one before it starts
    pub link_to: Option<ActorHandle>,
    /// This actor receives a `DownMsg` when the new actor exits
    pub monitor_by: Option<ActorHandle>,
}

impl SpawnOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn detached(mut self) -> Self {
        self.detached = true;
        self
    }

    pub fn interface<I, S>(mut self, signatures: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interface = signatures.into_iter().map(Into::into).collect();
        self
    }

    pub fn link_to(mut self, other: &ActorHandle) -> Self {
        self.link_to = Some(other.clone());
        self
    }

    pub fn monitor_by(mut self, observer: &ActorHandle) -> Self {
        self.monitor_by = Some(observer.clone());
        self
    }
}

struct SystemInner {
    node: NodeId,
    config: RuntimeConfig,
    registry: Arc<ActorRegistry>,
    types: Arc<TypeRegistry>,
    namespace: Arc<ActorNamespace>,
    pool: WorkerPool,
    timer: Timer,
    metrics: Arc<SystemMetrics>,
    shut_down: AtomicBool,
}

/// Runtime context of one node
#[derive(Clone)]
pub struct ActorSystem {
    inner: Arc<SystemInner>,
}

/// Builder for `ActorSystem`
#[derive(Debug, Default)]
pub struct ActorSystemBuilder {
    node: Option<NodeId>,
    config: RuntimeConfig,
}

impl ActorSystemBuilder {
    /// Overrides the node id (defaults to `local_node()`)
    pub fn node_id(mut self, node: NodeId) -> Self {
        self.node = Some(node);
        self
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<ActorSystem> {
        let node = self.node.unwrap_or_else(local_node);
        let config = self.config;
        let registry = Arc::new(ActorRegistry::new());
        let types = Arc::new(TypeRegistry::with_builtins(vec![Arc::new(HandleTypeInfo)]));
        let namespace = ActorNamespace::new(node, Arc::clone(&registry));
        let threads = config.scheduler.effective_worker_threads();
        let pool = WorkerPool::start(threads, config.scheduler.max_throughput)?;
        let timer = Timer::start()?;

        info!(%node, worker_threads = threads, "Creating actor system");
        Ok(ActorSystem {
            inner: Arc::new(SystemInner {
                node,
                config,
                registry,
                types,
                namespace,
                pool,
                timer,
                metrics: Arc::new(SystemMetrics::default()),
                shut_down: AtomicBool::new(false),
            }),
        })
    }
}

impl ActorSystem {
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    pub fn builder() -> ActorSystemBuilder {
        ActorSystemBuilder::default()
    }

    pub fn node(&self) -> NodeId {
        self.inner.node
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<ActorRegistry> {
        &self.inner.registry
    }

    /// Type registry; announce application types here before spawning
    pub fn types(&self) -> &Arc<TypeRegistry> {
        &self.inner.types
    }

    pub fn namespace(&self) -> &Arc<ActorNamespace> {
        &self.inner.namespace
    }

    pub fn metrics(&self) -> SystemStats {
        self.inner.metrics.snapshot()
    }

    pub fn metrics_handle(&self) -> Arc<SystemMetrics> {
        Arc::clone(&self.inner.metrics)
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Handle for `addr`: a local actor, a proxy, or a dead handle
    pub fn resolve(&self, addr: ActorAddr) -> Result<ActorHandle> {
        self.inner.namespace.resolve(addr, None)
    }

    /// Spawns a cooperative event-based actor
    ///
    /// `init` runs on the actor's first resume and returns its initial
    /// behavior. Returns an invalid handle if the system is shut down.
    pub fn spawn<F>(&self, init: F) -> ActorHandle
    where
        F: FnOnce(&mut ActorContext) -> Behavior + Send + 'static,
    {
        match self.spawn_with(SpawnOptions::default(), init) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "Spawn failed");
                ActorHandle::invalid()
            }
        }
    }

    pub fn spawn_with<F>(&self, options: SpawnOptions, init: F) -> Result<ActorHandle>
    where
        F: FnOnce(&mut ActorContext) -> Behavior + Send + 'static,
    {
        self.ensure_running()?;
        let pool = (!options.detached).then(|| self.inner.pool.handle());
        let actor = self.new_actor(ActorKind::EventBased, &options, pool, false);
        let ctx = ActorContext::new(Arc::clone(&actor), self.clone());
        *actor.event.lock() = Some(EventState::new(ctx, Box::new(init)));

        let handle = self.register(&actor, &options, false);
        let max_throughput = self.inner.config.scheduler.max_throughput;
        if options.detached {
            let runner = Arc::clone(&actor);
            let name = format!("lattice-actor-{}", actor.address().id());
            if let Err(e) = spawn_thread(name, move || run_detached(runner, max_throughput)) {
                actor.event.lock().take();
                actor.cleanup(ExitReason::UNHANDLED_EXCEPTION);
                return Err(e);
            }
        } else {
            self.inner.pool.handle().schedule(actor);
        }
        Ok(handle)
    }

    /// Spawns an actor running `body` on its own thread
    ///
    /// The body's `Ok` exits with `NORMAL`, `Err(ActorExited(r))` with `r`,
    /// a panic with `UNHANDLED_EXCEPTION`.
    pub fn spawn_blocking<F>(&self, body: F) -> Result<ActorHandle>
    where
        F: FnOnce(&mut BlockingContext) -> std::result::Result<(), ActorExited> + Send + 'static,
    {
        self.spawn_blocking_with(SpawnOptions::default(), body)
    }

    pub fn spawn_blocking_with<F>(&self, options: SpawnOptions, body: F) -> Result<ActorHandle>
    where
        F: FnOnce(&mut BlockingContext) -> std::result::Result<(), ActorExited> + Send + 'static,
    {
        self.ensure_running()?;
        let actor = self.new_actor(ActorKind::Blocking, &options, None, false);
        let handle = self.register(&actor, &options, false);

        let mut ctx = BlockingContext::new(Arc::clone(&actor), self.clone());
        let metrics = Arc::clone(&self.inner.metrics);
        let name = format!("lattice-actor-{}", actor.address().id());
        let started = spawn_thread(name, move || {
            let reason = match panic::catch_unwind(AssertUnwindSafe(|| body(&mut ctx))) {
                Ok(Ok(())) => ExitReason::NORMAL,
                Ok(Err(ActorExited(reason))) => reason,
                Err(payload) => {
                    error!(
                        actor = %ctx.address(),
                        panic = panic_message(payload.as_ref()),
                        "Unhandled panic in blocking actor"
                    );
                    metrics.record_panic();
                    ExitReason::UNHANDLED_EXCEPTION
                }
            };
            ctx.finish(reason);
        });
        if let Err(e) = started {
            actor.cleanup(ExitReason::UNHANDLED_EXCEPTION);
            return Err(e);
        }
        Ok(handle)
    }

    /// A blocking actor bound to the calling thread
    ///
    /// Not counted by `await_all_actors_done`.
    pub fn scoped(&self) -> ScopedActor {
        let actor = self.new_actor(ActorKind::Blocking, &SpawnOptions::default(), None, true);
        self.register(&actor, &SpawnOptions::default(), true);
        ScopedActor::new(BlockingContext::new(actor, self.clone()))
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            Err(ActorError::Shutdown)
        } else {
            Ok(())
        }
    }

    fn new_actor(
        &self,
        kind: ActorKind,
        options: &SpawnOptions,
        pool: Option<PoolHandle>,
        hidden: bool,
    ) -> Arc<LocalActor> {
        LocalActor::new(LocalActorConfig {
            addr: ActorAddr::new(ActorId::next(), self.inner.node),
            kind,
            interface: options.interface.clone(),
            hidden,
            pool,
            registry: Arc::clone(&self.inner.registry),
            metrics: Arc::clone(&self.inner.metrics),
        })
    }

    fn register(
        &self,
        actor: &Arc<LocalActor>,
        options: &SpawnOptions,
        hidden: bool,
    ) -> ActorHandle {
        let addr = actor.address();
        self.inner.registry.put(addr.id(), Arc::clone(actor));
        if !hidden {
            self.inner.registry.inc_running();
        }
        self.inner.metrics.record_spawn();

        let handle = ActorHandle::Local(Arc::clone(actor));
        if let Some(other) = &options.link_to {
            actor.add_link(other.clone());
            other.add_link(handle.clone());
        }
        if let Some(observer) = &options.monitor_by {
            actor.attach(Attachable::Monitor {
                observer: observer.clone(),
            });
        }
        debug!(actor = %addr, kind = ?actor.kind(), detached = options.detached, "Spawned actor");
        handle
    }

    /// Asynchronous send without a sender
    pub fn send(&self, dest: &ActorHandle, content: Message) {
        dest.enqueue(None, MessageId::ASYNC, content);
    }

    /// Tells `dest` to exit with `reason`, as if a linked actor had died
    pub fn send_exit(&self, dest: &ActorHandle, reason: ExitReason) {
        dest.enqueue(
            None,
            MessageId::ASYNC,
            message![ExitMsg {
                source: ActorAddr::node_only(self.inner.node),
                reason,
            }],
        );
    }

    pub fn delayed_send(&self, dest: &ActorHandle, content: Message, delay: Duration) {
        self.delayed_enqueue(dest.clone(), None, MessageId::ASYNC, content, delay);
    }

    pub(crate) fn delayed_enqueue(
        &self,
        dest: ActorHandle,
        sender: Option<ActorHandle>,
        mid: MessageId,
        content: Message,
        delay: Duration,
    ) {
        if delay.is_zero() {
            dest.enqueue(sender, mid, content);
            return;
        }
        self.inner.timer.schedule(
            delay,
            Delivery {
                dest,
                sender,
                mid,
                content,
            },
        );
    }

    /// Blocks until every spawned (non-scoped) actor has exited
    pub fn await_all_actors_done(&self) {
        self.inner.registry.await_running_count_equal(0, None);
    }

    /// Like `await_all_actors_done`; `false` if `timeout` elapsed first
    pub fn await_all_actors_done_timeout(&self, timeout: Duration) -> bool {
        self.inner
            .registry
            .await_running_count_equal(0, Some(timeout))
    }

    /// Stops every actor, the timer and the worker pool
    ///
    /// Live actors first receive an exit with `USER_SHUTDOWN`; actors still
    /// running after a grace period are terminated directly.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(node = %self.inner.node, "Shutting down actor system");

        for actor in self.inner.registry.live_actors() {
            self.send_exit(&ActorHandle::Local(actor), ExitReason::USER_SHUTDOWN);
        }
        if !self.await_all_actors_done_timeout(SHUTDOWN_GRACE) {
            let remaining = self.inner.registry.live_actors();
            warn!(remaining = remaining.len(), "Terminating actors that ignored shutdown");
            for actor in remaining {
                actor.cleanup(ExitReason::USER_SHUTDOWN);
                if let Some(mut event) = actor.event.try_lock() {
                    event.take();
                }
            }
        }

        self.inner.namespace.clear_factory();
        self.inner.timer.stop();
        self.inner.pool.shutdown();
        info!(node = %self.inner.node, "Actor system shutdown complete");
    }
}

impl std::fmt::Debug for ActorSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorSystem")
            .field("node", &self.inner.node)
            .field("running", &self.inner.registry.running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_types::Atom;

    fn system() -> ActorSystem {
        ActorSystem::builder()
            .node_id(NodeId::new(7, [7; 20]))
            .build()
            .unwrap()
    }

    #[test]
    fn test_spawned_actor_resolves_by_address() {
        let system = system();
        let actor = system.spawn(|_| Behavior::new().others(|_, _| None));
        match system.resolve(actor.address()).unwrap() {
            ActorHandle::Local(local) => assert_eq!(local.address(), actor.address()),
            other => panic!("expected local handle, got {other:?}"),
        }
        system.send_exit(&actor, ExitReason::USER_SHUTDOWN);
        assert!(system.await_all_actors_done_timeout(Duration::from_secs(5)));
        assert_eq!(actor.exit_reason(), ExitReason::USER_SHUTDOWN);
        system.shutdown();
    }

    #[test]
    fn test_empty_initial_behavior_exits_normally() {
        let system = system();
        let actor = system.spawn(|_| Behavior::new());
        assert!(system.await_all_actors_done_timeout(Duration::from_secs(5)));
        assert_eq!(actor.exit_reason(), ExitReason::NORMAL);
        let stats = system.metrics();
        assert_eq!(stats.actors_spawned, 1);
        assert_eq!(stats.actors_exited, 1);
        system.shutdown();
    }

    #[test]
    fn test_spawn_after_shutdown_fails() {
        let system = system();
        system.shutdown();
        assert!(matches!(
            system.spawn_with(SpawnOptions::new(), |_| Behavior::new()),
            Err(ActorError::Shutdown)
        ));
        assert!(!system.spawn(|_| Behavior::new()).is_valid());
    }

    #[test]
    fn test_shutdown_stops_idle_actors() {
        let system = system();
        let actors: Vec<_> = (0..4)
            .map(|_| system.spawn(|_| Behavior::new().on_atom("noop", |_, _| None)))
            .collect();
        system.send(&actors[0], message![Atom::from("noop")]);
        system.shutdown();
        for actor in actors {
            assert_eq!(actor.exit_reason(), ExitReason::USER_SHUTDOWN);
        }
    }
}
