//! `Node`: an actor system with a running middleman

use crate::error::Result;
use crate::metrics::MiddlemanStats;
use crate::middleman::Middleman;
use lattice_actors::{ActorHandle, ActorSystem};
use lattice_config::RuntimeConfig;
use lattice_types::NodeId;

/// Host used by `publish` and expected by most callers
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// One process participating in a distributed Lattice system
///
/// Dropping a `Node` stops the middleman but leaves the actor system
/// running; call `shutdown` to stop both.
pub struct Node {
    system: ActorSystem,
    middleman: Middleman,
}

impl Node {
    /// Creates a local actor system from `config` and starts networking
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let system = ActorSystem::new(config)?;
        Self::start(system)
    }

    /// Attaches a middleman to an existing system
    pub fn start(system: ActorSystem) -> Result<Self> {
        let middleman = Middleman::start(&system)?;
        Ok(Self { system, middleman })
    }

    pub fn id(&self) -> NodeId {
        self.system.node()
    }

    pub fn system(&self) -> &ActorSystem {
        &self.system
    }

    pub fn middleman(&self) -> &Middleman {
        &self.middleman
    }

    /// Makes `actor` reachable on every interface at `port` (0 picks one)
    pub fn publish(&self, actor: &ActorHandle, port: u16) -> Result<u16> {
        self.middleman.publish(actor, DEFAULT_HOST, port)
    }

    pub fn publish_on(&self, actor: &ActorHandle, host: &str, port: u16) -> Result<u16> {
        self.middleman.publish(actor, host, port)
    }

    pub fn unpublish(&self, port: u16) -> Result<bool> {
        self.middleman.unpublish(port)
    }

    /// Handle to the untyped actor published at `host:port`
    ///
    /// Fails with `InterfaceMismatch` if the published actor is typed.
    pub fn remote_actor(&self, host: &str, port: u16) -> Result<ActorHandle> {
        self.middleman.connect(host, port, Vec::new())
    }

    /// Handle to the actor at `host:port` whose interface equals `interface`
    pub fn remote_typed_actor<S: AsRef<str>>(
        &self,
        host: &str,
        port: u16,
        interface: &[S],
    ) -> Result<ActorHandle> {
        let expected = interface.iter().map(|s| s.as_ref().to_string()).collect();
        self.middleman.connect(host, port, expected)
    }

    pub fn peers(&self) -> Result<Vec<NodeId>> {
        self.middleman.peers()
    }

    pub fn stats(&self) -> MiddlemanStats {
        self.middleman.stats()
    }

    /// Stops networking, then the actor system
    pub fn shutdown(&self) {
        self.middleman.shutdown();
        self.system.shutdown();
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id())
            .field("middleman", &self.middleman)
            .finish()
    }
}
