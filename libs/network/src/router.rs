//! Routing table of the middleman
//!
//! Owned by the middleman event loop; never shared across threads.
//!
//! - **Direct routes**: one registered peer connection per node.
//! - **Indirect routes**: nodes learned through a peer (an address of a
//!   third node arrived over that peer's connection). Frames for them go
//!   to the peer, which relays them.
//! - **Blacklist**: (node, connection) pairings known to be stale. A
//!   blacklisted pairing is never registered again; other connections to
//!   the same node still are.

use lattice_types::NodeId;
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::{debug, trace};

/// Middleman-local connection identifier, never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Where to send frames for a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub connection: ConnectionId,
    /// The node at the other end of `connection`
    pub next_hop: NodeId,
}

impl Route {
    /// Whether the destination is the connection's peer itself
    pub fn is_direct(&self, destination: NodeId) -> bool {
        self.next_hop == destination
    }
}

#[derive(Debug, Default)]
pub struct Router {
    direct: HashMap<NodeId, ConnectionId>,
    peers: HashMap<ConnectionId, NodeId>,
    /// Learned next hops per destination, oldest first
    indirect: HashMap<NodeId, Vec<NodeId>>,
    blacklist: HashSet<(NodeId, ConnectionId)>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `connection` the direct route to `node`
    ///
    /// Returns `false` if `node` already has a peer connection or the
    /// pairing is blacklisted; the existing route is never replaced.
    pub fn register_peer(&mut self, node: NodeId, connection: ConnectionId) -> bool {
        if self.direct.contains_key(&node) {
            debug!(%node, %connection, "Peer already registered, rejecting connection");
            return false;
        }
        if self.blacklist.contains(&(node, connection)) {
            debug!(%node, %connection, "Blacklisted pairing, rejecting connection");
            return false;
        }
        self.direct.insert(node, connection);
        self.peers.insert(connection, node);
        debug!(%node, %connection, "Registered peer");
        true
    }

    /// Records that `node` is reachable through the peer `via`
    ///
    /// Returns `true` if the route is new.
    pub fn announce_route(&mut self, node: NodeId, via: NodeId) -> bool {
        if node == via {
            return false;
        }
        let hops = self.indirect.entry(node).or_default();
        if hops.contains(&via) {
            return false;
        }
        hops.push(via);
        debug!(%node, %via, "Learned indirect route");
        true
    }

    /// Direct route first, then the oldest indirect route whose next hop
    /// is still a connected peer
    pub fn lookup(&self, node: NodeId) -> Option<Route> {
        if let Some(connection) = self.direct.get(&node) {
            return Some(Route {
                connection: *connection,
                next_hop: node,
            });
        }
        let hops = self.indirect.get(&node)?;
        hops.iter().find_map(|via| {
            self.direct.get(via).map(|connection| Route {
                connection: *connection,
                next_hop: *via,
            })
        })
    }

    pub fn has_peer(&self, node: NodeId) -> bool {
        self.direct.contains_key(&node)
    }

    pub fn peer_of(&self, connection: ConnectionId) -> Option<NodeId> {
        self.peers.get(&connection).copied()
    }

    /// Nodes with a direct connection
    pub fn peers(&self) -> Vec<NodeId> {
        let mut peers: Vec<_> = self.direct.keys().copied().collect();
        peers.sort();
        peers
    }

    /// Drops the connection's direct route and every indirect route through
    /// it; blacklists the pairing
    ///
    /// Returns the peer node and the nodes that lost their last route.
    pub fn erase_connection(&mut self, connection: ConnectionId) -> Option<(NodeId, Vec<NodeId>)> {
        let node = self.peers.remove(&connection)?;
        self.direct.remove(&node);
        self.blacklist.insert((node, connection));
        trace!(%node, %connection, "Blacklisted stale pairing");

        let mut unreachable = Vec::new();
        self.indirect.retain(|destination, hops| {
            hops.retain(|via| *via != node);
            if hops.is_empty() {
                if !self.direct.contains_key(destination) {
                    unreachable.push(*destination);
                }
                false
            } else {
                true
            }
        });
        debug!(%node, %connection, lost = unreachable.len(), "Erased peer route");
        Some((node, unreachable))
    }

    pub fn is_blacklisted(&self, node: NodeId, connection: ConnectionId) -> bool {
        self.blacklist.contains(&(node, connection))
    }

    /// Nodes reachable only through another peer
    pub fn indirect_nodes(&self) -> Vec<NodeId> {
        self.indirect
            .keys()
            .filter(|node| self.lookup(**node).is_some() && !self.has_peer(**node))
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(n: u8) -> NodeId {
        NodeId::new(n as u32, [n; 20])
    }

    #[test]
    fn test_register_peer_never_replaces() {
        let mut router = Router::new();
        assert!(router.register_peer(node(2), ConnectionId(1)));
        assert!(!router.register_peer(node(2), ConnectionId(2)));
        assert_eq!(router.lookup(node(2)).unwrap().connection, ConnectionId(1));
        assert_eq!(router.peer_of(ConnectionId(2)), None);
    }

    #[test]
    fn test_indirect_route_through_peer() {
        let mut router = Router::new();
        assert!(router.lookup(node(3)).is_none());
        assert!(router.announce_route(node(3), node(2)));
        assert!(!router.announce_route(node(3), node(2)));
        // Next hop not connected yet
        assert!(router.lookup(node(3)).is_none());

        router.register_peer(node(2), ConnectionId(7));
        let route = router.lookup(node(3)).unwrap();
        assert_eq!(route.connection, ConnectionId(7));
        assert!(!route.is_direct(node(3)));
        assert_eq!(router.indirect_nodes(), vec![node(3)]);

        // A direct connection wins once it exists
        router.register_peer(node(3), ConnectionId(8));
        assert!(router.lookup(node(3)).unwrap().is_direct(node(3)));
    }

    #[test]
    fn test_erase_connection_blacklists_pairing() {
        let mut router = Router::new();
        router.register_peer(node(2), ConnectionId(1));
        router.announce_route(node(3), node(2));
        router.announce_route(node(4), node(2));
        router.announce_route(node(4), node(5));

        let (peer, lost) = router.erase_connection(ConnectionId(1)).unwrap();
        assert_eq!(peer, node(2));
        assert_eq!(lost, vec![node(3)]);
        assert!(router.lookup(node(2)).is_none());
        assert!(router.is_blacklisted(node(2), ConnectionId(1)));

        assert!(!router.register_peer(node(2), ConnectionId(1)));
        assert!(router.register_peer(node(2), ConnectionId(3)));
        assert!(router.erase_connection(ConnectionId(1)).is_none());
    }
}
