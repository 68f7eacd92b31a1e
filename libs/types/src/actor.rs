//! Actor ids and addresses

use crate::node::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_ACTOR_ID: AtomicU32 = AtomicU32::new(1);

/// Process-unique actor sequence number
///
/// Zero is reserved for "no actor". Ids come from one process-wide counter,
/// so several runtimes living in the same process never hand out the same id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct ActorId(u32);

impl ActorId {
    pub const INVALID: ActorId = ActorId(0);

    /// Allocate the next id from the process-wide counter
    pub fn next() -> Self {
        ActorId(NEXT_ACTOR_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn from_raw(raw: u32) -> Self {
        ActorId(raw)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActorId({})", self.0)
    }
}

/// Location-transparent actor address
///
/// Carries no reference to the actor itself; resolving an address whose actor
/// has exited yields "no actor" rather than a dangling reference.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct ActorAddr {
    id: ActorId,
    node: NodeId,
}

impl ActorAddr {
    /// Encoded size: `actor_id: u32 | process_id: u32 | host_id: [u8; 20]`
    pub const WIRE_SIZE: usize = 28;

    pub const INVALID: ActorAddr = ActorAddr {
        id: ActorId::INVALID,
        node: NodeId::INVALID,
    };

    pub const fn new(id: ActorId, node: NodeId) -> Self {
        Self { id, node }
    }

    /// Address of no actor on `node`; used to route control messages
    pub const fn node_only(node: NodeId) -> Self {
        Self {
            id: ActorId::INVALID,
            node,
        }
    }

    pub fn id(&self) -> ActorId {
        self.id
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn is_valid(&self) -> bool {
        self.id.is_valid() || self.node.is_valid()
    }
}

impl fmt::Display for ActorAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}@{}", self.id, self.node)
        } else {
            f.write_str("invalid-actor")
        }
    }
}

impl fmt::Debug for ActorAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActorAddr({self})")
    }
}
