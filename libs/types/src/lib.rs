//! # Lattice Identity Types
//!
//! Value types shared by every layer of the Lattice actor runtime.
//!
//! ## Identity Model
//!
//! ```text
//! ┌──────────────────────────────── ActorAddr (28 bytes on the wire) ─┐
//! │ actor_id: u32 │ process_id: u32 │ host_id: [u8; 20]               │
//! └───────────────┴─────────────────┴─────────────────────────────────┘
//!                  └──────────────── NodeId ─────────────────────────┘
//! ```
//!
//! - **NodeId**: one OS process participating in the system. The host part is a
//!   hash of the machine's MAC addresses and root filesystem UUID.
//! - **ActorId**: process-unique sequence number, never reused while the process lives.
//! - **ActorAddr**: location-transparent address; the all-zero value means "no actor".
//! - **MessageId**: correlation id with request/response flags for synchronous sends.
//! - **ExitReason**: numeric termination reason propagated through links and monitors.
//!
//! Live references to actors are not part of this crate. `lattice-actors`
//! pairs an `ActorAddr` with an `Arc` to the actor object in `ActorHandle`.

pub mod actor;
pub mod atom;
pub mod error;
pub mod exit_reason;
pub mod message_id;
pub mod node;
pub mod system_messages;

pub use actor::{ActorAddr, ActorId};
pub use atom::Atom;
pub use error::{ParseError, Result};
pub use exit_reason::ExitReason;
pub use message_id::MessageId;
pub use node::{local_node, NodeId, HOST_ID_SIZE};
pub use system_messages::{DownMsg, ExitMsg, SyncExitedMsg, SyncTimeoutMsg, TimeoutMsg};
