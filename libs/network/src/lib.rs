//! # Lattice Network Layer
//!
//! Makes actors reachable across processes over TCP using the Binary Actor
//! System Protocol (BASP).
//!
//! ## Architecture Role
//!
//! ```text
//! libs/actors ──ProxyFactory/ProxyBackend──▶ [network]
//!                                              │
//!   Node ─▶ Middleman ─Command─▶ EventLoop ────┤ Router (direct, indirect, blacklist)
//!                                              │ BaspConnection per socket
//!                                              ▼
//!                                       tokio TCP tasks
//! ```
//!
//! ## Wire Format
//!
//! - **Server handshake**: `u32` size, published actor id, node id,
//!   interface signatures
//! - **Client handshake**: fixed 24 bytes, the client's node id
//! - **Frame**: `u32` size, `@header` object (sender, receiver, message id),
//!   message body. Frames for a third node are relayed untouched.
//! - **Control frames**: receiver without actor id, body led by an atom:
//!   `MONITOR`, `KILL_PROXY`, `LINK`, `UNLINK`, `ADD_TYPE`
//!
//! ## Example
//!
//! ```rust,no_run
//! use lattice_actors::{AbstractActor, ActorSystem, Behavior};
//! use lattice_network::Node;
//!
//! let node = Node::start(ActorSystem::new(Default::default())?)?;
//! let echo = node.system().spawn(|_ctx| Behavior::new().others(|_ctx, msg| Some(msg.clone())));
//! let port = node.publish(&echo, 0)?;
//! let remote = node.remote_actor("127.0.0.1", port)?;
//! assert_eq!(remote.address(), echo.address());
//! node.shutdown();
//! # Ok::<(), lattice_network::NetworkError>(())
//! ```

pub mod basp;
pub mod error;
pub mod metrics;
pub mod middleman;
pub mod node;
pub mod router;
mod tcp;

pub use basp::{BaspConnection, BaspEvent, BaspState, ControlMessage, Role, ServerHandshake};
pub use error::{NetworkError, Result};
pub use metrics::{MiddlemanMetrics, MiddlemanStats};
pub use middleman::Middleman;
pub use node::{Node, DEFAULT_HOST};
pub use router::{ConnectionId, Route, Router};
