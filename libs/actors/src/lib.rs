//! # Lattice Actor Runtime
//!
//! Local actors, their scheduling, and location-transparent handles.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────── ActorSystem ────────────────┐
//!  ActorHandle ──▶│ ActorRegistry   ActorNamespace   TypeRegistry│
//!  (Local |       │   id → actor      (node,id) → proxy          │
//!   Remote |      │                                              │
//!   Dead)         │ WorkerPool ◀── UnblockedReader ── Mailbox    │
//!                 │ Timer (delayed sends, request timeouts)      │
//!                 └──────────────────────────────────────────────┘
//!                                        │ ProxyFactory / ProxyBackend
//!                                        ▼
//!                                lattice-network (middleman)
//! ```
//!
//! ## Actor Kinds
//!
//! - **Event-based**: a stack of `Behavior`s; resumed by the worker pool for
//!   up to `max_throughput` messages per step, or on a dedicated thread when
//!   spawned detached.
//! - **Blocking**: a closure on its own thread calling `receive`.
//! - **Scoped**: a blocking actor bound to the caller's thread.
//!
//! ## Example
//!
//! ```rust
//! use lattice_actors::{ActorSystem, Behavior};
//! use lattice_codec::message;
//! use lattice_types::Atom;
//! use std::time::Duration;
//!
//! let system = ActorSystem::new(Default::default()).unwrap();
//! let echo = system.spawn(|_ctx| {
//!     Behavior::new().on_atom("echo", |_ctx, msg| Some(msg.clone()))
//! });
//!
//! let mut me = system.scoped();
//! let reply = me
//!     .request(&echo, message![Atom::from("echo"), 7i32], Duration::from_secs(5))
//!     .unwrap();
//! assert_eq!(reply.get::<i32>(1), Some(&7));
//! drop(me);
//! system.shutdown();
//! ```

pub mod behavior;
pub mod blocking;
pub mod context;
pub mod error;
mod event_based;
pub mod handle;
pub mod local;
pub mod mailbox;
pub mod metrics;
pub mod namespace;
pub mod proxy;
pub mod registry;
mod scheduler;
pub mod system;

pub use behavior::{Behavior, HandleResult};
pub use blocking::{BlockingContext, Envelope, ScopedActor};
pub use context::{ActorContext, PendingRequest};
pub use error::{ActorError, ActorExited, RequestError, Result};
pub use handle::{AbstractActor, ActorHandle, Attachable};
pub use local::{ActorKind, LocalActor};
pub use mailbox::{EnqueueResult, Mailbox, MailboxElement};
pub use metrics::{SystemMetrics, SystemStats};
pub use namespace::{
    ActorNamespace, HandleContext, HandleTypeInfo, ProxyFactory, HANDLE_TYPE_NAME,
};
pub use proxy::{ActorProxy, ProxyBackend};
pub use registry::ActorRegistry;
pub use system::{ActorSystem, ActorSystemBuilder, SpawnOptions};
