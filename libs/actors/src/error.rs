//! Actor Runtime Error Types

use lattice_codec::CodecError;
use lattice_types::{ActorAddr, ExitReason, NodeId};
use thiserror::Error;

/// Unwind signal of a terminating actor
///
/// Returned from blocking receive calls once the actor has been told to exit;
/// the body propagates it with `?` and the runtime turns it into the exit
/// reason at the top of the actor's run loop.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("actor exited with reason {0}")]
pub struct ActorExited(pub ExitReason);

impl ActorExited {
    pub fn reason(&self) -> ExitReason {
        self.0
    }
}

/// Failure of a synchronous request
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestError {
    /// No response within the requested time
    #[error("request timed out")]
    Timeout,

    /// The receiver had already exited; carries its exit reason
    #[error("receiver exited with reason {0}")]
    Exited(ExitReason),

    /// The requesting actor was told to exit while waiting
    #[error("requesting actor exited with reason {0}")]
    Aborted(ExitReason),
}

/// Runtime errors that do not terminate an actor
#[derive(Error, Debug)]
pub enum ActorError {
    /// The proxy factory refused to create a proxy
    #[error("Proxy creation failed for {addr}: {message}")]
    ProxyCreation { addr: ActorAddr, message: String },

    /// No middleman is attached, so remote addresses cannot be resolved
    #[error("No proxy factory installed; cannot reach node {node}")]
    NoProxyFactory { node: NodeId },

    /// Failed to start an actor's thread
    #[error("Spawn error: {message}")]
    Spawn {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// The actor system has been shut down
    #[error("Actor system is shut down")]
    Shutdown,

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, ActorError>;

impl ActorError {
    pub fn proxy_creation(addr: ActorAddr, message: impl Into<String>) -> Self {
        Self::ProxyCreation {
            addr,
            message: message.into(),
        }
    }

    pub fn spawn(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Spawn {
            message: message.into(),
            source: Some(source),
        }
    }
}
