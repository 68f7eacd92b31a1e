//! Network Error Types
//!
//! Failures of publishing, connecting and running BASP connections. Errors
//! local to one connection close that connection and evict its proxies;
//! they never take down the process or unrelated actors.

use lattice_actors::ActorError;
use lattice_codec::CodecError;
use lattice_types::NodeId;
use thiserror::Error;

/// Main network error type
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Could not listen on the requested address
    #[error("Failed to bind {addr}: {source}")]
    BindFailure {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Connection-level I/O failure
    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The published actor's interface differs from the expected one
    #[error("Interface mismatch: expected {expected:?}, remote actor has {actual:?}")]
    InterfaceMismatch {
        expected: Vec<String>,
        actual: Vec<String>,
    },

    /// Serialization failed; `UnknownType` surfaces here
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Malformed handshake or a rejected peer
    #[error("Handshake error with {peer}: {message}")]
    Handshake { peer: String, message: String },

    #[error("No route to node {node}")]
    NoRoute { node: NodeId },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The middleman event loop is no longer running
    #[error("Middleman is shut down")]
    Shutdown,

    #[error("Timeout error: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Resolving an address into a handle failed
    #[error(transparent)]
    Actor(#[from] ActorError),
}

/// Result type alias for network operations
pub type Result<T> = std::result::Result<T, NetworkError>;

impl NetworkError {
    /// Create a bind failure
    pub fn bind_failure(addr: impl Into<String>, source: std::io::Error) -> Self {
        Self::BindFailure {
            addr: addr.into(),
            source,
        }
    }

    /// Create a network error
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            source: None,
        }
    }

    /// Create a network error with source
    pub fn network_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Network {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn interface_mismatch(expected: &[String], actual: &[String]) -> Self {
        Self::InterfaceMismatch {
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    /// Create a handshake error
    pub fn handshake(peer: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Handshake {
            peer: peer.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Whether a later attempt may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            NetworkError::Network { .. } => true,
            NetworkError::Timeout { .. } => true,
            NetworkError::Io(_) => true,
            NetworkError::NoRoute { .. } => true,
            NetworkError::BindFailure { .. } => false,
            NetworkError::InterfaceMismatch { .. } => false,
            NetworkError::Codec(_) => false,
            NetworkError::Handshake { .. } => false,
            NetworkError::Shutdown => false,
            NetworkError::Actor(_) => false,
        }
    }

    /// Get error category for logs and metrics
    pub fn category(&self) -> &'static str {
        match self {
            NetworkError::BindFailure { .. } => "bind_failure",
            NetworkError::Network { .. } => "network",
            NetworkError::InterfaceMismatch { .. } => "interface_mismatch",
            NetworkError::Codec(_) => "codec",
            NetworkError::Handshake { .. } => "handshake",
            NetworkError::NoRoute { .. } => "no_route",
            NetworkError::Io(_) => "io",
            NetworkError::Shutdown => "shutdown",
            NetworkError::Timeout { .. } => "timeout",
            NetworkError::Actor(_) => "actor",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        let err = NetworkError::interface_mismatch(&[], &["ping".to_string()]);
        assert_eq!(err.category(), "interface_mismatch");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("ping"));

        let err = NetworkError::timeout("connect", 500);
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "Timeout error: connect exceeded 500ms");
    }

    #[test]
    fn test_codec_errors_convert() {
        let err: NetworkError = CodecError::unknown_type("@point").into();
        assert_eq!(err.category(), "codec");
        assert!(err.to_string().contains("@point"));
    }
}
