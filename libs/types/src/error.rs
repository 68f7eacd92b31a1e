//! Error types for identity parsing

use thiserror::Error;

/// Errors raised when parsing textual identity representations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Input does not have the `<host-hex>#<pid>` shape
    #[error("Malformed node id '{input}': expected <40 hex chars>#<process id>")]
    MalformedNodeId { input: String },

    /// Host part is not valid hex of the right length
    #[error("Invalid host id '{input}': {reason}")]
    InvalidHostId { input: String, reason: String },

    /// Process id is not a valid u32
    #[error("Invalid process id '{input}'")]
    InvalidProcessId { input: String },
}

pub type Result<T> = std::result::Result<T, ParseError>;
