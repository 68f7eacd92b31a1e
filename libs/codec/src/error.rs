//! Codec errors
//!
//! Every failure is local to the single serialize or deserialize call that
//! raised it. Callers decide whether the failure closes a connection (BASP)
//! or is reported back to a requester.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    /// No type is registered under this name
    #[error("Unknown type '{name}': announce it before sending or receiving values of this type")]
    UnknownType { name: String },

    /// A connection-local type id was used before its ADD_TYPE arrived
    #[error("Unknown type id {id} on this connection (missing ADD_TYPE)")]
    UnknownTypeId { id: u32 },

    /// Input ended inside a value
    #[error("Unexpected end of input: need {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },

    /// Object tag byte is neither 0 (name) nor 1 (id)
    #[error("Invalid object tag {tag:#04x} at offset {offset}")]
    InvalidTag { tag: u8, offset: usize },

    /// String field is not UTF-8
    #[error("Invalid UTF-8 in string field")]
    InvalidUtf8 {
        #[source]
        source: std::string::FromUtf8Error,
    },

    /// Value does not have the type the reader or writer expected
    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    /// An actor handle was encountered without a namespace to resolve it
    #[error("Actor handles require a namespace-backed handle codec")]
    NoHandleCodec,

    /// Name rejected by `announce`
    #[error("Invalid type name '{name}': {reason}")]
    InvalidTypeName { name: String, reason: String },

    /// A length prefix exceeds what this codec accepts
    #[error("Length {length} exceeds limit {limit}")]
    LengthLimit { length: usize, limit: usize },

    /// Objects nested deeper than the decoder accepts
    #[error("Nesting depth exceeds limit {limit}")]
    NestingLimit { limit: usize },

    /// A serde-bridged type failed to encode or decode
    #[error("Serde bridge for '{name}' failed: {message}")]
    Serde { name: String, message: String },
}

impl CodecError {
    pub fn unknown_type(name: impl Into<String>) -> Self {
        CodecError::UnknownType { name: name.into() }
    }

    pub fn eof(needed: usize, remaining: usize) -> Self {
        CodecError::UnexpectedEof { needed, remaining }
    }

    pub fn mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        CodecError::TypeMismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }

    pub fn invalid_name(name: impl Into<String>, reason: impl Into<String>) -> Self {
        CodecError::InvalidTypeName {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// True for errors caused by an unregistered type name or id
    pub fn is_unknown_type(&self) -> bool {
        matches!(
            self,
            CodecError::UnknownType { .. } | CodecError::UnknownTypeId { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CodecError>;
