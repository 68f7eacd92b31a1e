//! # Lattice Wire Codec
//!
//! Binary encoding rules shared by every node.
//!
//! ## Architecture Role
//!
//! ```text
//! libs/types → [codec] → libs/actors → libs/network
//!     ↑           ↓            ↓              ↓
//!  Identity   TypeRegistry  Namespace    BASP frames
//!  values     Serializer    (handles)    per-connection
//!             Deserializer               TypeLookupTable
//! ```
//!
//! ## What This Crate Contains
//! - **Message**: copy-on-write tuple of type-erased elements
//! - **TypeRegistry**: sorted builtin table, announced types, tuple descriptors
//! - **Serializer / Deserializer**: big-endian primitives and tagged objects
//! - **TypeLookupTable**: connection-local type ids primed by `ADD_TYPE`
//! - **FrameHeader**: sender, receiver and message id of a BASP frame
//!
//! ## What This Crate Does NOT Contain
//! - Actor handles (encoded through the `HandleCodec` hook by the namespace)
//! - Framing, handshakes or sockets (see `lattice-network`)

pub mod deserializer;
pub mod error;
pub mod header;
pub mod lookup_table;
pub mod message;
pub mod registry;
pub mod serializer;
pub mod wire_type;

pub use deserializer::Deserializer;
pub use error::{CodecError, Result};
pub use header::FrameHeader;
pub use lookup_table::TypeLookupTable;
pub use message::{Element, Message};
pub use registry::{TypeRegistry, UniformType, WireTypeInfo, MESSAGE_TYPE_NAME, TUPLE_PREFIX};
pub use serializer::{HandleCodec, Serializer, TAG_ID, TAG_NAME};
pub use wire_type::WireType;

use bytes::{Bytes, BytesMut};

/// Encodes a message with inline type names
pub fn encode_message(registry: &TypeRegistry, message: &Message) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    Serializer::new(&mut buf, registry).write_message(message)?;
    Ok(buf.freeze())
}

/// Decodes a message written by `encode_message`
pub fn decode_message(registry: &TypeRegistry, bytes: &[u8]) -> Result<Message> {
    Deserializer::new(bytes, registry).read_message()
}
