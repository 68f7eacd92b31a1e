//! Binary encoder
//!
//! All integers are big-endian. Objects start with a tag byte:
//!
//! ```text
//! 0 | name_len: u32 | name bytes      (type named inline)
//! 1 | type_id: u32                    (connection-local id, see TypeLookupTable)
//! ```
//!
//! followed by the type's own field encoding.

use crate::error::{CodecError, Result};
use crate::lookup_table::TypeLookupTable;
use crate::message::{Element, Message};
use crate::registry::TypeRegistry;
use bytes::{BufMut, BytesMut};
use lattice_types::{ActorAddr, NodeId};

pub const TAG_NAME: u8 = 0;
pub const TAG_ID: u8 = 1;

/// Converts actor handles to and from their address encoding
///
/// Implemented by the actor namespace, which knows how to register local
/// actors and create proxies for remote ones.
pub trait HandleCodec {
    fn write_handle(&self, sink: &mut Serializer<'_>, handle: &dyn Element) -> Result<()>;
    fn read_handle(&self, source: &mut crate::Deserializer<'_>) -> Result<Box<dyn Element>>;
}

pub struct Serializer<'a> {
    buf: &'a mut BytesMut,
    registry: &'a TypeRegistry,
    types: Option<&'a mut TypeLookupTable>,
    handles: Option<&'a dyn HandleCodec>,
}

impl<'a> Serializer<'a> {
    pub fn new(buf: &'a mut BytesMut, registry: &'a TypeRegistry) -> Self {
        Self {
            buf,
            registry,
            types: None,
            handles: None,
        }
    }

    /// Use connection-local ids for object type names
    pub fn with_type_table(mut self, table: &'a mut TypeLookupTable) -> Self {
        self.types = Some(table);
        self
    }

    pub fn with_handles(mut self, handles: &'a dyn HandleCodec) -> Self {
        self.handles = Some(handles);
        self
    }

    pub fn registry(&self) -> &'a TypeRegistry {
        self.registry
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn begin_object(&mut self, type_name: &str) {
        match self.types.as_deref_mut() {
            Some(table) => {
                let id = table.outgoing_id(type_name);
                self.buf.put_u8(TAG_ID);
                self.buf.put_u32(id);
            }
            None => {
                self.buf.put_u8(TAG_NAME);
                self.write_str(type_name);
            }
        }
    }

    pub fn end_object(&mut self) {}

    pub fn write_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buf.put_u16(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.put_u32(value);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.put_u64(value);
    }

    pub fn write_i8(&mut self, value: i8) {
        self.buf.put_i8(value);
    }

    pub fn write_i16(&mut self, value: i16) {
        self.buf.put_i16(value);
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.put_i32(value);
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buf.put_i64(value);
    }

    pub fn write_f32(&mut self, value: f32) {
        self.buf.put_f32(value);
    }

    pub fn write_f64(&mut self, value: f64) {
        self.buf.put_f64(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.put_u8(u8::from(value));
    }

    /// Length-prefixed UTF-8
    pub fn write_str(&mut self, value: &str) {
        self.write_bytes(value.as_bytes());
    }

    /// Length-prefixed blob
    pub fn write_bytes(&mut self, value: &[u8]) {
        self.write_seq_len(value.len());
        self.buf.put_slice(value);
    }

    pub fn write_seq_len(&mut self, len: usize) {
        self.buf.put_u32(len as u32);
    }

    pub fn write_node(&mut self, node: &NodeId) {
        self.buf.put_u32(node.process_id());
        self.buf.put_slice(node.host_id());
    }

    /// Fixed 28-byte address encoding
    pub fn write_addr(&mut self, addr: &ActorAddr) {
        self.buf.put_u32(addr.id().as_u32());
        self.write_node(&addr.node());
    }

    pub fn write_handle(&mut self, handle: &dyn Element) -> Result<()> {
        let handles = self.handles.ok_or(CodecError::NoHandleCodec)?;
        handles.write_handle(self, handle)
    }

    /// Writes `value` as a self-describing object
    pub fn write_value(&mut self, value: &dyn Element) -> Result<()> {
        if let Some(message) = value.as_any().downcast_ref::<Message>() {
            return self.write_message(message);
        }
        let info = self.registry.lookup_value(value)?;
        self.begin_object(info.name());
        info.serialize(value, self)?;
        self.end_object();
        Ok(())
    }

    /// Writes a message as one object named by its tuple descriptor
    pub fn write_message(&mut self, message: &Message) -> Result<()> {
        let info = self.registry.tuple_for(message)?;
        self.begin_object(info.name());
        info.serialize(message, self)?;
        self.end_object();
        Ok(())
    }
}
