//! Binary decoder, the mirror of `Serializer`

use crate::error::{CodecError, Result};
use crate::lookup_table::TypeLookupTable;
use crate::message::{Element, Message};
use crate::registry::{TypeRegistry, UniformType};
use crate::serializer::{HandleCodec, TAG_ID, TAG_NAME};
use byteorder::{BigEndian, ByteOrder};
use lattice_types::{ActorAddr, ActorId, NodeId, HOST_ID_SIZE};
use std::sync::Arc;

/// Upper bound for any single length prefix
pub const MAX_SEQ_LEN: usize = 64 * 1024 * 1024;

/// Deepest chain of objects inside objects a decoder follows
pub const MAX_NESTING: usize = 64;

pub struct Deserializer<'a> {
    buf: &'a [u8],
    pos: usize,
    registry: &'a TypeRegistry,
    types: Option<&'a TypeLookupTable>,
    handles: Option<&'a dyn HandleCodec>,
    depth: usize,
}

impl<'a> Deserializer<'a> {
    pub fn new(buf: &'a [u8], registry: &'a TypeRegistry) -> Self {
        Self {
            buf,
            pos: 0,
            registry,
            types: None,
            handles: None,
            depth: 0,
        }
    }

    /// Resolve tag-1 objects through a connection's incoming ids
    pub fn with_type_table(mut self, table: &'a TypeLookupTable) -> Self {
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

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(CodecError::eof(n, self.remaining()));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Reads an object tag and resolves the type it names
    pub fn begin_object(&mut self) -> Result<Arc<dyn UniformType>> {
        let offset = self.pos;
        match self.read_u8()? {
            TAG_NAME => {
                let name = self.read_string()?;
                self.registry.lookup(&name)
            }
            TAG_ID => {
                let id = self.read_u32()?;
                self.types
                    .and_then(|table| table.incoming(id))
                    .cloned()
                    .ok_or(CodecError::UnknownTypeId { id })
            }
            tag => Err(CodecError::InvalidTag { tag, offset }),
        }
    }

    pub fn end_object(&mut self) {}

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(BigEndian::read_u16(self.take(2)?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(BigEndian::read_u64(self.take(8)?))
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(BigEndian::read_i16(self.take(2)?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(BigEndian::read_i32(self.take(4)?))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(BigEndian::read_i64(self.take(8)?))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(BigEndian::read_f32(self.take(4)?))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(BigEndian::read_f64(self.take(8)?))
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_seq_len(&mut self) -> Result<usize> {
        let len = self.read_u32()? as usize;
        if len > MAX_SEQ_LEN {
            return Err(CodecError::LengthLimit {
                length: len,
                limit: MAX_SEQ_LEN,
            });
        }
        Ok(len)
    }

    pub fn read_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_seq_len()?;
        self.take(len)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?.to_vec();
        String::from_utf8(bytes).map_err(|source| CodecError::InvalidUtf8 { source })
    }

    pub fn read_node(&mut self) -> Result<NodeId> {
        let process_id = self.read_u32()?;
        let mut host_id = [0u8; HOST_ID_SIZE];
        host_id.copy_from_slice(self.take(HOST_ID_SIZE)?);
        Ok(NodeId::new(process_id, host_id))
    }

    pub fn read_addr(&mut self) -> Result<ActorAddr> {
        let id = ActorId::from_raw(self.read_u32()?);
        let node = self.read_node()?;
        Ok(ActorAddr::new(id, node))
    }

    pub fn read_handle(&mut self) -> Result<Box<dyn Element>> {
        let handles = self.handles.ok_or(CodecError::NoHandleCodec)?;
        handles.read_handle(self)
    }

    /// Reads one self-describing object
    pub fn read_value(&mut self) -> Result<Box<dyn Element>> {
        if self.depth >= MAX_NESTING {
            return Err(CodecError::NestingLimit { limit: MAX_NESTING });
        }
        self.depth += 1;
        let value = self
            .begin_object()
            .and_then(|info| info.deserialize(self));
        self.depth -= 1;
        let value = value?;
        self.end_object();
        Ok(value)
    }

    pub fn read_message(&mut self) -> Result<Message> {
        let value = self.read_value()?;
        let found = (*value).rust_type_name();
        (*value)
            .as_any()
            .downcast_ref::<Message>()
            .cloned()
            .ok_or_else(|| CodecError::mismatch("message", found))
    }
}
