//! Native encodings for builtin and application types

use crate::deserializer::Deserializer;
use crate::error::Result;
use crate::serializer::Serializer;
use lattice_types::{
    ActorAddr, ActorId, Atom, DownMsg, ExitMsg, ExitReason, MessageId, NodeId, SyncExitedMsg,
    SyncTimeoutMsg, TimeoutMsg,
};
use std::fmt;

/// A type with a hand-written binary encoding
///
/// Register it with `TypeRegistry::announce::<T>(name)` before sending it to
/// another node. `Default` backs `UniformType::create(None)`.
pub trait WireType: Clone + PartialEq + fmt::Debug + Default + Send + Sync + 'static {
    fn serialize(&self, sink: &mut Serializer<'_>) -> Result<()>;
    fn deserialize(source: &mut Deserializer<'_>) -> Result<Self>;
}

macro_rules! primitive_wire_type {
    ($($ty:ty => $write:ident, $read:ident;)*) => {
        $(
            impl WireType for $ty {
                fn serialize(&self, sink: &mut Serializer<'_>) -> Result<()> {
                    sink.$write(*self);
                    Ok(())
                }

                fn deserialize(source: &mut Deserializer<'_>) -> Result<Self> {
                    source.$read()
                }
            }
        )*
    };
}

primitive_wire_type! {
    u8 => write_u8, read_u8;
    u16 => write_u16, read_u16;
    u32 => write_u32, read_u32;
    u64 => write_u64, read_u64;
    i8 => write_i8, read_i8;
    i16 => write_i16, read_i16;
    i32 => write_i32, read_i32;
    i64 => write_i64, read_i64;
    f32 => write_f32, read_f32;
    f64 => write_f64, read_f64;
    bool => write_bool, read_bool;
}

impl WireType for () {
    fn serialize(&self, _sink: &mut Serializer<'_>) -> Result<()> {
        Ok(())
    }

    fn deserialize(_source: &mut Deserializer<'_>) -> Result<Self> {
        Ok(())
    }
}

impl WireType for String {
    fn serialize(&self, sink: &mut Serializer<'_>) -> Result<()> {
        sink.write_str(self);
        Ok(())
    }

    fn deserialize(source: &mut Deserializer<'_>) -> Result<Self> {
        source.read_string()
    }
}

impl WireType for Vec<u8> {
    fn serialize(&self, sink: &mut Serializer<'_>) -> Result<()> {
        sink.write_bytes(self);
        Ok(())
    }

    fn deserialize(source: &mut Deserializer<'_>) -> Result<Self> {
        Ok(source.read_bytes()?.to_vec())
    }
}

impl WireType for Atom {
    fn serialize(&self, sink: &mut Serializer<'_>) -> Result<()> {
        sink.write_str(self.as_str());
        Ok(())
    }

    fn deserialize(source: &mut Deserializer<'_>) -> Result<Self> {
        Ok(Atom::new(source.read_string()?))
    }
}

impl WireType for ActorId {
    fn serialize(&self, sink: &mut Serializer<'_>) -> Result<()> {
        sink.write_u32(self.as_u32());
        Ok(())
    }

    fn deserialize(source: &mut Deserializer<'_>) -> Result<Self> {
        Ok(ActorId::from_raw(source.read_u32()?))
    }
}

impl WireType for NodeId {
    fn serialize(&self, sink: &mut Serializer<'_>) -> Result<()> {
        sink.write_node(self);
        Ok(())
    }

    fn deserialize(source: &mut Deserializer<'_>) -> Result<Self> {
        source.read_node()
    }
}

impl WireType for ActorAddr {
    fn serialize(&self, sink: &mut Serializer<'_>) -> Result<()> {
        sink.write_addr(self);
        Ok(())
    }

    fn deserialize(source: &mut Deserializer<'_>) -> Result<Self> {
        source.read_addr()
    }
}

impl WireType for ExitReason {
    fn serialize(&self, sink: &mut Serializer<'_>) -> Result<()> {
        sink.write_u32(self.code());
        Ok(())
    }

    fn deserialize(source: &mut Deserializer<'_>) -> Result<Self> {
        Ok(ExitReason::new(source.read_u32()?))
    }
}

impl WireType for MessageId {
    fn serialize(&self, sink: &mut Serializer<'_>) -> Result<()> {
        sink.write_u64(self.as_u64());
        Ok(())
    }

    fn deserialize(source: &mut Deserializer<'_>) -> Result<Self> {
        Ok(MessageId::from_raw(source.read_u64()?))
    }
}

macro_rules! source_reason_wire_type {
    ($($ty:ident),*) => {
        $(
            impl WireType for $ty {
                fn serialize(&self, sink: &mut Serializer<'_>) -> Result<()> {
                    sink.write_addr(&self.source);
                    sink.write_u32(self.reason.code());
                    Ok(())
                }

                fn deserialize(source: &mut Deserializer<'_>) -> Result<Self> {
                    Ok($ty {
                        source: source.read_addr()?,
                        reason: ExitReason::new(source.read_u32()?),
                    })
                }
            }
        )*
    };
}

source_reason_wire_type!(DownMsg, ExitMsg, SyncExitedMsg);

impl WireType for SyncTimeoutMsg {
    fn serialize(&self, _sink: &mut Serializer<'_>) -> Result<()> {
        Ok(())
    }

    fn deserialize(_source: &mut Deserializer<'_>) -> Result<Self> {
        Ok(SyncTimeoutMsg)
    }
}

impl WireType for TimeoutMsg {
    fn serialize(&self, sink: &mut Serializer<'_>) -> Result<()> {
        sink.write_u32(self.generation);
        Ok(())
    }

    fn deserialize(source: &mut Deserializer<'_>) -> Result<Self> {
        Ok(TimeoutMsg {
            generation: source.read_u32()?,
        })
    }
}
