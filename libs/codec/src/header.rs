//! Frame header carried in front of every BASP payload

use crate::deserializer::Deserializer;
use crate::error::{CodecError, Result};
use crate::serializer::Serializer;
use crate::wire_type::WireType;
use lattice_types::{ActorAddr, MessageId};

/// `sender | receiver | message_id`
///
/// A receiver with actor id zero means "no receiver": the payload is a
/// control message for the receiver's node. A receiver whose node is neither
/// zero nor the local node is forwarded unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameHeader {
    pub sender: ActorAddr,
    pub receiver: ActorAddr,
    pub message_id: MessageId,
}

impl FrameHeader {
    pub const TYPE_NAME: &'static str = "@header";

    pub fn new(sender: ActorAddr, receiver: ActorAddr, message_id: MessageId) -> Self {
        Self {
            sender,
            receiver,
            message_id,
        }
    }

    pub fn is_control(&self) -> bool {
        !self.receiver.id().is_valid()
    }

    /// Writes the header as a tagged `@header` object
    pub fn write_to(&self, sink: &mut Serializer<'_>) -> Result<()> {
        sink.begin_object(Self::TYPE_NAME);
        self.serialize(sink)?;
        sink.end_object();
        Ok(())
    }

    pub fn read_from(source: &mut Deserializer<'_>) -> Result<Self> {
        let info = source.begin_object()?;
        if info.name() != Self::TYPE_NAME {
            return Err(CodecError::mismatch(Self::TYPE_NAME, info.name()));
        }
        let header = Self::deserialize(source)?;
        source.end_object();
        Ok(header)
    }
}

impl WireType for FrameHeader {
    fn serialize(&self, sink: &mut Serializer<'_>) -> Result<()> {
        sink.write_addr(&self.sender);
        sink.write_addr(&self.receiver);
        sink.write_u64(self.message_id.as_u64());
        Ok(())
    }

    fn deserialize(source: &mut Deserializer<'_>) -> Result<Self> {
        Ok(FrameHeader {
            sender: source.read_addr()?,
            receiver: source.read_addr()?,
            message_id: MessageId::from_raw(source.read_u64()?),
        })
    }
}
