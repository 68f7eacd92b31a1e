//! BASP peer protocol
//!
//! Sans-IO state machine for one connection. Socket tasks feed raw bytes
//! into `BaspConnection::consume` and get back protocol events; the
//! middleman decides what to do with them (register the peer, relay,
//! deliver). Everything written to the socket is produced here too, so the
//! per-connection `TypeLookupTable` stays in one place.
//!
//! ## Wire Format
//!
//! ```text
//! server handshake: size:u32 | actor_id:u32 | process_id:u32 | host_id:20
//!                   | count:u32 | (len:u32, utf8){count}
//! client handshake: process_id:u32 | host_id:20
//! frame:            size:u32 | @header object | message object
//! ```
//!
//! ## States
//!
//! ```text
//! client: AwaitServerHandshakeSize → AwaitServerHandshake ─┐
//! server: AwaitClientHandshake ────────────────────────────┤
//!                                                          ▼
//!                          AwaitMessageSize ⇄ AwaitPayload
//! ```
//!
//! Any error moves the connection to `Closed`.

use crate::error::{NetworkError, Result};
use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use bytes::{BufMut, Bytes, BytesMut};
use lattice_codec::{
    message, Deserializer, FrameHeader, HandleCodec, Message, Serializer, TypeLookupTable,
    TypeRegistry,
};
use lattice_types::{ActorAddr, ActorId, Atom, ExitReason, MessageId, NodeId, HOST_ID_SIZE};
use std::fmt;
use std::io::{Cursor, Read};
use tracing::trace;

/// Length prefix of handshakes and frames
pub const SIZE_PREFIX: usize = 4;

/// `process_id | host_id`
pub const CLIENT_HANDSHAKE_SIZE: usize = 4 + HOST_ID_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Connected out to a published actor
    Client,
    /// Accepted by a published actor's acceptor
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaspState {
    AwaitServerHandshakeSize,
    AwaitServerHandshake { size: usize },
    AwaitClientHandshake,
    AwaitMessageSize,
    AwaitPayload { size: usize },
    Closed,
}

/// What a server tells a connecting client about the published actor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHandshake {
    pub actor_id: ActorId,
    pub node: NodeId,
    pub interface: Vec<String>,
}

impl ServerHandshake {
    /// Size-prefixed encoding
    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::new();
        body.put_u32(self.actor_id.as_u32());
        put_node(&mut body, &self.node);
        body.put_u32(self.interface.len() as u32);
        for signature in &self.interface {
            body.put_u32(signature.len() as u32);
            body.put_slice(signature.as_bytes());
        }
        frame(&body)
    }

    /// Decodes the body that follows the size prefix
    pub fn decode(body: &[u8]) -> Result<Self> {
        let malformed = |e: std::io::Error| {
            NetworkError::handshake("server", format!("malformed server handshake: {e}"))
        };
        let mut cursor = Cursor::new(body);
        let actor_id = ActorId::from_raw(cursor.read_u32::<BigEndian>().map_err(malformed)?);
        let node = read_node(&mut cursor).map_err(malformed)?;

        let count = cursor.read_u32::<BigEndian>().map_err(malformed)? as usize;
        if count > body.len() {
            return Err(NetworkError::handshake(
                node.to_string(),
                format!("interface count {count} exceeds handshake size"),
            ));
        }
        let mut interface = Vec::with_capacity(count);
        for _ in 0..count {
            let len = cursor.read_u32::<BigEndian>().map_err(malformed)? as usize;
            if len > body.len() {
                return Err(NetworkError::handshake(
                    node.to_string(),
                    "interface signature exceeds handshake size",
                ));
            }
            let mut bytes = vec![0u8; len];
            cursor.read_exact(&mut bytes).map_err(malformed)?;
            let signature = String::from_utf8(bytes).map_err(|_| {
                NetworkError::handshake(node.to_string(), "interface signature is not UTF-8")
            })?;
            interface.push(signature);
        }
        Ok(Self {
            actor_id,
            node,
            interface,
        })
    }
}

pub fn encode_client_handshake(node: &NodeId) -> Bytes {
    let mut buf = BytesMut::with_capacity(CLIENT_HANDSHAKE_SIZE);
    put_node(&mut buf, node);
    buf.freeze()
}

fn put_node(buf: &mut BytesMut, node: &NodeId) {
    buf.put_u32(node.process_id());
    buf.put_slice(node.host_id());
}

fn read_node(cursor: &mut Cursor<&[u8]>) -> std::io::Result<NodeId> {
    let process_id = cursor.read_u32::<BigEndian>()?;
    let mut host_id = [0u8; HOST_ID_SIZE];
    cursor.read_exact(&mut host_id)?;
    Ok(NodeId::new(process_id, host_id))
}

/// Prepends the `u32` size
fn frame(body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(SIZE_PREFIX + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(body);
    buf.freeze()
}

/// Frames without a receiver, dispatched on their leading atom
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// `node` wants a `KILL_PROXY` once `actor` exits
    Monitor { node: NodeId, actor: ActorId },
    /// `actor` on `node` exited with `reason`
    KillProxy {
        node: NodeId,
        actor: ActorId,
        reason: ExitReason,
    },
    Link { from: ActorAddr, to: ActorAddr },
    Unlink { from: ActorAddr, to: ActorAddr },
    /// Connection-local type id announcement
    AddType { id: u32, name: String },
}

impl ControlMessage {
    pub const MONITOR: &'static str = "MONITOR";
    pub const KILL_PROXY: &'static str = "KILL_PROXY";
    pub const LINK: &'static str = "LINK";
    pub const UNLINK: &'static str = "UNLINK";
    pub const ADD_TYPE: &'static str = "ADD_TYPE";

    pub fn to_message(&self) -> Message {
        match self {
            ControlMessage::Monitor { node, actor } => {
                message![Atom::from(Self::MONITOR), *node, *actor]
            }
            ControlMessage::KillProxy {
                node,
                actor,
                reason,
            } => message![Atom::from(Self::KILL_PROXY), *node, *actor, *reason],
            ControlMessage::Link { from, to } => message![Atom::from(Self::LINK), *from, *to],
            ControlMessage::Unlink { from, to } => message![Atom::from(Self::UNLINK), *from, *to],
            ControlMessage::AddType { id, name } => {
                message![Atom::from(Self::ADD_TYPE), *id, name.clone()]
            }
        }
    }

    pub fn from_message(msg: &Message) -> Option<Self> {
        if msg.match_atom(0, Self::MONITOR) && msg.len() == 3 {
            return Some(ControlMessage::Monitor {
                node: *msg.get::<NodeId>(1)?,
                actor: *msg.get::<ActorId>(2)?,
            });
        }
        if msg.match_atom(0, Self::KILL_PROXY) && msg.len() == 4 {
            return Some(ControlMessage::KillProxy {
                node: *msg.get::<NodeId>(1)?,
                actor: *msg.get::<ActorId>(2)?,
                reason: *msg.get::<ExitReason>(3)?,
            });
        }
        if msg.match_atom(0, Self::LINK) && msg.len() == 3 {
            return Some(ControlMessage::Link {
                from: *msg.get::<ActorAddr>(1)?,
                to: *msg.get::<ActorAddr>(2)?,
            });
        }
        if msg.match_atom(0, Self::UNLINK) && msg.len() == 3 {
            return Some(ControlMessage::Unlink {
                from: *msg.get::<ActorAddr>(1)?,
                to: *msg.get::<ActorAddr>(2)?,
            });
        }
        if msg.match_atom(0, Self::ADD_TYPE) && msg.len() == 3 {
            return Some(ControlMessage::AddType {
                id: *msg.get::<u32>(1)?,
                name: msg.get::<String>(2)?.clone(),
            });
        }
        None
    }

    pub fn name(&self) -> &'static str {
        match self {
            ControlMessage::Monitor { .. } => Self::MONITOR,
            ControlMessage::KillProxy { .. } => Self::KILL_PROXY,
            ControlMessage::Link { .. } => Self::LINK,
            ControlMessage::Unlink { .. } => Self::UNLINK,
            ControlMessage::AddType { .. } => Self::ADD_TYPE,
        }
    }
}

/// Output of `BaspConnection::consume`
#[derive(Debug)]
pub enum BaspEvent {
    /// Client side: the server introduced itself and its published actor
    ServerHandshake(ServerHandshake),
    /// Server side: the client introduced itself
    ClientHandshake { node: NodeId },
    /// Frame for a third node; `frame` holds the received bytes unchanged,
    /// size prefix included
    Relay { header: FrameHeader, frame: Bytes },
    Control {
        header: FrameHeader,
        control: ControlMessage,
    },
    /// Frame for a local actor; decode with `decode_payload`
    Message { header: FrameHeader, payload: Bytes },
}

enum Step {
    NeedMore,
    Progress,
    Event(BaspEvent),
}

pub struct BaspConnection {
    role: Role,
    state: BaspState,
    local_node: NodeId,
    peer: Option<NodeId>,
    buffer: BytesMut,
    max_frame_size: usize,
    types: TypeLookupTable,
}

impl BaspConnection {
    pub fn new(role: Role, local_node: NodeId, max_frame_size: usize) -> Self {
        let state = match role {
            Role::Client => BaspState::AwaitServerHandshakeSize,
            Role::Server => BaspState::AwaitClientHandshake,
        };
        Self {
            role,
            state,
            local_node,
            peer: None,
            buffer: BytesMut::new(),
            max_frame_size,
            types: TypeLookupTable::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> BaspState {
        self.state
    }

    /// Node on the other end, known once its handshake arrived
    pub fn peer(&self) -> Option<NodeId> {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.state == BaspState::Closed
    }

    pub fn close(&mut self) {
        if self.state != BaspState::Closed {
            trace!(peer = ?self.peer, from = ?self.state, "BASP connection closed");
            self.state = BaspState::Closed;
            self.buffer.clear();
        }
    }

    /// Feeds received bytes; returns every event they complete
    ///
    /// Partial input is buffered until the next call. On error the
    /// connection is closed and must be torn down by the caller.
    pub fn consume(&mut self, data: &[u8], registry: &TypeRegistry) -> Result<Vec<BaspEvent>> {
        if self.is_closed() {
            return Err(NetworkError::network("connection closed"));
        }
        self.buffer.extend_from_slice(data);
        let mut events = Vec::new();
        loop {
            match self.step(registry) {
                Ok(Step::NeedMore) => return Ok(events),
                Ok(Step::Progress) => {}
                Ok(Step::Event(event)) => events.push(event),
                Err(e) => {
                    self.close();
                    return Err(e);
                }
            }
        }
    }

    fn step(&mut self, registry: &TypeRegistry) -> Result<Step> {
        let need = match self.state {
            BaspState::AwaitServerHandshakeSize | BaspState::AwaitMessageSize => SIZE_PREFIX,
            BaspState::AwaitServerHandshake { size } | BaspState::AwaitPayload { size } => size,
            BaspState::AwaitClientHandshake => CLIENT_HANDSHAKE_SIZE,
            BaspState::Closed => return Ok(Step::NeedMore),
        };
        if self.buffer.len() < need {
            return Ok(Step::NeedMore);
        }
        let chunk = self.buffer.split_to(need).freeze();

        match self.state {
            BaspState::AwaitServerHandshakeSize => {
                let size = self.checked_size(&chunk)?;
                self.transition(BaspState::AwaitServerHandshake { size });
                Ok(Step::Progress)
            }
            BaspState::AwaitServerHandshake { .. } => {
                let handshake = ServerHandshake::decode(&chunk)?;
                self.peer = Some(handshake.node);
                self.transition(BaspState::AwaitMessageSize);
                Ok(Step::Event(BaspEvent::ServerHandshake(handshake)))
            }
            BaspState::AwaitClientHandshake => {
                let node = read_node(&mut Cursor::new(&chunk[..]))?;
                if node == self.local_node {
                    return Err(NetworkError::handshake(
                        node.to_string(),
                        "rejected self-connection",
                    ));
                }
                if !node.is_valid() {
                    return Err(NetworkError::handshake(
                        node.to_string(),
                        "client sent an invalid node id",
                    ));
                }
                self.peer = Some(node);
                self.transition(BaspState::AwaitMessageSize);
                Ok(Step::Event(BaspEvent::ClientHandshake { node }))
            }
            BaspState::AwaitMessageSize => {
                let size = self.checked_size(&chunk)?;
                self.transition(BaspState::AwaitPayload { size });
                Ok(Step::Progress)
            }
            BaspState::AwaitPayload { size } => {
                self.transition(BaspState::AwaitMessageSize);
                self.handle_payload(size, chunk, registry)
            }
            BaspState::Closed => Ok(Step::NeedMore),
        }
    }

    fn transition(&mut self, next: BaspState) {
        trace!(peer = ?self.peer, from = ?self.state, to = ?next, "BASP transition");
        self.state = next;
    }

    fn checked_size(&self, prefix: &[u8]) -> Result<usize> {
        let size = BigEndian::read_u32(prefix) as usize;
        if size == 0 || size > self.max_frame_size {
            return Err(NetworkError::network(format!(
                "frame size {size} outside 1..={}",
                self.max_frame_size
            )));
        }
        Ok(size)
    }

    fn handle_payload(&mut self, size: usize, body: Bytes, registry: &TypeRegistry) -> Result<Step> {
        let mut source = Deserializer::new(&body, registry).with_type_table(&self.types);
        let header = FrameHeader::read_from(&mut source)?;
        let offset = source.position();

        let destination = header.receiver.node();
        if destination.is_valid() && destination != self.local_node {
            let mut raw = BytesMut::with_capacity(SIZE_PREFIX + size);
            raw.put_u32(size as u32);
            raw.put_slice(&body);
            return Ok(Step::Event(BaspEvent::Relay {
                header,
                frame: raw.freeze(),
            }));
        }

        let payload = body.slice(offset..);
        if !header.is_control() {
            return Ok(Step::Event(BaspEvent::Message { header, payload }));
        }

        let content = Deserializer::new(&payload, registry)
            .with_type_table(&self.types)
            .read_message()?;
        let control = ControlMessage::from_message(&content).ok_or_else(|| {
            NetworkError::network(format!("malformed control message {content:?}"))
        })?;
        if let ControlMessage::AddType { id, name } = &control {
            let info = registry.lookup(name)?;
            self.types.register_incoming(*id, info)?;
            trace!(peer = ?self.peer, id, type_name = %name, "Registered incoming type id");
            return Ok(Step::Progress);
        }
        Ok(Step::Event(BaspEvent::Control { header, control }))
    }

    /// Decodes the payload of a `BaspEvent::Message`
    pub fn decode_payload(
        &self,
        payload: &[u8],
        registry: &TypeRegistry,
        handles: &dyn HandleCodec,
    ) -> Result<Message> {
        Ok(Deserializer::new(payload, registry)
            .with_type_table(&self.types)
            .with_handles(handles)
            .read_message()?)
    }

    /// Encodes a message frame, preceded by the `ADD_TYPE` frames it needs
    ///
    /// With `use_type_ids` off (frames relayed past the peer) every type is
    /// named inline, so any node on the path can decode the bytes.
    pub fn write_frame(
        &mut self,
        header: &FrameHeader,
        content: &Message,
        registry: &TypeRegistry,
        handles: &dyn HandleCodec,
        use_type_ids: bool,
    ) -> Result<Bytes> {
        let mut body = BytesMut::new();
        {
            let mut sink = Serializer::new(&mut body, registry).with_handles(handles);
            if use_type_ids {
                sink = sink.with_type_table(&mut self.types);
            }
            header.write_to(&mut sink)?;
            sink.write_message(content)?;
        }
        self.check_outgoing(body.len())?;

        let mut out = BytesMut::new();
        if let Some(peer) = self.peer {
            for (id, name) in self.types.take_announcements() {
                trace!(%peer, id, type_name = %name, "Announcing type id");
                let announce = ControlMessage::AddType { id, name };
                out.extend_from_slice(&self.write_control(peer, &announce, registry)?);
            }
        }
        out.put_u32(body.len() as u32);
        out.extend_from_slice(&body);
        Ok(out.freeze())
    }

    /// Encodes a control frame for `destination`, always with inline names
    pub fn write_control(
        &self,
        destination: NodeId,
        control: &ControlMessage,
        registry: &TypeRegistry,
    ) -> Result<Bytes> {
        let header = FrameHeader::new(
            ActorAddr::node_only(self.local_node),
            ActorAddr::node_only(destination),
            MessageId::ASYNC,
        );
        let mut body = BytesMut::new();
        {
            let mut sink = Serializer::new(&mut body, registry);
            header.write_to(&mut sink)?;
            sink.write_message(&control.to_message())?;
        }
        self.check_outgoing(body.len())?;
        Ok(frame(&body))
    }

    fn check_outgoing(&self, size: usize) -> Result<()> {
        if size > self.max_frame_size {
            return Err(NetworkError::network(format!(
                "outgoing frame of {size} bytes exceeds max_frame_size {}",
                self.max_frame_size
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for BaspConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BaspConnection")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("peer", &self.peer)
            .field("buffered", &self.buffer.len())
            .field("types", &self.types)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_codec::{CodecError, Deserializer as De, Element, Serializer as Ser};

    const MAX: usize = 1024 * 1024;

    /// Messages in these tests carry no actor handles
    struct NoHandles;

    impl HandleCodec for NoHandles {
        fn write_handle(&self, _: &mut Ser<'_>, _: &dyn Element) -> lattice_codec::Result<()> {
            Err(CodecError::NoHandleCodec)
        }
        fn read_handle(&self, _: &mut De<'_>) -> lattice_codec::Result<Box<dyn Element>> {
            Err(CodecError::NoHandleCodec)
        }
    }

    fn node(n: u8) -> NodeId {
        NodeId::new(n as u32, [n; HOST_ID_SIZE])
    }

    /// Client and server state machines past the handshake
    fn connected_pair(registry: &TypeRegistry) -> (BaspConnection, BaspConnection) {
        let mut client = BaspConnection::new(Role::Client, node(1), MAX);
        let mut server = BaspConnection::new(Role::Server, node(2), MAX);
        let hello = ServerHandshake {
            actor_id: ActorId::from_raw(7),
            node: node(2),
            interface: vec![],
        };
        client.consume(&hello.encode(), registry).unwrap();
        server
            .consume(&encode_client_handshake(&node(1)), registry)
            .unwrap();
        (client, server)
    }

    #[test]
    fn test_server_handshake_in_single_byte_chunks() {
        let registry = TypeRegistry::new();
        let hello = ServerHandshake {
            actor_id: ActorId::from_raw(42),
            node: node(2),
            interface: vec!["@<>+@atom+@i32".to_string(), "ping".to_string()],
        };
        let bytes = hello.encode();
        let mut client = BaspConnection::new(Role::Client, node(1), MAX);

        let mut events = Vec::new();
        for byte in bytes.iter() {
            events.extend(client.consume(&[*byte], &registry).unwrap());
        }
        assert_eq!(events.len(), 1);
        match &events[0] {
            BaspEvent::ServerHandshake(decoded) => assert_eq!(decoded, &hello),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(client.peer(), Some(node(2)));
        assert_eq!(client.state(), BaspState::AwaitMessageSize);
    }

    #[test]
    fn test_server_rejects_self_connection() {
        let registry = TypeRegistry::new();
        let mut server = BaspConnection::new(Role::Server, node(2), MAX);
        let err = server
            .consume(&encode_client_handshake(&node(2)), &registry)
            .unwrap_err();
        assert!(matches!(err, NetworkError::Handshake { .. }));
        assert!(server.is_closed());
    }

    #[test]
    fn test_oversized_frame_closes_connection() {
        let registry = TypeRegistry::new();
        let (_, mut server) = connected_pair(&registry);
        let err = server
            .consume(&(MAX as u32 + 1).to_be_bytes(), &registry)
            .unwrap_err();
        assert_eq!(err.category(), "network");
        assert!(server.is_closed());
        assert!(server.consume(&[0], &registry).is_err());
    }

    #[test]
    fn test_type_ids_announced_once() {
        let registry = TypeRegistry::new();
        let (mut client, mut server) = connected_pair(&registry);
        let header = FrameHeader::new(
            ActorAddr::new(ActorId::from_raw(1), node(1)),
            ActorAddr::new(ActorId::from_raw(7), node(2)),
            MessageId::ASYNC,
        );
        let content = message![Atom::from("ping"), 1i32];

        let first = client
            .write_frame(&header, &content, &registry, &NoHandles, true)
            .unwrap();
        let second = client
            .write_frame(&header, &content, &registry, &NoHandles, true)
            .unwrap();
        assert!(second.len() < first.len());

        for bytes in [first, second] {
            let events = server.consume(&bytes, &registry).unwrap();
            assert_eq!(events.len(), 1);
            let BaspEvent::Message { header: got, payload } = &events[0] else {
                panic!("expected message event, got {:?}", events[0]);
            };
            assert_eq!(*got, header);
            let decoded = server.decode_payload(payload, &registry, &NoHandles).unwrap();
            assert_eq!(decoded, content);
        }
    }

    #[test]
    fn test_unknown_type_id_closes_connection() {
        let registry = TypeRegistry::new();
        let (mut client, mut server) = connected_pair(&registry);
        let header = FrameHeader::new(
            ActorAddr::node_only(node(1)),
            ActorAddr::new(ActorId::from_raw(7), node(2)),
            MessageId::ASYNC,
        );
        let bytes = client
            .write_frame(&header, &message![1u64], &registry, &NoHandles, true)
            .unwrap();
        // Skip the ADD_TYPE frames and deliver only the last frame
        let mut rest = &bytes[..];
        let mut last = rest;
        while !rest.is_empty() {
            let size = BigEndian::read_u32(rest) as usize;
            last = rest;
            rest = &rest[SIZE_PREFIX + size..];
        }
        let err = server.consume(last, &registry).unwrap_err();
        assert!(matches!(err, NetworkError::Codec(CodecError::UnknownTypeId { .. })));
    }

    #[test]
    fn test_frame_for_third_node_is_relayed_verbatim() {
        let registry = TypeRegistry::new();
        let (mut client, mut server) = connected_pair(&registry);
        let header = FrameHeader::new(
            ActorAddr::new(ActorId::from_raw(1), node(1)),
            ActorAddr::new(ActorId::from_raw(9), node(3)),
            MessageId::request(5),
        );
        let bytes = client
            .write_frame(&header, &message![2.5f64], &registry, &NoHandles, false)
            .unwrap();
        let events = server.consume(&bytes, &registry).unwrap();
        match &events[..] {
            [BaspEvent::Relay { header: got, frame }] => {
                assert_eq!(*got, header);
                assert_eq!(frame, &bytes);
            }
            other => panic!("unexpected events {other:?}"),
        }
    }

    #[test]
    fn test_control_messages_roundtrip() {
        let registry = TypeRegistry::new();
        let (client, mut server) = connected_pair(&registry);
        let a = ActorAddr::new(ActorId::from_raw(3), node(1));
        let b = ActorAddr::new(ActorId::from_raw(4), node(2));
        let controls = vec![
            ControlMessage::Monitor {
                node: node(1),
                actor: ActorId::from_raw(4),
            },
            ControlMessage::KillProxy {
                node: node(1),
                actor: ActorId::from_raw(3),
                reason: ExitReason::new(42),
            },
            ControlMessage::Link { from: a, to: b },
            ControlMessage::Unlink { from: a, to: b },
        ];
        for control in controls {
            let bytes = client.write_control(node(2), &control, &registry).unwrap();
            let events = server.consume(&bytes, &registry).unwrap();
            match &events[..] {
                [BaspEvent::Control { header, control: got }] => {
                    assert!(header.is_control());
                    assert_eq!(header.sender.node(), node(1));
                    assert_eq!(got, &control);
                }
                other => panic!("unexpected events {other:?}"),
            }
        }
    }

    #[test]
    fn test_malformed_control_message_closes_connection() {
        let registry = TypeRegistry::new();
        let (_, mut server) = connected_pair(&registry);
        let header = FrameHeader::new(
            ActorAddr::node_only(node(1)),
            ActorAddr::node_only(node(2)),
            MessageId::ASYNC,
        );
        let mut body = BytesMut::new();
        {
            let mut sink = Serializer::new(&mut body, &registry);
            header.write_to(&mut sink).unwrap();
            sink.write_message(&message![Atom::from("REBOOT")]).unwrap();
        }
        assert!(server.consume(&frame(&body), &registry).is_err());
        assert!(server.is_closed());
    }
    /// Frame to actor 7 on node 2 carrying `payload` as its message body
    fn raw_frame(payload: &[u8], registry: &TypeRegistry) -> Bytes {
        let header = FrameHeader::new(
            ActorAddr::new(ActorId::from_raw(1), node(1)),
            ActorAddr::new(ActorId::from_raw(7), node(2)),
            MessageId::ASYNC,
        );
        let mut body = BytesMut::new();
        header
            .write_to(&mut Serializer::new(&mut body, registry))
            .unwrap();
        body.put_slice(payload);
        frame(&body)
    }

    fn inline_name(buf: &mut BytesMut, name: &str) {
        buf.put_u8(lattice_codec::TAG_NAME);
        buf.put_u32(name.len() as u32);
        buf.put_slice(name.as_bytes());
    }

    #[test]
    fn test_deeply_nested_payload_is_rejected() {
        let registry = TypeRegistry::new();
        let (_, mut server) = connected_pair(&registry);
        let mut payload = BytesMut::new();
        for _ in 0..50_000 {
            inline_name(&mut payload, "@<>+@msg");
        }
        inline_name(&mut payload, lattice_codec::TUPLE_PREFIX);

        let events = server.consume(&raw_frame(&payload, &registry), &registry).unwrap();
        let [BaspEvent::Message { payload, .. }] = &events[..] else {
            panic!("expected one message event, got {events:?}");
        };
        let err = server
            .decode_payload(payload, &registry, &NoHandles)
            .unwrap_err();
        assert!(matches!(
            err,
            NetworkError::Codec(CodecError::NestingLimit { .. })
        ));
    }

    #[test]
    fn test_shallow_nesting_still_decodes() {
        let registry = TypeRegistry::new();
        let (mut client, mut server) = connected_pair(&registry);
        let mut content = message![1i32];
        for _ in 0..16 {
            content = message![content];
        }
        let header = FrameHeader::new(
            ActorAddr::new(ActorId::from_raw(1), node(1)),
            ActorAddr::new(ActorId::from_raw(7), node(2)),
            MessageId::ASYNC,
        );
        let bytes = client
            .write_frame(&header, &content, &registry, &NoHandles, false)
            .unwrap();
        let events = server.consume(&bytes, &registry).unwrap();
        let [BaspEvent::Message { payload, .. }] = &events[..] else {
            panic!("expected one message event, got {events:?}");
        };
        let decoded = server.decode_payload(payload, &registry, &NoHandles).unwrap();
        assert_eq!(decoded, content);
    }

    #[test]
    fn test_oversized_length_in_payload_is_rejected() {
        let registry = TypeRegistry::new();
        let (_, mut server) = connected_pair(&registry);
        let mut payload = BytesMut::new();
        inline_name(&mut payload, "@<>+@str");
        payload.put_u32(u32::MAX);

        let events = server.consume(&raw_frame(&payload, &registry), &registry).unwrap();
        let [BaspEvent::Message { payload, .. }] = &events[..] else {
            panic!("expected one message event, got {events:?}");
        };
        let err = server
            .decode_payload(payload, &registry, &NoHandles)
            .unwrap_err();
        assert!(matches!(
            err,
            NetworkError::Codec(CodecError::LengthLimit { .. })
        ));
    }

    proptest::proptest! {
        #[test]
        fn test_chunking_does_not_change_events(cuts in proptest::collection::vec(1usize..64, 0..12)) {
            let registry = TypeRegistry::new();
            let hello = ServerHandshake {
                actor_id: ActorId::from_raw(7),
                node: node(2),
                interface: vec!["ping".to_string()],
            };
            let mut server = BaspConnection::new(Role::Server, node(2), MAX);
            server.consume(&encode_client_handshake(&node(1)), &registry).unwrap();
            let header = FrameHeader::new(
                ActorAddr::new(ActorId::from_raw(7), node(2)),
                ActorAddr::new(ActorId::from_raw(1), node(1)),
                MessageId::ASYNC,
            );
            let mut stream = BytesMut::new();
            stream.extend_from_slice(&hello.encode());
            for n in 0..3i32 {
                let bytes = server
                    .write_frame(&header, &message![Atom::from("n"), n], &registry, &NoHandles, false)
                    .unwrap();
                stream.extend_from_slice(&bytes);
            }

            let mut client = BaspConnection::new(Role::Client, node(1), MAX);
            let mut events = Vec::new();
            let mut rest = &stream[..];
            for cut in cuts {
                let (chunk, tail) = rest.split_at(cut.min(rest.len()));
                events.extend(client.consume(chunk, &registry).unwrap());
                rest = tail;
            }
            events.extend(client.consume(rest, &registry).unwrap());

            proptest::prop_assert_eq!(events.len(), 4);
            proptest::prop_assert!(matches!(&events[0], BaspEvent::ServerHandshake(h) if *h == hello));
            for (n, event) in events[1..].iter().enumerate() {
                let BaspEvent::Message { payload, .. } = event else {
                    panic!("expected message event, got {event:?}");
                };
                let decoded = client.decode_payload(payload, &registry, &NoHandles).unwrap();
                proptest::prop_assert_eq!(decoded.get::<i32>(1), Some(&(n as i32)));
            }
        }
    }
}
