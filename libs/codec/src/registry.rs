//! Runtime type registry
//!
//! Maps logical type names (and native `TypeId`s) to `UniformType` objects
//! that know how to serialize, deserialize, create and compare values.
//!
//! ## Lookup Order
//!
//! 1. **Builtins**: primitive and system-message types, kept in one vector
//!    sorted by name and searched with a binary search.
//! 2. **Announced**: application types registered through `announce` or
//!    `announce_serde`, behind a read/write lock.
//! 3. **Tuple descriptors**: names of the form `@<>+@atom+@i32` describe a
//!    message layout. They are built on first use and cached (fast path: a
//!    shared-lock hit; miss: exclusive insert).

use crate::deserializer::Deserializer;
use crate::error::{CodecError, Result};
use crate::header::FrameHeader;
use crate::message::{Element, Message};
use crate::serializer::Serializer;
use crate::wire_type::WireType;
use lattice_types::{
    ActorAddr, ActorId, Atom, DownMsg, ExitMsg, ExitReason, MessageId, NodeId, SyncExitedMsg,
    SyncTimeoutMsg, TimeoutMsg,
};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, trace};

/// Prefix shared by all tuple descriptor names
pub const TUPLE_PREFIX: &str = "@<>";
/// Name of a nested message element
pub const MESSAGE_TYPE_NAME: &str = "@msg";

/// Most elements a tuple descriptor may name
pub const MAX_TUPLE_ELEMENTS: usize = 256;
/// Tuple descriptors kept for reuse; further shapes are built per lookup
pub const MAX_CACHED_TUPLES: usize = 4096;

/// Type-erased operations for one wire-capable type
pub trait UniformType: Send + Sync {
    fn name(&self) -> &str;

    /// Native runtime tag of the values this type produces
    fn native_type(&self) -> TypeId;

    fn serialize(&self, value: &dyn Element, sink: &mut Serializer<'_>) -> Result<()>;

    fn deserialize(&self, source: &mut Deserializer<'_>) -> Result<Box<dyn Element>>;

    /// A default instance, or a deep copy of `from`
    fn create(&self, from: Option<&dyn Element>) -> Result<Box<dyn Element>>;

    fn equals(&self, lhs: &dyn Element, rhs: &dyn Element) -> bool {
        lhs.eq_element(rhs)
    }
}

impl fmt::Debug for dyn UniformType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UniformType({})", self.name())
    }
}

fn downcast<'v, T: 'static>(name: &str, value: &'v dyn Element) -> Result<&'v T> {
    value
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| CodecError::mismatch(name, value.rust_type_name()))
}

/// `UniformType` for any `WireType`
pub struct WireTypeInfo<T> {
    name: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T: WireType> WireTypeInfo<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            _marker: PhantomData,
        }
    }
}

impl<T: WireType> UniformType for WireTypeInfo<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn native_type(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn serialize(&self, value: &dyn Element, sink: &mut Serializer<'_>) -> Result<()> {
        downcast::<T>(&self.name, value)?.serialize(sink)
    }

    fn deserialize(&self, source: &mut Deserializer<'_>) -> Result<Box<dyn Element>> {
        Ok(Box::new(T::deserialize(source)?))
    }

    fn create(&self, from: Option<&dyn Element>) -> Result<Box<dyn Element>> {
        match from {
            Some(value) => Ok(Box::new(downcast::<T>(&self.name, value)?.clone())),
            None => Ok(Box::new(T::default())),
        }
    }
}

/// `UniformType` for serde types, encoded as a length-prefixed bincode blob
pub struct SerdeTypeInfo<T> {
    name: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> UniformType for SerdeTypeInfo<T>
where
    T: Serialize + DeserializeOwned + Element + Clone + Default,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn native_type(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn serialize(&self, value: &dyn Element, sink: &mut Serializer<'_>) -> Result<()> {
        let value = downcast::<T>(&self.name, value)?;
        let bytes = bincode::serialize(value).map_err(|e| CodecError::Serde {
            name: self.name.clone(),
            message: e.to_string(),
        })?;
        sink.write_bytes(&bytes);
        Ok(())
    }

    fn deserialize(&self, source: &mut Deserializer<'_>) -> Result<Box<dyn Element>> {
        let bytes = source.read_bytes()?;
        let value: T = bincode::deserialize(bytes).map_err(|e| CodecError::Serde {
            name: self.name.clone(),
            message: e.to_string(),
        })?;
        Ok(Box::new(value))
    }

    fn create(&self, from: Option<&dyn Element>) -> Result<Box<dyn Element>> {
        match from {
            Some(value) => Ok(Box::new(downcast::<T>(&self.name, value)?.clone())),
            None => Ok(Box::new(T::default())),
        }
    }
}

/// Nested message element; writes a complete, self-describing object
struct NestedMessageInfo;

impl UniformType for NestedMessageInfo {
    fn name(&self) -> &str {
        MESSAGE_TYPE_NAME
    }

    fn native_type(&self) -> TypeId {
        TypeId::of::<Message>()
    }

    fn serialize(&self, value: &dyn Element, sink: &mut Serializer<'_>) -> Result<()> {
        sink.write_message(downcast::<Message>(MESSAGE_TYPE_NAME, value)?)
    }

    fn deserialize(&self, source: &mut Deserializer<'_>) -> Result<Box<dyn Element>> {
        Ok(Box::new(source.read_message()?))
    }

    fn create(&self, from: Option<&dyn Element>) -> Result<Box<dyn Element>> {
        match from {
            Some(value) => Ok(Box::new(downcast::<Message>(MESSAGE_TYPE_NAME, value)?.clone())),
            None => Ok(Box::new(Message::new())),
        }
    }
}

/// Layout of one message shape, e.g. `@<>+@atom+@i32`
struct TupleType {
    name: String,
    elements: Vec<Arc<dyn UniformType>>,
}

impl UniformType for TupleType {
    fn name(&self) -> &str {
        &self.name
    }

    fn native_type(&self) -> TypeId {
        TypeId::of::<Message>()
    }

    fn serialize(&self, value: &dyn Element, sink: &mut Serializer<'_>) -> Result<()> {
        let message = downcast::<Message>(&self.name, value)?;
        if message.len() != self.elements.len() {
            return Err(CodecError::mismatch(
                self.name.clone(),
                format!("message of {} elements", message.len()),
            ));
        }
        for (info, element) in self.elements.iter().zip(message.iter()) {
            info.serialize(element, sink)?;
        }
        Ok(())
    }

    fn deserialize(&self, source: &mut Deserializer<'_>) -> Result<Box<dyn Element>> {
        let elements = self
            .elements
            .iter()
            .map(|info| info.deserialize(source))
            .collect::<Result<Vec<_>>>()?;
        Ok(Box::new(Message::from_elements(elements)))
    }

    fn create(&self, from: Option<&dyn Element>) -> Result<Box<dyn Element>> {
        match from {
            Some(value) => Ok(Box::new(downcast::<Message>(&self.name, value)?.clone())),
            None => {
                let elements = self
                    .elements
                    .iter()
                    .map(|info| info.create(None))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Box::new(Message::from_elements(elements)))
            }
        }
    }

    fn equals(&self, lhs: &dyn Element, rhs: &dyn Element) -> bool {
        match (
            lhs.as_any().downcast_ref::<Message>(),
            rhs.as_any().downcast_ref::<Message>(),
        ) {
            (Some(lhs), Some(rhs)) => {
                lhs.len() == rhs.len()
                    && self
                        .elements
                        .iter()
                        .zip(lhs.iter().zip(rhs.iter()))
                        .all(|(info, (a, b))| info.equals(a, b))
            }
            _ => false,
        }
    }
}

#[derive(Default)]
struct AnnouncedTypes {
    by_name: HashMap<String, Arc<dyn UniformType>>,
    by_native: HashMap<TypeId, Arc<dyn UniformType>>,
}

/// Registry of every type that can cross the wire
pub struct TypeRegistry {
    builtins: Vec<Arc<dyn UniformType>>,
    builtin_native: HashMap<TypeId, Arc<dyn UniformType>>,
    announced: RwLock<AnnouncedTypes>,
    tuples: RwLock<HashMap<String, Arc<dyn UniformType>>>,
}

fn builtin<T: WireType>(name: &str) -> Arc<dyn UniformType> {
    Arc::new(WireTypeInfo::<T>::new(name))
}

fn codec_builtins() -> Vec<Arc<dyn UniformType>> {
    vec![
        builtin::<ActorAddr>("@actor_addr"),
        builtin::<ActorId>("@actor_id"),
        builtin::<Atom>("@atom"),
        builtin::<bool>("@bool"),
        builtin::<Vec<u8>>("@bytes"),
        builtin::<DownMsg>("@down_msg"),
        builtin::<ExitMsg>("@exit_msg"),
        builtin::<ExitReason>("@exit_reason"),
        builtin::<f32>("@f32"),
        builtin::<f64>("@f64"),
        builtin::<FrameHeader>(FrameHeader::TYPE_NAME),
        builtin::<i16>("@i16"),
        builtin::<i32>("@i32"),
        builtin::<i64>("@i64"),
        builtin::<i8>("@i8"),
        builtin::<MessageId>("@message_id"),
        Arc::new(NestedMessageInfo),
        builtin::<NodeId>("@node_id"),
        builtin::<String>("@str"),
        builtin::<SyncExitedMsg>("@sync_exited"),
        builtin::<SyncTimeoutMsg>("@sync_timeout"),
        builtin::<TimeoutMsg>("@timeout"),
        builtin::<u16>("@u16"),
        builtin::<u32>("@u32"),
        builtin::<u64>("@u64"),
        builtin::<u8>("@u8"),
        builtin::<()>("@unit"),
    ]
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::with_builtins(Vec::new())
    }

    /// Registry whose builtin table also contains `extra` (e.g. actor handles)
    pub fn with_builtins(extra: Vec<Arc<dyn UniformType>>) -> Self {
        let mut builtins = codec_builtins();
        builtins.extend(extra);
        builtins.sort_by(|a, b| a.name().cmp(b.name()));
        builtins.dedup_by(|a, b| a.name() == b.name());

        let builtin_native = builtins
            .iter()
            .map(|info| (info.native_type(), Arc::clone(info)))
            .collect();

        Self {
            builtins,
            builtin_native,
            announced: RwLock::new(AnnouncedTypes::default()),
            tuples: RwLock::new(HashMap::new()),
        }
    }

    /// Names of the builtin table, in lookup (sorted) order
    pub fn builtin_names(&self) -> impl Iterator<Item = &str> {
        self.builtins.iter().map(|info| info.name())
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<dyn UniformType>> {
        if let Ok(index) = self
            .builtins
            .binary_search_by(|info| info.name().cmp(name))
        {
            return Ok(Arc::clone(&self.builtins[index]));
        }
        if let Some(info) = self.announced.read().by_name.get(name) {
            return Ok(Arc::clone(info));
        }
        if name.starts_with(TUPLE_PREFIX) {
            return self.tuple(name);
        }
        Err(CodecError::unknown_type(name))
    }

    /// Lookup by native type; tuple descriptors are not reachable this way
    pub fn lookup_native(&self, native: TypeId) -> Option<Arc<dyn UniformType>> {
        self.builtin_native
            .get(&native)
            .cloned()
            .or_else(|| self.announced.read().by_native.get(&native).cloned())
    }

    pub fn lookup_value(&self, value: &dyn Element) -> Result<Arc<dyn UniformType>> {
        self.lookup_native(value.as_any().type_id())
            .ok_or_else(|| CodecError::unknown_type(value.rust_type_name()))
    }

    /// Registers `T` under `name`, or returns the existing entry
    pub fn announce<T: WireType>(&self, name: &str) -> Result<Arc<dyn UniformType>> {
        self.insert_announced(name, TypeId::of::<T>(), || {
            let info: Arc<dyn UniformType> = Arc::new(WireTypeInfo::<T>::new(name));
            info
        })
    }

    /// Registers a serde type, encoded with bincode
    pub fn announce_serde<T>(&self, name: &str) -> Result<Arc<dyn UniformType>>
    where
        T: Serialize + DeserializeOwned + Element + Clone + Default,
    {
        self.insert_announced(name, TypeId::of::<T>(), || {
            let info: Arc<dyn UniformType> = Arc::new(SerdeTypeInfo::<T> {
                name: name.to_string(),
                _marker: PhantomData,
            });
            info
        })
    }

    fn insert_announced(
        &self,
        name: &str,
        native: TypeId,
        make: impl FnOnce() -> Arc<dyn UniformType>,
    ) -> Result<Arc<dyn UniformType>> {
        validate_user_name(name)?;

        if let Some(existing) = self.lookup_native(native) {
            if existing.name() == name {
                return Ok(existing);
            }
            return Err(CodecError::invalid_name(
                name,
                format!("type already registered as '{}'", existing.name()),
            ));
        }

        let mut announced = self.announced.write();
        if let Some(existing) = announced.by_name.get(name) {
            if existing.native_type() == native {
                return Ok(Arc::clone(existing));
            }
            return Err(CodecError::invalid_name(name, "name taken by another type"));
        }
        let info = make();
        announced.by_name.insert(name.to_string(), Arc::clone(&info));
        announced.by_native.insert(native, Arc::clone(&info));
        debug!(type_name = name, "Announced type");
        Ok(info)
    }

    /// Tuple descriptor for a message value
    pub fn tuple_for(&self, message: &Message) -> Result<Arc<dyn UniformType>> {
        let mut name = String::from(TUPLE_PREFIX);
        for element in message.iter() {
            name.push('+');
            name.push_str(self.lookup_value(element)?.name());
        }
        self.tuple(&name)
    }

    fn tuple(&self, name: &str) -> Result<Arc<dyn UniformType>> {
        if let Some(info) = self.tuples.read().get(name) {
            return Ok(Arc::clone(info));
        }

        let rest = &name[TUPLE_PREFIX.len()..];
        let count = rest.matches('+').count();
        if count > MAX_TUPLE_ELEMENTS {
            return Err(CodecError::LengthLimit {
                length: count,
                limit: MAX_TUPLE_ELEMENTS,
            });
        }
        let elements = if rest.is_empty() {
            Vec::new()
        } else {
            let parts = rest
                .strip_prefix('+')
                .ok_or_else(|| CodecError::unknown_type(name))?;
            parts
                .split('+')
                .map(|part| {
                    if part.starts_with(TUPLE_PREFIX) {
                        Err(CodecError::unknown_type(name))
                    } else {
                        self.lookup(part)
                    }
                })
                .collect::<Result<Vec<_>>>()?
        };

        let info: Arc<dyn UniformType> = Arc::new(TupleType {
            name: name.to_string(),
            elements,
        });
        let mut tuples = self.tuples.write();
        if tuples.len() >= MAX_CACHED_TUPLES && !tuples.contains_key(name) {
            trace!(type_name = name, "Tuple cache full, not caching");
            return Ok(info);
        }
        Ok(Arc::clone(
            tuples.entry(name.to_string()).or_insert(info),
        ))
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("builtins", &self.builtins.len())
            .field("announced", &self.announced.read().by_name.len())
            .field("tuples", &self.tuples.read().len())
            .finish()
    }
}

fn validate_user_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(CodecError::invalid_name(name, "empty"));
    }
    if name.starts_with('@') {
        return Err(CodecError::invalid_name(name, "'@' prefix is reserved for builtins"));
    }
    if name.contains('+') {
        return Err(CodecError::invalid_name(name, "'+' separates tuple elements"));
    }
    Ok(())
}
