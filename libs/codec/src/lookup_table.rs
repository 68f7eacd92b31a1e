//! Per-connection type id tables
//!
//! Type ids are connection-local. The sending side assigns the next id the
//! first time a name is written and queues an `ADD_TYPE(id, name)`
//! announcement that must reach the peer before the frame using it. The
//! receiving side stores the resolved type at that index, turning every later
//! lookup into an array access.

use crate::error::{CodecError, Result};
use crate::registry::UniformType;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Largest incoming id accepted from a peer
pub const MAX_TYPE_ID: u32 = 1 << 16;

pub struct TypeLookupTable {
    outgoing: HashMap<String, u32>,
    next_outgoing: u32,
    pending: Vec<(u32, String)>,
    incoming: Vec<Option<Arc<dyn UniformType>>>,
}

impl TypeLookupTable {
    pub fn new() -> Self {
        Self {
            outgoing: HashMap::new(),
            next_outgoing: 1,
            pending: Vec::new(),
            incoming: Vec::new(),
        }
    }

    /// Id for `name` on this connection, assigning one on first use
    pub fn outgoing_id(&mut self, name: &str) -> u32 {
        if let Some(id) = self.outgoing.get(name) {
            return *id;
        }
        let id = self.next_outgoing;
        self.next_outgoing += 1;
        self.outgoing.insert(name.to_string(), id);
        self.pending.push((id, name.to_string()));
        id
    }

    /// Announcements the peer has not seen yet, oldest first
    pub fn take_announcements(&mut self) -> Vec<(u32, String)> {
        std::mem::take(&mut self.pending)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Records an `ADD_TYPE` received from the peer
    pub fn register_incoming(&mut self, id: u32, info: Arc<dyn UniformType>) -> Result<()> {
        if id == 0 || id > MAX_TYPE_ID {
            return Err(CodecError::LengthLimit {
                length: id as usize,
                limit: MAX_TYPE_ID as usize,
            });
        }
        let index = id as usize;
        if self.incoming.len() <= index {
            self.incoming.resize(index + 1, None);
        }
        self.incoming[index] = Some(info);
        Ok(())
    }

    pub fn incoming(&self, id: u32) -> Option<&Arc<dyn UniformType>> {
        self.incoming.get(id as usize)?.as_ref()
    }
}

impl Default for TypeLookupTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TypeLookupTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeLookupTable")
            .field("outgoing", &self.outgoing.len())
            .field("pending", &self.pending.len())
            .field("incoming", &self.incoming.iter().flatten().count())
            .finish()
    }
}
