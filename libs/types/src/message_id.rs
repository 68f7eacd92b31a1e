//! Message correlation ids
//!
//! Layout of the 64-bit id:
//!
//! ```text
//! bit 63: response flag
//! bit 62: request flag
//! bits 0..62: request (correlation) id
//! ```
//!
//! An asynchronous message has id zero. A synchronous request carries the
//! request flag and a fresh correlation id; its response carries the same
//! correlation id with the response flag instead.

use serde::{Deserialize, Serialize};
use std::fmt;

const RESPONSE_FLAG: u64 = 1 << 63;
const REQUEST_FLAG: u64 = 1 << 62;
const ID_MASK: u64 = REQUEST_FLAG - 1;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MessageId(u64);

impl MessageId {
    pub const ASYNC: MessageId = MessageId(0);

    /// A request id for correlation value `id` (truncated to 62 bits)
    pub const fn request(id: u64) -> Self {
        MessageId(REQUEST_FLAG | (id & ID_MASK))
    }

    pub const fn from_raw(raw: u64) -> Self {
        MessageId(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn is_async(&self) -> bool {
        self.0 == 0
    }

    pub fn is_request(&self) -> bool {
        self.0 & REQUEST_FLAG != 0
    }

    pub fn is_response(&self) -> bool {
        self.0 & RESPONSE_FLAG != 0
    }

    /// Correlation value shared by a request and its response
    pub fn request_id(&self) -> u64 {
        self.0 & ID_MASK
    }

    /// The id a reply to this request must carry
    pub fn response_id(&self) -> MessageId {
        MessageId(RESPONSE_FLAG | self.request_id())
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_async() {
            f.write_str("MessageId(async)")
        } else if self.is_response() {
            write!(f, "MessageId(response {})", self.request_id())
        } else {
            write!(f, "MessageId(request {})", self.request_id())
        }
    }
}
