//! Actor exit reasons
//!
//! Exit reasons are plain `u32` codes so they cross the wire unchanged inside
//! `KILL_PROXY`. Codes below `USER_DEFINED` are reserved for the runtime;
//! applications may use any other value.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct ExitReason(u32);

impl ExitReason {
    /// Actor is still running
    pub const NOT_EXITED: ExitReason = ExitReason(0);
    /// Regular termination; does not propagate through links
    pub const NORMAL: ExitReason = ExitReason(1);
    /// A handler panicked
    pub const UNHANDLED_EXCEPTION: ExitReason = ExitReason(2);
    /// A synchronous response could not be handled
    pub const UNHANDLED_SYNC_FAILURE: ExitReason = ExitReason(4);
    /// A synchronous request timed out without a handler for the timeout
    pub const UNHANDLED_SYNC_TIMEOUT: ExitReason = ExitReason(5);
    /// The runtime is shutting down
    pub const USER_SHUTDOWN: ExitReason = ExitReason(0x10);
    /// The connection to the actor's node was lost
    pub const REMOTE_LINK_UNREACHABLE: ExitReason = ExitReason(0x101);
    /// First code available to applications
    pub const USER_DEFINED: ExitReason = ExitReason(0x10000);

    pub const fn new(code: u32) -> Self {
        ExitReason(code)
    }

    pub fn code(&self) -> u32 {
        self.0
    }

    pub fn is_normal(&self) -> bool {
        *self == Self::NORMAL
    }

    pub fn is_exited(&self) -> bool {
        *self != Self::NOT_EXITED
    }
}

impl From<u32> for ExitReason {
    fn from(code: u32) -> Self {
        ExitReason(code)
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NOT_EXITED => f.write_str("not_exited"),
            Self::NORMAL => f.write_str("normal"),
            Self::UNHANDLED_EXCEPTION => f.write_str("unhandled_exception"),
            Self::UNHANDLED_SYNC_FAILURE => f.write_str("unhandled_sync_failure"),
            Self::UNHANDLED_SYNC_TIMEOUT => f.write_str("unhandled_sync_timeout"),
            Self::USER_SHUTDOWN => f.write_str("user_shutdown"),
            Self::REMOTE_LINK_UNREACHABLE => f.write_str("remote_link_unreachable"),
            ExitReason(code) => write!(f, "exit({code})"),
        }
    }
}

impl fmt::Debug for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExitReason({self})")
    }
}
