//! Messages generated by the runtime itself

use crate::actor::ActorAddr;
use crate::exit_reason::ExitReason;
use serde::{Deserialize, Serialize};

/// Sent once to each monitor when the observed actor terminates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DownMsg {
    pub source: ActorAddr,
    pub reason: ExitReason,
}

/// Sent to linked actors on termination, or as an explicit exit signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ExitMsg {
    pub source: ActorAddr,
    pub reason: ExitReason,
}

/// Bounced reply to a synchronous request whose receiver has already exited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SyncExitedMsg {
    pub source: ActorAddr,
    pub reason: ExitReason,
}

/// Delivered as the response of a request whose timeout elapsed first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SyncTimeoutMsg;

/// Behavior timeout tick; stale generations are ignored by the receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TimeoutMsg {
    pub generation: u32,
}
