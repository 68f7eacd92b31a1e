//! Node identity
//!
//! A `NodeId` names one OS process in the distributed system. The local node
//! is computed lazily, once, from the host's MAC addresses, the UUID of the
//! root filesystem and the process id. When the host cannot be inspected the
//! computation falls back to fixed placeholder inputs instead of failing.

use crate::error::{ParseError, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};

/// Size of the host part of a node id in bytes
pub const HOST_ID_SIZE: usize = 20;

const PLACEHOLDER_MAC: &str = "00:00:00:00:00:00";
const PLACEHOLDER_FS_UUID: &str = "00000000-0000-0000-0000-000000000000";

static LOCAL_NODE: Lazy<NodeId> = Lazy::new(|| {
    let node = NodeId::new(std::process::id(), compute_host_id());
    debug!(node = %node, "Computed local node id");
    node
});

/// Identity of one process: `{process_id, host_id}`
///
/// Ordering and equality follow the wire byte order (process id first, then
/// host id), so sorting node ids sorts their encoded form.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct NodeId {
    process_id: u32,
    host_id: [u8; HOST_ID_SIZE],
}

impl NodeId {
    /// The all-zero node, used by invalid addresses
    pub const INVALID: NodeId = NodeId {
        process_id: 0,
        host_id: [0; HOST_ID_SIZE],
    };

    pub const fn new(process_id: u32, host_id: [u8; HOST_ID_SIZE]) -> Self {
        Self {
            process_id,
            host_id,
        }
    }

    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    pub fn host_id(&self) -> &[u8; HOST_ID_SIZE] {
        &self.host_id
    }

    /// True unless both parts are zero
    pub fn is_valid(&self) -> bool {
        self.process_id != 0 || self.host_id.iter().any(|b| *b != 0)
    }
}

/// The node id of this process, computed on first use
pub fn local_node() -> NodeId {
    *LOCAL_NODE
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", hex::encode(self.host_id), self.process_id)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({self})")
    }
}

impl FromStr for NodeId {
    type Err = ParseError;

    fn from_str(input: &str) -> Result<Self> {
        let (host, pid) = input
            .split_once('#')
            .ok_or_else(|| ParseError::MalformedNodeId {
                input: input.to_string(),
            })?;

        let bytes = hex::decode(host).map_err(|e| ParseError::InvalidHostId {
            input: host.to_string(),
            reason: e.to_string(),
        })?;
        let host_id: [u8; HOST_ID_SIZE] =
            bytes.try_into().map_err(|v: Vec<u8>| ParseError::InvalidHostId {
                input: host.to_string(),
                reason: format!("expected {HOST_ID_SIZE} bytes, got {}", v.len()),
            })?;

        let process_id = pid.parse::<u32>().map_err(|_| ParseError::InvalidProcessId {
            input: pid.to_string(),
        })?;

        Ok(NodeId::new(process_id, host_id))
    }
}

fn compute_host_id() -> [u8; HOST_ID_SIZE] {
    let mut macs = mac_addresses();
    if macs.is_empty() {
        warn!("No network interface found, using placeholder MAC for host id");
        macs.push(PLACEHOLDER_MAC.to_string());
    }
    let fs_uuid = root_fs_uuid().unwrap_or_else(|| {
        warn!("Root filesystem UUID unavailable, using placeholder for host id");
        PLACEHOLDER_FS_UUID.to_string()
    });

    let mut hasher = Sha3_256::new();
    hasher.update(macs.join(",").as_bytes());
    hasher.update(fs_uuid.as_bytes());
    let digest = hasher.finalize();

    let mut host_id = [0u8; HOST_ID_SIZE];
    host_id.copy_from_slice(&digest[..HOST_ID_SIZE]);
    host_id
}

fn mac_addresses() -> Vec<String> {
    let Ok(entries) = fs::read_dir("/sys/class/net") else {
        return Vec::new();
    };
    let mut macs: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| fs::read_to_string(entry.path().join("address")).ok())
        .map(|mac| mac.trim().to_string())
        .filter(|mac| !mac.is_empty() && mac != PLACEHOLDER_MAC)
        .collect();
    macs.sort();
    macs.dedup();
    macs
}

fn root_fs_uuid() -> Option<String> {
    let mounts = fs::read_to_string("/proc/mounts").ok()?;
    let device = mounts.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let device = fields.next()?;
        (fields.next()? == "/").then(|| PathBuf::from(device))
    })?;
    let device = fs::canonicalize(&device).unwrap_or(device);

    fs::read_dir(Path::new("/dev/disk/by-uuid"))
        .ok()?
        .filter_map(|entry| entry.ok())
        .find(|entry| {
            fs::canonicalize(entry.path())
                .map(|target| target == device)
                .unwrap_or(false)
        })
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_node_is_stable_and_valid() {
        let a = local_node();
        let b = local_node();
        assert_eq!(a, b);
        assert!(a.is_valid());
        assert_eq!(a.process_id(), std::process::id());
    }

    #[test]
    fn ordering_follows_wire_bytes() {
        let low = NodeId::new(1, [0xff; HOST_ID_SIZE]);
        let high = NodeId::new(2, [0x00; HOST_ID_SIZE]);
        assert!(low < high);

        let a = NodeId::new(7, [1; HOST_ID_SIZE]);
        let mut host = [1; HOST_ID_SIZE];
        host[19] = 2;
        let b = NodeId::new(7, host);
        assert!(a < b);
    }

    #[test]
    fn display_parses_back() {
        let node = NodeId::new(4242, [0xab; HOST_ID_SIZE]);
        let parsed: NodeId = node.to_string().parse().unwrap();
        assert_eq!(parsed, node);
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!(matches!(
            "nohash".parse::<NodeId>(),
            Err(ParseError::MalformedNodeId { .. })
        ));
        assert!(matches!(
            "abcd#1".parse::<NodeId>(),
            Err(ParseError::InvalidHostId { .. })
        ));
        let host = hex::encode([1u8; HOST_ID_SIZE]);
        assert!(matches!(
            format!("{host}#x").parse::<NodeId>(),
            Err(ParseError::InvalidProcessId { .. })
        ));
    }

    #[test]
    fn invalid_node_is_all_zero() {
        assert!(!NodeId::INVALID.is_valid());
        assert_eq!(NodeId::default(), NodeId::INVALID);
    }
}
