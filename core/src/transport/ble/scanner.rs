/// Scan/connect state types
///
/// The node alternates between short scans and idle periods. A connection
/// is only ever attempted from a scan, and the link is tracked separately
/// from the node state so duplicate connect or disconnect requests can be
/// ignored.

use serde::{Deserialize, Serialize};

use crate::store::MacAddress;

/// Node state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Booted, not provisioned
    Init,
    /// Radio off between duty periods
    Idle,
    /// Actively scanning
    Scanning,
    /// Connecting to, or talking with, a peer
    Connect,
}

/// Link layer status of the single connection slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Connecting,
    Connected { conn_handle: u16 },
    Disconnecting { conn_handle: u16 },
}

impl LinkState {
    pub fn is_idle(&self) -> bool {
        matches!(self, LinkState::Idle)
    }

    pub fn conn_handle(&self) -> Option<u16> {
        match self {
            LinkState::Connected { conn_handle } | LinkState::Disconnecting { conn_handle } => {
                Some(*conn_handle)
            }
            _ => None,
        }
    }
}

/// BLE address type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressType {
    Public,
    RandomStatic,
    RandomResolvable,
    RandomNonResolvable,
}

impl AddressType {
    /// Decode from the two top bits of the most significant octet.
    /// Addresses are stored least significant octet first.
    pub fn decode(mac: &MacAddress) -> Self {
        match mac[5] >> 6 {
            0 => AddressType::RandomNonResolvable,
            1 => AddressType::Public,
            2 => AddressType::RandomResolvable,
            _ => AddressType::RandomStatic,
        }
    }

    /// Type used when connecting. Public addresses connect unreliably and are
    /// retried as random static.
    pub fn for_connect(mac: &MacAddress) -> Self {
        match Self::decode(mac) {
            AddressType::Public => AddressType::RandomStatic,
            other => other,
        }
    }
}

/// Colon-separated, most significant octet first
pub fn format_mac(mac: &MacAddress) -> String {
    mac.iter()
        .rev()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}
