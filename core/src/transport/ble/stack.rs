/// Radio stack call results reported back to the engine

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned by a stack call
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StackError {
    #[error("Stack busy")]
    Busy,
    #[error("Invalid state")]
    InvalidState,
    #[error("Not found")]
    NotFound,
    #[error("Stack error 0x{0:04X}")]
    Other(u32),
}

/// ATT status of a GATT client response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GattStatus {
    Success,
    AttributeNotFound,
    Other(u16),
}

impl GattStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, GattStatus::Success)
    }
}

/// UUID namespace of a discovered primary service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UuidType {
    /// Bluetooth SIG 16-bit UUID
    Bluetooth,
    /// Registered vendor base
    Vendor,
    /// 128-bit UUID with an unregistered base
    Unknown,
}

/// One entry of a primary service discovery response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryService {
    pub uuid16: u16,
    pub uuid_type: UuidType,
    pub start_handle: u16,
    pub end_handle: u16,
}
