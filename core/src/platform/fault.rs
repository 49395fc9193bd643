// Retained fault record — survives a reset and is reported in health messages

use serde::{Deserialize, Serialize};

/// Length of the retained source file name
pub const FAULT_FILE_NAME_SIZE: usize = 13;

/// Class of the last fault seen by the node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FaultKind {
    /// No fault since the last power-on reset
    #[default]
    HardReset,
    /// Radio stack assertion
    SoftDeviceAssert,
    /// Invalid memory access
    MemoryAccess,
    /// Requested reset without error
    SoftReset,
    /// Parameter assertion inside the vendor SDK
    SdkAssert,
    /// Vendor SDK call returned an error
    SdkError,
    /// Anything else
    Unknown,
}

impl FaultKind {
    /// Wire code used in the health record
    pub fn code(&self) -> u8 {
        match self {
            FaultKind::HardReset => 0x00,
            FaultKind::SoftDeviceAssert => 0x01,
            FaultKind::MemoryAccess => 0x02,
            FaultKind::SoftReset => 0x0F,
            FaultKind::SdkAssert => 0x11,
            FaultKind::SdkError => 0x12,
            FaultKind::Unknown => 0xFF,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => FaultKind::HardReset,
            0x01 => FaultKind::SoftDeviceAssert,
            0x02 => FaultKind::MemoryAccess,
            0x0F => FaultKind::SoftReset,
            0x11 => FaultKind::SdkAssert,
            0x12 => FaultKind::SdkError,
            _ => FaultKind::Unknown,
        }
    }

    /// Only SDK faults carry a location worth reporting
    pub fn has_details(&self) -> bool {
        matches!(self, FaultKind::SdkAssert | FaultKind::SdkError)
    }
}

/// Last fault, kept across resets by the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RetainedFault {
    pub kind: FaultKind,
    /// Random id generated at boot, ties reports of one session together
    pub random_id: u16,
    pub err_code: u32,
    pub line_num: u16,
    pub file_name: [u8; FAULT_FILE_NAME_SIZE],
}

impl RetainedFault {
    /// Record a fault raised at `path:line`. Only the final path component is
    /// kept, truncated to the retained length.
    pub fn record(kind: FaultKind, random_id: u16, err_code: u32, path: &str, line: u16) -> Self {
        let name = path.rsplit(['/', '\\']).next().unwrap_or(path);
        let mut file_name = [0u8; FAULT_FILE_NAME_SIZE];
        let len = name.len().min(FAULT_FILE_NAME_SIZE);
        file_name[..len].copy_from_slice(&name.as_bytes()[..len]);

        Self {
            kind,
            random_id,
            err_code,
            line_num: line,
            file_name,
        }
    }
}
