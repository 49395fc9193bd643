//! Platform layer for the scanner node
//!
//! This module provides:
//! - Validated timing settings and firmware constants
//! - The retained fault record reported in health messages

pub mod fault;
pub mod settings;

pub use fault::{FaultKind, RetainedFault, FAULT_FILE_NAME_SIZE};
pub use settings::{
    ScannerSettings, SettingsError, CHUNK_SIZE, DEFAULT_ATT_MTU, FW_VERSION_ID, MAX_PEERS,
    PEER_ID_SIZE, PROTOCOL_NUMBER, SAMPLES_PER_PEER,
};
