//! Scanner node settings
//!
//! Timing constants and capacities that shape the scan/connect cycle:
//! - Scan-connect window and eco scan window
//! - Peer inactivity guard
//! - Allow/deny list expiry
//! - Sample threshold that triggers a connection
//! - Negotiated ATT MTU used to size telemetry batches

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// FIRMWARE CONSTANTS
// ============================================================================

/// Number of peer records (and allow/deny list entries)
pub const MAX_PEERS: usize = 8;

/// Peer identifier length in bytes
pub const PEER_ID_SIZE: usize = 10;

/// Samples held per peer record
pub const SAMPLES_PER_PEER: usize = 5;

/// Fixed chunk size for salts and signature slices
pub const CHUNK_SIZE: usize = 16;

/// Firmware version reported in health records
pub const FW_VERSION_ID: u16 = 13;

/// Protocol number; a change invalidates stored configuration
pub const PROTOCOL_NUMBER: u8 = 3;

/// Default ATT MTU
pub const DEFAULT_ATT_MTU: u16 = 23;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Errors that can occur during settings validation
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettingsError {
    #[error("Invalid scan-connect interval: must be > 0 ms")]
    InvalidScanConnectInterval,

    #[error("Invalid eco scan window: must be 1-60 s, got {0}")]
    InvalidEcoScanWindow(u32),

    #[error("Invalid inactivity timeout: must be > 0 ms")]
    InvalidInactivityTimeout,

    #[error("Invalid list timeout: must be > 0 ms")]
    InvalidListTimeout,

    #[error("Invalid sample threshold: must be 1-{max}, got {got}")]
    InvalidSampleThreshold { got: usize, max: usize },

    #[error("Invalid ATT MTU: must be >= 23, got {0}")]
    InvalidMtu(u16),
}

// ============================================================================
// SCANNER SETTINGS
// ============================================================================

/// Tunable scanner behaviour
///
/// Defaults reproduce the deployed firmware. Night-time duty period is a
/// multiple of the day period so scanners in one area stay in step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerSettings {
    /// Longest time spent scanning before a connection is attempted
    pub scan_connect_interval_ms: u32,

    /// Scan window after an eco wake-up
    pub eco_scan_secs: u32,

    /// Allowed peer silence during a multi-step exchange
    pub inactivity_timeout_ms: u32,

    /// Expiry of allow/deny list entries; also the deny-list drop period
    pub list_timeout_ms: u32,

    /// Fresh samples required before connecting to a peer
    pub sample_threshold: usize,

    /// Negotiated ATT MTU
    pub att_mtu: u16,

    /// Base duty period in seconds
    pub time_period_secs: u32,

    /// Periods per wake during the day
    pub periods_day: u32,

    /// Periods per wake during the night
    pub periods_night: u32,

    /// Seconds since midnight when day duty cycle begins
    pub daytime_start_secs: u32,

    /// Seconds since midnight when night duty cycle begins
    pub nighttime_start_secs: u32,
}

impl ScannerSettings {
    /// Validate settings
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.scan_connect_interval_ms == 0 {
            return Err(SettingsError::InvalidScanConnectInterval);
        }

        if self.eco_scan_secs == 0 || self.eco_scan_secs > 60 {
            return Err(SettingsError::InvalidEcoScanWindow(self.eco_scan_secs));
        }

        if self.inactivity_timeout_ms == 0 {
            return Err(SettingsError::InvalidInactivityTimeout);
        }

        if self.list_timeout_ms == 0 {
            return Err(SettingsError::InvalidListTimeout);
        }

        if self.sample_threshold == 0 || self.sample_threshold > SAMPLES_PER_PEER {
            return Err(SettingsError::InvalidSampleThreshold {
                got: self.sample_threshold,
                max: SAMPLES_PER_PEER,
            });
        }

        if self.att_mtu < DEFAULT_ATT_MTU {
            return Err(SettingsError::InvalidMtu(self.att_mtu));
        }

        Ok(())
    }

    /// Scan window after an eco wake-up, in milliseconds
    pub fn eco_scan_ms(&self) -> u32 {
        self.eco_scan_secs * 1000
    }

    /// Duty period for the day cycle
    pub fn day_period_secs(&self) -> u32 {
        (self.periods_day * self.time_period_secs).max(1)
    }

    /// Duty period for the night cycle
    pub fn night_period_secs(&self) -> u32 {
        (self.periods_night * self.time_period_secs).max(1)
    }

    /// Largest payload of one write without response
    pub fn max_write_len(&self) -> usize {
        usize::from(self.att_mtu) - 3
    }
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            scan_connect_interval_ms: 10_000,
            eco_scan_secs: 1,
            inactivity_timeout_ms: 3_000,
            list_timeout_ms: 30_000,
            sample_threshold: SAMPLES_PER_PEER,
            att_mtu: DEFAULT_ATT_MTU,
            time_period_secs: 10,
            periods_day: 1,
            periods_night: 6,
            daytime_start_secs: 6 * 3600,
            nighttime_start_secs: 3600,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
