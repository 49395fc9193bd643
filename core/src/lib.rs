// BLE scanner node core
//
// Everything the scanner does between two radio calls lives here: the
// scan/connect cycle, the peer handshake, the telemetry upload. The host
// owns the radio, the timers and the flash; the core only says what to do.

pub mod crypto;
pub mod engine;
pub mod platform;
pub mod protocol;
pub mod store;
pub mod transport;

pub use crypto::{NodeKeys, PeerKey, SignatureError};
pub use engine::{Action, Clock, Engine, Event, ProbeCandidate, StackCall, TimerId};
pub use platform::{FaultKind, RetainedFault, ScannerSettings, SettingsError};
pub use protocol::{Command, ProtocolError, Request, SessionMode};
pub use store::{
    Configuration, MemoryStore, Params, PersistentStore, RecordKey, RecordsExt, SledStore,
    StoreError, VersionRecord,
};
pub use transport::ble::{LinkState, NodeState};

/// Firmware version this core reports
pub fn version() -> String {
    format!(
        "{} (fw {}, protocol {})",
        env!("CARGO_PKG_VERSION"),
        platform::FW_VERSION_ID,
        platform::PROTOCOL_NUMBER
    )
}
