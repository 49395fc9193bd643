/// BLE (Bluetooth Low Energy) Transport Module
///
/// This module provides the protocol-level pieces of the central role the
/// scanner node plays towards peers:
///
/// - **advert**: advertisement report parsing and peer classification
/// - **gatt**: peer service layout, characteristic handles and records
/// - **discovery**: structured discovery results and the manual probe
/// - **sender**: chunked send pipeline and chunk reassembly
/// - **scanner**: node and link state, address type decoding
/// - **stack**: results reported back by the radio stack
///
/// The radio itself is driven by the host. Nothing here performs I/O.

pub mod advert;
pub mod discovery;
pub mod gatt;
pub mod scanner;
pub mod sender;
pub mod stack;

// Re-export commonly used types
pub use advert::{parse_advert, AdStructures, Advert, AdvertFilter, AdvertReject, PeerKind};

pub use discovery::{
    DiscoveryError, ManualProbe, ProbeCall, ProbeOutcome, ProbeProgress, ProbeRequest,
    HANDLE_END, HANDLE_START,
};

pub use gatt::{
    battery_level, decode_time, is_service_uuid, peer_id_from_uuid, service_uuid_for,
    Characteristic, DiscoveredCharacteristic, HealthFault, HealthGeneral, MacInfo,
    ServiceHandles, BASE_SERVICE_UUID, SERVICE_UUID16,
};

pub use scanner::{format_mac, AddressType, LinkState, NodeState};

pub use sender::{
    Channel, ChunkAssembler, ChunkError, ChunkedSender, RssiQueue, SendStep, RSSI_QUEUE_SIZE,
};

pub use stack::{GattStatus, PrimaryService, StackError, UuidType};
