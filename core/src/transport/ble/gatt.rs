/// Peer GATT service layout and the records written to it
///
/// The peer exposes one vendor service whose 128-bit UUID embeds the peer
/// identifier. Characteristic UUIDs count up from the 16-bit service UUID.
/// All multi-byte record fields are little-endian and packed.

use serde::{Deserialize, Serialize};

use super::discovery::DiscoveryError;
use crate::platform::{FAULT_FILE_NAME_SIZE, FW_VERSION_ID, PEER_ID_SIZE};
use crate::store::{MacAddress, PeerId};

/// 16-bit vendor service UUID (0xB500)
pub const SERVICE_UUID16: u16 = 0xB500;

/// Vendor base UUID, on-air byte order. Octets 2..=11 carry the identifier.
pub const BASE_SERVICE_UUID: [u8; 16] = [
    0xFF, 0xFF, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    (SERVICE_UUID16 & 0xFF) as u8,
    (SERVICE_UUID16 >> 8) as u8,
    0x00, 0x00,
];

/// Size of the mac-info record
pub const MAC_INFO_SIZE: usize = 8;

/// Size of the general health record
pub const HEALTH_GENERAL_SIZE: usize = 19;

/// Size of the fault detail record
pub const HEALTH_FAULT_SIZE: usize = 20;

/// Size of a time read response
pub const TIME_SIZE: usize = 4;

const HEALTH_GENERAL_MSG: u8 = 0x01;
const HEALTH_FAULT_MSG: u8 = 0x02;

/// Characteristics of the peer service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Characteristic {
    /// Peer to node requests [NOTIFY, READ]
    Notify,
    /// Signature to peer, salt from peer [WRITE]
    Sign,
    /// Sample batches [WRITE]
    Rssi,
    /// Health records [WRITE]
    Health,
    /// Peer local time [READ]
    Time,
    /// Node address and id, iOS peers only [WRITE]
    MacInfo,
}

impl Characteristic {
    pub const ALL: [Characteristic; 6] = [
        Characteristic::Notify,
        Characteristic::Sign,
        Characteristic::Rssi,
        Characteristic::Health,
        Characteristic::Time,
        Characteristic::MacInfo,
    ];

    /// Get characteristic UUID (short form)
    pub fn uuid16(&self) -> u16 {
        match self {
            Characteristic::Notify => SERVICE_UUID16 + 1,
            Characteristic::Sign => SERVICE_UUID16 + 2,
            Characteristic::Rssi => SERVICE_UUID16 + 3,
            Characteristic::Health => SERVICE_UUID16 + 4,
            Characteristic::Time => SERVICE_UUID16 + 5,
            Characteristic::MacInfo => SERVICE_UUID16 + 6,
        }
    }

    pub fn from_uuid16(uuid: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.uuid16() == uuid)
    }
}

/// True when a 128-bit UUID (on-air order) belongs to the vendor service
pub fn is_service_uuid(uuid: &[u8]) -> bool {
    uuid.len() == 16 && uuid[13] == (SERVICE_UUID16 >> 8) as u8 && uuid[12] == SERVICE_UUID16 as u8
}

/// Identifier carried by a service UUID, kind byte first
pub fn peer_id_from_uuid(uuid: &[u8; 16]) -> PeerId {
    let mut id = [0u8; PEER_ID_SIZE];
    for (j, byte) in id.iter_mut().enumerate() {
        *byte = uuid[11 - j];
    }
    id
}

/// Service UUID a peer with identifier `id` registers
pub fn service_uuid_for(id: &PeerId) -> [u8; 16] {
    let mut uuid = BASE_SERVICE_UUID;
    for (j, byte) in id.iter().enumerate() {
        uuid[11 - j] = *byte;
    }
    uuid
}

/// One characteristic reported by structured discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveredCharacteristic {
    pub uuid16: u16,
    pub value_handle: u16,
    pub cccd_handle: Option<u16>,
}

/// Attribute handles resolved for the connected peer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceHandles {
    pub notify: Option<u16>,
    pub notify_cccd: Option<u16>,
    pub sign: Option<u16>,
    pub rssi: Option<u16>,
    pub health: Option<u16>,
    pub time: Option<u16>,
    pub mac_info: Option<u16>,
}

impl ServiceHandles {
    /// Capture handles by characteristic UUID. Unknown UUIDs are ignored.
    pub fn from_characteristics(chars: &[DiscoveredCharacteristic]) -> Self {
        let mut handles = Self::default();
        for ch in chars {
            match Characteristic::from_uuid16(ch.uuid16) {
                Some(Characteristic::Notify) => {
                    handles.notify = Some(ch.value_handle);
                    handles.notify_cccd = ch.cccd_handle;
                }
                Some(Characteristic::Sign) => handles.sign = Some(ch.value_handle),
                Some(Characteristic::Rssi) => handles.rssi = Some(ch.value_handle),
                Some(Characteristic::Health) => handles.health = Some(ch.value_handle),
                Some(Characteristic::Time) => handles.time = Some(ch.value_handle),
                Some(Characteristic::MacInfo) => handles.mac_info = Some(ch.value_handle),
                None => {}
            }
        }
        handles
    }

    pub fn handle(&self, characteristic: Characteristic) -> Option<u16> {
        match characteristic {
            Characteristic::Notify => self.notify,
            Characteristic::Sign => self.sign,
            Characteristic::Rssi => self.rssi,
            Characteristic::Health => self.health,
            Characteristic::Time => self.time,
            Characteristic::MacInfo => self.mac_info,
        }
    }

    pub fn require(&self, characteristic: Characteristic) -> Result<u16, DiscoveryError> {
        self.handle(characteristic)
            .ok_or(DiscoveryError::MissingCharacteristic(characteristic))
    }
}

/// Node address and short id, written to iOS peers before the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacInfo {
    pub mac: MacAddress,
    pub node_id: u16,
}

impl MacInfo {
    pub fn to_bytes(&self) -> [u8; MAC_INFO_SIZE] {
        let mut bytes = [0u8; MAC_INFO_SIZE];
        bytes[..6].copy_from_slice(&self.mac);
        bytes[6..].copy_from_slice(&self.node_id.to_le_bytes());
        bytes
    }
}

/// General health record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HealthGeneral {
    /// Tenths of a volt
    pub battery_level: u8,
    pub fw_id: u16,
    /// Minutes since boot
    pub uptime: u32,
    /// Seconds since midnight
    pub system_time: u32,
    pub err_id: u16,
    pub err_type: u8,
    /// Seconds spent idle
    pub sleep_time: u32,
}

impl HealthGeneral {
    pub fn new(battery_level: u8, uptime: u32, system_time: u32, sleep_time: u32) -> Self {
        Self {
            battery_level,
            fw_id: FW_VERSION_ID,
            uptime,
            system_time,
            sleep_time,
            ..Default::default()
        }
    }

    pub fn to_bytes(&self) -> [u8; HEALTH_GENERAL_SIZE] {
        let mut bytes = [0u8; HEALTH_GENERAL_SIZE];
        bytes[0] = HEALTH_GENERAL_MSG;
        bytes[1] = self.battery_level;
        bytes[2..4].copy_from_slice(&self.fw_id.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.uptime.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.system_time.to_le_bytes());
        bytes[12..14].copy_from_slice(&self.err_id.to_le_bytes());
        bytes[14] = self.err_type;
        bytes[15..19].copy_from_slice(&self.sleep_time.to_le_bytes());
        bytes
    }
}

/// Fault detail record, sent after the general record when available
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthFault {
    pub err_code: u32,
    pub line_num: u16,
    pub file_name: [u8; FAULT_FILE_NAME_SIZE],
}

impl HealthFault {
    pub fn to_bytes(&self) -> [u8; HEALTH_FAULT_SIZE] {
        let mut bytes = [0u8; HEALTH_FAULT_SIZE];
        bytes[0] = HEALTH_FAULT_MSG;
        bytes[1..5].copy_from_slice(&self.err_code.to_le_bytes());
        bytes[5..7].copy_from_slice(&self.line_num.to_le_bytes());
        bytes[7..].copy_from_slice(&self.file_name);
        bytes
    }
}

/// Battery voltage in tenths of a volt, saturating
pub fn battery_level(voltage: f32) -> u8 {
    (voltage * 10.0).clamp(0.0, u8::MAX as f32) as u8
}

/// Milliseconds since midnight from a time read response
pub fn decode_time(data: &[u8]) -> Option<u32> {
    let bytes: [u8; TIME_SIZE] = data.get(..TIME_SIZE)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}
