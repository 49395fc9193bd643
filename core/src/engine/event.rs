// Events the host feeds into the engine and the actions it gets back

use serde::{Deserialize, Serialize};

use crate::store::MacAddress;
use crate::transport::ble::{
    AddressType, DiscoveredCharacteristic, GattStatus, PrimaryService, StackError,
};

/// Timers the engine asks the host to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimerId {
    /// Eco scan window after a wake-up
    Eco,
    /// Scan-connect window
    ScanConnect,
    /// Peer silence guard during an exchange
    Inactivity,
    /// Periodic deny-list drop
    DenyListDrop,
}

/// Stack calls whose synchronous failure is reported back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StackCall {
    StartScan,
    Connect,
    Disconnect,
    DiscoverService,
    DiscoverPrimaryServices,
    Read,
    Write,
    EnableNotifications,
}

/// Input to [`Engine::handle_event`](super::Engine::handle_event)
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Boot,
    /// One second of wall time elapsed
    Tick,
    AdvertReport {
        address: MacAddress,
        rssi: i8,
        data: Vec<u8>,
    },
    Connected {
        conn_handle: u16,
    },
    /// Connection attempt timed out or was refused
    ConnectFailed,
    Disconnected {
        conn_handle: u16,
        reason: u8,
    },
    /// Structured discovery of the peer service completed
    ServiceDiscovered {
        characteristics: Vec<DiscoveredCharacteristic>,
    },
    ServiceNotFound,
    PrimaryServices {
        status: GattStatus,
        services: Vec<PrimaryService>,
    },
    ReadResponse {
        handle: u16,
        data: Vec<u8>,
    },
    Notification {
        handle: u16,
        data: Vec<u8>,
    },
    /// A write without response left the radio
    TxComplete,
    BatteryMeasured {
        voltage: f32,
    },
    TimerExpired(TimerId),
    CallFailed {
        call: StackCall,
        error: StackError,
    },
}

/// Output of the engine, executed by the host in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    StartScan,
    StopScan,
    Connect {
        address: MacAddress,
        addr_type: AddressType,
    },
    Disconnect {
        conn_handle: u16,
    },
    DiscoverService {
        conn_handle: u16,
        service_uuid: [u8; 16],
    },
    DiscoverPrimaryServices {
        conn_handle: u16,
        start_handle: u16,
    },
    Read {
        conn_handle: u16,
        handle: u16,
    },
    /// Write without response; completion arrives as [`Event::TxComplete`]
    Write {
        conn_handle: u16,
        handle: u16,
        data: Vec<u8>,
    },
    EnableNotifications {
        conn_handle: u16,
        cccd_handle: u16,
    },
    /// Start, or restart, a timer
    StartTimer {
        timer: TimerId,
        after_ms: u32,
        periodic: bool,
    },
    StopTimer(TimerId),
    MeasureBattery,
    SetIndicators {
        scanning: bool,
        connected: bool,
    },
    FeedWatchdog,
    EnterDfu,
    Reboot,
}

impl Action {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Action::EnterDfu | Action::Reboot)
    }
}
