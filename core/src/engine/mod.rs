//! Scanner protocol engine
//!
//! The engine owns every piece of node state and is driven by the host one
//! [`Event`] at a time. Each call returns the [`Action`]s the host must carry
//! out, in order. Radio results come back as further events; nothing in here
//! blocks, spawns or touches a clock.
//!
//! - **scan**: scan/connect/idle state machine and advertisement handling
//! - **session**: discovery, handshake and the telemetry upload of one link
//! - **clock**: the 1 s system tick

mod clock;
mod event;
mod scan;
mod session;

pub use clock::Clock;
pub use event::{Action, Event, StackCall, TimerId};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, error, info, warn};

use crate::crypto::{NodeKeys, PeerKey};
use crate::platform::{
    RetainedFault, ScannerSettings, SettingsError, FW_VERSION_ID, PROTOCOL_NUMBER,
};
use crate::protocol::{Handshake, SessionMode};
use crate::store::{
    AllowList, Configuration, DenyList, Fingerprint, MacAddress, Params, PeerTable,
    PersistentStore, RecordKey, RecordsExt, Sample, StoreError, VersionRecord,
};
use crate::transport::ble::{ChunkedSender, LinkState, ManualProbe, NodeState, ServiceHandles};

// ============================================================================
// ENGINE STATE
// ============================================================================

/// Background-mode peer staged for a manual probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeCandidate {
    pub address: MacAddress,
    pub fingerprint: Fingerprint,
    pub sample: Sample,
}

/// Key material loaded from the configuration
struct Credentials {
    short_node_id: u16,
    keys: NodeKeys,
    peer_key: PeerKey,
}

pub struct Engine {
    settings: ScannerSettings,
    store: Box<dyn PersistentStore>,
    fault: RetainedFault,
    node_mac: MacAddress,
    rng: StdRng,

    state: NodeState,
    link: LinkState,
    clock: Clock,
    params: Params,
    credentials: Option<Credentials>,

    peers: PeerTable,
    allow: AllowList,
    deny: DenyList,
    /// A valid peer was sighted since the last scan start
    peer_nearby: bool,

    /// Slot of the peer the current link belongs to
    connected_slot: Option<usize>,
    probe_candidate: Option<ProbeCandidate>,
    probe: Option<ManualProbe>,
    handles: Option<ServiceHandles>,
    handshake: Handshake,
    sender: ChunkedSender,

    actions: Vec<Action>,
}

impl Engine {
    /// Create an engine for a node with radio address `node_mac`. Settings
    /// are validated up front; everything else happens on [`Event::Boot`].
    pub fn new(
        settings: ScannerSettings,
        store: Box<dyn PersistentStore>,
        fault: RetainedFault,
        node_mac: MacAddress,
    ) -> Result<Self, SettingsError> {
        settings.validate()?;
        let list_ttl = u64::from(settings.list_timeout_ms);

        Ok(Self {
            clock: Clock::new(&settings),
            peers: PeerTable::new(settings.sample_threshold),
            allow: AllowList::new(list_ttl),
            deny: DenyList::new(list_ttl),
            sender: ChunkedSender::new(settings.att_mtu),
            settings,
            store,
            fault,
            node_mac,
            rng: StdRng::from_entropy(),
            state: NodeState::Init,
            link: LinkState::Idle,
            params: Params::default(),
            credentials: None,
            peer_nearby: false,
            connected_slot: None,
            probe_candidate: None,
            probe: None,
            handles: None,
            handshake: Handshake::new(),
            actions: Vec::new(),
        })
    }

    /// Replace the salt generator with a deterministic one
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn link(&self) -> LinkState {
        self.link
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn params(&self) -> Params {
        self.params
    }

    pub fn settings(&self) -> &ScannerSettings {
        &self.settings
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn allow_list(&self) -> &AllowList {
        &self.allow
    }

    pub fn deny_list(&self) -> &DenyList {
        &self.deny
    }

    pub fn session_mode(&self) -> SessionMode {
        self.handshake.mode()
    }

    pub fn probe_candidate(&self) -> Option<&ProbeCandidate> {
        self.probe_candidate.as_ref()
    }

    pub fn is_provisioned(&self) -> bool {
        self.credentials.is_some()
    }

    /// Public key matching the stored private key
    pub fn node_public_key(&self) -> Option<[u8; 64]> {
        self.credentials.as_ref().map(|c| c.keys.public_key())
    }

    pub fn store(&self) -> &dyn PersistentStore {
        self.store.as_ref()
    }

    // ------------------------------------------------------------------------
    // Entry points
    // ------------------------------------------------------------------------

    /// Process one event and return the actions it produced
    pub fn handle_event(&mut self, event: Event) -> Vec<Action> {
        match event {
            Event::Boot => self.boot(),
            Event::Tick => self.on_tick(),
            event if self.state == NodeState::Init => {
                debug!(?event, "Not provisioned, event ignored");
            }
            Event::AdvertReport {
                address,
                rssi,
                data,
            } => self.on_advert(address, rssi, &data),
            Event::Connected { conn_handle } => self.on_connected(conn_handle),
            Event::ConnectFailed => self.on_connect_failed(),
            Event::Disconnected {
                conn_handle,
                reason,
            } => self.on_disconnected(conn_handle, reason),
            Event::ServiceDiscovered { characteristics } => {
                self.on_service_discovered(&characteristics)
            }
            Event::ServiceNotFound => self.on_service_not_found(),
            Event::PrimaryServices { status, services } => {
                self.on_primary_services(status, &services)
            }
            Event::ReadResponse { handle, data } => self.on_read_response(handle, &data),
            Event::Notification { handle, data } => self.on_notification(handle, &data),
            Event::TxComplete => self.on_tx_complete(),
            Event::BatteryMeasured { voltage } => self.on_battery_measured(voltage),
            Event::TimerExpired(timer) => self.on_timer(timer),
            Event::CallFailed { call, error } => self.on_call_failed(call, error),
        }
        std::mem::take(&mut self.actions)
    }

    /// Store a new configuration. The node reboots into it; a failed write
    /// wipes the storage region instead.
    pub fn commit_config(&mut self, config: &Configuration) -> Vec<Action> {
        match self.store.write_config(config) {
            Ok(()) => {
                info!(node_id = config.node_id, "Configuration stored");
                self.emit(Action::Reboot);
            }
            Err(e) => self.fatal(e),
        }
        std::mem::take(&mut self.actions)
    }

    // ------------------------------------------------------------------------
    // Boot
    // ------------------------------------------------------------------------

    fn boot(&mut self) {
        info!(fw = FW_VERSION_ID, protocol = PROTOCOL_NUMBER, "Scanner booting");
        if let Err(e) = self.check_version() {
            return self.fatal(e);
        }

        let config = match self.store.load_config() {
            Ok(Some(config)) => config,
            Ok(None) => {
                warn!("Node not provisioned, waiting for configuration");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Stored configuration unusable");
                return;
            }
        };

        self.params = match self.store.load_params() {
            Ok(params) => params.unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "Params unreadable, using defaults");
                Params::default()
            }
        };

        let credentials = NodeKeys::from_bytes(&config.private_key).and_then(|keys| {
            let peer_key = PeerKey::from_raw(&config.peer_public_key)?;
            Ok(Credentials {
                short_node_id: config.short_node_id(),
                keys,
                peer_key,
            })
        });
        match credentials {
            Ok(credentials) => self.credentials = Some(credentials),
            Err(e) => {
                error!(error = %e, "Configuration holds unusable keys");
                return;
            }
        }

        info!(
            node_id = config.node_id,
            rssi_lower_limit = self.params.rssi_lower_limit,
            "Configuration loaded"
        );
        self.emit(Action::StartTimer {
            timer: TimerId::DenyListDrop,
            after_ms: self.settings.list_timeout_ms,
            periodic: true,
        });
        self.scan_start();
    }

    /// A protocol change invalidates the configuration; a firmware change
    /// only needs the record rewritten.
    fn check_version(&mut self) -> Result<(), StoreError> {
        let stored = self.store.load_version().unwrap_or_else(|e| {
            warn!(error = %e, "Version record unreadable");
            None
        });
        let current = VersionRecord::current();

        match stored {
            Some(version) if version == current => return Ok(()),
            Some(version) if version.protocol_id != current.protocol_id => {
                warn!(
                    from = version.protocol_id,
                    to = current.protocol_id,
                    "Protocol changed, dropping configuration"
                );
                self.store.delete(RecordKey::Configuration)?;
            }
            Some(version) => {
                info!(from = version.fw_id, to = current.fw_id, "Firmware updated");
            }
            None => debug!("No version record"),
        }
        self.store.write_version(&current)
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn emit(&mut self, action: Action) {
        self.actions.push(action);
    }

    fn start_timer(&mut self, timer: TimerId, after_ms: u32) {
        self.emit(Action::StartTimer {
            timer,
            after_ms,
            periodic: false,
        });
    }

    fn stop_timer(&mut self, timer: TimerId) {
        self.emit(Action::StopTimer(timer));
    }

    fn set_indicators(&mut self, scanning: bool, connected: bool) {
        self.emit(Action::SetIndicators {
            scanning,
            connected,
        });
    }

    fn now_ms(&self) -> u64 {
        self.clock.elapsed_ms()
    }

    /// Storage can no longer be trusted: wipe it and reboot
    fn fatal(&mut self, err: StoreError) {
        error!(error = %err, "Storage failure, erasing records");
        if let Err(e) = self.store.erase_all() {
            error!(error = %e, "Storage erase failed");
        }
        self.emit(Action::Reboot);
    }

    fn on_tick(&mut self) {
        self.emit(Action::FeedWatchdog);
        if self.clock.tick(self.state == NodeState::Idle) {
            debug!(system_time = self.clock.system_time(), "Duty period wake-up");
            self.eco_handler();
        }
    }

    fn on_timer(&mut self, timer: TimerId) {
        match timer {
            TimerId::Eco => self.eco_handler(),
            TimerId::ScanConnect => self.on_scan_connect_timeout(),
            TimerId::Inactivity => self.on_inactivity_timeout(),
            TimerId::DenyListDrop => {
                debug!(entries = self.deny.len(), "Dropping deny list");
                self.deny.clear();
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
