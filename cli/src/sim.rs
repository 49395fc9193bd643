// Scripted peers driving the engine in virtual time
//
// The simulator stands in for the radio stack, the timers and the phones
// around the node. Every engine action is answered the way a cooperative
// stack and peer would answer it, one virtual second per step.

use std::collections::{HashMap, VecDeque};

use anyhow::{Context, Result};
use blesc_core::crypto::SIGNATURE_SIZE;
use blesc_core::platform::CHUNK_SIZE;
use blesc_core::protocol::SALT_SIZE;
use blesc_core::store::{Fingerprint, MacAddress, PeerId};
use blesc_core::transport::ble::{
    service_uuid_for, Characteristic, DiscoveredCharacteristic, GattStatus, PrimaryService,
    StackError, UuidType,
};
use blesc_core::{
    Action, Configuration, Engine, Event, MemoryStore, NodeKeys, NodeState, PeerKey, RecordsExt,
    RetainedFault, ScannerSettings, StackCall, TimerId,
};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Node id the simulated node is provisioned with
pub const SIM_NODE_ID: u32 = 0x0042_0203;

/// Attribute layout every scripted peer exposes
const NOTIFY: u16 = 0x21;
const CCCD: u16 = 0x22;
const SIGN: u16 = 0x24;
const RSSI: u16 = 0x26;
const HEALTH: u16 = 0x28;
const TIME: u16 = 0x2A;
const MAC_INFO: u16 = 0x2C;
const SERVICE_START: u16 = 0x20;
const SERVICE_END: u16 = 0x2F;

const REASON_LOCAL_HOST: u8 = 0x16;
const REASON_TIMEOUT: u8 = 0x08;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerKindScript {
    Android,
    Ios,
    Tools,
    Background,
}

/// What a peer does once the node subscribes to it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum Behaviour {
    /// Ask for the node signature and accept the upload
    Telemetry,
    /// Send a privileged request once, then behave as telemetry
    Command { request: Vec<u8> },
    /// Never speak
    Silent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerScript {
    pub name: String,
    pub kind: PeerKindScript,
    pub rssi: i8,
    #[serde(default)]
    pub appear_at_secs: u32,
    #[serde(default)]
    pub leave_at_secs: Option<u32>,
    /// Peer wall clock at simulation start
    #[serde(default = "default_peer_time")]
    pub time_ms: u32,
    pub behaviour: Behaviour,
}

fn default_peer_time() -> u32 {
    8 * 3600 * 1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub duration_secs: u32,
    pub peers: Vec<PeerScript>,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            duration_secs: 120,
            peers: vec![
                PeerScript {
                    name: "android".to_string(),
                    kind: PeerKindScript::Android,
                    rssi: -55,
                    appear_at_secs: 0,
                    leave_at_secs: None,
                    time_ms: default_peer_time(),
                    behaviour: Behaviour::Telemetry,
                },
                PeerScript {
                    name: "background".to_string(),
                    kind: PeerKindScript::Background,
                    rssi: -70,
                    appear_at_secs: 20,
                    leave_at_secs: Some(90),
                    time_ms: default_peer_time(),
                    behaviour: Behaviour::Telemetry,
                },
            ],
        }
    }
}

impl Scenario {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario {}", path.display()))?;
        serde_json::from_str(&contents).context("Failed to parse scenario")
    }
}

// ============================================================================
// REPORT
// ============================================================================

#[derive(Debug, Clone, Default, Serialize)]
pub struct PeerReport {
    pub name: String,
    pub connections: u32,
    pub health_records: u32,
    pub samples_uploaded: u32,
    pub signatures_verified: u32,
    pub commands_sent: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SimReport {
    pub seconds: u32,
    pub final_state: String,
    pub connections: u32,
    pub failed_connections: u32,
    pub disconnects: u32,
    pub watchdog_feeds: u32,
    pub halted_by: Option<String>,
    pub peers: Vec<PeerReport>,
}

// ============================================================================
// SIMULATOR
// ============================================================================

struct SimPeer {
    script: PeerScript,
    id: PeerId,
    address: MacAddress,
    fingerprint: Fingerprint,
    command_pending: bool,
    report: PeerReport,
}

impl SimPeer {
    fn new(index: usize, script: PeerScript) -> Self {
        let n = index as u8 + 1;
        let mut id = [n; 10];
        id[0] = match script.kind {
            PeerKindScript::Android => 0x00,
            PeerKindScript::Tools => 0x01,
            PeerKindScript::Background => 0x02,
            PeerKindScript::Ios => 0xFF,
        };
        if script.kind == PeerKindScript::Tools {
            let short = SIM_NODE_ID as u16;
            id[2] = (short >> 8) as u8;
            id[3] = short as u8;
        }
        let command_pending = matches!(script.behaviour, Behaviour::Command { .. });
        Self {
            report: PeerReport {
                name: script.name.clone(),
                ..Default::default()
            },
            id,
            address: [n, 0x5A, 0x5A, 0x5A, 0x5A, 0xC0],
            fingerprint: [0xB0 | n; 16],
            command_pending,
            script,
        }
    }

    fn present_at(&self, secs: u32) -> bool {
        secs >= self.script.appear_at_secs && self.script.leave_at_secs.map_or(true, |l| secs < l)
    }

    fn advert(&self) -> Vec<u8> {
        if self.script.kind == PeerKindScript::Background {
            let mut data = vec![0x02, 0x01, 0x1A, 20, 0xFF, 0x4C, 0x00];
            data.extend_from_slice(&self.fingerprint);
            data.push(0x00);
            data
        } else {
            let mut data = vec![0x02, 0x01, 0x06, 17, 0x07];
            data.extend_from_slice(&service_uuid_for(&self.id));
            data
        }
    }

    fn characteristics(&self) -> Vec<DiscoveredCharacteristic> {
        let mut layout = vec![
            (Characteristic::Notify, NOTIFY, Some(CCCD)),
            (Characteristic::Sign, SIGN, None),
            (Characteristic::Rssi, RSSI, None),
            (Characteristic::Health, HEALTH, None),
            (Characteristic::Time, TIME, None),
        ];
        if self.script.kind == PeerKindScript::Ios {
            layout.push((Characteristic::MacInfo, MAC_INFO, None));
        }
        layout
            .into_iter()
            .map(|(c, value_handle, cccd_handle)| DiscoveredCharacteristic {
                uuid16: c.uuid16(),
                value_handle,
                cccd_handle,
            })
            .collect()
    }
}

struct Timer {
    due_ms: u64,
    period_ms: Option<u64>,
}

struct Link {
    peer: usize,
    conn_handle: u16,
    /// Bytes streamed by the node on the sign characteristic
    sign_rx: Vec<u8>,
    /// Salt this peer asked the node to sign
    salt: Option<[u8; SALT_SIZE]>,
}

pub struct Simulator {
    engine: Engine,
    node_key: PeerKey,
    backend: NodeKeys,
    peers: Vec<SimPeer>,
    rng: StdRng,
    now_ms: u64,
    duration_secs: u32,
    timers: HashMap<TimerId, Timer>,
    scanning: bool,
    link: Option<Link>,
    next_conn: u16,
    pending: VecDeque<Event>,
    report: SimReport,
    halted: Option<Action>,
}

impl Simulator {
    /// Provision a fresh node in memory and boot it
    pub fn new(
        scenario: Scenario,
        settings: ScannerSettings,
        node_mac: MacAddress,
        seed: u64,
    ) -> Result<Self> {
        let node = NodeKeys::generate();
        let backend = NodeKeys::generate();
        let node_key = PeerKey::from_raw(&node.public_key()).context("Bad node key")?;

        let mut store = MemoryStore::new();
        store
            .write_config(&Configuration {
                node_id: SIM_NODE_ID,
                private_key: node.to_bytes().to_vec(),
                peer_public_key: backend.public_key().to_vec(),
            })
            .context("Failed to provision simulated node")?;

        let engine = Engine::new(settings, Box::new(store), RetainedFault::default(), node_mac)
            .context("Invalid scanner settings")?
            .with_seed(seed);

        let mut sim = Self {
            engine,
            node_key,
            backend,
            peers: scenario
                .peers
                .into_iter()
                .enumerate()
                .map(|(i, script)| SimPeer::new(i, script))
                .collect(),
            rng: StdRng::seed_from_u64(seed),
            now_ms: 0,
            duration_secs: scenario.duration_secs,
            timers: HashMap::new(),
            scanning: false,
            link: None,
            next_conn: 1,
            pending: VecDeque::new(),
            report: SimReport::default(),
            halted: None,
        };
        sim.dispatch(Event::Boot)?;
        Ok(sim)
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn elapsed_secs(&self) -> u32 {
        (self.now_ms / 1000) as u32
    }

    pub fn halted(&self) -> Option<&Action> {
        self.halted.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.halted.is_some() || self.elapsed_secs() >= self.duration_secs
    }

    /// Advance one virtual second
    pub fn step(&mut self) -> Result<()> {
        let secs = self.elapsed_secs();
        self.update_presence(secs)?;
        if self.scanning {
            self.advertise(secs)?;
        }

        let end = self.now_ms + 1000;
        while let Some(timer) = self.next_due(end) {
            self.dispatch(Event::TimerExpired(timer))?;
        }
        self.now_ms = end;
        self.dispatch(Event::Tick)?;
        self.report.seconds += 1;
        Ok(())
    }

    /// Run to the end of the scenario without pacing
    pub fn run(&mut self) -> Result<()> {
        while !self.is_finished() {
            self.step()?;
        }
        Ok(())
    }

    pub fn report(&self) -> SimReport {
        let mut report = self.report.clone();
        report.final_state = format!("{:?}", self.engine.state());
        report.halted_by = self.halted.as_ref().map(|a| format!("{:?}", a));
        report.peers = self.peers.iter().map(|p| p.report.clone()).collect();
        report
    }

    // ------------------------------------------------------------------------
    // Radio environment
    // ------------------------------------------------------------------------

    fn update_presence(&mut self, secs: u32) -> Result<()> {
        let Some(link) = &self.link else {
            return Ok(());
        };
        if !self.peers[link.peer].present_at(secs) {
            let conn_handle = link.conn_handle;
            info!(peer = %self.peers[link.peer].script.name, "Peer walked away");
            self.link = None;
            self.report.disconnects += 1;
            self.dispatch(Event::Disconnected {
                conn_handle,
                reason: REASON_TIMEOUT,
            })?;
        }
        Ok(())
    }

    fn advertise(&mut self, secs: u32) -> Result<()> {
        let reports: Vec<Event> = self
            .peers
            .iter()
            .filter(|p| p.present_at(secs))
            .map(|p| Event::AdvertReport {
                address: p.address,
                rssi: p.script.rssi,
                data: p.advert(),
            })
            .collect();
        for report in reports {
            if !self.scanning || self.halted.is_some() {
                break;
            }
            self.dispatch(report)?;
        }
        Ok(())
    }

    /// Earliest timer due before `end`, rescheduled or removed
    fn next_due(&mut self, end: u64) -> Option<TimerId> {
        if self.halted.is_some() {
            return None;
        }
        let (id, due) = self
            .timers
            .iter()
            .filter(|(_, t)| t.due_ms < end)
            .min_by_key(|(_, t)| t.due_ms)
            .map(|(id, t)| (*id, t.due_ms))?;
        self.now_ms = self.now_ms.max(due);
        match self.timers.get_mut(&id).and_then(|t| t.period_ms) {
            Some(period) => {
                if let Some(timer) = self.timers.get_mut(&id) {
                    timer.due_ms = due + period.max(1);
                }
            }
            None => {
                self.timers.remove(&id);
            }
        }
        Some(id)
    }

    fn dispatch(&mut self, event: Event) -> Result<()> {
        self.pending.push_back(event);
        while let Some(event) = self.pending.pop_front() {
            debug!(?event, "Event");
            for action in self.engine.handle_event(event) {
                self.apply(action)?;
                if self.halted.is_some() {
                    self.pending.clear();
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn peer_for_link(&self, conn_handle: u16) -> Option<usize> {
        self.link
            .as_ref()
            .filter(|l| l.conn_handle == conn_handle)
            .map(|l| l.peer)
    }

    fn peer_time_ms(&self, peer: usize) -> u32 {
        self.peers[peer]
            .script
            .time_ms
            .wrapping_add(self.now_ms as u32)
    }

    // ------------------------------------------------------------------------
    // Stack and peer responses
    // ------------------------------------------------------------------------

    fn apply(&mut self, action: Action) -> Result<()> {
        match action {
            Action::StartScan => self.scanning = true,
            Action::StopScan => self.scanning = false,
            Action::Connect { address, .. } => {
                let secs = self.elapsed_secs();
                let found = self
                    .peers
                    .iter()
                    .position(|p| p.address == address && p.present_at(secs));
                let busy = self.link.is_some();
                match found {
                    Some(peer) if !busy => {
                        let conn_handle = self.next_conn;
                        self.next_conn = self.next_conn.wrapping_add(1).max(1);
                        self.link = Some(Link {
                            peer,
                            conn_handle,
                            sign_rx: Vec::new(),
                            salt: None,
                        });
                        self.peers[peer].report.connections += 1;
                        self.report.connections += 1;
                        self.pending.push_back(Event::Connected { conn_handle });
                    }
                    _ => {
                        self.report.failed_connections += 1;
                        self.pending.push_back(Event::ConnectFailed);
                    }
                }
            }
            Action::Disconnect { conn_handle } => {
                if self.peer_for_link(conn_handle).is_some() {
                    self.link = None;
                    self.report.disconnects += 1;
                    self.pending.push_back(Event::Disconnected {
                        conn_handle,
                        reason: REASON_LOCAL_HOST,
                    });
                } else {
                    debug!(conn_handle, "Disconnect for a link already gone");
                }
            }
            Action::DiscoverService {
                conn_handle,
                service_uuid,
            } => {
                let event = match self.peer_for_link(conn_handle) {
                    Some(peer) if service_uuid_for(&self.peers[peer].id) == service_uuid => {
                        Event::ServiceDiscovered {
                            characteristics: self.peers[peer].characteristics(),
                        }
                    }
                    _ => Event::ServiceNotFound,
                };
                self.pending.push_back(event);
            }
            Action::DiscoverPrimaryServices { conn_handle, .. } => {
                let services = match self.peer_for_link(conn_handle) {
                    Some(_) => vec![PrimaryService {
                        uuid16: blesc_core::transport::ble::SERVICE_UUID16,
                        uuid_type: UuidType::Vendor,
                        start_handle: SERVICE_START,
                        end_handle: SERVICE_END,
                    }],
                    None => Vec::new(),
                };
                let status = if services.is_empty() {
                    GattStatus::AttributeNotFound
                } else {
                    GattStatus::Success
                };
                self.pending
                    .push_back(Event::PrimaryServices { status, services });
            }
            Action::Read {
                conn_handle,
                handle,
            } => {
                let event = match self.peer_for_link(conn_handle) {
                    Some(peer) if handle == SERVICE_START => Event::ReadResponse {
                        handle,
                        data: service_uuid_for(&self.peers[peer].id).to_vec(),
                    },
                    Some(peer) if handle == TIME => Event::ReadResponse {
                        handle,
                        data: self.peer_time_ms(peer).to_le_bytes().to_vec(),
                    },
                    _ => Event::CallFailed {
                        call: StackCall::Read,
                        error: StackError::NotFound,
                    },
                };
                self.pending.push_back(event);
            }
            Action::Write {
                conn_handle,
                handle,
                data,
            } => self.on_write(conn_handle, handle, &data)?,
            Action::EnableNotifications { conn_handle, .. } => {
                self.on_subscribed(conn_handle);
            }
            Action::StartTimer {
                timer,
                after_ms,
                periodic,
            } => {
                let after = u64::from(after_ms);
                self.timers.insert(
                    timer,
                    Timer {
                        due_ms: self.now_ms + after,
                        period_ms: periodic.then_some(after),
                    },
                );
            }
            Action::StopTimer(timer) => {
                self.timers.remove(&timer);
            }
            Action::MeasureBattery => {
                self.pending
                    .push_back(Event::BatteryMeasured { voltage: 2.9 });
            }
            Action::SetIndicators { .. } => {}
            Action::FeedWatchdog => self.report.watchdog_feeds += 1,
            action @ (Action::EnterDfu | Action::Reboot) => {
                info!(?action, "Node left the simulation");
                self.halted = Some(action);
            }
        }
        Ok(())
    }

    /// The node subscribed; the peer opens the exchange its script asks for
    fn on_subscribed(&mut self, conn_handle: u16) {
        let Some(peer) = self.peer_for_link(conn_handle) else {
            return;
        };
        let request = match &self.peers[peer].script.behaviour {
            Behaviour::Silent => return,
            Behaviour::Command { request } if self.peers[peer].command_pending => {
                let request = request.clone();
                self.peers[peer].command_pending = false;
                self.peers[peer].report.commands_sent += 1;
                request
            }
            _ => {
                let mut salt = [0u8; SALT_SIZE];
                self.rng.fill_bytes(&mut salt);
                if let Some(link) = self.link.as_mut() {
                    link.salt = Some(salt);
                }
                let mut frame = vec![0x00, 0x00];
                frame.extend_from_slice(&salt);
                frame
            }
        };
        self.pending.push_back(Event::Notification {
            handle: NOTIFY,
            data: request,
        });
    }

    fn on_write(&mut self, conn_handle: u16, handle: u16, data: &[u8]) -> Result<()> {
        let Some(peer) = self.peer_for_link(conn_handle) else {
            self.pending.push_back(Event::CallFailed {
                call: StackCall::Write,
                error: StackError::InvalidState,
            });
            return Ok(());
        };
        self.pending.push_back(Event::TxComplete);

        match handle {
            HEALTH => self.peers[peer].report.health_records += 1,
            RSSI => self.peers[peer].report.samples_uploaded += (data.len() / 2) as u32,
            SIGN => {
                let Some(link) = self.link.as_mut() else {
                    return Ok(());
                };
                link.sign_rx.extend_from_slice(data.get(1..).unwrap_or_default());

                match link.salt {
                    // Node signature over our salt
                    Some(salt) if link.sign_rx.len() == SIGNATURE_SIZE => {
                        if self.node_key.verify(&salt, &link.sign_rx) {
                            self.peers[peer].report.signatures_verified += 1;
                        }
                        link.sign_rx.clear();
                    }
                    // Node salt for a staged command
                    None if link.sign_rx.len() == SALT_SIZE => {
                        let signature = self
                            .backend
                            .sign(&link.sign_rx)
                            .context("Backend failed to sign node salt")?;
                        link.sign_rx.clear();
                        for (n, chunk) in signature.chunks(CHUNK_SIZE).enumerate() {
                            let mut frame = vec![0x01, n as u8 + 1];
                            frame.extend_from_slice(chunk);
                            self.pending.push_back(Event::Notification {
                                handle: NOTIFY,
                                data: frame,
                            });
                        }
                    }
                    _ => {}
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Short status line for a node state
pub fn describe(state: NodeState) -> &'static str {
    match state {
        NodeState::Init => "waiting for provisioning",
        NodeState::Scanning => "scanning",
        NodeState::Connect => "connected to a peer",
        NodeState::Idle => "idle",
    }
}
