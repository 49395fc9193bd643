// Shared fixtures for the engine scenarios
#![allow(dead_code)]

use blesc_core::store::{MacAddress, PeerId};
use blesc_core::transport::ble::{service_uuid_for, DiscoveredCharacteristic};
use blesc_core::{
    Action, Configuration, Engine, Event, MemoryStore, NodeKeys, PersistentStore, RecordsExt,
    RetainedFault, ScannerSettings,
};

pub const NODE_MAC: MacAddress = [0x01, 0x02, 0x03, 0x04, 0x05, 0xC9];
pub const NODE_ID: u32 = 0x00AA_0203;
pub const PEER_MAC: MacAddress = [0x61, 0x62, 0x63, 0x64, 0x65, 0xD0];
pub const CONN: u16 = 3;

pub const NOTIFY: u16 = 0x21;
pub const CCCD: u16 = 0x22;
pub const SIGN: u16 = 0x24;
pub const RSSI: u16 = 0x26;
pub const HEALTH: u16 = 0x28;
pub const TIME: u16 = 0x2A;

pub struct Node {
    pub keys: NodeKeys,
    pub peer: NodeKeys,
}

impl Node {
    pub fn new() -> Self {
        Self {
            keys: NodeKeys::generate(),
            peer: NodeKeys::generate(),
        }
    }

    pub fn config(&self) -> Configuration {
        Configuration {
            node_id: NODE_ID,
            private_key: self.keys.to_bytes().to_vec(),
            peer_public_key: self.peer.public_key().to_vec(),
        }
    }

    pub fn store(&self) -> MemoryStore {
        let mut store = MemoryStore::new();
        store
            .write_config(&self.config())
            .expect("memory store accepts the configuration");
        store
    }

    pub fn settings() -> ScannerSettings {
        ScannerSettings {
            sample_threshold: 3,
            ..Default::default()
        }
    }

    /// Booted engine over `store`
    pub fn boot(&self, store: impl PersistentStore + 'static) -> (Engine, Vec<Action>) {
        self.boot_with(Self::settings(), store)
    }

    pub fn boot_with(
        &self,
        settings: ScannerSettings,
        store: impl PersistentStore + 'static,
    ) -> (Engine, Vec<Action>) {
        let mut engine = Engine::new(
            settings,
            Box::new(store),
            RetainedFault::default(),
            NODE_MAC,
        )
        .expect("valid settings")
        .with_seed(7);
        let actions = engine.handle_event(Event::Boot);
        (engine, actions)
    }

    pub fn engine(&self) -> Engine {
        self.boot(self.store()).0
    }
}

pub fn service_advert(id: &PeerId) -> Vec<u8> {
    let mut data = vec![0x02, 0x01, 0x06, 17, 0x07];
    data.extend_from_slice(&service_uuid_for(id));
    data
}

pub fn vendor_advert(fingerprint: &[u8; 16]) -> Vec<u8> {
    let mut data = vec![0x02, 0x01, 0x1A, 20, 0xFF, 0x4C, 0x00];
    data.extend_from_slice(fingerprint);
    data.push(0x00);
    data
}

pub fn advert(data: Vec<u8>, rssi: i8) -> Event {
    Event::AdvertReport {
        address: PEER_MAC,
        rssi,
        data,
    }
}

pub fn characteristics() -> Vec<DiscoveredCharacteristic> {
    [
        (0xB501, NOTIFY, Some(CCCD)),
        (0xB502, SIGN, None),
        (0xB503, RSSI, None),
        (0xB504, HEALTH, None),
        (0xB505, TIME, None),
    ]
    .into_iter()
    .map(|(uuid16, value_handle, cccd_handle)| DiscoveredCharacteristic {
        uuid16,
        value_handle,
        cccd_handle,
    })
    .collect()
}

pub fn notify(data: Vec<u8>) -> Event {
    Event::Notification {
        handle: NOTIFY,
        data,
    }
}

pub fn writes(actions: &[Action]) -> Vec<(u16, Vec<u8>)> {
    actions
        .iter()
        .filter_map(|a| match a {
            Action::Write { handle, data, .. } => Some((*handle, data.clone())),
            _ => None,
        })
        .collect()
}

/// Acknowledge writes until the engine stops producing them
pub fn drain(engine: &mut Engine, mut actions: Vec<Action>) -> Vec<Action> {
    let mut all = actions.clone();
    while actions.iter().any(|a| matches!(a, Action::Write { .. })) {
        actions = engine.handle_event(Event::TxComplete);
        all.extend(actions.iter().cloned());
    }
    all
}

/// Sight a peer until the threshold triggers a connection, then resolve its
/// service and subscribe
pub fn connect_peer(engine: &mut Engine, id: &PeerId) {
    for rssi in [-50, -51, -52] {
        engine.handle_event(advert(service_advert(id), rssi));
    }
    engine.handle_event(Event::Connected { conn_handle: CONN });
    engine.handle_event(Event::ServiceDiscovered {
        characteristics: characteristics(),
    });
}

/// The peer signs the node salt and streams the four chunks
pub fn signature_chunks(peer: &NodeKeys, salt: &[u8]) -> Vec<Vec<u8>> {
    let signature = peer.sign(salt).expect("signing succeeds");
    signature
        .chunks(16)
        .enumerate()
        .map(|(n, chunk)| {
            let mut frame = vec![0x01, n as u8 + 1];
            frame.extend_from_slice(chunk);
            frame
        })
        .collect()
}

/// Ask for a command; returns the salt the node streamed back
pub fn request_command(engine: &mut Engine, request: Vec<u8>) -> Vec<u8> {
    let actions = engine.handle_event(notify(request));
    let actions = drain(engine, actions);
    writes(&actions)
        .into_iter()
        .flat_map(|(_, data)| data[1..].to_vec())
        .collect()
}
