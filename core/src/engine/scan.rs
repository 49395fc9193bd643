// Scan / connect / idle cycle and advertisement handling

use tracing::{debug, info, warn};

use super::{Action, Engine, ProbeCandidate, TimerId};
use crate::store::{Consumer, Fingerprint, MacAddress, PeerId, Sample};
use crate::transport::ble::{
    format_mac, parse_advert, AddressType, Advert, AdvertFilter, LinkState, NodeState,
};

impl Engine {
    /// Enter SCANNING and restart the scan-connect window
    pub(super) fn scan_start(&mut self) {
        let now = self.now_ms();
        self.allow.sweep(now);
        self.deny.sweep(now);

        self.state = NodeState::Scanning;
        self.peer_nearby = false;
        self.start_timer(TimerId::ScanConnect, self.settings.scan_connect_interval_ms);
        self.emit(Action::StartScan);
        self.set_indicators(true, false);
        debug!("Scanning started");
    }

    pub(super) fn scan_stop(&mut self) {
        self.emit(Action::StopScan);
        self.stop_timer(TimerId::ScanConnect);
        self.set_indicators(false, false);
        debug!("Scanning stopped");
    }

    /// Eco timer: wake up for a short scan, or go back to sleep after one
    pub(super) fn eco_handler(&mut self) {
        match self.state {
            NodeState::Idle | NodeState::Connect => {
                info!("Eco wake-up, scanning");
                self.start_timer(TimerId::Eco, self.settings.eco_scan_ms());
                self.scan_start();
            }
            NodeState::Scanning => {
                info!("Nothing to do, going idle");
                self.scan_stop();
                self.state = NodeState::Idle;
                self.clock.mark_stale();
            }
            NodeState::Init => {}
        }
    }

    pub(super) fn on_scan_connect_timeout(&mut self) {
        if self.state != NodeState::Scanning {
            debug!(state = ?self.state, "Scan-connect window ignored");
            return;
        }

        if !self.peer_nearby {
            info!("No peers nearby");
            self.peers.clear_all();
            self.eco_handler();
            return;
        }

        if let LinkState::Disconnecting { conn_handle } = self.link {
            warn!(conn_handle, "Disconnect never confirmed, link released");
            self.link = LinkState::Idle;
        }

        self.scan_stop();
        self.state = NodeState::Connect;
        info!("Scan-connect window elapsed, picking a peer");
        match self.peers.first_active() {
            Some(slot) => self.try_peer_connect(slot),
            None => self.scan_start(),
        }
    }

    /// Connect to the peer in `slot`, keeping only the freshest samples
    pub(super) fn try_peer_connect(&mut self, slot: usize) {
        if !self.link.is_idle() {
            debug!(slot, "Link busy, connect ignored");
            return;
        }
        let Some(mac) = self.peers.get(slot).filter(|r| r.active).map(|r| r.mac) else {
            self.scan_start();
            return;
        };

        let threshold = self.settings.sample_threshold;
        if let Err(e) = self.peers.reduce_remaining_to(slot, Consumer::A, threshold) {
            debug!(slot, error = %e, "Keeping all unread samples");
        }
        self.connected_slot = Some(slot);
        self.try_connect(mac);
    }

    /// Ask the host for a connection; only one link at a time
    pub(super) fn try_connect(&mut self, address: MacAddress) {
        if !self.link.is_idle() {
            debug!(link = ?self.link, "Link busy, connect ignored");
            return;
        }

        let addr_type = AddressType::for_connect(&address);
        info!(mac = %format_mac(&address), ?addr_type, "Connecting");
        self.state = NodeState::Connect;
        self.link = LinkState::Connecting;
        self.emit(Action::Connect { address, addr_type });
    }

    // ------------------------------------------------------------------------
    // Advertisements
    // ------------------------------------------------------------------------

    pub(super) fn on_advert(&mut self, address: MacAddress, rssi: i8, data: &[u8]) {
        if self.state != NodeState::Scanning {
            return;
        }
        let Some(node_id) = self.credentials.as_ref().map(|c| c.short_node_id) else {
            return;
        };
        let filter = AdvertFilter {
            rssi_lower_limit: self.params.rssi_lower_limit,
            node_id,
        };

        match parse_advert(data, rssi, &filter) {
            Some(Advert::Service { id, kind }) => {
                debug!(?kind, rssi, mac = %format_mac(&address), "Peer advertisement");
                self.on_sighting(&id, &address, None, Sample::new(rssi, 0));
            }
            Some(Advert::Vendor { fingerprint }) => {
                self.on_vendor_advert(address, fingerprint, rssi)
            }
            None => {}
        }
    }

    fn on_vendor_advert(&mut self, address: MacAddress, fingerprint: Fingerprint, rssi: i8) {
        let now = self.now_ms();
        if let Some(id) = self.allow.lookup(&fingerprint, now) {
            debug!(rssi, "Allow-listed background peer");
            self.on_sighting(&id, &address, Some(&fingerprint), Sample::new(rssi, 0));
            return;
        }
        if self.deny.contains(&fingerprint, now) || !self.link.is_idle() {
            return;
        }

        info!(
            fingerprint = %hex::encode(fingerprint),
            rssi,
            "Unknown background peer, probing"
        );
        self.stop_timer(TimerId::Eco);
        self.probe_candidate = Some(ProbeCandidate {
            address,
            fingerprint,
            sample: Sample::new(rssi, 0),
        });
        self.scan_stop();
        self.try_connect(address);
    }

    /// Record a valid peer sighting; connects once the threshold is reached
    pub(super) fn on_sighting(
        &mut self,
        id: &PeerId,
        mac: &MacAddress,
        fingerprint: Option<&Fingerprint>,
        sample: Sample,
    ) {
        self.stop_timer(TimerId::Eco);
        self.peer_nearby = true;

        let Ok(slot) = self.peers.save_peer(id, mac, fingerprint) else {
            return;
        };
        match self.peers.save_sample(slot, sample) {
            Ok(true) if !self.link.is_idle() => {
                debug!(slot, link = ?self.link, "Threshold reached, link still busy");
            }
            Ok(true) => {
                info!(slot, "Sample threshold reached");
                self.scan_stop();
                self.try_peer_connect(slot);
            }
            Ok(false) => {}
            Err(e) => warn!(slot, error = %e, "Sample not stored"),
        }
    }
}
