// One peer link: discovery, handshake, command execution and upload

use tracing::{debug, error, info, warn};

use super::{Action, Engine, StackCall, TimerId};
use crate::protocol::{ChunkVerdict, Command, ProtocolError, Request, SessionMode};
use crate::store::{Consumer, Fingerprint, PeerRecord, RecordKey, RecordsExt};
use crate::transport::ble::{
    battery_level, decode_time, format_mac, peer_id_from_uuid, service_uuid_for, Characteristic,
    DiscoveredCharacteristic, DiscoveryError, GattStatus, HealthFault, HealthGeneral, LinkState,
    MacInfo, ManualProbe, NodeState, PeerKind, PrimaryService, ProbeCall, ProbeOutcome,
    ProbeProgress, ProbeRequest, SendStep, ServiceHandles, StackError,
};

/// Peers found through a service advertisement carry no fingerprint
const NO_FINGERPRINT: Fingerprint = [0; 16];

impl Engine {
    fn live_link(&self) -> Option<u16> {
        match self.link {
            LinkState::Connected { conn_handle } => Some(conn_handle),
            _ => None,
        }
    }

    fn connected_record(&self) -> Option<&PeerRecord> {
        self.connected_slot
            .and_then(|slot| self.peers.get(slot))
            .filter(|r| r.active)
    }

    fn restart_inactivity(&mut self) {
        self.start_timer(TimerId::Inactivity, self.settings.inactivity_timeout_ms);
    }

    /// Tear the link down; a second request while one is pending is a no-op
    pub(super) fn disconnect(&mut self) {
        match self.link {
            LinkState::Connected { conn_handle } => {
                debug!(conn_handle, "Disconnecting");
                self.link = LinkState::Disconnecting { conn_handle };
                self.stop_timer(TimerId::Inactivity);
                self.emit(Action::Disconnect { conn_handle });
            }
            LinkState::Disconnecting { .. } => debug!("Disconnect already pending"),
            LinkState::Connecting | LinkState::Idle => debug!("No link to disconnect"),
        }
    }

    /// Give up on the peer: the FSM is back on the scan baseline while the
    /// disconnect is still in flight
    fn abort_session(&mut self) {
        warn!(mode = ?self.handshake.mode(), "Session aborted");
        self.disconnect();
        self.reset_session();
        self.scan_start();
    }

    fn deny_fingerprint(&mut self, fingerprint: &Fingerprint) {
        if fingerprint == &NO_FINGERPRINT {
            return;
        }
        let now = self.now_ms();
        if self.deny.contains(fingerprint, now) {
            return;
        }
        if let Err(e) = self.deny.insert(fingerprint, &mut self.allow, now) {
            warn!(error = %e, "Fingerprint not deny-listed");
        }
    }

    // ------------------------------------------------------------------------
    // Link events
    // ------------------------------------------------------------------------

    pub(super) fn on_connected(&mut self, conn_handle: u16) {
        match self.link {
            LinkState::Connecting => {}
            LinkState::Idle => {
                warn!(conn_handle, "Unexpected connection");
                self.link = LinkState::Connected { conn_handle };
                self.disconnect();
                return;
            }
            LinkState::Connected { .. } | LinkState::Disconnecting { .. } => {
                // Keep the current link; drop the stray one
                warn!(conn_handle, link = ?self.link, "Second connection refused");
                self.emit(Action::Disconnect { conn_handle });
                return;
            }
        }
        self.link = LinkState::Connected { conn_handle };
        self.handles = None;
        self.sender.reset();

        if let Some(candidate) = self.probe_candidate {
            info!(conn_handle, mac = %format_mac(&candidate.address), "Probing peer services");
            let (probe, request) = ManualProbe::start();
            self.probe = Some(probe);
            self.issue_probe_request(conn_handle, request);
            self.restart_inactivity();
            return;
        }

        let Some(id) = self.connected_record().map(|r| r.id) else {
            warn!(conn_handle, "Connected without a peer record");
            if let Some(slot) = self.connected_slot {
                self.peers.clear(slot);
            }
            self.disconnect();
            return;
        };

        info!(conn_handle, "Connected, discovering peer service");
        self.emit(Action::DiscoverService {
            conn_handle,
            service_uuid: service_uuid_for(&id),
        });
        self.restart_inactivity();
        self.set_indicators(false, true);
    }

    pub(super) fn on_connect_failed(&mut self) {
        info!("Connection attempt failed");
        self.on_link_lost();
    }

    pub(super) fn on_disconnected(&mut self, conn_handle: u16, reason: u8) {
        if self.link.conn_handle() != Some(conn_handle) {
            debug!(conn_handle, "Disconnect for unknown link");
            return;
        }
        info!(conn_handle, reason = format_args!("0x{:02X}", reason), "Disconnected");
        self.on_link_lost();
    }

    /// Drop all per-link state and go back to scanning
    fn on_link_lost(&mut self) {
        self.link = LinkState::Idle;
        self.reset_session();
        self.scan_start();
    }

    fn reset_session(&mut self) {
        if let Some(slot) = self.connected_slot.take() {
            self.peers.clear(slot);
        }
        self.handshake.reset();
        self.sender.reset();
        self.handles = None;
        self.probe = None;
        self.probe_candidate = None;
        self.stop_timer(TimerId::Inactivity);
    }

    pub(super) fn on_inactivity_timeout(&mut self) {
        if self.state == NodeState::Connect && self.live_link().is_some() {
            warn!("Peer inactive, disconnecting");
            self.disconnect();
        }
    }

    pub(super) fn on_call_failed(&mut self, call: StackCall, error: StackError) {
        warn!(?call, %error, "Stack call failed");
        match call {
            StackCall::StartScan => {}
            StackCall::Connect | StackCall::Disconnect => self.on_link_lost(),
            StackCall::DiscoverPrimaryServices | StackCall::Read if self.probe.is_some() => {
                let probe_call = match call {
                    StackCall::Read => ProbeCall::Read,
                    _ => ProbeCall::DiscoverPrimaryServices,
                };
                if let Some(probe) = self.probe.as_mut() {
                    let progress = probe.on_call_failed(probe_call, error);
                    self.drive_probe(progress);
                }
            }
            StackCall::DiscoverPrimaryServices
            | StackCall::Read
            | StackCall::DiscoverService
            | StackCall::Write
            | StackCall::EnableNotifications => self.abort_session(),
        }
    }

    // ------------------------------------------------------------------------
    // Manual probe
    // ------------------------------------------------------------------------

    fn issue_probe_request(&mut self, conn_handle: u16, request: ProbeRequest) {
        let action = match request {
            ProbeRequest::DiscoverPrimaryServices { start_handle } => {
                Action::DiscoverPrimaryServices {
                    conn_handle,
                    start_handle,
                }
            }
            ProbeRequest::Read { handle } => Action::Read {
                conn_handle,
                handle,
            },
        };
        self.emit(action);
    }

    fn drive_probe(&mut self, progress: ProbeProgress) {
        match progress {
            ProbeProgress::Continue(requests) => {
                let Some(conn_handle) = self.live_link() else {
                    return;
                };
                if !requests.is_empty() {
                    self.restart_inactivity();
                }
                for request in requests {
                    self.issue_probe_request(conn_handle, request);
                }
            }
            ProbeProgress::Finished(outcome) => self.on_probe_finished(outcome),
        }
    }

    pub(super) fn on_primary_services(&mut self, status: GattStatus, services: &[PrimaryService]) {
        if let Some(probe) = self.probe.as_mut() {
            let progress = probe.on_primary_services(status, services);
            self.drive_probe(progress);
        }
    }

    fn on_probe_finished(&mut self, outcome: ProbeOutcome) {
        self.probe = None;
        let candidate = self.probe_candidate.take();
        self.disconnect();
        let Some(candidate) = candidate else {
            return;
        };
        let fingerprint = candidate.fingerprint;

        match outcome {
            ProbeOutcome::Found { uuid } => {
                let id = peer_id_from_uuid(&uuid);
                let now = self.now_ms();
                info!(fingerprint = %hex::encode(fingerprint), "Background peer resolved");
                self.peer_nearby = true;
                if self.allow.lookup(&fingerprint, now).is_none() {
                    if let Err(e) = self.allow.insert(&fingerprint, &id, now) {
                        warn!(error = %e, "Fingerprint not allow-listed");
                    }
                }
                let Ok(slot) = self.peers.save_peer(&id, &candidate.address, Some(&fingerprint))
                else {
                    return;
                };
                if let Ok(true) = self.peers.save_sample(slot, candidate.sample) {
                    self.try_peer_connect(slot);
                }
            }
            ProbeOutcome::NotFound | ProbeOutcome::Error(_) => {
                info!(
                    fingerprint = %hex::encode(fingerprint),
                    ?outcome,
                    "Background peer does not run the service"
                );
                self.deny_fingerprint(&fingerprint);
                self.eco_handler();
            }
        }
    }

    // ------------------------------------------------------------------------
    // Structured discovery
    // ------------------------------------------------------------------------

    pub(super) fn on_service_discovered(&mut self, characteristics: &[DiscoveredCharacteristic]) {
        let Some(conn_handle) = self.live_link() else {
            return;
        };
        if self.probe.is_some() {
            return;
        }
        self.stop_timer(TimerId::Inactivity);

        let handles = ServiceHandles::from_characteristics(characteristics);
        self.handles = Some(handles);
        self.handshake.begin();

        let Some(kind) = self.connected_record().map(|r| PeerKind::from_byte(r.kind_byte())) else {
            self.disconnect();
            return;
        };
        debug!(?kind, ?handles, "Peer service discovered");
        if kind != PeerKind::Ios {
            self.on_session_start();
            return;
        }

        let Some(node_id) = self.credentials.as_ref().map(|c| c.short_node_id) else {
            return;
        };
        match handles.require(Characteristic::MacInfo) {
            Ok(handle) => {
                let info = MacInfo {
                    mac: self.node_mac,
                    node_id,
                };
                self.emit(Action::Write {
                    conn_handle,
                    handle,
                    data: info.to_bytes().to_vec(),
                });
                self.restart_inactivity();
            }
            Err(e) => {
                warn!(error = %e, "iOS peer without mac-info");
                self.reject_peer_service();
            }
        }
    }

    pub(super) fn on_service_not_found(&mut self) {
        if self.live_link().is_none() {
            return;
        }
        warn!(error = %DiscoveryError::ServiceNotFound, "Structured discovery failed");
        self.reject_peer_service();
    }

    fn reject_peer_service(&mut self) {
        if let Some(slot) = self.connected_slot.take() {
            if let Some(fingerprint) = self.peers.get(slot).map(|r| r.fingerprint) {
                self.deny_fingerprint(&fingerprint);
            }
            self.peers.clear(slot);
        }
        self.probe_candidate = None;
        self.disconnect();
    }

    /// Enable notifications; the peer speaks first
    fn on_session_start(&mut self) {
        let Some(conn_handle) = self.live_link() else {
            return;
        };
        match self.handles.and_then(|h| h.notify_cccd) {
            Some(cccd_handle) => {
                self.emit(Action::EnableNotifications {
                    conn_handle,
                    cccd_handle,
                });
                self.sender.reset();
                self.restart_inactivity();
            }
            None => {
                warn!(error = %DiscoveryError::MissingCccd, "Cannot subscribe to peer");
                self.abort_session();
            }
        }
    }

    // ------------------------------------------------------------------------
    // Handshake
    // ------------------------------------------------------------------------

    pub(super) fn on_notification(&mut self, handle: u16, data: &[u8]) {
        if self.live_link().is_none() || self.probe.is_some() {
            return;
        }
        if self.handles.and_then(|h| h.notify) != Some(handle) {
            debug!(handle, "Notification on unexpected handle");
            return;
        }
        self.stop_timer(TimerId::Inactivity);

        let request = match Request::parse(data) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Malformed peer request");
                self.abort_session();
                return;
            }
        };
        debug!(?request, "Peer request");

        match request {
            Request::Salt(salt) => {
                let Some(credentials) = self.credentials.as_ref() else {
                    self.abort_session();
                    return;
                };
                match self.handshake.on_peer_salt(&salt, &credentials.keys) {
                    Ok(signature) => {
                        let step = self.sender.send_signature(&signature);
                        self.run_send_step(step);
                    }
                    Err(e) => {
                        error!(error = %e, "Signing failed");
                        self.abort_session();
                    }
                }
            }
            Request::Trust => {
                self.handshake.on_trust();
                self.run_send_step(SendStep::DoneSignature);
            }
            Request::SignChunk { index, data } => {
                let Some(credentials) = self.credentials.as_ref() else {
                    self.abort_session();
                    return;
                };
                match self
                    .handshake
                    .on_sign_chunk(index, &data, &credentials.peer_key)
                {
                    Ok(ChunkVerdict::Incomplete) => self.restart_inactivity(),
                    Ok(ChunkVerdict::Verified(command)) => self.execute_command(command),
                    Err(ProtocolError::BadSignature) => {
                        if let Some(fingerprint) = self.connected_record().map(|r| r.fingerprint) {
                            self.deny_fingerprint(&fingerprint);
                        }
                        self.abort_session();
                    }
                    Err(e) => {
                        warn!(error = %e, "Signature chunk rejected");
                        self.abort_session();
                    }
                }
            }
            Request::Command(command) => {
                let salt = self.handshake.stage_command(command, &mut self.rng);
                let step = self.sender.send_signature(&salt);
                self.run_send_step(step);
                self.restart_inactivity();
            }
        }
    }

    fn execute_command(&mut self, command: Command) {
        info!(?command, "Executing verified command");
        match command {
            Command::Dfu => self.emit(Action::EnterDfu),
            Command::Reboot => self.emit(Action::Reboot),
            Command::Deprovision => match self.store.delete(RecordKey::Configuration) {
                Ok(()) => self.emit(Action::Reboot),
                Err(e) => self.fatal(e),
            },
            Command::Idle { minutes } => {
                self.eco_handler();
                self.clock.set_idle_minutes(minutes);
                self.disconnect();
            }
            Command::RssiLimit { limit } => {
                self.params.rssi_lower_limit = limit;
                match self.store.write_params(&self.params) {
                    Ok(()) => {
                        info!(rssi_lower_limit = limit, "RSSI limit stored");
                        self.restart_inactivity();
                    }
                    Err(e) => self.fatal(e),
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Upload
    // ------------------------------------------------------------------------

    pub(super) fn on_tx_complete(&mut self) {
        if self.live_link().is_none() {
            return;
        }
        if self.handshake.mode() == SessionMode::None {
            self.on_session_start();
            return;
        }
        let step = self.sender.continue_sending();
        self.run_send_step(step);
    }

    fn run_send_step(&mut self, step: SendStep) {
        let rssi_mode = self.handshake.mode() == SessionMode::Rssi;
        match step {
            SendStep::Write {
                characteristic,
                data,
            } => {
                let target = self
                    .live_link()
                    .zip(self.handles.and_then(|h| h.handle(characteristic)));
                let Some((conn_handle, handle)) = target else {
                    warn!(?characteristic, "No handle to write to");
                    self.abort_session();
                    return;
                };
                self.emit(Action::Write {
                    conn_handle,
                    handle,
                    data,
                });
                self.restart_inactivity();
            }
            SendStep::DoneSignature if rssi_mode => self.emit(Action::MeasureBattery),
            SendStep::DoneHealth if rssi_mode => {
                let samples = match self.connected_slot {
                    Some(slot) => self.peers.take_unread(slot, Consumer::A),
                    None => Vec::new(),
                };
                debug!(count = samples.len(), "Queueing samples");
                self.sender.queue_samples(&samples);
                let next = self.sender.continue_sending();
                self.run_send_step(next);
            }
            SendStep::DoneRssi => self.on_upload_done(),
            SendStep::DoneSignature | SendStep::DoneHealth | SendStep::Idle => {}
        }
    }

    pub(super) fn on_battery_measured(&mut self, voltage: f32) {
        if self.handshake.mode() != SessionMode::Rssi || self.live_link().is_none() {
            debug!(voltage, "Battery measurement not needed");
            return;
        }

        let mut general = HealthGeneral::new(
            battery_level(voltage),
            self.clock.uptime(),
            self.clock.system_time(),
            self.clock.sleep_sum(),
        );
        general.err_id = self.fault.random_id;
        general.err_type = self.fault.kind.code();
        let fault = self.fault.kind.has_details().then(|| {
            HealthFault {
                err_code: self.fault.err_code,
                line_num: self.fault.line_num,
                file_name: self.fault.file_name,
            }
            .to_bytes()
        });

        let general = general.to_bytes();
        if let Some(step) = self
            .sender
            .queue_health(&general, fault.as_ref().map(|f| f.as_slice()))
        {
            self.run_send_step(step);
        }
    }

    /// Telemetry delivered: forget the samples, then fetch the time if needed
    fn on_upload_done(&mut self) {
        if let Some(slot) = self.connected_slot.take() {
            if let Some(fingerprint) = self.peers.get(slot).map(|r| r.fingerprint) {
                if fingerprint != NO_FINGERPRINT {
                    let now = self.now_ms();
                    self.allow.lookup(&fingerprint, now);
                }
            }
            self.peers.clear(slot);
        }
        info!("Upload complete");

        let time_handle = self.handles.and_then(|h| h.time);
        match (self.clock.is_stale(), time_handle, self.live_link()) {
            (true, Some(handle), Some(conn_handle)) => {
                debug!(handle, "Requesting time");
                self.emit(Action::Read {
                    conn_handle,
                    handle,
                });
                self.restart_inactivity();
            }
            _ => self.disconnect(),
        }
    }

    pub(super) fn on_read_response(&mut self, handle: u16, data: &[u8]) {
        if let Some(probe) = self.probe.as_mut() {
            let progress = probe.on_read_response(data);
            self.drive_probe(progress);
            return;
        }
        if self.live_link().is_none() || self.handles.and_then(|h| h.time) != Some(handle) {
            debug!(handle, "Unexpected read response");
            return;
        }

        if self.clock.is_stale() {
            match decode_time(data) {
                Some(time_ms) => self.clock.update_from_ms(time_ms),
                None => warn!(len = data.len(), "Malformed time value"),
            }
        }
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{Fixture, NODE_MAC, NODE_ID};
    use super::super::{Engine, Event};
    use super::*;
    use crate::crypto::{NodeKeys, PeerKey};
    use crate::platform::{FaultKind, RetainedFault, CHUNK_SIZE};
    use crate::protocol::command::{
        CMD_IDLE, CMD_REBOOT, CMD_RSSI_LIMIT, CMD_SALT, CMD_SIGN, CMD_TRUST,
    };
    use crate::store::{MacAddress, PeerId, Sample};
    use crate::transport::ble::advert::tests::vendor_advert;
    use crate::transport::ble::{UuidType, HANDLE_START, SERVICE_UUID16};

    const CONN: u16 = 7;
    const PEER_MAC: MacAddress = [0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0xC0];
    const ANDROID_ID: PeerId = [0x00, 1, 2, 3, 4, 5, 6, 7, 8, 9];
    const IOS_ID: PeerId = [0xFF, 1, 2, 3, 4, 5, 6, 7, 8, 9];

    const NOTIFY: u16 = 0x10;
    const CCCD: u16 = 0x11;
    const SIGN: u16 = 0x13;
    const RSSI: u16 = 0x15;
    const HEALTH: u16 = 0x17;
    const TIME: u16 = 0x19;
    const MAC_INFO: u16 = 0x1B;

    fn characteristics() -> Vec<DiscoveredCharacteristic> {
        let plain = |uuid16, value_handle| DiscoveredCharacteristic {
            uuid16,
            value_handle,
            cccd_handle: None,
        };
        vec![
            DiscoveredCharacteristic {
                uuid16: 0xB501,
                value_handle: NOTIFY,
                cccd_handle: Some(CCCD),
            },
            plain(0xB502, SIGN),
            plain(0xB503, RSSI),
            plain(0xB504, HEALTH),
            plain(0xB505, TIME),
            plain(0xB506, MAC_INFO),
        ]
    }

    fn notify(data: Vec<u8>) -> Event {
        Event::Notification {
            handle: NOTIFY,
            data,
        }
    }

    fn frame(cmd: u8, index: u8, data: &[u8]) -> Vec<u8> {
        let mut out = vec![cmd, index];
        out.extend_from_slice(data);
        out
    }

    /// Engine connected to a peer with `samples` stored and the service resolved
    fn session(fixture: &Fixture, id: &PeerId, samples: usize) -> Engine {
        let mut engine = fixture.engine();
        let slot = engine.peers.save_peer(id, &PEER_MAC, None).unwrap();
        for n in 0..samples {
            engine.peers.save_sample(slot, Sample::new(-40 - n as i8, 0)).unwrap();
        }
        engine.try_peer_connect(slot);
        engine.handle_event(Event::Connected { conn_handle: CONN });
        engine.handle_event(Event::ServiceDiscovered {
            characteristics: characteristics(),
        });
        engine
    }

    fn writes(actions: &[Action]) -> Vec<(u16, Vec<u8>)> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Write { handle, data, .. } => Some((*handle, data.clone())),
                _ => None,
            })
            .collect()
    }

    /// Feed tx-complete until the engine stops writing
    fn drain(engine: &mut Engine, mut actions: Vec<Action>) -> Vec<Action> {
        let mut all = actions.clone();
        while actions.iter().any(|a| matches!(a, Action::Write { .. })) {
            actions = engine.handle_event(Event::TxComplete);
            all.extend(actions.iter().cloned());
        }
        all
    }

    #[test]
    fn test_connect_discovers_peer_service() {
        let fixture = Fixture::new();
        let mut engine = fixture.engine();
        let slot = engine.peers.save_peer(&ANDROID_ID, &PEER_MAC, None).unwrap();
        engine.try_peer_connect(slot);

        let actions = engine.handle_event(Event::Connected { conn_handle: CONN });
        assert_eq!(
            actions[0],
            Action::DiscoverService {
                conn_handle: CONN,
                service_uuid: service_uuid_for(&ANDROID_ID),
            }
        );
        assert!(actions.contains(&Action::SetIndicators {
            scanning: false,
            connected: true,
        }));
    }

    #[test]
    fn test_discovery_enables_notifications() {
        let fixture = Fixture::new();
        let mut engine = fixture.engine();
        let slot = engine.peers.save_peer(&ANDROID_ID, &PEER_MAC, None).unwrap();
        engine.try_peer_connect(slot);
        engine.handle_event(Event::Connected { conn_handle: CONN });

        let actions = engine.handle_event(Event::ServiceDiscovered {
            characteristics: characteristics(),
        });
        assert_eq!(actions[0], Action::StopTimer(TimerId::Inactivity));
        assert!(actions.contains(&Action::EnableNotifications {
            conn_handle: CONN,
            cccd_handle: CCCD,
        }));
    }

    #[test]
    fn test_missing_cccd_aborts() {
        let fixture = Fixture::new();
        let mut engine = fixture.engine();
        let slot = engine.peers.save_peer(&ANDROID_ID, &PEER_MAC, None).unwrap();
        engine.try_peer_connect(slot);
        engine.handle_event(Event::Connected { conn_handle: CONN });

        let mut chars = characteristics();
        chars[0].cccd_handle = None;
        let actions = engine.handle_event(Event::ServiceDiscovered {
            characteristics: chars,
        });
        assert!(actions.contains(&Action::Disconnect { conn_handle: CONN }));
        assert_eq!(engine.link(), LinkState::Disconnecting { conn_handle: CONN });
    }

    #[test]
    fn test_ios_peer_gets_mac_info_first() {
        let fixture = Fixture::new();
        let mut engine = fixture.engine();
        let slot = engine.peers.save_peer(&IOS_ID, &PEER_MAC, None).unwrap();
        engine.try_peer_connect(slot);
        engine.handle_event(Event::Connected { conn_handle: CONN });

        let actions = engine.handle_event(Event::ServiceDiscovered {
            characteristics: characteristics(),
        });
        let expected = MacInfo {
            mac: NODE_MAC,
            node_id: NODE_ID as u16,
        };
        assert_eq!(writes(&actions), vec![(MAC_INFO, expected.to_bytes().to_vec())]);
        assert!(!actions
            .iter()
            .any(|a| matches!(a, Action::EnableNotifications { .. })));

        let actions = engine.handle_event(Event::TxComplete);
        assert!(actions.contains(&Action::EnableNotifications {
            conn_handle: CONN,
            cccd_handle: CCCD,
        }));
    }

    #[test]
    fn test_ios_peer_without_mac_info_rejected() {
        let fixture = Fixture::new();
        let mut engine = fixture.engine();
        let slot = engine.peers.save_peer(&IOS_ID, &PEER_MAC, None).unwrap();
        engine.try_peer_connect(slot);
        engine.handle_event(Event::Connected { conn_handle: CONN });

        let chars: Vec<_> = characteristics()
            .into_iter()
            .filter(|c| c.uuid16 != 0xB506)
            .collect();
        let actions = engine.handle_event(Event::ServiceDiscovered {
            characteristics: chars,
        });
        assert!(actions.contains(&Action::Disconnect { conn_handle: CONN }));
        assert_eq!(engine.peers().active_count(), 0);
    }

    #[test]
    fn test_service_not_found_denies_fingerprint() {
        let fixture = Fixture::new();
        let mut engine = fixture.engine();
        let fingerprint = [0x33; 16];
        let slot = engine
            .peers
            .save_peer(&ANDROID_ID, &PEER_MAC, Some(&fingerprint))
            .unwrap();
        engine.try_peer_connect(slot);
        engine.handle_event(Event::Connected { conn_handle: CONN });

        let actions = engine.handle_event(Event::ServiceNotFound);
        assert!(actions.contains(&Action::Disconnect { conn_handle: CONN }));
        assert!(engine.deny.contains(&fingerprint, 0));
        assert_eq!(engine.peers().active_count(), 0);
    }

    #[test]
    fn test_telemetry_session() {
        let fixture = Fixture::new();
        let mut engine = session(&fixture, &ANDROID_ID, 3);

        let salt = [0x42; CHUNK_SIZE];
        let actions = engine.handle_event(notify(frame(CMD_SALT, 0, &salt)));
        let mut signature = Vec::new();
        let actions = drain(&mut engine, actions);
        for (handle, data) in writes(&actions) {
            assert_eq!(handle, SIGN);
            assert_eq!(data.len(), CHUNK_SIZE + 1);
            signature.extend_from_slice(&data[1..]);
        }
        assert_eq!(signature.len(), 64);
        let node_key = PeerKey::from_raw(&fixture.node.public_key()).unwrap();
        assert!(node_key.verify(&salt, &signature));
        assert_eq!(actions.last(), Some(&Action::MeasureBattery));

        let actions = engine.handle_event(Event::BatteryMeasured { voltage: 3.0 });
        let actions = drain(&mut engine, actions);
        let sent = writes(&actions);
        assert_eq!(sent[0].0, HEALTH);
        assert_eq!(sent[0].1.len(), 19);
        assert_eq!(sent[0].1[1], 30);
        assert_eq!(sent[1].0, RSSI);
        // Only the freshest threshold's worth survives the connect
        assert_eq!(sent[1].1, vec![(-41i8) as u8, 0, (-42i8) as u8, 0]);

        // Clock is stale after boot, so the time is requested
        assert_eq!(
            actions.last(),
            Some(&Action::StartTimer {
                timer: TimerId::Inactivity,
                after_ms: 3_000,
                periodic: false,
            })
        );
        assert!(actions.contains(&Action::Read {
            conn_handle: CONN,
            handle: TIME,
        }));
        assert_eq!(engine.peers().active_count(), 0);

        let actions = engine.handle_event(Event::ReadResponse {
            handle: TIME,
            data: 45_296_000u32.to_le_bytes().to_vec(),
        });
        assert_eq!(engine.clock().system_time(), 45_296);
        assert!(!engine.clock().is_stale());
        assert!(actions.contains(&Action::Disconnect { conn_handle: CONN }));

        let actions = engine.handle_event(Event::Disconnected {
            conn_handle: CONN,
            reason: 0x13,
        });
        assert_eq!(engine.state(), NodeState::Scanning);
        assert_eq!(engine.session_mode(), SessionMode::None);
        assert!(actions.contains(&Action::StartScan));
    }

    #[test]
    fn test_trust_skips_signature() {
        let fixture = Fixture::new();
        let mut engine = session(&fixture, &ANDROID_ID, 1);
        let actions = engine.handle_event(notify(vec![CMD_TRUST]));
        assert_eq!(engine.session_mode(), SessionMode::Rssi);
        assert_eq!(actions.last(), Some(&Action::MeasureBattery));
    }

    #[test]
    fn test_fault_details_sent_for_sdk_errors() {
        let fixture = Fixture::new();
        let mut engine = session(&fixture, &ANDROID_ID, 0);
        engine.fault = RetainedFault::record(FaultKind::SdkError, 0x1234, 8, "src/main.c", 321);

        engine.handle_event(notify(vec![CMD_TRUST]));
        let actions = engine.handle_event(Event::BatteryMeasured { voltage: 2.9 });
        let actions = drain(&mut engine, actions);
        let sent = writes(&actions);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].1[12..15], [0x34, 0x12, FaultKind::SdkError.code()]);
        assert_eq!(sent[1].0, HEALTH);
        assert_eq!(sent[1].1[0], 0x02);
        assert_eq!(&sent[1].1[7..13], b"main.c");
    }

    #[test]
    fn test_fresh_clock_skips_time_read() {
        let fixture = Fixture::new();
        let mut engine = session(&fixture, &ANDROID_ID, 1);
        engine.clock.update_from_ms(1_000);

        engine.handle_event(notify(vec![CMD_TRUST]));
        let actions = engine.handle_event(Event::BatteryMeasured { voltage: 3.0 });
        let actions = drain(&mut engine, actions);
        assert!(!actions.iter().any(|a| matches!(a, Action::Read { .. })));
        assert!(actions.contains(&Action::Disconnect { conn_handle: CONN }));
    }

    /// Peer-side signing of the node salt
    fn sign_chunks(peer: &NodeKeys, salt: &[u8]) -> Vec<Vec<u8>> {
        let signature = peer.sign(salt).unwrap();
        signature
            .chunks(CHUNK_SIZE)
            .enumerate()
            .map(|(n, chunk)| frame(CMD_SIGN, n as u8 + 1, chunk))
            .collect()
    }

    /// Request a command and return the salt streamed back
    fn request_command(engine: &mut Engine, request: Vec<u8>) -> Vec<u8> {
        let actions = engine.handle_event(notify(request));
        let actions = drain(engine, actions);
        let mut salt = Vec::new();
        for (handle, data) in writes(&actions) {
            assert_eq!(handle, SIGN);
            salt.extend_from_slice(&data[1..]);
        }
        assert_eq!(engine.session_mode(), SessionMode::Cmd);
        salt
    }

    #[test]
    fn test_verified_reboot() {
        let fixture = Fixture::new();
        let mut engine = session(&fixture, &ANDROID_ID, 1);
        let salt = request_command(&mut engine, vec![CMD_REBOOT, 0]);
        assert_eq!(salt.len(), CHUNK_SIZE);

        let chunks = sign_chunks(&fixture.peer, &salt);
        for chunk in &chunks[..3] {
            let actions = engine.handle_event(notify(chunk.clone()));
            assert!(!actions.contains(&Action::Reboot));
        }
        let actions = engine.handle_event(notify(chunks[3].clone()));
        assert!(actions.contains(&Action::Reboot));
    }

    #[test]
    fn test_bad_signature_denies_and_aborts() {
        let fixture = Fixture::new();
        let fingerprint = [0x77; 16];
        let mut engine = fixture.engine();
        let slot = engine
            .peers
            .save_peer(&ANDROID_ID, &PEER_MAC, Some(&fingerprint))
            .unwrap();
        engine.try_peer_connect(slot);
        engine.handle_event(Event::Connected { conn_handle: CONN });
        engine.handle_event(Event::ServiceDiscovered {
            characteristics: characteristics(),
        });

        let salt = request_command(&mut engine, vec![CMD_REBOOT, 0]);
        let impostor = NodeKeys::generate();
        let mut last = Vec::new();
        for chunk in sign_chunks(&impostor, &salt) {
            last = engine.handle_event(notify(chunk));
        }
        assert!(!last.contains(&Action::Reboot));
        assert!(last.contains(&Action::Disconnect { conn_handle: CONN }));
        assert!(engine.deny.contains(&fingerprint, 0));
        assert_eq!(engine.session_mode(), SessionMode::None);
    }

    #[test]
    fn test_chunk_index_out_of_range_aborts() {
        let fixture = Fixture::new();
        let mut engine = session(&fixture, &ANDROID_ID, 1);
        request_command(&mut engine, vec![CMD_REBOOT, 0]);

        let actions = engine.handle_event(notify(frame(CMD_SIGN, 5, &[0; CHUNK_SIZE])));
        assert!(actions.contains(&Action::Disconnect { conn_handle: CONN }));
        assert_eq!(engine.session_mode(), SessionMode::None);
    }

    #[test]
    fn test_idle_command() {
        let fixture = Fixture::new();
        let mut engine = session(&fixture, &ANDROID_ID, 1);
        let salt = request_command(&mut engine, vec![CMD_IDLE, 0, 0x00, 0x1E]);

        let mut actions = Vec::new();
        for chunk in sign_chunks(&fixture.peer, &salt) {
            actions = engine.handle_event(notify(chunk));
        }
        assert_eq!(engine.clock().wakeup(), engine.clock().uptime() + 30);
        assert!(actions.contains(&Action::Disconnect { conn_handle: CONN }));
        assert_eq!(engine.state(), NodeState::Scanning);
    }

    #[test]
    fn test_rssi_limit_command_persists() {
        let fixture = Fixture::new();
        let mut engine = session(&fixture, &ANDROID_ID, 1);
        let salt = request_command(&mut engine, vec![CMD_RSSI_LIMIT, 0, (-75i8) as u8]);
        for chunk in sign_chunks(&fixture.peer, &salt) {
            engine.handle_event(notify(chunk));
        }
        assert_eq!(engine.params().rssi_lower_limit, -75);
        assert_eq!(
            engine.store().load_params().unwrap().map(|p| p.rssi_lower_limit),
            Some(-75)
        );
    }

    #[test]
    fn test_unknown_request_aborts() {
        let fixture = Fixture::new();
        let mut engine = session(&fixture, &ANDROID_ID, 1);
        let actions = engine.handle_event(notify(vec![0x42]));
        assert!(actions.contains(&Action::Disconnect { conn_handle: CONN }));
        assert!(actions.contains(&Action::StartScan));
        assert_eq!(engine.state(), NodeState::Scanning);
        assert!(engine.connected_slot.is_none());
        assert!(engine.handles.is_none());
        assert_eq!(engine.peers().active_count(), 0);

        // Second abort while the disconnect is pending does nothing
        let actions = engine.handle_event(notify(vec![0x42]));
        assert!(actions.is_empty());
    }

    #[test]
    fn test_inactivity_timeout() {
        let fixture = Fixture::new();
        let mut engine = session(&fixture, &ANDROID_ID, 1);
        let actions = engine.handle_event(Event::TimerExpired(TimerId::Inactivity));
        assert_eq!(
            actions,
            vec![
                Action::StopTimer(TimerId::Inactivity),
                Action::Disconnect { conn_handle: CONN },
            ]
        );

        let mut idle = fixture.engine();
        let actions = idle.handle_event(Event::TimerExpired(TimerId::Inactivity));
        assert!(actions.is_empty());
    }

    #[test]
    fn test_stale_disconnect_ignored() {
        let fixture = Fixture::new();
        let mut engine = session(&fixture, &ANDROID_ID, 1);
        let actions = engine.handle_event(Event::Disconnected {
            conn_handle: CONN + 1,
            reason: 0x08,
        });
        assert!(actions.is_empty());
        assert_eq!(engine.link(), LinkState::Connected { conn_handle: CONN });
    }

    #[test]
    fn test_second_connection_refused() {
        let fixture = Fixture::new();
        let mut engine = session(&fixture, &ANDROID_ID, 1);
        let actions = engine.handle_event(Event::Connected {
            conn_handle: CONN + 1,
        });
        assert_eq!(
            actions,
            vec![Action::Disconnect {
                conn_handle: CONN + 1
            }]
        );
        assert_eq!(engine.link(), LinkState::Connected { conn_handle: CONN });
    }

    #[test]
    fn test_connect_failure_rescans() {
        let fixture = Fixture::new();
        let mut engine = fixture.engine();
        let slot = engine.peers.save_peer(&ANDROID_ID, &PEER_MAC, None).unwrap();
        engine.try_peer_connect(slot);

        let actions = engine.handle_event(Event::ConnectFailed);
        assert_eq!(engine.link(), LinkState::Idle);
        assert_eq!(engine.state(), NodeState::Scanning);
        assert!(actions.contains(&Action::StartScan));
    }

    // ------------------------------------------------------------------------
    // Manual probe
    // ------------------------------------------------------------------------

    fn probing(fixture: &Fixture, fingerprint: &Fingerprint) -> Engine {
        let mut engine = fixture.engine();
        engine.handle_event(Event::AdvertReport {
            address: PEER_MAC,
            rssi: -66,
            data: vendor_advert(fingerprint),
        });
        let actions = engine.handle_event(Event::Connected { conn_handle: CONN });
        assert_eq!(
            actions[0],
            Action::DiscoverPrimaryServices {
                conn_handle: CONN,
                start_handle: HANDLE_START,
            }
        );
        engine
    }

    fn vendor_service(start_handle: u16, end_handle: u16) -> PrimaryService {
        PrimaryService {
            uuid16: SERVICE_UUID16,
            uuid_type: UuidType::Vendor,
            start_handle,
            end_handle,
        }
    }

    #[test]
    fn test_probe_found_allow_lists() {
        let fixture = Fixture::new();
        let fingerprint = [0x5A; 16];
        let mut engine = probing(&fixture, &fingerprint);

        let actions = engine.handle_event(Event::PrimaryServices {
            status: GattStatus::Success,
            services: vec![vendor_service(0x0C, 0x20)],
        });
        assert!(actions.contains(&Action::Read {
            conn_handle: CONN,
            handle: 0x0C,
        }));

        let id: PeerId = [0x02, 1, 2, 3, 4, 5, 6, 7, 8, 9];
        let uuid = service_uuid_for(&id);
        let actions = engine.handle_event(Event::ReadResponse {
            handle: 0x0C,
            data: uuid.to_vec(),
        });
        assert!(actions.contains(&Action::Disconnect { conn_handle: CONN }));
        assert_eq!(engine.allow.lookup(&fingerprint, 0), Some(id));

        let record = engine.peers().get(0).unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.fingerprint, fingerprint);
        assert_eq!(record.samples[0], Sample::new(-66, 0));
    }

    #[test]
    fn test_probe_not_found_deny_lists() {
        let fixture = Fixture::new();
        let fingerprint = [0x5A; 16];
        let mut engine = probing(&fixture, &fingerprint);

        let actions = engine.handle_event(Event::PrimaryServices {
            status: GattStatus::AttributeNotFound,
            services: Vec::new(),
        });
        assert!(actions.contains(&Action::Disconnect { conn_handle: CONN }));
        assert!(engine.deny.contains(&fingerprint, 0));
        assert!(engine.probe_candidate().is_none());
    }

    #[test]
    fn test_probe_read_failure_deny_lists() {
        let fixture = Fixture::new();
        let fingerprint = [0x5A; 16];
        let mut engine = probing(&fixture, &fingerprint);
        engine.handle_event(Event::PrimaryServices {
            status: GattStatus::Success,
            services: vec![vendor_service(0x0C, 0x20)],
        });

        let actions = engine.handle_event(Event::CallFailed {
            call: StackCall::Read,
            error: StackError::InvalidState,
        });
        assert!(actions.contains(&Action::Disconnect { conn_handle: CONN }));
        assert!(engine.deny.contains(&fingerprint, 0));
    }
}
