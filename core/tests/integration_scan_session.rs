// Scan-to-upload scenarios driven purely through events

mod common;

use blesc_core::crypto::PeerKey;
use blesc_core::{Action, Event, LinkState, NodeState, ScannerSettings, SessionMode, TimerId};
use common::*;

const ANDROID_ID: [u8; 10] = [0x00, 0x10, 0x20, 0x30, 0x40, 0x50, 0x60, 0x70, 0x80, 0x90];

/// Run one telemetry exchange after `connect_peer`, returning every action
fn upload(node: &Node, engine: &mut blesc_core::Engine) -> Vec<Action> {
    let salt = [0x5C; 16];
    let mut frame = vec![0x00, 0x00];
    frame.extend_from_slice(&salt);
    let actions = engine.handle_event(notify(frame));
    let signed = drain(engine, actions);

    let signature: Vec<u8> = writes(&signed)
        .into_iter()
        .flat_map(|(_, data)| data[1..].to_vec())
        .collect();
    let node_key = PeerKey::from_raw(&node.keys.public_key()).unwrap();
    assert!(node_key.verify(&salt, &signature));
    assert_eq!(signed.last(), Some(&Action::MeasureBattery));

    let actions = engine.handle_event(Event::BatteryMeasured { voltage: 2.5 });
    drain(engine, actions)
}

#[test]
fn test_threshold_connect_and_upload() {
    let node = Node::new();
    let mut engine = node.engine();
    assert_eq!(engine.state(), NodeState::Scanning);

    let first = engine.handle_event(advert(service_advert(&ANDROID_ID), -50));
    assert!(!first.iter().any(|a| matches!(a, Action::Connect { .. })));
    engine.handle_event(advert(service_advert(&ANDROID_ID), -51));
    let third = engine.handle_event(advert(service_advert(&ANDROID_ID), -52));
    assert!(third.contains(&Action::StopScan));
    assert!(third
        .iter()
        .any(|a| matches!(a, Action::Connect { address, .. } if *address == PEER_MAC)));
    assert_eq!(engine.link(), LinkState::Connecting);

    engine.handle_event(Event::Connected { conn_handle: CONN });
    let actions = engine.handle_event(Event::ServiceDiscovered {
        characteristics: characteristics(),
    });
    assert!(actions.contains(&Action::EnableNotifications {
        conn_handle: CONN,
        cccd_handle: CCCD,
    }));

    let uploaded = upload(&node, &mut engine);
    let sent = writes(&uploaded);
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].0, HEALTH);
    assert_eq!(sent[0].1[0], 0x01);
    assert_eq!(sent[0].1[1], 25);
    assert_eq!(sent[1].0, RSSI);
    assert_eq!(sent[1].1, vec![0xCE, 0, 0xCD, 0, 0xCC, 0]);
    assert_eq!(engine.session_mode(), SessionMode::Rssi);
}

#[test]
fn test_default_threshold_needs_five_samples() {
    let node = Node::new();
    let (mut engine, _) = node.boot_with(ScannerSettings::default(), node.store());
    assert_eq!(engine.settings().sample_threshold, 5);

    for rssi in [-50, -51, -52, -53] {
        let actions = engine.handle_event(advert(service_advert(&ANDROID_ID), rssi));
        assert!(!actions.iter().any(|a| matches!(a, Action::Connect { .. })));
        assert_eq!(engine.state(), NodeState::Scanning);
    }

    let fifth = engine.handle_event(advert(service_advert(&ANDROID_ID), -54));
    assert!(fifth.contains(&Action::StopScan));
    assert!(fifth
        .iter()
        .any(|a| matches!(a, Action::Connect { address, .. } if *address == PEER_MAC)));
    assert_eq!(engine.state(), NodeState::Connect);
    assert_eq!(engine.link(), LinkState::Connecting);
}

#[test]
fn test_abort_returns_to_scanning() {
    let node = Node::new();
    let mut engine = node.engine();
    connect_peer(&mut engine, &ANDROID_ID);

    let actions = engine.handle_event(notify(vec![0x42]));
    assert!(actions.contains(&Action::Disconnect { conn_handle: CONN }));
    assert!(actions.contains(&Action::StartScan));
    assert_eq!(engine.state(), NodeState::Scanning);
    assert_eq!(engine.session_mode(), SessionMode::None);
    assert_eq!(engine.peers().active_count(), 0);

    // The host never confirms the disconnect; sightings keep counting
    engine.handle_event(Event::TimerExpired(TimerId::Inactivity));
    for rssi in [-50, -51, -52, -53] {
        let actions = engine.handle_event(advert(service_advert(&ANDROID_ID), rssi));
        assert!(!actions.iter().any(|a| matches!(a, Action::Connect { .. })));
    }
    assert_eq!(engine.state(), NodeState::Scanning);
    assert_eq!(engine.peers().active_count(), 1);

    // The scan-connect window releases the stuck link and connects
    let actions = engine.handle_event(Event::TimerExpired(TimerId::ScanConnect));
    assert!(actions
        .iter()
        .any(|a| matches!(a, Action::Connect { address, .. } if *address == PEER_MAC)));
    assert_eq!(engine.state(), NodeState::Connect);
    assert_eq!(engine.link(), LinkState::Connecting);

    // A late confirmation for the old link changes nothing
    let actions = engine.handle_event(Event::Disconnected {
        conn_handle: CONN,
        reason: 0x16,
    });
    assert!(actions.is_empty());
    assert_eq!(engine.link(), LinkState::Connecting);
}

#[test]
fn test_disconnect_after_abort_rescans() {
    let node = Node::new();
    let mut engine = node.engine();
    connect_peer(&mut engine, &ANDROID_ID);
    engine.handle_event(notify(vec![0x42]));
    assert_eq!(engine.link(), LinkState::Disconnecting { conn_handle: CONN });

    let actions = engine.handle_event(Event::Disconnected {
        conn_handle: CONN,
        reason: 0x16,
    });
    assert!(actions.contains(&Action::StartScan));
    assert_eq!(engine.link(), LinkState::Idle);
    assert_eq!(engine.state(), NodeState::Scanning);

    connect_peer(&mut engine, &ANDROID_ID);
    assert_eq!(engine.link(), LinkState::Connected { conn_handle: CONN });
}

#[test]
fn test_stale_clock_reads_peer_time() {
    let node = Node::new();
    let mut engine = node.engine();
    connect_peer(&mut engine, &ANDROID_ID);

    let actions = upload(&node, &mut engine);
    assert!(engine.clock().is_stale());
    assert!(actions.contains(&Action::Read {
        conn_handle: CONN,
        handle: TIME,
    }));

    let actions = engine.handle_event(Event::ReadResponse {
        handle: TIME,
        data: 36_000_500u32.to_le_bytes().to_vec(),
    });
    assert_eq!(engine.clock().system_time(), 36_000);
    assert!(!engine.clock().is_stale());
    assert_eq!(
        actions,
        vec![
            Action::StopTimer(TimerId::Inactivity),
            Action::Disconnect { conn_handle: CONN },
        ]
    );

    let actions = engine.handle_event(Event::Disconnected {
        conn_handle: CONN,
        reason: 0x16,
    });
    assert!(actions.contains(&Action::StartScan));
    assert_eq!(engine.state(), NodeState::Scanning);
    assert_eq!(engine.link(), LinkState::Idle);
    assert_eq!(engine.peers().active_count(), 0);

    // Second session: the clock is fresh, no time read
    connect_peer(&mut engine, &ANDROID_ID);
    let actions = upload(&node, &mut engine);
    assert!(!actions.iter().any(|a| matches!(a, Action::Read { .. })));
    assert!(actions.contains(&Action::Disconnect { conn_handle: CONN }));
}

#[test]
fn test_tools_advert_needs_matching_addressee() {
    let node = Node::new();
    let mut engine = node.engine();

    // Identifier bytes 2 and 3 address node 0x0203
    let theirs = [0x01, 0, 0x02, 0x04, 0, 0, 0, 0, 0, 0];
    engine.handle_event(advert(service_advert(&theirs), -30));
    assert_eq!(engine.peers().active_count(), 0);

    let ours = [0x01, 0, 0x02, 0x03, 0, 0, 0, 0, 0, 0];
    engine.handle_event(advert(service_advert(&ours), -30));
    assert_eq!(engine.peers().active_count(), 1);
}

#[test]
fn test_quiet_window_goes_idle_then_wakes() {
    let node = Node::new();
    let mut engine = node.engine();

    let actions = engine.handle_event(Event::TimerExpired(TimerId::ScanConnect));
    assert!(actions.contains(&Action::StopScan));
    assert_eq!(engine.state(), NodeState::Idle);

    let mut woke = false;
    for _ in 0..10 {
        let actions = engine.handle_event(Event::Tick);
        assert_eq!(actions[0], Action::FeedWatchdog);
        if actions.contains(&Action::StartScan) {
            woke = true;
            break;
        }
    }
    assert!(woke);
    assert_eq!(engine.state(), NodeState::Scanning);
    assert!(engine.clock().sleep_sum() > 0);
}

#[test]
fn test_inactivity_outside_connect_ignored() {
    let node = Node::new();
    let mut engine = node.engine();
    let actions = engine.handle_event(Event::TimerExpired(TimerId::Inactivity));
    assert!(actions.is_empty());
    assert_eq!(engine.state(), NodeState::Scanning);
}

#[test]
fn test_silent_peer_is_dropped() {
    let node = Node::new();
    let mut engine = node.engine();
    connect_peer(&mut engine, &ANDROID_ID);

    let actions = engine.handle_event(Event::TimerExpired(TimerId::Inactivity));
    assert!(actions.contains(&Action::Disconnect { conn_handle: CONN }));
    let actions = engine.handle_event(Event::Disconnected {
        conn_handle: CONN,
        reason: 0x08,
    });
    assert!(actions.contains(&Action::StartScan));
    assert_eq!(engine.session_mode(), SessionMode::None);
}
