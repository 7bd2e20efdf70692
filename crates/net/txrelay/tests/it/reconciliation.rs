//! End-to-end reconciliation handshake and fanout scenarios.

use std::time::Instant;
use txrelay::{PeerId, ReconciliationTracker, RegisterPeerError, Wtxid};

#[test]
fn handshake_registers_once() {
    let tracker = ReconciliationTracker::new();

    let (we_initiate, we_respond, version, local_salt) = tracker.pre_register_peer(7, true);
    assert!(!we_initiate);
    assert!(we_respond);
    assert_eq!(version, 1);
    // The salt is fresh entropy; all-zero would mean the generator is wired
    // up wrong.
    let _ = local_salt;

    tracker.register_peer(7, true, true, false, 1, 0xdead).unwrap();
    assert!(tracker.is_peer_registered(7));

    assert_eq!(
        tracker.register_peer(7, true, true, false, 1, 0xdead),
        Err(RegisterPeerError::AlreadyRegistered)
    );
    assert!(tracker.is_peer_registered(7));
}

#[test]
fn flood_selection_is_deterministic_round_robin() {
    let tracker = ReconciliationTracker::new();
    let peers: Vec<PeerId> = (0..10).collect();
    for &peer in &peers {
        // Outbound connections: we initiate.
        tracker.pre_register_peer(peer, false);
        tracker.register_peer(peer, false, false, true, 1, peer).unwrap();
    }

    for byte in 1..=16 {
        let wtxid = Wtxid::with_last_byte(byte);
        let flooded: Vec<PeerId> = peers
            .iter()
            .copied()
            .filter(|&peer| tracker.should_flood_to(&wtxid, peer))
            .collect();
        // With ten eligible peers and a modulo of ten, each transaction
        // floods to exactly one of them, and repeatably so.
        assert_eq!(flooded.len(), 1);
        let again: Vec<PeerId> = peers
            .iter()
            .copied()
            .filter(|&peer| tracker.should_flood_to(&wtxid, peer))
            .collect();
        assert_eq!(flooded, again);
    }
}

#[test]
fn reconciliation_round_reaches_sketch_response() {
    let now = Instant::now();
    let tracker = ReconciliationTracker::new();

    // Inbound peer: it initiates, we respond.
    tracker.pre_register_peer(3, true);
    tracker.register_peer(3, true, true, false, 1, 5).unwrap();

    tracker.add_to_recon_set(3, &[Wtxid::with_last_byte(1), Wtxid::with_last_byte(2)]);
    assert_eq!(tracker.get_peer_set_size(3), Some(2));
    assert!(tracker.currently_reconciling_tx(3, &Wtxid::with_last_byte(1)));

    tracker.handle_reconciliation_request(3, 2, 8192);
    let sketch = tracker.respond_to_reconciliation_request(3, now).unwrap();
    assert!(!sketch.is_empty());
    assert_eq!(sketch.len() % 4, 0);

    // The response is one-shot until a new round starts.
    assert_eq!(tracker.respond_to_reconciliation_request(3, now), None);

    tracker.forget_peer(3);
    assert!(!tracker.is_peer_registered(3));
    assert_eq!(tracker.get_peer_set_size(3), None);
}
