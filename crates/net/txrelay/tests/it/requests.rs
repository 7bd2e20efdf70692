//! End-to-end request scheduling scenarios.

use std::time::{Duration, Instant};
use txrelay::{GenTxid, TxHash, TxRequestScheduler};

fn t(base: Instant, secs: u64) -> Instant {
    base + Duration::from_secs(secs)
}

fn tx(byte: u8) -> GenTxid {
    GenTxid::Wtxid(TxHash::with_last_byte(byte))
}

#[test]
fn single_peer_happy_path() {
    let base = Instant::now();
    let scheduler = TxRequestScheduler::new_deterministic();
    let t1 = tx(1);

    scheduler.received_inv(1, t1, true, false, t(base, 10));
    assert!(scheduler.get_requestable(1, t(base, 9)).is_empty());
    assert_eq!(scheduler.get_requestable(1, t(base, 10)), vec![t1]);

    scheduler.requested_tx(1, t1, t(base, 30));
    assert!(scheduler.get_requestable(1, t(base, 20)).is_empty());

    // The response completes the announcement; as the only one for the
    // txhash it is dropped entirely.
    scheduler.received_response(1, t1);
    assert!(scheduler.get_requestable(1, t(base, 25)).is_empty());
    assert!(scheduler.is_empty());
}

#[test]
fn timed_out_request_fails_over() {
    let base = Instant::now();
    let scheduler = TxRequestScheduler::new_deterministic();
    let t1 = tx(1);

    scheduler.received_inv(1, t1, true, false, t(base, 10));
    scheduler.received_inv(2, t1, true, false, t(base, 10));

    // Peer 1 announced first, so it holds the preferred-class first marker
    // and wins the tie.
    assert_eq!(scheduler.get_requestable(1, t(base, 10)), vec![t1]);
    scheduler.requested_tx(1, t1, t(base, 30));

    // After the expiry passes, peer 2 takes over.
    assert_eq!(scheduler.get_requestable(2, t(base, 40)), vec![t1]);
    assert_eq!(scheduler.count_in_flight(1), 0);
    assert_eq!(scheduler.count_tracked(2), 1);
}

#[test]
fn preferred_beats_non_preferred() {
    let base = Instant::now();
    let scheduler = TxRequestScheduler::new_deterministic();
    let t1 = tx(1);

    scheduler.received_inv(1, t1, false, false, t(base, 5));
    scheduler.received_inv(2, t1, true, false, t(base, 5));
    assert_eq!(scheduler.get_requestable(2, t(base, 5)), vec![t1]);
    assert!(scheduler.get_requestable(1, t(base, 5)).is_empty());
}

#[test]
fn deleted_peer_hands_over_immediately() {
    let base = Instant::now();
    let scheduler = TxRequestScheduler::new_deterministic();
    let t1 = tx(1);

    scheduler.received_inv(1, t1, true, false, t(base, 10));
    scheduler.received_inv(2, t1, true, false, t(base, 10));
    assert_eq!(scheduler.get_requestable(1, t(base, 10)), vec![t1]);
    scheduler.requested_tx(1, t1, t(base, 30));

    // No waiting for the expiry once the requested peer is gone.
    scheduler.deleted_peer(1);
    assert_eq!(scheduler.get_requestable(2, t(base, 11)), vec![t1]);
}

#[test]
fn output_follows_announcement_order() {
    let base = Instant::now();
    let scheduler = TxRequestScheduler::new_deterministic();
    let order = [tx(2), tx(3), tx(1)];

    for (i, gtxid) in order.iter().enumerate() {
        // Later announcements get earlier request times; announcement order
        // must still win.
        scheduler.received_inv(7, *gtxid, true, false, t(base, 9 - i as u64));
    }
    assert_eq!(scheduler.get_requestable(7, t(base, 9)), order);
}

#[test]
fn already_have_tx_is_global() {
    let base = Instant::now();
    let scheduler = TxRequestScheduler::new_deterministic();
    let t1 = tx(1);
    let t2 = tx(2);

    scheduler.received_inv(1, t1, true, false, t(base, 10));
    scheduler.received_inv(2, t1, false, false, t(base, 10));
    scheduler.received_inv(1, t2, true, false, t(base, 10));
    let requestable = scheduler.get_requestable(1, t(base, 10));
    assert_eq!(requestable, vec![t1, t2]);
    scheduler.requested_tx(1, requestable[0], t(base, 30));

    scheduler.already_have_tx(t1);
    assert_eq!(scheduler.len(), 1);
    assert_eq!(scheduler.count_tracked(2), 0);
    assert_eq!(scheduler.get_requestable(1, t(base, 10)), vec![t2]);
}
