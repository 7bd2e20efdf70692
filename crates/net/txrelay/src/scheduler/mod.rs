//! Scheduling of transaction downloads across announcing peers.
//!
//! Many peers gossip the same transaction hashes. [`TxRequestScheduler`]
//! tracks one announcement per (peer, txhash) pair and decides which peer to
//! ask for which transaction, when, and in what order:
//!
//! - While a request for a txhash is in flight, no second request for it is
//!   made; only after the request expires or a response arrives does the next
//!   candidate get a turn. This avoids downloading duplicate copies.
//! - A transaction is never requested twice from the same peer, unless every
//!   announcement for it was forgotten in between and the peer re-announced.
//!   Re-announcements must not let a peer improve its own odds.
//! - Announcements are only forgotten when their peer goes offline, the
//!   transaction is no longer wanted, or no untried candidates remain, which
//!   bounds memory by the set of active announcements.
//! - A candidate is not eligible before its request time. The caller uses
//!   this to delay less-trusted peers, giving better ones a head start.
//! - Among eligible candidates, preferred peers beat non-preferred ones, a
//!   one-shot "first announcer" marker per preference class beats the rest of
//!   its class, and remaining ties are broken by a salted hash that peers
//!   cannot predict or steer.
//!
//! Time never advances on its own: the caller passes `now` into
//! [`TxRequestScheduler::get_requestable`], and expiries/request times with
//! the operations that set them. Two runs feeding the same operations with
//! the same timestamps go through identical states.

use crate::primitives::{GenTxid, PeerId};
use parking_lot::Mutex;
use std::{fmt, time::Instant};

mod entry;
mod inner;
mod priority;

use inner::SchedulerInner;
pub use priority::PriorityComputer;

/// Tracks transaction announcements and schedules download requests.
///
/// All methods take `&self`; an internal mutex serializes them. After
/// [`get_requestable`](Self::get_requestable) returns, the caller may invoke
/// [`requested_tx`](Self::requested_tx) for the returned identifiers (same
/// peer) as long as only [`already_have_tx`](Self::already_have_tx) and other
/// `requested_tx` calls for different txhashes happen in between; any other
/// mutating call invalidates that window.
pub struct TxRequestScheduler {
    inner: Mutex<SchedulerInner>,
}

impl TxRequestScheduler {
    /// Creates a scheduler with a random priority salt.
    pub fn new() -> Self {
        Self { inner: Mutex::new(SchedulerInner::new(PriorityComputer::new())) }
    }

    /// Creates a scheduler whose tie-breaking is reproducible across runs.
    /// Intended for tests and simulations.
    pub fn new_deterministic() -> Self {
        Self { inner: Mutex::new(SchedulerInner::new(PriorityComputer::deterministic())) }
    }

    /// Records that `peer` announced `gtxid`. The announcement becomes
    /// eligible for download once `reqtime` passes. Repeat announcements for
    /// the same (peer, txhash) are ignored. `overloaded` peers are denied the
    /// first-announcer marker.
    pub fn received_inv(
        &self,
        peer: PeerId,
        gtxid: GenTxid,
        preferred: bool,
        overloaded: bool,
        reqtime: Instant,
    ) {
        let mut inner = self.inner.lock();
        inner.received_inv(peer, gtxid, preferred, overloaded, reqtime);
        update_gauges(&inner);
    }

    /// Drops every announcement of this txhash, in any state, from any peer.
    /// Call when the transaction was accepted to the mempool, seen in a
    /// block, or is otherwise no longer wanted.
    pub fn already_have_tx(&self, gtxid: GenTxid) {
        let mut inner = self.inner.lock();
        inner.already_have_tx(gtxid);
        update_gauges(&inner);
    }

    /// Drops all state for an offline peer. Transactions it was the selected
    /// candidate for fall over to their next-best announcer.
    pub fn deleted_peer(&self, peer: PeerId) {
        let mut inner = self.inner.lock();
        inner.deleted_peer(peer);
        update_gauges(&inner);
    }

    /// Records that `peer` answered for `gtxid` (with the transaction or
    /// with not-found), completing its announcement. No effect if nothing is
    /// tracked for the pair. If the transaction itself is now known,
    /// [`already_have_tx`](Self::already_have_tx) should be called instead
    /// of, or in addition to, this.
    pub fn received_response(&self, peer: PeerId, gtxid: GenTxid) {
        let mut inner = self.inner.lock();
        inner.received_response(peer, gtxid);
        update_gauges(&inner);
    }

    /// Marks `gtxid` as requested from `peer`, expiring at `exptime`.
    ///
    /// # Panics
    ///
    /// The identifier must come from the last
    /// [`get_requestable`](Self::get_requestable) call for this peer (see the
    /// type-level contract); anything else is a caller bug and panics.
    pub fn requested_tx(&self, peer: PeerId, gtxid: GenTxid, exptime: Instant) {
        let mut inner = self.inner.lock();
        inner.requested_tx(peer, gtxid, exptime);
        update_gauges(&inner);
    }

    /// Advances tracked time to `now` and returns the identifiers that may be
    /// requested from `peer` right now, in announcement order.
    pub fn get_requestable(&self, peer: PeerId, now: Instant) -> Vec<GenTxid> {
        let mut inner = self.inner.lock();
        let requestable = inner.get_requestable(peer, now);
        update_gauges(&inner);
        requestable
    }

    /// Number of requests to `peer` currently in flight.
    pub fn count_in_flight(&self, peer: PeerId) -> usize {
        self.inner.lock().count_in_flight(peer)
    }

    /// Number of announcements tracked for `peer`, in any state.
    pub fn count_tracked(&self, peer: PeerId) -> usize {
        self.inner.lock().count_tracked(peer)
    }

    /// Total number of announcements tracked, across all peers.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether no announcements are tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs the internal consistency checks. Test-only.
    #[cfg(test)]
    fn sanity_check(&self) {
        self.inner.lock().sanity_check();
    }

    /// Runs the time-dependent consistency check. Only expected to hold
    /// right after [`get_requestable`](Self::get_requestable). Test-only.
    #[cfg(test)]
    fn time_sanity_check(&self, now: Instant) {
        self.inner.lock().time_sanity_check(now);
    }
}

fn update_gauges(inner: &SchedulerInner) {
    inner.metrics.tracked_announcements.set(inner.len() as f64);
    inner.metrics.inflight_requests.set(inner.requested_total() as f64);
}

impl Default for TxRequestScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TxRequestScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxRequestScheduler").field("announcements", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::TxHash;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::time::Duration;

    fn t(base: Instant, secs: u64) -> Instant {
        base + Duration::from_secs(secs)
    }

    fn wtxid(byte: u8) -> GenTxid {
        GenTxid::Wtxid(TxHash::with_last_byte(byte))
    }

    #[test]
    fn single_peer_lifecycle() {
        let base = Instant::now();
        let tracker = TxRequestScheduler::new_deterministic();
        let tx = wtxid(1);

        tracker.received_inv(1, tx, true, false, t(base, 10));
        tracker.sanity_check();
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.count_tracked(1), 1);
        assert_eq!(tracker.count_in_flight(1), 0);

        // Not eligible before its request time.
        assert!(tracker.get_requestable(1, t(base, 9)).is_empty());
        tracker.time_sanity_check(t(base, 9));
        assert_eq!(tracker.get_requestable(1, t(base, 10)), vec![tx]);
        tracker.sanity_check();

        tracker.requested_tx(1, tx, t(base, 30));
        assert_eq!(tracker.count_in_flight(1), 1);
        assert!(tracker.get_requestable(1, t(base, 20)).is_empty());

        // A response completes the entry; as the only announcement it is
        // garbage collected outright.
        tracker.received_response(1, tx);
        tracker.sanity_check();
        assert!(tracker.is_empty());
        assert_eq!(tracker.count_tracked(1), 0);
    }

    #[test]
    fn repeat_announcement_is_ignored() {
        let base = Instant::now();
        let tracker = TxRequestScheduler::new_deterministic();
        let tx = wtxid(1);

        tracker.received_inv(1, tx, true, false, t(base, 10));
        tracker.received_inv(1, tx, true, false, t(base, 1));
        tracker.sanity_check();
        assert_eq!(tracker.len(), 1);
        // The second announcement's earlier reqtime must not apply.
        assert!(tracker.get_requestable(1, t(base, 5)).is_empty());
    }

    #[test]
    fn first_marker_wins_tie_between_preferred_peers() {
        let base = Instant::now();
        let tracker = TxRequestScheduler::new_deterministic();
        let tx = wtxid(1);

        tracker.received_inv(1, tx, true, false, t(base, 10));
        tracker.received_inv(2, tx, true, false, t(base, 10));
        tracker.sanity_check();

        // Peer 1 announced first and holds the first marker for the
        // preferred class, so it wins the tie.
        assert_eq!(tracker.get_requestable(1, t(base, 10)), vec![tx]);
        assert!(tracker.get_requestable(2, t(base, 10)).is_empty());
        tracker.sanity_check();
    }

    #[test]
    fn expired_request_falls_over_to_other_peer() {
        let base = Instant::now();
        let tracker = TxRequestScheduler::new_deterministic();
        let tx = wtxid(1);

        tracker.received_inv(1, tx, true, false, t(base, 10));
        tracker.received_inv(2, tx, true, false, t(base, 10));
        assert_eq!(tracker.get_requestable(1, t(base, 10)), vec![tx]);
        tracker.requested_tx(1, tx, t(base, 30));

        // Still in flight: nobody else gets it.
        assert!(tracker.get_requestable(2, t(base, 29)).is_empty());
        // Expired: peer 2 takes over, peer 1 keeps a completed entry.
        assert_eq!(tracker.get_requestable(2, t(base, 40)), vec![tx]);
        tracker.sanity_check();
        tracker.time_sanity_check(t(base, 40));
        assert_eq!(tracker.count_in_flight(1), 0);
        assert_eq!(tracker.count_tracked(1), 1);
    }

    #[test]
    fn preferred_peer_outranks_non_preferred() {
        let base = Instant::now();
        let tracker = TxRequestScheduler::new_deterministic();
        let tx = wtxid(1);

        tracker.received_inv(1, tx, false, false, t(base, 5));
        tracker.received_inv(2, tx, true, false, t(base, 5));
        assert_eq!(tracker.get_requestable(2, t(base, 5)), vec![tx]);
        assert!(tracker.get_requestable(1, t(base, 5)).is_empty());
        tracker.sanity_check();
    }

    #[test]
    fn deleted_peer_hands_over_without_timeout() {
        let base = Instant::now();
        let tracker = TxRequestScheduler::new_deterministic();
        let tx = wtxid(1);

        tracker.received_inv(1, tx, true, false, t(base, 10));
        tracker.received_inv(2, tx, true, false, t(base, 10));
        assert_eq!(tracker.get_requestable(1, t(base, 10)), vec![tx]);
        tracker.requested_tx(1, tx, t(base, 30));

        // Peer 1 goes offline mid-request: peer 2 becomes requestable
        // immediately, no expiry needed.
        tracker.deleted_peer(1);
        tracker.sanity_check();
        assert_eq!(tracker.count_tracked(1), 0);
        assert_eq!(tracker.get_requestable(2, t(base, 11)), vec![tx]);
    }

    #[test]
    fn already_have_tx_drops_all_peers() {
        let base = Instant::now();
        let tracker = TxRequestScheduler::new_deterministic();
        let tx = wtxid(1);
        let other = wtxid(2);

        for peer in 1..=3 {
            tracker.received_inv(peer, tx, peer == 1, false, t(base, 10));
        }
        tracker.received_inv(1, other, true, false, t(base, 10));
        tracker.already_have_tx(tx);
        tracker.sanity_check();
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.get_requestable(1, t(base, 10)), vec![other]);
    }

    #[test]
    fn exhausted_txhash_is_garbage_collected() {
        let base = Instant::now();
        let tracker = TxRequestScheduler::new_deterministic();
        let tx = wtxid(1);

        tracker.received_inv(1, tx, true, false, t(base, 10));
        tracker.received_inv(2, tx, true, false, t(base, 10));
        // Both peers answer not-found; with no candidates left the txhash
        // must vanish entirely.
        tracker.received_response(1, tx);
        tracker.sanity_check();
        assert_eq!(tracker.len(), 2);
        tracker.received_response(2, tx);
        tracker.sanity_check();
        assert!(tracker.is_empty());
    }

    #[test]
    fn requestable_is_in_announcement_order() {
        let base = Instant::now();
        let tracker = TxRequestScheduler::new_deterministic();
        let txs = [wtxid(3), wtxid(1), wtxid(2)];

        // Announce with request times in reverse, all due by t=10: output
        // must follow announcement order, not time or hash order.
        for (i, tx) in txs.iter().enumerate() {
            tracker.received_inv(1, *tx, true, false, t(base, 10 - i as u64));
        }
        assert_eq!(tracker.get_requestable(1, t(base, 10)), txs);
        tracker.sanity_check();
    }

    #[test]
    fn clock_backwards_demotes_candidates() {
        let base = Instant::now();
        let tracker = TxRequestScheduler::new_deterministic();
        let tx = wtxid(1);

        tracker.received_inv(1, tx, true, false, t(base, 10));
        assert_eq!(tracker.get_requestable(1, t(base, 10)), vec![tx]);
        // Time runs backwards: the candidate is delayed again.
        assert!(tracker.get_requestable(1, t(base, 5)).is_empty());
        tracker.sanity_check();
        tracker.time_sanity_check(t(base, 5));
        // And forward again.
        assert_eq!(tracker.get_requestable(1, t(base, 10)), vec![tx]);
    }

    #[test]
    fn stepping_time_matches_jumping_time() {
        let base = Instant::now();
        let stepped = TxRequestScheduler::new_deterministic();
        let jumped = TxRequestScheduler::new_deterministic();

        for tracker in [&stepped, &jumped] {
            for peer in 1..=3u64 {
                tracker.received_inv(peer, wtxid(1), peer == 2, false, t(base, peer));
                tracker.received_inv(peer, wtxid(2), peer == 3, peer == 1, t(base, 10 - peer));
            }
        }
        let _ = stepped.get_requestable(1, t(base, 4));
        let _ = stepped.get_requestable(2, t(base, 7));

        for peer in 1..=3u64 {
            assert_eq!(
                stepped.get_requestable(peer, t(base, 12)),
                jumped.get_requestable(peer, t(base, 12)),
            );
        }
        stepped.sanity_check();
        jumped.sanity_check();
    }

    #[test]
    fn first_marker_is_not_reissued_after_request() {
        let base = Instant::now();
        let tracker = TxRequestScheduler::new_deterministic();
        let tx = wtxid(1);

        tracker.received_inv(1, tx, true, false, t(base, 0));
        tracker.received_inv(2, tx, true, false, t(base, 0));
        assert_eq!(tracker.get_requestable(1, t(base, 0)), vec![tx]);
        tracker.requested_tx(1, tx, t(base, 30));
        tracker.deleted_peer(1);

        // Peer 1 (the first-marker holder) is gone and a request was made,
        // so peer 3 cannot claim the marker; the winner between peers 2 and
        // 3 is decided by the salted hash alone.
        tracker.received_inv(3, tx, true, false, t(base, 0));
        tracker.sanity_check();
        let computer = PriorityComputer::deterministic();
        let hash = tx.hash();
        let winner =
            if computer.priority(&hash, 2, true, false) < computer.priority(&hash, 3, true, false) {
                2
            } else {
                3
            };
        let loser = 5 - winner;
        assert_eq!(tracker.get_requestable(winner, t(base, 1)), vec![tx]);
        assert!(tracker.get_requestable(loser, t(base, 1)).is_empty());
    }

    #[test]
    fn better_candidate_displaces_current_best() {
        let base = Instant::now();
        let tracker = TxRequestScheduler::new_deterministic();
        let tx = wtxid(1);

        // The non-preferred peer becomes best first (earlier reqtime); the
        // preferred peer must displace it on promotion. Announced as
        // overloaded so no first markers muddy the comparison.
        tracker.received_inv(1, tx, false, true, t(base, 5));
        tracker.received_inv(2, tx, true, true, t(base, 10));
        assert_eq!(tracker.get_requestable(1, t(base, 5)), vec![tx]);
        assert!(tracker.get_requestable(1, t(base, 10)).is_empty());
        assert_eq!(tracker.get_requestable(2, t(base, 10)), vec![tx]);
        tracker.sanity_check();
    }

    #[test]
    fn randomized_operations_keep_invariants() {
        let base = Instant::now();
        let mut rng = StdRng::seed_from_u64(0xb330);
        let tracker = TxRequestScheduler::new_deterministic();

        for _ in 0..1000 {
            let peer = rng.gen_range(1..=4u64);
            let gtxid = GenTxid::from_parts(rng.gen_bool(0.5), TxHash::with_last_byte(rng.gen_range(1..=3)));
            let now = t(base, rng.gen_range(0..=20));
            match rng.gen_range(0..6) {
                0 => tracker.received_inv(
                    peer,
                    gtxid,
                    rng.gen_bool(0.5),
                    rng.gen_bool(0.25),
                    t(base, rng.gen_range(0..=20)),
                ),
                1 => tracker.already_have_tx(gtxid),
                2 => tracker.deleted_peer(peer),
                3 => tracker.received_response(peer, gtxid),
                _ => {
                    let requestable = tracker.get_requestable(peer, now);
                    tracker.time_sanity_check(now);
                    if let Some(gtxid) = requestable.first() {
                        if rng.gen_bool(0.8) {
                            tracker.requested_tx(peer, *gtxid, now + Duration::from_secs(60));
                        }
                    }
                }
            }
            tracker.sanity_check();
        }
    }
}
