//! The multi-indexed announcement store and its state machine.
//!
//! One [`Announcement`] record exists per (peer, txhash) pair, held in a
//! primary map and mirrored into three ordered key sets. Every mutation goes
//! through [`SchedulerInner::modify`] or [`SchedulerInner::erase`], which
//! rekey the indexes, keep the per-peer counters in step, and propagate the
//! per-txhash flag bits across the "last entry for this txhash" boundary.

use super::{
    entry::{
        Announcement, ByPeerKey, ByTimeKey, ByTxHashKey, State, NO_MORE_NONPREFERRED_FIRST,
        NO_MORE_PREFERRED_FIRST,
    },
    priority::PriorityComputer,
};
use crate::{
    metrics::SchedulerMetrics,
    primitives::{GenTxid, PeerId, TxHash},
};
use std::{
    collections::{BTreeSet, HashMap},
    ops::Bound,
    time::Instant,
};
use tracing::trace;

/// Primary key of an announcement.
pub(super) type AnnKey = (PeerId, TxHash);

/// Per-peer announcement counters, maintained by [`SchedulerInner::erase`]
/// and [`SchedulerInner::modify`] so the public counter reads stay O(1).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(super) struct PeerInfo {
    /// Number of announcements tracked for this peer.
    pub(super) total: usize,
    /// Number of those announcements that are in the requested state.
    pub(super) requested: usize,
}

pub(super) struct SchedulerInner {
    /// Priority salt, fixed at construction.
    computer: PriorityComputer,
    /// All announcements, keyed by (peer, txhash). Uniqueness of the pair
    /// falls out of the map.
    entries: HashMap<AnnKey, Announcement>,
    /// Entries ordered by (peer, is-best, txhash).
    by_peer: BTreeSet<ByPeerKey>,
    /// Entries ordered by (txhash, state, priority-if-ready, peer).
    by_txhash: BTreeSet<ByTxHashKey>,
    /// Entries ordered by (bucket, time, peer, txhash).
    by_time: BTreeSet<ByTimeKey>,
    /// Per-peer counters; a peer with zero announcements has no entry.
    peer_info: HashMap<PeerId, PeerInfo>,
    /// Next announcement sequence number.
    sequence: u64,
    pub(super) metrics: SchedulerMetrics,
}

impl SchedulerInner {
    pub(super) fn new(computer: PriorityComputer) -> Self {
        Self {
            computer,
            entries: HashMap::new(),
            by_peer: BTreeSet::new(),
            by_txhash: BTreeSet::new(),
            by_time: BTreeSet::new(),
            peer_info: HashMap::new(),
            sequence: 0,
            metrics: SchedulerMetrics::default(),
        }
    }

    pub(super) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(super) fn count_in_flight(&self, peer: PeerId) -> usize {
        self.peer_info.get(&peer).map(|info| info.requested).unwrap_or_default()
    }

    pub(super) fn count_tracked(&self, peer: PeerId) -> usize {
        self.peer_info.get(&peer).map(|info| info.total).unwrap_or_default()
    }

    pub(super) fn requested_total(&self) -> usize {
        self.peer_info.values().map(|info| info.requested).sum()
    }

    /* ================== INDEX PLUMBING ================== */

    fn insert_index_keys(&mut self, ann: &Announcement) {
        let in_peer = self.by_peer.insert(ann.by_peer_key());
        let in_txhash = self.by_txhash.insert(ann.by_txhash_key(&self.computer));
        let in_time = self.by_time.insert(ann.by_time_key());
        debug_assert!(in_peer && in_txhash && in_time, "index keys must be unique");
    }

    fn remove_index_keys(&mut self, ann: &Announcement) {
        let in_peer = self.by_peer.remove(&ann.by_peer_key());
        let in_txhash = self.by_txhash.remove(&ann.by_txhash_key(&self.computer));
        let in_time = self.by_time.remove(&ann.by_time_key());
        debug_assert!(in_peer && in_txhash && in_time, "index keys must exist");
    }

    /// The immediate by-txhash predecessor of `key`, if it belongs to the
    /// same txhash.
    fn pred_same_txhash(&self, key: ByTxHashKey) -> Option<ByTxHashKey> {
        self.by_txhash.range(..key).next_back().copied().filter(|pred| pred.0 == key.0)
    }

    /// The immediate by-txhash successor of `key`, if it belongs to the same
    /// txhash.
    fn succ_same_txhash(&self, key: ByTxHashKey) -> Option<ByTxHashKey> {
        self.by_txhash
            .range((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .copied()
            .filter(|succ| succ.0 == key.0)
    }

    /// The last by-txhash key for `txhash`, i.e. the entry carrying the
    /// authoritative per-txhash flags.
    fn last_key_for(&self, txhash: TxHash) -> Option<ByTxHashKey> {
        let low = (txhash, State::CandidateDelayed, 0, PeerId::MIN);
        let high = (txhash, State::Completed, u64::MAX, PeerId::MAX);
        self.by_txhash.range(low..=high).next_back().copied()
    }

    /// All primary keys with announcements for `txhash`.
    fn keys_for_txhash(&self, txhash: TxHash) -> Vec<AnnKey> {
        let low = (txhash, State::CandidateDelayed, 0, PeerId::MIN);
        let high = (txhash, State::Completed, u64::MAX, PeerId::MAX);
        self.by_txhash.range(low..=high).map(|&(tx, _, _, peer)| (peer, tx)).collect()
    }

    /// ORs `ann`'s flag bits into its by-txhash predecessor, so they survive
    /// `ann` leaving the last-entry position.
    fn or_flags_into_pred(&mut self, ann: &Announcement) {
        let key = ann.by_txhash_key(&self.computer);
        if let Some(pred) = self.pred_same_txhash(key) {
            let flags = ann.per_txhash;
            if let Some(pred_ann) = self.entries.get_mut(&(pred.3, pred.0)) {
                pred_ann.per_txhash |= flags;
            }
        }
    }

    /// ORs `flags` into the last entry for `txhash`, the authoritative
    /// carrier.
    fn or_flags_into_last(&mut self, txhash: TxHash, flags: u8) {
        if let Some(last) = self.last_key_for(txhash) {
            if let Some(ann) = self.entries.get_mut(&(last.3, last.0)) {
                ann.per_txhash |= flags;
            }
        }
    }

    /// Applies `mutate` to the announcement under `key`, rekeying all three
    /// indexes and maintaining counters and flag propagation.
    fn modify(&mut self, key: AnnKey, mutate: impl FnOnce(&mut Announcement)) {
        let computer = self.computer;
        let old = self.entries[&key];
        // It may stop being the last entry for its txhash; push its flags to
        // the predecessor before it moves.
        self.or_flags_into_pred(&old);
        self.remove_index_keys(&old);
        let ann = self.entries.get_mut(&key).expect("modify target must be tracked");
        mutate(ann);
        let new = *ann;
        debug_assert_eq!((new.peer, new.txhash), key, "identity fields are immutable");
        self.insert_index_keys(&new);
        // It may have become the new last entry; pull the union from the
        // predecessor of its new position.
        if let Some(pred) = self.pred_same_txhash(new.by_txhash_key(&computer)) {
            let flags = self.entries[&(pred.3, pred.0)].per_txhash;
            self.entries.get_mut(&key).expect("just modified").per_txhash |= flags;
        }
        let info = self.peer_info.get_mut(&key.0).expect("tracked peer has counters");
        info.requested -= usize::from(old.state == State::Requested);
        info.requested += usize::from(new.state == State::Requested);
    }

    /// Removes the announcement under `key` from the store and all indexes.
    fn erase(&mut self, key: AnnKey) {
        let ann = self.entries[&key];
        self.or_flags_into_pred(&ann);
        self.remove_index_keys(&ann);
        self.entries.remove(&key);
        let info = self.peer_info.get_mut(&key.0).expect("tracked peer has counters");
        info.requested -= usize::from(ann.state == State::Requested);
        info.total -= 1;
        if info.total == 0 {
            self.peer_info.remove(&key.0);
        }
    }

    /* ================== STATE MACHINE ================== */

    /// Promotes a delayed candidate whose request time has passed. It becomes
    /// ready, and best if it outranks the current best (or none exists).
    fn promote_candidate_new(&mut self, key: AnnKey) {
        let computer = self.computer;
        debug_assert_eq!(self.entries[&key].state, State::CandidateDelayed);
        self.modify(key, |ann| ann.state = State::CandidateReady);
        // By-txhash order is txhash, then state (delayed, best, requested,
        // ready), then priority among the ready entries. So if a best entry
        // this one could displace exists, it immediately precedes the
        // freshly inserted ready entry.
        let ann = self.entries[&key];
        match self.pred_same_txhash(ann.by_txhash_key(&computer)) {
            None => {
                // No selected entry for this txhash; take the spot.
                self.modify(key, |ann| ann.state = State::CandidateBest);
            }
            Some(pred) => {
                let pred_key = (pred.3, pred.0);
                match self.entries[&pred_key].state {
                    State::CandidateDelayed => {
                        self.modify(key, |ann| ann.state = State::CandidateBest);
                    }
                    State::CandidateBest => {
                        let pred_priority = self.entries[&pred_key].priority(&computer);
                        if ann.priority(&computer) < pred_priority {
                            self.modify(pred_key, |ann| ann.state = State::CandidateReady);
                            self.modify(key, |ann| ann.state = State::CandidateBest);
                        }
                    }
                    // A request is in flight, or a better ready entry (and
                    // therefore some selected entry) already precedes it.
                    _ => {}
                }
            }
        }
    }

    /// Moves the entry to a non-selected state. If it was selected, the best
    /// remaining ready entry for the txhash (its immediate by-txhash
    /// successor) takes over as best.
    fn change_and_reselect(&mut self, key: AnnKey, new_state: State) {
        let computer = self.computer;
        let ann = self.entries[&key];
        if ann.is_selected() {
            if let Some(succ) = self.succ_same_txhash(ann.by_txhash_key(&computer)) {
                let succ_key = (succ.3, succ.0);
                if self.entries[&succ_key].state == State::CandidateReady {
                    self.modify(succ_key, |ann| ann.state = State::CandidateBest);
                }
            }
        }
        self.modify(key, |ann| ann.state = new_state);
        debug_assert!(!self.entries[&key].is_selected());
    }

    /// Completes the entry. If that would leave only completed announcements
    /// for the txhash, all of them are dropped instead and `false` is
    /// returned (the entry no longer exists).
    fn make_completed(&mut self, key: AnnKey) -> bool {
        let computer = self.computer;
        let ann = self.entries[&key];
        if ann.state == State::Completed {
            return true;
        }
        let index_key = ann.by_txhash_key(&computer);
        let first_for_txhash = self.pred_same_txhash(index_key).is_none();
        let rest_completed = match self.succ_same_txhash(index_key) {
            None => true,
            Some(succ) => self.entries[&(succ.3, succ.0)].state == State::Completed,
        };
        if first_for_txhash && rest_completed {
            // This was the last non-completed entry; nothing left worth
            // remembering for this txhash.
            trace!(target: "net::txreq", txhash = %ann.txhash, "forgetting exhausted txhash");
            for key in self.keys_for_txhash(ann.txhash) {
                self.erase(key);
            }
            return false;
        }
        self.change_and_reselect(key, State::Completed);
        true
    }

    /// Catches the store up with `now`: due delayed candidates are promoted,
    /// expired requests completed, and (if the clock ran backwards)
    /// selectable entries with a future request time are demoted again.
    pub(super) fn set_time_point(&mut self, now: Instant) {
        while let Some(&(_, time, peer, txhash)) = self.by_time.iter().next() {
            let key = (peer, txhash);
            let state = self.entries[&key].state;
            if state == State::CandidateDelayed && time <= now {
                self.promote_candidate_new(key);
            } else if state == State::Requested && time <= now {
                self.metrics.expired_requests.increment(1);
                let _ = self.make_completed(key);
            } else {
                break;
            }
        }
        while let Some(&(_, time, peer, txhash)) = self.by_time.iter().next_back() {
            let key = (peer, txhash);
            if self.entries[&key].is_selectable() && time > now {
                self.change_and_reselect(key, State::CandidateDelayed);
            } else {
                break;
            }
        }
    }

    /* ================== OPERATIONS ================== */

    pub(super) fn received_inv(
        &mut self,
        peer: PeerId,
        gtxid: GenTxid,
        preferred: bool,
        overloaded: bool,
        reqtime: Instant,
    ) {
        let txhash = gtxid.hash();
        let key = (peer, txhash);
        // A repeat announcement from the same peer is ignored in any state:
        // giving a peer several entries would let it bias selection.
        if self.entries.contains_key(&key) {
            return;
        }

        // The authoritative flags live on the last entry for this txhash.
        let mut per_txhash = self
            .last_key_for(txhash)
            .map(|last| self.entries[&(last.3, last.0)].per_txhash)
            .unwrap_or_default();

        let mut first = false;
        if !overloaded {
            let flag =
                if preferred { NO_MORE_PREFERRED_FIRST } else { NO_MORE_NONPREFERRED_FIRST };
            if per_txhash & flag == 0 {
                first = true;
                per_txhash |= flag;
            }
        }

        let ann = Announcement::new(gtxid, peer, preferred, reqtime, self.sequence, first);
        self.sequence += 1;
        self.peer_info.entry(peer).or_default().total += 1;
        self.entries.insert(key, ann);
        self.insert_index_keys(&ann);
        // The new entry may or may not have become the last one; either way
        // the carrier gets the union.
        self.or_flags_into_last(txhash, per_txhash);

        trace!(
            target: "net::txreq",
            peer,
            txhash = %txhash,
            preferred,
            first,
            "tracking announcement"
        );
    }

    pub(super) fn already_have_tx(&mut self, gtxid: GenTxid) {
        for key in self.keys_for_txhash(gtxid.hash()) {
            self.erase(key);
        }
    }

    pub(super) fn deleted_peer(&mut self, peer: PeerId) {
        let keys: Vec<AnnKey> = self
            .by_peer
            .range((peer, false, TxHash::ZERO)..=(peer, true, TxHash::repeat_byte(0xff)))
            .map(|&(peer, _, txhash)| (peer, txhash))
            .collect();
        trace!(target: "net::txreq", peer, announcements = keys.len(), "dropping offline peer");
        for key in keys {
            // Completing first hands the txhash over to the next candidate
            // (or garbage collects it); the entry itself goes regardless.
            if self.make_completed(key) {
                self.erase(key);
            }
        }
    }

    pub(super) fn received_response(&mut self, peer: PeerId, gtxid: GenTxid) {
        let key = (peer, gtxid.hash());
        if self.entries.contains_key(&key) {
            let _ = self.make_completed(key);
        }
    }

    pub(super) fn requested_tx(&mut self, peer: PeerId, gtxid: GenTxid, exptime: Instant) {
        let txhash = gtxid.hash();
        let key = (peer, txhash);
        let ann = self.entries.get(&key);
        // Only txids just returned by get_requestable (with no intervening
        // reshuffling operation) may be requested, so the entry must be the
        // current best candidate.
        assert!(
            ann.is_some_and(|ann| ann.state == State::CandidateBest),
            "requested_tx on an entry that is not the best candidate"
        );
        self.modify(key, |ann| {
            ann.state = State::Requested;
            ann.time = exptime;
        });
        // With a request underway nobody gets the first marker for this
        // txhash anymore.
        self.or_flags_into_last(txhash, NO_MORE_PREFERRED_FIRST | NO_MORE_NONPREFERRED_FIRST);
        trace!(target: "net::txreq", peer, txhash = %txhash, "request in flight");
    }

    pub(super) fn get_requestable(&mut self, peer: PeerId, now: Instant) -> Vec<GenTxid> {
        self.set_time_point(now);
        let mut selected: Vec<(u64, GenTxid)> = self
            .by_peer
            .range((peer, true, TxHash::ZERO)..=(peer, true, TxHash::repeat_byte(0xff)))
            .map(|&(peer, _, txhash)| {
                let ann = self.entries[&(peer, txhash)];
                (ann.sequence, ann.gtxid())
            })
            .collect();
        // Report in announcement order, regardless of request times or clock
        // jumps while the entries accumulated.
        selected.sort_unstable_by_key(|&(sequence, _)| sequence);
        selected.into_iter().map(|(_, gtxid)| gtxid).collect()
    }
}

#[cfg(test)]
impl SchedulerInner {
    /// Verifies every internal invariant. Test-only; cost is linear in the
    /// number of announcements.
    pub(super) fn sanity_check(&self) {
        // Indexes carry exactly one key per announcement.
        assert_eq!(self.by_peer.len(), self.entries.len());
        assert_eq!(self.by_txhash.len(), self.entries.len());
        assert_eq!(self.by_time.len(), self.entries.len());
        for (&(peer, txhash), ann) in &self.entries {
            assert_eq!((ann.peer, ann.txhash), (peer, txhash));
            assert!(self.by_peer.contains(&ann.by_peer_key()));
            assert!(self.by_txhash.contains(&ann.by_txhash_key(&self.computer)));
            assert!(self.by_time.contains(&ann.by_time_key()));
        }

        // Recompute the per-peer counters from scratch.
        let mut peer_info: HashMap<PeerId, PeerInfo> = HashMap::new();
        for ann in self.entries.values() {
            let info = peer_info.entry(ann.peer).or_default();
            info.total += 1;
            info.requested += usize::from(ann.state == State::Requested);
        }
        assert_eq!(peer_info, self.peer_info);

        #[derive(Default)]
        struct Counts {
            delayed: usize,
            ready: usize,
            best: usize,
            requested: usize,
            best_priority: u64,
            min_ready_priority: u64,
            preferred_first: usize,
            nonpreferred_first: usize,
            all_flags: u8,
        }

        let mut table: HashMap<TxHash, Counts> = HashMap::new();
        for ann in self.entries.values() {
            let counts = table.entry(ann.txhash).or_insert_with(|| Counts {
                min_ready_priority: u64::MAX,
                ..Default::default()
            });
            match ann.state {
                State::CandidateDelayed => counts.delayed += 1,
                State::CandidateReady => {
                    counts.ready += 1;
                    counts.min_ready_priority =
                        counts.min_ready_priority.min(ann.priority(&self.computer));
                }
                State::CandidateBest => {
                    counts.best += 1;
                    counts.best_priority = ann.priority(&self.computer);
                }
                State::Requested => counts.requested += 1,
                State::Completed => {}
            }
            counts.preferred_first += usize::from(ann.first && ann.preferred);
            counts.nonpreferred_first += usize::from(ann.first && !ann.preferred);
            counts.all_flags |= ann.per_txhash;
        }

        for (txhash, counts) in table {
            // A txhash with only completed entries must have been dropped.
            assert!(counts.delayed + counts.ready + counts.best + counts.requested > 0);
            // At most one selected entry, and exactly one whenever a ready
            // entry needs something to wait behind.
            assert!(counts.best + counts.requested <= 1);
            if counts.ready > 0 {
                assert_eq!(counts.best + counts.requested, 1);
            }
            if counts.ready > 0 && counts.best > 0 {
                assert!(counts.best_priority <= counts.min_ready_priority);
            }
            // The first marker is single-use per preference class.
            assert!(counts.preferred_first <= 1);
            assert!(counts.nonpreferred_first <= 1);

            // The flags implied by the current entries must be present on the
            // carrier; a completed or deleted requester may have left more.
            let mut expected = 0;
            if counts.preferred_first > 0 || counts.requested > 0 {
                expected |= NO_MORE_PREFERRED_FIRST;
            }
            if counts.nonpreferred_first > 0 || counts.requested > 0 {
                expected |= NO_MORE_NONPREFERRED_FIRST;
            }
            assert_eq!(expected & !counts.all_flags, 0);
            let last = self.last_key_for(txhash).expect("txhash has entries");
            assert_eq!(self.entries[&(last.3, last.0)].per_txhash, counts.all_flags);
        }
    }

    /// Verifies the time-dependent invariant that holds right after
    /// `set_time_point(now)`.
    pub(super) fn time_sanity_check(&self, now: Instant) {
        for ann in self.entries.values() {
            if ann.is_waiting() {
                assert!(ann.time > now);
            } else if ann.is_selectable() {
                assert!(ann.time <= now);
            }
        }
    }
}
