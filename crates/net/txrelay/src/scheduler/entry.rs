//! Announcement records and the derived keys that order them.

use super::priority::PriorityComputer;
use crate::primitives::{GenTxid, PeerId, TxHash};
use derive_more::Display;
use std::time::Instant;

/// Flag bit: no later preferred announcement of this txhash may claim the
/// `first` marker.
pub(super) const NO_MORE_PREFERRED_FIRST: u8 = 1;
/// Flag bit: no later non-preferred announcement of this txhash may claim the
/// `first` marker.
pub(super) const NO_MORE_NONPREFERRED_FIRST: u8 = 2;

/// The lifecycle state of an announcement.
///
/// CANDIDATE is split into three substates so that selection can be answered
/// by neighbor lookups instead of scans. The declaration order is load
/// bearing: the by-txhash index sorts on it, placing the selected entry
/// (BEST or REQUESTED) immediately before the best READY entry for the same
/// txhash.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord)]
pub(super) enum State {
    /// A candidate whose earliest request time is still in the future.
    #[display("candidate-delayed")]
    CandidateDelayed,
    /// The candidate a request for this txhash would go to right now. Exists
    /// only while no request is outstanding.
    #[display("candidate-best")]
    CandidateBest,
    /// A request to this peer is in flight; the entry's time is its expiry.
    #[display("requested")]
    Requested,
    /// An eligible candidate that is currently outranked.
    #[display("candidate-ready")]
    CandidateReady,
    /// The request failed or was answered; kept only to avoid re-requesting
    /// from the same peer.
    #[display("completed")]
    Completed,
}

/// Key of the per-peer index: `(peer, state == CandidateBest, txhash)`.
///
/// Grouping the best entries at the end of each peer's range lets
/// `get_requestable` stop as soon as the flag flips.
pub(super) type ByPeerKey = (PeerId, bool, TxHash);

/// Key of the per-txhash index:
/// `(txhash, state, priority if READY else 0, peer)`.
///
/// The trailing peer id disambiguates otherwise-equal keys and locates the
/// owning entry; it refines the required order without changing it.
pub(super) type ByTxHashKey = (TxHash, State, u64, PeerId);

/// Key of the time index: `(bucket, time, peer, txhash)` with bucket 0 for
/// waiting entries, 1 for completed, 2 for selectable ones.
pub(super) type ByTimeKey = (u8, Instant, PeerId, TxHash);

/// One statement by one peer that it can provide one transaction.
///
/// `time` is overloaded by state: the earliest permitted request time while a
/// candidate, the expiry while requested.
#[derive(Clone, Copy, Debug)]
pub(super) struct Announcement {
    /// Hash of the announced transaction.
    pub(super) txhash: TxHash,
    /// Request time or expiry, depending on `state`.
    pub(super) time: Instant,
    /// The announcing peer.
    pub(super) peer: PeerId,
    /// Creation-order number, used to report requestable entries in
    /// announcement order.
    pub(super) sequence: u64,
    /// Whether the peer belongs to the trusted class.
    pub(super) preferred: bool,
    /// Whether the announcement used a wtxid.
    pub(super) is_wtxid: bool,
    /// Whether this announcement holds the one-shot tie-break marker for its
    /// preference class.
    pub(super) first: bool,
    /// Current lifecycle state.
    pub(super) state: State,
    /// Per-txhash flag bits. Only the last entry for a txhash in by-txhash
    /// order carries the authoritative union; other entries may hold any
    /// subset.
    pub(super) per_txhash: u8,
}

impl Announcement {
    /// Creates a fresh announcement in the delayed state.
    pub(super) fn new(
        gtxid: GenTxid,
        peer: PeerId,
        preferred: bool,
        reqtime: Instant,
        sequence: u64,
        first: bool,
    ) -> Self {
        Self {
            txhash: gtxid.hash(),
            time: reqtime,
            peer,
            sequence,
            preferred,
            is_wtxid: gtxid.is_wtxid(),
            first,
            state: State::CandidateDelayed,
            per_txhash: 0,
        }
    }

    /// Whether this entry is the chosen one for its txhash. At most one
    /// selected entry exists per txhash.
    pub(super) fn is_selected(&self) -> bool {
        matches!(self.state, State::CandidateBest | State::Requested)
    }

    /// Whether this entry is waiting for a point in time to pass.
    pub(super) fn is_waiting(&self) -> bool {
        matches!(self.state, State::Requested | State::CandidateDelayed)
    }

    /// Whether this entry could be selected if the currently selected one
    /// disappeared.
    pub(super) fn is_selectable(&self) -> bool {
        matches!(self.state, State::CandidateReady | State::CandidateBest)
    }

    pub(super) fn priority(&self, computer: &PriorityComputer) -> u64 {
        computer.priority(&self.txhash, self.peer, self.preferred, self.first)
    }

    pub(super) fn by_peer_key(&self) -> ByPeerKey {
        (self.peer, self.state == State::CandidateBest, self.txhash)
    }

    pub(super) fn by_txhash_key(&self, computer: &PriorityComputer) -> ByTxHashKey {
        let priority =
            if self.state == State::CandidateReady { self.priority(computer) } else { 0 };
        (self.txhash, self.state, priority, self.peer)
    }

    pub(super) fn by_time_key(&self) -> ByTimeKey {
        let bucket = if self.is_waiting() {
            0
        } else if self.is_selectable() {
            2
        } else {
            1
        };
        (bucket, self.time, self.peer, self.txhash)
    }

    /// The tagged identifier this announcement was made under.
    pub(super) fn gtxid(&self) -> GenTxid {
        GenTxid::from_parts(self.is_wtxid, self.txhash)
    }
}
