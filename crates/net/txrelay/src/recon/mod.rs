//! Set reconciliation bookkeeping for transaction relay (BIP-330 / Erlay).
//!
//! Instead of announcing every transaction to every peer, a node puts the
//! wtxids it would relay into a per-peer set and periodically exchanges a
//! *sketch* of that set with the peer; the sketches combine to reveal the
//! symmetric difference in bandwidth proportional to the difference, not the
//! set sizes. [`ReconciliationTracker`] holds the per-peer handshake state,
//! salts, sets and phases, drives the round-robin initiation cadence, and
//! decides which peers still receive a given transaction by direct flooding.
//!
//! Roles are fixed by connection direction: we initiate toward peers we
//! dialed and respond to peers that dialed us. As with the request
//! scheduler, time is pushed in by the caller.

use crate::{
    constants::{
        INBOUND_FANOUT_DESTINATIONS_FRACTION, MAX_SKETCH_CAPACITY,
        OUTBOUND_FANOUT_DESTINATIONS_FRACTION, Q_PRECISION, RECON_FALSE_POSITIVE_COEF,
        RECON_FIELD_SIZE, RECON_Q, RECON_REQUEST_INTERVAL, RECON_RESPONSE_INTERVAL,
        RECON_STATIC_SALT, RECON_VERSION,
    },
    metrics::ReconciliationMetrics,
    primitives::{PeerId, Wtxid},
};
use derive_more::Display;
use parking_lot::Mutex;
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use siphasher::sip::SipHasher24;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    fmt,
    hash::Hasher,
    time::Instant,
};
use tracing::debug;

mod sketch;

use sketch::{compute_capacity, Sketch};

/// Why a [`ReconciliationTracker::register_peer`] call was rejected. The
/// tracker state is unchanged in every case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegisterPeerError {
    /// The peer already completed registration; salt or version updates are
    /// a protocol violation.
    #[error("peer is already registered for reconciliation")]
    AlreadyRegistered,
    /// The peer suggested a protocol version below the minimum we speak.
    #[error("unsupported reconciliation protocol version")]
    UnsupportedVersion,
    /// Registration without a preceding pre-registration; no local salt
    /// exists for the peer.
    #[error("peer was not pre-registered for reconciliation")]
    NotPreRegistered,
    /// The announced roles leave nobody initiating, or do not fit the
    /// connection direction.
    #[error("peer announced unusable reconciliation roles")]
    InvalidRoles,
}

/// Progress of one reconciliation round with a peer, tracked separately for
/// rounds we initiate and rounds they initiate.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
enum Phase {
    /// No round underway.
    #[display("idle")]
    Idle,
    /// The initial request was sent (by us) or received (from them).
    #[display("init-requested")]
    InitRequested,
    /// The initial request was answered with a sketch.
    #[display("init-responded")]
    InitResponded,
}

/// Combines both sides' salt contributions into the short-id SipHash key.
///
/// Symmetric in its arguments: the contributions are ordered ascending before
/// hashing, so both peers derive the same key. The tagged-hash construction
/// prefixes two copies of the hashed tag, per BIP-340 conventions.
fn compute_salt(local_salt: u64, remote_salt: u64) -> (u64, u64) {
    let (low, high) = if local_salt <= remote_salt {
        (local_salt, remote_salt)
    } else {
        (remote_salt, local_salt)
    };
    let tag = Sha256::digest(RECON_STATIC_SALT.as_bytes());
    let mut hasher = Sha256::new();
    hasher.update(&tag);
    hasher.update(&tag);
    hasher.update(low.to_le_bytes());
    hasher.update(high.to_le_bytes());
    let full_salt = hasher.finalize();
    let k0 = u64::from_le_bytes(full_salt[0..8].try_into().expect("sha256 output is 32 bytes"));
    let k1 = u64::from_le_bytes(full_salt[8..16].try_into().expect("sha256 output is 32 bytes"));
    (k0, k1)
}

/// The short id a wtxid reconciles under on one connection.
///
/// Salting per connection keeps short-id collisions local to one link (a
/// collision would otherwise let an attacker halt relay of a chosen
/// transaction network-wide) and prevents linking nodes of the same operator.
fn short_id(k0: u64, k1: u64, wtxid: &Wtxid) -> u32 {
    let mut hasher = SipHasher24::new_with_keys(k0, k1);
    hasher.write(wtxid.as_slice());
    (hasher.finish() as u32).wrapping_add(1)
}

/// Reconciliation state for one registered peer.
#[derive(Clone, Debug)]
struct PeerReconState {
    /// Short-id SipHash key for this connection, derived from both salts.
    k0: u64,
    k1: u64,
    /// Whether we initiate rounds with this peer (we dialed it) or respond
    /// to rounds it initiates (it dialed us).
    we_initiate: bool,
    /// The wtxids to hand the peer in the next round.
    local_set: BTreeSet<Wtxid>,
    /// Short id to wtxid cache, filled while computing a sketch so the
    /// peer's by-short-id requests can be answered afterwards.
    short_id_mapping: BTreeMap<u32, Wtxid>,
    /// Progress of the round we initiated, if any.
    phase_by_us: Phase,
    /// Progress of the round the peer initiated, if any.
    phase_by_them: Phase,
    /// Difference-estimate coefficient last received from the peer.
    remote_q: f64,
    /// Set size last received from the peer.
    remote_set_size: u16,
    /// When we last answered a round this peer initiated.
    last_init_recon_respond: Option<Instant>,
}

impl PeerReconState {
    fn new(k0: u64, k1: u64, we_initiate: bool) -> Self {
        Self {
            k0,
            k1,
            we_initiate,
            local_set: BTreeSet::new(),
            short_id_mapping: BTreeMap::new(),
            phase_by_us: Phase::Idle,
            phase_by_them: Phase::Idle,
            remote_q: RECON_Q,
            remote_set_size: 0,
            last_init_recon_respond: None,
        }
    }

    /// Whether it is not too early to answer a round this peer initiated;
    /// bumps the response timestamp on success. Responses are rate limited
    /// per peer since sketch computation is the expensive side.
    fn consider_init_response(&mut self, now: Instant) -> bool {
        if self.last_init_recon_respond.is_some_and(|last| now < last + RECON_RESPONSE_INTERVAL) {
            return false;
        }
        self.last_init_recon_respond = Some(now);
        true
    }

    /// The sketch capacity needed to reconcile against the peer's announced
    /// set size, from the size difference plus the q-weighted estimate of
    /// differing overlap.
    fn estimate_sketch_capacity(&self, local_set_size: usize) -> u32 {
        let local_set_size = local_set_size.min(u16::MAX as usize) as u16;
        let set_size_diff = local_set_size.abs_diff(self.remote_set_size);
        let min_size = local_set_size.min(self.remote_set_size);
        let weighted_min_size = (self.remote_q * f64::from(min_size)).round() as u32;
        let estimated_diff = 1 + weighted_min_size + u32::from(set_size_diff);
        compute_capacity(RECON_FIELD_SIZE, estimated_diff, RECON_FALSE_POSITIVE_COEF)
    }
}

struct TrackerInner {
    /// Key of the tracker-wide salted hasher picking flood destinations by
    /// wtxid.
    flood_k0: u64,
    flood_k1: u64,
    /// Local salt contributions, created at pre-registration.
    local_salts: HashMap<PeerId, u64>,
    /// Per-peer state, created at registration. Ordered by peer id, which
    /// also fixes the flood-destination indexing.
    states: BTreeMap<PeerId, PeerReconState>,
    /// Peers we initiate with, in round-robin order.
    queue: VecDeque<PeerId>,
    /// Earliest time the next initiation may happen; `None` means
    /// immediately.
    next_recon_request: Option<Instant>,
    metrics: ReconciliationMetrics,
}

impl TrackerInner {
    fn new() -> Self {
        Self {
            flood_k0: OsRng.next_u64(),
            flood_k1: OsRng.next_u64(),
            local_salts: HashMap::new(),
            states: BTreeMap::new(),
            queue: VecDeque::new(),
            next_recon_request: None,
            metrics: ReconciliationMetrics::default(),
        }
    }

    fn pre_register_peer(&mut self, peer_id: PeerId, inbound: bool) -> (bool, bool, u32, u64) {
        // Roles follow the connection direction: the dialing side initiates,
        // the dialed side responds.
        let we_initiate = !inbound;
        let we_respond = inbound;

        let local_salt = OsRng.next_u64();
        let absent = self.local_salts.insert(peer_id, local_salt).is_none();
        // Peer ids are unique per connection, so a second pre-registration
        // is a caller bug.
        assert!(absent, "peer {peer_id} was already pre-registered");

        debug!(target: "net::recon", peer = peer_id, inbound, "pre-registered peer");
        (we_initiate, we_respond, RECON_VERSION, local_salt)
    }

    fn register_peer(
        &mut self,
        peer_id: PeerId,
        inbound: bool,
        they_may_initiate: bool,
        they_may_respond: bool,
        recon_version: u32,
        remote_salt: u64,
    ) -> Result<(), RegisterPeerError> {
        if self.states.contains_key(&peer_id) {
            return Err(RegisterPeerError::AlreadyRegistered);
        }

        // Peers with a newer protocol get downgraded to ours; they are free
        // to refuse the common version by never registering.
        let recon_version = recon_version.min(RECON_VERSION);
        if recon_version < 1 {
            return Err(RegisterPeerError::UnsupportedVersion);
        }

        let Some(&local_salt) = self.local_salts.get(&peer_id) else {
            return Err(RegisterPeerError::NotPreRegistered);
        };

        // Must mirror the role derivation announced at pre-registration.
        let we_may_initiate = !inbound;
        let we_may_respond = inbound;
        let they_initiate = they_may_initiate && we_may_respond;
        let we_initiate = we_may_initiate && they_may_respond;
        // Both derive from the inbound flag, so they cannot both hold.
        debug_assert!(!(they_initiate && we_initiate));
        if !they_initiate && !we_initiate {
            return Err(RegisterPeerError::InvalidRoles);
        }

        if we_initiate {
            self.queue.push_back(peer_id);
        }

        let (k0, k1) = compute_salt(local_salt, remote_salt);
        let absent =
            self.states.insert(peer_id, PeerReconState::new(k0, k1, we_initiate)).is_none();
        debug_assert!(absent);
        self.metrics.registered_peers.set(self.states.len() as f64);

        debug!(
            target: "net::recon",
            peer = peer_id,
            we_initiate,
            they_initiate,
            "registered peer for reconciliation"
        );
        Ok(())
    }

    fn forget_peer(&mut self, peer_id: PeerId) {
        let salt_erased = self.local_salts.remove(&peer_id).is_some();
        let state_erased = self.states.remove(&peer_id).is_some();
        self.queue.retain(|&queued| queued != peer_id);
        if salt_erased || state_erased {
            debug!(target: "net::recon", peer = peer_id, "forgot reconciliation state");
        }
        self.metrics.registered_peers.set(self.states.len() as f64);
    }

    fn add_to_recon_set(&mut self, peer_id: PeerId, wtxids: &[Wtxid]) {
        assert!(!wtxids.is_empty(), "nothing to add to the reconciliation set");
        let state = self.states.get_mut(&peer_id).expect("peer must be registered");
        let mut added = 0usize;
        for wtxid in wtxids {
            added += usize::from(state.local_set.insert(*wtxid));
        }
        debug!(
            target: "net::recon",
            peer = peer_id,
            added,
            set_size = state.local_set.len(),
            "extended reconciliation set"
        );
    }

    fn try_removing_from_recon_set(&mut self, peer_id: PeerId, wtxid: &Wtxid) {
        if let Some(state) = self.states.get_mut(&peer_id) {
            state.local_set.remove(wtxid);
        }
    }

    fn maybe_request_reconciliation(
        &mut self,
        peer_id: PeerId,
        now: Instant,
    ) -> Option<(u16, u16)> {
        if !self.states.contains_key(&peer_id) {
            return None;
        }
        if self.queue.is_empty() {
            return None;
        }
        // One timer paces the whole queue. Initiations go to peers we
        // dialed, which cannot game the shared cadence in a meaningful way.
        let due = self.next_recon_request.map_or(true, |at| at <= now);
        if !due || self.queue.front() != Some(&peer_id) {
            return None;
        }

        self.queue.pop_front();
        self.queue.push_back(peer_id);
        let initiators = self.states.values().filter(|state| state.we_initiate).count() as u32;
        self.next_recon_request = Some(now + RECON_REQUEST_INTERVAL / initiators);

        let state = self.states.get_mut(&peer_id).expect("checked above");
        if state.phase_by_us != Phase::Idle {
            // Still mid-round with this peer; it keeps its queue spot and
            // the timer still advanced.
            return None;
        }
        state.phase_by_us = Phase::InitRequested;
        self.metrics.initiated_rounds.increment(1);

        let local_set_size = state.local_set.len().min(u16::MAX as usize) as u16;
        debug!(
            target: "net::recon",
            peer = peer_id,
            local_set_size,
            "initiating reconciliation"
        );
        // The q coefficient is static for now but transmitted anyway, so a
        // recomputed-per-round q stays backward compatible.
        let q_scaled = (RECON_Q * f64::from(Q_PRECISION)).round() as u16;
        Some((local_set_size, q_scaled))
    }

    fn handle_reconciliation_request(
        &mut self,
        peer_id: PeerId,
        their_set_size: u16,
        their_q_scaled: u16,
    ) {
        let Some(state) = self.states.get_mut(&peer_id) else { return };
        if state.we_initiate || state.phase_by_them != Phase::Idle {
            return;
        }

        state.remote_q = f64::from(their_q_scaled) / f64::from(Q_PRECISION);
        state.remote_set_size = their_set_size;
        state.phase_by_them = Phase::InitRequested;

        debug!(
            target: "net::recon",
            peer = peer_id,
            remote_q = state.remote_q,
            remote_set_size = their_set_size,
            "peer initiated reconciliation"
        );
    }

    fn respond_to_reconciliation_request(
        &mut self,
        peer_id: PeerId,
        now: Instant,
    ) -> Option<Vec<u8>> {
        let state = self.states.get_mut(&peer_id)?;
        if state.we_initiate {
            return None;
        }
        if state.phase_by_them != Phase::InitRequested || !state.consider_init_response(now) {
            return None;
        }

        // An empty sketch tells the peer reconciliation cannot help this
        // round (one of the sets is empty) and to fall back to flooding.
        let mut sketch_bytes = Vec::new();
        let mut capacity = 0;
        if state.remote_set_size > 0 && !state.local_set.is_empty() {
            capacity =
                state.estimate_sketch_capacity(state.local_set.len()).min(MAX_SKETCH_CAPACITY);
            let mut sketch = Sketch::new(capacity);
            for wtxid in &state.local_set {
                let short_id = short_id(state.k0, state.k1, wtxid);
                sketch.add(short_id);
                state.short_id_mapping.insert(short_id, *wtxid);
            }
            sketch_bytes = sketch.serialize();
        }
        state.phase_by_them = Phase::InitResponded;
        self.metrics.sketches_sent.increment(1);

        debug!(
            target: "net::recon",
            peer = peer_id,
            capacity,
            "responding to peer-initiated reconciliation"
        );
        Some(sketch_bytes)
    }

    fn get_relevant_ids_from_short_ids(
        &self,
        peer_id: PeerId,
        diff: &[u32],
    ) -> Option<(Vec<u32>, Vec<Wtxid>)> {
        let state = self.states.get(&peer_id)?;
        let mut local_missing = Vec::new();
        let mut remote_missing = Vec::new();
        for &short_id in diff {
            match state.short_id_mapping.get(&short_id) {
                // We hold the transaction; the peer is the one missing it.
                Some(wtxid) => remote_missing.push(*wtxid),
                // Only the short id is known; the full wtxid has to be asked
                // for.
                None => local_missing.push(short_id),
            }
        }
        Some((local_missing, remote_missing))
    }

    fn should_flood_to(&self, wtxid: &Wtxid, peer_id: PeerId) -> bool {
        let Some(state) = self.states.get(&peer_id) else { return false };

        // Flood destinations are picked per class: among the peers we
        // initiate to, and separately among the peers that initiate to us.
        let fraction = if state.we_initiate {
            OUTBOUND_FANOUT_DESTINATIONS_FRACTION
        } else {
            INBOUND_FANOUT_DESTINATIONS_FRACTION
        };
        let modulo = (1.0 / fraction).round() as u64;

        // Indexing the class by ascending peer id keeps the choice stable
        // across runs and independent of registration history.
        let index = self
            .states
            .iter()
            .filter(|(_, other)| other.we_initiate == state.we_initiate)
            .position(|(&other_id, _)| other_id == peer_id)
            .expect("peer is in its own class") as u64;

        let mut hasher = SipHasher24::new_with_keys(self.flood_k0, self.flood_k1);
        hasher.write(wtxid.as_slice());
        hasher.finish() % modulo == index % modulo
    }
}

/// Tracks all reconciliation-related state across peers.
///
/// The round structure with a registered peer is: the initiating side
/// announces its set size and difference coefficient
/// ([`maybe_request_reconciliation`](Self::maybe_request_reconciliation) /
/// [`handle_reconciliation_request`](Self::handle_reconciliation_request)),
/// the responding side answers with a sketch of its set
/// ([`respond_to_reconciliation_request`](Self::respond_to_reconciliation_request)),
/// and the initiator combines the sketches to learn the set difference.
/// Transactions selected by [`should_flood_to`](Self::should_flood_to) skip
/// the set and are announced directly.
///
/// All methods take `&self`; an internal mutex serializes them.
pub struct ReconciliationTracker {
    inner: Mutex<TrackerInner>,
}

impl ReconciliationTracker {
    /// Creates an empty tracker with a fresh flood-selection salt.
    pub fn new() -> Self {
        Self { inner: Mutex::new(TrackerInner::new()) }
    }

    /// Generates the local half of the reconciliation handshake for a new
    /// peer: whether we would initiate, whether we would respond, the
    /// protocol version, and a fresh local salt. Must be called exactly once
    /// per peer, before [`register_peer`](Self::register_peer).
    ///
    /// # Panics
    ///
    /// Panics if the peer was already pre-registered.
    pub fn pre_register_peer(&self, peer_id: PeerId, inbound: bool) -> (bool, bool, u32, u64) {
        self.inner.lock().pre_register_peer(peer_id, inbound)
    }

    /// Completes the handshake with the roles, version and salt the peer
    /// announced. On any error nothing is recorded and the peer cannot
    /// reconcile.
    pub fn register_peer(
        &self,
        peer_id: PeerId,
        inbound: bool,
        they_may_initiate: bool,
        they_may_respond: bool,
        recon_version: u32,
        remote_salt: u64,
    ) -> Result<(), RegisterPeerError> {
        self.inner.lock().register_peer(
            peer_id,
            inbound,
            they_may_initiate,
            they_may_respond,
            recon_version,
            remote_salt,
        )
    }

    /// Drops all reconciliation state for the peer: salt, sets, phases and
    /// any queue position.
    pub fn forget_peer(&self, peer_id: PeerId) {
        self.inner.lock().forget_peer(peer_id)
    }

    /// Whether the peer completed registration.
    pub fn is_peer_registered(&self, peer_id: PeerId) -> bool {
        self.inner.lock().states.contains_key(&peer_id)
    }

    /// Queues wtxids to be reconciled with the peer in the next round.
    ///
    /// # Panics
    ///
    /// Panics if `wtxids` is empty or the peer is not registered.
    pub fn add_to_recon_set(&self, peer_id: PeerId, wtxids: &[Wtxid]) {
        self.inner.lock().add_to_recon_set(peer_id, wtxids)
    }

    /// Removes a wtxid from the peer's pending set, e.g. because it was
    /// announced through another channel. No effect if absent.
    pub fn try_removing_from_recon_set(&self, peer_id: PeerId, wtxid: &Wtxid) {
        self.inner.lock().try_removing_from_recon_set(peer_id, wtxid)
    }

    /// Asks for permission to initiate a reconciliation round with the peer.
    /// Returns the set size and scaled q coefficient to announce if the peer
    /// is at the front of the round-robin queue, the global cadence timer
    /// has expired and no round with it is underway; `None` otherwise.
    pub fn maybe_request_reconciliation(
        &self,
        peer_id: PeerId,
        now: Instant,
    ) -> Option<(u16, u16)> {
        self.inner.lock().maybe_request_reconciliation(peer_id, now)
    }

    /// Records a round initiated by the peer: its set size and scaled q
    /// coefficient. Ignored unless the peer is registered, we are the
    /// responding side, and no peer-initiated round is underway.
    pub fn handle_reconciliation_request(
        &self,
        peer_id: PeerId,
        their_set_size: u16,
        their_q_scaled: u16,
    ) {
        self.inner.lock().handle_reconciliation_request(peer_id, their_set_size, their_q_scaled)
    }

    /// Produces the sketch answering a round the peer initiated. Returns
    /// `None` when no answer should be sent (not registered, wrong role or
    /// phase, or responses to this peer are throttled); returns empty bytes
    /// when either side's set is empty and the peer should flood instead.
    pub fn respond_to_reconciliation_request(
        &self,
        peer_id: PeerId,
        now: Instant,
    ) -> Option<Vec<u8>> {
        self.inner.lock().respond_to_reconciliation_request(peer_id, now)
    }

    /// Splits a decoded sketch difference into short ids we cannot resolve
    /// (the peer has those transactions) and wtxids the peer is missing.
    /// `None` if the peer is not registered.
    pub fn get_relevant_ids_from_short_ids(
        &self,
        peer_id: PeerId,
        diff: &[u32],
    ) -> Option<(Vec<u32>, Vec<Wtxid>)> {
        self.inner.lock().get_relevant_ids_from_short_ids(peer_id, diff)
    }

    /// Number of wtxids queued for reconciliation with the peer, if
    /// registered.
    pub fn get_peer_set_size(&self, peer_id: PeerId) -> Option<usize> {
        self.inner.lock().states.get(&peer_id).map(|state| state.local_set.len())
    }

    /// Whether `wtxid` is queued for reconciliation with the peer.
    pub fn currently_reconciling_tx(&self, peer_id: PeerId, wtxid: &Wtxid) -> bool {
        self.inner
            .lock()
            .states
            .get(&peer_id)
            .is_some_and(|state| state.local_set.contains(wtxid))
    }

    /// Whether `wtxid` should be announced to this peer directly instead of
    /// through reconciliation. Deterministically selects roughly a tenth of
    /// the peers in each direction, keyed by the wtxid.
    pub fn should_flood_to(&self, wtxid: &Wtxid, peer_id: PeerId) -> bool {
        self.inner.lock().should_flood_to(wtxid, peer_id)
    }
}

impl Default for ReconciliationTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ReconciliationTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ReconciliationTracker")
            .field("registered_peers", &inner.states.len())
            .field("queued_initiations", &inner.queue.len())
            .finish()
    }
}
