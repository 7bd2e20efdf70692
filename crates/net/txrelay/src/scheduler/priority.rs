//! Priority assignment for competing announcements of the same transaction.

use crate::primitives::{PeerId, TxHash};
use rand::{rngs::OsRng, RngCore};
use siphasher::sip::SipHasher24;
use std::hash::Hasher;

/// Computes the priority of a (txhash, peer) combination. Lower priorities
/// are selected first.
///
/// The encoding packs the whole selection policy into one unsigned integer:
/// the top bit is set for non-preferred peers, so preferred peers always
/// outrank them; an announcement holding the `first` marker has all remaining
/// bits zero, beating every non-first announcement in its class; everything
/// else gets a salted SipHash-2-4 of (txhash ‖ peer), a fixed pseudo-random
/// permutation per txhash that announcing peers cannot steer.
///
/// The salt is drawn once at construction and never changes, so priorities
/// are stable for the lifetime of the scheduler.
#[derive(Clone, Copy, Debug)]
pub struct PriorityComputer {
    k0: u64,
    k1: u64,
}

impl PriorityComputer {
    /// Creates a computer with a random salt.
    pub fn new() -> Self {
        Self { k0: OsRng.next_u64(), k1: OsRng.next_u64() }
    }

    /// Creates a computer with a zero salt, making priorities reproducible
    /// across runs. Intended for tests and simulations.
    pub const fn deterministic() -> Self {
        Self { k0: 0, k1: 0 }
    }

    /// Returns the priority of an announcement with the given attributes.
    pub fn priority(&self, txhash: &TxHash, peer: PeerId, preferred: bool, first: bool) -> u64 {
        let mut low_bits = 0;
        if !first {
            let mut hasher = SipHasher24::new_with_keys(self.k0, self.k1);
            hasher.write(txhash.as_slice());
            hasher.write(&peer.to_le_bytes());
            low_bits = hasher.finish() >> 1;
        }
        low_bits | (u64::from(!preferred) << 63)
    }
}

impl Default for PriorityComputer {
    fn default() -> Self {
        Self::new()
    }
}
