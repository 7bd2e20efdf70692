//! Sketches: compact set encodings over 32-bit short ids.
//!
//! A sketch with capacity `c` is the sequence of odd power sums
//! `s_i = Σ m^(2i+1)` for `i < c` over GF(2^32), one per element `m` added.
//! Two peers can combine sketches of their sets to recover the symmetric
//! difference as long as it has at most `c` elements (BIP-330 / PinSketch).
//! Only the producing side is needed here: accumulate and serialize.

use crate::constants::MAX_SKETCH_CAPACITY;

/// The GF(2^32) reduction polynomial, x^32 + x^7 + x^3 + x^2 + 1, with the
/// leading term implicit.
const GF32_MODULUS: u64 = 0x8d;

/// Carry-less multiplication in GF(2^32).
fn gf32_mul(a: u32, b: u32) -> u32 {
    let mut product: u64 = 0;
    for bit in 0..32 {
        if (b >> bit) & 1 == 1 {
            product ^= (a as u64) << bit;
        }
    }
    for bit in (32..64).rev() {
        if (product >> bit) & 1 == 1 {
            product ^= (1u64 << bit) ^ (GF32_MODULUS << (bit - 32));
        }
    }
    product as u32
}

/// Returns the capacity a sketch needs to reconcile at most `max_elements`
/// differences over a `field_size`-bit field, with a false positive decode
/// probability of 1 in 2^`fp_coef`.
///
/// Each syndrome beyond the difference count contributes `field_size` bits of
/// verification, so the excess is `fp_coef / field_size`, rounded up.
pub(super) fn compute_capacity(field_size: u32, max_elements: u32, fp_coef: u32) -> u32 {
    max_elements + fp_coef.div_ceil(field_size)
}

/// An append-only sketch over 32-bit elements.
#[derive(Clone, Debug)]
pub(super) struct Sketch {
    syndromes: Vec<u32>,
}

impl Sketch {
    /// Creates an empty sketch of the given capacity, clamped to
    /// [`MAX_SKETCH_CAPACITY`].
    pub(super) fn new(capacity: u32) -> Self {
        let capacity = capacity.min(MAX_SKETCH_CAPACITY);
        Self { syndromes: vec![0; capacity as usize] }
    }

    /// Adds an element. Adding the same element twice removes it, as the
    /// field has characteristic 2.
    pub(super) fn add(&mut self, element: u32) {
        // Walk m^1, m^3, m^5, ... by repeated multiplication with m^2.
        let square = gf32_mul(element, element);
        let mut odd_power = element;
        for syndrome in &mut self.syndromes {
            *syndrome ^= odd_power;
            odd_power = gf32_mul(odd_power, square);
        }
    }

    /// Serializes the syndromes as little-endian 32-bit words. An empty
    /// sketch (capacity zero) serializes to no bytes.
    pub(super) fn serialize(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.syndromes.len() * 4);
        for syndrome in &self.syndromes {
            bytes.extend_from_slice(&syndrome.to_le_bytes());
        }
        bytes
    }
}
