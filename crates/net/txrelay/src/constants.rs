//! Protocol constants for transaction request scheduling and set
//! reconciliation.
//!
//! The reconciliation values are fixed by BIP-330; changing any of them breaks
//! interoperability with reconciling peers.

use std::time::Duration;

/* ================== RECONCILIATION ================== */

/// Reconciliation protocol version spoken by this node. Peers advertising a
/// higher version are downgraded to this one; anything below is a protocol
/// violation.
pub const RECON_VERSION: u32 = 1;

/// Static component of the tagged hash that combines both sides' salts into
/// the short-id key, see BIP-330.
pub const RECON_STATIC_SALT: &str = "Tx Relay Salting";

/// Field size of the sketches exchanged during reconciliation: short ids are
/// 32-bit values.
pub const RECON_FIELD_SIZE: u32 = 32;

/// Sketch decoding can "succeed" on garbage input and produce nonsense
/// (a false positive). With this coefficient the false positive probability
/// is 1 in 2^16.
pub const RECON_FALSE_POSITIVE_COEF: u32 = 16;

/// Upper bound on the capacity of a sketch we are willing to produce.
/// Bounds the work and bandwidth a peer can demand with an inflated set-size
/// claim.
pub const MAX_SKETCH_CAPACITY: u32 = 2 << 12;

/// Coefficient used to estimate the set difference from the two set sizes.
///
/// A static value works well enough in practice; it is still transmitted with
/// every initiation so the estimate can be made dynamic without a protocol
/// change.
pub const RECON_Q: f64 = 0.25;

/// Fixed-point scale for transmitting [`RECON_Q`] as an integer, specified by
/// BIP-330.
pub const Q_PRECISION: u16 = (2 << 14) - 1;

/// Interval between reconciliations we initiate, across all peers.
///
/// More frequent rounds waste a constant metadata overhead (sketch sizes
/// etc.); less frequent rounds add relay latency. 8s supports roughly
/// 7 tx/s of steady-state relay.
pub const RECON_REQUEST_INTERVAL: Duration = Duration::from_secs(8);

/// Minimum interval between sketch responses to the same peer. Initiations
/// are cheap for the requester and sketch computation is not, so responses
/// are throttled.
pub const RECON_RESPONSE_INTERVAL: Duration = Duration::from_secs(1);

/// Fraction of inbound reconciling peers that receive a given transaction by
/// direct announcement instead of through reconciliation.
pub const INBOUND_FANOUT_DESTINATIONS_FRACTION: f64 = 0.1;

/// Fraction of outbound reconciling peers that receive a given transaction by
/// direct announcement instead of through reconciliation.
pub const OUTBOUND_FANOUT_DESTINATIONS_FRACTION: f64 = 0.1;
