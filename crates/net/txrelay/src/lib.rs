#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! Scheduling and bookkeeping for gossip-based transaction relay.
//!
//! Two sibling components, both synchronous, both driven entirely by the
//! caller (events in, time pushed in, decisions out):
//!
//! - [`TxRequestScheduler`] tracks which peers announced which transactions
//!   and answers which transaction to request from which peer, when, and in
//!   what order. At most one request per transaction is in flight; failures
//!   fall over to alternative announcers; selection favors trusted peers and
//!   resists adversarial ones; memory stays bounded by the set of active
//!   announcements.
//! - [`ReconciliationTracker`] keeps the per-peer state for set
//!   reconciliation (BIP-330): handshake and salts, the pending wtxid set per
//!   peer, the round-robin initiation queue, sketch responses, and the choice
//!   of which peers receive a transaction by direct flooding instead.
//!
//! The surrounding node wires both into its message handling: on receiving an
//! announcement it decides whether to reconcile or to request, handing the
//! request side to the scheduler and the reconcile side to the tracker.
//! Wire encoding, connection management, and transaction validation live
//! elsewhere.

pub mod constants;
mod metrics;
mod primitives;
pub mod recon;
pub mod scheduler;

pub use primitives::{GenTxid, PeerId, TxHash, Wtxid};
pub use recon::{ReconciliationTracker, RegisterPeerError};
pub use scheduler::{PriorityComputer, TxRequestScheduler};
