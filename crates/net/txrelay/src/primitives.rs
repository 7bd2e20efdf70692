//! Identifier types shared by the request scheduler and the reconciliation
//! tracker.

use alloy_primitives::B256;

/// Identifies a connected peer.
///
/// The network layer assigns these sequentially per connection; they are never
/// reused while the connection is alive, which is all the scheduler relies on.
pub type PeerId = u64;

/// A transaction hash, without a statement about which kind it is.
pub type TxHash = B256;

/// A transaction hash that commits to witness data.
pub type Wtxid = B256;

/// A transaction identifier tagged with the kind of hash it carries.
///
/// Gossip messages may refer to a transaction either by its txid or by its
/// wtxid. The scheduler treats both as the same 32-byte key but remembers the
/// kind so that requests go back out under the identifier the peer announced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GenTxid {
    /// Hash over the transaction without witness data.
    Txid(TxHash),
    /// Hash over the transaction including witness data.
    Wtxid(TxHash),
}

impl GenTxid {
    /// Rebuilds the tagged identifier from its parts.
    pub const fn from_parts(is_wtxid: bool, hash: TxHash) -> Self {
        if is_wtxid {
            Self::Wtxid(hash)
        } else {
            Self::Txid(hash)
        }
    }

    /// Returns the inner 32-byte hash, dropping the tag.
    pub const fn hash(&self) -> TxHash {
        match self {
            Self::Txid(hash) | Self::Wtxid(hash) => *hash,
        }
    }

    /// Whether this identifier commits to witness data.
    pub const fn is_wtxid(&self) -> bool {
        matches!(self, Self::Wtxid(_))
    }
}
